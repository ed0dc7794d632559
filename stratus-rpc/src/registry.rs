//! Method registration and invocation.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::BoxFuture;
use stratus_codec::{Params, TypeDescriptor, WireType, check_arity};
use stratus_core::{CodecError, ErrorEnvelope, FailureKind, StratusError, WireValue};

/// Default ceiling for asynchronous methods.
pub const DEFAULT_ASYNC_CEILING: Duration = Duration::from_secs(300);

/// Future produced by invoking a method.
pub type InvokeFuture = BoxFuture<'static, Result<WireValue, ErrorEnvelope>>;

type Invoker = Arc<dyn Fn(Vec<WireValue>) -> InvokeFuture + Send + Sync>;

/// Scheduling class of a method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Priority {
    /// Shares the server's concurrency budget.
    #[default]
    Normal,
    /// Runs immediately, outside the concurrency budget.
    High,
}

/// Declared parameter and result types of a method.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodSignature {
    pub params: Vec<TypeDescriptor>,
    pub result: TypeDescriptor,
}

impl MethodSignature {
    /// Signature of a method taking `A` and returning `R`.
    #[must_use]
    pub fn of<A: Params, R: WireType>() -> Self {
        Self {
            params: A::descriptors(),
            result: R::descriptor(),
        }
    }

    #[must_use]
    pub fn arity(&self) -> usize {
        self.params.len()
    }
}

impl fmt::Display for MethodSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (i, param) in self.params.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{param}")?;
        }
        write!(f, ") -> {}", self.result)
    }
}

/// A registered method: name, signature, priority, and its invoker.
pub struct MethodRegistration {
    name: String,
    signature: MethodSignature,
    priority: Priority,
    invoker: Invoker,
}

impl MethodRegistration {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn signature(&self) -> &MethodSignature {
        &self.signature
    }

    #[must_use]
    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Invoke with positional arguments.
    ///
    /// The argument count is checked before anything is decoded or called.
    pub fn invoke(&self, args: Vec<WireValue>) -> InvokeFuture {
        if let Err(e) = check_arity(self.signature.arity(), args.len()) {
            return Box::pin(std::future::ready(Err(marshalling(&e))));
        }
        (self.invoker)(args)
    }
}

impl fmt::Debug for MethodRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodRegistration")
            .field("name", &self.name)
            .field("signature", &self.signature.to_string())
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

/// Name-keyed table of callable methods.
///
/// Parameter and result types come from the callable's signature, so a
/// method whose types have no wire form does not compile. Registering a
/// name twice replaces the earlier method.
///
/// ## Example
///
/// ```rust
/// use std::convert::Infallible;
/// use stratus_core::WireValue;
/// use stratus_rpc::{MethodRegistry, Priority};
///
/// # tokio::runtime::Runtime::new().unwrap().block_on(async {
/// let registry = MethodRegistry::new();
/// registry
///     .register("add", Priority::Normal, |(a, b): (i32, i32)| Ok::<_, Infallible>(a + b))
///     .unwrap();
///
/// let result = registry
///     .invoke("add", vec![WireValue::Int(3), WireValue::Int(42)])
///     .await
///     .unwrap();
/// assert_eq!(result, WireValue::Int(45));
/// # });
/// ```
#[derive(Default)]
pub struct MethodRegistry {
    methods: DashMap<String, Arc<MethodRegistration>>,
}

impl MethodRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a synchronous free function.
    pub fn register<A, R, E, F>(
        &self,
        name: impl Into<String>,
        priority: Priority,
        f: F,
    ) -> Result<(), StratusError>
    where
        A: Params,
        R: WireType,
        E: std::error::Error + Send + 'static,
        F: Fn(A) -> Result<R, E> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let invoker: Invoker = Arc::new(move |args: Vec<WireValue>| -> InvokeFuture {
            let f = Arc::clone(&f);
            Box::pin(async move {
                let params = A::from_wire(args).map_err(|e| marshalling(&e))?;
                let value = f(params).map_err(|e| application(&e))?;
                value.into_wire().map_err(|e| marshalling(&e))
            })
        });
        self.insert(name.into(), MethodSignature::of::<A, R>(), priority, invoker)
    }

    /// Register a synchronous method bound to an instance.
    ///
    /// The instance is required; passing `None` is a registration error.
    pub fn register_bound<S, A, R, E, F>(
        &self,
        name: impl Into<String>,
        priority: Priority,
        instance: Option<Arc<S>>,
        f: F,
    ) -> Result<(), StratusError>
    where
        S: Send + Sync + 'static,
        A: Params,
        R: WireType,
        E: std::error::Error + Send + 'static,
        F: Fn(&S, A) -> Result<R, E> + Send + Sync + 'static,
    {
        let name = name.into();
        let Some(instance) = instance else {
            return Err(StratusError::Registration(format!(
                "method {name} requires a bound instance"
            )));
        };
        self.register(name, priority, move |params: A| f(&instance, params))
    }

    /// Register an asynchronous function.
    ///
    /// An invocation still running after `ceiling` is dropped and reported
    /// as a server failure.
    pub fn register_async<A, R, E, F, Fut>(
        &self,
        name: impl Into<String>,
        priority: Priority,
        ceiling: Duration,
        f: F,
    ) -> Result<(), StratusError>
    where
        A: Params,
        R: WireType,
        E: std::error::Error + Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
    {
        let name = name.into();
        let method = name.clone();
        let f = Arc::new(f);
        let invoker: Invoker = Arc::new(move |args: Vec<WireValue>| -> InvokeFuture {
            let f = Arc::clone(&f);
            let method = method.clone();
            Box::pin(async move {
                let params = A::from_wire(args).map_err(|e| marshalling(&e))?;
                match tokio::time::timeout(ceiling, f(params)).await {
                    Ok(Ok(value)) => value.into_wire().map_err(|e| marshalling(&e)),
                    Ok(Err(e)) => Err(application(&e)),
                    Err(_) => {
                        tracing::warn!(method = %method, ?ceiling, "Invocation exceeded ceiling");
                        Err(ErrorEnvelope::new(
                            FailureKind::Server,
                            "Timeout",
                            format!("{method} did not complete within {ceiling:?}"),
                        ))
                    }
                }
            })
        });
        self.insert(name, MethodSignature::of::<A, R>(), priority, invoker)
    }

    fn insert(
        &self,
        name: String,
        signature: MethodSignature,
        priority: Priority,
        invoker: Invoker,
    ) -> Result<(), StratusError> {
        if name.is_empty() {
            return Err(StratusError::Registration("method name is empty".into()));
        }
        tracing::debug!(method = %name, signature = %signature, "Registering method");
        let registration = Arc::new(MethodRegistration {
            name: name.clone(),
            signature,
            priority,
            invoker,
        });
        if self.methods.insert(name.clone(), registration).is_some() {
            tracing::debug!(method = %name, "Replaced existing method");
        }
        Ok(())
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<MethodRegistration>> {
        self.methods.get(name).map(|entry| Arc::clone(entry.value()))
    }

    /// Invoke a method by name.
    pub async fn invoke(&self, name: &str, args: Vec<WireValue>) -> Result<WireValue, ErrorEnvelope> {
        match self.get(name) {
            Some(method) => method.invoke(args).await,
            None => Err(method_not_found(name)),
        }
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    /// Registered names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.methods.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    #[must_use]
    pub fn signature(&self, name: &str) -> Option<MethodSignature> {
        self.methods.get(name).map(|e| e.signature.clone())
    }

    pub fn remove(&self, name: &str) -> bool {
        self.methods.remove(name).is_some()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.methods.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

impl fmt::Debug for MethodRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodRegistry")
            .field("methods", &self.names())
            .finish()
    }
}

pub(crate) fn method_not_found(name: &str) -> ErrorEnvelope {
    ErrorEnvelope::new(
        FailureKind::MethodNotFound,
        "MethodNotFound",
        StratusError::MethodNotFound(name.to_string()).to_string(),
    )
}

fn marshalling(err: &CodecError) -> ErrorEnvelope {
    ErrorEnvelope::from_error(FailureKind::Marshalling, "CodecError", err)
}

fn application<E: std::error::Error + 'static>(err: &E) -> ErrorEnvelope {
    ErrorEnvelope::from_error(FailureKind::Application, std::any::type_name::<E>(), err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, thiserror::Error)]
    #[error("division by zero")]
    struct DivideByZero;

    #[derive(Debug, thiserror::Error)]
    #[error("cannot evaluate {expression}")]
    struct EvalError {
        expression: String,
        #[source]
        source: DivideByZero,
    }

    struct Counter {
        base: i64,
    }

    #[tokio::test]
    async fn test_invoke() {
        let registry = MethodRegistry::new();
        registry
            .register("add", Priority::Normal, |(a, b): (i32, i32)| {
                Ok::<_, Infallible>(a + b)
            })
            .unwrap();

        let result = registry
            .invoke("add", vec![WireValue::Int(3), WireValue::Int(42)])
            .await
            .unwrap();
        assert_eq!(result, WireValue::Int(45));
    }

    #[tokio::test]
    async fn test_arity_is_checked_before_calling() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&calls);
        let registry = MethodRegistry::new();
        registry
            .register("add", Priority::Normal, move |(a, b): (i32, i32)| {
                counted.fetch_add(1, Ordering::SeqCst);
                Ok::<_, Infallible>(a + b)
            })
            .unwrap();

        let err = registry
            .invoke("add", vec![WireValue::Int(3)])
            .await
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::Marshalling);
        assert_eq!(err.message(), "expected 2 but got 1 arguments");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_wrong_argument_type() {
        let registry = MethodRegistry::new();
        registry
            .register("negate", Priority::Normal, |(a,): (i64,)| {
                Ok::<_, Infallible>(-a)
            })
            .unwrap();

        let err = registry
            .invoke("negate", vec![WireValue::Int(1)])
            .await
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::Marshalling);
    }

    #[tokio::test]
    async fn test_application_error_chain() {
        let registry = MethodRegistry::new();
        registry
            .register("divide", Priority::Normal, |(a, b): (i32, i32)| {
                if b == 0 {
                    Err(EvalError {
                        expression: format!("{a} / {b}"),
                        source: DivideByZero,
                    })
                } else {
                    Ok(a / b)
                }
            })
            .unwrap();

        let err = registry
            .invoke("divide", vec![WireValue::Int(1), WireValue::Int(0)])
            .await
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::Application);
        assert!(err.frames[0].type_name.ends_with("EvalError"));
        let messages: Vec<&str> = err.frames.iter().map(|f| f.message.as_str()).collect();
        assert_eq!(messages, ["cannot evaluate 1 / 0", "division by zero"]);
    }

    #[tokio::test]
    async fn test_bound_instance() {
        let registry = MethodRegistry::new();
        let counter = Arc::new(Counter { base: 100 });
        registry
            .register_bound(
                "offset",
                Priority::High,
                Some(counter),
                |c: &Counter, (n,): (i64,)| Ok::<_, Infallible>(c.base + n),
            )
            .unwrap();

        let result = registry
            .invoke("offset", vec![WireValue::Long(5)])
            .await
            .unwrap();
        assert_eq!(result, WireValue::Long(105));
        assert_eq!(registry.get("offset").unwrap().priority(), Priority::High);

        let err = registry
            .register_bound("missing", Priority::Normal, None::<Arc<Counter>>, |c: &Counter, (): ()| {
                Ok::<_, Infallible>(c.base)
            })
            .unwrap_err();
        assert!(matches!(err, StratusError::Registration(_)));
        assert!(!registry.contains("missing"));
    }

    #[tokio::test]
    async fn test_async_ceiling() {
        let registry = MethodRegistry::new();
        registry
            .register_async("slow", Priority::Normal, Duration::from_millis(20), |(): ()| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok::<_, Infallible>(())
            })
            .unwrap();
        registry
            .register_async("fast", Priority::Normal, DEFAULT_ASYNC_CEILING, |(s,): (String,)| async move {
                Ok::<_, Infallible>(s.len() as i32)
            })
            .unwrap();

        let err = registry.invoke("slow", vec![]).await.unwrap_err();
        assert_eq!(err.kind, FailureKind::Server);

        let result = registry
            .invoke("fast", vec![WireValue::String("abc".into())])
            .await
            .unwrap();
        assert_eq!(result, WireValue::Int(3));
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let registry = MethodRegistry::new();
        let err = registry.invoke("doesNotExist", vec![]).await.unwrap_err();
        assert_eq!(err.kind, FailureKind::MethodNotFound);
        assert_eq!(err.message(), "method not available: doesNotExist");
    }

    #[test]
    fn test_introspection_and_overwrite() {
        let registry = MethodRegistry::new();
        registry
            .register("echo", Priority::Normal, |(s,): (String,)| Ok::<_, Infallible>(s))
            .unwrap();
        registry
            .register("add", Priority::Normal, |(a, b): (i32, i32)| {
                Ok::<_, Infallible>(a + b)
            })
            .unwrap();
        assert_eq!(registry.names(), ["add", "echo"]);
        assert_eq!(
            registry.signature("add").unwrap().to_string(),
            "(int, int) -> int"
        );

        registry
            .register("add", Priority::Normal, |(a, b): (i64, i64)| {
                Ok::<_, Infallible>(a + b)
            })
            .unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(
            registry.signature("add").unwrap().to_string(),
            "(long, long) -> long"
        );

        assert!(registry.register("", Priority::Normal, |(): ()| Ok::<_, Infallible>(())).is_err());
    }
}
