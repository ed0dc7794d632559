//! RPC client.

use std::future::IntoFuture;
use std::marker::PhantomData;
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::future::BoxFuture;
use stratus_codec::{EnvelopeCodec, Params, WireType};
use stratus_core::{
    CONTEXT_ID_PROPERTY, CallStatus, CodecError, Context, FailureKind, InboundMessage, Metadata,
    Request, Response, Scope, StratusError, Uuid, WireValue,
};
use stratus_transport::{ListenerId, PendingCalls, ResultReceiver, SharedConnection};
use tokio::sync::watch;

use crate::registry::MethodSignature;

/// Configuration for RPC clients.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// How long a call waits for its response subscription to be confirmed.
    pub activation_timeout: Duration,

    /// Timeout applied by [`RpcClient::call`]. `None` waits indefinitely.
    pub default_timeout: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            activation_timeout: Duration::from_secs(3),
            default_timeout: None,
        }
    }
}

impl ClientConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn activation_timeout(mut self, timeout: Duration) -> Self {
        self.activation_timeout = timeout;
        self
    }

    #[must_use]
    pub fn default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }
}

/// Calls methods served on a scope.
///
/// Each call subscribes to its own response topic and publishes the request
/// only after the broker has confirmed that subscription, so no response
/// can be missed. If the subscription fails, the call fails and nothing is
/// published.
///
/// ## Example
///
/// ```rust,no_run
/// use stratus_rpc::{ClientConfig, RpcClient};
/// # async fn run(connection: stratus_transport::SharedConnection) -> Result<(), stratus_core::StratusError> {
/// let client = RpcClient::new(connection, stratus_core::Scope::parse("/calc/")?, ClientConfig::new());
/// let sum: i32 = client.call("add", (3, 42)).await?;
/// assert_eq!(sum, 45);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    connection: SharedConnection,
    scope: Scope,
    request_topic: String,
    config: ClientConfig,
    codec: EnvelopeCodec,
    pending: Arc<PendingCalls>,
    signatures: DashMap<String, MethodSignature>,
}

impl RpcClient {
    #[must_use]
    pub fn new(connection: SharedConnection, scope: Scope, config: ClientConfig) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                connection,
                request_topic: scope.rpc_topic(),
                scope,
                config,
                codec: EnvelopeCodec::new(),
                pending: Arc::new(PendingCalls::new()),
                signatures: DashMap::new(),
            }),
        }
    }

    #[must_use]
    pub fn request_topic(&self) -> &str {
        &self.inner.request_topic
    }

    /// Number of calls awaiting a FINISHED response.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.pending.pending_count()
    }

    /// Start a call and return its handle once the request is published.
    pub async fn call_method<A, R>(&self, method: &str, args: A) -> Result<PendingCall<R>, StratusError>
    where
        A: Params,
        R: WireType,
    {
        self.start(Uuid::new_v4(), method, args, Metadata::new())
            .await
    }

    /// Call a method and wait for its result, honoring the configured
    /// default timeout.
    pub async fn call<A, R>(&self, method: &str, args: A) -> Result<R, StratusError>
    where
        A: Params,
        R: WireType,
    {
        let call = self.call_method(method, args).await?;
        match self.inner.config.default_timeout {
            Some(timeout) => call.wait_timeout(timeout).await,
            None => call.wait().await,
        }
    }

    /// Call a method under a [`Context`].
    ///
    /// The request carries the context's metadata and its correlation id
    /// under [`CONTEXT_ID_PROPERTY`]; the call itself gets a fresh id, so
    /// one context may be shared by concurrent calls. The deadline bounds
    /// the whole call.
    pub async fn call_with<A, R>(&self, ctx: &Context, method: &str, args: A) -> Result<R, StratusError>
    where
        A: Params,
        R: WireType,
    {
        if ctx.is_expired() {
            return Err(StratusError::Timeout(Duration::ZERO));
        }
        let mut properties = ctx.metadata.clone();
        properties.insert(CONTEXT_ID_PROPERTY.to_string(), ctx.correlation_id.to_string());
        let call = self.start(Uuid::new_v4(), method, args, properties).await?;

        let timeout = match ctx.deadline {
            Some(_) => Some(ctx.remaining().unwrap_or(Duration::ZERO)),
            None => self.inner.config.default_timeout,
        };
        match timeout {
            Some(timeout) => call.wait_timeout(timeout).await,
            None => call.wait().await,
        }
    }

    async fn start<A, R>(
        &self,
        id: Uuid,
        method: &str,
        args: A,
        properties: Metadata,
    ) -> Result<PendingCall<R>, StratusError>
    where
        A: Params,
        R: WireType,
    {
        let inner = &self.inner;
        let signature = MethodSignature::of::<A, R>();
        inner.check_signature(method, &signature)?;
        let request = Request::new(id, method, args.into_wire()?);
        let payload = inner.codec.encode_request(&request)?;

        let reply_topic = inner.scope.response_topic(&id);
        let (result, status) = inner.pending.register(id)?;

        let pending = Arc::downgrade(&inner.pending);
        let codec = inner.codec.clone();
        let subscribed = inner
            .connection
            .subscribe(
                &reply_topic,
                Arc::new(move |message: &InboundMessage| on_response(&pending, &codec, message)),
                inner.config.activation_timeout,
            )
            .await;
        let listener = match subscribed {
            Ok(listener) => listener,
            Err(e) => {
                inner.pending.remove(&id);
                tracing::debug!(%id, method, error = %e, "Response subscription failed");
                return Err(e.into());
            }
        };

        let mut guard = CallGuard {
            connection: inner.connection.clone(),
            pending: Arc::clone(&inner.pending),
            id,
            topic: reply_topic,
            listener: Some(listener),
        };

        if let Err(e) = inner
            .connection
            .publish(&inner.request_topic, payload, properties)
            .await
        {
            guard.release().await;
            return Err(e.into());
        }
        tracing::trace!(%id, method, "Request published");
        inner.remember_signature(method, signature);

        Ok(PendingCall {
            id,
            method: method.to_string(),
            result,
            status,
            guard,
            _marker: PhantomData,
        })
    }
}

impl ClientInner {
    fn check_signature(&self, method: &str, signature: &MethodSignature) -> Result<(), CodecError> {
        match self.signatures.get(method) {
            Some(cached) if *cached != *signature => Err(CodecError::TypeMismatch {
                expected: cached.to_string(),
                found: signature.to_string(),
            }),
            _ => Ok(()),
        }
    }

    /// Pin a method's signature once a request using it has been published.
    fn remember_signature(&self, method: &str, signature: MethodSignature) {
        if let Entry::Vacant(slot) = self.signatures.entry(method.to_string()) {
            slot.insert(signature);
        }
    }
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("topic", &self.inner.request_topic)
            .field("pending", &self.inner.pending.pending_count())
            .finish_non_exhaustive()
    }
}

fn on_response(pending: &Weak<PendingCalls>, codec: &EnvelopeCodec, message: &InboundMessage) {
    let Some(pending) = pending.upgrade() else {
        return;
    };
    match codec.decode_response(&message.payload) {
        Ok(response) => {
            pending.dispatch(response);
        }
        Err(e) => tracing::warn!(topic = %message.topic, error = %e, "Dropping undecodable response"),
    }
}

/// Releases a call's response subscription exactly once.
struct CallGuard {
    connection: SharedConnection,
    pending: Arc<PendingCalls>,
    id: Uuid,
    topic: String,
    listener: Option<ListenerId>,
}

impl CallGuard {
    async fn release(&mut self) {
        let Some(listener) = self.listener.take() else {
            return;
        };
        self.pending.remove(&self.id);
        if let Err(e) = self.connection.unsubscribe(&self.topic, listener).await {
            tracing::debug!(id = %self.id, error = %e, "Response unsubscribe failed");
        }
    }
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        let Some(listener) = self.listener.take() else {
            return;
        };
        self.pending.cancel(&self.id);
        let connection = self.connection.clone();
        let topic = std::mem::take(&mut self.topic);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let _ = connection.unsubscribe(&topic, listener).await;
                });
            }
            Err(_) => tracing::warn!(id = %self.id, "Call dropped outside a runtime; subscription leaked"),
        }
    }
}

/// Handle to an in-flight call.
///
/// Awaiting the handle (or [`wait`](Self::wait)) yields the decoded result
/// or the failure reported by the server. Dropping it cancels the call and
/// releases its response subscription.
#[must_use = "dropping a PendingCall cancels it"]
pub struct PendingCall<R> {
    id: Uuid,
    method: String,
    result: ResultReceiver,
    status: watch::Receiver<Option<CallStatus>>,
    guard: CallGuard,
    _marker: PhantomData<fn() -> R>,
}

impl<R: WireType> PendingCall<R> {
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Latest status reported by the server, `None` before the first
    /// response.
    #[must_use]
    pub fn status(&self) -> watch::Receiver<Option<CallStatus>> {
        self.status.clone()
    }

    /// Wait for the FINISHED response.
    pub async fn wait(mut self) -> Result<R, StratusError> {
        let outcome = (&mut self.result).await;
        self.settle(outcome).await
    }

    /// Wait at most `timeout`; on expiry the call is cancelled.
    pub async fn wait_timeout(mut self, timeout: Duration) -> Result<R, StratusError> {
        match tokio::time::timeout(timeout, &mut self.result).await {
            Ok(outcome) => self.settle(outcome).await,
            Err(_) => {
                self.guard.pending.cancel(&self.id);
                self.guard.release().await;
                tracing::debug!(id = %self.id, method = %self.method, ?timeout, "Call timed out");
                Err(StratusError::Timeout(timeout))
            }
        }
    }

    /// Cancel the call. A late response is ignored.
    pub async fn cancel(mut self) {
        self.guard.pending.cancel(&self.id);
        self.guard.release().await;
    }

    async fn settle(
        mut self,
        outcome: Result<Result<Response, StratusError>, tokio::sync::oneshot::error::RecvError>,
    ) -> Result<R, StratusError> {
        self.guard.release().await;
        let response = outcome.map_err(|_| StratusError::Cancelled)??;
        resolve(&self.method, response)
    }
}

impl<R: WireType> IntoFuture for PendingCall<R> {
    type Output = Result<R, StratusError>;
    type IntoFuture = BoxFuture<'static, Self::Output>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.wait())
    }
}

impl<R> std::fmt::Debug for PendingCall<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCall")
            .field("id", &self.id)
            .field("method", &self.method)
            .field("status", &*self.status.borrow())
            .finish_non_exhaustive()
    }
}

fn resolve<R: WireType>(method: &str, response: Response) -> Result<R, StratusError> {
    if let Some(envelope) = response.error {
        return Err(match envelope.kind {
            FailureKind::MethodNotFound => StratusError::MethodNotFound(method.to_string()),
            _ => StratusError::Remote(envelope.to_remote_error()),
        });
    }
    Ok(R::from_wire(response.result.unwrap_or(WireValue::Void))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratus_core::{ErrorEnvelope, TransportError};
    use stratus_transport::{EndpointConfig, MemoryBroker, ReconnectPolicy, SubscribeFault};

    fn setup() -> (MemoryBroker, SharedConnection, RpcClient) {
        let broker = MemoryBroker::new();
        let config = EndpointConfig::new().reconnect(ReconnectPolicy::never());
        let connection = SharedConnection::new(config, Arc::new(broker.client()));
        let client = RpcClient::new(
            connection.clone(),
            Scope::parse("/calc/").unwrap(),
            ClientConfig::new().activation_timeout(Duration::from_millis(50)),
        );
        (broker, connection, client)
    }

    #[test]
    fn test_resolve_outcomes() {
        let ok: i32 = resolve("add", Response::finished("x", WireValue::Int(45))).unwrap();
        assert_eq!(ok, 45);

        resolve::<()>("ping", Response::finished("x", WireValue::Void)).unwrap();

        let missing = ErrorEnvelope::new(FailureKind::MethodNotFound, "MethodNotFound", "gone");
        let err = resolve::<i32>("gone", Response::failed("x", missing)).unwrap_err();
        assert!(matches!(err, StratusError::MethodNotFound(ref m) if m == "gone"));

        let app = ErrorEnvelope::new(FailureKind::Application, "EvalError", "division by zero");
        let err = resolve::<i32>("divide", Response::failed("x", app)).unwrap_err();
        let remote = err.remote().unwrap();
        assert_eq!(remote.message(), "division by zero");

        let err = resolve::<i32>("add", Response::finished("x", WireValue::Bool(true))).unwrap_err();
        assert!(matches!(err, StratusError::Codec(CodecError::TypeMismatch { .. })));
    }

    #[tokio::test]
    async fn test_subscribe_timeout_publishes_nothing() {
        let (broker, connection, client) = setup();
        connection.connect().await.unwrap();
        broker.set_subscribe_fault(Some(SubscribeFault::Stall));

        let err = client
            .call_method::<(i32, i32), i32>("add", (3, 42))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StratusError::Transport(TransportError::SubscribeTimeout { .. })
        ));
        assert!(broker.published_to("calc/rpc").is_empty());
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_signature_mismatch_fails_locally() {
        let (broker, _connection, client) = setup();

        let first = client
            .call_method::<(i32, i32), i32>("add", (3, 42))
            .await
            .unwrap();
        first.cancel().await;

        let err = client
            .call_method::<(i64, i64), i64>("add", (3, 42))
            .await
            .unwrap_err();
        assert!(matches!(err, StratusError::Codec(CodecError::TypeMismatch { .. })));
        assert_eq!(broker.published_to("calc/rpc").len(), 1);
    }

    #[tokio::test]
    async fn test_failed_call_does_not_pin_signature() {
        let (broker, connection, client) = setup();
        connection.connect().await.unwrap();
        broker.set_subscribe_fault(Some(SubscribeFault::Stall));

        let err = client
            .call_method::<(i32, i32), i32>("add", (3, 42))
            .await
            .unwrap_err();
        assert!(matches!(err, StratusError::Transport(_)));

        broker.set_subscribe_fault(None);
        let call = client
            .call_method::<(i64, i64), i64>("add", (3, 42))
            .await
            .unwrap();
        call.cancel().await;

        let err = client
            .call_method::<(i32, i32), i32>("add", (3, 42))
            .await
            .unwrap_err();
        assert!(matches!(err, StratusError::Codec(CodecError::TypeMismatch { .. })));
        assert_eq!(broker.published_to("calc/rpc").len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_releases_subscription() {
        let (broker, connection, client) = setup();

        let call = client
            .call_method::<(i32, i32), i32>("add", (3, 42))
            .await
            .unwrap();
        let reply_topic = format!("calc/rpc/{}", call.id());
        assert_eq!(connection.subscription_count(&reply_topic).await, 1);

        call.cancel().await;
        assert_eq!(connection.subscription_count(&reply_topic).await, 0);
        assert_eq!(client.pending_count(), 0);
        assert!(broker.active_filters().is_empty());
    }

    #[tokio::test]
    async fn test_wait_timeout_cancels() {
        let (_broker, connection, client) = setup();

        let call = client
            .call_method::<(), ()>("nobody_home", ())
            .await
            .unwrap();
        let reply_topic = format!("calc/rpc/{}", call.id());
        let err = call.wait_timeout(Duration::from_millis(20)).await.unwrap_err();

        assert!(matches!(err, StratusError::Timeout(_)));
        assert_eq!(connection.subscription_count(&reply_topic).await, 0);
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_expired_context() {
        let (broker, _connection, client) = setup();
        let ctx = Context::with_timeout(Duration::ZERO);

        let err = client
            .call_with::<(), ()>(&ctx, "ping", ())
            .await
            .unwrap_err();
        assert!(matches!(err, StratusError::Timeout(_)));
        assert_eq!(broker.publish_count(), 0);
    }
}
