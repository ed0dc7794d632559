//! RPC server.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_lock::Semaphore;
use stratus_codec::EnvelopeCodec;
use stratus_core::{
    ErrorEnvelope, FailureKind, InboundMessage, Metadata, Request, Response, Scope, StratusError,
};
use stratus_transport::{ListenerId, SharedConnection};
use tokio::runtime::Handle;

use crate::registry::{MethodRegistry, Priority, method_not_found};

/// Configuration for RPC servers.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// How long `activate` waits for the broker to confirm.
    pub activation_timeout: Duration,

    /// Interval between PROGRESSING responses for a running call.
    /// `None` or a zero interval disables them.
    pub progress_interval: Option<Duration>,

    /// Maximum number of normal-priority invocations running at once.
    pub max_concurrent: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            activation_timeout: Duration::from_secs(3),
            progress_interval: Some(Duration::from_secs(1)),
            max_concurrent: 64,
        }
    }
}

impl ServerConfig {
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
    pub fn progress_interval(mut self, interval: Option<Duration>) -> Self {
        self.progress_interval = interval.filter(|i| !i.is_zero());
        self
    }

    #[must_use]
    pub fn max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max;
        self
    }
}

/// Serves the methods of a [`MethodRegistry`] on a scope's request topic.
///
/// For every request the server publishes ACKNOWLEDGED first, then
/// PROGRESSING at the configured interval while the method runs, then
/// exactly one FINISHED carrying either the result or a structured error.
/// Requests that cannot be decoded carry no usable correlation id and are
/// dropped with a warning.
pub struct RpcServer {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    connection: SharedConnection,
    scope: Scope,
    request_topic: String,
    registry: MethodRegistry,
    config: ServerConfig,
    codec: EnvelopeCodec,
    limiter: Arc<Semaphore>,
    listener: async_lock::Mutex<Option<ListenerId>>,
    active: AtomicBool,
}

impl RpcServer {
    #[must_use]
    pub fn new(connection: SharedConnection, scope: Scope, config: ServerConfig) -> Self {
        Self::with_registry(connection, scope, MethodRegistry::new(), config)
    }

    #[must_use]
    pub fn with_registry(
        connection: SharedConnection,
        scope: Scope,
        registry: MethodRegistry,
        config: ServerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                connection,
                request_topic: scope.rpc_topic(),
                scope,
                registry,
                limiter: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
                config,
                codec: EnvelopeCodec::new(),
                listener: async_lock::Mutex::new(None),
                active: AtomicBool::new(false),
            }),
        }
    }

    #[must_use]
    pub fn registry(&self) -> &MethodRegistry {
        &self.inner.registry
    }

    /// Registered method names, sorted.
    #[must_use]
    pub fn methods(&self) -> Vec<String> {
        self.inner.registry.names()
    }

    #[must_use]
    pub fn request_topic(&self) -> &str {
        &self.inner.request_topic
    }

    /// Subscribe to the request topic. No-op if already active.
    pub async fn activate(&self) -> Result<(), StratusError> {
        let mut listener = self.inner.listener.lock().await;
        if listener.is_some() {
            return Ok(());
        }

        let weak = Arc::downgrade(&self.inner);
        let handle = Handle::current();
        let id = self
            .inner
            .connection
            .subscribe(
                &self.inner.request_topic,
                Arc::new(move |message: &InboundMessage| on_request(&weak, &handle, message)),
                self.inner.config.activation_timeout,
            )
            .await?;

        *listener = Some(id);
        self.inner.active.store(true, Ordering::Release);
        tracing::info!(topic = %self.inner.request_topic, methods = self.inner.registry.len(), "RPC server active");
        Ok(())
    }

    /// Unsubscribe from the request topic. No-op if inactive.
    ///
    /// Calls already being executed still finish and reply.
    pub async fn deactivate(&self) -> Result<(), StratusError> {
        let mut listener = self.inner.listener.lock().await;
        let Some(id) = listener.take() else {
            return Ok(());
        };
        self.inner.active.store(false, Ordering::Release);
        self.inner
            .connection
            .unsubscribe(&self.inner.request_topic, id)
            .await?;
        tracing::info!(topic = %self.inner.request_topic, "RPC server inactive");
        Ok(())
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::Acquire)
    }
}

impl Drop for RpcServer {
    fn drop(&mut self) {
        let Some(id) = self.inner.listener.try_lock().and_then(|mut l| l.take()) else {
            return;
        };
        self.inner.active.store(false, Ordering::Release);
        let connection = self.inner.connection.clone();
        let topic = self.inner.request_topic.clone();
        if let Ok(handle) = Handle::try_current() {
            handle.spawn(async move {
                let _ = connection.unsubscribe(&topic, id).await;
            });
        }
    }
}

impl std::fmt::Debug for RpcServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcServer")
            .field("topic", &self.inner.request_topic)
            .field("active", &self.is_active())
            .field("methods", &self.methods())
            .finish_non_exhaustive()
    }
}

fn on_request(server: &Weak<ServerInner>, handle: &Handle, message: &InboundMessage) {
    let Some(server) = server.upgrade() else {
        return;
    };
    if !server.active.load(Ordering::Acquire) {
        return;
    }

    let request = match server.codec.decode_request(&message.payload) {
        Ok(request) => request,
        Err(e) => {
            tracing::warn!(topic = %message.topic, error = %e, "Dropping undecodable request");
            return;
        }
    };
    handle.spawn(async move { server.handle(request).await });
}

impl ServerInner {
    async fn handle(&self, request: Request) {
        let Ok(id) = request.correlation_id() else {
            tracing::warn!(id = %request.id, method = %request.method, "Dropping request with invalid correlation id");
            return;
        };
        let reply_topic = self.scope.response_topic(&id);

        self.reply(&reply_topic, &Response::acknowledged(&request.id))
            .await;

        let Some(method) = self.registry.get(&request.method) else {
            tracing::debug!(%id, method = %request.method, "Method not found");
            let response = Response::failed(&request.id, method_not_found(&request.method));
            self.reply(&reply_topic, &response).await;
            return;
        };

        let _permit = match method.priority() {
            Priority::Normal => Some(self.limiter.acquire_arc().await),
            Priority::High => None,
        };

        tracing::trace!(%id, method = %request.method, "Invoking");
        let mut invocation = tokio::spawn(method.invoke(request.params));
        let joined = match self.config.progress_interval.filter(|p| !p.is_zero()) {
            None => invocation.await,
            Some(period) => {
                let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
                loop {
                    tokio::select! {
                        joined = &mut invocation => break joined,
                        _ = ticker.tick() => {
                            self.reply(&reply_topic, &Response::progressing(&request.id)).await;
                        }
                    }
                }
            }
        };

        let response = match joined {
            Ok(Ok(value)) => Response::finished(&request.id, value),
            Ok(Err(envelope)) => {
                tracing::debug!(%id, method = %request.method, error = %envelope.message(), "Invocation failed");
                Response::failed(&request.id, envelope)
            }
            Err(e) => {
                tracing::error!(%id, method = %request.method, error = %e, "Invocation panicked");
                Response::failed(
                    &request.id,
                    ErrorEnvelope::new(FailureKind::Server, "ServerError", "server error"),
                )
            }
        };
        self.reply(&reply_topic, &response).await;
    }

    async fn reply(&self, topic: &str, response: &Response) {
        let payload = match self.codec.encode_response(response) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(topic = %topic, error = %e, "Failed to encode response");
                return;
            }
        };
        if let Err(e) = self
            .connection
            .publish(topic, payload, Metadata::new())
            .await
        {
            tracing::warn!(topic = %topic, status = ?response.status, error = %e, "Failed to publish response");
        }
    }
}
