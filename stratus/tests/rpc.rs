//! End-to-end RPC over the in-process broker.

use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use stratus::{
    Archive, CONTEXT_ID_PROPERTY, CallStatus, ClientConfig, CodecError, ConnectionRegistry,
    Context, DEFAULT_ASYNC_CEILING, Deserialize, EndpointConfig, EnvelopeCodec, FailureKind,
    MemoryBroker, Priority, ReconnectPolicy, RpcClient, RpcServer, Scope, Serialize, ServerConfig,
    SharedConnection, StratusError, SubscribeFault, TransportError, wire_enum, wire_message,
};

struct Harness {
    broker: MemoryBroker,
    _registry: ConnectionRegistry,
    connection: SharedConnection,
    scope: Scope,
}

impl Harness {
    async fn new() -> Self {
        let broker = MemoryBroker::new();
        let registry = ConnectionRegistry::new(broker.connector());
        let config = EndpointConfig::new().reconnect(ReconnectPolicy::never());
        let connection = registry.acquire(&config).await.unwrap();
        Self {
            broker,
            _registry: registry,
            connection,
            scope: Scope::parse("/services/calc/").unwrap(),
        }
    }

    fn server(&self, config: ServerConfig) -> RpcServer {
        RpcServer::new(self.connection.clone(), self.scope.clone(), config)
    }

    fn client(&self) -> RpcClient {
        RpcClient::new(
            self.connection.clone(),
            self.scope.clone(),
            ClientConfig::new()
                .activation_timeout(Duration::from_millis(200))
                .default_timeout(Some(Duration::from_secs(5))),
        )
    }

    fn response_topic(&self, id: &stratus::Uuid) -> String {
        self.scope.response_topic(id)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("cannot evaluate {expr}")]
struct EvalError {
    expr: String,
    #[source]
    source: ArithmeticError,
}

#[derive(Debug, thiserror::Error)]
#[error("division by zero")]
struct ArithmeticError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Add,
    Mul,
}

wire_enum!(Op => "calc.Op" { Add = 0, Mul = 1 });

#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
struct Summary {
    count: i32,
    total: i64,
}

wire_message!(Summary => "calc.Summary");

fn calculator(harness: &Harness, config: ServerConfig) -> RpcServer {
    let server = harness.server(config);
    let registry = server.registry();
    registry
        .register("add", Priority::Normal, |(a, b): (i32, i32)| Ok::<_, Infallible>(a + b))
        .unwrap();
    registry
        .register("divide", Priority::Normal, |(a, b): (i32, i32)| {
            if b == 0 {
                Err(EvalError {
                    expr: format!("{a} / {b}"),
                    source: ArithmeticError,
                })
            } else {
                Ok(a / b)
            }
        })
        .unwrap();
    registry
        .register("apply", Priority::Normal, |(op, a, b): (Op, i64, i64)| {
            Ok::<_, Infallible>(match op {
                Op::Add => a + b,
                Op::Mul => a * b,
            })
        })
        .unwrap();
    registry
        .register("summarize", Priority::Normal, |(values,): (String,)| {
            let parsed: Vec<i64> = values
                .split(',')
                .filter_map(|v| v.trim().parse().ok())
                .collect();
            Ok::<_, Infallible>(Summary {
                count: i32::try_from(parsed.len()).unwrap_or(i32::MAX),
                total: parsed.iter().sum(),
            })
        })
        .unwrap();
    registry
        .register("reset", Priority::Normal, |(): ()| Ok::<_, Infallible>(()))
        .unwrap();
    server
}

#[tokio::test]
async fn test_successful_call() {
    let harness = Harness::new().await;
    let server = calculator(&harness, ServerConfig::new());
    server.activate().await.unwrap();

    let client = harness.client();
    let sum: i32 = client.call("add", (3, 42)).await.unwrap();
    assert_eq!(sum, 45);
    assert_eq!(client.pending_count(), 0);
}

#[tokio::test]
async fn test_enum_message_and_void() {
    let harness = Harness::new().await;
    let server = calculator(&harness, ServerConfig::new());
    server.activate().await.unwrap();
    let client = harness.client();

    let product: i64 = client.call("apply", (Op::Mul, 6_i64, 7_i64)).await.unwrap();
    assert_eq!(product, 42);

    let summary: Summary = client
        .call("summarize", ("1, 2, 3".to_string(),))
        .await
        .unwrap();
    assert_eq!(summary, Summary { count: 3, total: 6 });

    client.call::<(), ()>("reset", ()).await.unwrap();
}

#[tokio::test]
async fn test_unknown_method() {
    let harness = Harness::new().await;
    let server = calculator(&harness, ServerConfig::new());
    server.activate().await.unwrap();

    let err = harness
        .client()
        .call::<(), i32>("doesNotExist", ())
        .await
        .unwrap_err();
    assert!(matches!(err, StratusError::MethodNotFound(ref name) if name == "doesNotExist"));
    assert_eq!(err.to_string(), "method not available: doesNotExist");
}

#[tokio::test]
async fn test_error_chain_survives_round_trip() {
    let harness = Harness::new().await;
    let server = calculator(&harness, ServerConfig::new());
    server.activate().await.unwrap();

    let err = harness
        .client()
        .call::<(i32, i32), i32>("divide", (1, 0))
        .await
        .unwrap_err();

    let remote = err.remote().unwrap();
    assert_eq!(remote.kind(), FailureKind::Application);
    assert_eq!(remote.message(), "cannot evaluate 1 / 0");
    assert!(remote.type_name().ends_with("EvalError"));
    assert_eq!(remote.root_cause().message(), "division by zero");

    let messages: Vec<&str> = remote.chain().map(stratus::RemoteError::message).collect();
    assert_eq!(messages, ["cannot evaluate 1 / 0", "division by zero"]);

    let source = std::error::Error::source(remote).unwrap();
    assert_eq!(source.to_string(), "division by zero");
}

#[tokio::test]
async fn test_arity_mismatch_is_reported() {
    let harness = Harness::new().await;
    let calls = Arc::new(AtomicUsize::new(0));
    let server = harness.server(ServerConfig::new());
    let counter = Arc::clone(&calls);
    server
        .registry()
        .register("add", Priority::Normal, move |(a, b): (i32, i32)| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, Infallible>(a + b)
        })
        .unwrap();
    server.activate().await.unwrap();

    let err = harness
        .client()
        .call::<(i32,), i32>("add", (3,))
        .await
        .unwrap_err();
    let remote = err.remote().unwrap();
    assert_eq!(remote.kind(), FailureKind::Marshalling);
    assert_eq!(remote.message(), "expected 2 but got 1 arguments");
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_acknowledge_before_finish() {
    let harness = Harness::new().await;
    let server = calculator(&harness, ServerConfig::new());
    server.activate().await.unwrap();

    let client = harness.client();
    let call = client
        .call_method::<(i32, i32), i32>("add", (3, 42))
        .await
        .unwrap();
    let reply_topic = harness.response_topic(&call.id());
    assert_eq!(call.wait().await.unwrap(), 45);

    let codec = EnvelopeCodec::new();
    let statuses: Vec<CallStatus> = harness
        .broker
        .published_to(&reply_topic)
        .iter()
        .map(|m| codec.decode_response(&m.payload).unwrap().status)
        .collect();
    assert_eq!(statuses.first(), Some(&CallStatus::Acknowledged));
    assert_eq!(statuses.last(), Some(&CallStatus::Finished));
    assert_eq!(
        statuses.iter().filter(|s| **s == CallStatus::Finished).count(),
        1
    );
}

#[tokio::test]
async fn test_progress_heartbeats() {
    let harness = Harness::new().await;
    let server = harness.server(ServerConfig::new().progress_interval(Some(Duration::from_millis(20))));
    server
        .registry()
        .register_async(
            "slow",
            Priority::Normal,
            Duration::from_secs(5),
            |(ms,): (i64,)| async move {
                tokio::time::sleep(Duration::from_millis(ms.unsigned_abs())).await;
                Ok::<_, Infallible>(ms)
            },
        )
        .unwrap();
    server.activate().await.unwrap();

    let client = harness.client();
    let call = client.call_method::<(i64,), i64>("slow", (150,)).await.unwrap();
    let reply_topic = harness.response_topic(&call.id());
    let mut status = call.status();

    let waiter = tokio::spawn(call.wait());
    status
        .wait_for(|s| matches!(s, Some(CallStatus::Progressing | CallStatus::Finished)))
        .await
        .unwrap();
    assert_eq!(waiter.await.unwrap().unwrap(), 150);
    assert_eq!(*status.borrow(), Some(CallStatus::Finished));

    let codec = EnvelopeCodec::new();
    let statuses: Vec<CallStatus> = harness
        .broker
        .published_to(&reply_topic)
        .iter()
        .map(|m| codec.decode_response(&m.payload).unwrap().status)
        .collect();
    assert!(statuses.contains(&CallStatus::Progressing));
    assert_eq!(statuses.last(), Some(&CallStatus::Finished));
}

#[tokio::test]
async fn test_high_priority_bypasses_budget() {
    let harness = Harness::new().await;
    let server = harness.server(ServerConfig::new().max_concurrent(1));
    server
        .registry()
        .register_async(
            "slow",
            Priority::Normal,
            Duration::from_secs(5),
            |(): ()| async {
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok::<_, Infallible>(())
            },
        )
        .unwrap();
    server
        .registry()
        .register("ping", Priority::High, |(): ()| Ok::<_, Infallible>(true))
        .unwrap();
    server.activate().await.unwrap();

    let client = harness.client();
    let first = client.call_method::<(), ()>("slow", ()).await.unwrap();
    let second = client.call_method::<(), ()>("slow", ()).await.unwrap();

    let pong: bool = tokio::time::timeout(Duration::from_millis(250), client.call("ping", ()))
        .await
        .expect("high priority call was queued behind normal calls")
        .unwrap();
    assert!(pong);

    first.cancel().await;
    second.cancel().await;
}

#[tokio::test]
async fn test_subscription_timeout_publishes_nothing() {
    let harness = Harness::new().await;
    let server = calculator(&harness, ServerConfig::new());
    server.activate().await.unwrap();
    harness.broker.set_subscribe_fault(Some(SubscribeFault::Stall));

    let client = harness.client();
    let err = client
        .call::<(i32, i32), i32>("add", (3, 42))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        StratusError::Transport(TransportError::SubscribeTimeout { .. })
    ));
    assert!(harness.broker.published_to(client.request_topic()).is_empty());
    assert_eq!(client.pending_count(), 0);
}

#[tokio::test]
async fn test_subscription_failure_publishes_nothing() {
    let harness = Harness::new().await;
    harness.broker.set_subscribe_fault(Some(SubscribeFault::Fail));

    let client = harness.client();
    let err = client.call::<(), ()>("reset", ()).await.unwrap_err();
    assert!(matches!(
        err,
        StratusError::Transport(TransportError::SubscribeFailed { .. })
    ));
    assert_eq!(harness.broker.publish_count(), 0);
}

#[tokio::test]
async fn test_cancel_releases_subscription() {
    let harness = Harness::new().await;
    let client = harness.client();

    let call = client
        .call_method::<(i32, i32), i32>("add", (3, 42))
        .await
        .unwrap();
    let reply_topic = harness.response_topic(&call.id());
    assert!(harness.broker.active_filters().contains(&reply_topic));

    call.cancel().await;
    assert!(!harness.broker.active_filters().contains(&reply_topic));
    assert_eq!(harness.connection.subscription_count(&reply_topic).await, 0);
    assert_eq!(client.pending_count(), 0);
}

#[tokio::test]
async fn test_dropped_call_releases_subscription() {
    let harness = Harness::new().await;
    let client = harness.client();

    let call = client
        .call_method::<(i32, i32), i32>("add", (3, 42))
        .await
        .unwrap();
    let reply_topic = harness.response_topic(&call.id());
    drop(call);

    for _ in 0..50 {
        if harness.connection.subscription_count(&reply_topic).await == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(harness.connection.subscription_count(&reply_topic).await, 0);
    assert_eq!(client.pending_count(), 0);
}

#[tokio::test]
async fn test_context_deadline_and_metadata() {
    let harness = Harness::new().await;
    let client = harness.client();

    let ctx = Context::with_timeout(Duration::from_millis(50)).with_metadata("tenant", "acme");
    let err = client
        .call_with::<(i32, i32), i32>(&ctx, "add", (3, 42))
        .await
        .unwrap_err();
    assert!(matches!(err, StratusError::Timeout(_)));

    let published = harness.broker.published_to(client.request_topic());
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].properties.get("tenant").map(String::as_str), Some("acme"));
    let context_id = ctx.correlation_id.to_string();
    assert_eq!(
        published[0].properties.get(CONTEXT_ID_PROPERTY),
        Some(&context_id)
    );

    assert!(harness.broker.active_filters().is_empty());
    assert_eq!(client.pending_count(), 0);
}

#[tokio::test]
async fn test_shared_context_calls_get_their_own_results() {
    let harness = Harness::new().await;
    let server = harness.server(ServerConfig::new());
    server
        .registry()
        .register_async(
            "echo",
            Priority::Normal,
            DEFAULT_ASYNC_CEILING,
            |(a,): (i32,)| async move {
                let delay = u64::try_from(a).unwrap_or(0) * 10;
                tokio::time::sleep(Duration::from_millis(delay)).await;
                Ok::<_, Infallible>(a)
            },
        )
        .unwrap();
    server.activate().await.unwrap();
    let client = harness.client();

    let ctx = Context::with_timeout(Duration::from_secs(5));
    let (a, b) = tokio::join!(
        client.call_with::<(i32,), i32>(&ctx, "echo", (1,)),
        client.call_with::<(i32,), i32>(&ctx, "echo", (2,)),
    );
    assert_eq!(a.unwrap(), 1);
    assert_eq!(b.unwrap(), 2);

    let codec = EnvelopeCodec::new();
    let published = harness.broker.published_to(client.request_topic());
    let ids: Vec<String> = published
        .iter()
        .map(|message| codec.decode_request(&message.payload).unwrap().id)
        .collect();
    assert_eq!(ids.len(), 2);
    assert_ne!(ids[0], ids[1]);
    assert!(ids.iter().all(|id| *id != ctx.correlation_id.to_string()));

    // Sequential reuse also gets a fresh id.
    let c: i32 = client.call_with(&ctx, "echo", (3,)).await.unwrap();
    assert_eq!(c, 3);
    assert_eq!(client.pending_count(), 0);
}

#[tokio::test]
async fn test_signature_mismatch_fails_before_publish() {
    let harness = Harness::new().await;
    let server = calculator(&harness, ServerConfig::new());
    server.activate().await.unwrap();
    let client = harness.client();

    let _: i32 = client.call("add", (1, 2)).await.unwrap();
    let before = harness.broker.published_to(client.request_topic()).len();

    let err = client
        .call::<(String, String), String>("add", ("a".into(), "b".into()))
        .await
        .unwrap_err();
    assert!(matches!(err, StratusError::Codec(CodecError::TypeMismatch { .. })));
    assert_eq!(harness.broker.published_to(client.request_topic()).len(), before);
}

#[tokio::test]
async fn test_reactivation() {
    let harness = Harness::new().await;
    let server = calculator(&harness, ServerConfig::new());
    server.activate().await.unwrap();
    server.deactivate().await.unwrap();
    assert!(!server.is_active());

    let client = RpcClient::new(
        harness.connection.clone(),
        harness.scope.clone(),
        ClientConfig::new().default_timeout(Some(Duration::from_millis(100))),
    );
    let err = client.call::<(i32, i32), i32>("add", (1, 1)).await.unwrap_err();
    assert!(matches!(err, StratusError::Timeout(_)));

    server.activate().await.unwrap();
    let sum: i32 = client.call("add", (1, 1)).await.unwrap();
    assert_eq!(sum, 2);
}

#[tokio::test]
async fn test_concurrent_calls_share_one_connection() {
    let harness = Harness::new().await;
    let server = calculator(&harness, ServerConfig::new());
    server.activate().await.unwrap();
    let client = harness.client();

    let calls = (0..16).map(|i| {
        let client = client.clone();
        tokio::spawn(async move { client.call::<(i32, i32), i32>("add", (i, i)).await })
    });
    for (i, call) in (0..16).zip(calls.collect::<Vec<_>>()) {
        assert_eq!(call.await.unwrap().unwrap(), i * 2);
    }

    assert_eq!(harness.broker.connect_count(), 1);
    assert_eq!(harness.broker.active_filters(), [client.request_topic()]);
}
