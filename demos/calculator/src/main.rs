//! Calculator example for Stratus.
//!
//! Serves `add`, `divide`, and a slow `sum` on `/demo/calculator/`, then
//! calls them through a client sharing the same broker connection. The
//! bundled in-process broker stands in for a real one; `--host`/`--port`
//! (or `STRATUS_BROKER_HOST`/`STRATUS_BROKER_PORT`) only select the
//! endpoint key.
//!
//! ```text
//! RUST_LOG=stratus_rpc=debug cargo run -p calculator -- --port 1884
//! ```

use std::convert::Infallible;
use std::time::Duration;

use clap::Parser;
use stratus::prelude::*;
use stratus::{CallStatus, DEFAULT_ASYNC_CEILING};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "calculator", about = "Stratus calculator demo")]
struct Args {
    /// Broker host (overrides STRATUS_BROKER_HOST).
    #[arg(long)]
    host: Option<String>,

    /// Broker port (overrides STRATUS_BROKER_PORT).
    #[arg(long)]
    port: Option<u16>,

    /// Milliseconds the slow `sum` method takes.
    #[arg(long, default_value_t = 1500)]
    delay_ms: u64,
}

#[derive(Debug, thiserror::Error)]
enum CalcError {
    #[error("cannot divide {0} by zero")]
    DivideByZero(i32),
}

fn endpoint(args: &Args) -> Result<EndpointConfig, StratusError> {
    let mut config = EndpointConfig::from_env()?;
    if let Some(host) = &args.host {
        config = config.host(host.clone());
    }
    if let Some(port) = args.port {
        config = config.port(port);
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    let args = Args::parse();
    let config = endpoint(&args)?;
    tracing::info!(endpoint = %config.key(), "Starting calculator demo");

    let broker = MemoryBroker::new();
    let connections = ConnectionRegistry::new(broker.connector());
    let connection = connections.acquire(&config).await?;
    let scope = Scope::parse("/demo/calculator/")?;

    // Server
    let server = RpcServer::new(
        connection.clone(),
        scope.clone(),
        ServerConfig::new().progress_interval(Some(Duration::from_millis(250))),
    );
    let registry = server.registry();
    registry.register("add", Priority::Normal, |(a, b): (i32, i32)| {
        Ok::<_, Infallible>(a + b)
    })?;
    registry.register("divide", Priority::Normal, |(a, b): (i32, i32)| {
        a.checked_div(b).ok_or(CalcError::DivideByZero(a))
    })?;
    let delay = Duration::from_millis(args.delay_ms);
    registry.register_async(
        "sum",
        Priority::Normal,
        DEFAULT_ASYNC_CEILING,
        move |(values,): (String,)| async move {
            tokio::time::sleep(delay).await;
            Ok::<_, Infallible>(
                values
                    .split(',')
                    .filter_map(|v| v.trim().parse::<i64>().ok())
                    .sum::<i64>(),
            )
        },
    )?;
    server.activate().await?;
    println!("Serving {:?} on {}", server.methods(), server.request_topic());

    // Client
    let client = RpcClient::new(
        connection.clone(),
        scope,
        ClientConfig::new().default_timeout(Some(Duration::from_secs(10))),
    );

    let sum: i32 = client.call("add", (3, 42)).await?;
    println!("add(3, 42) = {sum}");

    let quotient: i32 = client.call("divide", (84, 2)).await?;
    println!("divide(84, 2) = {quotient}");

    match client.call::<(i32, i32), i32>("divide", (1, 0)).await {
        Ok(value) => println!("divide(1, 0) = {value}"),
        Err(StratusError::Remote(e)) => println!("divide(1, 0) failed: {} ({})", e.message(), e.type_name()),
        Err(e) => return Err(e.into()),
    }

    match client.call::<(), ()>("doesNotExist", ()).await {
        Err(StratusError::MethodNotFound(name)) => println!("{name}: method not available"),
        other => println!("doesNotExist: unexpected outcome {other:?}"),
    }

    let call = client
        .call_method::<(String,), i64>("sum", ("1, 2, 3, 4".to_string(),))
        .await?;
    let mut status = call.status();
    let waiter = tokio::spawn(call.wait());
    while status.changed().await.is_ok() {
        let current = *status.borrow_and_update();
        println!("sum status: {current:?}");
        if current == Some(CallStatus::Finished) {
            break;
        }
    }
    println!("sum(1, 2, 3, 4) = {}", waiter.await??);

    server.deactivate().await?;
    connections.release(&connection).await?;
    connections.shutdown().await;
    Ok(())
}
