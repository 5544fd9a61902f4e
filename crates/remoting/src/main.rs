//! # Remoting CLI Entry Point
//!
//! Main binary for the remoting RPC runtime. Starts a demo service and talks
//! to running services from the command line.
//!
//! ## Usage
//!
//! ```bash
//! # Start the demo service, raising a `tick` event every second
//! remoting serve -p 9000 --compute latest
//!
//! # Make an RPC call (outputs raw JSON)
//! remoting call 127.0.0.1:9000 add -p '[2, 3]'
//!
//! # Print every `tick` event, stamping payloads this client computes
//! remoting listen 127.0.0.1:9000 tick --event-version 2 --stamp computed_by
//!
//! # Publish an event to every other subscriber
//! remoting publish 127.0.0.1:9000 price '{"v": 10}'
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use argh::FromArgs;
use remoting::{
    ComputePolicy, EventContext, EventHub, MethodRouter, RpcClientConfig, RpcServerConfig,
    Runtime, ServiceError, TransportServerConfig,
};
use remoting::server::param;
use serde_json::{json, Value};

/// Main CLI structure parsed from command-line arguments.
#[derive(FromArgs)]
/// Remoting - RPC and events over framed TCP
struct Cli {
    #[argh(subcommand)]
    command: Commands,
}

/// Available CLI subcommands.
///
/// - **Serve**: Start the demo service
/// - **Call**: Make a single RPC call (unix-friendly JSON output)
/// - **Publish**: Publish one event
/// - **Listen**: Subscribe to an event and print every payload
#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Serve(ServeArgs),
    Call(CallArgs),
    Publish(PublishArgs),
    Listen(ListenArgs),
}

/// Arguments for starting the demo service.
///
/// The service exposes `echo`, `add` and `error`, and raises a `tick` event
/// with an increasing counter.
#[derive(FromArgs)]
#[argh(subcommand, name = "serve")]
/// start the demo service
struct ServeArgs {
    /// port to listen on; 0 picks a free port
    #[argh(option, short = 'p', default = "9000")]
    port: u16,

    /// maximum number of simultaneous connections
    #[argh(option, default = "10_000")]
    capacity: usize,

    /// seconds without inbound traffic before a connection is closed
    #[argh(option, long = "heartbeat-secs", default = "60")]
    heartbeat_secs: u64,

    /// compute policy: `disabled`, `latest`, or a fixed event version
    #[argh(option, from_str_fn(parse_compute), default = "ComputePolicy::Disabled")]
    compute: ComputePolicy,

    /// event version allowed to receive broadcasts; repeatable, none allows all
    #[argh(option, long = "broadcast-version")]
    broadcast_versions: Vec<i32>,

    /// interval between `tick` events in milliseconds; 0 disables them
    #[argh(option, long = "tick-ms", default = "1000")]
    tick_ms: u64,
}

/// Arguments for making a single RPC call.
///
/// Outputs the raw JSON return value on stdout. Remote errors go to stderr
/// with a non-zero exit code.
#[derive(FromArgs)]
#[argh(subcommand, name = "call")]
/// call a method on a running service
struct CallArgs {
    /// address of the service
    #[argh(positional)]
    server_address: SocketAddr,

    /// name of the method to call
    #[argh(positional)]
    method: String,

    /// JSON array of positional parameters
    #[argh(option, short = 'p', long = "params", default = "\"[]\".into()")]
    params: String,

    /// trace id propagated with the call
    #[argh(option, long = "trace-id")]
    trace_id: Option<String>,
}

/// Arguments for publishing one event.
#[derive(FromArgs)]
#[argh(subcommand, name = "publish")]
/// publish an event to every other subscriber
struct PublishArgs {
    /// address of the service
    #[argh(positional)]
    server_address: SocketAddr,

    /// event name
    #[argh(positional)]
    event: String,

    /// JSON payload
    #[argh(positional, default = "\"null\".into()")]
    payload: String,

    /// event version declared in the handshake
    #[argh(option, long = "event-version", default = "0")]
    event_version: i32,

    /// milliseconds to keep the connection open so the packet is flushed
    #[argh(option, long = "linger-ms", default = "200")]
    linger_ms: u64,
}

/// Arguments for listening to an event.
///
/// Each received payload is printed as one JSON line. When this client is
/// elected to compute a payload, `--stamp` names a field set to the event
/// version before the payload is returned to the server.
#[derive(FromArgs)]
#[argh(subcommand, name = "listen")]
/// subscribe to an event and print every payload
struct ListenArgs {
    /// address of the service
    #[argh(positional)]
    server_address: SocketAddr,

    /// event name
    #[argh(positional)]
    event: String,

    /// event version declared in the handshake
    #[argh(option, long = "event-version", default = "0")]
    event_version: i32,

    /// field set on payloads this client computes
    #[argh(option)]
    stamp: Option<String>,
}

fn parse_compute(value: &str) -> std::result::Result<ComputePolicy, String> {
    match value {
        "disabled" | "off" => Ok(ComputePolicy::Disabled),
        "latest" => Ok(ComputePolicy::LatestVersion),
        other => other
            .parse::<i32>()
            .map(ComputePolicy::FixedVersion)
            .map_err(|_| format!("expected `disabled`, `latest` or a version number, got `{}`", other)),
    }
}

fn parse_json(value: &str, what: &str) -> Result<Value> {
    serde_json::from_str(value).map_err(|e| anyhow::anyhow!("Invalid JSON in {}: {}", what, e))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    // call and publish keep stdout clean for piping; listen logs to stderr
    if matches!(cli.command, Commands::Serve(_) | Commands::Listen(_)) {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .init();
    }

    match cli.command {
        Commands::Serve(args) => run_serve(args).await,
        Commands::Call(args) => run_call(args).await,
        Commands::Publish(args) => run_publish(args).await,
        Commands::Listen(args) => run_listen(args).await,
    }
}

/// Demo service: `echo`, `add`, `error`, and the `tick` event.
fn demo_service(hub_slot: Arc<std::sync::Mutex<Option<EventHub>>>) -> MethodRouter {
    MethodRouter::new()
        .method("echo", |params| Ok(params.into_iter().next().unwrap_or(Value::Null)))
        .method("add", |params| {
            let a: f64 = param(&params, 0)?;
            let b: f64 = param(&params, 1)?;
            Ok(json!(a + b))
        })
        .method("error", |params| {
            let message: String = param(&params, 0).unwrap_or_else(|_| "requested failure".into());
            Err(ServiceError::new("IllegalState", message))
        })
        .on_bind(move |hub| {
            *hub_slot.lock().unwrap_or_else(|e| e.into_inner()) = Some(hub);
        })
}

async fn run_serve(args: ServeArgs) -> Result<()> {
    let transport = TransportServerConfig::with_port(args.port)
        .with_capacity(args.capacity)
        .with_heartbeat_timeout(Duration::from_secs(args.heartbeat_secs));
    let config = RpcServerConfig::new(transport)
        .with_compute(args.compute)
        .with_broadcast_versions(args.broadcast_versions);

    let hub_slot = Arc::new(std::sync::Mutex::new(None));
    let runtime = Runtime::new();
    let server = runtime
        .register("demo", Arc::new(demo_service(hub_slot.clone())), config)
        .await?;
    tracing::info!("Demo service listening on {}", server.local_addr());

    let hub = hub_slot.lock().unwrap_or_else(|e| e.into_inner()).take();
    if let (Some(hub), true) = (hub, args.tick_ms > 0) {
        let period = Duration::from_millis(args.tick_ms);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            let mut n: u64 = 0;
            loop {
                interval.tick().await;
                n += 1;
                let payload = hub.raise("tick", json!({ "n": n })).await;
                tracing::debug!("Raised tick {}", payload);
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    runtime.shutdown().await;
    Ok(())
}

/// Executes the `call` subcommand.
///
/// # Errors
///
/// Returns an error if:
/// - The params string is not a JSON array
/// - The connection to the server fails
/// - The remote method fails
async fn run_call(args: CallArgs) -> Result<()> {
    let params = match parse_json(&args.params, "params")? {
        Value::Array(params) => params,
        other => anyhow::bail!("params must be a JSON array, got {}", other),
    };

    let mut config = RpcClientConfig::stateful(args.server_address, 0);
    config.transport.enable_reconnect = false;
    if let Some(trace_id) = args.trace_id {
        config = config.with_trace_id(trace_id);
    }

    let runtime = Runtime::new();
    let facade = runtime.facade(config);
    let result = facade.invoke(&args.method, params).await;
    facade.close().await;

    println!("{}", serde_json::to_string(&result?)?);
    Ok(())
}

async fn run_publish(args: PublishArgs) -> Result<()> {
    let payload = parse_json(&args.payload, "payload")?;
    let mut config = RpcClientConfig::stateful(args.server_address, args.event_version);
    config.transport.enable_reconnect = false;

    let runtime = Runtime::new();
    let facade = runtime.facade(config);
    let sent = facade.publish(&args.event, payload).await?;
    tokio::time::sleep(Duration::from_millis(args.linger_ms)).await;
    facade.close().await;

    println!("{}", serde_json::to_string(&sent)?);
    Ok(())
}

async fn run_listen(args: ListenArgs) -> Result<()> {
    let version = args.event_version;
    let stamp = args.stamp;

    let runtime = Runtime::new();
    let facade = runtime.facade(RpcClientConfig::stateful(args.server_address, version));
    facade
        .subscribe(&args.event, move |ctx: &EventContext, payload: &mut Value| {
            if ctx.is_compute {
                if let (Some(field), Value::Object(fields)) = (&stamp, &mut *payload) {
                    fields.insert(field.clone(), json!(version));
                }
            }
            println!("{}", json!({ "compute": ctx.is_compute, "payload": payload }));
        })
        .await?;
    tracing::info!(event = %args.event, "Listening, press ctrl-c to stop");

    tokio::signal::ctrl_c().await?;
    facade.close().await;
    runtime.shutdown().await;
    Ok(())
}
