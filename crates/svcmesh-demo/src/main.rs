//! svcmesh demo - an echo service and a client that calls it.
//!
//! `svcmesh-demo serve` starts a server offering `Echo` and `Reverse` and
//! prints the port it listens on. `svcmesh-demo call` connects to such a
//! server and prints every response as a JSON line.

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use svcmesh_core::{
    ClientConfig, ClientEvent, EndpointId, EventLoop, MethodCall, MethodReply, ServerConfig,
    ServerEvent, ServiceClient, ServiceEndpoint, ServiceResponse, ServiceServer,
};
use tracing::{info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "svcmesh-demo")]
#[command(about = "Echo server and client for svcmesh")]
struct Args {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the echo service until interrupted
    Serve {
        /// Service name to offer
        #[arg(long, default_value = "echo")]
        service: String,

        /// Port to listen on (0 = auto-assign)
        #[arg(short, long, default_value = "0")]
        port: u16,

        /// Host to bind to
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
    },
    /// Call a method on a running server
    Call {
        /// Server address
        #[arg(long, default_value = "127.0.0.1")]
        address: String,

        /// Server port
        #[arg(short, long)]
        port: u16,

        /// Method to call
        #[arg(short, long, default_value = "Echo")]
        method: String,

        /// Request payload
        #[arg(default_value = "hello")]
        payload: String,

        /// Call timeout in milliseconds
        #[arg(long, default_value = "1000")]
        timeout_ms: u64,

        /// Client configuration as a JSON file
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging; RUST_LOG overrides --debug
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.as_str().to_lowercase()));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    let event_loop = EventLoop::current()?;
    match args.command {
        Command::Serve {
            service,
            port,
            host,
        } => serve(&event_loop, &service, &host, port).await,
        Command::Call {
            address,
            port,
            method,
            payload,
            timeout_ms,
            config,
        } => {
            let config = match config {
                Some(path) => {
                    let json = std::fs::read_to_string(&path)
                        .with_context(|| format!("reading {}", path.display()))?;
                    ClientConfig::from_json_str(&json)?
                }
                None => ClientConfig::default(),
            };
            let endpoint = ServiceEndpoint::new(
                "echo",
                EndpointId::new(address.clone(), 0, format!("{}:{}", address, port)),
                address,
                port,
            );
            call(
                &event_loop,
                config,
                endpoint,
                &method,
                payload,
                Duration::from_millis(timeout_ms),
            )
            .await
        }
    }
}

async fn serve(event_loop: &EventLoop, service: &str, host: &str, port: u16) -> Result<()> {
    let config = ServerConfig {
        bind_address: host.to_string(),
        port,
        ..ServerConfig::default()
    };
    let server = ServiceServer::create(event_loop, service, config)?;
    server.add_method("Echo", |call: MethodCall| Ok(MethodReply::new(call.request)));
    server.add_method("Reverse", |call: MethodCall| {
        let mut reversed = call.request.to_vec();
        reversed.reverse();
        Ok(MethodReply::new(reversed))
    });
    server.add_event_sink(|event: &ServerEvent| {
        info!("{:?} {}: {}", event.kind, event.peer, event.message);
    });

    // Print port for scripts to read
    println!("SVCMESH_PORT={}", server.port());
    info!("{} running on {}", service, server.local_addr());

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, exiting");
    Ok(())
}

async fn call(
    event_loop: &EventLoop,
    config: ClientConfig,
    endpoint: ServiceEndpoint,
    method: &str,
    payload: String,
    timeout: Duration,
) -> Result<()> {
    let client = ServiceClient::new(event_loop, &endpoint.service_name, config)?;
    client.add_event_sink(|event: &ClientEvent| {
        info!("{} {}: {}", event.kind, event.endpoint, event.message);
    });
    let id = endpoint.id.clone();
    client.add_endpoint(endpoint);

    let deadline = tokio::time::Instant::now() + timeout;
    while !client.is_endpoint_connected(&id) {
        if tokio::time::Instant::now() >= deadline {
            bail!("could not connect to {}", id);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let responses = client.call(method, Bytes::from(payload), Some(timeout)).await?;
    for response in &responses {
        if !response.is_success() {
            warn!("{} on {} did not succeed", method, response.endpoint);
        }
        println!("{}", render(response));
    }
    Ok(())
}

fn render(response: &ServiceResponse) -> serde_json::Value {
    serde_json::json!({
        "endpoint": response.endpoint.to_string(),
        "method": response.method,
        "state": response.state.to_string(),
        "failure": response.failure.map(|f| f.to_string()),
        "ret_state": response.ret_state,
        "error": response.error,
        "response": String::from_utf8_lossy(&response.response),
    })
}
