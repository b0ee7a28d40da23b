use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use clap::{Parser, Subcommand};
use http_body_util::Full;
use prometheus::Encoder;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tfstate_backend::auth::{AuthPlugin, AuthPolicy};
use tfstate_backend::engine::{StateEngine, DEFAULT_LIST_LIMIT};
use tfstate_backend::http::{StateService, DEFAULT_MAX_BODY_SIZE};
use tfstate_backend::inspect::{inspect, InspectConfig};
use tfstate_backend::metrics::SharedMetrics;
use tfstate_backend::store::{open_store, Durability, StorageEngine};

#[derive(Parser)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Parser, Debug)]
pub struct ServerConfig {
    #[arg(long, default_value = ".", help = "Directory of the fjall keyspace")]
    meta_root: PathBuf,

    #[arg(long, default_value = "localhost")]
    host: String,

    #[arg(long, default_value = "8014")]
    port: u16,

    #[arg(long, default_value = "localhost")]
    metric_host: String,

    #[arg(long, default_value = "9100")]
    metric_port: u16,

    #[arg(
        long,
        default_value = "fjall",
        help = "Storage engine (fjall, fjall_notx, memory)"
    )]
    storage_engine: StorageEngine,

    #[arg(
        long,
        default_value = "fdatasync",
        help = "Durability level (buffer, fsync, fdatasync)"
    )]
    durability: Durability,

    #[arg(
        long,
        default_value_t = DEFAULT_LIST_LIMIT,
        value_parser = parse_list_limit,
        help = "Objects returned per namespace when listing; further pages are not returned"
    )]
    list_limit: usize,

    #[arg(
        long,
        default_value_t = DEFAULT_MAX_BODY_SIZE,
        help = "Largest accepted state or lock body in bytes"
    )]
    max_body_size: usize,

    #[arg(
        long,
        env = "AUTH_PLUGIN",
        default_value = "fail",
        help = "Authorization policy (fail, noop, basic)"
    )]
    auth_plugin: AuthPlugin,

    #[arg(long, env = "AUTH_BASIC_USERNAME", help = "Username for the basic auth plugin")]
    auth_basic_username: Option<String>,

    #[arg(
        long,
        env = "AUTH_BASIC_PASSWORD",
        hide_env_values = true,
        help = "Password for the basic auth plugin"
    )]
    auth_basic_password: Option<String>,

    #[arg(
        long,
        default_value = "info",
        help = "Log level (error, warn, info, debug, trace). Can also be set via RUST_LOG env var"
    )]
    log_level: String,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Inspect a keyspace offline
    Inspect(InspectConfig),

    /// Start the state backend server
    Server(ServerConfig),
}

fn parse_list_limit(s: &str) -> Result<usize, String> {
    match s.parse::<usize>() {
        Ok(0) => Err("list limit must be at least 1".to_string()),
        Ok(limit) => Ok(limit),
        Err(e) => Err(e.to_string()),
    }
}

fn setup_tracing(log_level: &str) {
    // Try to use RUST_LOG env var first, fall back to CLI flag
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| {
            eprintln!("Invalid log level '{}', falling back to 'info'", log_level);
            EnvFilter::new("info")
        });

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn main() -> Result<()> {
    dotenv::dotenv().ok();

    let cli = Cli::parse();

    let log_level = match &cli.command {
        Command::Server(config) => config.log_level.as_str(),
        _ => "info",
    };

    setup_tracing(log_level);

    match cli.command {
        Command::Inspect(config) => inspect(config)?,
        Command::Server(config) => {
            run(config)?;
        }
    }
    Ok(())
}

use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;

#[tokio::main]
async fn run(args: ServerConfig) -> anyhow::Result<()> {
    let auth = AuthPolicy::from_config(
        args.auth_plugin,
        args.auth_basic_username.clone(),
        args.auth_basic_password.clone(),
    )
    .map_err(anyhow::Error::msg)?;
    match &auth {
        AuthPolicy::Deny => info!("auth plugin 'fail': every request will be rejected"),
        AuthPolicy::Allow => info!("auth plugin 'noop': authorization is disabled"),
        AuthPolicy::Basic(basic) => {
            info!("auth plugin 'basic' enabled for user: {}", basic.username())
        }
    }

    let store = open_store(
        args.storage_engine,
        args.meta_root.clone(),
        Some(args.durability),
    )?;
    info!(engine = ?args.storage_engine, path = %args.meta_root.display(), "storage opened");

    let metrics = SharedMetrics::new();
    let engine = StateEngine::new(store, Arc::new(auth), metrics).with_list_limit(args.list_limit);
    let service = StateService::new(engine).with_max_body_size(args.max_body_size);

    run_server(args, service).await
}

async fn run_server(args: ServerConfig, service: StateService) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind((args.host.as_str(), args.port)).await?;
    let local_addr = listener.local_addr()?;

    let metrics_listener =
        tokio::net::TcpListener::bind((args.metric_host.as_str(), args.metric_port)).await?;
    let metrics_addr = metrics_listener.local_addr()?;

    info!("metrics server is running at http://{metrics_addr}");

    let metrics_service = hyper::service::service_fn(
        move |req: hyper::Request<hyper::body::Incoming>| async move {
            match (req.method(), req.uri().path()) {
                (&hyper::Method::GET, "/metrics") => {
                    let mut buffer = Vec::new();
                    let encoder = prometheus::TextEncoder::new();
                    let metric_families = prometheus::gather();
                    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
                        tracing::error!("failed to encode metrics: {e}");
                    }

                    Ok::<_, std::convert::Infallible>(
                        hyper::Response::builder()
                            .status(200)
                            .header(hyper::header::CONTENT_TYPE, "text/plain; version=0.0.4")
                            .body(Full::new(Bytes::from(buffer)))
                            .unwrap(),
                    )
                }
                _ => Ok::<_, std::convert::Infallible>(
                    hyper::Response::builder()
                        .status(404)
                        .body(Full::new(Bytes::from("Not Found")))
                        .unwrap(),
                ),
            }
        },
    );

    let http_server = ConnBuilder::new(TokioExecutor::new());
    let graceful = hyper_util::server::graceful::GracefulShutdown::new();

    let mut ctrl_c = std::pin::pin!(tokio::signal::ctrl_c());

    info!("server is running at http://{local_addr}");

    loop {
        tokio::select! {
            res = listener.accept() => {
                match res {
                    Ok((socket, _)) => {
                        let service = service.clone();
                        let handler = hyper::service::service_fn(move |req| {
                            let service = service.clone();
                            async move { service.handle_request(req).await }
                        });
                        let conn = http_server.serve_connection(TokioIo::new(socket), handler);
                        let conn = graceful.watch(conn.into_owned());
                        tokio::spawn(async move {
                            let _ = conn.await;
                        });
                    }
                    Err(err) => {
                        tracing::error!("error accepting connection: {err}");
                    }
                }
            }
            res = metrics_listener.accept() => {
                match res {
                    Ok((socket, _)) => {
                        let conn = http_server.serve_connection(TokioIo::new(socket), metrics_service);
                        let conn = graceful.watch(conn.into_owned());
                        tokio::spawn(async move {
                            let _ = conn.await;
                        });
                    }
                    Err(err) => {
                        tracing::error!("error accepting metrics connection: {err}");
                    }
                }
            }
            _ = ctrl_c.as_mut() => {
                break;
            }
        };
    }

    tokio::select! {
        () = graceful.shutdown() => {
             tracing::debug!("Gracefully shutdown!");
        },
        () = tokio::time::sleep(std::time::Duration::from_secs(10)) => {
             tracing::debug!("Waited 10 seconds for graceful shutdown, aborting...");
        }
    }

    info!("server is stopped");
    Ok(())
}
