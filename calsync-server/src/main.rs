//! calsync Server - single-user CalDAV calendar server
//!
//! Serves one account's calendars over CalDAV, backed by a SQLite
//! database in the data directory.

use anyhow::{Context, Result};
use calsync_core::Database;
use calsync_dav::{CalendarBackend, Config, DavHandler, DavResponse};
use clap::{Parser, Subcommand};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_USER: &str = "testuser";
const DEFAULT_PASS: &str = "testpass";

/// calsync Server Configuration
#[derive(Parser, Debug)]
#[command(name = "calsync")]
#[command(author = "calsync Contributors")]
#[command(version)]
#[command(about = "Single-user CalDAV calendar server", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the server
    Start {
        /// Listen address (e.g., 0.0.0.0:8080)
        #[arg(short, long, env = "CALSYNC_ADDR", default_value = "0.0.0.0:8080")]
        addr: String,

        /// Directory holding calendar.db
        #[arg(short, long, env = "CALSYNC_DATA_DIR", default_value = "./data")]
        data_dir: PathBuf,

        /// Account username
        #[arg(long, env = "CALSYNC_USER", default_value = DEFAULT_USER)]
        user: String,

        /// Account password
        #[arg(long, env = "CALSYNC_PASS", default_value = DEFAULT_PASS, hide_env_values = true)]
        pass: String,

        /// Enable debug logging
        #[arg(long)]
        debug: bool,
    },

    /// Create or upgrade the database schema and exit
    Migrate {
        /// Directory holding calendar.db
        #[arg(short, long, env = "CALSYNC_DATA_DIR", default_value = "./data")]
        data_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start {
            addr,
            data_dir,
            user,
            pass,
            debug,
        } => {
            init_tracing(debug);
            serve(&addr, &data_dir, user, pass).await
        }
        Commands::Migrate { data_dir } => {
            init_tracing(false);
            let db = open_database(&data_dir)?;
            let version = db
                .schema_version()
                .context("Failed to read schema version")?;
            info!("Database at {:?} is at schema version {}", data_dir, version);
            Ok(())
        }
    }
}

fn init_tracing(debug: bool) {
    let env_filter = if debug {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::from_default_env()
            .add_directive(tracing::Level::INFO.into())
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();
}

fn open_database(data_dir: &Path) -> Result<Database> {
    Database::open(data_dir)
        .with_context(|| format!("Failed to open database in {:?}", data_dir))
}

async fn serve(addr: &str, data_dir: &Path, user: String, pass: String) -> Result<()> {
    info!("Starting calsync server on {}", addr);
    info!("Data directory: {:?}", data_dir);

    if user == DEFAULT_USER && pass == DEFAULT_PASS {
        warn!("Using default credentials; set CALSYNC_USER and CALSYNC_PASS");
    }

    let db = Arc::new(open_database(data_dir)?);
    let (account, calendar) = db
        .bootstrap(&user)
        .with_context(|| format!("Failed to bootstrap account {}", user))?;
    info!(
        "Serving calendars of {} (default calendar: {})",
        account.username, calendar.name
    );

    let config = Config {
        username: user,
        password: pass,
        ..Config::default()
    };
    let backend = Arc::new(CalendarBackend::new(db, config.prefix.clone()));
    let handler = Arc::new(DavHandler::new(backend, config));

    let addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("Invalid listen address {}", addr))?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!("Server listening on {}", addr);

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        continue;
                    }
                };
                let handler = handler.clone();
                let io = TokioIo::new(stream);

                tokio::spawn(async move {
                    if let Err(e) = http1::Builder::new()
                        .serve_connection(io, service_fn(move |req| handle_request(req, handler.clone())))
                        .await
                    {
                        debug!("Error serving connection from {}: {:?}", peer, e);
                    }
                });
            }
            _ = &mut shutdown => {
                info!("Shutdown signal received, stopping");
                break;
            }
        }
    }

    Ok(())
}

/// Handle incoming HTTP request
async fn handle_request(
    req: Request<hyper::body::Incoming>,
    handler: Arc<DavHandler>,
) -> Result<DavResponse, Infallible> {
    let method = req.method().clone();
    let uri = req.uri().clone();
    debug!("Request: {} {}", method, uri);
    for (name, value) in req.headers().iter() {
        if name != hyper::header::AUTHORIZATION {
            debug!("  {}: {}", name, value.to_str().unwrap_or("<binary>"));
        }
    }

    let response = handler.handle(req).await;

    info!("{} {} -> {}", method, uri, response.status());
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_start_defaults() {
        let cli = Cli::try_parse_from(["calsync", "start", "--addr", "127.0.0.1:9999"]).unwrap();
        match cli.command {
            Commands::Start { addr, debug, .. } => {
                assert_eq!(addr, "127.0.0.1:9999");
                assert!(!debug);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_migrate_creates_database() {
        let dir = tempfile::TempDir::new().unwrap();
        let db = open_database(dir.path()).unwrap();
        assert!(db.schema_version().unwrap() >= 1);
        assert!(dir.path().join("calendar.db").exists());
    }
}
