//! Echo daemon: answers every request with its own payload.
//!
//! The smallest useful sockd daemon, and the one the integration tests
//! spawn through `DaemonClient`.

use async_trait::async_trait;
use clap::Parser;
use serde_json::{Value, json};
use sockd::server::{DaemonServer, Handler, ListenOutcome, ServerConfig};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(
    name = "sockd-echo",
    author,
    version,
    about = "Echo daemon built on sockd"
)]
struct Cli {
    /// Service name; coordination files live under .{name}/daemon/
    #[arg(long, default_value = "echo")]
    service_name: String,

    /// Root directory for the coordination files (defaults to the working
    /// directory)
    #[arg(long)]
    root: Option<PathBuf>,

    /// Server-wide idle timeout in milliseconds
    #[arg(long)]
    idle_timeout_ms: Option<u64>,

    /// Per-connection receive-idle timeout in milliseconds (0 disables)
    #[arg(long)]
    connection_timeout_ms: Option<u64>,

    /// Log level: trace, debug, info, warn, error
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,
}

struct Echo;

#[async_trait]
impl Handler for Echo {
    async fn handle(&self, request: Value) -> Value {
        json!({ "echo": request, "pid": std::process::id() })
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = sockd::logger::init_logger(&cli.log_level, &cli.log_format, false) {
        eprintln!("Error initializing logger: {e}");
        std::process::exit(1);
    }

    let mut config = ServerConfig::new(&cli.service_name);
    config.root = cli.root;
    if let Some(ms) = cli.idle_timeout_ms {
        config.idle_timeout = Duration::from_millis(ms);
    }
    if let Some(ms) = cli.connection_timeout_ms {
        config.connection_timeout = Duration::from_millis(ms);
    }

    let mut server = match DaemonServer::new(config, Echo) {
        Ok(server) => server,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    match server.listen().await {
        Ok(ListenOutcome::Closed | ListenOutcome::AlreadyRunning) => {}
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    }
}
