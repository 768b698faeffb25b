use clap::Parser;
use figlink_hub::{
    routes::{DEFAULT_PULL_TYPES, DEFAULT_PUSH_TYPES, DEFAULT_STATE_TYPES},
    HeartbeatConfig, HubConfig, McpConflictPolicy, RouteTable, DEFAULT_PORT,
};
use std::{
    fs::{self, OpenOptions},
    io,
    net::{Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{
    fmt::writer::{BoxMakeWriter, MakeWriterExt},
    EnvFilter,
};

#[derive(Parser, Debug)]
#[command(name = "figlink-hub", about = "Token-scoped websocket relay for design peers")]
struct Args {
    #[arg(long, env = "FIGLINK_HUB_ADDR", default_value_t = default_addr())]
    addr: SocketAddr,
    /// Accept upgrades from non-loopback peers.
    #[arg(long, default_value_t = false)]
    allow_remote: bool,
    /// Log every relayed frame.
    #[arg(long, env = "FIGLINK_HUB_DEBUG")]
    debug: bool,
    /// Filter directive used when `RUST_LOG` is unset.
    #[arg(long, env = "FIGLINK_LOG_LEVEL", default_value = "info")]
    log_level: String,
    /// Mirror logs into `figlink-hub-<host>_<port>.log` under this directory.
    #[arg(long, env = "FIGLINK_LOG_DIR")]
    log_dir: Option<PathBuf>,
    #[arg(long, default_value_t = 10)]
    ping_interval: u64,
    #[arg(long, default_value_t = 30)]
    pong_timeout: u64,
    #[arg(long, default_value_t = 1000)]
    check_interval_ms: u64,
    #[arg(long, default_value_t = 2)]
    write_timeout: u64,
    #[arg(long, default_value_t = 256)]
    queue_capacity: usize,
    #[arg(long, default_value_t = figlink_core::DEFAULT_MAX_FRAME_BYTES)]
    max_message_bytes: usize,
    #[arg(long, value_enum, default_value_t = McpConflictPolicy::EvictIncumbent)]
    mcp_policy: McpConflictPolicy,
    #[arg(long, value_delimiter = ',')]
    state_types: Vec<String>,
    #[arg(long, value_delimiter = ',')]
    pull_types: Vec<String>,
    #[arg(long, value_delimiter = ',')]
    push_types: Vec<String>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let debug = args.debug;
    let addr = args.addr;
    init_logging(&args);

    if !addr.ip().is_loopback() && !args.allow_remote {
        error!(event = "invalid_addr", addr = %addr, reason = "non-loopback bind needs --allow-remote");
        std::process::exit(2);
    }

    let config = HubConfig {
        addr,
        allow_remote: args.allow_remote,
        heartbeat: HeartbeatConfig {
            ping_interval: Duration::from_secs(args.ping_interval),
            pong_timeout: Duration::from_secs(args.pong_timeout),
            check_interval: Duration::from_millis(args.check_interval_ms),
        },
        write_timeout: Duration::from_secs(args.write_timeout),
        queue_capacity: args.queue_capacity,
        max_message_bytes: args.max_message_bytes,
        mcp_policy: args.mcp_policy,
        routes: RouteTable::new(
            &or_defaults(args.state_types, DEFAULT_STATE_TYPES),
            &or_defaults(args.pull_types, DEFAULT_PULL_TYPES),
            &or_defaults(args.push_types, DEFAULT_PUSH_TYPES),
        ),
        debug,
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!(event = "ctrl_c");
        let _ = shutdown_tx.send(true);
    });

    if let Err(err) = figlink_hub::run(config, shutdown_rx).await {
        error!(event = "hub_error", error = %err);
        std::process::exit(1);
    }
}

fn or_defaults(values: Vec<String>, defaults: &[&str]) -> Vec<String> {
    if values.is_empty() {
        defaults.iter().map(|value| value.to_string()).collect()
    } else {
        values
    }
}

fn default_addr() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_PORT))
}

fn init_logging(args: &Args) {
    let level = if args.debug { "debug" } else { args.log_level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let log_file = args
        .log_dir
        .as_deref()
        .map(|dir| open_log_file(dir, args.addr))
        .transpose();
    let (writer, file_error) = match log_file {
        Ok(Some(file)) => (BoxMakeWriter::new(io::stdout.and(Arc::new(file))), None),
        Ok(None) => (BoxMakeWriter::new(io::stdout), None),
        Err(err) => (BoxMakeWriter::new(io::stdout), Some(err)),
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .try_init();
    if let Some(err) = file_error {
        error!(event = "log_file_error", error = %err);
    }
}

/// One file per listening address, so hubs on different ports sharing a
/// log directory never interleave.
fn log_file_name(addr: SocketAddr) -> String {
    let host: String = addr
        .ip()
        .to_string()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    format!("figlink-hub-{host}_{}.log", addr.port())
}

fn open_log_file(dir: &Path, addr: SocketAddr) -> io::Result<fs::File> {
    fs::create_dir_all(dir)?;
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(log_file_name(addr)))
}
