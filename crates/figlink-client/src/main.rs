use anyhow::{anyhow, bail, Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use figlink_client::{
    CommandClient, CommandClientConfig, ConnectionState, RpcClient, RpcClientConfig,
    DEFAULT_HUB_URL,
};
use figlink_core::{extract_access_token, now_ms, BackoffPolicy, ConnectionIdentity, Envelope};
use serde_json::{json, Value};
use std::{env, io, time::Duration};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use url::Url;

#[derive(Parser, Debug)]
#[command(name = "figlink-client", about = "Talk to a figlink hub from the command line")]
struct Cli {
    #[arg(long, global = true, default_value = "")]
    hub_url: String,
    /// Access token, or an `Authorization` value such as `Bearer <token>`.
    #[arg(long, global = true, default_value = "")]
    token: String,
    #[arg(long, global = true, default_value_t = false)]
    debug: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send one correlated request as `mcp_<token>` and print the response.
    Request(RequestArgs),
    /// Act as a plugin peer: join a channel, announce state and answer
    /// relayed requests.
    Plugin(PluginArgs),
}

#[derive(ClapArgs, Debug)]
struct RequestArgs {
    /// Message type, e.g. `get_selection`.
    kind: String,
    #[arg(long, default_value = "{}")]
    data: String,
    /// 0 waits without bound.
    #[arg(long, default_value_t = 30_000)]
    timeout_ms: u64,
}

#[derive(ClapArgs, Debug)]
struct PluginArgs {
    #[arg(long)]
    channel: String,
    #[arg(long)]
    device_id: Option<u64>,
    #[arg(long, default_value_t = 1000)]
    backoff_ms: u64,
    #[arg(long, default_value_t = 10)]
    max_attempts: u32,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug);
    let hub_url = resolve_hub_url(&cli.hub_url)?;
    let token = resolve_token(&cli.token)?;

    match cli.command {
        Command::Request(args) => run_request(hub_url, &token, args).await,
        Command::Plugin(args) => run_plugin(hub_url, &token, args).await,
    }
}

async fn run_request(hub_url: Url, token: &str, args: RequestArgs) -> Result<()> {
    let payload: Value = serde_json::from_str(&args.data).context("--data is not valid JSON")?;
    let identity = ConnectionIdentity::mcp(token);
    let client = RpcClient::new(RpcClientConfig::new(hub_url, identity.connection_id()))?;
    let timeout = (args.timeout_ms > 0).then(|| Duration::from_millis(args.timeout_ms));

    let response = client.request(&args.kind, payload, timeout).await?;
    println!("{}", serde_json::to_string_pretty(&response)?);
    client.disconnect().await;
    Ok(())
}

async fn run_plugin(hub_url: Url, token: &str, args: PluginArgs) -> Result<()> {
    let device_id = args
        .device_id
        .unwrap_or_else(|| u64::try_from(now_ms()).unwrap_or_default());
    let identity = ConnectionIdentity::plugin(token, device_id);
    let config = CommandClientConfig {
        backoff: BackoffPolicy::new(
            Duration::from_millis(args.backoff_ms),
            args.max_attempts,
        )
        .with_max_delay(Duration::from_secs(30)),
        ..CommandClientConfig::new(hub_url, identity.connection_id())
    };
    let client = CommandClient::start(config)?;
    let mut states = client.state_changes();
    let mut inbound = client.events();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!(event = "ctrl_c");
                break;
            }
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *states.borrow_and_update();
                info!(event = "state", state = %state);
                match state {
                    ConnectionState::Connected => {
                        if let Err(err) = client.join(&args.channel).await {
                            warn!(event = "join_failed", error = %err);
                            continue;
                        }
                        if let Err(err) = client
                            .send("state", json!({ "channel": args.channel }))
                            .await
                        {
                            warn!(event = "announce_failed", error = %err);
                        }
                    }
                    ConnectionState::Failed => {
                        client.shutdown().await;
                        bail!("gave up reconnecting to the hub");
                    }
                    _ => {}
                }
            }
            received = inbound.recv() => {
                let Ok(envelope) = received else {
                    continue;
                };
                answer(&client, envelope).await;
            }
        }
    }
    client.shutdown().await;
    Ok(())
}

/// Prints relayed traffic and acknowledges relayed requests with their data.
async fn answer(client: &CommandClient, envelope: Envelope) {
    println!("{}", serde_json::to_string(&envelope).unwrap_or_default());
    if envelope.request_id.is_none() {
        return;
    }
    let data = json!({ "echo": envelope.data, "receivedType": envelope.kind });
    if let Err(err) = client.reply(&envelope, "result", data).await {
        warn!(event = "reply_failed", error = %err);
    }
}

fn init_logging(debug: bool) {
    let level = if debug {
        "debug".to_string()
    } else {
        env::var("FIGLINK_LOG_LEVEL").unwrap_or_else(|_| "info".to_string())
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

fn resolve_hub_url(flag: &str) -> Result<Url> {
    if !flag.trim().is_empty() {
        return Url::parse(flag).context("invalid --hub-url");
    }
    if let Ok(value) = env::var("FIGLINK_HUB_URL") {
        if !value.trim().is_empty() {
            return Url::parse(&value).context("invalid FIGLINK_HUB_URL");
        }
    }
    if let Ok(value) = env::var("FIGLINK_HUB_ADDR") {
        if !value.trim().is_empty() {
            return Url::parse(&format!("ws://{}", value.trim())).context("invalid FIGLINK_HUB_ADDR");
        }
    }
    Ok(Url::parse(DEFAULT_HUB_URL)?)
}

fn resolve_token(flag: &str) -> Result<String> {
    let raw = if flag.trim().is_empty() {
        env::var("FIGLINK_TOKEN").unwrap_or_default()
    } else {
        flag.to_string()
    };
    extract_access_token(&raw)
        .map(str::to_string)
        .ok_or_else(|| anyhow!("an access token is required (--token or FIGLINK_TOKEN)"))
}
