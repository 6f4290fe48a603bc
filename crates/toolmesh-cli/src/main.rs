//! Command-line interface for toolmesh

mod output;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use toolmesh_core::{
    Arguments, CallOptions, FanoutPolicy, LoadBalancingPolicy, MeshClient, MeshConfig,
};
use toolmesh_utils::{LogFormat, LogSettings};
use tracing::{debug, info};

#[derive(Parser, Debug)]
#[command(name = "toolmesh", version)]
#[command(about = "Route MCP tool calls across many servers", long_about = None)]
struct Cli {
    /// Configuration file (defaults to ~/.config/toolmesh/config.json
    /// merged with ./toolmesh.json)
    #[arg(long, short = 'c', global = true)]
    config: Option<PathBuf>,

    /// Log output: pretty, compact or json
    #[arg(long, global = true, default_value = "compact")]
    log_format: LogFormat,

    /// More logging (-v debug, -vv trace)
    #[arg(long, short = 'v', global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect to every configured server and list the registry
    Servers,

    /// Ask every server for its tools
    Discover {
        /// Per-server timeout
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Show which server a call would go to
    Route {
        capability: String,

        #[arg(long)]
        policy: Option<LoadBalancingPolicy>,
    },

    /// Call a capability and print the JSON result
    Call {
        capability: String,

        /// Arguments as a JSON object
        #[arg(long, short = 'a', default_value = "{}")]
        args: String,

        /// Send to every eligible server: first-success, all or best-of
        #[arg(long)]
        fanout: Option<FanoutPolicy>,

        #[arg(long)]
        policy: Option<LoadBalancingPolicy>,

        /// Per-attempt timeout
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Extra attempts on other servers
        #[arg(long)]
        retries: Option<u32>,
    },
}

fn log_settings(cli: &Cli) -> LogSettings {
    let level = match cli.verbose {
        0 => "warn,toolmesh_core=info",
        1 => "info,toolmesh_core=debug",
        _ => "debug,toolmesh_core=trace",
    };
    LogSettings::default()
        .with_level(level)
        .with_format(cli.log_format)
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<MeshConfig> {
    match path {
        Some(path) => MeshConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display())),
        None => MeshConfig::load_merged().context("loading merged configuration"),
    }
}

/// Cancel `token` on Ctrl-C
fn cancel_on_interrupt(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, cancelling");
            token.cancel();
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    toolmesh_utils::init_tracing_with(&log_settings(&cli))?;

    let config = load_config(cli.config.as_ref())?;
    debug!(servers = config.servers.len(), "Configuration loaded");

    let client = MeshClient::new(config)?;
    client.start().await?;

    let cancel = CancellationToken::new();
    cancel_on_interrupt(cancel.clone());

    let outcome = run(&client, cli.command, cancel).await;
    client.shutdown().await;
    outcome
}

async fn run(client: &MeshClient, command: Command, cancel: CancellationToken) -> anyhow::Result<()> {
    match command {
        Command::Servers => {
            output::print_servers(client);
        }
        Command::Discover { timeout_ms } => {
            let mut options = CallOptions::new().with_cancel(cancel);
            if let Some(ms) = timeout_ms {
                options = options.with_timeout(Duration::from_millis(ms));
            }
            let reports = client.discover(&options).await?;
            output::print_discovery(&reports);
        }
        Command::Route { capability, policy } => {
            let mut options = CallOptions::new();
            options.policy = policy;
            let decision = client.route(&capability, &options)?;
            println!("{}", serde_json::to_string_pretty(&decision)?);
        }
        Command::Call {
            capability,
            args,
            fanout,
            policy,
            timeout_ms,
            retries,
        } => {
            let args = Arguments::parse(&args).context("--args must be a JSON object")?;
            let mut options = CallOptions::new().with_cancel(cancel);
            options.policy = policy;
            options.max_retries = retries;
            options.timeout = timeout_ms.map(Duration::from_millis);

            match fanout {
                None => {
                    let done = client.execute_capability(&capability, args, &options).await?;
                    println!("{}", serde_json::to_string_pretty(&output::execution_json(&done))?);
                    if done.result.is_error {
                        bail!("{capability} reported a tool error on {}", done.server_id);
                    }
                }
                Some(policy) => {
                    let aggregated = client
                        .execute_fanout(&capability, args, &policy, &options)
                        .await?;
                    println!(
                        "{}",
                        serde_json::to_string_pretty(&output::aggregated_json(&aggregated))?
                    );
                }
            }
        }
    }
    Ok(())
}
