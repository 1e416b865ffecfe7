use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use toolhub::config::{find_config_path, load_hub_config, HubConfig};
use toolhub::logging::init_tracing;
use toolhub::pool::{CallerIdentity, PoolManager};

#[derive(Parser)]
#[command(
    name = "toolhub",
    version,
    about = "Pool MCP backends behind one namespaced tool catalog"
)]
struct Cli {
    /// Path to toolhub.yaml / toolhub.json. Searched upward from the current
    /// directory when omitted.
    #[arg(long, short, global = true, env = "TOOLHUB_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start every backend and keep the pool up until Ctrl-C
    Run,
    /// Start the pool, print per-backend status as JSON, and stop
    Status,
    /// Print the capability catalog as JSON
    List {
        /// Only show capabilities a caller with these scopes may use
        #[arg(long = "scope")]
        scopes: Vec<String>,
    },
    /// Call one namespaced capability and print its result
    Call {
        /// Namespaced capability name, e.g. `files_read`
        name: String,
        /// Arguments as a JSON object
        #[arg(long, default_value = "{}")]
        args: String,
        /// Caller scopes. Without any, no permission filtering is applied.
        #[arg(long = "scope")]
        scopes: Vec<String>,
        #[arg(long, default_value = "cli")]
        caller: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_config(cli.config.as_deref())?;
    init_tracing(&config.logging).context("failed to initialize logging")?;

    let pool = PoolManager::new(config.backends.clone(), config.pool_settings());

    let outcome = run_command(&pool, cli.command).await;
    pool.stop_all().await;
    outcome
}

fn load_config(explicit: Option<&std::path::Path>) -> Result<HubConfig> {
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => {
            let cwd = std::env::current_dir().context("failed to read current directory")?;
            find_config_path(&cwd)?
        }
    };
    load_hub_config(&path).with_context(|| format!("failed to load {}", path.display()))
}

async fn run_command(pool: &PoolManager, command: Command) -> Result<()> {
    let report = pool.start_all().await;
    for (backend, err) in &report.failed {
        tracing::warn!(backend = %backend, error = %err, "backend unavailable");
    }

    match command {
        Command::Run => {
            tracing::info!(
                backends = pool.backend_ids().len(),
                capabilities = pool.capability_count(),
                "toolhub running, press Ctrl-C to stop"
            );
            tokio::signal::ctrl_c()
                .await
                .context("failed to listen for Ctrl-C")?;
            tracing::info!("shutdown requested");
        }
        Command::Status => {
            println!("{}", serde_json::to_string_pretty(&pool.status())?);
        }
        Command::List { scopes } => {
            let caller = caller_from(&scopes, "cli");
            let catalog = pool.get_capabilities_for(caller.as_ref());
            println!("{}", serde_json::to_string_pretty(&catalog)?);
        }
        Command::Call {
            name,
            args,
            scopes,
            caller,
        } => {
            let arguments: serde_json::Value =
                serde_json::from_str(&args).context("--args must be valid JSON")?;
            let caller = caller_from(&scopes, &caller);
            let result = pool.dispatch(&name, arguments, caller.as_ref()).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
    }
    Ok(())
}

fn caller_from(scopes: &[String], id: &str) -> Option<CallerIdentity> {
    if scopes.is_empty() {
        None
    } else {
        Some(CallerIdentity::new(id, scopes.iter().cloned()))
    }
}
