mod face;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use dotenvy::dotenv;
use tabpilot::brain::openai::ResponsesClient;
use tabpilot::hands::chrome::{ChromeHost, ChromeOptions, discover_debugger};
use tabpilot::{Agent, AgentConfig, AlwaysInvoke, TerminalStatus};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "agent", version, about = "Drives a Chrome tab to accomplish a task")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Steps before the session stops as budget-exhausted.
    #[arg(long, global = true)]
    max_steps: Option<usize>,

    /// Consecutive error steps that abort the session.
    #[arg(long, global = true)]
    error_threshold: Option<u32>,

    #[arg(long, global = true)]
    model: Option<String>,

    /// DevTools endpoint of a running Chrome (http://host:port or ws://...).
    #[arg(long, global = true)]
    attach: Option<String>,

    /// Launch Chrome headless when no running Chrome is attached.
    #[arg(long, global = true)]
    headless: bool,

    #[arg(long, global = true)]
    chrome_path: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Run one task and exit.
    Run {
        /// What to do, in plain words.
        #[arg(required = true)]
        goal: Vec<String>,
    },
    /// Accept tasks over HTTP and stream progress as server-sent events.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    // Fail before Chrome starts rather than on the first step.
    ResponsesClient::from_config(&config)?;

    let host = launch_chrome(&cli, &config).await?;
    let agent = Agent::new(config.clone(), host.clone(), host.clone(), host.clone());

    match cli.command {
        Command::Run { goal } => {
            let task = goal.join(" ");
            let outcome = run_task(&agent, &host, &config, &task).await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            if outcome.status != TerminalStatus::Complete {
                bail!("task ended as {:?}: {}", outcome.status, outcome.message);
            }
        }
        Command::Serve => {
            let (mut cmd_rx, port) =
                face::start_server(agent.event_sender(), Arc::new(AlwaysInvoke)).await?;
            info!(port, "waiting for commands");
            while let Some(task) = cmd_rx.recv().await {
                match run_task(&agent, &host, &config, &task).await {
                    Ok(outcome) => info!(status = ?outcome.status, "task finished"),
                    Err(e) => error!(error = %format!("{e:#}"), "task could not start"),
                }
            }
        }
    }

    Ok(())
}

fn load_config(cli: &Cli) -> Result<AgentConfig> {
    let mut config = AgentConfig::from_env()?;
    if let Some(max_steps) = cli.max_steps {
        config.max_steps = max_steps;
    }
    if let Some(threshold) = cli.error_threshold {
        config.error_threshold = threshold;
    }
    if let Some(model) = &cli.model {
        config.model = model.clone();
    }
    config.validate()?;
    Ok(config)
}

async fn launch_chrome(cli: &Cli, config: &AgentConfig) -> Result<Arc<ChromeHost>> {
    let endpoint = cli.attach.as_deref().unwrap_or(&config.chrome_debug_url);
    let attach_url = discover_debugger(endpoint).await;
    if attach_url.is_none() {
        if cli.attach.is_some() {
            warn!(endpoint, "no Chrome answers at the attach endpoint");
        }
        info!("launching Chrome...");
    }

    let options = ChromeOptions {
        attach_url,
        headless: cli.headless,
        chrome_path: cli.chrome_path.clone(),
    };
    let host = tokio::task::spawn_blocking(move || ChromeHost::launch(&options))
        .await
        .map_err(|e| anyhow!("Browser launch panicked: {e}"))??;
    Ok(Arc::new(host))
}

async fn run_task(
    agent: &Agent,
    host: &Arc<ChromeHost>,
    config: &AgentConfig,
    task: &str,
) -> Result<tabpilot::SessionOutcome> {
    let service = ResponsesClient::from_config(config)?;
    let chrome = host.clone();
    let tab = tokio::task::spawn_blocking(move || chrome.initial_tab())
        .await
        .map_err(|e| anyhow!("tab lookup panicked: {e}"))?
        .context("no usable tab")?;
    Ok(agent.run(task, tab, Box::new(service)).await)
}
