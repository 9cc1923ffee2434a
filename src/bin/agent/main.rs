mod face;
mod operator;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dotenvy::dotenv;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use webpilot::chrome::ChromePage;
use webpilot::config::{AgentConfig, DEFAULT_CONFIG_FILE};
use webpilot::llm::OpenAiModel;
use webpilot::{ActionExecutor, BrowserPage, Navigator, Pilot, RunResult};

#[derive(Parser, Debug)]
#[command(name = "agent", version, about = "Goal-driven web agent")]
struct Cli {
    /// TOML configuration file; defaults apply if it does not exist.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Drive a local Chrome until the objective is finished.
    Run {
        objective: String,
        #[arg(long)]
        start_url: Option<String>,
        #[arg(long)]
        headless: bool,
        #[arg(long)]
        max_turns: Option<usize>,
        /// Attach a screenshot to every decision.
        #[arg(long)]
        vision: bool,
    },
    /// Serve the session API for an external executor.
    Serve {
        #[arg(long)]
        bind: Option<String>,
    },
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let mut config = AgentConfig::load(&cli.config)?;

    match cli.command {
        Command::Run {
            objective,
            start_url,
            headless,
            max_turns,
            vision,
        } => {
            if start_url.is_some() {
                config.browser.start_url = start_url;
            }
            config.browser.headless |= headless;
            config.features.vision_enabled |= vision;
            if let Some(max_turns) = max_turns {
                config.turn.max_turns = max_turns;
            }
            run(objective, config).await
        }
        Command::Serve { bind } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            serve(config).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn run(objective: String, config: AgentConfig) -> Result<ExitCode> {
    info!(%objective, model = %config.model.model, "starting agent");
    let model = Arc::new(OpenAiModel::from_config(&config.model)?);

    // Launching can take a while and headless_chrome blocks.
    let browser_config = config.browser.clone();
    let page = tokio::task::spawn_blocking(move || ChromePage::launch(&browser_config))
        .await
        .context("browser launch panicked")??;

    if let Some(url) = &config.browser.start_url {
        info!(%url, "opening start page");
        page.navigate(url).await?;
    }

    let navigator = Navigator::from_config(model, &config);
    let executor = ActionExecutor::new(page, config.executor.clone());
    let operator = Arc::new(operator::StdinOperator::spawn());
    let mut pilot = Pilot::new(objective, navigator, executor, operator, config.turn.clone())
        .with_vision(config.features.vision_enabled);

    let code = match pilot.run().await {
        RunResult::Finished(status) => {
            info!(%status, "objective finished");
            ExitCode::SUCCESS
        }
        RunResult::Failed(status) => {
            error!(%status, "agent failed");
            ExitCode::FAILURE
        }
        RunResult::TurnLimit(max_turns) => {
            warn!(max_turns, "stopped at the turn limit");
            ExitCode::FAILURE
        }
        RunResult::NoAction => {
            warn!("agent proposed no action");
            ExitCode::FAILURE
        }
    };
    info!(actions = pilot.history().len(), "run complete");
    Ok(code)
}

async fn serve(config: AgentConfig) -> Result<()> {
    let model = Arc::new(OpenAiModel::from_config(&config.model)?);
    let navigator = Navigator::from_config(model, &config);
    let state = face::AppState::new(navigator, config.features.vision_enabled);
    face::serve(&config.server.bind, state).await
}
