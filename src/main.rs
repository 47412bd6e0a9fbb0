use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use webporizer::bot::branch::BranchNamer;
use webporizer::bot::checkout::GitCheckout;
use webporizer::bot::github::GitHubClient;
use webporizer::bot::pipeline::{Orchestrator, PipelineSettings};
use webporizer::bot::server::{self, AppState};
use webporizer::bot::transform::TransformEngine;
use webporizer::config::BotConfig;

#[derive(Parser)]
#[command(name = "webporizer")]
#[command(version, about = "GitHub bot that converts merged images to WebP and opens a follow-up pull request")]
pub struct Cli {
    /// Port to listen on (overrides config and PORT)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Path to a TOML config file (default: ./webporizer.toml when present)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    #[arg(short, long)]
    pub verbose: bool,

    /// Emit newline-delimited JSON logs
    #[arg(long)]
    pub json_logs: bool,
}

fn init_tracing(verbose: bool, json: bool) {
    let default = if verbose {
        "webporizer=debug,tower_http=debug"
    } else {
        "webporizer=info,tower_http=info"
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json())
            .try_init()
            .ok();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer())
            .try_init()
            .ok();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.json_logs);

    let mut config = BotConfig::load_layered(cli.config.as_deref())?;
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    for warning in config.validate() {
        tracing::warn!("{}", warning);
    }

    let token = config.require_token()?.to_string();
    let webhook_secret = config.require_webhook_secret()?.to_string();

    let client = GitHubClient::new(&config.github.api_url, &token, config.stage_timeout())
        .context("Failed to build GitHub client")?;
    let authenticated = match client.whoami().await {
        Ok(login) => {
            tracing::info!(%login, api = %config.github.api_url, "authenticated");
            Some(login)
        }
        Err(e) => {
            tracing::warn!(error = %e, bot_login = config.bot_login(), "could not resolve bot identity");
            None
        }
    };
    let (filter, mismatch) = config.event_filter(authenticated.as_deref());
    if let Some(warning) = mismatch {
        tracing::warn!("{}", warning);
    }

    let greeting = match config.greeting() {
        Ok(text) => Some(text),
        Err(e) => {
            tracing::warn!(error = %format!("{:#}", e), "greeting disabled");
            None
        }
    };

    let orchestrator = Orchestrator::new(
        filter,
        Arc::new(BranchNamer::new(config.pipeline.branch_prefix.clone())),
        Arc::new(client),
        Arc::new(GitCheckout::new(&config.github.api_url, &token)),
        Arc::new(TransformEngine::webp(
            &config.transform.image_extensions,
            &config.transform.markup_extensions,
        )),
        PipelineSettings::from_config(&config, greeting),
    );

    let state = Arc::new(AppState {
        orchestrator: Arc::new(orchestrator),
        webhook_secret,
    });

    server::start_server(state, config.server.port, &config.server.webhook_path).await
}
