use anyhow::Result;
use clap::Parser;
use json_export_translator::cli::Cli;
use json_export_translator::client::InferenceClient;
use json_export_translator::config::Config;
use json_export_translator::orchestrator::{Orchestrator, RunSummary};
use json_export_translator::progress::ProgressLog;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env file (ignored when variables come from the environment)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("json_export_translator=info")),
        )
        .init();

    let (config, client) = match setup(&cli) {
        Ok(parts) => parts,
        Err(e) => {
            error!("Configuration error: {:#}", e);
            return ExitCode::from(2);
        }
    };

    let log = match ProgressLog::open(&config.progress_log) {
        Ok(log) => log,
        Err(e) => {
            warn!(
                "Could not open progress log {}: {}. Continuing without it",
                config.progress_log.display(),
                e
            );
            ProgressLog::disabled()
        }
    };

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_on_ctrl_c(cancel.clone()));

    info!(
        "Translating {} into [{}] with model {}",
        config.todo_dir.display(),
        config.target_languages.join(", "),
        config.model
    );

    match Orchestrator::new(config, client, log, cancel).run().await {
        Ok(summary) => exit_code(&summary),
        Err(e) => {
            error!("Run aborted: {:#}", e);
            ExitCode::from(2)
        }
    }
}

fn setup(cli: &Cli) -> Result<(Config, InferenceClient)> {
    let config = Config::from_env()?.apply_cli(cli);
    config.validate()?;
    let client = InferenceClient::new(&config)?;
    Ok((config, client))
}

async fn shutdown_on_ctrl_c(cancel: CancellationToken) {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("Received Ctrl+C, finishing in-flight requests");
        cancel.cancel();
    }
}

fn exit_code(summary: &RunSummary) -> ExitCode {
    if summary.all_complete() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    }
}
