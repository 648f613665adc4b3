//! hwbeat - host metrics beat
//!
//! Polls CPU, memory and load metrics on a fixed period and ships them as
//! JSON events to the configured output until it is told to stop.

use anyhow::{Context, Result};
use beat_lib::{
    config::LoggingConfig, observability::BeatMetrics, HealthRegistry, RunOutcome, Supervisor,
    BEAT_NAME,
};
use std::fs::OpenOptions;
use std::future::Future;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("{}: {:#}", BEAT_NAME, e);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<u8> {
    let config_path = config::config_path(std::env::args().skip(1));
    let config = config::load(&config_path)?;
    init_tracing(&config.logging)?;

    info!(config = %config_path.display(), host = %config.name, "Configuration loaded");

    // Handlers are installed before readiness is announced
    let signal = shutdown_signal()?;

    let health_registry = HealthRegistry::new();
    let supervisor = Supervisor::new(config.clone()).with_health(health_registry.clone());

    let api_handle = if config.http.enabled {
        let app_state = Arc::new(api::AppState::new(
            health_registry,
            BeatMetrics::new(),
            supervisor.state(),
        ));
        Some(tokio::spawn(api::serve(
            config.http.host.clone(),
            config.http.port,
            app_state,
        )))
    } else {
        None
    };

    let outcome = supervisor
        .run(async move {
            let name = signal.await;
            info!(signal = name, "Shutdown requested");
        })
        .await;

    if let Some(handle) = api_handle {
        handle.abort();
    }

    match &outcome {
        RunOutcome::Clean => {}
        RunOutcome::DrainTimedOut { dropped_events } => {
            error!(dropped_events = dropped_events, "Exiting with undelivered events")
        }
        RunOutcome::Fatal(err) => error!(error = %err, "Exiting after fatal error"),
    }

    Ok(outcome.exit_code().clamp(0, 255) as u8)
}

/// Install the tracing subscriber: stdout always, plus a JSON log file when configured
fn init_tracing(logging: &LoggingConfig) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let stdout_layer = if logging.json {
        fmt::layer().json().boxed()
    } else {
        fmt::layer().boxed()
    };

    let file_layer = match logging.log_file(BEAT_NAME) {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create log directory {}", parent.display()))?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            Some(
                fmt::layer()
                    .json()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file))
                    .boxed(),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init()
        .context("Failed to install tracing subscriber")
}

#[cfg(unix)]
fn shutdown_signal() -> Result<impl Future<Output = &'static str>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt =
        signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
    let mut terminate =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

    Ok(async move {
        tokio::select! {
            _ = interrupt.recv() => "SIGINT",
            _ = terminate.recv() => "SIGTERM",
        }
    })
}

#[cfg(not(unix))]
fn shutdown_signal() -> Result<impl Future<Output = &'static str>> {
    Ok(async {
        let _ = tokio::signal::ctrl_c().await;
        "ctrl-c"
    })
}
