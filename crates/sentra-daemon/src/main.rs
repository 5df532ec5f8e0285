//! sentrad: launches sensor subprocesses, filters their event streams,
//! and routes surviving records to the configured exporters.

mod logging;

use clap::Parser;
use sentra_compose::Compose;
use sentra_core::FilterOperator;
use sentra_service::{Service, ServiceHandle};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};

/// Exit status when the service failed or shutdown reported errors.
const EXIT_STOP_FAILED: u8 = 75;

#[derive(Debug, Parser)]
#[command(
    name = "sentrad",
    version,
    about = "Local telemetry-collection daemon"
)]
struct Cli {
    /// Compose document declaring sensors, exporters, and pipelines.
    compose: PathBuf,
    /// Filter document with the allow/deny rules.
    filter: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let cwd = match std::env::current_dir() {
        Ok(dir) => dir,
        Err(err) => {
            eprintln!("cannot determine working directory: {err}");
            return ExitCode::FAILURE;
        }
    };
    let _logging = logging::init(&cwd);

    let compose = match Compose::load(&cli.compose) {
        Ok(compose) => Arc::new(compose),
        Err(err) => {
            error!(error = %err, "invalid compose document");
            eprintln!("invalid compose document: {err}");
            return ExitCode::FAILURE;
        }
    };

    let filter_text = match std::fs::read_to_string(&cli.filter) {
        Ok(text) => text,
        Err(err) => {
            error!(error = %err, "cannot read filter document");
            eprintln!("cannot read filter document: {err}");
            return ExitCode::FAILURE;
        }
    };
    let filter = match FilterOperator::from_yaml(&filter_text) {
        Ok(filter) => filter,
        Err(err) => {
            error!(error = %err, "invalid filter document");
            eprintln!("invalid filter document: {err}");
            return ExitCode::FAILURE;
        }
    };

    let service = match Service::new(Arc::clone(&compose), filter) {
        Ok(service) => service,
        Err(err) => {
            error!(error = %err, "failed to build service");
            eprintln!("failed to build service: {err}");
            return ExitCode::FAILURE;
        }
    };

    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(stream) => stream,
        Err(err) => {
            eprintln!("cannot install SIGINT handler: {err}");
            return ExitCode::FAILURE;
        }
    };
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(err) => {
            eprintln!("cannot install SIGTERM handler: {err}");
            return ExitCode::FAILURE;
        }
    };

    let handle = match service.start().await {
        Ok(handle) => handle,
        Err(err) => {
            error!(error = %err, "failed to start service");
            eprintln!("failed to start service: {err}");
            return ExitCode::FAILURE;
        }
    };
    info!(group = %compose.service.group, machine = %compose.service.machine, "service running");

    let exit = tokio::select! {
        outcome = handle.wait() => match outcome {
            Ok(()) => ExitCode::SUCCESS,
            Err(err) => {
                error!(error = %err, "service failed");
                eprintln!("service failed: {err}");
                ExitCode::from(EXIT_STOP_FAILED)
            }
        },
        _ = sigint.recv() => {
            info!("received SIGINT, shutting down");
            shutdown(&handle).await
        }
        _ = sigterm.recv() => {
            info!("received SIGTERM, shutting down");
            shutdown(&handle).await
        }
    };

    println!("service stopped");
    exit
}

async fn shutdown(handle: &ServiceHandle) -> ExitCode {
    println!("shutting down...");
    let mut exit = ExitCode::SUCCESS;
    if let Err(err) = handle.stop().await {
        error!(error = %err, "errors during stop");
        eprintln!("errors during stop: {err}");
        exit = ExitCode::from(EXIT_STOP_FAILED);
    }
    if let Err(err) = handle.wait().await {
        error!(error = %err, "service reported failure");
        eprintln!("service failed: {err}");
        exit = ExitCode::from(EXIT_STOP_FAILED);
    }
    exit
}
