// ------------------------------------------------------------
// Module declarations
// ------------------------------------------------------------
//
// - cli:       command line flags
// - config:    key = value configuration file
// - error:     typed errors for documents, transport and cycles
// - document:  normalized JSON collector output
// - schema:    server response shapes
// - util:      path helpers
// - collector: registry, discovery, execution and the cycle runner
// - transport: HTTP delivery to the central server
//
mod cli;
mod collector;
mod config;
mod document;
mod error;
mod schema;
mod transport;
mod util;

use std::io::Write;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use log::{error, info, warn};
use nix::unistd::geteuid;

use cli::Cli;
use collector::runner::Application;
use config::Config;
use transport::HttpTransport;

const VERSION: &str = env!("CARGO_PKG_VERSION");

// ------------------------------------------------------------
// Application entry point
// ------------------------------------------------------------
//
// Three modes:
// - test key: print one collector's document, push nothing
// - one-shot: a single cycle; success only when it completed
// - daemon:   cycles forever until a signal or a fatal error
//
#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    if !cli.without_root && !geteuid().is_root() {
        if cli.test_key.is_some() {
            warn!("main: not running as root; collector output may be incomplete");
        } else {
            error!("main: refusing to run as non-root without --without-root");
            return Ok(ExitCode::FAILURE);
        }
    }

    let config = Config::load(&cli.config)?;
    let transport = Arc::new(HttpTransport::new(VERSION)?);
    let app = Application::new(config, VERSION, transport);

    if let Some(key) = &cli.test_key {
        let document = app.collect_one(key).await?;
        if document.is_empty() {
            error!("main: collector {key} returned nothing");
            return Ok(ExitCode::FAILURE);
        }
        let mut stdout = std::io::stdout().lock();
        stdout.write_all(document.as_str().as_bytes())?;
        stdout.flush()?;
        return Ok(ExitCode::SUCCESS);
    }

    if cli.one_shot {
        let outcome = app.run_cycle().await?;
        info!("main: one-shot finished: {outcome:?}");
        return Ok(if outcome.is_complete() {
            ExitCode::SUCCESS
        } else {
            ExitCode::FAILURE
        });
    }

    info!(
        "main: hostcollect {VERSION} started; interval {}s",
        app.config().interval.as_secs()
    );

    tokio::select! {
        fatal = app.run_forever() => {
            error!("main: stopping: {fatal}");
            Ok(ExitCode::FAILURE)
        }
        _ = shutdown_signal() => {
            info!("main: shutting down");
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            warn!("main: cannot listen for SIGTERM: {e}");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}
