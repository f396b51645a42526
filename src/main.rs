use std::{future::Future, process::ExitCode};
use tokio::runtime::Runtime;
use tracing_subscriber::EnvFilter;

mod config;
mod errors;
mod handlers;
mod models;
mod services;

use config::{AppConfig, Command};
use handlers::{EXIT_ERROR, EXIT_INTERRUPTED, migration_handlers, status_handlers};

fn main() -> ExitCode {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // --- Parse config + command ---
    let (cfg, command) = match AppConfig::from_env_and_args() {
        Ok(parsed) => parsed,
        Err(err) => {
            tracing::error!("invalid configuration: {err:#}");
            return ExitCode::from(EXIT_ERROR);
        }
    };
    tracing::debug!(?command, "starting bucket-migrate with config: {:?}", cfg);

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            tracing::error!("cannot start the async runtime: {err}");
            return ExitCode::from(EXIT_ERROR);
        }
    };

    let work = async move {
        match command {
            Command::Run => migration_handlers::run(&cfg).await,
            Command::Status { json } => status_handlers::status(&cfg, json).await,
            Command::Reset { yes } => migration_handlers::reset(&cfg, yes).await,
            Command::SelfTest => migration_handlers::self_test().await,
        }
    };
    let interrupted = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!("cannot listen for Ctrl-C: {err}");
            std::future::pending::<()>().await;
        }
    };
    let code = run_until_interrupted(&runtime, work, interrupted);

    // A worker may still sit in a blocking stdin read; do not wait for it.
    runtime.shutdown_background();
    ExitCode::from(code)
}

/// Run `work` to completion unless `interrupted` resolves first.
fn run_until_interrupted<W, I>(runtime: &Runtime, work: W, interrupted: I) -> u8
where
    W: Future<Output = anyhow::Result<u8>> + Send + 'static,
    I: Future<Output = ()>,
{
    runtime.block_on(async move {
        // Spawned so a blocking confirmation prompt never stalls the signal branch.
        let work = tokio::spawn(work);

        // --- Run until done or interrupted ---
        tokio::select! {
            joined = work => match joined {
                Ok(Ok(code)) => code,
                Ok(Err(err)) => {
                    tracing::error!("{err:#}");
                    EXIT_ERROR
                }
                Err(err) => {
                    tracing::error!("migration task failed: {err}");
                    EXIT_ERROR
                }
            },
            _ = interrupted => {
                tracing::warn!("interrupted; progress is saved at the last checkpoint, run again to resume");
                EXIT_INTERRUPTED
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::EXIT_OK;
    use std::time::{Duration, Instant};

    fn runtime() -> Runtime {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap()
    }

    #[test]
    fn finished_work_returns_its_exit_code() {
        let runtime = runtime();
        let code = run_until_interrupted(&runtime, async { Ok(EXIT_OK) }, std::future::pending());
        runtime.shutdown_background();
        assert_eq!(code, EXIT_OK);
    }

    #[test]
    fn interrupt_does_not_wait_for_a_blocked_prompt() {
        let runtime = runtime();
        let started = Instant::now();
        let (entered_tx, entered_rx) = std::sync::mpsc::channel();
        let blocked = async move {
            let _ = entered_tx.send(());
            // Stands in for a stdin read nobody answers.
            std::thread::sleep(Duration::from_secs(30));
            Ok(EXIT_OK)
        };
        let interrupt = async move {
            let _ = entered_rx.recv();
        };
        let code = run_until_interrupted(&runtime, blocked, interrupt);
        runtime.shutdown_background();

        assert_eq!(code, EXIT_INTERRUPTED);
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
