use crate::domain::model::{Machine, SshEndpoint};
use crate::domain::ports::{ExecStatus, RemoteShell};
use crate::utils::error::{Result, WkeError};
use crate::utils::logger::MachineLogger;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tokio::task::JoinSet;

/// One command on one machine.
#[derive(Debug, Clone)]
pub struct Task {
    /// Position of this task among all tasks of the same run.
    pub group_index: usize,
    /// Total number of tasks of the same run.
    pub group_size: usize,
    pub machine: Machine,
    /// Target or built-in this task belongs to.
    pub task_name: String,
    /// Name of the `.out`/`.err` files, unique among the tasks of a run.
    pub log_name: String,
    pub command: String,
    pub endpoint: SshEndpoint,
    pub log_dir: Option<PathBuf>,
    pub verbose: bool,
    pub debug: bool,
}

/// How a task ended.
#[derive(Debug)]
pub struct TaskOutcome {
    pub machine_name: String,
    /// Only set if the command finished and was not aborted.
    pub exit_code: Option<i32>,
    pub aborted: bool,
    /// Set when the command could not be run at all.
    pub error: Option<WkeError>,
}

impl Task {
    pub async fn run(self, shell: &dyn RemoteShell, abort: watch::Receiver<bool>) -> TaskOutcome {
        let mut outcome = TaskOutcome {
            machine_name: self.machine.name.clone(),
            exit_code: None,
            aborted: false,
            error: None,
        };

        match self.execute(shell, abort).await {
            Ok(ExecStatus::Exited(code)) => outcome.exit_code = Some(code),
            Ok(ExecStatus::Aborted) => outcome.aborted = true,
            Err(err) => outcome.error = Some(err),
        }
        outcome
    }

    async fn execute(&self, shell: &dyn RemoteShell, abort: watch::Receiver<bool>) -> Result<ExecStatus> {
        let mut logger = MachineLogger::new(self.log_dir.as_deref(), &self.log_name, self.verbose)?;

        if self.debug {
            logger.log_meta(&format!(
                "Executing command on \"{}\": {}",
                self.machine.name, self.command
            ));
        }

        let result = shell
            .execute(&self.endpoint, &self.command, &mut logger, abort)
            .await;
        logger.close();

        result.map_err(|err| {
            let message = match err {
                WkeError::RemoteExecutionError { message, .. } => message,
                other => other.to_string(),
            };
            WkeError::remote(&self.machine.name, &self.task_name, message)
        })
    }
}

/// Controls how `join_all` waits.
#[derive(Debug, Clone, Default)]
pub struct JoinSettings {
    /// Used in error messages.
    pub target: String,
    pub timeout: Option<Duration>,
    pub verbose: bool,
    /// Stop all machines on Ctrl-C or SIGTERM.
    pub handle_signals: bool,
    /// Stop all machines once this turns `true`.
    pub stop: Option<watch::Receiver<bool>>,
}

fn stop_all(abort: &watch::Sender<bool>) {
    abort.send_replace(true);
}

async fn deadline_reached(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Resolves on Ctrl-C or SIGTERM.
#[cfg(unix)]
async fn shutdown_signal() -> std::io::Result<()> {
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}

async fn stop_requested(stop: &mut Option<watch::Receiver<bool>>) {
    if let Some(rx) = stop {
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                break;
            }
        }
    }
    // no sender left, so a stop can never arrive
    std::future::pending::<()>().await
}

/// Runs all tasks concurrently and blocks until every one of them terminated.
///
/// The first failing machine stops all others. Returns the first task that
/// could not run at all, a `TimeoutError`, or a `RunTargetError` listing
/// every machine that exited with a non-zero code.
pub async fn join_all(
    tasks: Vec<Task>,
    shell: Arc<dyn RemoteShell>,
    settings: JoinSettings,
) -> Result<()> {
    let JoinSettings {
        target,
        timeout,
        verbose,
        handle_signals,
        mut stop,
    } = settings;

    let start = Instant::now();
    let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
    let (abort_tx, abort_rx) = watch::channel(false);

    let mut pending: Vec<String> = tasks.iter().map(|t| t.machine.name.clone()).collect();
    let mut set = JoinSet::new();
    for task in tasks {
        let shell = shell.clone();
        let abort = abort_rx.clone();
        set.spawn(async move { task.run(shell.as_ref(), abort).await });
    }

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    let mut errors = Vec::new();
    let mut first_failure: Option<WkeError> = None;
    let mut timed_out = false;
    let mut interrupted = false;
    let mut stopped = false;
    let mut any_aborted = false;

    loop {
        tokio::select! {
            joined = set.join_next() => {
                let Some(joined) = joined else { break };
                let outcome = match joined {
                    Ok(outcome) => outcome,
                    Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
                    Err(err) => {
                        tracing::warn!("Task was cancelled: {}", err);
                        continue;
                    }
                };

                if let Some(pos) = pending.iter().position(|name| *name == outcome.machine_name) {
                    pending.remove(pos);
                }
                any_aborted |= outcome.aborted;

                match outcome.error {
                    Some(err) => {
                        tracing::debug!("Task on {} failed: {}", outcome.machine_name, err);
                        first_failure.get_or_insert(err);
                        stop_all(&abort_tx);
                    }
                    None => {
                        if outcome.exit_code.is_none() && !outcome.aborted {
                            println!("⚠️  No exitcode for machine {}", outcome.machine_name);
                        }
                        if !outcome.aborted && outcome.exit_code != Some(0) {
                            let code = outcome
                                .exit_code
                                .map_or_else(|| "None".to_string(), |code| code.to_string());
                            errors.push(format!(
                                "Machine {} had non-zero exitcode {}",
                                outcome.machine_name, code
                            ));
                            stop_all(&abort_tx);
                        }
                    }
                }

                if verbose {
                    println!(
                        "ℹ️ Machine \"{}\" took {} seconds to complete.",
                        outcome.machine_name,
                        start.elapsed().as_secs_f64()
                    );
                    if !pending.is_empty() {
                        println!("Still pending: {}", pending.join(" "));
                    }
                }
            }
            _ = deadline_reached(deadline), if !timed_out => {
                println!("⚠️  Timeout reached: stopping machines");
                timed_out = true;
                stop_all(&abort_tx);
            }
            result = &mut shutdown, if handle_signals && !interrupted => {
                interrupted = true;
                match result {
                    Ok(()) => {
                        println!("🛑 Got kill signal. Stopping all machines...");
                        stop_all(&abort_tx);
                    }
                    Err(err) => tracing::warn!("Cannot listen for kill signals: {}", err),
                }
            }
            _ = stop_requested(&mut stop), if !stopped => {
                tracing::info!("Stop requested for \"{}\", stopping all machines", target);
                stopped = true;
                stop_all(&abort_tx);
            }
        }
    }

    if let Some(err) = first_failure {
        return Err(err);
    }

    if timed_out {
        return Err(WkeError::TimeoutError {
            target,
            seconds: timeout.map_or(0.0, |t| t.as_secs_f64()),
        });
    }

    if (interrupted || stopped) && any_aborted {
        errors.push("Stopped before all machines finished".to_string());
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(WkeError::RunTargetError { target, errors })
    }
}
