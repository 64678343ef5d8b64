use crate::domain::model::SshEndpoint;
use crate::domain::ports::RemoteShell;
use crate::utils::error::{Result, WkeError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

pub const LOADS_FILE: &str = "loads.csv";
pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

const LOADAVG_PATH: &str = "/proc/loadavg";

/// One row of `loads.csv`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadSample {
    pub machine: String,
    pub timestamp: String,
    pub load1: f64,
    pub load5: f64,
    pub load15: f64,
}

impl LoadSample {
    /// Parses the first three fields of `/proc/loadavg`.
    pub fn parse(machine: &str, timestamp: String, loadavg: &str) -> Option<Self> {
        let mut fields = loadavg.split_whitespace().map(str::parse::<f64>);
        Some(Self {
            machine: machine.to_string(),
            timestamp,
            load1: fields.next()?.ok()?,
            load5: fields.next()?.ok()?,
            load15: fields.next()?.ok()?,
        })
    }
}

/// Samples the load of one machine in the background and writes it to
/// `<log_dir>/loads.csv`.
pub struct DataCollector {
    machine: String,
    output: PathBuf,
    stop: watch::Sender<bool>,
    ready: Option<oneshot::Receiver<Result<()>>>,
    handle: JoinHandle<Result<usize>>,
}

impl DataCollector {
    pub fn start(
        shell: Arc<dyn RemoteShell>,
        machine: &str,
        endpoint: SshEndpoint,
        log_dir: &Path,
        interval: Duration,
    ) -> Self {
        let output = log_dir.join(LOADS_FILE);
        let (stop_tx, stop_rx) = watch::channel(false);
        let (ready_tx, ready_rx) = oneshot::channel();

        let handle = tokio::spawn(collect(
            shell,
            machine.to_string(),
            endpoint,
            output.clone(),
            interval,
            stop_rx,
            ready_tx,
        ));

        Self {
            machine: machine.to_string(),
            output,
            stop: stop_tx,
            ready: Some(ready_rx),
            handle,
        }
    }

    pub fn machine(&self) -> &str {
        &self.machine
    }

    pub fn output(&self) -> &Path {
        &self.output
    }

    /// Blocks until the first sample was written.
    pub async fn wait_ready(&mut self) -> Result<()> {
        let Some(ready) = self.ready.take() else {
            return Ok(());
        };

        match ready.await {
            Ok(result) => result,
            Err(_) => Err(WkeError::MeasurementFailed {
                message: format!("Data collection on {} stopped unexpectedly", self.machine),
            }),
        }
    }

    /// Stops sampling and returns the number of rows written.
    pub async fn stop(self) -> Result<usize> {
        self.stop.send_replace(true);
        match self.handle.await {
            Ok(result) => result,
            Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
            Err(_) => Ok(0),
        }
    }
}

async fn collect(
    shell: Arc<dyn RemoteShell>,
    machine: String,
    endpoint: SshEndpoint,
    output: PathBuf,
    interval: Duration,
    mut stop: watch::Receiver<bool>,
    ready: oneshot::Sender<Result<()>>,
) -> Result<usize> {
    let mut ready = Some(ready);
    let mut writer = match csv::Writer::from_path(&output) {
        Ok(writer) => writer,
        Err(err) => {
            if let Some(ready) = ready.take() {
                let _ = ready.send(Err(err.into()));
            }
            return Ok(0);
        }
    };

    let mut ticker = tokio::time::interval(interval);
    let mut samples = 0;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
                continue;
            }
        }

        let timestamp = chrono::Local::now().to_rfc3339();
        let sample = match shell.read_file(&endpoint, LOADAVG_PATH).await {
            Ok(content) => LoadSample::parse(&machine, timestamp, &content).ok_or_else(|| {
                WkeError::MeasurementFailed {
                    message: format!("Cannot parse {}: {}", LOADAVG_PATH, content.trim()),
                }
            }),
            Err(err) => Err(err),
        };

        match sample {
            Ok(sample) => {
                writer.serialize(&sample)?;
                writer.flush()?;
                samples += 1;
                if let Some(ready) = ready.take() {
                    let _ = ready.send(Ok(()));
                }
            }
            Err(err) => match ready.take() {
                Some(ready) => {
                    let _ = ready.send(Err(err));
                    return Ok(samples);
                }
                None => tracing::warn!("Failed to sample load on {}: {}", endpoint.host, err),
            },
        }
    }

    writer.flush()?;
    Ok(samples)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_loadavg() {
        let sample =
            LoadSample::parse("node1", "t".to_string(), "0.52 0.58 0.59 2/1024 12345\n").unwrap();
        assert_eq!(sample.machine, "node1");
        assert_eq!(sample.load1, 0.52);
        assert_eq!(sample.load5, 0.58);
        assert_eq!(sample.load15, 0.59);
    }

    #[test]
    fn test_parse_loadavg_rejects_garbage() {
        assert!(LoadSample::parse("node1", "t".to_string(), "").is_none());
        assert!(LoadSample::parse("node1", "t".to_string(), "cat: /proc/loadavg: No such file").is_none());
    }
}
