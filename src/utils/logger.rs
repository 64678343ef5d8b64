use crate::domain::ports::OutputSink;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub fn init_cli_logger(verbose: bool) {
    let filter = if verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("wke=debug,info"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("wke=info"))
    };

    // A second initialisation (e.g. from tests) is not an error worth reporting
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .compact(),
        )
        .try_init();
}

/// Like `init_cli_logger`, but emits one JSON object per event, for runs
/// driven by scripts that collect the log.
pub fn init_json_logger(verbose: bool) {
    let filter = if verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("wke=debug,info"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("wke=info"))
    };

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .json(),
        )
        .try_init();
}

/// Collects the output of one task.
///
/// Lines are echoed to the terminal (stdout only in verbose mode, stderr
/// always) and, if a log directory is set, appended to `<name>.out` and
/// `<name>.err` inside it. `name` is the machine name, suffixed with the
/// task number when a machine runs several tasks.
pub struct MachineLogger {
    machine: String,
    verbose: bool,
    stdout_file: Option<BufWriter<File>>,
    stderr_file: Option<BufWriter<File>>,
}

impl MachineLogger {
    pub fn new(log_dir: Option<&Path>, machine: &str, verbose: bool) -> std::io::Result<Self> {
        let (stdout_file, stderr_file) = match log_dir {
            Some(dir) => {
                fs::create_dir_all(dir)?;
                (
                    Some(Self::open(&dir.join(format!("{}.out", machine)))?),
                    Some(Self::open(&dir.join(format!("{}.err", machine)))?),
                )
            }
            None => (None, None),
        };

        Ok(Self {
            machine: machine.to_string(),
            verbose,
            stdout_file,
            stderr_file,
        })
    }

    fn open(path: &Path) -> std::io::Result<BufWriter<File>> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(BufWriter::new(file))
    }

    /// Messages about the task itself rather than its output.
    pub fn log_meta(&mut self, message: &str) {
        tracing::debug!(machine = %self.machine, "{}", message);
        if let Some(file) = self.stderr_file.as_mut() {
            if let Err(err) = writeln!(file, "[wke] {}", message) {
                tracing::warn!("Failed to write log for {}: {}", self.machine, err);
            }
        }
    }

    pub fn close(&mut self) {
        for file in [self.stdout_file.as_mut(), self.stderr_file.as_mut()]
            .into_iter()
            .flatten()
        {
            if let Err(err) = file.flush() {
                tracing::warn!("Failed to flush log for {}: {}", self.machine, err);
            }
        }
    }
}

impl OutputSink for MachineLogger {
    fn log_info(&mut self, line: &str) {
        if self.verbose {
            println!("[{}] {}", self.machine, line);
        }
        if let Some(file) = self.stdout_file.as_mut() {
            if let Err(err) = writeln!(file, "{}", line) {
                tracing::warn!("Failed to write log for {}: {}", self.machine, err);
            }
        }
    }

    fn log_error(&mut self, line: &str) {
        eprintln!("[{}] {}", self.machine, line);
        if let Some(file) = self.stderr_file.as_mut() {
            if let Err(err) = writeln!(file, "{}", line) {
                tracing::warn!("Failed to write log for {}: {}", self.machine, err);
            }
        }
    }
}

impl Drop for MachineLogger {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_machine_logger_writes_files() {
        let dir = TempDir::new().unwrap();

        {
            let mut logger = MachineLogger::new(Some(dir.path()), "node1", false).unwrap();
            logger.log_info("hello");
            logger.log_error("oops");
            logger.log_info("world");
        }

        let out = fs::read_to_string(dir.path().join("node1.out")).unwrap();
        let err = fs::read_to_string(dir.path().join("node1.err")).unwrap();
        assert_eq!(out, "hello\nworld\n");
        assert_eq!(err, "oops\n");
    }

    #[test]
    fn test_machine_logger_without_dir() {
        let mut logger = MachineLogger::new(None, "node1", false).unwrap();
        logger.log_info("not stored anywhere");
        logger.close();
    }
}
