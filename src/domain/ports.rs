use crate::domain::model::SshEndpoint;
use crate::utils::error::{Result, WkeError};
use async_trait::async_trait;
use tokio::sync::watch;

/// Receives the output of a remote command, one complete line at a time.
pub trait OutputSink: Send {
    fn log_info(&mut self, line: &str);
    fn log_error(&mut self, line: &str);

    /// Every chunk of stdout exactly as it arrived, before it was split into
    /// lines. Shells call this in addition to `log_info`.
    fn log_raw(&mut self, _data: &[u8]) {}
}

/// How a remote command ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecStatus {
    Exited(i32),
    Aborted,
}

/// Keeps everything in memory. Used to read remote files.
#[derive(Debug, Default)]
pub struct CapturedOutput {
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
    pub raw: Vec<u8>,
}

impl OutputSink for CapturedOutput {
    fn log_info(&mut self, line: &str) {
        self.stdout.push(line.to_string());
    }

    fn log_error(&mut self, line: &str) {
        self.stderr.push(line.to_string());
    }

    fn log_raw(&mut self, data: &[u8]) {
        self.raw.extend_from_slice(data);
    }
}

#[async_trait]
pub trait RemoteShell: Send + Sync {
    /// Runs `command` on `endpoint` until it exits or `abort` turns `true`.
    async fn execute(
        &self,
        endpoint: &SshEndpoint,
        command: &str,
        output: &mut dyn OutputSink,
        abort: watch::Receiver<bool>,
    ) -> Result<ExecStatus>;

    /// Returns the contents of a remote text file, byte for byte. Invalid
    /// UTF-8 is replaced.
    async fn read_file(&self, endpoint: &SshEndpoint, path: &str) -> Result<String> {
        let (_keep_open, abort) = watch::channel(false);
        let mut output = CapturedOutput::default();
        let command = format!("cat {}", crate::core::command::shell_quote(path));

        match self.execute(endpoint, &command, &mut output, abort).await? {
            ExecStatus::Exited(0) => Ok(String::from_utf8_lossy(&output.raw).into_owned()),
            status => Err(WkeError::remote(
                &endpoint.host,
                command,
                format!("{:?}: {}", status, output.stderr.join("\n")),
            )),
        }
    }
}
