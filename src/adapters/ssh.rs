use crate::domain::model::SshEndpoint;
use crate::domain::ports::{ExecStatus, OutputSink, RemoteShell};
use crate::utils::error::{Result, WkeError};
use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::{Channel, ChannelMsg, Disconnect};
use russh_keys::key::PublicKey;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::watch;

/// Stderr is extended data stream 1 (RFC 4254, section 5.2).
const SSH_EXTENDED_DATA_STDERR: u32 = 1;

/// Upper bound for the TCP connect plus the SSH handshake of one host.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(60);

const AGENT_SOCKET_VAR: &str = "SSH_AUTH_SOCK";

/// Buffers raw output until it forms complete lines.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
    after_cr: bool,
}

impl LineBuffer {
    /// Appends `data` and returns every line completed by it.
    pub fn push(&mut self, data: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(data);

        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n' || *b == b'\r') {
            let rest = self.pending.split_off(pos + 1);
            let line = std::mem::replace(&mut self.pending, rest);

            // the "\n" of a "\r\n" pair does not start a new line
            let is_lf_after_cr = self.after_cr && line.len() == 1 && line[0] == b'\n';
            self.after_cr = line.last() == Some(&b'\r');
            if is_lf_after_cr {
                continue;
            }
            lines.push(Self::clean(&line));
        }
        if !self.pending.is_empty() {
            self.after_cr = false;
        }
        lines
    }

    /// Returns whatever is left, even without a trailing newline.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let line = std::mem::take(&mut self.pending);
        Some(Self::clean(&line))
    }

    fn clean(line: &[u8]) -> String {
        String::from_utf8_lossy(line)
            .chars()
            .filter(|c| !matches!(c, '\r' | '\n' | '\u{8}'))
            .collect()
    }
}

/// Accepts every host key and serves agent requests of the remote side.
struct ClientHandler;

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        Ok(true)
    }

    async fn server_channel_open_agent_forward(
        &mut self,
        channel: Channel<client::Msg>,
        _session: &mut client::Session,
    ) -> std::result::Result<(), Self::Error> {
        let Some(socket) = std::env::var_os(AGENT_SOCKET_VAR) else {
            tracing::debug!("Remote asked for the SSH agent, but {} is not set", AGENT_SOCKET_VAR);
            return Ok(());
        };

        tokio::spawn(async move {
            if let Err(err) = pipe_to_agent(channel.into_stream(), Path::new(&socket)).await {
                tracing::debug!("Agent forwarding ended: {}", err);
            }
        });
        Ok(())
    }
}

/// Relays `stream` to the local SSH agent listening on `socket` until
/// either side closes.
#[cfg(unix)]
async fn pipe_to_agent<S>(mut stream: S, socket: &Path) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut agent = tokio::net::UnixStream::connect(socket).await?;
    tokio::io::copy_bidirectional(&mut stream, &mut agent).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn pipe_to_agent<S>(_stream: S, _socket: &Path) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "SSH agent forwarding needs unix sockets",
    ))
}

/// Resolves once `abort` turns `true`. Never resolves if the sender is gone.
async fn abort_requested(abort: &mut watch::Receiver<bool>) {
    loop {
        if *abort.borrow_and_update() {
            return;
        }
        if abort.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Opens one SSH connection per command.
///
/// Every session requests agent forwarding, so scripts on the remote side
/// can use the caller's keys (e.g. to clone private repositories).
#[derive(Clone)]
pub struct SshShell {
    config: Arc<client::Config>,
    connect_timeout: Duration,
}

impl Default for SshShell {
    fn default() -> Self {
        Self::new()
    }
}

impl SshShell {
    pub fn new() -> Self {
        let config = client::Config {
            inactivity_timeout: None,
            keepalive_interval: Some(Duration::from_secs(30)),
            ..Default::default()
        };
        Self {
            config: Arc::new(config),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    async fn connect(&self, endpoint: &SshEndpoint) -> Result<Handle<ClientHandler>> {
        let handshake = async {
            let stream = TcpStream::connect((endpoint.host.as_str(), endpoint.port)).await?;
            // Prevents initial delay when setting up the connection
            stream.set_nodelay(true)?;
            Ok::<_, WkeError>(client::connect_stream(self.config.clone(), stream, ClientHandler).await?)
        };

        let mut handle = tokio::time::timeout(self.connect_timeout, handshake)
            .await
            .map_err(|_| {
                WkeError::remote(
                    &endpoint.host,
                    "connect",
                    format!(
                        "No SSH handshake within {} seconds",
                        self.connect_timeout.as_secs_f64()
                    ),
                )
            })??;

        if self.authenticate(&mut handle, endpoint).await? {
            Ok(handle)
        } else {
            Err(WkeError::remote(
                &endpoint.host,
                "authenticate",
                format!(
                    "Failed to authenticate as \"{}\" using the SSH agent or identity file",
                    endpoint.username
                ),
            ))
        }
    }

    async fn authenticate(
        &self,
        handle: &mut Handle<ClientHandler>,
        endpoint: &SshEndpoint,
    ) -> Result<bool> {
        match russh_keys::agent::client::AgentClient::connect_env().await {
            Ok(mut agent) => {
                let identities = agent.request_identities().await.unwrap_or_else(|err| {
                    tracing::debug!("SSH agent did not list identities: {}", err);
                    Vec::new()
                });

                for key in identities {
                    let (returned, result) = handle
                        .authenticate_future(endpoint.username.as_str(), key, agent)
                        .await;
                    agent = returned;
                    match result {
                        Ok(true) => return Ok(true),
                        Ok(false) => {}
                        Err(err) => tracing::debug!("Agent authentication failed: {}", err),
                    }
                }
            }
            Err(err) => tracing::debug!("No SSH agent available: {}", err),
        }

        if let Some(path) = &endpoint.identity_file {
            let key = russh_keys::load_secret_key(path, None)?;
            return Ok(handle
                .authenticate_publickey(endpoint.username.as_str(), Arc::new(key))
                .await?);
        }

        Ok(false)
    }
}

#[async_trait]
impl RemoteShell for SshShell {
    async fn execute(
        &self,
        endpoint: &SshEndpoint,
        command: &str,
        output: &mut dyn OutputSink,
        mut abort: watch::Receiver<bool>,
    ) -> Result<ExecStatus> {
        if *abort.borrow() {
            return Ok(ExecStatus::Aborted);
        }

        let setup = async {
            let handle = self.connect(endpoint).await?;
            let channel = handle.channel_open_session().await?;
            channel.agent_forward(false).await?;
            channel.exec(true, command).await?;
            Ok::<_, WkeError>((handle, channel))
        };

        let (handle, mut channel) = tokio::select! {
            result = setup => result?,
            _ = abort_requested(&mut abort) => {
                tracing::info!("Stopped connecting to {}", endpoint.host);
                return Ok(ExecStatus::Aborted);
            }
        };

        let mut stdout = LineBuffer::default();
        let mut stderr = LineBuffer::default();
        let mut exit_code = None;
        let mut aborted = false;
        let mut abort_open = true;

        loop {
            tokio::select! {
                changed = abort.changed(), if abort_open => {
                    match changed {
                        Ok(()) if *abort.borrow() => {
                            if let Err(err) = channel.close().await {
                                tracing::debug!("Failed to close channel to {}: {}", endpoint.host, err);
                            }
                            tracing::info!("Closed channel for {}", endpoint.host);
                            aborted = true;
                            break;
                        }
                        Ok(()) => {}
                        Err(_) => abort_open = false,
                    }
                }
                msg = channel.wait() => {
                    match msg {
                        Some(ChannelMsg::Data { ref data }) => {
                            output.log_raw(data);
                            for line in stdout.push(data) {
                                output.log_info(&line);
                            }
                        }
                        Some(ChannelMsg::ExtendedData { ref data, ext }) if ext == SSH_EXTENDED_DATA_STDERR => {
                            for line in stderr.push(data) {
                                output.log_error(&line);
                            }
                        }
                        Some(ChannelMsg::ExitStatus { exit_status }) => {
                            exit_code = Some(exit_status as i32);
                        }
                        Some(_) => {}
                        None => break,
                    }
                }
            }
        }

        if let Some(line) = stdout.finish() {
            output.log_info(&line);
        }
        if let Some(line) = stderr.finish() {
            output.log_error(&line);
        }

        if let Err(err) = handle
            .disconnect(Disconnect::ByApplication, "", "English")
            .await
        {
            tracing::debug!("Failed to disconnect from {}: {}", endpoint.host, err);
        }

        match (aborted, exit_code) {
            (true, _) => Ok(ExecStatus::Aborted),
            (false, Some(code)) => Ok(ExecStatus::Exited(code)),
            (false, None) => Err(WkeError::remote(
                &endpoint.host,
                command,
                "Connection closed without an exit status",
            )),
        }
    }
}
