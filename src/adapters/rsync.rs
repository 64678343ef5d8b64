use crate::domain::model::SshEndpoint;
use crate::utils::error::{Result, WkeError};
use std::path::Path;
use tokio::process::Command;

/// The `ssh` command line rsync uses as its transport.
pub fn ssh_transport(endpoint: &SshEndpoint) -> String {
    let mut transport = format!("ssh -p {}", endpoint.port);
    if let Some(identity) = &endpoint.identity_file {
        transport.push_str(&format!(" -i {}", identity.display()));
    }
    transport
}

/// Arguments for an interactive `ssh` session to `endpoint`.
pub fn ssh_args(endpoint: &SshEndpoint) -> Vec<String> {
    let mut args = vec!["-p".to_string(), endpoint.port.to_string()];
    if let Some(identity) = &endpoint.identity_file {
        args.push("-i".to_string());
        args.push(identity.display().to_string());
    }
    args.push(format!("{}@{}", endpoint.username, endpoint.host));
    args
}

pub fn rsync_args(endpoint: &SshEndpoint, source: &Path, destination: &str) -> Vec<String> {
    vec![
        "-az".to_string(),
        "-e".to_string(),
        ssh_transport(endpoint),
        source.display().to_string(),
        format!("{}@{}:{}", endpoint.username, endpoint.host, destination),
    ]
}

/// Copies `source` to `destination` on the remote machine.
pub async fn copy_to(endpoint: &SshEndpoint, source: &Path, destination: &str) -> Result<()> {
    let args = rsync_args(endpoint, source, destination);
    tracing::debug!("Running rsync {}", args.join(" "));

    let output = Command::new("rsync").args(&args).output().await?;

    if output.status.success() {
        Ok(())
    } else {
        Err(WkeError::remote(
            &endpoint.host,
            format!("rsync {}", args.join(" ")),
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ))
    }
}
