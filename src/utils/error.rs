use thiserror::Error;

#[derive(Error, Debug)]
pub enum WkeError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("CSV processing error: {0}")]
    CsvError(#[from] csv::Error),

    #[error("SSH error: {0}")]
    SshError(#[from] russh::Error),

    #[error("SSH key error: {0}")]
    SshKeyError(#[from] russh_keys::Error),

    #[error("{message}")]
    ConfigurationError { message: String },

    #[error("{message}")]
    ClusterError { message: String },

    #[error("{message}")]
    InvalidArgument { message: String },

    #[error("Error on {machine} for command {command}: {message}")]
    RemoteExecutionError {
        machine: String,
        command: String,
        message: String,
    },

    #[error("Error while running target {target}: \n{}", format_machine_errors(.errors))]
    RunTargetError { target: String, errors: Vec<String> },

    #[error("Target {target} timed out after {seconds:.1} seconds")]
    TimeoutError { target: String, seconds: f64 },

    #[error("{message}")]
    MeasurementFailed { message: String },

    #[error("Failed to plot: {message}")]
    PlotError { message: String },
}

fn format_machine_errors(errors: &[String]) -> String {
    errors
        .iter()
        .map(|err| format!("\t💥 {}", err))
        .collect::<Vec<_>>()
        .join("\n")
}

impl WkeError {
    pub fn config(message: impl Into<String>) -> Self {
        WkeError::ConfigurationError {
            message: message.into(),
        }
    }

    pub fn cluster(message: impl Into<String>) -> Self {
        WkeError::ClusterError {
            message: message.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        WkeError::InvalidArgument {
            message: message.into(),
        }
    }

    pub fn remote(
        machine: impl Into<String>,
        command: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        WkeError::RemoteExecutionError {
            machine: machine.into(),
            command: command.into(),
            message: message.into(),
        }
    }

    /// Errors caused by the remote side rather than by bad input.
    pub fn is_execution_failure(&self) -> bool {
        matches!(
            self,
            WkeError::RemoteExecutionError { .. }
                | WkeError::RunTargetError { .. }
                | WkeError::TimeoutError { .. }
        )
    }

    /// Per-machine failures, if this error carries any.
    pub fn machine_errors(&self) -> &[String] {
        match self {
            WkeError::RunTargetError { errors, .. } => errors,
            _ => &[],
        }
    }
}

pub type Result<T> = std::result::Result<T, WkeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_error_message() {
        let err = WkeError::remote("node1", "setup-rust", "connection refused");
        assert_eq!(
            err.to_string(),
            "Error on node1 for command setup-rust: connection refused"
        );
        assert!(err.is_execution_failure());
    }

    #[test]
    fn test_run_target_error_lists_machines() {
        let err = WkeError::RunTargetError {
            target: "build".to_string(),
            errors: vec![
                "Machine node1 had non-zero exitcode 1".to_string(),
                "Machine node2 had non-zero exitcode 2".to_string(),
            ],
        };

        assert_eq!(
            err.to_string(),
            "Error while running target build: \n\
             \t💥 Machine node1 had non-zero exitcode 1\n\
             \t💥 Machine node2 had non-zero exitcode 2"
        );
        assert_eq!(err.machine_errors().len(), 2);
    }

    #[test]
    fn test_invalid_argument_is_not_execution_failure() {
        assert!(!WkeError::invalid("bad option").is_execution_failure());
        assert!(WkeError::invalid("bad option").machine_errors().is_empty());
    }
}
