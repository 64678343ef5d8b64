#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use wke::domain::model::SshEndpoint;
use wke::core::command::shell_quote;
use wke::domain::ports::{ExecStatus, OutputSink, RemoteShell};
use wke::{Cluster, Configuration, Result, WkeError};

pub fn configs_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("test-files/configs")
}

pub fn load_config(name: &str) -> Configuration {
    Configuration::load(name, configs_dir()).unwrap()
}

pub fn load_cluster() -> Cluster {
    Cluster::from_file(configs_dir().join("cluster.toml")).unwrap()
}

/// One command the mock was asked to run.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub host: String,
    pub username: String,
    pub command: String,
}

/// Records every command instead of connecting anywhere.
///
/// Commands containing `run-forever` block until aborted, hosts in `failing`
/// exit with code 1 and hosts in `unreachable` cannot be connected to.
/// `cat` returns the contents registered with `add_file`.
#[derive(Default)]
pub struct MockShell {
    invocations: Mutex<Vec<Invocation>>,
    failing: HashSet<String>,
    unreachable: HashSet<String>,
    files: HashMap<(String, String), String>,
}

impl MockShell {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing_on(host: &str) -> Arc<Self> {
        let mut shell = Self::default();
        shell.failing.insert(host.to_string());
        Arc::new(shell)
    }

    pub fn unreachable(host: &str) -> Arc<Self> {
        let mut shell = Self::default();
        shell.unreachable.insert(host.to_string());
        Arc::new(shell)
    }

    /// Serves `contents` for `path` on `host`.
    pub fn add_file(&mut self, host: &str, path: &str, contents: &str) {
        self.files
            .insert((host.to_string(), path.to_string()), contents.to_string());
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.invocations.lock().unwrap().clone()
    }

    pub fn hosts(&self) -> Vec<String> {
        let mut hosts: Vec<String> = self.invocations().into_iter().map(|i| i.host).collect();
        hosts.sort();
        hosts
    }
}

#[async_trait]
impl RemoteShell for MockShell {
    async fn execute(
        &self,
        endpoint: &SshEndpoint,
        command: &str,
        output: &mut dyn OutputSink,
        mut abort: watch::Receiver<bool>,
    ) -> Result<ExecStatus> {
        if self.unreachable.contains(&endpoint.host) {
            return Err(WkeError::remote(&endpoint.host, command, "Connection refused"));
        }

        self.invocations.lock().unwrap().push(Invocation {
            host: endpoint.host.clone(),
            username: endpoint.username.clone(),
            command: command.to_string(),
        });

        if command == "cat /proc/loadavg" {
            output.log_raw(b"0.52 0.41 0.30 1/123 4567\n");
            output.log_info("0.52 0.41 0.30 1/123 4567");
            return Ok(ExecStatus::Exited(0));
        }

        for ((host, path), contents) in &self.files {
            if *host == endpoint.host && command == format!("cat {}", shell_quote(path)) {
                output.log_raw(contents.as_bytes());
                for line in contents.lines() {
                    output.log_info(line);
                }
                return Ok(ExecStatus::Exited(0));
            }
        }
        if command.starts_with("cat ") {
            output.log_error("cat: No such file or directory");
            return Ok(ExecStatus::Exited(1));
        }

        if command.contains("run-forever") {
            while !*abort.borrow_and_update() {
                if abort.changed().await.is_err() {
                    break;
                }
            }
            return Ok(ExecStatus::Aborted);
        }

        output.log_info(&format!("ran on {}", endpoint.host));
        if self.failing.contains(&endpoint.host) {
            output.log_error("something went wrong");
            Ok(ExecStatus::Exited(1))
        } else {
            Ok(ExecStatus::Exited(0))
        }
    }
}
