use crate::adapters::rsync;
use crate::core::selector::{MachineSet, Slice};
use crate::domain::model::{Machine, SshEndpoint};
use crate::utils::error::{Result, WkeError};
use crate::utils::validation::{find_duplicate, validate_non_empty_string, Validate};
use serde::Deserialize;
use std::path::{Path, PathBuf};

pub const DEFAULT_CLUSTER_FILE: &str = "cluster.toml";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ClusterSettings {
    pub username: String,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    #[serde(default = "default_workdir")]
    pub workdir: String,
    pub identity_file: Option<PathBuf>,
}

fn default_ssh_port() -> u16 {
    22
}

fn default_workdir() -> String {
    "~".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MachineEntry {
    pub name: String,
    pub external_addr: String,
    pub internal_addr: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct ClusterFile {
    cluster: ClusterSettings,
    #[serde(default)]
    machines: Vec<MachineEntry>,
}

/// The machines described by a `cluster.toml` file.
#[derive(Debug, Clone)]
pub struct Cluster {
    settings: ClusterSettings,
    machines: Vec<Machine>,
}

impl Cluster {
    /// Loads and validates a `cluster.toml` file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|err| {
            WkeError::cluster(format!("Cannot open cluster file at {}: {}", path.display(), err))
        })?;
        Self::from_toml_str(&content).map_err(|err| match err {
            WkeError::ClusterError { message } => {
                WkeError::cluster(format!("{} ({})", message, path.display()))
            }
            other => other,
        })
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let processed_content = Self::substitute_env_vars(content);

        let file: ClusterFile = toml::from_str(&processed_content)
            .map_err(|e| WkeError::cluster(format!("Failed to parse cluster file: {}", e)))?;

        let machines = file
            .machines
            .into_iter()
            .enumerate()
            .map(|(index, entry)| Machine {
                internal_addr: entry
                    .internal_addr
                    .unwrap_or_else(|| entry.external_addr.clone()),
                name: entry.name,
                index,
                external_addr: entry.external_addr,
            })
            .collect();

        let cluster = Self {
            settings: file.cluster,
            machines,
        };
        cluster.validate()?;
        Ok(cluster)
    }

    /// Replaces `${VAR}` with the value of the environment variable `VAR`.
    /// Unknown variables are left untouched.
    fn substitute_env_vars(content: &str) -> String {
        use regex::Regex;
        use std::sync::OnceLock;

        static ENV_VAR: OnceLock<Regex> = OnceLock::new();
        let re = ENV_VAR.get_or_init(|| Regex::new(r"\$\{([^}]+)\}").expect("valid regex"));

        re.replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            std::env::var(var_name).unwrap_or_else(|_| format!("${{{}}}", var_name))
        })
        .to_string()
    }

    pub fn settings(&self) -> &ClusterSettings {
        &self.settings
    }

    pub fn username(&self) -> &str {
        &self.settings.username
    }

    pub fn ssh_port(&self) -> u16 {
        self.settings.ssh_port
    }

    /// The default working directory on every machine.
    pub fn workdir(&self) -> &str {
        &self.settings.workdir
    }

    pub fn machines(&self) -> &[Machine] {
        &self.machines
    }

    pub fn machine_names(&self) -> Vec<&str> {
        self.machines.iter().map(|m| m.name.as_str()).collect()
    }

    pub fn num_machines(&self) -> usize {
        self.machines.len()
    }

    pub fn get_machine(&self, name: &str) -> Result<&Machine> {
        self.machines
            .iter()
            .find(|m| m.name == name)
            .ok_or_else(|| WkeError::cluster(format!("No such machine \"{}\"", name)))
    }

    /// How to reach `machine`. `username` overrides the cluster's user.
    pub fn endpoint(&self, machine: &Machine, username: Option<&str>) -> SshEndpoint {
        SshEndpoint {
            host: machine.external_addr.clone(),
            port: self.settings.ssh_port,
            username: username.unwrap_or(&self.settings.username).to_string(),
            identity_file: self.settings.identity_file.clone(),
        }
    }

    /// A slice containing every machine.
    pub fn create_slice(&self) -> Slice<'_> {
        Slice::new(self, 0, self.machines.len())
    }

    /// `num_machines` consecutive machines starting at `offset`.
    pub fn create_subslice(&self, offset: usize, num_machines: usize) -> Result<Slice<'_>> {
        let end = offset
            .checked_add(num_machines)
            .filter(|end| *end <= self.machines.len())
            .ok_or_else(|| {
                WkeError::cluster(format!(
                    "Slice [{}:{}] is out of range; the cluster has {} machine(s)",
                    offset,
                    offset.saturating_add(num_machines),
                    self.machines.len()
                ))
            })?;
        if end == offset {
            return Err(WkeError::cluster("Slice must contain at least one machine"));
        }
        Ok(Slice::new(self, offset, num_machines))
    }

    pub fn get_machines_by_indices(&self, indices: &[usize]) -> Result<MachineSet<'_>> {
        for index in indices {
            if *index >= self.machines.len() {
                return Err(WkeError::cluster(format!(
                    "No machine with index {}; the cluster has {} machine(s)",
                    index,
                    self.machines.len()
                )));
            }
        }
        Ok(MachineSet::new(self, indices.to_vec()))
    }

    /// Copies a local file or directory to a machine using rsync.
    pub async fn copy_to(&self, machine_name: &str, source: &Path, destination: &str) -> Result<()> {
        let machine = self.get_machine(machine_name)?;
        let endpoint = self.endpoint(machine, None);
        rsync::copy_to(&endpoint, source, destination).await
    }

    pub fn generate_metadata(&self) -> serde_json::Value {
        let machines: serde_json::Map<String, serde_json::Value> = self
            .machines
            .iter()
            .map(|m| (m.name.clone(), m.generate_metadata()))
            .collect();

        serde_json::json!({
            "username": self.settings.username,
            "ssh-port": self.settings.ssh_port,
            "workdir": self.settings.workdir,
            "machines": machines,
        })
    }
}

impl Validate for Cluster {
    fn validate(&self) -> Result<()> {
        let as_cluster_error = |err: WkeError| WkeError::cluster(err.to_string());

        validate_non_empty_string("cluster.username", &self.settings.username)
            .map_err(as_cluster_error)?;

        if self.settings.ssh_port == 0 {
            return Err(WkeError::cluster("cluster.ssh-port must not be zero"));
        }

        if self.machines.is_empty() {
            return Err(WkeError::cluster("Cluster does not contain any machines"));
        }

        for machine in &self.machines {
            validate_non_empty_string("machines.name", &machine.name).map_err(as_cluster_error)?;
            validate_non_empty_string(
                &format!("machines.{}.external-addr", machine.name),
                &machine.external_addr,
            )
            .map_err(as_cluster_error)?;
        }

        if let Some(name) = find_duplicate(self.machines.iter().map(|m| m.name.as_str())) {
            return Err(WkeError::cluster(format!(
                "Machine name \"{}\" is used more than once",
                name
            )));
        }

        Ok(())
    }
}
