use crate::config::cluster::Cluster;
use crate::domain::model::Machine;
use crate::domain::ports::RemoteShell;
use crate::utils::error::{Result, WkeError};

/// A set of machines of one cluster.
pub trait Selector: Send + Sync {
    fn cluster(&self) -> &Cluster;

    fn machines(&self) -> Vec<&Machine>;

    fn workdir(&self) -> &str {
        self.cluster().workdir()
    }

    fn machine_names(&self) -> Vec<&str> {
        self.machines().into_iter().map(|m| m.name.as_str()).collect()
    }
}

impl Selector for Cluster {
    fn cluster(&self) -> &Cluster {
        self
    }

    fn machines(&self) -> Vec<&Machine> {
        Cluster::machines(self).iter().collect()
    }
}

/// Consecutive machines of a cluster.
#[derive(Debug, Clone, Copy)]
pub struct Slice<'a> {
    cluster: &'a Cluster,
    offset: usize,
    len: usize,
}

impl<'a> Slice<'a> {
    pub(crate) fn new(cluster: &'a Cluster, offset: usize, len: usize) -> Self {
        Self {
            cluster,
            offset,
            len,
        }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Reads `path` on every machine of the slice, in order.
    pub async fn open_remote(&self, shell: &dyn RemoteShell, path: &str) -> Result<Vec<String>> {
        open_remote(self, shell, path).await
    }
}

impl Selector for Slice<'_> {
    fn cluster(&self) -> &Cluster {
        self.cluster
    }

    fn machines(&self) -> Vec<&Machine> {
        self.cluster.machines()[self.offset..self.offset + self.len]
            .iter()
            .collect()
    }
}

/// Arbitrary machines of a cluster, picked by index.
#[derive(Debug, Clone)]
pub struct MachineSet<'a> {
    cluster: &'a Cluster,
    indices: Vec<usize>,
}

impl<'a> MachineSet<'a> {
    pub(crate) fn new(cluster: &'a Cluster, indices: Vec<usize>) -> Self {
        Self { cluster, indices }
    }

    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    /// Reads `path` on every machine of the set, in order.
    pub async fn open_remote(&self, shell: &dyn RemoteShell, path: &str) -> Result<Vec<String>> {
        open_remote(self, shell, path).await
    }
}

impl Selector for MachineSet<'_> {
    fn cluster(&self) -> &Cluster {
        self.cluster
    }

    fn machines(&self) -> Vec<&Machine> {
        let machines = self.cluster.machines();
        self.indices.iter().map(|i| &machines[*i]).collect()
    }
}

async fn open_remote(
    selector: &dyn Selector,
    shell: &dyn RemoteShell,
    path: &str,
) -> Result<Vec<String>> {
    let mut contents = Vec::new();
    for machine in selector.machines() {
        let endpoint = selector.cluster().endpoint(machine, None);
        contents.push(shell.read_file(&endpoint, path).await?);
    }
    Ok(contents)
}

/// What the user picked on the command line.
#[derive(Debug, Clone)]
pub enum Selection<'a> {
    All(&'a Cluster),
    Slice(Slice<'a>),
    Set(MachineSet<'a>),
}

impl Selector for Selection<'_> {
    fn cluster(&self) -> &Cluster {
        match self {
            Selection::All(cluster) => cluster,
            Selection::Slice(slice) => slice.cluster(),
            Selection::Set(set) => set.cluster(),
        }
    }

    fn machines(&self) -> Vec<&Machine> {
        match self {
            Selection::All(cluster) => Selector::machines(*cluster),
            Selection::Slice(slice) => slice.machines(),
            Selection::Set(set) => set.machines(),
        }
    }
}

fn parse_index(text: &str) -> Result<usize> {
    text.trim()
        .parse()
        .map_err(|_| WkeError::invalid(format!("Invalid machine index \"{}\"", text.trim())))
}

/// Figures out what machines the user specified.
///
/// Accepts `all`, a range `[start:end]`, a list `[i,j,...]`, a single index
/// `[i]` or a machine name.
pub fn parse_selector<'a>(selector: &str, cluster: &'a Cluster) -> Result<Selection<'a>> {
    if selector == "all" {
        return Ok(Selection::All(cluster));
    }

    if let Some(rest) = selector.strip_prefix('[') {
        let inner = rest.strip_suffix(']').ok_or_else(|| {
            WkeError::invalid("Selector starts with angled bracket, but does not end with one.")
        })?;

        if let Some((start, end)) = inner.split_once(':') {
            let start = parse_index(start)?;
            let end = parse_index(end)?;
            if end <= start {
                return Err(WkeError::invalid(format!(
                    "Invalid range: end({}) <= start({})",
                    end, start
                )));
            }
            return Ok(Selection::Slice(cluster.create_subslice(start, end - start)?));
        }

        let indices = inner
            .split(',')
            .map(parse_index)
            .collect::<Result<Vec<_>>>()?;
        return Ok(Selection::Set(cluster.get_machines_by_indices(&indices)?));
    }

    let machine = cluster.get_machine(selector)?;
    Ok(Selection::Set(cluster.get_machines_by_indices(&[machine.index])?))
}
