use crate::config::cluster::DEFAULT_CLUSTER_FILE;
use crate::config::configuration::Configuration;
use crate::core::run::OptionMap;
use crate::domain::model::OptionValue;
use crate::utils::error::{Result, WkeError};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "wke")]
#[command(about = "Run wke commands to manage a cluster and execute experiments")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Whether debug logging was requested by the subcommand.
    pub fn verbose(&self) -> bool {
        match &self.command {
            Commands::Run(args) => args.verbose || args.debug,
            Commands::Cleanup { verbose, .. } => *verbose,
            _ => false,
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run a target on one or multiple machines
    Run(RunArgs),

    /// Print information about a configuration
    ShowConfig {
        /// Name of the configuration folder
        config_name: String,

        /// Also list the options of every target
        #[arg(long)]
        verbose: bool,

        /// Instead of a human-readable output, print JSON
        #[arg(long)]
        json: bool,

        /// Change the working directory first
        #[arg(long)]
        cwd: Option<PathBuf>,
    },

    /// Print information about the cluster
    ShowCluster {
        #[arg(long, short = 'f', default_value = DEFAULT_CLUSTER_FILE)]
        cluster_file: PathBuf,

        /// Change the working directory first
        #[arg(long)]
        cwd: Option<PathBuf>,

        /// Instead of a human-readable output, print JSON
        #[arg(long)]
        json: bool,
    },

    /// Print information about a specific machine in the cluster
    ShowMachine {
        machine_name: String,

        #[arg(long, short = 'f', default_value = DEFAULT_CLUSTER_FILE)]
        cluster_file: PathBuf,

        /// Change the working directory first
        #[arg(long)]
        cwd: Option<PathBuf>,

        /// Instead of a human-readable output, print JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the value of an attribute of a machine in the cluster
    GetMachineAttribute {
        machine_name: String,

        /// The attribute to show, e.g., "external-addr"
        attribute: String,

        #[arg(long, short = 'f', default_value = DEFAULT_CLUSTER_FILE)]
        cluster_file: PathBuf,

        /// Change the working directory first
        #[arg(long)]
        cwd: Option<PathBuf>,
    },

    /// Connect (using SSH) to a machine in the cluster
    Connect {
        machine_name: String,

        #[arg(long, short = 'f', default_value = DEFAULT_CLUSTER_FILE)]
        cluster_file: PathBuf,
    },

    /// Remove everything inside the working directory of the selected machines
    Cleanup {
        /// "all", a range (e.g., [1:5]), a list (e.g., [0,2]) or a machine name
        selector: String,

        #[arg(long, short = 'f', default_value = DEFAULT_CLUSTER_FILE)]
        cluster_file: PathBuf,

        /// Change the working directory first
        #[arg(long)]
        cwd: Option<PathBuf>,

        #[arg(long)]
        verbose: bool,
    },

    /// Combine two CSV files with identical constants into a new CSV file
    MergeCsv {
        infile1: PathBuf,
        infile2: PathBuf,
        outfile: PathBuf,
    },

    /// Plot the machine loads recorded during a measurement
    PlotLoads(PlotArgs),
}

#[derive(Debug, Args)]
pub struct PlotArgs {
    /// The folder containing the experiment's log files
    pub logfolder: PathBuf,

    /// Keep updating the plot instead of terminating after creating it
    #[arg(long, short = 'f')]
    pub follow: bool,

    #[arg(long, default_value = "loads.svg")]
    pub out: PathBuf,

    /// If follow is set, how often (in seconds) the plot is updated
    #[arg(long, default_value_t = 60)]
    pub update_interval: u64,

    /// Only plot the n-th machine of the loads file
    #[arg(long)]
    pub machine_index: Option<usize>,
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Name of the configuration to use. Must be a subfolder of the current directory.
    pub config_name: String,

    /// Where to run the target? "all", a range (e.g., [1:5]), a list (e.g., [0,2]) or a machine name
    pub selector: String,

    /// The target(s) to execute: a single target, "all", or a comma-separated list
    pub targets: String,

    /// Print all output of machines to stdout
    #[arg(long)]
    pub verbose: bool,

    /// Print additional debug information
    #[arg(long)]
    pub debug: bool,

    /// Only check whether the input looks valid
    #[arg(long)]
    pub dry_run: bool,

    /// Use a different working directory than the cluster's
    #[arg(long)]
    pub workdir: Option<String>,

    /// Number of tasks per machine
    #[arg(long, default_value_t = 1)]
    pub multiply: usize,

    /// Change the working directory first
    #[arg(long)]
    pub cwd: Option<PathBuf>,

    /// Prelude to run before the target; "none" disables the default one
    #[arg(long)]
    pub prelude: Option<String>,

    #[arg(long, default_value = DEFAULT_CLUSTER_FILE)]
    pub cluster_file: PathBuf,

    /// Give up after this many seconds
    #[arg(long)]
    pub timeout: Option<f64>,

    /// Set or overwrite an option of the target
    #[arg(short = 'D', value_name = "KEY=VALUE")]
    pub defines: Vec<String>,
}

/// Splits `a,b,c` and expands `all` to every target of the configuration.
pub fn parse_targets(targets: &str, config: &Configuration) -> Result<Vec<String>> {
    if targets.contains(',') {
        return Ok(targets.split(',').map(str::to_string).collect());
    }
    if targets.contains('+') {
        return Err(WkeError::invalid(
            "Invalid character \"+\" in targets. Use \",\" if you want to combine multiple targets",
        ));
    }
    if targets == "all" {
        return Ok(config.target_names().into_iter().map(str::to_string).collect());
    }
    Ok(vec![targets.to_string()])
}

/// Parses one `-D key=value` argument. Values stay strings until they are
/// matched with the option's declared type.
pub fn parse_define(define: &str) -> Result<(String, OptionValue)> {
    match define.split_once('=') {
        Some((name, value)) if !name.is_empty() => {
            Ok((name.to_string(), OptionValue::from(value)))
        }
        _ => Err(WkeError::invalid(format!(
            "Invalid arguments. Should be of form \"<key>=<value>\", but was \"{}\"",
            define
        ))),
    }
}

pub fn parse_defines(defines: &[String], num_targets: usize) -> Result<OptionMap> {
    if !defines.is_empty() && num_targets > 1 {
        return Err(WkeError::invalid(
            "Cannot set non-default options with more than one target (yet)",
        ));
    }
    defines.iter().map(|define| parse_define(define)).collect()
}
