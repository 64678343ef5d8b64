use crate::adapters::ssh::SshShell;
use crate::config::configuration::{Configuration, Target, INSTALL_PACKAGES};
use crate::core::command::{bash_wrap, generate_command, quote_path, TaskContext};
use crate::core::selector::Selector;
use crate::core::task::{join_all, JoinSettings, Task};
use crate::domain::model::OptionValue;
use crate::domain::ports::RemoteShell;
use crate::utils::error::{Result, WkeError};
use crate::utils::validation::validate_positive_number;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Option values set by the user, by option name.
pub type OptionMap = BTreeMap<String, OptionValue>;

/// Which prelude runs before a target.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum PreludeChoice {
    /// Whatever the configuration declares as `default-prelude`.
    #[default]
    Default,
    None,
    Named(String),
}

impl PreludeChoice {
    /// `none` and `None` disable the prelude, a missing value picks the default.
    pub fn from_arg(arg: Option<&str>) -> Self {
        match arg {
            None | Some("") => PreludeChoice::Default,
            Some("none") | Some("None") => PreludeChoice::None,
            Some(name) => PreludeChoice::Named(name.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub verbose: bool,
    pub debug: bool,
    /// Number of tasks per machine.
    pub multiply: usize,
    pub prelude: PreludeChoice,
    /// Stop right before connecting to any machine.
    pub dry_run: bool,
    pub log_dir: Option<PathBuf>,
    pub timeout: Option<Duration>,
    /// Overrides the cluster's working directory.
    pub workdir: Option<String>,
    /// Do not print anything if the target fails.
    pub quiet_fail: bool,
    pub handle_signals: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            verbose: false,
            debug: false,
            multiply: 1,
            prelude: PreludeChoice::Default,
            dry_run: false,
            log_dir: None,
            timeout: None,
            workdir: None,
            quiet_fail: false,
            handle_signals: true,
        }
    }
}

impl RunOptions {
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_multiply(mut self, multiply: usize) -> Self {
        self.multiply = multiply;
        self
    }

    pub fn with_prelude(mut self, prelude: PreludeChoice) -> Self {
        self.prelude = prelude;
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_log_dir(mut self, log_dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(log_dir.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_workdir(mut self, workdir: impl Into<String>) -> Self {
        self.workdir = Some(workdir.into());
        self
    }

    pub fn with_quiet_fail(mut self, quiet_fail: bool) -> Self {
        self.quiet_fail = quiet_fail;
        self
    }

    pub fn with_handle_signals(mut self, handle_signals: bool) -> Self {
        self.handle_signals = handle_signals;
        self
    }
}

/// Picks the value of every option of `target`, from `options` or the
/// defaults, and returns them in declaration order together with a printable
/// summary.
pub fn resolve_options(
    target: &Target,
    options: Option<&OptionMap>,
) -> Result<(Vec<OptionValue>, String)> {
    let mut remaining = options.cloned().unwrap_or_default();
    let mut argv = Vec::new();
    let mut summary = Vec::new();

    for option in target.options() {
        let value = match remaining.remove(option.name()) {
            Some(value) => value.coerce(option.value_type()).map_err(|msg| {
                WkeError::invalid(format!(
                    "Invalid value set for option \"{}\": {}",
                    option.name(),
                    msg
                ))
            })?,
            None => option.default_value().cloned().ok_or_else(|| {
                WkeError::invalid(format!(
                    "No value set for required option \"{}\"",
                    option.name()
                ))
            })?,
        };

        if let Some(choices) = option.choices() {
            if !choices.contains(&value) {
                let allowed: Vec<String> = choices.iter().map(ToString::to_string).collect();
                return Err(WkeError::invalid(format!(
                    "Invalid value set for option \"{}\". Was `{}` but allowed choices are {}.",
                    option.name(),
                    value,
                    allowed.join(",")
                )));
            }
        }

        summary.push(format!("\"{}\": {}", option.name(), value.summary()));
        argv.push(value);
    }

    if let Some(name) = remaining.keys().next() {
        return Err(WkeError::invalid(format!(
            "Got unexpected option \"{}\" for target \"{}\". Allowed options are {:?}",
            name,
            target.name(),
            target.option_names()
        )));
    }

    Ok((argv, summary.join(", ")))
}

/// Everything needed to run a target, detached from the configuration and
/// cluster it was built from.
#[derive(Debug)]
pub struct RunPlan {
    target: String,
    tasks: Vec<Task>,
    timeout: Option<Duration>,
    verbose: bool,
    handle_signals: bool,
}

impl RunPlan {
    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub async fn execute(
        self,
        shell: Arc<dyn RemoteShell>,
        stop: Option<watch::Receiver<bool>>,
    ) -> Result<()> {
        let settings = JoinSettings {
            target: self.target,
            timeout: self.timeout,
            verbose: self.verbose,
            handle_signals: self.handle_signals,
            stop,
        };
        join_all(self.tasks, shell, settings).await
    }
}

/// A run started with `Runner::background_run`.
#[derive(Debug)]
pub struct BackgroundRun {
    stop: watch::Sender<bool>,
    handle: JoinHandle<Result<bool>>,
}

impl BackgroundRun {
    /// Asks every machine to stop. Use `join` to wait for it.
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    /// Drops all connections without waiting for the machines.
    pub fn kill(&self) {
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Waits for the run. A killed run counts as unsuccessful.
    pub async fn join(self) -> Result<bool> {
        match self.handle.await {
            Ok(result) => result,
            Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
            Err(_) => Ok(false),
        }
    }
}

fn report_failure(result: Result<()>, quiet_fail: bool) -> Result<bool> {
    match result {
        Ok(()) => Ok(true),
        Err(err) if err.is_execution_failure() => {
            if !quiet_fail {
                println!("❗{}", err);
            }
            Ok(false)
        }
        Err(err) => Err(err),
    }
}

/// Runs targets through a `RemoteShell`.
#[derive(Clone)]
pub struct Runner {
    shell: Arc<dyn RemoteShell>,
}

impl Runner {
    pub fn new(shell: Arc<dyn RemoteShell>) -> Self {
        Self { shell }
    }

    /// A runner that connects to machines with SSH.
    pub fn ssh() -> Self {
        Self::new(Arc::new(SshShell::new()))
    }

    pub fn shell(&self) -> Arc<dyn RemoteShell> {
        self.shell.clone()
    }

    /// Validates the request and builds one task per machine and multiple.
    ///
    /// Returns `None` for dry runs.
    pub fn prepare(
        &self,
        selector: &dyn Selector,
        config: &Configuration,
        target_name: &str,
        options: Option<&OptionMap>,
        run_options: &RunOptions,
    ) -> Result<Option<RunPlan>> {
        validate_positive_number("multiply", run_options.multiply, 1)?;

        let target = config.get_target(target_name).ok_or_else(|| {
            WkeError::invalid(format!(
                "No such target \"{}::{}\"",
                config.name(),
                target_name
            ))
        })?;

        let (argv, summary) = resolve_options(target, options)?;

        let prelude_name = match &run_options.prelude {
            PreludeChoice::Default => config.default_prelude().map(str::to_string),
            PreludeChoice::None => None,
            PreludeChoice::Named(name) => Some(name.clone()),
        };

        let (prelude, prelude_txt) = match prelude_name {
            Some(name) => (
                Some(config.get_prelude_cmd(&name)?),
                format!(" and prelude=\"{}\"", name),
            ),
            None => (None, String::new()),
        };

        let machines = selector.machines();

        println!(
            "ℹ️  Running \"{}::{}\" on {} machine(s) with options={{{}}}{}",
            config.name(),
            target.name(),
            machines.len(),
            summary,
            prelude_txt
        );

        if run_options.dry_run {
            println!("dry_run was specified, so I will stop here");
            return Ok(None);
        }

        if machines.is_empty() {
            return Err(WkeError::invalid("selector cannot be empty"));
        }

        let script = config.get_target_cmd(target.name())?;
        let workdir = run_options
            .workdir
            .as_deref()
            .unwrap_or_else(|| selector.workdir());
        let cluster = selector.cluster();
        let group_size = machines.len() * run_options.multiply;

        let mut tasks = Vec::with_capacity(group_size);
        for (pos, machine) in machines.into_iter().enumerate() {
            for i in 0..run_options.multiply {
                let group_index = pos * run_options.multiply + i;
                let ctx = TaskContext {
                    machine,
                    username: cluster.username(),
                    group_index,
                    group_size,
                };

                let command = generate_command(
                    target.name(),
                    &script,
                    prelude.as_deref(),
                    Some(workdir),
                    &argv,
                    &ctx,
                )
                .map_err(|err| WkeError::remote(&machine.name, target.name(), err.to_string()))?;

                tasks.push(Task {
                    group_index,
                    group_size,
                    machine: machine.clone(),
                    task_name: target.name().to_string(),
                    log_name: if run_options.multiply > 1 {
                        format!("{}-{}", machine.name, i)
                    } else {
                        machine.name.clone()
                    },
                    command,
                    endpoint: cluster.endpoint(machine, None),
                    log_dir: run_options.log_dir.clone(),
                    verbose: run_options.verbose,
                    debug: run_options.debug,
                });
            }
        }

        Ok(Some(RunPlan {
            target: target.name().to_string(),
            tasks,
            timeout: run_options.timeout,
            verbose: run_options.verbose,
            handle_signals: run_options.handle_signals,
        }))
    }

    /// Runs a target and fails if it could not be run on every machine.
    pub async fn check_run(
        &self,
        selector: &dyn Selector,
        config: &Configuration,
        target_name: &str,
        options: Option<&OptionMap>,
        run_options: &RunOptions,
    ) -> Result<()> {
        if target_name == INSTALL_PACKAGES {
            if run_options.debug {
                println!("Found built-in \"{}\"", INSTALL_PACKAGES);
            }
            return self
                .install_packages(
                    selector,
                    config,
                    true,
                    run_options.dry_run,
                    run_options.verbose,
                )
                .await;
        }

        match self.prepare(selector, config, target_name, options, run_options)? {
            Some(plan) => plan.execute(self.shell.clone(), None).await,
            None => Ok(()),
        }
    }

    /// Like `check_run`, but a failure on the machines is reported and
    /// returned as `Ok(false)`. Invalid requests are still errors.
    pub async fn run(
        &self,
        selector: &dyn Selector,
        config: &Configuration,
        target_name: &str,
        options: Option<&OptionMap>,
        run_options: &RunOptions,
    ) -> Result<bool> {
        let result = self
            .check_run(selector, config, target_name, options, run_options)
            .await;
        report_failure(result, run_options.quiet_fail)
    }

    /// Validates the request now and runs it in a separate tokio task.
    pub fn background_run(
        &self,
        selector: &dyn Selector,
        config: &Configuration,
        target_name: &str,
        options: Option<&OptionMap>,
        run_options: &RunOptions,
    ) -> Result<BackgroundRun> {
        let plan = self
            .prepare(selector, config, target_name, options, run_options)?
            .map(|mut plan| {
                // the handle decides when to stop, not Ctrl-C
                plan.handle_signals = false;
                plan
            });

        let (stop_tx, stop_rx) = watch::channel(false);
        let shell = self.shell.clone();
        let quiet_fail = run_options.quiet_fail;

        let handle = tokio::spawn(async move {
            match plan {
                Some(plan) => report_failure(plan.execute(shell, Some(stop_rx)).await, quiet_fail),
                None => Ok(true),
            }
        });

        Ok(BackgroundRun {
            stop: stop_tx,
            handle,
        })
    }

    /// Installs the Debian packages (and repositories) the configuration
    /// requires. Without sudo the commands run as root.
    pub async fn install_packages(
        &self,
        selector: &dyn Selector,
        config: &Configuration,
        use_sudo: bool,
        dry_run: bool,
        verbose: bool,
    ) -> Result<()> {
        let (sudo, username) = if use_sudo {
            ("sudo ", None)
        } else {
            ("", Some("root"))
        };

        let repos = config.required_ubuntu_repositories();
        let packages = config.required_ubuntu_packages();

        if repos.is_empty() && packages.is_empty() {
            println!(
                "No required ubuntu repositories or packages found. Will not install anything."
            );
            return Ok(());
        }

        let machines = selector.machines();
        println!(
            "Adding {} repositories and {} packages to machines {:?}",
            repos.len(),
            packages.len(),
            selector.machine_names()
        );

        if dry_run {
            println!("Try run was requested. Will stop here.");
            return Ok(());
        }

        if machines.is_empty() {
            return Err(WkeError::invalid("selector cannot be empty"));
        }

        let mut commands: Vec<String> = repos
            .iter()
            .map(|repo| format!("{}apt-add-repository {}", sudo, repo))
            .collect();
        commands.push(format!("{}apt-get update", sudo));
        commands.push(format!("{}apt-get install -y {}", sudo, packages.join(" ")));
        let command = bash_wrap(&commands);

        let tasks = builtin_tasks(selector, INSTALL_PACKAGES, &command, username, verbose);

        println!("⌛ Waiting for {} machine(s) to finish...", tasks.len());
        let settings = JoinSettings {
            target: INSTALL_PACKAGES.to_string(),
            verbose,
            handle_signals: true,
            ..Default::default()
        };
        join_all(tasks, self.shell.clone(), settings).await
    }

    /// Removes everything inside the working directory of every machine.
    /// Returns whether it succeeded everywhere.
    pub async fn cleanup(&self, selector: &dyn Selector, verbose: bool) -> Result<bool> {
        let workdir = selector.workdir();

        if verbose {
            for name in selector.machine_names() {
                println!(
                    "Cleaning up working directory \"{}\" on machine \"{}\"",
                    workdir, name
                );
            }
        }

        let command = bash_wrap(&[format!("rm -rf {}/*", quote_path(workdir))]);
        let tasks = builtin_tasks(selector, "cleanup", &command, Some("root"), verbose);

        println!("⌛ Waiting for {} machine(s) to finish...", tasks.len());
        let settings = JoinSettings {
            target: "cleanup".to_string(),
            verbose,
            handle_signals: true,
            ..Default::default()
        };
        report_failure(join_all(tasks, self.shell.clone(), settings).await, false)
    }
}

/// One task per machine running the same command.
fn builtin_tasks(
    selector: &dyn Selector,
    task_name: &str,
    command: &str,
    username: Option<&str>,
    verbose: bool,
) -> Vec<Task> {
    let cluster = selector.cluster();
    selector
        .machines()
        .into_iter()
        .map(|machine| Task {
            group_index: 0,
            group_size: 1,
            machine: machine.clone(),
            task_name: task_name.to_string(),
            log_name: machine.name.clone(),
            command: command.to_string(),
            endpoint: cluster.endpoint(machine, username),
            log_dir: None,
            verbose,
            debug: false,
        })
        .collect()
}
