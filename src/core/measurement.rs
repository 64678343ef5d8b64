use crate::config::cluster::Cluster;
use crate::config::configuration::Configuration;
use crate::core::collector::{DataCollector, DEFAULT_SAMPLE_INTERVAL};
use crate::core::run::{BackgroundRun, OptionMap, RunOptions, Runner};
use crate::core::selector::Selector;
use crate::utils::error::{Result, WkeError};
use chrono::{DateTime, Local};
use serde::Serialize;
use std::fs::{self, File};
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

pub const LOG_FOLDER: &str = "logs";
pub const CURRENT_MEASUREMENT: &str = "current-measurement";
pub const LAST_MEASUREMENT: &str = "last-measurement";
pub const RESULT_FILE: &str = "result.json";

/// What `MeasurementSession::measure` returns.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct MeasurementResult {
    target: String,
    options: OptionMap,
    start_time: DateTime<Local>,
    end_time: DateTime<Local>,
    elapsed_time: f64,
    throughput: f64,
    num_operations: u64,
}

impl MeasurementResult {
    pub fn new(
        target: &str,
        options: OptionMap,
        start_time: DateTime<Local>,
        end_time: DateTime<Local>,
        num_operations: u64,
    ) -> Self {
        let elapsed_time = (end_time - start_time)
            .to_std()
            .map(|elapsed| elapsed.as_secs_f64())
            .unwrap_or(0.0);
        let throughput = if elapsed_time > 0.0 {
            num_operations as f64 / elapsed_time
        } else {
            0.0
        };

        Self {
            target: target.to_string(),
            options,
            start_time,
            end_time,
            elapsed_time,
            throughput,
            num_operations,
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn options(&self) -> &OptionMap {
        &self.options
    }

    pub fn start_time(&self) -> DateTime<Local> {
        self.start_time
    }

    pub fn end_time(&self) -> DateTime<Local> {
        self.end_time
    }

    /// In seconds.
    pub fn elapsed_time(&self) -> f64 {
        self.elapsed_time
    }

    /// Operations per second.
    pub fn throughput(&self) -> f64 {
        self.throughput
    }

    /// As passed to `measure`; not measured.
    pub fn num_operations(&self) -> u64 {
        self.num_operations
    }

    pub fn summary(&self) -> String {
        let options: Vec<String> = self
            .options
            .iter()
            .map(|(name, value)| format!("{}=`{}`", name, value))
            .collect();

        format!(
            "### Summary:\nOptions: {}\nElapsed: {}\nThroughput: {}",
            options.join(", "),
            self.elapsed_time,
            self.throughput
        )
    }

    pub fn print_summary(&self) {
        println!("{}", self.summary());
    }
}

/// Logic encapsulating a single measurement.
///
/// Creates `<root>/logs/measurement-<uid>` and points
/// `<root>/current-measurement` at it until `measure` finishes, after which
/// `<root>/last-measurement` points there instead.
pub struct MeasurementSession {
    root: PathBuf,
    uid: String,
    log_dir: PathBuf,
    cluster: Cluster,
    config: Configuration,
    runner: Runner,
    collect_statistics: Option<String>,
    verbose: bool,
    background: Mutex<Vec<BackgroundRun>>,
}

impl MeasurementSession {
    /// `collect_statistics` names the machine whose load is sampled.
    pub fn new(
        root: impl Into<PathBuf>,
        cluster: Cluster,
        config: Configuration,
        runner: Runner,
        collect_statistics: Option<String>,
        verbose: bool,
    ) -> Result<Self> {
        let root = root.into();
        let uid = Local::now().format("%y%m%d-%H%M%S").to_string();
        let relative_log_dir = Path::new(LOG_FOLDER).join(format!("measurement-{}", uid));
        let log_dir = root.join(&relative_log_dir);

        fs::create_dir_all(root.join(LOG_FOLDER))?;
        fs::create_dir(&log_dir).map_err(|err| WkeError::MeasurementFailed {
            message: format!("Cannot create log folder {}: {}", log_dir.display(), err),
        })?;

        relink(&root.join(CURRENT_MEASUREMENT), &relative_log_dir)?;
        tracing::debug!("Logging measurement {} to {}", uid, log_dir.display());

        Ok(Self {
            root,
            uid,
            log_dir,
            cluster,
            config,
            runner,
            collect_statistics,
            verbose,
            background: Mutex::new(Vec::new()),
        })
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn cluster(&self) -> &Cluster {
        &self.cluster
    }

    pub fn config(&self) -> &Configuration {
        &self.config
    }

    /// Where all log files of this measurement are stored.
    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    fn session_options(&self, run_options: RunOptions) -> RunOptions {
        run_options
            .with_verbose(self.verbose)
            .with_log_dir(&self.log_dir)
    }

    /// Runs a target as part of this session without measuring it, e.g. to
    /// set up test data.
    pub async fn run(
        &self,
        selector: &dyn Selector,
        target: &str,
        options: Option<&OptionMap>,
        run_options: RunOptions,
    ) -> Result<bool> {
        let run_options = self.session_options(run_options);
        self.runner
            .run(selector, &self.config, target, options, &run_options)
            .await
    }

    /// Like `run`, but fails if the target fails.
    pub async fn check_run(
        &self,
        selector: &dyn Selector,
        target: &str,
        options: Option<&OptionMap>,
        run_options: RunOptions,
    ) -> Result<()> {
        let run_options = self.session_options(run_options);
        self.runner
            .check_run(selector, &self.config, target, options, &run_options)
            .await
    }

    /// Starts a target in the background, e.g. a server to measure against.
    /// It is stopped by `stop_background_tasks` or when the session is dropped.
    pub fn background_run(
        &self,
        selector: &dyn Selector,
        target: &str,
        options: Option<&OptionMap>,
        run_options: RunOptions,
    ) -> Result<()> {
        let run_options = self.session_options(run_options);
        let handle = self
            .runner
            .background_run(selector, &self.config, target, options, &run_options)?;
        self.background_tasks().push(handle);
        Ok(())
    }

    pub fn num_background_tasks(&self) -> usize {
        self.background_tasks().len()
    }

    fn background_tasks(&self) -> MutexGuard<'_, Vec<BackgroundRun>> {
        // a panic while holding the lock leaves the list itself intact
        self.background
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub async fn stop_background_tasks(&self) -> Result<()> {
        let handles: Vec<BackgroundRun> = self.background_tasks().drain(..).collect();
        for handle in handles {
            handle.stop();
            if !handle.join().await? {
                tracing::debug!("Background task did not finish successfully");
            }
        }
        Ok(())
    }

    /// Runs the target and measures how long it takes.
    ///
    /// Call this at most once per session.
    pub async fn measure(
        &self,
        selector: &dyn Selector,
        target: &str,
        num_operations: u64,
        options: Option<&OptionMap>,
        run_options: RunOptions,
    ) -> Result<MeasurementResult> {
        let collector = match self.collect_statistics.clone() {
            None => {
                println!("Won't collect statistics");
                None
            }
            Some(machine_name) => {
                println!("Will collect statistics");
                Some(self.start_collector(&machine_name).await?)
            }
        };

        let run_options = self.session_options(run_options);
        let start = Local::now();
        let outcome = self
            .runner
            .check_run(selector, &self.config, target, options, &run_options)
            .await;
        let end = Local::now();

        if let Err(err) = outcome {
            if let Some(collector) = collector {
                collector.stop().await?;
            }
            return Err(WkeError::MeasurementFailed {
                message: format!("Measurement failed: {}", err),
            });
        }

        let result = MeasurementResult::new(
            target,
            options.cloned().unwrap_or_default(),
            start,
            end,
            num_operations,
        );
        result.print_summary();

        let file = File::create(self.log_dir.join(RESULT_FILE))?;
        serde_json::to_writer_pretty(BufWriter::new(file), &result)?;

        if let Some(collector) = collector {
            let samples = collector.stop().await?;
            tracing::debug!("Collected {} load samples", samples);
        }

        let relative_log_dir = self.log_dir.strip_prefix(&self.root).unwrap_or(&self.log_dir);
        relink(&self.root.join(LAST_MEASUREMENT), relative_log_dir)?;
        remove_link(&self.root.join(CURRENT_MEASUREMENT))?;

        Ok(result)
    }

    async fn start_collector(&self, machine_name: &str) -> Result<DataCollector> {
        let machine = self.cluster.get_machine(machine_name)?;
        let mut collector = DataCollector::start(
            self.runner.shell(),
            &machine.name,
            self.cluster.endpoint(machine, None),
            &self.log_dir,
            DEFAULT_SAMPLE_INTERVAL,
        );

        if let Err(err) = collector.wait_ready().await {
            collector.stop().await?;
            return Err(WkeError::MeasurementFailed {
                message: format!("Failed to set up data collection: {}", err),
            });
        }
        Ok(collector)
    }
}

impl Drop for MeasurementSession {
    fn drop(&mut self) {
        for handle in self.background_tasks().iter() {
            handle.stop();
        }
    }
}

fn remove_link(link: &Path) -> io::Result<()> {
    match fs::remove_file(link) {
        Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}

/// Points `link` at `target`, replacing an existing link.
fn relink(link: &Path, target: &Path) -> io::Result<()> {
    remove_link(link)?;

    #[cfg(unix)]
    {
        std::os::unix::fs::symlink(target, link)
    }

    #[cfg(not(unix))]
    {
        tracing::warn!(
            "Symlinks are not supported here; not linking {} to {}",
            link.display(),
            target.display()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::OptionValue;
    use chrono::TimeZone;

    #[test]
    fn test_result_throughput() {
        let start = Local.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let end = Local.with_ymd_and_hms(2024, 3, 1, 12, 0, 4).unwrap();

        let mut options = OptionMap::new();
        options.insert("num-ops".to_string(), OptionValue::Int(1000));
        let result = MeasurementResult::new("benchmark", options, start, end, 1000);

        assert_eq!(result.elapsed_time(), 4.0);
        assert_eq!(result.throughput(), 250.0);
        assert_eq!(
            result.summary(),
            "### Summary:\nOptions: num-ops=`1000`\nElapsed: 4\nThroughput: 250"
        );
    }

    #[test]
    fn test_result_json() {
        let start = Local.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let result = MeasurementResult::new("benchmark", OptionMap::new(), start, start, 10);

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["target"], "benchmark");
        assert_eq!(json["num-operations"], 10);
        assert_eq!(json["throughput"], 0.0);
    }

    #[test]
    fn test_relink_replaces_existing_link() {
        let dir = tempfile::TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("a")).unwrap();
        fs::create_dir_all(dir.path().join("b")).unwrap();
        let link = dir.path().join("current");

        relink(&link, Path::new("a")).unwrap();
        relink(&link, Path::new("b")).unwrap();

        #[cfg(unix)]
        assert_eq!(fs::read_link(&link).unwrap(), Path::new("b"));

        remove_link(&link).unwrap();
        remove_link(&link).unwrap();
    }
}
