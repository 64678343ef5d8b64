pub mod adapters;
pub mod config;
pub mod core;
pub mod domain;
pub mod utils;

pub use adapters::SshShell;
pub use config::{Cluster, Configuration};
pub use core::measurement::{MeasurementResult, MeasurementSession};
pub use core::run::{BackgroundRun, OptionMap, PreludeChoice, RunOptions, Runner};
pub use core::selector::{parse_selector, MachineSet, Selection, Selector, Slice};
pub use domain::model::{Machine, OptionValue};
pub use utils::error::{Result, WkeError};
