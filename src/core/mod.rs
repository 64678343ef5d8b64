pub mod collector;
pub mod command;
pub mod measurement;
pub mod run;
pub mod selector;
pub mod task;

pub use crate::domain::model::{Machine, OptionValue};
pub use crate::domain::ports::{OutputSink, RemoteShell};
pub use crate::utils::error::Result;
