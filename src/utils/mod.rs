pub mod csv_merge;
pub mod error;
pub mod logger;
pub mod plot;
pub mod validation;
