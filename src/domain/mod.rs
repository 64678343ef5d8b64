// Domain layer: core models and ports (interfaces) shared by config, core and adapters.

pub mod model;
pub mod ports;
