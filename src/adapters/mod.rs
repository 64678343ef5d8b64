// Adapters layer: concrete implementations for external systems (ssh, rsync)

pub mod rsync;
pub mod ssh;

pub use ssh::SshShell;
