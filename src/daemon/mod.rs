// Daemon module - PID file, lifecycle and the foreground service

pub mod manager;
pub mod pid;
pub mod service;

pub use manager::{DaemonManager, DaemonStatus};
pub use pid::PidFile;
pub use service::{Daemon, DaemonContext, DaemonOptions};
