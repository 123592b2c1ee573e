// Library exports for the warden process supervisor

pub mod cli;
pub mod config;
pub mod cron;
pub mod daemon;
pub mod error;
pub mod ipc;
pub mod process;
pub mod supervisor;
