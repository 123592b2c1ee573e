use clap::Parser;
use std::path::PathBuf;
use tracing::error;
use tracing_subscriber::EnvFilter;
use warden::daemon::{Daemon, DaemonOptions};

/// Warden supervisor daemon (runs in the foreground)
#[derive(Parser, Debug)]
#[command(name = "warden-daemon")]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file (.toml or .json)
    #[arg(short, long)]
    config: PathBuf,

    /// Control socket path, overriding the configuration file
    #[arg(long)]
    socket: Option<PathBuf>,

    /// PID file path, overriding the configuration file
    #[arg(long)]
    pid_file: Option<PathBuf>,

    /// Log filter such as `info` or `warden=debug`; defaults to RUST_LOG
    #[arg(long)]
    log_level: Option<String>,
}

fn init_logging(args: &Args) {
    let filter = match args.log_level {
        Some(ref level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(&args);

    let options = DaemonOptions {
        config_path: args.config,
        socket_path: args.socket,
        pid_file: args.pid_file,
    };

    let result = match Daemon::new(options) {
        Ok(daemon) => daemon.run().await,
        Err(e) => Err(e),
    };

    if let Err(e) = result {
        error!("{}", e);
        std::process::exit(e.exit_code());
    }
}
