// Output formatting and display for CLI

use crate::ipc::ResponseData;
use crate::process::{ProcessInfo, ProcessState};
use crate::supervisor::ReloadSummary;
use chrono::{DateTime, Local};
use colored::*;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::{Duration, SystemTime};
use tabled::{
    settings::{object::Rows, Alignment, Modify, Style},
    Table, Tabled,
};

/// Print a success response to stdout
pub fn print_success(data: &ResponseData) {
    match data {
        ResponseData::Started { name } => {
            println!("{} {}", "✓ Started".green().bold(), name.cyan());
        }

        ResponseData::Stopped { name } => {
            println!("{} {}", "✓ Stopped".green().bold(), name.cyan());
        }

        ResponseData::Restarted { name } => {
            println!("{} {}", "✓ Restarted".green().bold(), name.cyan());
        }

        ResponseData::Status { processes } => match processes.as_slice() {
            [] => println!("{}", "No processes are configured".yellow()),
            [process] => print_detailed_status(process),
            _ => print_process_table(processes),
        },

        ResponseData::Reloaded { summary } => print_reload_summary(summary),

        ResponseData::DaemonStatus {
            pid,
            uptime,
            processes,
            config_path,
        } => {
            println!("{}", "✓ Daemon is running".green().bold());
            println!("  {:<10} {}", "PID:".bold(), pid);
            println!("  {:<10} {}", "Uptime:".bold(), format_duration(uptime));
            println!("  {:<10} {}", "Processes:".bold(), processes);
            if let Some(path) = config_path {
                println!("  {:<10} {}", "Config:".bold(), path.display());
            }
        }

        ResponseData::ShuttingDown => {
            println!("{}", "✓ Daemon is shutting down".green().bold());
        }
    }
}

/// Print an error message to stderr
pub fn print_error(error: &str) {
    eprintln!("{} {}", "✗ Error:".red().bold(), error);
}

pub fn print_info(message: &str) {
    println!("{} {}", "ℹ".blue().bold(), message);
}

fn print_process_table(processes: &[ProcessInfo]) {
    #[derive(Tabled)]
    struct ProcessRow {
        #[tabled(rename = "Name")]
        name: String,
        #[tabled(rename = "State")]
        state: String,
        #[tabled(rename = "PID")]
        pid: String,
        #[tabled(rename = "Uptime")]
        uptime: String,
        #[tabled(rename = "Restarts")]
        restarts: String,
        #[tabled(rename = "Crashes")]
        crashes: String,
        #[tabled(rename = "Next cron")]
        next_cron: String,
    }

    let rows: Vec<ProcessRow> = processes
        .iter()
        .map(|p| ProcessRow {
            name: truncate(&p.name, 24),
            state: format_state_colored(&p.state),
            pid: p
                .pid
                .map(|pid| pid.to_string())
                .unwrap_or_else(|| "-".to_string()),
            uptime: format_duration(&p.uptime),
            restarts: p.restarts.to_string(),
            crashes: format!("{}/{}", p.crashes_in_window, p.max_restarts),
            next_cron: p
                .next_cron_restart
                .map(format_time)
                .unwrap_or_else(|| "-".to_string()),
        })
        .collect();

    let mut table = Table::new(rows);
    table
        .with(Style::rounded())
        .with(Modify::new(Rows::first()).with(Alignment::center()));

    println!("\n{}\n", table);
    println!(
        "{}",
        format!("Total: {} process(es)", processes.len())
            .dimmed()
            .italic()
    );
}

/// Detailed view of a single process
pub fn print_detailed_status(process: &ProcessInfo) {
    println!("\n{}", "Process Details".bold().underline());
    println!();
    println!("  {:<15} {}", "Name:".bold(), process.name.cyan());
    println!(
        "  {:<15} {}",
        "State:".bold(),
        format_state_colored(&process.state)
    );

    if let Some(pid) = process.pid {
        println!("  {:<15} {}", "PID:".bold(), pid);
    }
    if let Some(started_at) = process.started_at {
        println!("  {:<15} {}", "Started:".bold(), format_time(started_at));
    }

    println!(
        "  {:<15} {}",
        "Uptime:".bold(),
        format_duration(&process.uptime)
    );
    println!("  {:<15} {}", "Restarts:".bold(), process.restarts);
    println!(
        "  {:<15} {}/{} in window",
        "Crashes:".bold(),
        process.crashes_in_window,
        process.max_restarts
    );

    if let Some(exit) = process.last_exit {
        println!("  {:<15} {}", "Last exit:".bold(), exit);
    }

    if let Some(ref cron) = process.cron_restart {
        println!("  {:<15} {}", "Cron restart:".bold(), cron);
    }
    if let Some(next) = process.next_cron_restart {
        println!("  {:<15} {}", "Next restart:".bold(), format_time(next));
    }

    println!();
}

fn print_reload_summary(summary: &ReloadSummary) {
    println!("{}", "✓ Configuration reloaded".green().bold());

    let groups = [
        ("Added", &summary.added),
        ("Removed", &summary.removed),
        ("Changed", &summary.changed),
        ("Unchanged", &summary.unchanged),
    ];
    for (label, names) in groups {
        if !names.is_empty() {
            println!("  {:<10} {}", format!("{}:", label).bold(), names.join(", "));
        }
    }

    for rejected in &summary.rejected {
        println!(
            "  {} {}: {}",
            "Rejected".yellow().bold(),
            rejected.name,
            rejected.error
        );
    }
    for failed in &summary.failed {
        println!(
            "  {} {}: {}",
            "Failed".red().bold(),
            failed.name,
            failed.error
        );
    }
}

fn format_state_colored(state: &ProcessState) -> String {
    match state {
        ProcessState::Running => state.to_string().green().to_string(),
        ProcessState::Starting | ProcessState::Restarting | ProcessState::Stopping => {
            state.to_string().yellow().to_string()
        }
        ProcessState::Stopped => state.to_string().bright_black().to_string(),
        ProcessState::Failed => state.to_string().red().bold().to_string(),
    }
}

fn format_time(time: SystemTime) -> String {
    let datetime: DateTime<Local> = time.into();
    datetime.format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Format a duration in human-readable format
fn format_duration(duration: &Duration) -> String {
    let secs = duration.as_secs();

    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        let mins = secs / 60;
        let secs = secs % 60;
        if secs > 0 {
            format!("{}m {}s", mins, secs)
        } else {
            format!("{}m", mins)
        }
    } else if secs < 86400 {
        let hours = secs / 3600;
        let mins = (secs % 3600) / 60;
        if mins > 0 {
            format!("{}h {}m", hours, mins)
        } else {
            format!("{}h", hours)
        }
    } else {
        let days = secs / 86400;
        let hours = (secs % 86400) / 3600;
        if hours > 0 {
            format!("{}d {}h", days, hours)
        } else {
            format!("{}d", days)
        }
    }
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

/// Spinner for commands that wait on a stop
pub fn create_progress_bar(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    let style = ProgressStyle::default_spinner()
        .template("{spinner:.green} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
    pb.set_style(style);
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

pub fn finish_progress_error(pb: ProgressBar, message: &str) {
    pb.finish_with_message(format!("{} {}", "✗".red(), message));
}
