//! Terminal output for the hashsync CLI

use console::style;
use hashsync_engine::PlanSummary;
use hashsync_types::{ChecksumMismatch, RunStats};
use std::time::Duration;

/// Print the plan a pending run is about to execute
pub fn display_plan(summary: &PlanSummary) {
    println!();
    println!(
        "{} {}",
        style("⟲").blue().bold(),
        style(format!("Plan ({})", summary.mode)).bold().underlined()
    );
    println!(
        "  Install path: {}",
        style(summary.install_root.display()).cyan()
    );
    println!("  Manifest entries: {}", style(summary.target_entries).cyan());
    println!(
        "  Blobs to download: {} ({})",
        style(summary.blobs_to_fetch).green(),
        style(format_bytes(summary.bytes_to_fetch)).green()
    );
    if summary.bytes_already_staged > 0 {
        println!(
            "  Already staged: {} (remaining {})",
            style(format_bytes(summary.bytes_already_staged)).dim(),
            style(format_bytes(summary.bytes_remaining())).green().bold()
        );
    }
    println!("  Files to place: {}", style(summary.files_to_place).green());
    println!(
        "  Reused locally: {} ({} already in place)",
        style(summary.files_reused + summary.files_in_place).cyan(),
        summary.files_in_place
    );
    if summary.files_to_remove > 0 {
        println!("  Files to remove: {}", style(summary.files_to_remove).yellow());
    }
    if summary.renames > 0 {
        println!("  Directory renames: {}", style(summary.renames).yellow());
    }
}

/// Print statistics of a finished run
pub fn display_run_stats(stats: &RunStats) {
    println!();
    println!("{}", style("Run Statistics:").bold().underlined());
    println!(
        "  Blobs fetched: {} ({} already staged)",
        style(stats.files_fetched).green(),
        stats.files_already_staged
    );
    println!(
        "  Bytes downloaded: {}",
        style(format_bytes(stats.bytes_downloaded)).green()
    );
    println!("  Files placed: {}", style(stats.files_placed).green());
    println!("  Files reused: {}", style(stats.files_reused).cyan());
    println!("  Files removed: {}", style(stats.files_removed).yellow());
    if stats.directories_renamed > 0 {
        println!(
            "  Directories renamed: {}",
            style(stats.directories_renamed).yellow()
        );
    }
    println!(
        "  Duration: {}",
        style(format_duration(stats.duration)).blue()
    );
    println!(
        "  Download rate: {}/s",
        style(format_bytes(stats.transfer_rate() as u64)).blue()
    );
}

/// Print the files that failed verification
pub fn display_mismatches(files: &[ChecksumMismatch]) {
    for file in files {
        match file.actual {
            Some(_) => println!("  {} {}", style("✗").red().bold(), style(file).red()),
            None => println!(
                "  {} {} {}",
                style("?").yellow().bold(),
                style(&file.name).yellow(),
                style("(missing or unreadable)").dim()
            ),
        }
    }
}

/// Format bytes in human-readable format
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.2} {}", size, UNITS[unit_index])
    }
}

/// Format duration in human-readable format
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs < 60 {
        format!("{:.2}s", duration.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}

/// ETA text, `-` while unknown
pub fn format_eta(eta: Option<Duration>) -> String {
    eta.map_or_else(|| "-".to_string(), |eta| format_duration(Duration::from_secs(eta.as_secs())))
}

/// Display a warning message with proper formatting
pub fn display_warning(message: &str) {
    eprintln!("{} {}", style("⚠").yellow().bold(), style(message).yellow());
}

/// Display an error message with proper formatting
pub fn display_error(message: &str) {
    eprintln!("{} {}", style("✗").red().bold(), style(message).red());
}

/// Display a success message with proper formatting
pub fn display_success(message: &str) {
    println!("{} {}", style("✓").green().bold(), style(message).green());
}

/// Display an info message with proper formatting
pub fn display_info(message: &str) {
    println!("{} {}", style("ℹ").blue().bold(), style(message).blue());
}
