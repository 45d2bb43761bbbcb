//! Output formatting for CLI

use clap::ValueEnum;
use colored::Colorize;
use comfy_table::{presets::UTF8_FULL, Cell, Color, ContentArrangement, Table};
use serde::Serialize;

use tandem_orchestrator::aggregator::{DeviceComparison, FailurePattern};
use tandem_orchestrator::AggregatedResult;

/// Output format
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
pub enum OutputFormat {
    /// Human-readable tables and summary
    #[default]
    Table,
    /// JSON format
    Json,
}

fn table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table
}

fn rate_cell(rate: f64) -> Cell {
    let cell = Cell::new(format!("{rate:.1}%"));
    if rate >= 100.0 {
        cell.fg(Color::Green)
    } else if rate > 0.0 {
        cell.fg(Color::Yellow)
    } else {
        cell.fg(Color::Red)
    }
}

/// Per-device side-by-side table
pub fn device_table(devices: &[DeviceComparison]) -> Table {
    let mut table = table();
    table.set_header(vec!["Device", "Steps", "Passed", "Failed", "Success", "Duration", "Avg step"]);
    for d in devices {
        table.add_row(vec![
            Cell::new(&d.alias),
            Cell::new(d.total_steps),
            Cell::new(d.passed_steps),
            Cell::new(d.failed_steps),
            rate_cell(d.success_rate),
            Cell::new(format!("{}ms", d.total_duration_ms)),
            Cell::new(format!("{:.0}ms", d.average_step_duration_ms)),
        ]);
    }
    table
}

pub fn pattern_table(patterns: &[FailurePattern]) -> Table {
    let mut table = table();
    table.set_header(vec!["Count", "Devices", "Likely cause", "Pattern"]);
    for p in patterns {
        table.add_row(vec![
            Cell::new(p.occurrences),
            Cell::new(p.affected_devices.join(", ")),
            Cell::new(p.likely_cause.map(|c| c.to_string()).unwrap_or_else(|| "-".to_string())),
            Cell::new(&p.pattern),
        ]);
    }
    table
}

/// Print an aggregated run in the requested format
pub fn print_aggregated(aggregated: &AggregatedResult, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(aggregated),
        OutputFormat::Table => {
            println!("{}", device_table(&aggregated.device_comparison));
            if !aggregated.failure_patterns.is_empty() {
                println!();
                println!("{}", "Failure patterns".bold());
                println!("{}", pattern_table(&aggregated.failure_patterns));
            }
            println!();
            if aggregated.success {
                print_success(&aggregated.summary);
            } else {
                print_error(&aggregated.summary);
            }
        }
    }
}

pub fn print_json<T: Serialize + ?Sized>(value: &T) {
    println!("{}", serde_json::to_string_pretty(value).unwrap_or_default());
}

/// Print success message
pub fn print_success(message: &str) {
    println!("{} {}", "✓".green(), message);
}

/// Print error message
pub fn print_error(message: &str) {
    eprintln!("{} {}", "✗".red(), message);
}

/// Print warning message
pub fn print_warning(message: &str) {
    println!("{} {}", "!".yellow(), message);
}
