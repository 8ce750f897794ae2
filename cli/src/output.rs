//! Output formatting

use clap::ValueEnum;
use colored::Colorize;
use serde::Serialize;
use tabled::settings::Style;
use tabled::{Table, Tabled};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Table,
    Json,
    Yaml,
}

impl OutputFormat {
    /// Single value. Tables fall back to pretty JSON.
    pub fn print<T: Serialize + ?Sized>(&self, data: &T) -> anyhow::Result<()> {
        match self {
            OutputFormat::Json | OutputFormat::Table => {
                println!("{}", serde_json::to_string_pretty(data)?);
            }
            OutputFormat::Yaml => {
                print!("{}", serde_yaml::to_string(data)?);
            }
        }
        Ok(())
    }

    /// List of values; `row` picks the table columns
    pub fn print_rows<'a, T, R, F>(&self, data: &'a [T], row: F) -> anyhow::Result<()>
    where
        T: Serialize,
        R: Tabled,
        F: Fn(&'a T) -> R,
    {
        match self {
            OutputFormat::Table => {
                if data.is_empty() {
                    println!("{}", "(none)".dimmed());
                } else {
                    let mut table = Table::new(data.iter().map(row));
                    table.with(Style::rounded());
                    println!("{table}");
                }
                Ok(())
            }
            _ => self.print(data),
        }
    }
}

/// Colour a status word for terminal tables
pub fn status_cell(status: &str) -> String {
    match status {
        "complete" | "success" | "valid" => status.green().to_string(),
        "failed" | "failure" | "invalid" => status.red().bold().to_string(),
        "running" | "pending" => status.yellow().to_string(),
        other => other.to_string(),
    }
}

/// Human-readable byte count
pub fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_human_size() {
        assert_eq!(human_size(512), "512 B");
        assert_eq!(human_size(2048), "2.0 KiB");
        assert_eq!(human_size(5 * 1024 * 1024), "5.0 MiB");
    }

    #[test]
    fn test_status_cell_keeps_text() {
        colored::control::set_override(false);
        assert_eq!(status_cell("complete"), "complete");
        assert_eq!(status_cell("unknown"), "unknown");
    }
}
