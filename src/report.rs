//! Final run report.

use std::time::Duration;

use console::style;

use crate::store::{CheckpointRecord, ReferenceMetric, RunSummary};

/// Inventory size used for the "full inventory" duration estimate.
const FULL_INVENTORY_ESTIMATE_TARGET: usize = 2000;

/// Everything the operator sees at the end of a run.
pub struct RunReport {
    pub summary: RunSummary,
    pub checkpoint: CheckpointRecord,
    pub average_success_secs: Option<f64>,
    pub estimated_full_inventory_secs: Option<f64>,
    pub terminal_failures: Vec<ReferenceMetric>,
}

impl RunReport {
    /// Clean drain even with terminal failures exits zero; only fatal setup
    /// failures are non-zero, and those never reach report printing.
    pub fn print(&self) {
        let line = "=".repeat(60);
        println!("\n{line}");
        println!("{}", style("FINAL REPORT").bold());
        println!("{line}");
        println!("Total inventory      : {}", self.summary.total_inventory);
        println!("Attempted this run   : {}", self.summary.attempted);
        println!(
            "Succeeded            : {}",
            style(self.summary.succeeded).green()
        );
        let failed = style(self.summary.failed);
        println!(
            "Failed               : {}",
            if self.summary.failed > 0 {
                failed.red()
            } else {
                failed
            }
        );
        println!("Remaining            : {}", self.summary.remaining);
        println!(
            "Runtime              : {}",
            format_duration(Duration::from_secs_f64(self.summary.runtime_seconds))
        );

        // Checkpoint counters span every run against this run directory.
        println!(
            "Cumulative           : {} succeeded, {} failed",
            self.checkpoint.succeeded, self.checkpoint.failed
        );

        match self.average_success_secs {
            Some(avg) => println!("Average per PDF      : {avg:.1}s"),
            None => println!("Average per PDF      : n/a (no successful downloads)"),
        }
        if let Some(estimate) = self.estimated_full_inventory_secs {
            println!(
                "Est. {} PDFs       : {}",
                FULL_INVENTORY_ESTIMATE_TARGET,
                format_duration(Duration::from_secs_f64(estimate))
            );
        }

        if !self.terminal_failures.is_empty() {
            println!("\n{}", style("Terminal failures:").red().bold());
            for failure in &self.terminal_failures {
                println!(
                    "  {}  {}",
                    failure.reference,
                    failure.error.as_deref().unwrap_or("unknown error")
                );
            }
        }
        println!("{line}\n");
    }
}

fn format_duration(duration: Duration) -> String {
    let total = duration.as_secs();
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;
    if hours > 0 {
        format!("{hours}h {minutes:02}m {seconds:02}s")
    } else if minutes > 0 {
        format!("{minutes}m {seconds:02}s")
    } else {
        format!("{seconds}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_format_humanely() {
        assert_eq!(format_duration(Duration::from_secs(42)), "42s");
        assert_eq!(format_duration(Duration::from_secs(125)), "2m 05s");
        assert_eq!(format_duration(Duration::from_secs(7265)), "2h 01m 05s");
    }
}
