use crate::library::config::Direction;
use std::{fmt, time::Duration};

/// Anything shorter than this is noise, not a measurement.
pub const MIN_RELIABLE_SECS: f64 = 0.001;

/// Megabits per second, or 0 when the sample is too short or empty.
pub fn throughput_mbps(bytes: u64, elapsed_secs: f64) -> f64 {
    if elapsed_secs > MIN_RELIABLE_SECS && bytes > 0 {
        (bytes as f64 * 8.0) / elapsed_secs / 1_000_000.0
    } else {
        0.0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregateStats {
    pub submitted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub total_bytes: u64,
    pub elapsed: Duration,
    pub mbps: f64,
}

impl AggregateStats {
    pub fn new(submitted: usize, succeeded: usize, total_bytes: u64, elapsed: Duration) -> Self {
        AggregateStats {
            submitted,
            succeeded,
            failed: submitted.saturating_sub(succeeded),
            total_bytes,
            elapsed,
            mbps: throughput_mbps(total_bytes, elapsed.as_secs_f64()),
        }
    }
}

/// A transfer that did not make it, and where it was headed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferFailure {
    pub slot: usize,
    pub target: String,
    pub reason: String,
}

/// Results of one download or upload phase.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseReport {
    pub direction: Direction,
    pub stats: AggregateStats,
    pub failures: Vec<TransferFailure>,
}

impl PhaseReport {
    fn speed_line(&self) -> String {
        let stats = &self.stats;
        let secs: f64 = stats.elapsed.as_secs_f64();
        if stats.mbps > 0.0 {
            format!("Speed: {:.2} Mbps", stats.mbps)
        } else if stats.total_bytes > 0 && secs <= MIN_RELIABLE_SECS {
            "Speed: N/A (duration too short for reliable calculation, but data was transferred)"
                .to_string()
        } else if stats.total_bytes == 0 && secs > MIN_RELIABLE_SECS {
            "Speed: 0.00 Mbps (no data transferred)".to_string()
        } else {
            "Speed: N/A (no data transferred or duration too short)".to_string()
        }
    }
}

impl fmt::Display for PhaseReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stats = &self.stats;
        writeln!(f, "--- {} Test Results ---", self.direction.title())?;
        writeln!(f, "Connections: {}", stats.submitted)?;
        writeln!(f, "Succeeded: {}", stats.succeeded)?;
        writeln!(f, "Failed: {}", stats.failed)?;
        for failure in self.failures.iter() {
            writeln!(f, "  #{} {}: {}", failure.slot, failure.target, failure.reason)?;
        }
        writeln!(f, "Total Bytes: {}", stats.total_bytes)?;
        writeln!(f, "Time Taken: {:.2} seconds", stats.elapsed.as_secs_f64())?;
        writeln!(f, "{}", self.speed_line())?;
        write!(f, "---------------------------")
    }
}
