//! Process statistics reported by the health check.

use std::time::Instant;

/// Seconds since `started_at`.
pub fn uptime_seconds(started_at: Instant) -> f64 {
    started_at.elapsed().as_secs_f64()
}

/// Resident set size in megabytes, read from `/proc/self/statm`.
/// Reports 0.0 where procfs is unavailable.
pub fn memory_usage_mb() -> f64 {
    std::fs::read_to_string("/proc/self/statm")
        .ok()
        .and_then(|statm| parse_statm_rss_pages(&statm))
        .map(|pages| round2(pages as f64 * PAGE_SIZE as f64 / (1024.0 * 1024.0)))
        .unwrap_or(0.0)
}

const PAGE_SIZE: u64 = 4096;

fn parse_statm_rss_pages(statm: &str) -> Option<u64> {
    statm.split_whitespace().nth(1)?.parse().ok()
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
