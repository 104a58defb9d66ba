//! Summary statistics for throughput and latency samples.

use std::time::Duration;

/// Megabits per second for `bytes` moved over `elapsed`:
/// `(bytes × 8) / (elapsed_ms × 1000)`.
///
/// Returns `None` for a zero-length window instead of dividing by zero.
pub fn throughput_mbps(bytes: u64, elapsed: Duration) -> Option<f64> {
    let elapsed_ms = elapsed.as_secs_f64() * 1000.0;
    if elapsed_ms <= 0.0 {
        return None;
    }
    Some((bytes as f64 * 8.0) / (elapsed_ms * 1000.0))
}

/// Arithmetic mean, 0 for an empty sample set.
pub fn mean(samples: &[f64]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.iter().sum::<f64>() / samples.len() as f64
}

/// Population standard deviation rounded to the nearest integer.
/// Fewer than two samples yield 0.
pub fn jitter_ms(samples: &[f64]) -> u32 {
    if samples.len() < 2 {
        return 0;
    }
    let avg = mean(samples);
    let variance = samples.iter().map(|x| (x - avg).powi(2)).sum::<f64>() / samples.len() as f64;
    variance.sqrt().round() as u32
}
