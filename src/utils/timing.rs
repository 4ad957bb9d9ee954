use std::time::{Duration, Instant};

use crate::logging::Logger;

/// Runs `task`, logs its wall time at debug level and hands the elapsed
/// duration back alongside the result.
pub fn measure_execution<T, F>(
    task_name: &str,
    context: Option<&str>,
    logger: &Logger,
    task: F,
) -> (T, Duration)
where
    F: FnOnce() -> T,
{
    let started_at = Instant::now();
    let result = task();
    let elapsed = started_at.elapsed();
    logger.debug(
        context,
        &format!(
            "task '{task_name}' finished in {}",
            format_duration_human_friendly(elapsed)
        ),
    );
    (result, elapsed)
}

pub fn format_duration_human_friendly(duration: Duration) -> String {
    let total_ms = duration.as_secs_f64() * 1000.0;
    if total_ms < 1_000.0 {
        return format!("{total_ms:.2} ms");
    }

    let total_seconds = total_ms / 1_000.0;
    if total_seconds < 60.0 {
        return format!("{total_seconds:.2} s");
    }

    let minutes = (total_seconds / 60.0).floor();
    format!("{minutes:.0}m {:.2}s", total_seconds - minutes * 60.0)
}
