use std::time::Duration;

use smithay::reexports::rustix::time::{clock_gettime, ClockId};

pub fn get_monotonic_time() -> Duration {
    let ts = clock_gettime(ClockId::Monotonic);
    Duration::new(ts.tv_sec as u64, ts.tv_nsec as u32)
}

/// Parses a duration in seconds, such as `2.5`.
pub fn parse_seconds(value: &str) -> Result<Duration, String> {
    let secs: f64 = value.parse().map_err(|err| format!("{err}"))?;
    if !secs.is_finite() || secs <= 0. {
        return Err(String::from("must be a positive number of seconds"));
    }
    Ok(Duration::from_secs_f64(secs))
}
