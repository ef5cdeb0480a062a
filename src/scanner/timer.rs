use rand::Rng;
use std::time::Duration;

/// Random delay in `[0, interval)` so scanners started together do not all
/// poll their workers in the same instant.
pub fn initial_stagger(interval: Duration) -> Duration {
    let max_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
    if max_ms == 0 {
        return Duration::ZERO;
    }
    let mut rng = rand::thread_rng();
    Duration::from_millis(rng.gen_range(0..max_ms))
}
