use std::time::{SystemTime, UNIX_EPOCH};

/// Millisecond wall-clock source for cache timestamps.
///
/// Injected at construction so TTL behavior can be exercised against a
/// controlled clock instead of ambient system time.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

/// System wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as u64)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_clock_is_monotonic_enough() {
        let clock = SystemClock;
        let first = clock.now_ms();
        let second = clock.now_ms();
        assert!(second >= first);
        // Sanity: later than 2020-01-01.
        assert!(first > 1_577_836_800_000);
    }
}
