//! Spreads concurrent spoolers apart so admission retries don't thunder-herd
//! on the advisory lock.

use std::time::Duration;

use rand::Rng;

/// Amplitude of the uniform jitter added to every sleep: `[-250ms, +250ms]`.
pub const JITTER_MS: u64 = 250;

/// Base delay between admission retries once a job has been deferred.
pub const BASE_RETRY_PERIOD: Duration = Duration::from_secs(2);

/// A `+/- JITTER_MS` source, seeded from the OS's non-deterministic RNG once
/// per process (mirrors `rand::thread_rng()`, which lazily seeds itself the
/// first time it's used on a thread).
#[derive(Debug, Default)]
pub struct Jitter;

impl Jitter {
    pub fn new() -> Self {
        Self
    }

    /// A signed offset in `[-JITTER_MS, +JITTER_MS]` milliseconds.
    fn offset_ms(&self) -> i64 {
        rand::thread_rng().gen_range(-(JITTER_MS as i64)..=(JITTER_MS as i64))
    }

    /// `base + jitter`, clamped so it never goes negative.
    pub fn apply(&self, base: Duration) -> Duration {
        let offset = self.offset_ms();
        if offset >= 0 {
            base + Duration::from_millis(offset as u64)
        } else {
            base.saturating_sub(Duration::from_millis((-offset) as u64))
        }
    }

    /// The delay before the very first admission attempt: one jittered
    /// `JITTER_MS` window, with no base period added.
    pub fn initial_delay(&self) -> Duration {
        self.apply(Duration::from_millis(JITTER_MS))
    }

    /// The delay between one deferred admission attempt and the next.
    pub fn retry_delay(&self) -> Duration {
        self.apply(BASE_RETRY_PERIOD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_stays_within_bounds() {
        let jitter = Jitter::new();
        for _ in 0..1000 {
            let d = jitter.retry_delay();
            assert!(d >= BASE_RETRY_PERIOD - Duration::from_millis(JITTER_MS));
            assert!(d <= BASE_RETRY_PERIOD + Duration::from_millis(JITTER_MS));
        }
    }

    #[test]
    fn initial_delay_never_negative() {
        let jitter = Jitter::new();
        for _ in 0..1000 {
            let d = jitter.initial_delay();
            assert!(d <= Duration::from_millis(JITTER_MS * 2));
        }
    }
}
