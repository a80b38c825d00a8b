use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Source of UNIX time in nanoseconds.
pub trait Clock: Send + Sync {
    fn now_ns(&self) -> u64;
}

struct Base {
    instant: Instant,
    unix_ns: u128,
}

fn base() -> &'static Base {
    static BASE: OnceLock<Base> = OnceLock::new();
    BASE.get_or_init(|| {
        let unix_ns = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_nanos();
        Base {
            instant: Instant::now(),
            unix_ns,
        }
    })
}

/// Wall clock sampled once and advanced with `Instant`, so readings never go
/// backwards within a process.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    #[inline]
    fn now_ns(&self) -> u64 {
        let b = base();
        b.unix_ns.saturating_add(b.instant.elapsed().as_nanos()) as u64
    }
}

/// Manually driven clock for deterministic reports.
#[derive(Debug, Default)]
pub struct FixedClock(AtomicU64);

impl FixedClock {
    pub fn new(now_ns: u64) -> Self {
        Self(AtomicU64::new(now_ns))
    }

    pub fn advance(&self, by: Duration) {
        self.0.fetch_add(by.as_nanos() as u64, Ordering::Relaxed);
    }
}

impl Clock for FixedClock {
    fn now_ns(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_clock_is_monotonic() {
        let a = SystemClock.now_ns();
        let b = SystemClock.now_ns();
        assert!(b >= a);
        assert!(a > 1_600_000_000_000_000_000);
    }

    #[test]
    fn fixed_clock_advances() {
        let clock = FixedClock::new(5);
        clock.advance(Duration::from_micros(1));
        assert_eq!(clock.now_ns(), 1_005);
    }
}
