use std::time::Duration;
use tokio::time::{Instant, sleep_until};

/// Paces open-loop sending to a fixed number of events per second.
///
/// Deadlines advance from the previous deadline rather than from the actual
/// send time, so short stalls are caught up instead of lowering the rate.
pub struct RateController {
    interval: Duration,
    next: Option<Instant>,
}

impl RateController {
    pub fn new(events_per_second: f64) -> Self {
        let interval = Duration::from_nanos((1_000_000_000.0 / events_per_second) as u64);
        Self {
            interval,
            next: None,
        }
    }

    /// Wait until it's time to send the next event
    pub async fn wait_for_next(&mut self) {
        let now = Instant::now();
        match self.next {
            Some(deadline) if deadline > now => {
                sleep_until(deadline).await;
                self.next = Some(deadline + self.interval);
            }
            // Fell behind by more than one interval: restart from now.
            Some(deadline) if now - deadline > self.interval => {
                self.next = Some(now + self.interval);
            }
            Some(deadline) => self.next = Some(deadline + self.interval),
            None => self.next = Some(now + self.interval),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_from_rate() {
        assert_eq!(RateController::new(1000.0).interval(), Duration::from_millis(1));
    }

    #[tokio::test(start_paused = true)]
    async fn paces_events() {
        let mut rc = RateController::new(100.0);
        let start = Instant::now();
        for _ in 0..11 {
            rc.wait_for_next().await;
        }
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(100), "{:?}", elapsed);
        assert!(elapsed < Duration::from_millis(120), "{:?}", elapsed);
    }
}
