//! Sliding-window throughput estimate

use std::time::{Duration, Instant};

use ringbuf::traits::{Consumer, Observer, RingBuffer};
use ringbuf::HeapRb;

/// Frames per second over the last `window`, capped at `capacity` samples.
pub struct FpsCounter {
    ticks: HeapRb<Instant>,
    window: Duration,
}

impl FpsCounter {
    pub fn new(window: Duration, capacity: usize) -> Self {
        Self {
            ticks: HeapRb::new(capacity.max(2)),
            window,
        }
    }

    pub fn tick(&mut self) {
        self.tick_at(Instant::now());
    }

    pub fn tick_at(&mut self, now: Instant) {
        self.ticks.push_overwrite(now);
        while let Some(oldest) = self.ticks.try_peek() {
            if now.saturating_duration_since(*oldest) > self.window {
                let _ = self.ticks.try_pop();
            } else {
                break;
            }
        }
    }

    /// 0.0 until at least two ticks span a non-zero interval
    pub fn fps(&self) -> f64 {
        let count = self.ticks.occupied_len();
        if count < 2 {
            return 0.0;
        }

        let (Some(first), Some(last)) = (self.ticks.iter().next(), self.ticks.iter().last()) else {
            return 0.0;
        };
        let span = last.saturating_duration_since(*first).as_secs_f64();
        if span == 0.0 {
            return 0.0;
        }

        (count - 1) as f64 / span
    }
}

impl Default for FpsCounter {
    fn default() -> Self {
        Self::new(Duration::from_secs(30), 1024)
    }
}
