use std::time::Duration;

use tokio::time::{sleep, Instant};

/// Per-substream token bucket pacing the exposer→accessor direction.
///
/// Capacity and refill rate are both `kbps * 1024` bytes (per second). A chunk
/// that fits the available tokens is debited and forwarded immediately; a
/// partial fit debits what's there and sleeps `ceil(deficit / rate * 1000)`
/// milliseconds before retrying. `kbps == 0` disables pacing entirely.
pub struct Throttle {
    rate: u64,
    capacity: u64,
    tokens: u64,
    last_refill: Instant,
}

impl Throttle {
    pub fn new(kbps: u64) -> Self {
        let rate = kbps * 1024;
        Self {
            rate,
            capacity: rate,
            tokens: rate,
            last_refill: Instant::now(),
        }
    }

    /// Waits until `len` bytes may be forwarded.
    pub async fn admit(&mut self, len: usize) {
        if self.rate == 0 {
            return;
        }

        let mut remaining = len as u64;
        loop {
            self.refill();

            let take = remaining.min(self.tokens);
            self.tokens -= take;
            remaining -= take;
            if remaining == 0 {
                return;
            }

            // Chunks larger than the bucket drain it in capacity-sized slices.
            let deficit = remaining.min(self.capacity);
            let delay_ms = (deficit * 1000).div_ceil(self.rate).max(1);
            sleep(Duration::from_millis(delay_ms)).await;
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed_ms = now.duration_since(self.last_refill).as_millis() as u64;
        let add = self.rate * elapsed_ms / 1000;
        if add > 0 {
            self.tokens = (self.tokens + add).min(self.capacity);
            self.last_refill = now;
        }
    }
}
