//! Write-bandwidth token bucket.
//!
//! Shared by every table builder of an engine so that the total
//! compaction write rate stays under `bytes_per_second`. A non-positive
//! rate disables limiting.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

pub struct RateLimiter {
    inner: Option<Mutex<Bucket>>,
}

struct Bucket {
    bytes_per_second: u64,
    available: f64,
    last_refill: Instant,
}

impl RateLimiter {
    pub fn new(bytes_per_second: i64) -> Self {
        let inner = (bytes_per_second > 0).then(|| {
            Mutex::new(Bucket {
                bytes_per_second: bytes_per_second as u64,
                available: bytes_per_second as f64,
                last_refill: Instant::now(),
            })
        });
        Self { inner }
    }

    pub fn is_unlimited(&self) -> bool {
        self.inner.is_none()
    }

    /// Takes `n` tokens, sleeping until the bucket can cover them.
    pub fn acquire(&self, n: usize) {
        let Some(inner) = &self.inner else {
            return;
        };
        let wait = {
            let mut bucket = inner.lock();
            bucket.refill();
            bucket.available -= n as f64;
            if bucket.available >= 0.0 {
                None
            } else {
                let deficit = -bucket.available;
                Some(Duration::from_secs_f64(
                    deficit / bucket.bytes_per_second as f64,
                ))
            }
        };
        if let Some(wait) = wait {
            std::thread::sleep(wait);
        }
    }
}

impl Bucket {
    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        // Cap at one second of burst.
        self.available = (self.available + elapsed * self.bytes_per_second as f64)
            .min(self.bytes_per_second as f64);
    }
}
