//! Bandwidth Governor
//!
//! Owns the process-wide download budget: how many jobs may download at
//! once, how fast bytes may be delivered, and how large the next chunk
//! request should be given recent throughput.
//!
//! The concurrency check-and-increment happens inside one synchronous
//! critical section (a `std::sync::Mutex` never held across an `.await`),
//! so two jobs can never both observe the last free slot. Slots are returned
//! by dropping the [`DownloadPermit`].

use governor::{Quota, RateLimiter};
use std::collections::VecDeque;
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::config::DownloadConfig;

/// Number of throughput samples in the moving average
const THROUGHPUT_WINDOW: usize = 5;

/// Above this average (megabits/s) chunks grow ×1.5
const FAST_MBPS: f64 = 2.0;

/// Below this average (megabits/s) chunks shrink ×0.75
const SLOW_MBPS: f64 = 0.5;

type ByteLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Snapshot of the global budget
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BandwidthBudget {
    pub max_concurrent_downloads: usize,
    /// 0 = unlimited
    pub max_bytes_per_second: u64,
    pub active_count: usize,
}

#[derive(Debug)]
struct BudgetState {
    max_concurrent: usize,
    active: usize,
    /// Highest `active` ever observed
    peak: usize,
}

/// Adaptive chunk sizing from a moving average of recent throughput
#[derive(Debug, Clone)]
pub struct ChunkSizer {
    current: u64,
    min: u64,
    max: u64,
    /// Megabits per second, newest last
    samples: VecDeque<f64>,
}

impl ChunkSizer {
    pub fn new(initial: u64, min: u64, max: u64) -> Self {
        Self {
            current: initial.clamp(min, max),
            min,
            max,
            samples: VecDeque::with_capacity(THROUGHPUT_WINDOW),
        }
    }

    /// Record one completed chunk and adjust the recommended size
    pub fn record(&mut self, bytes: u64, elapsed: Duration) {
        let secs = elapsed.as_secs_f64();
        if bytes == 0 || secs <= 0.0 {
            return;
        }

        let mbps = (bytes as f64 * 8.0) / secs / 1_000_000.0;
        if self.samples.len() == THROUGHPUT_WINDOW {
            self.samples.pop_front();
        }
        self.samples.push_back(mbps);

        let average = self.average_mbps().unwrap_or(mbps);
        let previous = self.current;
        if average > FAST_MBPS {
            self.current = ((self.current as f64 * 1.5) as u64).min(self.max);
        } else if average < SLOW_MBPS {
            self.current = ((self.current as f64 * 0.75) as u64).max(self.min);
        }

        if previous != self.current {
            trace!(
                average_mbps = average,
                from = previous,
                to = self.current,
                "Chunk size adjusted"
            );
        }
    }

    pub fn chunk_size(&self) -> u64 {
        self.current
    }

    pub fn average_mbps(&self) -> Option<f64> {
        if self.samples.is_empty() {
            None
        } else {
            Some(self.samples.iter().sum::<f64>() / self.samples.len() as f64)
        }
    }

    /// Moving-average throughput in bytes per second
    pub fn bytes_per_second(&self) -> u64 {
        self.average_mbps()
            .map(|mbps| (mbps * 1_000_000.0 / 8.0) as u64)
            .unwrap_or(0)
    }
}

struct Inner {
    budget: Mutex<BudgetState>,
    released: Notify,
    sizer: Mutex<ChunkSizer>,
    limiter: Option<ByteLimiter>,
    /// Largest single request the limiter accepts
    burst: NonZeroU32,
    max_bytes_per_second: u64,
}

impl Inner {
    fn budget(&self) -> MutexGuard<'_, BudgetState> {
        // State is plain counters; a poisoned lock still holds valid data
        self.budget.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn sizer(&self) -> MutexGuard<'_, ChunkSizer> {
        self.sizer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Process-wide bandwidth budget shared by all download jobs
///
/// Cloning shares the same budget.
#[derive(Clone)]
pub struct BandwidthGovernor {
    inner: Arc<Inner>,
}

impl BandwidthGovernor {
    /// Create a governor
    ///
    /// # Arguments
    ///
    /// * `max_concurrent` - Jobs allowed to download at once (at least 1)
    /// * `max_bytes_per_second` - Delivery cap; 0 disables throttling
    /// * `sizer` - Chunk sizing policy
    pub fn new(max_concurrent: usize, max_bytes_per_second: u64, sizer: ChunkSizer) -> Self {
        let rate = u32::try_from(max_bytes_per_second).unwrap_or(u32::MAX);
        let (limiter, burst) = match NonZeroU32::new(rate) {
            Some(per_second) => (Some(RateLimiter::direct(Quota::per_second(per_second))), per_second),
            None => (None, NonZeroU32::MIN),
        };

        Self {
            inner: Arc::new(Inner {
                budget: Mutex::new(BudgetState {
                    max_concurrent: max_concurrent.max(1),
                    active: 0,
                    peak: 0,
                }),
                released: Notify::new(),
                sizer: Mutex::new(sizer),
                limiter,
                burst,
                max_bytes_per_second,
            }),
        }
    }

    pub fn from_config(config: &DownloadConfig) -> Self {
        Self::new(
            config.max_concurrent_downloads,
            config.max_bytes_per_second,
            ChunkSizer::new(
                config.initial_chunk_bytes,
                config.min_chunk_bytes,
                config.max_chunk_bytes,
            ),
        )
    }

    /// Take a download slot if one is free
    pub fn try_acquire(&self) -> Option<DownloadPermit> {
        let mut budget = self.inner.budget();
        if budget.active >= budget.max_concurrent {
            return None;
        }
        budget.active += 1;
        budget.peak = budget.peak.max(budget.active);
        debug!(active = budget.active, max = budget.max_concurrent, "Download slot acquired");
        Some(DownloadPermit {
            inner: Arc::clone(&self.inner),
        })
    }

    /// Wait for a download slot
    pub async fn acquire(&self) -> DownloadPermit {
        loop {
            if let Some(permit) = self.try_acquire() {
                return permit;
            }
            // notify_one stores a wakeup when nobody is waiting yet, so a
            // release between the check above and this await is not lost
            self.inner.released.notified().await;
        }
    }

    /// Current budget snapshot
    pub fn budget(&self) -> BandwidthBudget {
        let budget = self.inner.budget();
        BandwidthBudget {
            max_concurrent_downloads: budget.max_concurrent,
            max_bytes_per_second: self.inner.max_bytes_per_second,
            active_count: budget.active,
        }
    }

    pub fn active_count(&self) -> usize {
        self.inner.budget().active
    }

    /// Highest concurrent slot count ever granted
    pub fn peak_active(&self) -> usize {
        self.inner.budget().peak
    }

    /// Wait until `bytes` may be delivered under the rate cap
    pub async fn throttle(&self, bytes: usize) {
        let Some(limiter) = &self.inner.limiter else {
            return;
        };

        let mut remaining = u32::try_from(bytes).unwrap_or(u32::MAX);
        while remaining > 0 {
            let step = remaining.min(self.inner.burst.get());
            if let Some(n) = NonZeroU32::new(step) {
                // step <= burst, so capacity is always sufficient
                let _ = limiter.until_n_ready(n).await;
            }
            remaining -= step;
        }
    }

    /// Feed a finished chunk into the throughput average
    pub fn record_throughput(&self, bytes: u64, elapsed: Duration) {
        self.inner.sizer().record(bytes, elapsed);
    }

    /// Chunk size the next range request should use
    pub fn recommended_chunk_size(&self) -> u64 {
        self.inner.sizer().chunk_size()
    }

    /// Moving-average throughput across all jobs, bytes per second
    pub fn current_speed(&self) -> u64 {
        self.inner.sizer().bytes_per_second()
    }
}

/// A held download slot; released on drop
pub struct DownloadPermit {
    inner: Arc<Inner>,
}

impl Drop for DownloadPermit {
    fn drop(&mut self) {
        {
            let mut budget = self.inner.budget();
            budget.active = budget.active.saturating_sub(1);
            debug!(active = budget.active, "Download slot released");
        }
        self.inner.released.notify_one();
    }
}
