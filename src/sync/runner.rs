//! Bounded-frequency runner
//!
//! Batches change notifications into reconciliation passes: any number of
//! `run()` requests coalesce into one pass, at least `min_interval` apart
//! (with a small burst allowance for the first requests after a quiet
//! period), and a pass happens at least every `max_interval` even with no
//! requests at all so installed state cannot drift for long.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Paces calls to a sync function. At most one sync runs at a time because
/// a single loop drives them all.
pub struct BoundedFrequencyRunner {
    name: &'static str,
    min_interval: Duration,
    max_interval: Duration,
    burst: u32,
    pending: AtomicBool,
    notify: Notify,
}

impl BoundedFrequencyRunner {
    /// # Panics
    ///
    /// Panics if `max_interval` is shorter than `min_interval`; the
    /// guarantee "a pass at least every max" cannot hold otherwise.
    #[must_use]
    pub fn new(
        name: &'static str,
        min_interval: Duration,
        max_interval: Duration,
        burst: u32,
    ) -> Self {
        assert!(
            max_interval >= min_interval,
            "{name}: max_interval ({max_interval:?}) must be >= min_interval ({min_interval:?})"
        );
        Self {
            name,
            min_interval,
            max_interval,
            burst: burst.max(1),
            pending: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    /// Request a sync. Never blocks; concurrent requests coalesce.
    pub fn run(&self) {
        self.pending.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    /// Drive `sync_fn` until `stop` is cancelled.
    pub async fn process_loop<F>(&self, stop: CancellationToken, mut sync_fn: F)
    where
        F: FnMut(),
    {
        debug!(runner = self.name, min = ?self.min_interval, max = ?self.max_interval, burst = self.burst, "Runner loop starting");

        // Token bucket: `burst` immediate passes, refilled one per
        // min_interval of quiet.
        let mut tokens = self.burst;
        let mut last_refill = Instant::now();
        let mut last_run = Instant::now();

        loop {
            let max_deadline = last_run + self.max_interval;
            tokio::select! {
                () = stop.cancelled() => break,
                () = self.notify.notified() => {}
                () = tokio::time::sleep_until(max_deadline) => {
                    trace!(runner = self.name, "Periodic sync deadline reached");
                    self.pending.store(true, Ordering::SeqCst);
                }
            }
            if !self.pending.load(Ordering::SeqCst) {
                continue;
            }

            if !self.min_interval.is_zero() {
                self.refill(&mut tokens, &mut last_refill);
                if tokens == 0 {
                    let next_token = last_refill + self.min_interval;
                    tokio::select! {
                        () = stop.cancelled() => break,
                        () = tokio::time::sleep_until(next_token) => {}
                    }
                    self.refill(&mut tokens, &mut last_refill);
                }
                tokens = tokens.saturating_sub(1);
            }

            self.pending.store(false, Ordering::SeqCst);
            trace!(runner = self.name, "Running sync");
            sync_fn();
            last_run = Instant::now();
        }
        debug!(runner = self.name, "Runner loop stopped");
    }

    fn refill(&self, tokens: &mut u32, last_refill: &mut Instant) {
        let elapsed = last_refill.elapsed();
        let earned =
            u32::try_from(elapsed.as_nanos() / self.min_interval.as_nanos()).unwrap_or(u32::MAX);
        if earned > 0 {
            *tokens = tokens.saturating_add(earned).min(self.burst);
            *last_refill = last_refill
                .checked_add(self.min_interval.saturating_mul(earned))
                .map_or_else(Instant::now, |t| t.min(Instant::now()));
        }
    }
}
