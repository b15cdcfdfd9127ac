//! Admission control for outbound batch sends.
//!
//! Two limits apply to every send attempt:
//! - at most `concurrency` sends in flight (semaphore)
//! - at most `interval_cap` sends started in any window of length `interval`
//!   (sliding log of start times)
//!
//! Admission is serialized under one lock, so no send starts if doing so would
//! exceed either limit at that instant. Each `Dispatcher` owns its own
//! scheduler; there is no process-wide state.
//!
//! # Usage
//!
//! ```ignore
//! let scheduler = AdmissionScheduler::new(5, Duration::from_secs(1), 10);
//!
//! // Waits for an in-flight slot, then for room in the rate window
//! let permit = scheduler.acquire().await;
//!
//! // Send while holding the permit...
//!
//! // The in-flight slot is released when dropped
//! drop(permit);
//! ```

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::{sleep_until, Instant};

// ─────────────────────────────────────────────────────────────────────────────
// AdmissionScheduler
// ─────────────────────────────────────────────────────────────────────────────

/// Concurrency and rate limiter shared by the tasks of one dispatch.
#[derive(Clone)]
pub struct AdmissionScheduler {
    /// In-flight slots.
    sem: Arc<Semaphore>,
    /// Start times inside the current window, oldest first.
    starts: Arc<Mutex<VecDeque<Instant>>>,
    max: usize,
    interval: Duration,
    interval_cap: usize,
}

impl AdmissionScheduler {
    /// Creates a scheduler.
    ///
    /// # Panics
    ///
    /// Panics if `max_concurrent` or `interval_cap` is 0. Callers validate
    /// `DispatchConfig` first.
    pub fn new(max_concurrent: usize, interval: Duration, interval_cap: usize) -> Self {
        assert!(max_concurrent > 0, "max_concurrent must be greater than 0");
        assert!(interval_cap > 0, "interval_cap must be greater than 0");

        Self {
            sem: Arc::new(Semaphore::new(max_concurrent)),
            starts: Arc::new(Mutex::new(VecDeque::with_capacity(interval_cap))),
            max: max_concurrent,
            interval,
            interval_cap,
        }
    }

    /// Waits until a send may start under both limits.
    ///
    /// The in-flight slot is held by the returned permit; the rate slot is
    /// consumed at the moment of admission.
    pub async fn acquire(&self) -> AdmissionPermit {
        // We never close the semaphore, so acquire_owned cannot fail
        let permit = self
            .sem
            .clone()
            .acquire_owned()
            .await
            .expect("semaphore closed unexpectedly");

        loop {
            let wait_until = {
                let mut starts = self.starts.lock().await;
                let now = Instant::now();
                while starts
                    .front()
                    .is_some_and(|&start| now.duration_since(start) >= self.interval)
                {
                    starts.pop_front();
                }

                if starts.len() < self.interval_cap {
                    starts.push_back(now);
                    None
                } else {
                    starts.front().map(|&oldest| oldest + self.interval)
                }
            };

            match wait_until {
                None => break,
                Some(deadline) => sleep_until(deadline).await,
            }
        }

        AdmissionPermit {
            permit,
            max: self.max,
            sem: self.sem.clone(),
        }
    }

    /// Returns the number of sends currently in flight.
    pub fn in_flight(&self) -> usize {
        self.max - self.sem.available_permits()
    }

    /// Returns the number of free in-flight slots.
    pub fn available_slots(&self) -> usize {
        self.sem.available_permits()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// AdmissionPermit
// ─────────────────────────────────────────────────────────────────────────────

/// An admitted send. The in-flight slot is released on drop.
pub struct AdmissionPermit {
    #[allow(dead_code)]
    permit: OwnedSemaphorePermit,
    max: usize,
    sem: Arc<Semaphore>,
}

impl AdmissionPermit {
    /// Returns the number of sends in flight (including this one).
    pub fn in_flight(&self) -> usize {
        self.max - self.sem.available_permits()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
