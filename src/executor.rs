//! Bounded fan-out of asynchronous work.
//!
//! A [`BoundedExecutor`] wraps a tokio [`Semaphore`] so that at most
//! `capacity` submitted futures are running at any instant.  The semaphore is
//! FIFO-fair: when a slot frees up, the longest-waiting unit is admitted
//! next.  Completion order is not guaranteed.
//!
//! Units are independent.  Each one produces its own output (typically a
//! `Result`), and a failing unit neither cancels nor delays its siblings.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::future::join_all;
use tokio::sync::Semaphore;

/// Default cap on in-flight units.
pub const DEFAULT_CAPACITY: usize = 100;

#[derive(Debug)]
pub struct BoundedExecutor {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    label: String,
}

impl BoundedExecutor {
    /// # Panics
    ///
    /// Panics if `capacity` is 0.
    pub fn new(capacity: usize, label: impl Into<String>) -> Self {
        assert!(capacity > 0, "capacity must be > 0");
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
            label: label.into(),
        }
    }

    /// Run `unit` once a slot is free, holding the slot until it finishes.
    ///
    /// Fails without running `unit` only if the executor has been closed.
    pub async fn run<F>(&self, unit: F) -> Result<F::Output>
    where
        F: Future,
    {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .with_context(|| format!("executor {} is closed", self.label))?;

        let current = self.in_flight.fetch_add(1, Ordering::Relaxed) + 1;
        self.peak_in_flight.fetch_max(current, Ordering::Relaxed);
        let _slot = InFlight(&self.in_flight);

        Ok(unit.await)
    }

    /// Run every unit with at most `capacity` in flight, returning outputs in
    /// submission order.
    pub async fn run_all<I, F>(&self, units: I) -> Vec<Result<F::Output>>
    where
        I: IntoIterator<Item = F>,
        F: Future,
    {
        join_all(units.into_iter().map(|unit| self.run(unit))).await
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Highest number of concurrently running units observed so far.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::Relaxed)
    }
}

/// Decrements the in-flight counter when a unit finishes or is dropped.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}
