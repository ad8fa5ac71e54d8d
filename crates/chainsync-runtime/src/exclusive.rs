//! Cancellable exclusive region.
//!
//! At most one holder runs inside the region at a time. [`CancellableRegion::cancel`]
//! bumps a generation counter: every waiter from an older generation fails
//! with [`Cancelled`], the current holder's future is dropped at its next
//! suspension point, and the region is free for the next generation.

use std::future::Future;
use std::sync::{Mutex, MutexGuard};

use thiserror::Error;
use tokio::sync::Notify;

/// The region was cancelled before or while the caller held it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("exclusive region cancelled")]
pub struct Cancelled;

#[derive(Debug, Default)]
struct RegionState {
    generation: u64,
    held: bool,
}

#[derive(Debug, Default)]
pub struct CancellableRegion {
    state: Mutex<RegionState>,
    notify: Notify,
}

/// Holding a guard means holding the region. Dropping it releases the
/// region, unless a cancel already handed it to a newer generation.
#[derive(Debug)]
pub struct RegionGuard<'a> {
    region: &'a CancellableRegion,
    generation: u64,
}

impl RegionGuard<'_> {
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl Drop for RegionGuard<'_> {
    fn drop(&mut self) {
        self.region.release(self.generation);
    }
}

impl CancellableRegion {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn generation(&self) -> u64 {
        self.state().generation
    }

    /// Returns `true` while a holder is inside the region.
    pub fn is_held(&self) -> bool {
        self.state().held
    }

    /// Wait for the region. Fails if a cancel lands while waiting.
    pub async fn acquire(&self) -> Result<RegionGuard<'_>, Cancelled> {
        let generation = self.generation();
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.state();
                if state.generation != generation {
                    return Err(Cancelled);
                }
                if !state.held {
                    state.held = true;
                    return Ok(RegionGuard {
                        region: self,
                        generation,
                    });
                }
            }
            notified.await;
        }
    }

    /// Cancel the current holder and every waiter.
    pub fn cancel(&self) {
        {
            let mut state = self.state();
            state.generation += 1;
            state.held = false;
        }
        self.notify.notify_waiters();
    }

    /// Run `fut` inside the region. The future is dropped if a cancel
    /// lands while it runs.
    pub async fn run_exclusive<F: Future>(&self, fut: F) -> Result<F::Output, Cancelled> {
        let guard = self.acquire().await?;
        tokio::select! {
            biased;
            _ = self.cancelled(guard.generation) => Err(Cancelled),
            output = fut => Ok(output),
        }
    }

    /// Resolves once `generation` is no longer current.
    async fn cancelled(&self, generation: u64) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.generation() != generation {
                return;
            }
            notified.await;
        }
    }

    fn release(&self, generation: u64) {
        let released = {
            let mut state = self.state();
            if state.generation == generation && state.held {
                state.held = false;
                true
            } else {
                false
            }
        };
        if released {
            self.notify.notify_waiters();
        }
    }

    fn state(&self) -> MutexGuard<'_, RegionState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
