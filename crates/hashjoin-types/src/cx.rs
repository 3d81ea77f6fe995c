//! Cooperative cancellation context.
//!
//! A [`Cx`] is polled at checkpoints inside long loops. It samples the shared
//! cancel flag only every `interval`-th poll, so a checkpoint is cheap but a
//! cancellation may be observed a few polls late. Each clone keeps its own poll
//! counter; all clones share the flag.

use std::cell::Cell;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use hashjoin_error::{JoinError, Result};

/// Cancellation context handed to every join component.
#[derive(Debug, Clone)]
pub struct Cx {
    canceled: Arc<AtomicBool>,
    interval: u32,
    polls: Cell<u32>,
}

/// Requests cancellation of every [`Cx`] sharing its flag.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    canceled: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }
}

impl Default for Cx {
    fn default() -> Self {
        Self::new()
    }
}

impl Cx {
    /// Context that checks the flag on every poll.
    #[must_use]
    pub fn new() -> Self {
        Self::with_interval(1)
    }

    /// Context that checks the flag on every `interval`-th poll (minimum 1).
    #[must_use]
    pub fn with_interval(interval: u32) -> Self {
        Self {
            canceled: Arc::new(AtomicBool::new(false)),
            interval: interval.max(1),
            polls: Cell::new(0),
        }
    }

    /// Same flag, different sampling interval.
    #[must_use]
    pub fn restrict(&self, interval: u32) -> Self {
        Self {
            canceled: Arc::clone(&self.canceled),
            interval: interval.max(1),
            polls: Cell::new(0),
        }
    }

    #[must_use]
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            canceled: Arc::clone(&self.canceled),
        }
    }

    #[must_use]
    pub const fn interval(&self) -> u32 {
        self.interval
    }

    /// Poll for cancellation.
    ///
    /// # Errors
    /// Returns [`JoinError::Canceled`] once cancellation was requested and
    /// this poll samples the flag.
    pub fn checkpoint(&self) -> Result<()> {
        let polls = self.polls.get().wrapping_add(1);
        if polls < self.interval {
            self.polls.set(polls);
            return Ok(());
        }
        self.polls.set(0);
        if self.canceled.load(Ordering::Acquire) {
            return Err(JoinError::Canceled);
        }
        Ok(())
    }

    /// [`Cx::checkpoint`] that records which stage observed the cancellation.
    ///
    /// # Errors
    /// Same as [`Cx::checkpoint`].
    pub fn checkpoint_with(&self, stage: &str) -> Result<()> {
        self.checkpoint().inspect_err(|_| {
            tracing::debug!(stage, "cancellation observed");
        })
    }

    /// Unsampled read of the flag.
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkpoint_passes_until_canceled() {
        let cx = Cx::new();
        assert!(cx.checkpoint().is_ok());
        cx.cancel_handle().cancel();
        assert!(matches!(cx.checkpoint(), Err(JoinError::Canceled)));
        assert!(cx.is_canceled());
    }

    #[test]
    fn sampling_interval_delays_observation() {
        let cx = Cx::with_interval(3);
        cx.cancel_handle().cancel();
        assert!(cx.checkpoint().is_ok());
        assert!(cx.checkpoint().is_ok());
        assert!(cx.checkpoint_with("third poll").is_err());
    }

    #[test]
    fn restricted_clone_shares_flag() {
        let cx = Cx::with_interval(100);
        let strict = cx.restrict(1);
        cx.cancel_handle().cancel();
        assert!(strict.checkpoint().is_err());
        assert_eq!(strict.interval(), 1);
    }

    #[test]
    fn zero_interval_is_clamped() {
        let cx = Cx::with_interval(0);
        assert_eq!(cx.interval(), 1);
    }
}
