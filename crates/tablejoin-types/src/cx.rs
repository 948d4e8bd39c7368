//! Cooperative cancellation context.
//!
//! A [`Cx`] is a cheap cloneable handle onto a shared cancellation flag. Long
//! running loops poll it through [`Cx::checkpoint`], or through a
//! [`CancelChecker`] when polling every iteration would be too costly.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tablejoin_error::{JoinError, Result};

/// Shared cancellation flag for one execution.
#[derive(Debug, Clone, Default)]
pub struct Cx {
    cancelled: Arc<AtomicBool>,
}

impl Cx {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Every clone observes the request.
    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::AcqRel) {
            tracing::debug!(target: "tablejoin::cx", "cancellation requested");
        }
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Returns [`JoinError::Cancelled`] once cancellation was requested.
    pub fn checkpoint(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(JoinError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Polls a [`Cx`] every `interval` calls to [`CancelChecker::check`].
#[derive(Debug, Clone)]
pub struct CancelChecker {
    cx: Cx,
    interval: u32,
    countdown: u32,
}

impl CancelChecker {
    /// An `interval` of zero is treated as one.
    #[must_use]
    pub fn new(cx: Cx, interval: u32) -> Self {
        let interval = interval.max(1);
        Self {
            cx,
            interval,
            countdown: interval,
        }
    }

    /// Count one iteration; consult the flag when the interval elapsed.
    pub fn check(&mut self) -> Result<()> {
        self.countdown -= 1;
        if self.countdown == 0 {
            self.countdown = self.interval;
            self.cx.checkpoint()
        } else {
            Ok(())
        }
    }

    /// Consult the flag immediately.
    pub fn check_now(&self) -> Result<()> {
        self.cx.checkpoint()
    }

    #[must_use]
    pub const fn cx(&self) -> &Cx {
        &self.cx
    }

    #[must_use]
    pub const fn interval(&self) -> u32 {
        self.interval
    }
}
