//! Process-wide request budget for the archive
//!
//! The limiter holds `max_requests` tokens. A granted token comes back
//! exactly `period` after it was consumed, so no window of length `period`
//! ever contains more than `max_requests` grants, however many callers
//! share the limiter.

use crate::error::{Error, Result};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Proof that one unit of the request budget was consumed.
///
/// Only [`RateLimiter::acquire`] can create one, and every archive request
/// takes one by value.
#[derive(Debug)]
pub struct RatePermit {
    _private: (),
}

/// Shared rate limiter
#[derive(Clone)]
pub struct RateLimiter {
    grants: Arc<Mutex<VecDeque<Instant>>>,
    max_requests: usize,
    period: Duration,
}

impl RateLimiter {
    /// Allow at most `max_requests` grants in any window of `period`
    pub fn new(max_requests: u32, period: Duration) -> Self {
        let max_requests = max_requests.max(1) as usize;
        Self {
            grants: Arc::new(Mutex::new(VecDeque::new())),
            max_requests,
            period,
        }
    }

    /// Wait for a token, or return `Error::Cancelled` once `cancel` fires.
    ///
    /// A cancelled wait consumes nothing.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<RatePermit> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            permit = self.wait_for_token() => Ok(permit),
        }
    }

    async fn wait_for_token(&self) -> RatePermit {
        // Waiters queue on the mutex in FIFO order
        let mut grants = self.grants.lock().await;

        loop {
            let now = Instant::now();
            while let Some(oldest) = grants.front() {
                if now.duration_since(*oldest) >= self.period {
                    grants.pop_front();
                } else {
                    break;
                }
            }

            if grants.len() < self.max_requests {
                grants.push_back(now);
                return RatePermit { _private: () };
            }

            let wait = match grants.front() {
                Some(oldest) => self.period.saturating_sub(now.duration_since(*oldest)),
                None => Duration::ZERO,
            };
            trace!("Rate limiting: waiting {:?}", wait);
            tokio::time::sleep(wait).await;
        }
    }
}
