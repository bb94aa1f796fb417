// SPDX-License-Identifier: Apache-2.0

//! Admission rate limiting.
//!
//! Two gates. The per-thread gate runs a health model: requests arriving
//! closer together than `delta_ms` cost `penalty` health, well-spaced ones
//! earn `reward` back (capped at full health), and a thread at or below zero
//! health is blocked outright. The global gate caps the number of
//! concurrently active tune requests.

use crate::clients::{ClientRegistry, FULL_HEALTH};
use crate::error::Error;
use crate::requests::RequestRegistry;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Wall-clock milliseconds, the unit the health model is specified in.
#[must_use]
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// The admission rate limiter.
pub struct RateLimiter {
    clients: Arc<ClientRegistry>,
    requests: Arc<RequestRegistry>,
    delta_ms: i64,
    penalty: f64,
    reward: f64,
    max_concurrent: usize,
    /// Serializes read-modify-write of the health state; the client registry
    /// lock alone does not make the two-step update atomic.
    update_lock: Mutex<()>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("delta_ms", &self.delta_ms)
            .field("penalty", &self.penalty)
            .field("reward", &self.reward)
            .field("max_concurrent", &self.max_concurrent)
            .finish_non_exhaustive()
    }
}

impl RateLimiter {
    /// A limiter over the given registries and tunables.
    #[must_use]
    pub fn new(
        clients: Arc<ClientRegistry>,
        requests: Arc<RequestRegistry>,
        delta_ms: u64,
        penalty: f64,
        reward: f64,
        max_concurrent: usize,
    ) -> Self {
        Self {
            clients,
            requests,
            delta_ms: delta_ms as i64,
            penalty,
            reward,
            max_concurrent,
            update_lock: Mutex::new(()),
        }
    }

    /// The global admission gate: rejects once the active tune count has
    /// reached the configured cap.
    pub fn check_global_gate(&self) -> Result<(), Error> {
        if self.requests.active_count() >= self.max_concurrent {
            return Err(Error::ConcurrencyCap {
                cap: self.max_concurrent,
            });
        }
        Ok(())
    }

    /// The per-thread gate. Updates the thread's health according to the
    /// spacing of this request and either admits it (recording the
    /// timestamp) or rejects it.
    pub fn check_thread(&self, tid: i32) -> Result<(), Error> {
        self.check_thread_at(tid, now_ms())
    }

    /// [`Self::check_thread`] with an explicit clock, for tests.
    pub fn check_thread_at(&self, tid: i32, now_ms: i64) -> Result<(), Error> {
        let _guard = self.update_lock.lock();

        let mut health = self
            .clients
            .health_of(tid)
            .ok_or(Error::RateLimited { tid })?;
        if health <= 0.0 {
            // Repeat offender, total block.
            return Err(Error::RateLimited { tid });
        }

        // The very first request of a thread leaves health untouched.
        let last = self.clients.last_request_ms(tid).unwrap_or(0);
        if last != 0 {
            let spacing = now_ms - last;
            if spacing < self.delta_ms {
                health -= self.penalty;
            } else {
                health = FULL_HEALTH.min(health + self.reward);
            }
            self.clients.set_health(tid, health);
        }

        if health <= 0.0 {
            debug!(tid, health, "thread exhausted its health budget");
            return Err(Error::RateLimited { tid });
        }

        self.clients.set_last_request_ms(tid, now_ms);
        Ok(())
    }
}
