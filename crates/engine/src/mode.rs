// SPDX-License-Identifier: Apache-2.0

//! The device-mode controller.
//!
//! An external detector (display notifier, power HAL, a signal in the
//! standalone daemon) drives the transitions. Each transition drains the
//! conflict table through synthesized transfer-priority untunes, moves
//! requests between the active and pending buckets according to their
//! background eligibility, restores every touched node to its default, and
//! floods the eligible requests back through the queue so the table
//! re-applies the correct winners for the new mode.

use crate::message::{Message, UntuneOrigin};
use crate::queue::OrderedQueue;
use crate::requests::{ProcessingStatus, RequestBucket, RequestRegistry};
use crate::resources::ResourceTable;
use crate::sysfs::DefaultsVault;
use restune_common::{Mode, QueuePriority};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use tracing::info;

/// The current device mode, shared across threads.
#[derive(Debug)]
pub struct ModeState(AtomicU8);

impl Default for ModeState {
    fn default() -> Self {
        Self(AtomicU8::new(Mode::RESUME.bits()))
    }
}

impl ModeState {
    /// A state starting in resume mode.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The current mode.
    #[must_use]
    pub fn get(&self) -> Mode {
        Mode::from_bits_truncate(self.0.load(Ordering::Acquire))
    }

    fn set(&self, mode: Mode) {
        self.0.store(mode.bits(), Ordering::Release);
    }
}

/// Drives display / doze transitions over the registries and the queue.
pub struct ModeController {
    state: Arc<ModeState>,
    requests: Arc<RequestRegistry>,
    resources: Arc<ResourceTable>,
    vault: Arc<DefaultsVault>,
    queue: Arc<OrderedQueue>,
}

impl std::fmt::Debug for ModeController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModeController")
            .field("mode", &self.state.get())
            .finish_non_exhaustive()
    }
}

impl ModeController {
    /// A controller over the shared state.
    #[must_use]
    pub fn new(
        state: Arc<ModeState>,
        requests: Arc<RequestRegistry>,
        resources: Arc<ResourceTable>,
        vault: Arc<DefaultsVault>,
        queue: Arc<OrderedQueue>,
    ) -> Self {
        Self {
            state,
            requests,
            resources,
            vault,
            queue,
        }
    }

    /// Enters display-off or doze. Every active request is drained from the
    /// table; non-background requests are parked until resume.
    pub fn enter_sleep(&self, mode: Mode) {
        debug_assert!(mode == Mode::SUSPEND || mode == Mode::DOZE);
        info!(?mode, "entering sleep mode");
        self.state.set(mode);

        for handle in self.requests.bucket_handles(RequestBucket::ActiveTune) {
            let Some((request, status)) = self.requests.get(handle) else {
                continue;
            };
            self.synthesize_untune(handle, request.pid);
            if !request.background_enabled() && status != ProcessingStatus::Cancelled {
                self.requests.park(handle);
            }
        }

        self.resources.restore_defaults(&self.vault);
        self.flood_in();
    }

    /// Enters resume. The table is drained, parked requests are re-admitted,
    /// and everything active is re-applied.
    pub fn enter_resume(&self) {
        info!("entering resume mode");
        self.state.set(Mode::RESUME);

        for handle in self.requests.bucket_handles(RequestBucket::ActiveTune) {
            let Some((request, _)) = self.requests.get(handle) else {
                continue;
            };
            self.synthesize_untune(handle, request.pid);
        }
        let unparked = self.requests.unpark_all();
        info!(count = unparked.len(), "re-admitted parked requests");

        self.resources.restore_defaults(&self.vault);
        self.flood_in();
    }

    fn synthesize_untune(&self, handle: i64, pid: i32) {
        self.queue.add_and_wakeup(Message::Untune {
            handle,
            pid,
            origin: UntuneOrigin::ModeTransfer,
            priority: QueuePriority::HighTransfer,
        });
    }

    /// Re-enqueues every active request so the dispatcher re-applies the
    /// winners. The transfer-priority untunes queued by the transition drain
    /// the table before any of these pop.
    fn flood_in(&self) {
        for handle in self.requests.bucket_handles(RequestBucket::ActiveTune) {
            if let Some((request, _)) = self.requests.get(handle) {
                self.queue.add_and_wakeup(Message::Tune { request });
            }
        }
    }
}
