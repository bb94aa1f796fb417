// SPDX-License-Identifier: Apache-2.0

//! Crashed-client reclamation: the pulse monitor and the handle collector.
//!
//! The pulse monitor periodically checks `/proc/<pid>` for every registered
//! client and feeds dead pids into the collector's intake queue. The
//! collector drains the intake in bounded batches, tears down the client
//! bookkeeping, and reifies each orphaned handle into a synthesized untune at
//! transfer priority so the dispatcher frees the conflict-table state in
//! order.

use crate::clients::ClientRegistry;
use crate::message::{Message, UntuneOrigin};
use crate::queue::OrderedQueue;
use crate::requests::RequestRegistry;
use parking_lot::Mutex;
use restune_common::QueuePriority;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

/// The handle garbage collector.
pub struct HandleGc {
    clients: Arc<ClientRegistry>,
    requests: Arc<RequestRegistry>,
    queue: Arc<OrderedQueue>,
    intake: Mutex<VecDeque<i32>>,
    batch_size: usize,
}

impl std::fmt::Debug for HandleGc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandleGc")
            .field("intake", &self.intake.lock().len())
            .field("batch_size", &self.batch_size)
            .finish_non_exhaustive()
    }
}

impl HandleGc {
    /// A collector with the given per-round batch cap.
    #[must_use]
    pub fn new(
        clients: Arc<ClientRegistry>,
        requests: Arc<RequestRegistry>,
        queue: Arc<OrderedQueue>,
        batch_size: usize,
    ) -> Self {
        Self {
            clients,
            requests,
            queue,
            intake: Mutex::new(VecDeque::new()),
            batch_size: batch_size.max(1),
        }
    }

    /// Queues every thread of a dead process for cleanup.
    pub fn submit_pid(&self, pid: i32) {
        let tids = self.clients.tids_of(pid);
        if tids.is_empty() {
            return;
        }
        info!(pid, threads = tids.len(), "submitting dead client for cleanup");
        let mut intake = self.intake.lock();
        intake.extend(tids);
    }

    /// One collection round: reclaims up to the batch cap of tids.
    pub fn collect(&self) {
        for _ in 0..self.batch_size {
            let Some(tid) = self.intake.lock().pop_front() else {
                return;
            };
            debug!(tid, "collecting thread state");

            let handles = self.clients.handles_of(tid);
            self.clients.drop_tid(tid);

            for handle in handles {
                let Some((request, _)) = self.requests.get(handle) else {
                    continue;
                };
                self.queue.add_and_wakeup(Message::Untune {
                    handle,
                    pid: request.pid,
                    origin: UntuneOrigin::Gc,
                    priority: QueuePriority::HighTransfer,
                });
            }
        }
    }

    /// Number of tids awaiting collection.
    #[must_use]
    pub fn backlog(&self) -> usize {
        self.intake.lock().len()
    }
}

/// The client liveness monitor.
pub struct PulseMonitor {
    clients: Arc<ClientRegistry>,
    gc: Arc<HandleGc>,
    proc_root: PathBuf,
}

impl std::fmt::Debug for PulseMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PulseMonitor")
            .field("proc_root", &self.proc_root)
            .finish_non_exhaustive()
    }
}

impl PulseMonitor {
    /// A monitor checking the real `/proc`.
    #[must_use]
    pub fn new(clients: Arc<ClientRegistry>, gc: Arc<HandleGc>) -> Self {
        Self::with_proc_root(clients, gc, PathBuf::from("/proc"))
    }

    /// A monitor with a fake proc root, for tests.
    #[must_use]
    pub fn with_proc_root(
        clients: Arc<ClientRegistry>,
        gc: Arc<HandleGc>,
        proc_root: PathBuf,
    ) -> Self {
        Self {
            clients,
            gc,
            proc_root,
        }
    }

    /// One sweep: hand every dead pid to the collector.
    pub fn sweep(&self) {
        for pid in self.clients.active_pids() {
            if !self.proc_root.join(pid.to_string()).exists() {
                self.gc.submit_pid(pid);
            }
        }
    }
}
