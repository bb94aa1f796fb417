// SPDX-License-Identifier: Apache-2.0

//! The single consumer of the ordered queue.
//!
//! The dispatcher owns the conflict table and the per-request duration
//! timers; everything else reaches it as a queued message. One loop
//! iteration drains the queue completely, then parks in
//! [`OrderedQueue::wait`]. Popping the cleanup sentinel makes the loop
//! return.

use crate::clients::ClientRegistry;
use crate::coco::CocoTable;
use crate::core::Core;
use crate::message::{Message, UntuneOrigin};
use crate::mode::ModeState;
use crate::queue::OrderedQueue;
use crate::requests::{ProcessingStatus, Request, RequestRegistry};
use crate::timers::{TimerId, TimerWheel};
use restune_common::{Handle, Mode, QueuePriority};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// The dispatcher state machine.
pub struct Dispatcher {
    queue: Arc<OrderedQueue>,
    requests: Arc<RequestRegistry>,
    clients: Arc<ClientRegistry>,
    mode: Arc<ModeState>,
    wheel: TimerWheel,
    table: CocoTable,
    /// Live duration timers, exactly one per timed tune request.
    timers: HashMap<Handle, TimerId>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("timers", &self.timers.len())
            .field("table", &self.table)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// A dispatcher wired to a core context.
    #[must_use]
    pub fn new(core: &Core) -> Self {
        Self {
            queue: core.queue.clone(),
            requests: core.requests.clone(),
            clients: core.clients.clone(),
            mode: core.mode.clone(),
            wheel: core.wheel.clone(),
            table: CocoTable::new(
                core.resources.clone(),
                core.appliers.clone(),
                core.vault.clone(),
            ),
            timers: HashMap::new(),
        }
    }

    /// Runs until the cleanup sentinel arrives.
    pub fn run(&mut self) {
        info!("dispatcher running");
        loop {
            self.queue.wait();
            if self.drain() {
                info!("dispatcher stopping");
                return;
            }
        }
    }

    /// Drains every queued message. Returns true on the cleanup sentinel.
    /// Public so tests can step the dispatcher without threads.
    pub fn drain(&mut self) -> bool {
        while let Some(message) = self.queue.pop() {
            match message {
                Message::ServerCleanup => return true,
                Message::Tune { request } => self.handle_tune(&request),
                Message::Untune {
                    handle,
                    pid,
                    origin,
                    ..
                } => self.handle_untune(handle, pid, origin),
                Message::Retune {
                    handle,
                    duration_ms,
                    pid,
                    ..
                } => self.handle_retune(handle, duration_ms, pid),
            }
        }
        false
    }

    /// Immutable view of the conflict table, for tests and invariant checks.
    #[must_use]
    pub fn table(&self) -> &CocoTable {
        &self.table
    }

    /// Number of live duration timers.
    #[must_use]
    pub fn timer_count(&self) -> usize {
        self.timers.len()
    }

    fn handle_tune(&mut self, request: &Arc<Request>) {
        let handle = request.handle;
        let current = self.mode.get();
        if (current == Mode::SUSPEND || current == Mode::DOZE)
            && !request.properties.modes.contains(current)
        {
            debug!(handle, ?current, "tune not eligible in current mode");
            return;
        }

        match self.requests.status_of(handle) {
            Some(ProcessingStatus::Cancelled) => {
                // The untune overtook the tune; drop the request entirely.
                debug!(handle, "tune cancelled before application");
                self.teardown(handle, Some(request));
                return;
            }
            Some(ProcessingStatus::Completed) => {
                debug!(handle, "tune already applied");
                return;
            }
            _ => {}
        }

        self.requests.mark_completed(handle);
        if let Err(err) = self.table.insert(request, current) {
            warn!(handle, %err, "insert failed, freeing request");
            self.teardown(handle, Some(request));
            return;
        }

        // Exactly one timer per timed request; a mode-transition re-apply
        // keeps the original deadline.
        let duration_ms = self
            .requests
            .take_duration_override(handle)
            .unwrap_or(request.duration_ms);
        if duration_ms > 0 && !self.timers.contains_key(&handle) {
            let id = self.arm_expiry(handle, request.pid, duration_ms);
            let _ = self.timers.insert(handle, id);
        }
    }

    fn handle_untune(&mut self, handle: Handle, pid: i32, origin: UntuneOrigin) {
        let Some((request, status)) = self.requests.get(handle) else {
            debug!(handle, "untune for unknown handle, dropping");
            return;
        };

        match origin {
            UntuneOrigin::Client => {
                if request.pid != pid {
                    info!(handle, "untune from foreign client, dropping");
                    return;
                }
                match status {
                    ProcessingStatus::Completed => self.teardown(handle, Some(&request)),
                    // The cancel mark can race the application itself; nodes
                    // in the table mean the tune won and must be torn down.
                    _ if self.table.contains(handle) => self.teardown(handle, Some(&request)),
                    _ => {
                        // Not applied yet; the sticky bit makes the tune
                        // clean itself up when popped.
                        self.requests.mark_cancelled(handle);
                        debug!(handle, "untune before tune completion, marked cancelled");
                    }
                }
            }
            UntuneOrigin::Expiry | UntuneOrigin::Gc => {
                self.teardown(handle, Some(&request));
            }
            UntuneOrigin::ModeTransfer => {
                // Drain the table but keep the request for re-application.
                let _ = self.table.remove(handle);
                if status != ProcessingStatus::Cancelled {
                    self.requests.reset_status(handle);
                }
            }
        }
    }

    fn handle_retune(&mut self, handle: Handle, duration_ms: i64, pid: i32) {
        let Some((request, status)) = self.requests.get(handle) else {
            debug!(handle, "retune for unknown handle, dropping");
            return;
        };
        if request.pid != pid {
            info!(handle, "retune from foreign client, dropping");
            return;
        }

        if status != ProcessingStatus::Completed {
            // Not applied yet; the override is consumed when the timer arms.
            self.requests.modify_duration(handle, duration_ms);
            return;
        }

        match self.timers.get(&handle).copied() {
            Some(id) if duration_ms > 0 => {
                if !self.wheel.restart(id, Duration::from_millis(duration_ms as u64)) {
                    // The old timer fired already; its untune is in flight.
                    let _ = self.timers.remove(&handle);
                }
            }
            Some(id) => {
                // Retuned to infinite: drop the timer.
                let _ = self.wheel.cancel(id);
                let _ = self.timers.remove(&handle);
            }
            None if duration_ms > 0 => {
                let id = self.arm_expiry(handle, request.pid, duration_ms);
                let _ = self.timers.insert(handle, id);
            }
            None => {}
        }
    }

    fn arm_expiry(&self, handle: Handle, pid: i32, duration_ms: i64) -> TimerId {
        let queue = self.queue.clone();
        self.wheel.arm_oneshot(
            Duration::from_millis(duration_ms as u64),
            Arc::new(move || {
                queue.add_and_wakeup(Message::Untune {
                    handle,
                    pid,
                    origin: UntuneOrigin::Expiry,
                    priority: QueuePriority::HighTransfer,
                });
            }),
        )
    }

    /// Removes a request everywhere: conflict table, registry, client
    /// bookkeeping, timer.
    fn teardown(&mut self, handle: Handle, request: Option<&Arc<Request>>) {
        let _ = self.table.remove(handle);
        let removed = self.requests.remove(handle);
        let tid = request
            .map(|r| r.tid)
            .or_else(|| removed.as_ref().map(|r| r.tid));
        if let Some(tid) = tid {
            self.clients.detach_handle(tid, handle);
        }
        if let Some(id) = self.timers.remove(&handle) {
            let _ = self.wheel.cancel(id);
        }
    }
}
