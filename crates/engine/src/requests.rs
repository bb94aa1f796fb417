// SPDX-License-Identifier: Apache-2.0

//! Requests and the registry of outstanding handles.
//!
//! A [`Request`] is immutable once admitted; everything that changes over its
//! life (processing status, bucket membership, duration overrides) lives in
//! the [`RequestRegistry`]. The registry is shared between the ingress
//! threads and the dispatcher behind one read/write lock; reads are the fast
//! path.

use crate::error::Error;
use parking_lot::RwLock;
use restune_common::{
    Handle, Opcode, RequestProperties, RequestType, ResourceInfo, TunePriority,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

/// One resource a request wants tuned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRequest {
    /// The resource class.
    pub opcode: Opcode,
    /// Packed core / cluster / mpam addressing. Rewritten to physical values
    /// during admission.
    pub info: ResourceInfo,
    /// Free-form field some callbacks interpret.
    pub optional_info: i32,
    /// The value(s) to configure. Single-valued resources use `values[0]`;
    /// multi-valued semantics are callback-defined.
    pub values: Vec<i32>,
}

impl ResourceRequest {
    /// The first configured value.
    #[must_use]
    pub fn value(&self) -> i32 {
        self.values.first().copied().unwrap_or(0)
    }

    /// The cgroup id addressed by a cgroup-scoped request.
    #[must_use]
    pub fn cgroup_id(&self) -> Option<u8> {
        self.values.first().and_then(|&v| u8::try_from(v).ok())
    }
}

/// An admitted request. Immutable; duration changes go through the registry
/// and the timer, not through this struct.
#[derive(Debug, Clone)]
pub struct Request {
    /// What the client asked for.
    pub kind: RequestType,
    /// Unique positive handle identifying this request.
    pub handle: Handle,
    /// Requested duration in milliseconds; −1 means infinite.
    pub duration_ms: i64,
    /// Internal priority derived from trust and the client-specified level.
    pub priority: TunePriority,
    /// The decoded properties word.
    pub properties: RequestProperties,
    /// Submitting process.
    pub pid: i32,
    /// Submitting thread.
    pub tid: i32,
    /// The resources to tune, in client order.
    pub resources: Vec<ResourceRequest>,
}

impl Request {
    /// Whether the request may stay applied while the display is off.
    #[must_use]
    pub fn background_enabled(&self) -> bool {
        self.properties.modes.background_enabled()
    }
}

/// Processing state of an admitted tune request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProcessingStatus {
    /// Queued but not yet applied.
    #[default]
    Pending,
    /// Applied; its nodes are in the conflict table.
    Completed,
    /// An untune was admitted for it. Sticky: a cancelled request is dropped
    /// when popped and never becomes `Completed` again.
    Cancelled,
}

/// Which lifecycle list a request sits in during mode transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestBucket {
    /// Eligible for application in the current mode.
    ActiveTune,
    /// Parked until the device returns to a compatible mode.
    PendingTune,
}

#[derive(Debug, Default)]
struct Inner {
    requests: HashMap<Handle, Arc<Request>>,
    /// Status entries can precede their request (an untune racing its tune)
    /// and are therefore keyed independently of `requests`.
    status: HashMap<Handle, ProcessingStatus>,
    duration_override: HashMap<Handle, i64>,
    active: HashSet<Handle>,
    pending: HashSet<Handle>,
}

/// Handle → request map with duplicate detection and processing state.
#[derive(Debug)]
pub struct RequestRegistry {
    inner: RwLock<Inner>,
    next_handle: AtomicI64,
}

impl Default for RequestRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestRegistry {
    /// An empty registry. Handles start at 1; 0 is reserved for "none".
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            next_handle: AtomicI64::new(1),
        }
    }

    /// Allocates the next handle. Monotonic, never reused.
    pub fn next_handle(&self) -> Handle {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    /// Registers an admitted tune request in the active bucket. A sticky
    /// cancel recorded before the insert survives it.
    pub fn insert(&self, request: Arc<Request>) {
        let mut inner = self.inner.write();
        let handle = request.handle;
        let _ = inner.requests.insert(handle, request);
        let _ = inner.status.entry(handle).or_default();
        let _ = inner.active.insert(handle);
    }

    /// Removes every trace of a handle, returning the request if it existed.
    pub fn remove(&self, handle: Handle) -> Option<Arc<Request>> {
        let mut inner = self.inner.write();
        let request = inner.requests.remove(&handle);
        let _ = inner.status.remove(&handle);
        let _ = inner.duration_override.remove(&handle);
        let _ = inner.active.remove(&handle);
        let _ = inner.pending.remove(&handle);
        request
    }

    /// The request and its status, if the handle is live.
    #[must_use]
    pub fn get(&self, handle: Handle) -> Option<(Arc<Request>, ProcessingStatus)> {
        let inner = self.inner.read();
        let request = inner.requests.get(&handle)?.clone();
        let status = inner.status.get(&handle).copied().unwrap_or_default();
        Some((request, status))
    }

    /// True when a request with this handle is live.
    #[must_use]
    pub fn verify(&self, handle: Handle) -> bool {
        self.inner.read().requests.contains_key(&handle)
    }

    /// The processing status recorded for a handle, live request or not.
    #[must_use]
    pub fn status_of(&self, handle: Handle) -> Option<ProcessingStatus> {
        self.inner.read().status.get(&handle).copied()
    }

    /// Marks a request applied.
    pub fn mark_completed(&self, handle: Handle) {
        let mut inner = self.inner.write();
        let _ = inner.status.insert(handle, ProcessingStatus::Completed);
    }

    /// Sets the sticky cancel bit. Deliberately works for handles that have
    /// no request yet: an untune can overtake its tune in the pipeline.
    pub fn mark_cancelled(&self, handle: Handle) {
        let mut inner = self.inner.write();
        let _ = inner.status.insert(handle, ProcessingStatus::Cancelled);
    }

    /// Clears the status back to pending, used when a mode transition parks
    /// and later re-admits a request.
    pub fn reset_status(&self, handle: Handle) {
        let mut inner = self.inner.write();
        let _ = inner.status.insert(handle, ProcessingStatus::Pending);
    }

    /// Records a duration change for a handle whose tune may not have been
    /// applied yet. Respects a prior sticky cancel.
    pub fn modify_duration(&self, handle: Handle, duration_ms: i64) {
        let mut inner = self.inner.write();
        if inner.status.get(&handle) == Some(&ProcessingStatus::Cancelled) {
            return;
        }
        let _ = inner.duration_override.insert(handle, duration_ms);
    }

    /// Consumes the pending duration override for a handle, if any.
    pub fn take_duration_override(&self, handle: Handle) -> Option<i64> {
        self.inner.write().duration_override.remove(&handle)
    }

    /// Number of live tune requests, the quantity gated by the global
    /// admission cap.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.inner.read().requests.len()
    }

    /// Handles currently in the given bucket.
    #[must_use]
    pub fn bucket_handles(&self, bucket: RequestBucket) -> Vec<Handle> {
        let inner = self.inner.read();
        match bucket {
            RequestBucket::ActiveTune => inner.active.iter().copied().collect(),
            RequestBucket::PendingTune => inner.pending.iter().copied().collect(),
        }
    }

    /// Moves a handle from the active to the pending bucket.
    pub fn park(&self, handle: Handle) {
        let mut inner = self.inner.write();
        if inner.active.remove(&handle) {
            let _ = inner.pending.insert(handle);
        }
    }

    /// Moves every parked handle back into the active bucket, returning them.
    pub fn unpark_all(&self) -> Vec<Handle> {
        let mut inner = self.inner.write();
        let parked: Vec<Handle> = inner.pending.drain().collect();
        for &handle in &parked {
            let _ = inner.active.insert(handle);
        }
        parked
    }

    /// Duplicate check for a new tune request against the outstanding
    /// handles of the same thread.
    ///
    /// Two requests are duplicates iff they hold the same number of
    /// resources and are pairwise equal by index on (opcode, info, optional
    /// info, values). The comparison is order-sensitive: the same resource
    /// set listed in a different order is not considered a duplicate.
    pub fn is_duplicate(&self, candidate: &Request, outstanding: &HashSet<Handle>) -> bool {
        if outstanding.is_empty() {
            return false;
        }
        let inner = self.inner.read();
        outstanding.iter().any(|handle| {
            inner
                .requests
                .get(handle)
                .is_some_and(|existing| existing.resources == candidate.resources)
        })
    }

    /// Validates the structural sanity of an admitted request.
    pub fn check_sane(request: &Request) -> Result<(), Error> {
        if request.handle <= 0 {
            return Err(Error::MalformedRequest {
                details: format!("non-positive handle {}", request.handle),
            });
        }
        if request.pid < 0 || request.tid < 0 {
            return Err(Error::MalformedRequest {
                details: "negative pid or tid".to_owned(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use restune_common::{Mode, RequestPriority};

    /// A single-resource tune request for unit tests.
    pub fn tune(handle: Handle, tid: i32, opcode: u32, value: i32) -> Arc<Request> {
        Arc::new(Request {
            kind: RequestType::Tune,
            handle,
            duration_ms: -1,
            priority: TunePriority::ThirdPartyLow,
            properties: RequestProperties {
                priority: RequestPriority::Low,
                modes: Mode::RESUME,
            },
            pid: 100,
            tid,
            resources: vec![ResourceRequest {
                opcode: Opcode::from_raw(opcode),
                info: ResourceInfo::default(),
                optional_info: 0,
                values: vec![value],
            }],
        })
    }
}
