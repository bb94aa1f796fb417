// SPDX-License-Identifier: Apache-2.0

//! The tagged message variants flowing through the ordered queue.

use crate::requests::Request;
use restune_common::{Handle, QueuePriority};
use std::sync::Arc;

/// Who synthesized an untune, which decides how much of the request's state
/// it tears down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UntuneOrigin {
    /// The owning client asked. Full teardown, strict status checks.
    Client,
    /// The duration timer fired. Full teardown.
    Expiry,
    /// The garbage collector reclaimed a dead client. Full teardown.
    Gc,
    /// A mode transition is draining the conflict table. The request itself
    /// survives, parked or active, for later re-application.
    ModeTransfer,
}

/// A queued unit of work for the dispatcher.
#[derive(Debug, Clone)]
pub enum Message {
    /// Apply a tune request.
    Tune {
        /// The admitted request.
        request: Arc<Request>,
    },
    /// Change the duration of an outstanding tune.
    Retune {
        /// Handle of the original tune.
        handle: Handle,
        /// The new duration in milliseconds; −1 means infinite.
        duration_ms: i64,
        /// Pid of the requester, matched against the tune's owner.
        pid: i32,
        /// Scheduling class, inherited from the original tune.
        priority: QueuePriority,
    },
    /// Withdraw an outstanding tune.
    Untune {
        /// Handle of the original tune.
        handle: Handle,
        /// Pid of the requester, matched against the tune's owner.
        pid: i32,
        /// Who synthesized this untune.
        origin: UntuneOrigin,
        /// Scheduling class; internal origins use
        /// [`QueuePriority::HighTransfer`].
        priority: QueuePriority,
    },
    /// Shutdown sentinel: the dispatcher returns upon popping it.
    ServerCleanup,
}

impl Message {
    /// The scheduling class of this message.
    #[must_use]
    pub fn priority(&self) -> QueuePriority {
        match self {
            Message::Tune { request } => request.priority.into(),
            Message::Retune { priority, .. } | Message::Untune { priority, .. } => *priority,
            Message::ServerCleanup => QueuePriority::ServerCleanup,
        }
    }
}
