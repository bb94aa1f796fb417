// SPDX-License-Identifier: Apache-2.0

//! Errors for the request engine.
//!
//! Every per-request failure is swallowed at the dispatcher boundary — the
//! request is freed and logged and the client sees a negative handle or a
//! nonzero status. Only [`Error::Init`] aborts the process.

use restune_common::{Handle, Mode, Opcode};
use std::fmt;

/// Coarse classification of engine failures, stable across variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed frame, unknown opcode, out-of-threshold value, unknown
    /// cluster or core, insufficient permission, bad duration.
    BadRequest,
    /// Admission denied by the per-thread health model or the global gate.
    RateLimited,
    /// Retune or untune for an unknown or foreign-owned handle.
    NotFound,
    /// The request's allowed-modes mask forbids the current mode.
    ModeIncompatible,
    /// Worker or allocation capacity exhausted.
    Capacity,
    /// An applier or reset callback reported failure.
    CallbackFailed,
    /// Connection lost mid-request; surfaces as a dropped message.
    Transport,
    /// Required configuration missing or invalid at startup.
    FatalInit,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorKind::BadRequest => "bad_request",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::NotFound => "not_found",
            ErrorKind::ModeIncompatible => "mode_incompatible",
            ErrorKind::Capacity => "capacity",
            ErrorKind::CallbackFailed => "callback_failed",
            ErrorKind::Transport => "transport",
            ErrorKind::FatalInit => "fatal_init",
        };
        write!(f, "{label}")
    }
}

/// All errors the engine can produce.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The request is structurally invalid.
    #[error("Malformed request: {details}")]
    MalformedRequest {
        /// What made the request invalid.
        details: String,
    },

    /// No resource with this opcode is registered.
    #[error("Unknown resource opcode {opcode}")]
    UnknownOpcode {
        /// The unregistered opcode.
        opcode: Opcode,
    },

    /// A single-valued config value fell outside the resource thresholds.
    #[error("Value {value} out of bounds [{low}, {high}] for resource {opcode}")]
    ValueOutOfBounds {
        /// The rejected value.
        value: i32,
        /// Inclusive lower bound.
        low: i32,
        /// Inclusive upper bound.
        high: i32,
        /// The resource being tuned.
        opcode: Opcode,
    },

    /// The resource is not available for tuning on this target.
    #[error("Resource {opcode} is not supported on this target")]
    Unsupported {
        /// The unsupported resource.
        opcode: Opcode,
    },

    /// The client's trust level does not allow tuning this resource.
    #[error("Insufficient permission to tune resource {opcode}")]
    InsufficientPermission {
        /// The protected resource.
        opcode: Opcode,
    },

    /// The client's trust level could not be determined at all.
    #[error("Could not determine trust level of pid {pid}")]
    UnknownTrust {
        /// The client process.
        pid: i32,
    },

    /// Logical core / cluster values do not map onto this target.
    #[error("No physical mapping for logical cluster {cluster} core {core}")]
    UnknownTopology {
        /// Logical cluster value from the request.
        cluster: u8,
        /// Logical core value from the request.
        core: u8,
    },

    /// A cgroup-scoped request referenced an undeclared cgroup id.
    #[error("Unknown cgroup id {id}")]
    UnknownCGroup {
        /// The request-facing cgroup id.
        id: u8,
    },

    /// The per-thread health model rejected the request.
    #[error("Thread {tid} is rate limited")]
    RateLimited {
        /// The offending thread.
        tid: i32,
    },

    /// The global concurrent-request gate rejected the request.
    #[error("Active request cap {cap} reached")]
    ConcurrencyCap {
        /// The configured cap.
        cap: usize,
    },

    /// The referenced handle does not exist.
    #[error("No active request with handle {handle}")]
    HandleNotFound {
        /// The unknown handle.
        handle: Handle,
    },

    /// The referenced handle exists but belongs to another process.
    #[error("Handle {handle} is owned by a different client")]
    ForeignHandle {
        /// The foreign handle.
        handle: Handle,
    },

    /// The request is a duplicate of an outstanding one from the same thread.
    #[error("Duplicate of an outstanding request from tid {tid}")]
    Duplicate {
        /// The submitting thread.
        tid: i32,
    },

    /// The request's allowed-modes mask forbids the current device mode.
    #[error("Request modes {modes:?} incompatible with current mode {current:?}")]
    ModeIncompatible {
        /// The request's mask.
        modes: Mode,
        /// The mode the device is in.
        current: Mode,
    },

    /// A third-party client tried to write a property.
    #[error("Writing property `{key}` requires system trust")]
    PropertyDenied {
        /// The property the write targeted.
        key: String,
    },

    /// A client bookkeeping entry could not be created.
    #[error("Client entry could not be created for pid {pid} tid {tid}")]
    ClientAllocation {
        /// The client process.
        pid: i32,
        /// The client thread.
        tid: i32,
    },

    /// An applier or reset callback failed. Logged, never retried.
    #[error("Callback `{callback}` failed for resource {opcode}: {details}")]
    CallbackFailed {
        /// Registered callback id.
        callback: String,
        /// The resource it ran for.
        opcode: Opcode,
        /// A description of the failure.
        details: String,
    },

    /// Startup could not complete.
    #[error("Initialization failed: {details}")]
    Init {
        /// What went wrong.
        details: String,
    },
}

impl Error {
    /// The coarse classification of this error, as reported to clients.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::MalformedRequest { .. }
            | Error::UnknownOpcode { .. }
            | Error::ValueOutOfBounds { .. }
            | Error::Unsupported { .. }
            | Error::InsufficientPermission { .. }
            | Error::UnknownTrust { .. }
            | Error::UnknownTopology { .. }
            | Error::UnknownCGroup { .. }
            | Error::Duplicate { .. }
            | Error::PropertyDenied { .. } => ErrorKind::BadRequest,
            Error::RateLimited { .. } | Error::ConcurrencyCap { .. } => ErrorKind::RateLimited,
            Error::HandleNotFound { .. } | Error::ForeignHandle { .. } => ErrorKind::NotFound,
            Error::ModeIncompatible { .. } => ErrorKind::ModeIncompatible,
            Error::ClientAllocation { .. } => ErrorKind::Capacity,
            Error::CallbackFailed { .. } => ErrorKind::CallbackFailed,
            Error::Init { .. } => ErrorKind::FatalInit,
        }
    }
}
