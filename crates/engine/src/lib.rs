// SPDX-License-Identifier: Apache-2.0

//! The resource tuner core: request lifecycle and conflict resolution.
//!
//! The engine mediates concurrent client requests to temporarily adjust
//! kernel and sysfs tunables. Requests are admitted ([`ingress`]), ordered
//! ([`queue`]), and applied by a single dispatcher thread driving the
//! concurrency coordinator table ([`coco`]), which picks one winning value
//! per tunable instance under the resource's declared policy. Durations are
//! enforced by the timer wheel ([`timers`]); crashed clients are reclaimed
//! by the liveness sweeper and handle collector ([`sweeper`]); display and
//! doze transitions drain and restore the table ([`mode`]).
//!
//! Threading model: ingress runs on the transport's threads, the dispatcher
//! on its own thread with exclusive ownership of the table, timers on the
//! wheel thread. Cross-thread work always re-enters through the queue.

pub mod appliers;
pub mod clients;
pub mod coco;
pub mod core;
pub mod dispatcher;
pub mod error;
pub mod ingress;
pub mod message;
pub mod mode;
pub mod queue;
pub mod rate_limiter;
pub mod requests;
pub mod resources;
pub mod sweeper;
pub mod sysfs;
pub mod timers;
pub mod topology;

pub use crate::core::{Core, CoreBuilder, PERSISTENCE_FILE};
pub use crate::error::{Error, ErrorKind};
