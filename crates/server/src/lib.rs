// SPDX-License-Identifier: Apache-2.0

//! The resource tuner transport: framed messages over a unix socket.
//!
//! The listener accepts connections on a dedicated thread running a
//! single-threaded async runtime; each connection is a task on that
//! runtime's local set. Frames are decoded into the message contract and
//! handed straight to the engine's admission layer, whose verdict (a handle
//! or a status byte) is written back before the dispatcher has necessarily
//! acted on the request.

pub mod error;
pub mod listener;
pub mod wire;

pub use crate::error::Error;
pub use crate::listener::{ListenerHandle, spawn_listener};
