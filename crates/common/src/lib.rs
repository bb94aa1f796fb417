// SPDX-License-Identifier: Apache-2.0

//! Shared scalar types used across the resource tuner crates.
//!
//! Everything in here is a plain value type: resource opcodes and their bit
//! layout, request priorities (client-facing and internal), device modes, and
//! the packed `properties` word carried by tune requests. No crate-level state
//! lives here.

pub mod opcode;
pub mod types;

pub use crate::opcode::{Opcode, ResourceInfo};
pub use crate::types::{
    HANDLE_NONE, Handle, Mode, QueuePriority, RequestPriority, RequestProperties, RequestType,
    TUNE_PRIORITY_LEVELS, TrustLevel, TunePriority,
};
