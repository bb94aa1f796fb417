// SPDX-License-Identifier: Apache-2.0

//! Errors for the transport crate.

use std::path::PathBuf;

/// Frame-level decode failures. Any of these drops the connection.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum FrameError {
    /// The frame ended before a field was complete.
    #[error("Truncated frame at offset {offset}")]
    Truncated {
        /// Byte offset the decoder had reached.
        offset: usize,
    },

    /// The message type byte is not part of the contract.
    #[error("Unknown message type {msg_type}")]
    UnknownType {
        /// The offending type byte.
        msg_type: u8,
    },

    /// A length field exceeds the contract limit.
    #[error("Field length {length} exceeds limit {limit}")]
    FieldTooLarge {
        /// Declared length.
        length: usize,
        /// Maximum the contract allows.
        limit: usize,
    },

    /// A string field is not valid UTF-8.
    #[error("Non-UTF-8 string field")]
    BadString,

    /// Bytes were left over after a complete message.
    #[error("{trailing} trailing bytes after message")]
    TrailingBytes {
        /// Number of unconsumed bytes.
        trailing: usize,
    },
}

/// Errors that can occur in the listener.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The unix socket could not be bound.
    #[error("Failed to bind socket `{path}`: {details}")]
    Bind {
        /// The socket path.
        path: PathBuf,
        /// A description of the failure.
        details: String,
    },

    /// The listener thread could not be spawned.
    #[error("Failed to spawn listener thread: {details}")]
    ThreadSpawn {
        /// A description of the failure.
        details: String,
    },

    /// The async runtime could not be created.
    #[error("Failed to build listener runtime: {details}")]
    Runtime {
        /// A description of the failure.
        details: String,
    },

    /// IO on an accepted connection failed.
    #[error("Connection IO error: {details}")]
    ConnectionIo {
        /// A description of the failure.
        details: String,
    },
}
