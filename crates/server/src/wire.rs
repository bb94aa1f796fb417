// SPDX-License-Identifier: Apache-2.0

//! The framed message codec.
//!
//! Every frame is a little-endian `u32` body length followed by the body.
//! The body starts with a one-byte message type; strings and lists are
//! length-prefixed. There is no padding and no pointer arithmetic — a frame
//! either decodes completely or the connection is dropped.

use crate::error::FrameError;
use restune_common::Handle;
use restune_engine::ErrorKind;

/// Hard cap on a frame body; anything larger is hostile or corrupt.
pub const MAX_FRAME_LEN: usize = 64 * 1024;
/// Cap on resources per tune request.
pub const MAX_RESOURCES: usize = 64;
/// Cap on values per resource.
pub const MAX_VALUES: usize = 64;
/// Cap on property keys and values.
pub const MAX_STRING: usize = 256;

/// One resource inside a tune frame, exactly as transmitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireResource {
    /// Raw resource opcode.
    pub opcode: u32,
    /// Packed core / cluster / mpam info.
    pub info: i32,
    /// Optional free-form field.
    pub optional_info: i32,
    /// Configured value(s).
    pub values: Vec<i32>,
}

/// A decoded client frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    /// Install values on resources for a bounded duration.
    Tune {
        /// Duration in milliseconds; −1 means infinite.
        duration_ms: i64,
        /// Packed priority and allowed-modes word.
        properties: i32,
        /// Submitting process.
        pid: i32,
        /// Submitting thread.
        tid: i32,
        /// The resources to tune.
        resources: Vec<WireResource>,
    },
    /// Change the duration of an outstanding tune.
    Retune {
        /// Handle returned by the tune.
        handle: Handle,
        /// New duration in milliseconds; −1 means infinite.
        duration_ms: i64,
        /// Submitting process.
        pid: i32,
        /// Submitting thread.
        tid: i32,
    },
    /// Withdraw an outstanding tune.
    Untune {
        /// Handle returned by the tune.
        handle: Handle,
        /// Submitting process.
        pid: i32,
        /// Submitting thread.
        tid: i32,
    },
    /// Read a property, with a fallback for unset keys.
    PropGet {
        /// Property key.
        key: String,
        /// Value served when the key is unset.
        fallback: String,
        /// Submitting process.
        pid: i32,
        /// Submitting thread.
        tid: i32,
    },
    /// Write a property. Requires system trust.
    PropSet {
        /// Property key.
        key: String,
        /// New value.
        value: String,
        /// Submitting process.
        pid: i32,
        /// Submitting thread.
        tid: i32,
    },
}

const TYPE_TUNE: u8 = 1;
const TYPE_RETUNE: u8 = 2;
const TYPE_UNTUNE: u8 = 3;
const TYPE_PROP_GET: u8 = 4;
const TYPE_PROP_SET: u8 = 5;

/// The status byte returned for retune / untune / prop-set requests.
/// Zero means success; failures map from the engine error kind.
#[must_use]
pub const fn status_code(kind: ErrorKind) -> i8 {
    match kind {
        ErrorKind::BadRequest => 1,
        ErrorKind::RateLimited => 2,
        ErrorKind::NotFound => 3,
        ErrorKind::ModeIncompatible => 4,
        ErrorKind::Capacity => 5,
        ErrorKind::CallbackFailed => 6,
        ErrorKind::Transport => 7,
        ErrorKind::FatalInit => 8,
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], FrameError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.buf.len())
            .ok_or(FrameError::Truncated { offset: self.pos })?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, FrameError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, FrameError> {
        let bytes = self.take(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn u32(&mut self) -> Result<u32, FrameError> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn i32(&mut self) -> Result<i32, FrameError> {
        Ok(self.u32()? as i32)
    }

    fn i64(&mut self) -> Result<i64, FrameError> {
        let bytes = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(i64::from_le_bytes(raw))
    }

    fn string(&mut self) -> Result<String, FrameError> {
        let length = self.u16()? as usize;
        if length > MAX_STRING {
            return Err(FrameError::FieldTooLarge {
                length,
                limit: MAX_STRING,
            });
        }
        let bytes = self.take(length)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| FrameError::BadString)
    }
}

/// Decodes one frame body.
pub fn decode_frame(body: &[u8]) -> Result<ClientFrame, FrameError> {
    let mut r = Reader { buf: body, pos: 0 };
    let frame = match r.u8()? {
        TYPE_TUNE => {
            let duration_ms = r.i64()?;
            let properties = r.i32()?;
            let pid = r.i32()?;
            let tid = r.i32()?;
            let count = r.u16()? as usize;
            if count > MAX_RESOURCES {
                return Err(FrameError::FieldTooLarge {
                    length: count,
                    limit: MAX_RESOURCES,
                });
            }
            let mut resources = Vec::with_capacity(count);
            for _ in 0..count {
                let opcode = r.u32()?;
                let info = r.i32()?;
                let optional_info = r.i32()?;
                let n_values = r.u16()? as usize;
                if n_values > MAX_VALUES {
                    return Err(FrameError::FieldTooLarge {
                        length: n_values,
                        limit: MAX_VALUES,
                    });
                }
                let mut values = Vec::with_capacity(n_values);
                for _ in 0..n_values {
                    values.push(r.i32()?);
                }
                resources.push(WireResource {
                    opcode,
                    info,
                    optional_info,
                    values,
                });
            }
            ClientFrame::Tune {
                duration_ms,
                properties,
                pid,
                tid,
                resources,
            }
        }
        TYPE_RETUNE => ClientFrame::Retune {
            handle: r.i64()?,
            duration_ms: r.i64()?,
            pid: r.i32()?,
            tid: r.i32()?,
        },
        TYPE_UNTUNE => ClientFrame::Untune {
            handle: r.i64()?,
            pid: r.i32()?,
            tid: r.i32()?,
        },
        TYPE_PROP_GET => ClientFrame::PropGet {
            key: r.string()?,
            fallback: r.string()?,
            pid: r.i32()?,
            tid: r.i32()?,
        },
        TYPE_PROP_SET => ClientFrame::PropSet {
            key: r.string()?,
            value: r.string()?,
            pid: r.i32()?,
            tid: r.i32()?,
        },
        msg_type => return Err(FrameError::UnknownType { msg_type }),
    };
    if r.pos != body.len() {
        return Err(FrameError::TrailingBytes {
            trailing: body.len() - r.pos,
        });
    }
    Ok(frame)
}

struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn new() -> Self {
        Self { buf: Vec::new() }
    }

    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn string(&mut self, v: &str) {
        self.u16(v.len() as u16);
        self.buf.extend_from_slice(v.as_bytes());
    }
}

/// Encodes a frame body. The length prefix is added by the transport.
#[must_use]
pub fn encode_frame(frame: &ClientFrame) -> Vec<u8> {
    let mut w = Writer::new();
    match frame {
        ClientFrame::Tune {
            duration_ms,
            properties,
            pid,
            tid,
            resources,
        } => {
            w.u8(TYPE_TUNE);
            w.i64(*duration_ms);
            w.i32(*properties);
            w.i32(*pid);
            w.i32(*tid);
            w.u16(resources.len() as u16);
            for resource in resources {
                w.u32(resource.opcode);
                w.i32(resource.info);
                w.i32(resource.optional_info);
                w.u16(resource.values.len() as u16);
                for value in &resource.values {
                    w.i32(*value);
                }
            }
        }
        ClientFrame::Retune {
            handle,
            duration_ms,
            pid,
            tid,
        } => {
            w.u8(TYPE_RETUNE);
            w.i64(*handle);
            w.i64(*duration_ms);
            w.i32(*pid);
            w.i32(*tid);
        }
        ClientFrame::Untune { handle, pid, tid } => {
            w.u8(TYPE_UNTUNE);
            w.i64(*handle);
            w.i32(*pid);
            w.i32(*tid);
        }
        ClientFrame::PropGet {
            key,
            fallback,
            pid,
            tid,
        } => {
            w.u8(TYPE_PROP_GET);
            w.string(key);
            w.string(fallback);
            w.i32(*pid);
            w.i32(*tid);
        }
        ClientFrame::PropSet {
            key,
            value,
            pid,
            tid,
        } => {
            w.u8(TYPE_PROP_SET);
            w.string(key);
            w.string(value);
            w.i32(*pid);
            w.i32(*tid);
        }
    }
    w.buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn tune_frame_round_trips() {
        let frame = ClientFrame::Tune {
            duration_ms: 2_000,
            properties: 0x0100,
            pid: 1234,
            tid: 1235,
            resources: vec![
                WireResource {
                    opcode: 0x0004_0000,
                    info: 0,
                    optional_info: 0,
                    values: vec![3_000],
                },
                WireResource {
                    opcode: 0x0004_0001,
                    info: 0x0102,
                    optional_info: 7,
                    values: vec![1, 2, 3],
                },
            ],
        };
        let body = encode_frame(&frame);
        assert_eq!(decode_frame(&body).unwrap(), frame);
    }

    #[test]
    fn control_frames_round_trip() {
        for frame in [
            ClientFrame::Retune {
                handle: 9,
                duration_ms: -1,
                pid: 1,
                tid: 2,
            },
            ClientFrame::Untune {
                handle: 9,
                pid: 1,
                tid: 2,
            },
            ClientFrame::PropGet {
                key: "restune.delta.ms".to_owned(),
                fallback: "16".to_owned(),
                pid: 1,
                tid: 2,
            },
            ClientFrame::PropSet {
                key: "restune.logging.level".to_owned(),
                value: "debug".to_owned(),
                pid: 1,
                tid: 2,
            },
        ] {
            let body = encode_frame(&frame);
            assert_eq!(decode_frame(&body).unwrap(), frame);
        }
    }

    #[test]
    fn truncated_frame_is_rejected() {
        let frame = ClientFrame::Untune {
            handle: 9,
            pid: 1,
            tid: 2,
        };
        let body = encode_frame(&frame);
        assert!(matches!(
            decode_frame(&body[..body.len() - 1]),
            Err(FrameError::Truncated { .. })
        ));
    }

    #[test]
    fn unknown_type_and_trailing_bytes_are_rejected() {
        assert_eq!(
            decode_frame(&[0xfe]),
            Err(FrameError::UnknownType { msg_type: 0xfe })
        );

        let mut body = encode_frame(&ClientFrame::Untune {
            handle: 9,
            pid: 1,
            tid: 2,
        });
        body.push(0);
        assert_eq!(
            decode_frame(&body),
            Err(FrameError::TrailingBytes { trailing: 1 })
        );
    }

    #[test]
    fn oversized_resource_count_is_rejected() {
        // Hand-build a tune header claiming an absurd resource count.
        let mut body = vec![1u8];
        body.extend_from_slice(&1000i64.to_le_bytes());
        body.extend_from_slice(&0i32.to_le_bytes());
        body.extend_from_slice(&1i32.to_le_bytes());
        body.extend_from_slice(&2i32.to_le_bytes());
        body.extend_from_slice(&u16::MAX.to_le_bytes());
        assert!(matches!(
            decode_frame(&body),
            Err(FrameError::FieldTooLarge { .. })
        ));
    }

    #[test]
    fn status_codes_are_stable() {
        assert_eq!(status_code(ErrorKind::BadRequest), 1);
        assert_eq!(status_code(ErrorKind::NotFound), 3);
        assert_eq!(status_code(ErrorKind::FatalInit), 8);
    }
}
