// SPDX-License-Identifier: Apache-2.0

//! Request kinds, priorities, trust levels, device modes, and the packed
//! `properties` word.

use bitflags::bitflags;
use std::fmt;

/// Identifier of an outstanding tune request. Monotonic, never reused.
pub type Handle = i64;

/// Reserved handle meaning "none".
pub const HANDLE_NONE: Handle = 0;

/// The three client-visible request kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestType {
    /// Install a value on one or more tunables for a bounded duration.
    Tune,
    /// Change the duration of an outstanding tune.
    Retune,
    /// Withdraw an outstanding tune.
    Untune,
}

impl RequestType {
    /// Wire encoding of the request kind.
    #[must_use]
    pub const fn as_wire(self) -> u8 {
        match self {
            RequestType::Tune => 1,
            RequestType::Retune => 2,
            RequestType::Untune => 3,
        }
    }

    /// Decodes the wire byte, if valid.
    #[must_use]
    pub const fn from_wire(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(RequestType::Tune),
            2 => Some(RequestType::Retune),
            3 => Some(RequestType::Untune),
            _ => None,
        }
    }
}

/// Client-supplied request priority. Two levels only; the internal four-level
/// priority is derived by combining this with the client's trust level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestPriority {
    /// Urgent from the client's point of view.
    High,
    /// Default.
    Low,
}

impl RequestPriority {
    /// Decodes the low byte of the `properties` word.
    #[must_use]
    pub const fn from_wire(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(RequestPriority::High),
            1 => Some(RequestPriority::Low),
            _ => None,
        }
    }

    /// Wire encoding (low byte of `properties`).
    #[must_use]
    pub const fn as_wire(self) -> u8 {
        match self {
            RequestPriority::High => 0,
            RequestPriority::Low => 1,
        }
    }
}

/// Two-level trust tag derived from the client's effective uid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustLevel {
    /// Effective uid 0.
    System,
    /// Everyone else.
    ThirdParty,
}

/// The four internal priority levels a tune request can carry, ordered by
/// rank: `SystemHigh` outranks everything, `ThirdPartyLow` nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TunePriority {
    /// System client, high priority.
    SystemHigh,
    /// System client, low priority.
    SystemLow,
    /// Third-party client, high priority.
    ThirdPartyHigh,
    /// Third-party client, low priority.
    ThirdPartyLow,
}

/// Number of tune priority levels, i.e. the secondary dimension of the
/// conflict table.
pub const TUNE_PRIORITY_LEVELS: usize = 4;

impl TunePriority {
    /// Derives the internal level from trust and client-supplied priority.
    #[must_use]
    pub const fn derive(trust: TrustLevel, priority: RequestPriority) -> Self {
        match (trust, priority) {
            (TrustLevel::System, RequestPriority::High) => TunePriority::SystemHigh,
            (TrustLevel::System, RequestPriority::Low) => TunePriority::SystemLow,
            (TrustLevel::ThirdParty, RequestPriority::High) => TunePriority::ThirdPartyHigh,
            (TrustLevel::ThirdParty, RequestPriority::Low) => TunePriority::ThirdPartyLow,
        }
    }

    /// Bucket index, 0 for the highest-ranked level.
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            TunePriority::SystemHigh => 0,
            TunePriority::SystemLow => 1,
            TunePriority::ThirdPartyHigh => 2,
            TunePriority::ThirdPartyLow => 3,
        }
    }

    /// The level with the given bucket index.
    #[must_use]
    pub const fn from_index(index: usize) -> Option<Self> {
        match index {
            0 => Some(TunePriority::SystemHigh),
            1 => Some(TunePriority::SystemLow),
            2 => Some(TunePriority::ThirdPartyHigh),
            3 => Some(TunePriority::ThirdPartyLow),
            _ => None,
        }
    }

    /// True when `self` is strictly higher-ranked than `other`.
    #[must_use]
    pub const fn outranks(self, other: Self) -> bool {
        self.index() < other.index()
    }
}

impl fmt::Display for TunePriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TunePriority::SystemHigh => "system-high",
            TunePriority::SystemLow => "system-low",
            TunePriority::ThirdPartyHigh => "third-party-high",
            TunePriority::ThirdPartyLow => "third-party-low",
        };
        write!(f, "{label}")
    }
}

/// Scheduling class of a queued message. Besides the four tune levels this
/// adds the two internal pseudo-levels: `HighTransfer` front-runs all client
/// traffic (mode transitions, expiry, garbage collection) and
/// `ServerCleanup` is the shutdown sentinel that makes the dispatcher return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum QueuePriority {
    /// Shutdown sentinel. Highest so a stop request overtakes everything.
    ServerCleanup,
    /// Internally synthesized traffic that must precede client traffic.
    HighTransfer,
    /// See [`TunePriority::SystemHigh`].
    SystemHigh,
    /// See [`TunePriority::SystemLow`].
    SystemLow,
    /// See [`TunePriority::ThirdPartyHigh`].
    ThirdPartyHigh,
    /// See [`TunePriority::ThirdPartyLow`].
    ThirdPartyLow,
}

impl From<TunePriority> for QueuePriority {
    fn from(level: TunePriority) -> Self {
        match level {
            TunePriority::SystemHigh => QueuePriority::SystemHigh,
            TunePriority::SystemLow => QueuePriority::SystemLow,
            TunePriority::ThirdPartyHigh => QueuePriority::ThirdPartyHigh,
            TunePriority::ThirdPartyLow => QueuePriority::ThirdPartyLow,
        }
    }
}

bitflags! {
    /// Device modes a request may remain applied in. A request whose mask
    /// lacks the current mode is rejected (or parked) while that mode lasts.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Mode: u8 {
        /// Display on.
        const RESUME = 0x01;
        /// Display off.
        const SUSPEND = 0x02;
        /// Low-power idle.
        const DOZE = 0x04;
    }
}

impl Mode {
    /// True when the mask allows processing while the display is off.
    #[must_use]
    pub const fn background_enabled(self) -> bool {
        self.intersects(Mode::SUSPEND.union(Mode::DOZE))
    }
}

/// The packed `properties` word of a tune request: low 8 bits the client
/// priority, next 8 bits the allowed-modes mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestProperties {
    /// Client-supplied priority.
    pub priority: RequestPriority,
    /// Modes the request may remain applied in.
    pub modes: Mode,
}

impl RequestProperties {
    /// Decodes a wire `properties` word. An unknown priority byte or unknown
    /// mode bits make the word malformed.
    #[must_use]
    pub fn from_wire(raw: i32) -> Option<Self> {
        let priority = RequestPriority::from_wire((raw & 0xff) as u8)?;
        let modes = Mode::from_bits(((raw >> 8) & 0xff) as u8)?;
        Some(Self { priority, modes })
    }

    /// Encodes back into the wire word.
    #[must_use]
    pub const fn as_wire(self) -> i32 {
        (self.priority.as_wire() as i32) | ((self.modes.bits() as i32) << 8)
    }
}

impl Default for RequestProperties {
    fn default() -> Self {
        Self {
            priority: RequestPriority::Low,
            modes: Mode::RESUME,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn priority_derivation_covers_all_combinations() {
        assert_eq!(
            TunePriority::derive(TrustLevel::System, RequestPriority::High),
            TunePriority::SystemHigh
        );
        assert_eq!(
            TunePriority::derive(TrustLevel::System, RequestPriority::Low),
            TunePriority::SystemLow
        );
        assert_eq!(
            TunePriority::derive(TrustLevel::ThirdParty, RequestPriority::High),
            TunePriority::ThirdPartyHigh
        );
        assert_eq!(
            TunePriority::derive(TrustLevel::ThirdParty, RequestPriority::Low),
            TunePriority::ThirdPartyLow
        );
    }

    #[test]
    fn queue_ordering_puts_internal_traffic_first() {
        assert!(QueuePriority::ServerCleanup < QueuePriority::HighTransfer);
        assert!(QueuePriority::HighTransfer < QueuePriority::SystemHigh);
        assert!(QueuePriority::SystemHigh < QueuePriority::ThirdPartyLow);
    }

    #[test]
    fn tune_priority_ranking() {
        assert!(TunePriority::SystemHigh.outranks(TunePriority::SystemLow));
        assert!(TunePriority::SystemLow.outranks(TunePriority::ThirdPartyHigh));
        assert!(!TunePriority::ThirdPartyLow.outranks(TunePriority::ThirdPartyLow));
        for idx in 0..TUNE_PRIORITY_LEVELS {
            let level = TunePriority::from_index(idx).unwrap();
            assert_eq!(level.index(), idx);
        }
    }

    #[test]
    fn properties_word_round_trips() {
        let props = RequestProperties {
            priority: RequestPriority::High,
            modes: Mode::RESUME | Mode::DOZE,
        };
        let raw = props.as_wire();
        assert_eq!(raw, 0x0500);
        assert_eq!(RequestProperties::from_wire(raw), Some(props));
    }

    #[test]
    fn properties_word_rejects_unknown_bits() {
        // Priority byte 2 does not exist.
        assert_eq!(RequestProperties::from_wire(0x0102), None);
        // Mode bit 0x08 does not exist.
        assert_eq!(RequestProperties::from_wire(0x0800), None);
    }

    #[test]
    fn background_flag_follows_mode_mask() {
        assert!(!Mode::RESUME.background_enabled());
        assert!((Mode::RESUME | Mode::SUSPEND).background_enabled());
        assert!(Mode::DOZE.background_enabled());
    }
}
