//! Sortable 64-bit identifiers.
//!
//! Layout, least significant bit first:
//!
//! | bits      | field                                   |
//! |-----------|-----------------------------------------|
//! | `[0,10)`  | subsystem that minted the id (0-1023)   |
//! | `[10,22)` | sequence within the millisecond (0-4095)|
//! | `[22,63)` | milliseconds since the Unix epoch       |
//! | `63`      | always zero                             |
//!
//! Because the timestamp occupies the high bits, numeric order of ids is
//! chronological order, and so is the byte order of their big-endian
//! encoding. Posts use the publish date as timestamp, which lets the store
//! range-scan posts by date without a secondary index.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};

pub const MAX_SUBSYSTEMS: u16 = 1024;

/// Subsystem for feeds, feed requests and article cache entries.
pub const GENERAL_SUBSYSTEM: u16 = 0;

/// First subsystem handed to crawl workers; worker `i` gets `base + i`.
pub const CRAWL_SUBSYSTEM_BASE: u16 = 256;

const SEQUENCE_SHIFT: u32 = 10;
const TIMESTAMP_SHIFT: u32 = 22;

const SUBSYSTEM_MASK: u64 = 0x3ff;
const SEQUENCE_MASK: u64 = 0xfff;
const TIMESTAMP_MASK: u64 = 0x1ff_ffff_ffff;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

fn millis(t: DateTime<Utc>) -> u64 {
    // Pre-epoch dates clamp to zero.
    (t.timestamp_millis().max(0) as u64) & TIMESTAMP_MASK
}

fn compose(ms: u64, subsystem: u64, sequence: u64) -> i64 {
    (((ms & TIMESTAMP_MASK) << TIMESTAMP_SHIFT)
        | ((sequence & SEQUENCE_MASK) << SEQUENCE_SHIFT)
        | (subsystem & SUBSYSTEM_MASK)) as i64
}

/// Encode an id from its raw parts.
pub fn make_id_raw(t: DateTime<Utc>, subsystem: u16, sequence: u16) -> i64 {
    compose(millis(t), subsystem as u64, sequence as u64)
}

/// The smallest id any generator can produce for the millisecond of `t`.
/// Used to position range scans; no record needs to carry this id.
pub fn encode_boundary(t: DateTime<Utc>) -> i64 {
    compose(millis(t), 0, 0)
}

pub fn timestamp_of(id: i64) -> u64 {
    ((id as u64) >> TIMESTAMP_SHIFT) & TIMESTAMP_MASK
}

pub fn sequence_of(id: i64) -> u16 {
    (((id as u64) >> SEQUENCE_SHIFT) & SEQUENCE_MASK) as u16
}

pub fn subsystem_of(id: i64) -> u16 {
    ((id as u64) & SUBSYSTEM_MASK) as u16
}

pub fn time_from_id(id: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(timestamp_of(id) as i64).unwrap_or(DateTime::UNIX_EPOCH)
}

/// 8-byte big-endian storage key; key order equals id order for ids >= 0.
pub fn id_key(id: i64) -> [u8; 8] {
    (id as u64).to_be_bytes()
}

pub fn id_from_key(key: &[u8]) -> Option<i64> {
    let bytes: [u8; 8] = key.try_into().ok()?;
    Some(u64::from_be_bytes(bytes) as i64)
}

#[derive(Debug, Default)]
struct GenState {
    last_ms: u64,
    sequence: u64,
    stamp_sequence: u64,
}

/// Id generator bound to one subsystem. Safe to share between tasks.
pub struct IdGen {
    subsystem: u16,
    clock: Arc<dyn Clock>,
    state: Mutex<GenState>,
}

impl IdGen {
    pub fn new(subsystem: u16) -> Self {
        Self::with_clock(subsystem, Arc::new(SystemClock))
    }

    pub fn with_clock(subsystem: u16, clock: Arc<dyn Clock>) -> Self {
        Self {
            subsystem: subsystem & SUBSYSTEM_MASK as u16,
            clock,
            state: Mutex::new(GenState::default()),
        }
    }

    pub fn subsystem(&self) -> u16 {
        self.subsystem
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Mint an id from the current time. Strictly increasing per generator.
    pub fn make_id(&self) -> i64 {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        // A clock that steps backwards keeps using the last tick.
        let mut now = millis(self.clock.now()).max(state.last_ms);

        if now == state.last_ms {
            state.sequence += 1;
            if state.sequence > SEQUENCE_MASK {
                // Blocks the calling thread, async callers included, for one
                // tick. Only reachable past 4096 ids in a millisecond.
                std::thread::sleep(Duration::from_millis(1));
                now = millis(self.clock.now()).max(state.last_ms + 1);
                state.sequence = 0;
            }
        } else {
            state.sequence = 0;
        }
        state.last_ms = now;

        compose(now, self.subsystem as u64, state.sequence)
    }

    /// Mint an id carrying a caller supplied timestamp, e.g. a publish date.
    pub fn make_id_from_timestamp(&self, t: DateTime<Utc>) -> i64 {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.stamp_sequence = (state.stamp_sequence + 1) & SEQUENCE_MASK;
        compose(millis(t), self.subsystem as u64, state.stamp_sequence)
    }
}

impl std::fmt::Debug for IdGen {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdGen")
            .field("subsystem", &self.subsystem)
            .finish()
    }
}
