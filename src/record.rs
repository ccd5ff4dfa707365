//! On-disk schema for encoded tick streams.
//!
//! A capture file is a sequence of framed [`StreamFrame`]s: exactly one
//! [`Header`](StreamFrame::Header) first, then one
//! [`Record`](StreamFrame::Record) per upstream update event, in arrival
//! order. Frames are bincode payloads wrapped in length + CRC32 (see
//! `stream`).
//!
//! Prices and sizes are `rust_decimal::Decimal` throughout: the venue emits
//! them as decimal strings, and exact equality is what drives delta
//! detection, so floating point is never used.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Current stream format version, written into every header.
pub const FORMAT_VERSION: u16 = 1;

/// Order-book side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Side {
    Bid,
    Ask,
}

/// A resting (price, size) pair on one side of the book.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: Decimal,
    pub size: Decimal,
}

/// One price-level mutation inside a raw update event.
///
/// `size == 0` means the level is removed from the book.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelChange {
    pub side: Side,
    pub price: Decimal,
    pub size: Decimal,
}

/// The unit the market-data client produces: one timestamped batch of
/// level changes for a single asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawUpdateEvent {
    /// Asset identifier; constant for the lifetime of a stream.
    pub asset_id: String,
    /// Epoch milliseconds, non-decreasing within a stream.
    pub timestamp_ms: u64,
    /// Ordered level changes; order is preserved through encode/decode.
    pub changes: Vec<LevelChange>,
}

/// Stream header: session metadata plus the absolute timestamp the
/// decoder's delta chain is anchored to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamHeader {
    pub version: u16,
    /// Wall clock at capture start, for provenance only.
    pub created_unix_ns: u128,
    pub asset_id: String,
    /// Absolute timestamp of the first encoded record. Record deltas are
    /// relative to the previous record, and the first record's delta is
    /// relative to this value.
    pub base_timestamp_ms: u64,
}

/// One delta-encoded entry of an [`EncodedRecord`].
///
/// The tag records how the entry related to the book snapshot at encode
/// time, which is exactly what the decoder needs to validate replay: an
/// `Insert` must land on an untracked level, `Update`/`Remove` on a
/// tracked one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LevelEntry {
    Insert { side: Side, price: Decimal, size: Decimal },
    Update { side: Side, price: Decimal, size: Decimal },
    Remove { side: Side, price: Decimal },
}

impl LevelEntry {
    pub fn side(&self) -> Side {
        match self {
            LevelEntry::Insert { side, .. }
            | LevelEntry::Update { side, .. }
            | LevelEntry::Remove { side, .. } => *side,
        }
    }

    pub fn price(&self) -> Decimal {
        match self {
            LevelEntry::Insert { price, .. }
            | LevelEntry::Update { price, .. }
            | LevelEntry::Remove { price, .. } => *price,
        }
    }
}

/// The unit written to storage: one raw event, delta-encoded.
///
/// Entries may be empty; such records still carry the timestamp cadence of
/// the original stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedRecord {
    /// Milliseconds since the previous record (or since the header's base
    /// timestamp for the first record). Never negative by construction.
    pub timestamp_delta_ms: u64,
    pub entries: Vec<LevelEntry>,
}

/// Frame payload written to / read from a capture file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamFrame {
    Header(StreamHeader),
    Record(EncodedRecord),
}
