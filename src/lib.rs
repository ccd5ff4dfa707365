//! Order-book tick recorder and replayable delta codec.
//!
//! This crate captures a live market's order-book update stream for one
//! asset and persists it compactly and losslessly:
//!
//! - `record`: durable on-disk schema (stream header, delta records)
//! - `book`: the order-book snapshot both codec halves replay against
//! - `codec`: the stateful `Encoder`/`Decoder` pair (delta encoding against
//!   the snapshot, no-op suppression, timestamp deltas)
//! - `stream`: length+CRC32 framing with distinct truncation and corruption
//!   errors, plus a transparent zstd outer layer
//! - `client`: the Polymarket market-channel websocket collaborator
//!
//! The binaries (`src/main.rs` and `src/bin/replay.rs`) use these modules to
//! write capture files and to reconstruct the exact original event sequence
//! from them.

pub mod book;
pub mod client;
pub mod codec;
pub mod record;
pub mod stream;
