//! Delta codec for order-book update streams.
//!
//! [`Encoder`] and [`Decoder`] are twin state machines. Each holds the last
//! seen timestamp and a [`BookSnapshot`], and steps through the stream one
//! record at a time: the encoder turns raw events into delta records against
//! its snapshot, the decoder applies the same deltas to an independently
//! replayed snapshot. After any shared prefix the two snapshots are
//! value-equal, which is what makes the encoding lossless.
//!
//! Both are strictly sequential and single-threaded: deltas only mean
//! anything when applied in arrival order against the snapshot they were
//! produced from. Run one Encoder/Decoder pair per asset; instances share
//! nothing.

use rust_decimal::Decimal;
use thiserror::Error;

use crate::book::BookSnapshot;
use crate::record::{EncodedRecord, LevelChange, LevelEntry, PriceLevel, RawUpdateEvent, Side, StreamHeader};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    /// Event timestamp went backwards. Fatal: the delta chain assumes
    /// non-decreasing timestamps.
    #[error("out-of-order event: timestamp {event_ms}ms precedes last encoded {last_ms}ms")]
    OrderingViolation { last_ms: u64, event_ms: u64 },

    /// A record entry contradicts the replayed book state (remove/update of
    /// an untracked level, insert over a tracked one). Fatal: the snapshot
    /// can no longer be trusted for subsequent records.
    #[error("{op} of {side:?} level {price} contradicts replayed book state")]
    IntegrityViolation {
        op: &'static str,
        side: Side,
        price: Decimal,
    },
}

/// Stateful transform `RawUpdateEvent -> EncodedRecord`, one-to-one, in
/// arrival order.
#[derive(Debug, Default)]
pub struct Encoder {
    last_timestamp_ms: Option<u64>,
    snapshot: BookSnapshot,
    drop_empty: bool,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opt in to dropping records whose entries all collapse to no-ops.
    ///
    /// This changes replay timestamp spacing (dropped events vanish from the
    /// stream entirely), so it is never the silent default. Dropped events
    /// do not advance the timestamp chain: the next emitted record's delta
    /// is still relative to the last *emitted* one.
    pub fn drop_empty_records(mut self, drop: bool) -> Self {
        self.drop_empty = drop;
        self
    }

    /// Encode one event. Returns `Ok(None)` only when the record collapsed
    /// to zero entries and [`drop_empty_records`](Self::drop_empty_records)
    /// is set.
    pub fn encode(&mut self, event: &RawUpdateEvent) -> Result<Option<EncodedRecord>, CodecError> {
        self.encode_changes(event.timestamp_ms, &event.changes)
    }

    /// Encode a full book re-statement (e.g. the venue's `book` event after
    /// a reconnect) by diffing it against the current snapshot.
    ///
    /// Levels present upstream become inserts/updates (or no-ops) through
    /// the normal path; tracked levels absent upstream become removals. The
    /// resulting record replays like any other delta record.
    pub fn encode_snapshot(
        &mut self,
        timestamp_ms: u64,
        bids: &[PriceLevel],
        asks: &[PriceLevel],
    ) -> Result<Option<EncodedRecord>, CodecError> {
        let mut changes = Vec::with_capacity(bids.len() + asks.len());
        for (side, levels) in [(Side::Bid, bids), (Side::Ask, asks)] {
            for lv in levels {
                changes.push(LevelChange { side, price: lv.price, size: lv.size });
            }
            for price in self.snapshot.prices(side) {
                if !levels.iter().any(|lv| lv.price == price) {
                    changes.push(LevelChange { side, price, size: Decimal::ZERO });
                }
            }
        }
        self.encode_changes(timestamp_ms, &changes)
    }

    fn encode_changes(
        &mut self,
        timestamp_ms: u64,
        changes: &[LevelChange],
    ) -> Result<Option<EncodedRecord>, CodecError> {
        // Reject before touching any state.
        let delta = match self.last_timestamp_ms {
            None => 0,
            Some(last) => {
                if timestamp_ms < last {
                    return Err(CodecError::OrderingViolation {
                        last_ms: last,
                        event_ms: timestamp_ms,
                    });
                }
                timestamp_ms - last
            }
        };

        let mut entries = Vec::new();
        for ch in changes {
            let current = self.snapshot.get(ch.side, ch.price);
            if ch.size <= Decimal::ZERO {
                // Removal; a removal of an untracked level is a no-op.
                if current.is_some() {
                    self.snapshot.remove(ch.side, ch.price);
                    entries.push(LevelEntry::Remove { side: ch.side, price: ch.price });
                }
            } else {
                match current {
                    None => {
                        self.snapshot.set(ch.side, ch.price, ch.size);
                        entries.push(LevelEntry::Insert {
                            side: ch.side,
                            price: ch.price,
                            size: ch.size,
                        });
                    }
                    Some(cur) if cur != ch.size => {
                        self.snapshot.set(ch.side, ch.price, ch.size);
                        entries.push(LevelEntry::Update {
                            side: ch.side,
                            price: ch.price,
                            size: ch.size,
                        });
                    }
                    // Restates the tracked size: omit. This is where the
                    // compression win comes from.
                    Some(_) => {}
                }
            }
        }

        if entries.is_empty() && self.drop_empty {
            return Ok(None);
        }
        self.last_timestamp_ms = Some(timestamp_ms);
        Ok(Some(EncodedRecord { timestamp_delta_ms: delta, entries }))
    }

    /// Absolute timestamp of the last emitted record, if any.
    pub fn last_timestamp_ms(&self) -> Option<u64> {
        self.last_timestamp_ms
    }

    pub fn snapshot(&self) -> &BookSnapshot {
        &self.snapshot
    }
}

/// Exact inverse of [`Encoder`]: replays records into raw events while
/// rebuilding the book snapshot.
#[derive(Debug)]
pub struct Decoder {
    asset_id: String,
    last_timestamp_ms: u64,
    snapshot: BookSnapshot,
}

impl Decoder {
    /// The asset id is constant per stream and carried by the header, as is
    /// the base timestamp the first record's delta is relative to.
    pub fn new(asset_id: impl Into<String>, base_timestamp_ms: u64) -> Self {
        Self {
            asset_id: asset_id.into(),
            last_timestamp_ms: base_timestamp_ms,
            snapshot: BookSnapshot::new(),
        }
    }

    pub fn for_header(header: &StreamHeader) -> Self {
        Self::new(header.asset_id.clone(), header.base_timestamp_ms)
    }

    /// Apply one record, emitting the reconstructed event.
    ///
    /// On [`CodecError::IntegrityViolation`] the snapshot is no longer
    /// trustworthy and the decoder must not be fed further records; events
    /// decoded before the failure remain valid best-effort output.
    pub fn decode(&mut self, record: &EncodedRecord) -> Result<RawUpdateEvent, CodecError> {
        let timestamp_ms = self.last_timestamp_ms + record.timestamp_delta_ms;
        self.last_timestamp_ms = timestamp_ms;

        let mut changes = Vec::with_capacity(record.entries.len());
        for entry in &record.entries {
            match *entry {
                LevelEntry::Insert { side, price, size } => {
                    if self.snapshot.contains(side, price) {
                        return Err(CodecError::IntegrityViolation { op: "insert", side, price });
                    }
                    self.snapshot.set(side, price, size);
                    changes.push(LevelChange { side, price, size });
                }
                LevelEntry::Update { side, price, size } => {
                    if !self.snapshot.contains(side, price) {
                        return Err(CodecError::IntegrityViolation { op: "update", side, price });
                    }
                    self.snapshot.set(side, price, size);
                    changes.push(LevelChange { side, price, size });
                }
                LevelEntry::Remove { side, price } => {
                    if self.snapshot.remove(side, price).is_none() {
                        return Err(CodecError::IntegrityViolation { op: "remove", side, price });
                    }
                    changes.push(LevelChange { side, price, size: Decimal::ZERO });
                }
            }
        }

        Ok(RawUpdateEvent {
            asset_id: self.asset_id.clone(),
            timestamp_ms,
            changes,
        })
    }

    pub fn snapshot(&self) -> &BookSnapshot {
        &self.snapshot
    }

    pub fn last_timestamp_ms(&self) -> u64 {
        self.last_timestamp_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use std::str::FromStr;

    fn d(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn ev(ts: u64, changes: &[(Side, &str, &str)]) -> RawUpdateEvent {
        RawUpdateEvent {
            asset_id: "asset-1".into(),
            timestamp_ms: ts,
            changes: changes
                .iter()
                .map(|(side, p, s)| LevelChange { side: *side, price: d(p), size: d(s) })
                .collect(),
        }
    }

    #[test]
    fn round_trip_reproduces_events() {
        let events = vec![
            ev(1_000, &[(Side::Bid, "0.45", "120"), (Side::Ask, "0.55", "80")]),
            ev(1_007, &[(Side::Bid, "0.45", "90"), (Side::Bid, "0.44", "40")]),
            ev(1_007, &[(Side::Ask, "0.55", "0")]),
            ev(1_250, &[]),
            ev(1_300, &[(Side::Bid, "0.44", "0"), (Side::Ask, "0.56", "15")]),
        ];

        let mut enc = Encoder::new();
        let mut records = Vec::new();
        for e in &events {
            records.push(enc.encode(e).unwrap().expect("empty records are kept by default"));
        }

        let mut dec = Decoder::new("asset-1", events[0].timestamp_ms);
        let decoded: Vec<_> = records.iter().map(|r| dec.decode(r).unwrap()).collect();
        assert_eq!(decoded, events);
    }

    #[test]
    fn noop_changes_are_omitted() {
        let mut enc = Encoder::new();
        enc.encode(&ev(100, &[(Side::Bid, "0.50", "10")])).unwrap();

        // exact restatement of tracked state collapses to an empty record
        let rec = enc
            .encode(&ev(105, &[(Side::Bid, "0.50", "10")]))
            .unwrap()
            .unwrap();
        assert_eq!(rec.timestamp_delta_ms, 5);
        assert!(rec.entries.is_empty());

        // removal of an untracked level is also a no-op
        let rec = enc
            .encode(&ev(110, &[(Side::Ask, "0.99", "0")]))
            .unwrap()
            .unwrap();
        assert!(rec.entries.is_empty());
    }

    #[test]
    fn worked_example_insert_noop_remove() {
        // [{t:100, BID 10.5→50}] [{t:105, BID 10.5→50}] [{t:110, BID 10.5→0}]
        // encode to [{dt:0,[INSERT]}, {dt:5,[]}, {dt:5,[REMOVE]}]
        let events = vec![
            ev(100, &[(Side::Bid, "10.5", "50")]),
            ev(105, &[(Side::Bid, "10.5", "50")]),
            ev(110, &[(Side::Bid, "10.5", "0")]),
        ];
        let mut enc = Encoder::new();
        let records: Vec<_> = events
            .iter()
            .map(|e| enc.encode(e).unwrap().unwrap())
            .collect();

        assert_eq!(records[0].timestamp_delta_ms, 0);
        assert_eq!(
            records[0].entries,
            vec![LevelEntry::Insert { side: Side::Bid, price: d("10.5"), size: d("50") }]
        );
        assert_eq!(records[1].timestamp_delta_ms, 5);
        assert!(records[1].entries.is_empty());
        assert_eq!(records[2].timestamp_delta_ms, 5);
        assert_eq!(
            records[2].entries,
            vec![LevelEntry::Remove { side: Side::Bid, price: d("10.5") }]
        );

        let mut dec = Decoder::new("asset-1", 100);
        let decoded: Vec<_> = records.iter().map(|r| dec.decode(r).unwrap()).collect();
        // the no-op event decodes to an empty change list but keeps its slot
        assert_eq!(decoded[1].timestamp_ms, 105);
        assert_eq!(decoded[2], events[2]);
    }

    #[test]
    fn snapshot_symmetry_after_prefix() {
        let events = vec![
            ev(10, &[(Side::Bid, "0.30", "5"), (Side::Bid, "0.31", "7")]),
            ev(20, &[(Side::Ask, "0.40", "9")]),
            ev(30, &[(Side::Bid, "0.30", "0"), (Side::Ask, "0.40", "11")]),
        ];
        let mut enc = Encoder::new();
        let mut dec = Decoder::new("asset-1", 10);
        for e in &events {
            let rec = enc.encode(e).unwrap().unwrap();
            dec.decode(&rec).unwrap();
            assert_eq!(enc.snapshot(), dec.snapshot());
        }
        assert_eq!(enc.last_timestamp_ms(), Some(dec.last_timestamp_ms()));
    }

    #[test]
    fn ordering_violation_mutates_nothing() {
        let mut enc = Encoder::new();
        enc.encode(&ev(500, &[(Side::Bid, "0.20", "3")])).unwrap();
        let snap_before = enc.snapshot().clone();

        let err = enc
            .encode(&ev(499, &[(Side::Bid, "0.21", "4")]))
            .unwrap_err();
        assert_eq!(err, CodecError::OrderingViolation { last_ms: 500, event_ms: 499 });
        assert_eq!(enc.snapshot(), &snap_before);
        assert_eq!(enc.last_timestamp_ms(), Some(500));

        // encoder still usable for in-order input
        let rec = enc.encode(&ev(501, &[(Side::Bid, "0.21", "4")])).unwrap().unwrap();
        assert_eq!(rec.timestamp_delta_ms, 1);
    }

    #[test]
    fn equal_timestamps_are_accepted() {
        let mut enc = Encoder::new();
        enc.encode(&ev(100, &[(Side::Bid, "0.10", "1")])).unwrap();
        let rec = enc.encode(&ev(100, &[(Side::Bid, "0.11", "1")])).unwrap().unwrap();
        assert_eq!(rec.timestamp_delta_ms, 0);
    }

    #[test]
    fn decoder_rejects_untracked_remove_and_update() {
        let mut dec = Decoder::new("asset-1", 0);
        let err = dec
            .decode(&EncodedRecord {
                timestamp_delta_ms: 0,
                entries: vec![LevelEntry::Remove { side: Side::Bid, price: d("0.5") }],
            })
            .unwrap_err();
        assert_eq!(
            err,
            CodecError::IntegrityViolation { op: "remove", side: Side::Bid, price: d("0.5") }
        );

        let mut dec = Decoder::new("asset-1", 0);
        let err = dec
            .decode(&EncodedRecord {
                timestamp_delta_ms: 0,
                entries: vec![LevelEntry::Update { side: Side::Ask, price: d("0.6"), size: d("2") }],
            })
            .unwrap_err();
        assert!(matches!(err, CodecError::IntegrityViolation { op: "update", .. }));
    }

    #[test]
    fn decoder_rejects_insert_over_tracked_level() {
        let mut dec = Decoder::new("asset-1", 0);
        let insert = EncodedRecord {
            timestamp_delta_ms: 0,
            entries: vec![LevelEntry::Insert { side: Side::Bid, price: d("0.5"), size: d("1") }],
        };
        dec.decode(&insert).unwrap();
        let err = dec.decode(&insert).unwrap_err();
        assert!(matches!(err, CodecError::IntegrityViolation { op: "insert", .. }));
    }

    #[test]
    fn drop_empty_keeps_delta_anchored_to_last_emitted() {
        let mut enc = Encoder::new().drop_empty_records(true);
        enc.encode(&ev(100, &[(Side::Bid, "0.50", "10")])).unwrap().unwrap();

        // no-op at t=105 is dropped and must not advance the chain
        assert!(enc.encode(&ev(105, &[(Side::Bid, "0.50", "10")])).unwrap().is_none());
        assert_eq!(enc.last_timestamp_ms(), Some(100));

        let rec = enc
            .encode(&ev(110, &[(Side::Bid, "0.50", "20")]))
            .unwrap()
            .unwrap();
        assert_eq!(rec.timestamp_delta_ms, 10);

        let mut dec = Decoder::new("asset-1", 100);
        let first = EncodedRecord {
            timestamp_delta_ms: 0,
            entries: vec![LevelEntry::Insert { side: Side::Bid, price: d("0.50"), size: d("10") }],
        };
        assert_eq!(dec.decode(&first).unwrap().timestamp_ms, 100);
        assert_eq!(dec.decode(&rec).unwrap().timestamp_ms, 110);
    }

    #[test]
    fn encode_snapshot_diffs_against_book_state() {
        let mut enc = Encoder::new();
        enc.encode(&ev(
            1_000,
            &[
                (Side::Bid, "0.45", "100"),
                (Side::Bid, "0.44", "50"),
                (Side::Ask, "0.55", "60"),
            ],
        ))
        .unwrap();

        // Re-statement after reconnect: 0.45 changed, 0.44 vanished, 0.55
        // unchanged, 0.56 is new.
        let bids = vec![PriceLevel { price: d("0.45"), size: d("130") }];
        let asks = vec![
            PriceLevel { price: d("0.55"), size: d("60") },
            PriceLevel { price: d("0.56"), size: d("25") },
        ];
        let rec = enc.encode_snapshot(2_000, &bids, &asks).unwrap().unwrap();
        assert_eq!(rec.timestamp_delta_ms, 1_000);
        assert!(rec.entries.contains(&LevelEntry::Update {
            side: Side::Bid,
            price: d("0.45"),
            size: d("130")
        }));
        assert!(rec.entries.contains(&LevelEntry::Remove { side: Side::Bid, price: d("0.44") }));
        assert!(rec.entries.contains(&LevelEntry::Insert {
            side: Side::Ask,
            price: d("0.56"),
            size: d("25")
        }));
        assert_eq!(rec.entries.len(), 3);

        // replaying the record lands on the re-stated book
        let mut dec = Decoder::new("asset-1", 1_000);
        dec.decode(&EncodedRecord {
            timestamp_delta_ms: 0,
            entries: vec![
                LevelEntry::Insert { side: Side::Bid, price: d("0.45"), size: d("100") },
                LevelEntry::Insert { side: Side::Bid, price: d("0.44"), size: d("50") },
                LevelEntry::Insert { side: Side::Ask, price: d("0.55"), size: d("60") },
            ],
        })
        .unwrap();
        dec.decode(&rec).unwrap();
        assert_eq!(dec.snapshot(), enc.snapshot());
        assert_eq!(dec.snapshot().depth(Side::Bid), 1);
        assert_eq!(dec.snapshot().depth(Side::Ask), 2);
    }
}
