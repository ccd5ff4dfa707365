//! Order-book snapshot: the codec's mutable working state.
//!
//! `BookSnapshot` maps `(side, price) → size` for one asset. It is derived
//! state only: built empty at stream start, mutated by every encode or
//! decode step, and never persisted — replaying the record sequence from
//! the beginning reconstructs it exactly. Absence of a key represents zero
//! size; a zero is never stored.

use rust_decimal::Decimal;
use std::collections::BTreeMap;

use crate::record::Side;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BookSnapshot {
    bids: BTreeMap<Decimal, Decimal>,
    asks: BTreeMap<Decimal, Decimal>,
}

impl BookSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    fn side(&self, side: Side) -> &BTreeMap<Decimal, Decimal> {
        match side {
            Side::Bid => &self.bids,
            Side::Ask => &self.asks,
        }
    }

    fn side_mut(&mut self, side: Side) -> &mut BTreeMap<Decimal, Decimal> {
        match side {
            Side::Bid => &mut self.bids,
            Side::Ask => &mut self.asks,
        }
    }

    /// Size resting at `(side, price)`, or `None` if the level is not
    /// tracked.
    pub fn get(&self, side: Side, price: Decimal) -> Option<Decimal> {
        self.side(side).get(&price).copied()
    }

    /// Set the size at `(side, price)`, returning the previous size if the
    /// level was already tracked. `size` must be positive; zero sizes are
    /// represented by removal.
    pub fn set(&mut self, side: Side, price: Decimal, size: Decimal) -> Option<Decimal> {
        debug_assert!(size > Decimal::ZERO);
        self.side_mut(side).insert(price, size)
    }

    /// Remove the level, returning its size if it was tracked.
    pub fn remove(&mut self, side: Side, price: Decimal) -> Option<Decimal> {
        self.side_mut(side).remove(&price)
    }

    pub fn contains(&self, side: Side, price: Decimal) -> bool {
        self.side(side).contains_key(&price)
    }

    /// Number of tracked levels on one side.
    pub fn depth(&self, side: Side) -> usize {
        self.side(side).len()
    }

    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }

    /// Levels on one side, best first (descending prices for bids,
    /// ascending for asks).
    pub fn levels(&self, side: Side) -> Vec<(Decimal, Decimal)> {
        match side {
            Side::Bid => self.bids.iter().rev().map(|(p, s)| (*p, *s)).collect(),
            Side::Ask => self.asks.iter().map(|(p, s)| (*p, *s)).collect(),
        }
    }

    /// Best (highest) bid, if any.
    pub fn best_bid(&self) -> Option<(Decimal, Decimal)> {
        self.bids.iter().next_back().map(|(p, s)| (*p, *s))
    }

    /// Best (lowest) ask, if any.
    pub fn best_ask(&self) -> Option<(Decimal, Decimal)> {
        self.asks.iter().next().map(|(p, s)| (*p, *s))
    }

    /// All tracked prices on one side, ascending.
    pub fn prices(&self, side: Side) -> Vec<Decimal> {
        self.side(side).keys().copied().collect()
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

    #[test]
    fn set_get_remove() {
        let mut b = BookSnapshot::new();
        assert!(b.is_empty());
        assert_eq!(b.set(Side::Bid, d("0.45"), d("100")), None);
        assert_eq!(b.get(Side::Bid, d("0.45")), Some(d("100")));
        // same price on the other side is a distinct level
        assert_eq!(b.get(Side::Ask, d("0.45")), None);
        assert_eq!(b.set(Side::Bid, d("0.45"), d("250")), Some(d("100")));
        assert_eq!(b.remove(Side::Bid, d("0.45")), Some(d("250")));
        assert_eq!(b.remove(Side::Bid, d("0.45")), None);
        assert!(b.is_empty());
    }

    #[test]
    fn best_and_ordering() {
        let mut b = BookSnapshot::new();
        b.set(Side::Bid, d("0.44"), d("10"));
        b.set(Side::Bid, d("0.46"), d("20"));
        b.set(Side::Ask, d("0.49"), d("5"));
        b.set(Side::Ask, d("0.47"), d("7"));
        assert_eq!(b.best_bid(), Some((d("0.46"), d("20"))));
        assert_eq!(b.best_ask(), Some((d("0.47"), d("7"))));
        // best first on both sides
        assert_eq!(b.levels(Side::Bid)[0].0, d("0.46"));
        assert_eq!(b.levels(Side::Ask)[0].0, d("0.47"));
        assert_eq!(b.depth(Side::Bid), 2);
    }

    #[test]
    fn exact_decimal_keys() {
        let mut b = BookSnapshot::new();
        // trailing zeros compare equal under Decimal, so "0.50" and "0.5"
        // address the same level
        b.set(Side::Ask, d("0.50"), d("1"));
        assert!(b.contains(Side::Ask, d("0.5")));
        assert_eq!(b.remove(Side::Ask, d("0.5")), Some(d("1")));
    }
}
