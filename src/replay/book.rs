//! Working book state used during delta replay.
//!
//! A `BookState` is the mutable accumulator the reconstruction engine folds
//! deltas into. BTreeMap keys keep each side price-ordered so projection is
//! a straight iteration with no sort.

use crate::models::Side;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One projected price level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookLevel {
    /// Price in integer cents, 1..=99.
    pub price: u8,
    pub quantity: i64,
}

/// Price -> resting quantity maps for both sides of one market's book.
#[derive(Debug, Clone, Default)]
pub struct BookState {
    yes: BTreeMap<u8, i64>,
    no: BTreeMap<u8, i64>,
}

impl BookState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed from snapshot levels. Non-positive quantities are ignored; a
    /// snapshot never legitimately carries an empty level.
    pub fn from_levels(yes: &[(u8, i64)], no: &[(u8, i64)]) -> Self {
        let mut book = Self::new();
        for &(price, qty) in yes {
            if qty > 0 {
                book.yes.insert(price, qty);
            }
        }
        for &(price, qty) in no {
            if qty > 0 {
                book.no.insert(price, qty);
            }
        }
        book
    }

    fn side_map(&mut self, side: Side) -> &mut BTreeMap<u8, i64> {
        match side {
            Side::Yes => &mut self.yes,
            Side::No => &mut self.no,
        }
    }

    /// Apply one signed quantity change. A level driven to zero (or below,
    /// which a well-formed feed never produces) is removed entirely.
    pub fn apply(&mut self, side: Side, price: u8, delta: i64) {
        let map = self.side_map(side);
        let current = map.get(&price).copied().unwrap_or(0);
        let updated = current + delta;
        if updated > 0 {
            map.insert(price, updated);
        } else {
            map.remove(&price);
        }
    }

    pub fn quantity_at(&self, side: Side, price: u8) -> i64 {
        match side {
            Side::Yes => self.yes.get(&price).copied().unwrap_or(0),
            Side::No => self.no.get(&price).copied().unwrap_or(0),
        }
    }

    pub fn level_count(&self, side: Side) -> usize {
        match side {
            Side::Yes => self.yes.len(),
            Side::No => self.no.len(),
        }
    }

    /// Project the yes side, best level first (descending by price),
    /// truncated to `depth` levels when given.
    pub fn yes_levels(&self, depth: Option<usize>) -> Vec<BookLevel> {
        let iter = self.yes.iter().rev().map(|(&price, &quantity)| BookLevel {
            price,
            quantity,
        });
        match depth {
            Some(d) => iter.take(d).collect(),
            None => iter.collect(),
        }
    }

    /// Project the no side, best level first (ascending by price),
    /// truncated to `depth` levels when given.
    pub fn no_levels(&self, depth: Option<usize>) -> Vec<BookLevel> {
        let iter = self.no.iter().map(|(&price, &quantity)| BookLevel {
            price,
            quantity,
        });
        match depth {
            Some(d) => iter.take(d).collect(),
            None => iter.collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_accumulates() {
        let mut book = BookState::new();
        book.apply(Side::Yes, 60, 10);
        book.apply(Side::Yes, 60, 5);
        assert_eq!(book.quantity_at(Side::Yes, 60), 15);
    }

    #[test]
    fn test_zero_quantity_removes_level() {
        let mut book = BookState::from_levels(&[(60, 10)], &[]);
        book.apply(Side::Yes, 60, 5);
        book.apply(Side::Yes, 60, -15);
        assert_eq!(book.quantity_at(Side::Yes, 60), 0);
        assert_eq!(book.level_count(Side::Yes), 0);
        assert!(book.yes_levels(None).is_empty());
    }

    #[test]
    fn test_sides_independent() {
        let mut book = BookState::new();
        book.apply(Side::Yes, 60, 10);
        book.apply(Side::No, 60, 7);
        assert_eq!(book.quantity_at(Side::Yes, 60), 10);
        assert_eq!(book.quantity_at(Side::No, 60), 7);
    }

    #[test]
    fn test_yes_projection_descending() {
        let book = BookState::from_levels(&[(55, 1), (60, 2), (40, 3)], &[]);
        let levels = book.yes_levels(None);
        let prices: Vec<u8> = levels.iter().map(|l| l.price).collect();
        assert_eq!(prices, vec![60, 55, 40]);
    }

    #[test]
    fn test_no_projection_ascending() {
        let book = BookState::from_levels(&[], &[(45, 1), (30, 2), (41, 3)]);
        let levels = book.no_levels(None);
        let prices: Vec<u8> = levels.iter().map(|l| l.price).collect();
        assert_eq!(prices, vec![30, 41, 45]);
    }

    #[test]
    fn test_depth_truncation_keeps_most_competitive() {
        let book = BookState::from_levels(
            &[(55, 1), (60, 2), (40, 3), (58, 4)],
            &[(45, 1), (30, 2), (41, 3)],
        );
        let yes = book.yes_levels(Some(2));
        assert_eq!(
            yes.iter().map(|l| l.price).collect::<Vec<_>>(),
            vec![60, 58]
        );
        let no = book.no_levels(Some(2));
        assert_eq!(no.iter().map(|l| l.price).collect::<Vec<_>>(), vec![30, 41]);
    }
}
