use rust_decimal::Decimal;

use crate::payout::max_payout;
use crate::types::{Cell, CellKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Toggle {
    Added,
    Removed,
    /// Cap reached; the selection is unchanged.
    Rejected,
}

/// The player's provisional picks. Cells are stored by value as they were when picked,
/// so later grid rebuilds never change a pick's bounds or multiplier.
#[derive(Debug, Clone)]
pub struct SelectionManager {
    max: usize,
    cells: Vec<Cell>,
}

impl SelectionManager {
    pub fn new(max: usize) -> Self {
        Self { max: max.max(1), cells: Vec::with_capacity(max) }
    }

    pub fn toggle(&mut self, cell: &Cell) -> Toggle {
        if self.remove(&cell.id) {
            return Toggle::Removed;
        }
        if self.cells.len() >= self.max {
            tracing::debug!(cell = %cell.id, max = self.max, "selection full, toggle ignored");
            return Toggle::Rejected;
        }
        self.cells.push(cell.clone());
        Toggle::Added
    }

    pub fn remove(&mut self, id: &CellKey) -> bool {
        let before = self.cells.len();
        self.cells.retain(|c| c.id != *id);
        self.cells.len() != before
    }

    pub fn clear(&mut self) {
        self.cells.clear();
    }

    pub fn contains(&self, id: &CellKey) -> bool {
        self.cells.iter().any(|c| c.id == *id)
    }

    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    pub fn keys(&self) -> Vec<CellKey> {
        self.cells.iter().map(|c| c.id).collect()
    }

    /// Value copy handed to the round at lock time.
    pub fn snapshot(&self) -> Vec<Cell> {
        self.cells.clone()
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn max(&self) -> usize {
        self.max
    }

    pub fn max_payout(&self, stake: Decimal) -> Decimal {
        max_payout(stake, self.cells.iter().map(|c| c.multiplier_bps))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Side;
    use rust_decimal_macros::dec;

    fn cell(side: Side, lower: Decimal, bps: u32) -> Cell {
        Cell::new(side, lower, lower + dec!(0.1), 0, bps, 2).unwrap()
    }

    #[test]
    fn toggle_adds_then_removes() {
        let mut s = SelectionManager::new(2);
        let a = cell(Side::Above, dec!(100.05), 15_000);
        assert_eq!(s.toggle(&a), Toggle::Added);
        assert!(s.contains(&a.id));
        assert_eq!(s.toggle(&a), Toggle::Removed);
        assert!(s.is_empty());
    }

    #[test]
    fn cap_is_enforced_silently() {
        let mut s = SelectionManager::new(2);
        let a = cell(Side::Above, dec!(100.05), 15_000);
        let b = cell(Side::Below, dec!(99.90), 15_000);
        let c = cell(Side::Above, dec!(100.20), 30_000);
        s.toggle(&a);
        s.toggle(&b);
        assert_eq!(s.toggle(&c), Toggle::Rejected);
        assert_eq!(s.keys(), vec![a.id, b.id]);

        // removal still works at the cap
        assert_eq!(s.toggle(&b), Toggle::Removed);
        assert_eq!(s.toggle(&c), Toggle::Added);
    }

    #[test]
    fn identity_is_side_and_fixed_lower_bound() {
        let mut s = SelectionManager::new(2);
        let a = cell(Side::Above, dec!(100.051), 15_000);
        // same band recomputed from a nearby reference
        let a2 = cell(Side::Above, dec!(100.054), 30_000);
        let b = cell(Side::Below, dec!(100.05), 15_000);
        s.toggle(&a);
        assert_eq!(s.toggle(&a2), Toggle::Removed);
        s.toggle(&a);
        assert_eq!(s.toggle(&b), Toggle::Added);
        assert_eq!(s.len(), 2);
    }

    #[test]
    fn picks_keep_their_captured_multiplier() {
        let mut s = SelectionManager::new(2);
        let a = cell(Side::Above, dec!(100.05), 30_000);
        s.toggle(&a);
        let snap = s.snapshot();
        s.clear();
        assert_eq!(snap[0].multiplier_bps, 30_000);
        assert!(s.is_empty());
    }

    #[test]
    fn cap_holds_for_any_toggle_sequence() {
        let cells: Vec<Cell> = (0..5)
            .map(|i| cell(Side::Above, dec!(100) + Decimal::from(i), 15_000))
            .collect();
        let mut s = SelectionManager::new(2);
        for step in 0..200usize {
            let c = &cells[(step * 7 + step / 3) % cells.len()];
            let was = s.contains(&c.id);
            s.toggle(c);
            assert!(s.len() <= 2);
            if was {
                assert!(!s.contains(&c.id));
            }
        }
    }

    #[test]
    fn max_payout_over_selection() {
        let mut s = SelectionManager::new(2);
        s.toggle(&cell(Side::Above, dec!(100.05), 30_000));
        s.toggle(&cell(Side::Below, dec!(99.90), 150_000));
        assert_eq!(s.max_payout(dec!(0.05)), dec!(0.90));
    }
}
