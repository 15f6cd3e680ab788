// SPDX-License-Identifier: AGPL-3.0-only

//! Bank descriptor table
//!
//! Filled once during bring-up and read-only afterwards.

use crate::driver::BankInfo;
use filter_chip::regs::MAX_BANK;

/// Descriptors of the fitted memory banks
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BankTable {
    slots: [Option<BankInfo>; MAX_BANK],
}

impl BankTable {
    /// Empty table
    pub const fn new() -> Self {
        Self {
            slots: [None; MAX_BANK],
        }
    }

    /// Record bank `bank`. Out-of-range indices are ignored.
    pub(crate) fn insert(&mut self, bank: usize, info: BankInfo) {
        if let Some(slot) = self.slots.get_mut(bank) {
            *slot = Some(info);
        }
    }

    /// Descriptor of bank `bank`, if fitted
    pub fn get(&self, bank: usize) -> Option<&BankInfo> {
        self.slots.get(bank).and_then(Option::as_ref)
    }

    /// Whether bank `bank` is fitted
    pub fn is_fitted(&self, bank: usize) -> bool {
        self.get(bank).is_some()
    }

    /// Fitted banks in index order
    pub fn fitted(&self) -> impl Iterator<Item = (usize, &BankInfo)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(bank, slot)| slot.as_ref().map(|info| (bank, info)))
    }

    /// Number of fitted banks
    pub fn len(&self) -> usize {
        self.fitted().count()
    }

    /// Whether no bank is fitted
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_inserted_banks_are_fitted() {
        let mut table = BankTable::new();
        let info = BankInfo {
            kind: 1,
            width: 32,
            size: 1024,
        };
        table.insert(0, info);
        table.insert(2, info);
        table.insert(MAX_BANK, info);

        assert!(table.is_fitted(0));
        assert!(!table.is_fitted(1));
        assert!(table.is_fitted(2));
        assert!(!table.is_fitted(MAX_BANK));
        assert_eq!(table.fitted().map(|(bank, _)| bank).collect::<Vec<_>>(), [0, 2]);
        assert_eq!(table.len(), 2);
    }
}
