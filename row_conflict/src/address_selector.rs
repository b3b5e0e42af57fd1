//! Address Selector: remote addresses that share a bank with a random anchor but sit in another
//! row, so that reading them back to back forces row buffer conflicts.

use crate::error::ExperimentError;
use dram_utils::dram_addressing::{random_address, BankRowMapping};
use log::debug;
use rand::Rng;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressSet {
    anchor: u64,
    addresses: Vec<u64>,
    unique: usize,
}

impl AddressSet {
    pub fn anchor(&self) -> u64 {
        self.anchor
    }

    pub fn addresses(&self) -> &[u64] {
        &self.addresses
    }

    /// Length of the distinct prefix, the rest of the set cycles over it.
    pub fn unique(&self) -> usize {
        self.unique
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct AddressSelector {
    mapping: BankRowMapping,
    granularity: u64,
}

impl AddressSelector {
    pub fn new(mapping: &BankRowMapping, granularity: u64) -> Self {
        AddressSelector {
            mapping: mapping.clone(),
            granularity,
        }
    }

    /// `count` distinct addresses of `[base, base + length)` conflicting with a random anchor.
    pub fn select<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        base: u64,
        length: u64,
        count: usize,
    ) -> Result<AddressSet, ExperimentError> {
        self.select_repeating(rng, base, length, count, count)
    }

    /// Draw `unique` distinct conflicting addresses, then repeat them cyclically up to `total`.
    ///
    /// Candidates are drawn until enough are accepted: a region that cannot supply `unique`
    /// of them makes this spin forever.
    pub fn select_repeating<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        base: u64,
        length: u64,
        unique: usize,
        total: usize,
    ) -> Result<AddressSet, ExperimentError> {
        if length < self.granularity || self.granularity == 0 {
            return Err(ExperimentError::RegionTooSmall {
                length,
                granularity: self.granularity,
            });
        }
        let unique = unique.min(total);
        if unique == 0 && total > 0 {
            return Err(ExperimentError::NotEnoughAddresses {
                needed: total,
                available: 0,
            });
        }
        let anchor = random_address(rng, base, length, self.granularity);
        let bank = self.mapping.bank(anchor);
        let row = self.mapping.row(anchor);

        let mut addresses = Vec::with_capacity(total);
        let mut draws = 0u64;
        while addresses.len() < unique {
            let candidate = random_address(rng, base, length, self.granularity);
            draws += 1;
            if candidate == anchor
                || self.mapping.bank(candidate) != bank
                || self.mapping.row(candidate) == row
                || addresses.contains(&candidate)
            {
                continue;
            }
            addresses.push(candidate);
        }
        for i in unique..total {
            addresses.push(addresses[i % unique]);
        }
        debug!(
            "selected {} addresses ({} unique) around anchor {:#x} after {} draws",
            total, unique, anchor, draws
        );
        Ok(AddressSet {
            anchor,
            addresses,
            unique,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    const BASE: u64 = 0x7f12_0000_0000;
    const LENGTH: u64 = 1 << 20;

    fn selector() -> (BankRowMapping, AddressSelector) {
        // 32 banks of 128 byte lines, rows of 4 KiB: small enough for a 1 MiB region.
        let mapping = BankRowMapping::bit_window(7, 12);
        let selector = AddressSelector::new(&mapping, 128);
        (mapping, selector)
    }

    #[test]
    fn every_address_conflicts_with_the_anchor() {
        let (mapping, selector) = selector();
        let mut rng = StdRng::seed_from_u64(7);
        let set = selector.select(&mut rng, BASE, LENGTH, 64).unwrap();
        assert_eq!(set.len(), 64);
        assert_eq!(set.unique(), 64);
        for (i, a) in set.addresses().iter().enumerate() {
            assert_ne!(*a, set.anchor());
            assert!(mapping.conflicts(set.anchor(), *a));
            assert!(*a >= BASE && *a < BASE + LENGTH);
            assert_eq!((a - BASE) % 128, 0);
            assert!(!set.addresses()[..i].contains(a));
        }
    }

    #[test]
    fn repetitions_cycle_over_the_unique_prefix() {
        let (_, selector) = selector();
        let mut rng = StdRng::seed_from_u64(8);
        let set = selector
            .select_repeating(&mut rng, BASE, LENGTH, 3, 10)
            .unwrap();
        assert_eq!(set.len(), 10);
        assert_eq!(set.unique(), 3);
        let a = set.addresses();
        for i in 3..10 {
            assert_eq!(a[i], a[i % 3]);
        }
        assert!(a[0] != a[1] && a[1] != a[2] && a[0] != a[2]);
    }

    #[test]
    fn tight_region_still_yields_every_address() {
        // Four rows of 4 KiB: each bank has exactly three candidates besides the anchor.
        let (mapping, selector) = selector();
        let length = 4 << 12;
        for seed in 0..8 {
            let mut rng = StdRng::seed_from_u64(seed);
            let set = selector.select(&mut rng, BASE, length, 3).unwrap();
            let column = (set.anchor() - BASE) % (1 << 12);
            let mut expected: Vec<u64> = (0..4)
                .map(|row| BASE + (row << 12) + column)
                .filter(|a| *a != set.anchor())
                .collect();
            let mut got = set.addresses().to_vec();
            got.sort_unstable();
            expected.sort_unstable();
            assert_eq!(got, expected);
            assert!(got.iter().all(|a| mapping.conflicts(set.anchor(), *a)));
        }
    }

    #[test]
    fn seeded_selection_is_reproducible() {
        let (_, selector) = selector();
        let a = selector
            .select(&mut StdRng::seed_from_u64(99), BASE, LENGTH, 16)
            .unwrap();
        let b = selector
            .select(&mut StdRng::seed_from_u64(99), BASE, LENGTH, 16)
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn region_below_granularity_is_rejected() {
        let (_, selector) = selector();
        let mut rng = StdRng::seed_from_u64(1);
        assert!(matches!(
            selector.select(&mut rng, BASE, 64, 1),
            Err(ExperimentError::RegionTooSmall {
                length: 64,
                granularity: 128
            })
        ));
    }

    #[test]
    fn empty_request() {
        let (_, selector) = selector();
        let mut rng = StdRng::seed_from_u64(2);
        let set = selector.select(&mut rng, BASE, LENGTH, 0).unwrap();
        assert!(set.is_empty());
    }
}
