use rand::Rng;
use static_assertions::const_assert;

/// Lowest address bit of the default bank/rank window.
pub const BANK_SHIFT: u32 = 7;
/// The row is made of the 37 high order bits.
pub const ROW_BITS: u32 = 37;
pub const ROW_SHIFT: u32 = 64 - ROW_BITS;
/// Candidate addresses are drawn on this granularity.
pub const ADDRESS_GRANULARITY: u64 = 128;

const_assert!(BANK_SHIFT < ROW_SHIFT);

/// XOR bank function: one output bit per mask, the parity of the masked address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressHasher {
    masks: Vec<u64>,
}

fn hash(addr: u64, mask: u64) -> u64 {
    ((addr & mask).count_ones() & 1) as u64
}

impl AddressHasher {
    pub fn new(masks: &[u64]) -> AddressHasher {
        AddressHasher {
            masks: masks.to_vec(),
        }
    }

    pub fn hash(&self, addr: u64) -> u64 {
        let mut res = 0;
        for mask in &self.masks {
            res <<= 1;
            res |= hash(addr, *mask);
        }
        res
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BankFunction {
    /// `bits` address bits starting at `shift`.
    Window { shift: u32, bits: u32 },
    Xor(AddressHasher),
}

/// Approximation of the physical DRAM mapping: which addresses share a bank, and in which row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BankRowMapping {
    bank: BankFunction,
    row_shift: u32,
}

impl BankRowMapping {
    /// Bank bits `[bank_shift, row_shift)`, row bits `[row_shift, 64)`.
    pub fn bit_window(bank_shift: u32, row_shift: u32) -> Self {
        assert!(bank_shift < row_shift && row_shift < 64);
        BankRowMapping {
            bank: BankFunction::Window {
                shift: bank_shift,
                bits: row_shift - bank_shift,
            },
            row_shift,
        }
    }

    pub fn xor(masks: &[u64], row_shift: u32) -> Self {
        assert!(row_shift < 64);
        BankRowMapping {
            bank: BankFunction::Xor(AddressHasher::new(masks)),
            row_shift,
        }
    }

    pub fn bank(&self, addr: u64) -> u64 {
        match &self.bank {
            BankFunction::Window { shift, bits } => (addr >> shift) & ((1u64 << bits) - 1),
            BankFunction::Xor(hasher) => hasher.hash(addr),
        }
    }

    pub fn row(&self, addr: u64) -> u64 {
        addr >> self.row_shift
    }

    /// Same bank, different row: accessing `a` then `b` forces a row buffer conflict.
    pub fn conflicts(&self, a: u64, b: u64) -> bool {
        self.bank(a) == self.bank(b) && self.row(a) != self.row(b)
    }
}

impl Default for BankRowMapping {
    fn default() -> Self {
        Self::bit_window(BANK_SHIFT, ROW_SHIFT)
    }
}

/// Uniformly random address of the region `[base, base + length)`, aligned on `granularity`
/// relative to `base`.
pub fn random_address<R: Rng + ?Sized>(rng: &mut R, base: u64, length: u64, granularity: u64) -> u64 {
    let slots = length / granularity;
    assert!(slots > 0, "region smaller than one granule");
    base + rng.gen_range(0..slots) * granularity
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    // Bit twiddling formulation: shift the bank bits to the top then back down.
    fn bank_rank_bits(addr: u64) -> u64 {
        (addr << ROW_BITS) >> (BANK_SHIFT + ROW_BITS)
    }

    #[test]
    fn default_window_matches_shift_formulation() {
        let mapping = BankRowMapping::default();
        let mut rng = SmallRng::seed_from_u64(3);
        for _ in 0..1000 {
            let a: u64 = rng.gen();
            assert_eq!(mapping.bank(a), bank_rank_bits(a));
            assert_eq!(mapping.row(a), a >> (64 - ROW_BITS));
        }
    }

    #[test]
    fn conflicts_needs_same_bank_other_row() {
        let mapping = BankRowMapping::bit_window(7, 12);
        let a = 0x4000_0080;
        assert!(mapping.conflicts(a, a + 0x1000));
        assert!(!mapping.conflicts(a, a));
        assert!(!mapping.conflicts(a, a + 0x80));
        assert!(!mapping.conflicts(a, a + 0x1080));
    }

    #[test]
    fn xor_bank_function() {
        let mapping = BankRowMapping::xor(&[0b11 << 13, 0b101 << 14], 20);
        assert_eq!(mapping.bank(0), 0);
        assert_eq!(mapping.bank(1 << 13), 0b10);
        assert_eq!(mapping.bank(0b11 << 13), 0b01);
        assert_eq!(mapping.bank(1 << 16), 0b01);
        assert_eq!(mapping.row(1 << 21), 2);
    }

    #[test]
    fn random_addresses_are_aligned_and_inside() {
        let mut rng = SmallRng::seed_from_u64(11);
        let base = 0x7f00_0000_0000;
        let length = 1 << 20;
        for _ in 0..10_000 {
            let a = random_address(&mut rng, base, length, ADDRESS_GRANULARITY);
            assert!(a >= base && a < base + length);
            assert_eq!((a - base) % ADDRESS_GRANULARITY, 0);
        }
    }
}
