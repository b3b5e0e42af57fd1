use static_assertions::const_assert_eq;

/// Size of a descriptor on the wire.
pub const DESCRIPTOR_SIZE: usize = 24;

/// Remote memory handle handed to the peer so it can issue one-sided reads.
///
/// Encoded little endian, in field order, with no padding.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RegionDescriptor {
    pub addr: u64,
    pub length: u64,
    pub rkey: u32,
    pub lkey: u32,
}

const_assert_eq!(core::mem::size_of::<RegionDescriptor>(), DESCRIPTOR_SIZE);

impl RegionDescriptor {
    pub fn to_bytes(&self) -> [u8; DESCRIPTOR_SIZE] {
        let mut out = [0u8; DESCRIPTOR_SIZE];
        out[0..8].copy_from_slice(&self.addr.to_le_bytes());
        out[8..16].copy_from_slice(&self.length.to_le_bytes());
        out[16..20].copy_from_slice(&self.rkey.to_le_bytes());
        out[20..24].copy_from_slice(&self.lkey.to_le_bytes());
        out
    }

    /// Decode the first `DESCRIPTOR_SIZE` bytes of `bytes`, `None` if too short.
    pub fn from_bytes(bytes: &[u8]) -> Option<RegionDescriptor> {
        if bytes.len() < DESCRIPTOR_SIZE {
            return None;
        }
        let u64_at = |i: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&bytes[i..i + 8]);
            u64::from_le_bytes(b)
        };
        let u32_at = |i: usize| {
            let mut b = [0u8; 4];
            b.copy_from_slice(&bytes[i..i + 4]);
            u32::from_le_bytes(b)
        };
        Some(RegionDescriptor {
            addr: u64_at(0),
            length: u64_at(8),
            rkey: u32_at(16),
            lkey: u32_at(20),
        })
    }

    pub fn end(&self) -> u64 {
        self.addr + self.length
    }

    /// Whether `[addr, addr + len)` lies inside the region.
    pub fn contains(&self, addr: u64, len: u64) -> bool {
        addr >= self.addr && addr.checked_add(len).is_some_and(|e| e <= self.end())
    }
}

#[cfg(test)]
mod tests {
    use super::{RegionDescriptor, DESCRIPTOR_SIZE};

    #[test]
    fn wire_layout() {
        let d = RegionDescriptor {
            addr: 0x1122_3344_5566_7788,
            length: 0x4000_0000,
            rkey: 0xdead_beef,
            lkey: 7,
        };
        let bytes = d.to_bytes();
        assert_eq!(bytes[0], 0x88);
        assert_eq!(bytes[7], 0x11);
        assert_eq!(&bytes[16..20], &[0xef, 0xbe, 0xad, 0xde]);
        assert_eq!(RegionDescriptor::from_bytes(&bytes), Some(d));
        assert_eq!(RegionDescriptor::from_bytes(&bytes[..DESCRIPTOR_SIZE - 1]), None);
    }

    #[test]
    fn bounds() {
        let d = RegionDescriptor {
            addr: 4096,
            length: 4096,
            rkey: 1,
            lkey: 1,
        };
        assert!(d.contains(4096, 64));
        assert!(d.contains(8192 - 64, 64));
        assert!(!d.contains(8192 - 63, 64));
        assert!(!d.contains(4095, 1));
        assert!(!d.contains(u64::MAX, 2));
    }
}
