//! The emulated memory collaborator.
//!
//! The bridge reaches emulated memory only through [`EmulatedMemory`]. The
//! collaborator owns byte order: `try_read_u32` returns the integer the
//! emulated CPU would see, already assembled.
//!
//! [`FlatMemory`] is a region-mapped reference collaborator used by the CLI
//! and by tests.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Narrow read/write primitives exposed by the emulator's memory subsystem.
///
/// `None` means the address (or any byte of the access) is not mapped.
pub trait EmulatedMemory: Send {
    fn try_read_u8(&self, address: u32) -> Option<u8>;
    fn try_read_u16(&self, address: u32) -> Option<u16>;
    fn try_read_u32(&self, address: u32) -> Option<u32>;
    fn try_read_u64(&self, address: u32) -> Option<u64>;

    fn try_write_u8(&mut self, address: u32, value: u8) -> Option<()>;
    fn try_write_u16(&mut self, address: u32, value: u16) -> Option<()>;
    fn try_write_u32(&mut self, address: u32, value: u32) -> Option<()>;
    fn try_write_u64(&mut self, address: u32, value: u64) -> Option<()>;

    /// Host view of emulated memory from `address` to the end of its mapping.
    fn host_slice(&self, address: u32) -> Option<&[u8]>;

    fn host_slice_mut(&mut self, address: u32) -> Option<&mut [u8]>;
}

/// Memory collaborator shared between the emulator and every session.
///
/// Bridge calls take the lock for one API call at a time.
pub type SharedMemory = Arc<Mutex<dyn EmulatedMemory>>;

pub fn shared_memory<M: EmulatedMemory + 'static>(memory: M) -> SharedMemory {
    Arc::new(Mutex::new(memory))
}

/// Byte order of multi-byte accesses on the emulated machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Endianness {
    #[default]
    Big,
    Little,
}

/// One mapped span of emulated address space.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegionConfig {
    pub name: String,
    pub base: u32,
    pub size: u32,
}

impl RegionConfig {
    /// Primary RAM of the emulated console.
    pub const MEM1_BASE: u32 = 0x8000_0000;
    pub const MEM1_SIZE: u32 = 24 * 1024 * 1024;

    pub fn mem1() -> Self {
        Self {
            name: "mem1".to_string(),
            base: Self::MEM1_BASE,
            size: Self::MEM1_SIZE,
        }
    }

    /// First address past the region, widened so 0xFFFF_FFFF-ending regions
    /// do not overflow.
    pub fn end(&self) -> u64 {
        u64::from(self.base) + u64::from(self.size)
    }

    pub fn contains(&self, address: u32) -> bool {
        let address = u64::from(address);
        address >= u64::from(self.base) && address < self.end()
    }

    pub fn overlaps(&self, other: &Self) -> bool {
        u64::from(self.base) < other.end() && u64::from(other.base) < self.end()
    }
}

impl Default for RegionConfig {
    fn default() -> Self {
        Self::mem1()
    }
}

struct Region {
    base: u32,
    bytes: Vec<u8>,
}

/// Region-mapped byte store.
pub struct FlatMemory {
    regions: Vec<Region>,
    endianness: Endianness,
}

impl FlatMemory {
    pub fn new(regions: &[RegionConfig], endianness: Endianness) -> Self {
        let regions = regions
            .iter()
            .map(|r| Region {
                base: r.base,
                bytes: vec![0; r.size as usize],
            })
            .collect();
        Self {
            regions,
            endianness,
        }
    }

    /// A single zeroed MEM1 region, big-endian.
    pub fn mem1() -> Self {
        Self::new(&[RegionConfig::mem1()], Endianness::Big)
    }

    pub fn endianness(&self) -> Endianness {
        self.endianness
    }

    fn locate(&self, address: u32) -> Option<(usize, usize)> {
        self.regions.iter().enumerate().find_map(|(index, region)| {
            let offset = address.checked_sub(region.base)? as usize;
            (offset < region.bytes.len()).then_some((index, offset))
        })
    }

    fn read_array<const N: usize>(&self, address: u32) -> Option<[u8; N]> {
        let (index, offset) = self.locate(address)?;
        let bytes = self.regions[index].bytes.get(offset..offset + N)?;
        let mut raw = [0u8; N];
        raw.copy_from_slice(bytes);
        Some(raw)
    }

    fn write_array<const N: usize>(&mut self, address: u32, raw: [u8; N]) -> Option<()> {
        let (index, offset) = self.locate(address)?;
        let bytes = self.regions[index].bytes.get_mut(offset..offset + N)?;
        bytes.copy_from_slice(&raw);
        Some(())
    }
}

macro_rules! flat_access {
    ($read:ident, $write:ident, $ty:ty) => {
        fn $read(&self, address: u32) -> Option<$ty> {
            let raw = self.read_array(address)?;
            Some(match self.endianness {
                Endianness::Big => <$ty>::from_be_bytes(raw),
                Endianness::Little => <$ty>::from_le_bytes(raw),
            })
        }

        fn $write(&mut self, address: u32, value: $ty) -> Option<()> {
            let raw = match self.endianness {
                Endianness::Big => value.to_be_bytes(),
                Endianness::Little => value.to_le_bytes(),
            };
            self.write_array(address, raw)
        }
    };
}

impl EmulatedMemory for FlatMemory {
    flat_access!(try_read_u8, try_write_u8, u8);
    flat_access!(try_read_u16, try_write_u16, u16);
    flat_access!(try_read_u32, try_write_u32, u32);
    flat_access!(try_read_u64, try_write_u64, u64);

    fn host_slice(&self, address: u32) -> Option<&[u8]> {
        let (index, offset) = self.locate(address)?;
        Some(&self.regions[index].bytes[offset..])
    }

    fn host_slice_mut(&mut self, address: u32) -> Option<&mut [u8]> {
        let (index, offset) = self.locate(address)?;
        Some(&mut self.regions[index].bytes[offset..])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> FlatMemory {
        FlatMemory::new(
            &[
                RegionConfig {
                    name: "low".into(),
                    base: 0x1000,
                    size: 0x10,
                },
                RegionConfig {
                    name: "high".into(),
                    base: 0xFFFF_FFF0,
                    size: 0x10,
                },
            ],
            Endianness::Big,
        )
    }

    #[test]
    fn big_endian_layout() {
        let mut mem = small();
        mem.try_write_u32(0x1000, 0xDEAD_BEEF).unwrap();
        assert_eq!(mem.host_slice(0x1000).unwrap()[..4], [0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(mem.try_read_u16(0x1000), Some(0xDEAD));
        assert_eq!(mem.try_read_u8(0x1003), Some(0xEF));
    }

    #[test]
    fn little_endian_layout() {
        let mut mem = FlatMemory::new(&[RegionConfig::mem1()], Endianness::Little);
        mem.try_write_u16(0x8000_0000, 0x1234).unwrap();
        assert_eq!(mem.host_slice(0x8000_0000).unwrap()[..2], [0x34, 0x12]);
    }

    #[test]
    fn unmapped_and_straddling_accesses_fail() {
        let mut mem = small();
        assert_eq!(mem.try_read_u8(0x0FFF), None);
        assert_eq!(mem.try_read_u8(0x1010), None);
        assert_eq!(mem.try_read_u32(0x100E), None);
        assert_eq!(mem.try_write_u64(0x100C, 1), None);
        assert!(mem.host_slice(0x2000).is_none());
    }

    #[test]
    fn region_at_top_of_address_space() {
        let mut mem = small();
        mem.try_write_u64(0xFFFF_FFF8, u64::MAX).unwrap();
        assert_eq!(mem.try_read_u64(0xFFFF_FFF8), Some(u64::MAX));
        assert_eq!(mem.host_slice(0xFFFF_FFFF).unwrap().len(), 1);
    }

    #[test]
    fn host_slice_runs_to_end_of_region() {
        let mem = small();
        assert_eq!(mem.host_slice(0x1004).unwrap().len(), 12);
    }

    #[test]
    fn region_overlap() {
        let a = RegionConfig {
            name: "a".into(),
            base: 0,
            size: 0x100,
        };
        let b = RegionConfig {
            name: "b".into(),
            base: 0xFF,
            size: 1,
        };
        let c = RegionConfig {
            name: "c".into(),
            base: 0x100,
            size: 1,
        };
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
        assert_eq!(RegionConfig::mem1().end(), 0x8180_0000);
    }

    #[test]
    fn shared_memory_locks() {
        let shared = shared_memory(FlatMemory::mem1());
        shared.lock().try_write_u8(0x8000_0000, 7).unwrap();
        assert_eq!(shared.lock().try_read_u8(0x8000_0000), Some(7));
    }
}
