//! Typed, bounds-checked access to emulated memory.
//!
//! Each operation turns one dynamically-typed request into fixed-width
//! accesses on the [`EmulatedMemory`] collaborator. Byte order belongs to the
//! collaborator; the bridge only reshapes width and signedness.

use crate::error::BridgeError;
use crate::memory::EmulatedMemory;
use crate::value::{ByteWrapper, NumericKind, TaggedValue};
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Upper bounds on bulk operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeLimits {
    /// Longest null-terminated string scan, in bytes.
    pub max_string_scan: usize,
    /// Largest `read_*_bytes` / fixed-length string request.
    pub max_bulk_read: usize,
}

impl Default for BridgeLimits {
    fn default() -> Self {
        Self {
            max_string_scan: 65_536,
            max_bulk_read: 1 << 20,
        }
    }
}

/// A borrowed view of emulated memory for the duration of one API call.
pub struct MemoryBridge<'m> {
    memory: &'m mut dyn EmulatedMemory,
    limits: BridgeLimits,
}

fn fault(operation: &'static str, address: u32) -> BridgeError {
    BridgeError::MemoryFault { operation, address }
}

const fn read_operation(kind: NumericKind) -> &'static str {
    match kind {
        NumericKind::U8 => "read_u8",
        NumericKind::U16 => "read_u16",
        NumericKind::U32 => "read_u32",
        NumericKind::U64 => "read_u64",
        NumericKind::S8 => "read_s8",
        NumericKind::S16 => "read_s16",
        NumericKind::S32 => "read_s32",
        NumericKind::S64 => "read_s64",
        NumericKind::Float => "read_float",
        NumericKind::Double => "read_double",
    }
}

const fn write_operation(kind: NumericKind) -> &'static str {
    match kind {
        NumericKind::U8 => "write_u8",
        NumericKind::U16 => "write_u16",
        NumericKind::U32 => "write_u32",
        NumericKind::U64 => "write_u64",
        NumericKind::S8 => "write_s8",
        NumericKind::S16 => "write_s16",
        NumericKind::S32 => "write_s32",
        NumericKind::S64 => "write_s64",
        NumericKind::Float => "write_float",
        NumericKind::Double => "write_double",
    }
}

impl<'m> MemoryBridge<'m> {
    pub fn new(memory: &'m mut dyn EmulatedMemory, limits: BridgeLimits) -> Self {
        Self { memory, limits }
    }

    pub fn limits(&self) -> BridgeLimits {
        self.limits
    }

    /// Read one value of `kind`.
    pub fn read(&self, kind: NumericKind, address: u32) -> Result<TaggedValue, BridgeError> {
        let bits = self
            .read_bits(kind.width(), address)
            .ok_or_else(|| fault(read_operation(kind), address))?;
        trace!(address, %kind, bits, "memory read");
        Ok(TaggedValue::from_bits(kind, bits))
    }

    /// Write `value` as `kind`.
    ///
    /// Any value of the same width is accepted, so a `u32` can be written as
    /// `float` bits.
    pub fn write(
        &mut self,
        kind: NumericKind,
        address: u32,
        value: TaggedValue,
    ) -> Result<(), BridgeError> {
        if value.width() != kind.width() {
            return Err(BridgeError::WidthMismatch {
                expected: kind.width(),
                actual: value.width(),
            });
        }
        trace!(address, %kind, bits = value.bits(), "memory write");
        self.write_bits(kind.width(), address, value.bits())
            .ok_or_else(|| fault(write_operation(kind), address))
    }

    /// Read `size` bytes (1, 2, 4 or 8) into a [`ByteWrapper`].
    pub fn read_wrapper(&self, address: u32, size: i64) -> Result<ByteWrapper, BridgeError> {
        let kind = usize::try_from(size)
            .ok()
            .and_then(NumericKind::unsigned_of_width)
            .ok_or(BridgeError::InvalidWidth(size))?;
        let bits = self
            .read_bits(kind.width(), address)
            .ok_or_else(|| fault("read_wrapper", address))?;
        ByteWrapper::with_width(bits, kind.width())
    }

    /// Write the low `count` bytes of `wrapper`; `count` defaults to the
    /// populated width and may not exceed it.
    pub fn write_wrapper(
        &mut self,
        address: u32,
        wrapper: &ByteWrapper,
        count: Option<i64>,
    ) -> Result<(), BridgeError> {
        let count = count.unwrap_or(wrapper.required_byte_count() as i64);
        let width = usize::try_from(count)
            .ok()
            .filter(|w| NumericKind::unsigned_of_width(*w).is_some())
            .ok_or(BridgeError::InvalidWidth(count))?;
        let value = wrapper.truncated(width)?;
        self.write_bits(width, address, value.bits())
            .ok_or_else(|| fault("write_wrapper", address))
    }

    /// Read `count` consecutive bytes, sign-extended when `signed`.
    ///
    /// The host view is resolved once; an unmapped base or a view shorter
    /// than `count` fails before any output is produced.
    pub fn read_bytes(
        &self,
        address: u32,
        count: usize,
        signed: bool,
    ) -> Result<Vec<i64>, BridgeError> {
        let operation = if signed {
            "read_signed_bytes"
        } else {
            "read_unsigned_bytes"
        };
        let bytes = self.bulk_view(operation, address, count)?;
        Ok(bytes
            .iter()
            .map(|&b| {
                if signed {
                    i64::from(b as i8)
                } else {
                    i64::from(b)
                }
            })
            .collect())
    }

    /// Write single bytes at absolute addresses.
    ///
    /// Every value is checked against `[-128, 255]` and every address must be
    /// mapped before the first write. Entries are then applied in order, so a
    /// repeated address keeps the last value.
    pub fn write_bytes(&mut self, entries: &[(u32, i64)]) -> Result<(), BridgeError> {
        if let Some(&(address, value)) = entries
            .iter()
            .find(|(_, value)| !(-128..=255).contains(value))
        {
            return Err(BridgeError::InvalidByteRange { address, value });
        }
        if let Some(&(address, _)) = entries
            .iter()
            .find(|(address, _)| self.memory.try_read_u8(*address).is_none())
        {
            return Err(fault("write_bytes", address));
        }
        for &(address, value) in entries {
            // Negative entries are stored as their two's-complement byte.
            let byte = if value < 0 {
                (value as i8) as u8
            } else {
                value as u8
            };
            self.memory
                .try_write_u8(address, byte)
                .ok_or_else(|| fault("write_bytes", address))?;
        }
        trace!(count = entries.len(), "memory write_bytes");
        Ok(())
    }

    /// Exactly `length` bytes starting at `address`.
    pub fn read_fixed_length_string(
        &self,
        address: u32,
        length: usize,
    ) -> Result<Vec<u8>, BridgeError> {
        Ok(self
            .bulk_view("read_fixed_length_string", address, length)?
            .to_vec())
    }

    /// Bytes up to (not including) the first zero byte.
    pub fn read_null_terminated_string(&self, address: u32) -> Result<Vec<u8>, BridgeError> {
        let view = self
            .memory
            .host_slice(address)
            .ok_or_else(|| fault("read_null_terminated_string", address))?;
        let limit = self.limits.max_string_scan.min(view.len());
        let length = view[..limit]
            .iter()
            .position(|&b| b == 0)
            .ok_or(BridgeError::UnterminatedString { address, limit })?;
        self.read_fixed_length_string(address, length)
    }

    /// Write `text` up to its first zero byte, followed by a single zero byte.
    pub fn write_string(&mut self, address: u32, text: &[u8]) -> Result<(), BridgeError> {
        let text = &text[..text.iter().position(|&b| b == 0).unwrap_or(text.len())];
        let view = self
            .memory
            .host_slice_mut(address)
            .ok_or_else(|| fault("write_string", address))?;
        let needed = text.len() + 1;
        if view.len() < needed {
            return Err(fault("write_string", address.wrapping_add(view.len() as u32)));
        }
        view[..text.len()].copy_from_slice(text);
        view[text.len()] = 0;
        trace!(address, len = text.len(), "memory write_string");
        Ok(())
    }

    fn bulk_view(
        &self,
        operation: &'static str,
        address: u32,
        count: usize,
    ) -> Result<&[u8], BridgeError> {
        if count > self.limits.max_bulk_read {
            return Err(BridgeError::BulkLimit {
                count,
                limit: self.limits.max_bulk_read,
            });
        }
        let view = self
            .memory
            .host_slice(address)
            .ok_or_else(|| fault(operation, address))?;
        view.get(..count)
            .ok_or_else(|| fault(operation, address.wrapping_add(view.len() as u32)))
    }

    fn read_bits(&self, width: usize, address: u32) -> Option<u64> {
        match width {
            1 => self.memory.try_read_u8(address).map(u64::from),
            2 => self.memory.try_read_u16(address).map(u64::from),
            4 => self.memory.try_read_u32(address).map(u64::from),
            8 => self.memory.try_read_u64(address),
            _ => None,
        }
    }

    fn write_bits(&mut self, width: usize, address: u32, bits: u64) -> Option<()> {
        match width {
            1 => self.memory.try_write_u8(address, bits as u8),
            2 => self.memory.try_write_u16(address, bits as u16),
            4 => self.memory.try_write_u32(address, bits as u32),
            8 => self.memory.try_write_u64(address, bits),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{Endianness, FlatMemory, RegionConfig};
    use proptest::prelude::*;

    const BASE: u32 = RegionConfig::MEM1_BASE;

    fn small_memory() -> FlatMemory {
        FlatMemory::new(
            &[RegionConfig {
                name: "test".into(),
                base: BASE,
                size: 0x100,
            }],
            Endianness::Big,
        )
    }

    fn bridge(memory: &mut FlatMemory) -> MemoryBridge<'_> {
        MemoryBridge::new(memory, BridgeLimits::default())
    }

    #[test]
    fn write_then_read_u32() {
        let mut mem = small_memory();
        let mut b = bridge(&mut mem);
        b.write(NumericKind::U32, BASE + 0x10, TaggedValue::new(0xDEAD_BEEF_u32))
            .unwrap();
        let value = b.read(NumericKind::U32, BASE + 0x10).unwrap();
        assert_eq!(value.get::<u32>().unwrap(), 0xDEAD_BEEF);
    }

    #[test]
    fn read_wrapper_matches_collaborator_u16() {
        let mut mem = small_memory();
        mem.try_write_u32(BASE + 0x10, 0xDEAD_BEEF).unwrap();
        let expected = mem.try_read_u16(BASE + 0x10).unwrap();
        let b = bridge(&mut mem);
        let wrapper = b.read_wrapper(BASE + 0x10, 2).unwrap();
        assert_eq!(wrapper.required_byte_count(), 2);
        assert_eq!(wrapper.bits(), u64::from(expected));
    }

    #[test]
    fn read_wrapper_rejects_odd_sizes() {
        let mut mem = small_memory();
        let b = bridge(&mut mem);
        assert_eq!(
            b.read_wrapper(BASE, 3).unwrap_err(),
            BridgeError::InvalidWidth(3)
        );
        assert_eq!(
            b.read_wrapper(BASE, -1).unwrap_err(),
            BridgeError::InvalidWidth(-1)
        );
    }

    #[test]
    fn write_wrapper_count_defaults_and_limits() {
        let mut mem = small_memory();
        let mut b = bridge(&mut mem);
        let wrapper = ByteWrapper::from_u16(0xABCD);
        b.write_wrapper(BASE, &wrapper, None).unwrap();
        assert_eq!(
            b.read(NumericKind::U16, BASE).unwrap().get::<u16>().unwrap(),
            0xABCD
        );
        b.write_wrapper(BASE + 8, &wrapper, Some(1)).unwrap();
        assert_eq!(
            b.read(NumericKind::U8, BASE + 8).unwrap().get::<u8>().unwrap(),
            0xCD
        );
        assert!(matches!(
            b.write_wrapper(BASE, &wrapper, Some(4)),
            Err(BridgeError::WidthMismatch { .. })
        ));
    }

    #[test]
    fn write_accepts_same_width_only() {
        let mut mem = small_memory();
        let mut b = bridge(&mut mem);
        b.write(NumericKind::Float, BASE, TaggedValue::new(1.0_f32.to_bits()))
            .unwrap();
        assert_eq!(
            b.read(NumericKind::Float, BASE).unwrap().get::<f32>().unwrap(),
            1.0
        );
        assert_eq!(
            b.write(NumericKind::U16, BASE, TaggedValue::new(1_u32)),
            Err(BridgeError::WidthMismatch {
                expected: 2,
                actual: 4
            })
        );
    }

    #[test]
    fn unmapped_access_is_memory_fault() {
        let mut mem = small_memory();
        let mut b = bridge(&mut mem);
        assert_eq!(
            b.read(NumericKind::U32, 0x10).unwrap_err(),
            BridgeError::MemoryFault {
                operation: "read_u32",
                address: 0x10
            }
        );
        assert_eq!(
            b.write(NumericKind::S8, 0x10, TaggedValue::new(1_i8)),
            Err(BridgeError::MemoryFault {
                operation: "write_s8",
                address: 0x10
            })
        );
    }

    #[test]
    fn read_bytes_signed_and_unsigned() {
        let mut mem = small_memory();
        let mut b = bridge(&mut mem);
        b.write_bytes(&[(BASE, 0xFF), (BASE + 1, 0x7F)]).unwrap();
        assert_eq!(b.read_bytes(BASE, 2, false).unwrap(), vec![255, 127]);
        assert_eq!(b.read_bytes(BASE, 2, true).unwrap(), vec![-1, 127]);
        assert!(b.read_bytes(BASE, 0, false).unwrap().is_empty());
    }

    #[test]
    fn read_bytes_past_view_fails_atomically() {
        let mut mem = small_memory();
        let b = bridge(&mut mem);
        assert!(matches!(
            b.read_bytes(BASE + 0xF0, 0x20, false),
            Err(BridgeError::MemoryFault {
                operation: "read_unsigned_bytes",
                address
            }) if address == BASE + 0x100
        ));
        assert!(b.read_bytes(0, 1, true).is_err());
    }

    #[test]
    fn read_bytes_respects_bulk_limit() {
        let mut mem = small_memory();
        let b = MemoryBridge::new(
            &mut mem,
            BridgeLimits {
                max_bulk_read: 4,
                ..BridgeLimits::default()
            },
        );
        assert_eq!(
            b.read_bytes(BASE, 5, false).unwrap_err(),
            BridgeError::BulkLimit { count: 5, limit: 4 }
        );
    }

    #[test]
    fn write_bytes_duplicates_last_wins() {
        let mut mem = small_memory();
        let mut b = bridge(&mut mem);
        b.write_bytes(&[(BASE, 1), (BASE, 2), (BASE, -3)]).unwrap();
        assert_eq!(b.read_bytes(BASE, 1, true).unwrap(), vec![-3]);
    }

    #[test]
    fn write_bytes_out_of_range_writes_nothing() {
        let mut mem = small_memory();
        let mut b = bridge(&mut mem);
        let err = b
            .write_bytes(&[(BASE, 9), (BASE + 1, 256), (BASE + 2, 9)])
            .unwrap_err();
        assert_eq!(
            err,
            BridgeError::InvalidByteRange {
                address: BASE + 1,
                value: 256
            }
        );
        assert_eq!(b.read_bytes(BASE, 3, false).unwrap(), vec![0, 0, 0]);
        assert!(b.write_bytes(&[(BASE, -129)]).is_err());
    }

    #[test]
    fn write_bytes_unmapped_entry_writes_nothing() {
        let mut mem = small_memory();
        let mut b = bridge(&mut mem);
        let err = b
            .write_bytes(&[(BASE, 7), (0x10, 1), (BASE + 1, 8)])
            .unwrap_err();
        assert_eq!(err, fault("write_bytes", 0x10));
        assert_eq!(b.read_bytes(BASE, 2, false).unwrap(), vec![0, 0]);

        // Just past the end of the region.
        assert!(b.write_bytes(&[(BASE + 0xFF, 1), (BASE + 0x100, 1)]).is_err());
        assert_eq!(b.read_bytes(BASE + 0xFF, 1, false).unwrap(), vec![0]);
    }

    #[test]
    fn write_string_stops_at_embedded_nul() {
        let mut mem = small_memory();
        let mut b = bridge(&mut mem);
        b.write_bytes(&[(BASE + 0x13, 0x55)]).unwrap();
        b.write_string(BASE + 0x10, b"ab\0cd").unwrap();
        assert_eq!(b.read_null_terminated_string(BASE + 0x10).unwrap(), b"ab");
        assert_eq!(
            b.read_bytes(BASE + 0x10, 4, false).unwrap(),
            vec![0x61, 0x62, 0, 0x55]
        );
    }

    #[test]
    fn string_round_trip() {
        let mut mem = small_memory();
        let mut b = bridge(&mut mem);
        b.write_string(BASE + 0x20, b"hi").unwrap();
        assert_eq!(b.read_null_terminated_string(BASE + 0x20).unwrap(), b"hi");
        assert_eq!(
            b.read_fixed_length_string(BASE + 0x20, 3).unwrap(),
            b"hi\0"
        );
    }

    #[test]
    fn write_string_that_does_not_fit_leaves_memory_alone() {
        let mut mem = small_memory();
        let mut b = bridge(&mut mem);
        assert!(b.write_string(BASE + 0xFE, b"ab").is_err());
        assert_eq!(b.read_bytes(BASE + 0xFE, 2, false).unwrap(), vec![0, 0]);
        b.write_string(BASE + 0xFD, b"ab").unwrap();
    }

    #[test]
    fn null_terminated_scan_is_bounded() {
        let mut mem = small_memory();
        mem.host_slice_mut(BASE).unwrap().fill(b'a');
        let b = bridge(&mut mem);
        assert_eq!(
            b.read_null_terminated_string(BASE + 0x80).unwrap_err(),
            BridgeError::UnterminatedString {
                address: BASE + 0x80,
                limit: 0x80
            }
        );

        let mut mem = small_memory();
        mem.host_slice_mut(BASE).unwrap()[..0x40].fill(b'a');
        let b = MemoryBridge::new(
            &mut mem,
            BridgeLimits {
                max_string_scan: 16,
                ..BridgeLimits::default()
            },
        );
        assert!(matches!(
            b.read_null_terminated_string(BASE),
            Err(BridgeError::UnterminatedString { limit: 16, .. })
        ));
    }

    fn arb_kind() -> impl Strategy<Value = NumericKind> {
        prop::sample::select(NumericKind::ALL.to_vec())
    }

    proptest! {
        #[test]
        fn write_read_symmetry(kind in arb_kind(), bits in any::<u64>(), offset in 0u32..0xF8) {
            let mut mem = small_memory();
            let mut b = bridge(&mut mem);
            let value = TaggedValue::from_bits(kind, bits);
            b.write(kind, BASE + offset, value).unwrap();
            prop_assert_eq!(b.read(kind, BASE + offset).unwrap(), value);
        }

        #[test]
        fn unmapped_reads_fault(kind in arb_kind(), address in 0u32..BASE) {
            let mut mem = small_memory();
            let b = bridge(&mut mem);
            prop_assert!(b.read(kind, address).unwrap_err().is_memory_fault());
        }
    }
}
