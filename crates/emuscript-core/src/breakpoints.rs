//! Per-session breakpoint registries.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Instruction addresses a session wants to be called back on.
///
/// Adding the same address twice needs two removals; scripts commonly
/// register overlapping hooks from independent helpers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstructionBreakpoints {
    counts: BTreeMap<u32, usize>,
}

impl InstructionBreakpoints {
    pub fn add(&mut self, address: u32) {
        *self.counts.entry(address).or_insert(0) += 1;
    }

    /// Returns false when the address was not registered.
    pub fn remove(&mut self, address: u32) -> bool {
        match self.counts.get_mut(&address) {
            Some(count) if *count > 1 => {
                *count -= 1;
                true
            }
            Some(_) => {
                self.counts.remove(&address);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, address: u32) -> bool {
        self.counts.contains_key(&address)
    }

    pub fn addresses(&self) -> impl Iterator<Item = u32> + '_ {
        self.counts.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn clear(&mut self) {
        self.counts.clear();
    }
}

/// Kind of memory access a watch fires on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryAccess {
    Read,
    Write,
    ReadWrite,
}

impl MemoryAccess {
    pub fn covers(self, access: Self) -> bool {
        self == Self::ReadWrite || access == Self::ReadWrite || self == access
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "read" | "r" => Some(Self::Read),
            "write" | "w" => Some(Self::Write),
            "readwrite" | "read_write" | "rw" | "any" => Some(Self::ReadWrite),
            _ => None,
        }
    }
}

impl fmt::Display for MemoryAccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::ReadWrite => "read_write",
        })
    }
}

/// A watched span of emulated memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemoryWatch {
    pub start: u32,
    pub len: u32,
    pub access: MemoryAccess,
}

impl MemoryWatch {
    pub fn new(start: u32, len: u32, access: MemoryAccess) -> Self {
        Self {
            start,
            len: len.max(1),
            access,
        }
    }

    /// Whether an access of `width` bytes at `address` touches this watch.
    pub fn matches(&self, address: u32, width: u32, access: MemoryAccess) -> bool {
        if !self.access.covers(access) {
            return false;
        }
        let start = u64::from(self.start);
        let end = start + u64::from(self.len);
        let hit_start = u64::from(address);
        let hit_end = hit_start + u64::from(width.max(1));
        hit_start < end && start < hit_end
    }
}

/// Memory watches registered by one session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryBreakpoints {
    watches: Vec<MemoryWatch>,
}

impl MemoryBreakpoints {
    pub fn add(&mut self, watch: MemoryWatch) {
        self.watches.push(watch);
    }

    /// Remove one watch equal to `watch`.
    pub fn remove(&mut self, watch: &MemoryWatch) -> bool {
        match self.watches.iter().position(|w| w == watch) {
            Some(index) => {
                self.watches.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn matches(&self, address: u32, width: u32, access: MemoryAccess) -> bool {
        self.watches
            .iter()
            .any(|w| w.matches(address, width, access))
    }

    pub fn watches(&self) -> &[MemoryWatch] {
        &self.watches
    }

    pub fn len(&self) -> usize {
        self.watches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.watches.is_empty()
    }

    pub fn clear(&mut self) {
        self.watches.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instruction_breakpoints_are_refcounted() {
        let mut bps = InstructionBreakpoints::default();
        bps.add(0x8000_1000);
        bps.add(0x8000_1000);
        bps.add(0x8000_0000);
        assert_eq!(bps.len(), 2);
        assert_eq!(bps.addresses().collect::<Vec<_>>(), vec![0x8000_0000, 0x8000_1000]);

        assert!(bps.remove(0x8000_1000));
        assert!(bps.contains(0x8000_1000));
        assert!(bps.remove(0x8000_1000));
        assert!(!bps.contains(0x8000_1000));
        assert!(!bps.remove(0x8000_1000));
    }

    #[test]
    fn access_kinds() {
        assert!(MemoryAccess::ReadWrite.covers(MemoryAccess::Read));
        assert!(MemoryAccess::Write.covers(MemoryAccess::Write));
        assert!(!MemoryAccess::Write.covers(MemoryAccess::Read));
        assert_eq!(MemoryAccess::parse("RW"), Some(MemoryAccess::ReadWrite));
        assert_eq!(MemoryAccess::parse("exec"), None);
    }

    #[test]
    fn watch_overlap() {
        let watch = MemoryWatch::new(0x100, 4, MemoryAccess::Write);
        assert!(watch.matches(0x100, 1, MemoryAccess::Write));
        assert!(watch.matches(0x0FE, 4, MemoryAccess::Write));
        assert!(watch.matches(0x103, 8, MemoryAccess::Write));
        assert!(!watch.matches(0x104, 1, MemoryAccess::Write));
        assert!(!watch.matches(0x0FC, 4, MemoryAccess::Write));
        assert!(!watch.matches(0x100, 4, MemoryAccess::Read));
    }

    #[test]
    fn watch_at_top_of_address_space() {
        let watch = MemoryWatch::new(u32::MAX, 16, MemoryAccess::ReadWrite);
        assert!(watch.matches(u32::MAX, 1, MemoryAccess::Read));
    }

    #[test]
    fn memory_breakpoints_registry() {
        let mut bps = MemoryBreakpoints::default();
        let watch = MemoryWatch::new(0x10, 0, MemoryAccess::Read);
        assert_eq!(watch.len, 1);
        bps.add(watch);
        assert!(bps.matches(0x10, 4, MemoryAccess::Read));
        assert!(!bps.matches(0x11, 4, MemoryAccess::Read));
        assert!(bps.remove(&watch));
        assert!(bps.is_empty());
    }
}
