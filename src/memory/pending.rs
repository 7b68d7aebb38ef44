//! Pending-write buffer
//!
//! Bytes the pipeline has logically written but whose write has not yet
//! landed in physical memory. For any byte present here the buffer holds the
//! newer value; for any byte absent, physical memory is authoritative.

use std::collections::BTreeMap;

use super::PhysicalMemory;
use crate::error::Result;

/// Reference bound on buffered bytes before forced eviction
pub const DEFAULT_CAPACITY: usize = 1_000_000;

pub struct PendingWrites {
    entries: BTreeMap<u64, u8>,
    capacity: usize,
}

impl PendingWrites {
    pub fn new(capacity: usize) -> Self {
        PendingWrites { entries: BTreeMap::new(), capacity: capacity.max(1) }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn get(&self, addr: u64) -> Option<u8> {
        self.entries.get(&addr).copied()
    }

    /// Buffer `size` bytes of `value` (little endian) at `addr`; the most
    /// recent write to a byte wins.
    pub fn record(&mut self, mem: &mut PhysicalMemory, addr: u64, value: u64, size: usize) -> Result<()> {
        let bytes = value.to_le_bytes();
        self.record_bytes(mem, addr, &bytes[..size.min(8)])
    }

    pub fn record_bytes(&mut self, mem: &mut PhysicalMemory, addr: u64, bytes: &[u8]) -> Result<()> {
        mem.check_range(addr, bytes.len() as u64)?;
        if self.entries.len() > self.capacity {
            self.evict(mem)?;
        }
        for (i, &b) in bytes.iter().enumerate() {
            self.entries.insert(addr + i as u64, b);
        }
        Ok(())
    }

    /// Flush the lowest-addressed tenth of the entries into memory
    fn evict(&mut self, mem: &mut PhysicalMemory) -> Result<()> {
        let count = (self.capacity / 10).max(1);
        log::debug!("pending-write buffer over {} entries, flushing {}", self.capacity, count);
        for _ in 0..count {
            match self.entries.pop_first() {
                Some((addr, value)) => mem.write8(addr, value)?,
                None => break,
            }
        }
        Ok(())
    }

    /// Apply and discard every entry in `[addr, addr+len)`. Returns how many bytes were applied.
    pub fn drain_range(&mut self, mem: &mut PhysicalMemory, addr: u64, len: u64) -> Result<usize> {
        let keys: Vec<u64> = self.entries.range(addr..addr.saturating_add(len)).map(|(&k, _)| k).collect();
        for &k in &keys {
            if let Some(value) = self.entries.remove(&k) {
                mem.write8(k, value)?;
            }
        }
        Ok(keys.len())
    }

    /// The write covering `[addr, addr+len)` has landed: forget it without touching memory
    pub fn commit(&mut self, addr: u64, len: u64) {
        let end = addr.saturating_add(len);
        let keys: Vec<u64> = self.entries.range(addr..end).map(|(&k, _)| k).collect();
        for k in keys {
            self.entries.remove(&k);
        }
    }

    /// Coherent byte read: buffered value if any, memory otherwise
    pub fn read_through(&self, mem: &PhysicalMemory, addr: u64) -> Result<u8> {
        match self.get(addr) {
            Some(value) => Ok(value),
            None => mem.read8(addr),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, u8)> + '_ {
        self.entries.iter().map(|(&k, &v)| (k, v))
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl Default for PendingWrites {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
