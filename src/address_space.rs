//! Guest address space
//!
//! Physical memory, the software MMU and the pending-write buffer viewed
//! together. Everything that needs a coherent view of guest bytes (syscall
//! guards, image loading, snapshots) goes through here.

use std::collections::BTreeSet;

use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::memory::{line_of, PendingWrites, PhysicalMemory, PAGE_SHIFT, PAGE_SIZE};
use crate::mmu::{HostMapping, Mmu, PageAllocator};

/// Physical console text window
pub const CONSOLE_BASE: u64 = 0xb8000;
pub const CONSOLE_SIZE: u64 = 80 * 25 * 2;

/// A snapshotted guest range around one syscall argument
pub struct GuardWindow {
    /// Line-aligned guest virtual start
    pub vaddr: u64,
    /// Physically contiguous pieces in guest order
    chunks: Vec<(u64, u64)>,
    before: Vec<u8>,
    /// Pending bytes applied when the guard was opened
    pub drained: usize,
}

impl GuardWindow {
    pub fn len(&self) -> usize {
        self.before.len()
    }

    pub fn chunks(&self) -> &[(u64, u64)] {
        &self.chunks
    }
}

pub struct AddressSpace {
    pub memory: PhysicalMemory,
    pub mmu: Mmu,
    pub pending: PendingWrites,
}

impl AddressSpace {
    pub fn new(config: &BridgeConfig) -> Result<Self> {
        if config.host_mapping && !config.virtual_memory {
            return Err(BridgeError::InvalidConfig("host mapping requires virtual memory".into()));
        }
        if config.virtual_memory && !config.host_mapping {
            return Err(BridgeError::InvalidConfig("virtual memory requires host mapping".into()));
        }
        let mut memory = if config.host_mapping {
            PhysicalMemory::new_shared(config.ram_size)?
        } else {
            PhysicalMemory::new(config.ram_size)?
        };
        let mut allocator = PageAllocator::new(config.ram_size / PAGE_SIZE, config.page_seed);
        allocator.reserve(0);
        let mut console_page = CONSOLE_BASE >> PAGE_SHIFT;
        while console_page << PAGE_SHIFT < CONSOLE_BASE + CONSOLE_SIZE {
            allocator.reserve(console_page);
            console_page += 1;
        }

        let mmu = if config.virtual_memory {
            let host = match (config.host_mapping, memory.shared_fd()) {
                (true, Some(fd)) => Some(HostMapping::reserve(config.virtual_address_bits, fd)?),
                _ => None,
            };
            Mmu::enabled(allocator, &mut memory, host)?
        } else {
            Mmu::disabled(allocator)
        };

        Ok(AddressSpace {
            memory,
            mmu,
            pending: PendingWrites::new(config.pending_write_capacity),
        })
    }

    pub fn translate(&mut self, vaddr: u64) -> Result<u64> {
        self.mmu.translate(&mut self.memory, vaddr)
    }

    pub fn translate_range(&mut self, vaddr: u64, len: u64) -> Result<Vec<(u64, u64)>> {
        self.mmu.translate_range(&mut self.memory, vaddr, len)
    }

    /// Host pointer value for a guest pointer argument
    pub fn host_address(&mut self, vaddr: u64) -> Result<u64> {
        self.mmu.host_address(&mut self.memory, vaddr)
    }

    /// Copy bytes into guest memory through translation (demand-allocates)
    pub fn write_virtual(&mut self, vaddr: u64, data: &[u8]) -> Result<()> {
        let mut done = 0usize;
        for (paddr, len) in self.translate_range(vaddr, data.len() as u64)? {
            self.memory.load_binary(&data[done..done + len as usize], paddr)?;
            done += len as usize;
        }
        Ok(())
    }

    /// Coherent read of guest bytes: pending values win over memory
    pub fn read_virtual(&mut self, vaddr: u64, len: u64) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(len as usize);
        for (paddr, n) in self.translate_range(vaddr, len)? {
            for addr in paddr..paddr + n {
                out.push(self.pending.read_through(&self.memory, addr)?);
            }
        }
        Ok(out)
    }

    pub fn write_virtual_u64(&mut self, vaddr: u64, value: u64) -> Result<()> {
        self.write_virtual(vaddr, &value.to_le_bytes())
    }

    /// Snapshot `len` bytes from the line containing `vaddr`, then apply any
    /// pending writes inside it so the host sees the newest values.
    pub fn open_guard(&mut self, vaddr: u64, len: u64) -> Result<GuardWindow> {
        let base = line_of(vaddr);
        // identity mode: the window stops at the end of memory
        let len = if self.mmu.is_enabled() {
            len
        } else {
            len.min(self.memory.size().saturating_sub(base))
        };
        let chunks = self.translate_range(base, len)?;
        let mut before = Vec::with_capacity(len as usize);
        for &(paddr, n) in &chunks {
            before.extend_from_slice(self.memory.bytes(paddr, n)?);
        }
        let mut drained = 0;
        for &(paddr, n) in &chunks {
            drained += self.pending.drain_range(&mut self.memory, paddr, n)?;
        }
        Ok(GuardWindow { vaddr: base, chunks, before, drained })
    }

    /// Physical lines whose bytes differ from the guard's snapshot
    pub fn changed_lines(&self, guard: &GuardWindow) -> Result<BTreeSet<u64>> {
        let mut lines = BTreeSet::new();
        let mut offset = 0usize;
        for &(paddr, n) in &guard.chunks {
            let now = self.memory.bytes(paddr, n)?;
            let then = &guard.before[offset..offset + n as usize];
            for (i, (a, b)) in now.iter().zip(then).enumerate() {
                if a != b {
                    lines.insert(line_of(paddr + i as u64));
                }
            }
            offset += n as usize;
        }
        Ok(lines)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(virtual_memory: bool) -> BridgeConfig {
        BridgeConfig {
            ram_size: 256 * PAGE_SIZE,
            virtual_memory,
            host_mapping: virtual_memory,
            virtual_address_bits: 32,
            page_seed: Some(11),
            ..BridgeConfig::default()
        }
    }

    #[test]
    fn test_reserved_frames_stay_out_of_use() {
        let space = AddressSpace::new(&config(true)).unwrap();
        let alloc = space.mmu.allocator();
        assert!(alloc.is_allocated(0));
        assert!(alloc.is_allocated(CONSOLE_BASE >> PAGE_SHIFT));
        assert!(alloc.is_allocated((CONSOLE_BASE + CONSOLE_SIZE - 1) >> PAGE_SHIFT));
    }

    #[test]
    fn test_virtual_round_trip_across_pages() {
        let mut space = AddressSpace::new(&config(true)).unwrap();
        let data: Vec<u8> = (0..5000u32).map(|i| i as u8).collect();
        space.write_virtual(0x10_0ff0, &data).unwrap();
        assert_eq!(space.read_virtual(0x10_0ff0, 5000).unwrap(), data);
    }

    #[test]
    fn test_guard_drains_pending_into_memory() {
        let mut space = AddressSpace::new(&config(true)).unwrap();
        let paddr = space.translate(0x2010).unwrap();
        space.memory.write8(paddr, 0x11).unwrap();
        space.pending.record(&mut space.memory, paddr, 0x22, 1).unwrap();

        assert_eq!(space.read_virtual(0x2010, 1).unwrap(), vec![0x22]);
        let guard = space.open_guard(0x2010, 128).unwrap();
        assert_eq!(guard.vaddr, 0x2000);
        assert_eq!(guard.drained, 1);
        assert_eq!(space.memory.read8(paddr).unwrap(), 0x22);
        assert!(space.pending.is_empty());
    }

    #[test]
    fn test_changed_lines_reports_each_dirty_block_once() {
        let mut space = AddressSpace::new(&config(false)).unwrap();
        let guard = space.open_guard(0x4000, 1024).unwrap();
        space.memory.write8(0x4001, 1).unwrap();
        space.memory.write8(0x403f, 1).unwrap();
        space.memory.write8(0x4100, 1).unwrap();
        // outside the window
        space.memory.write8(0x4400, 1).unwrap();
        let lines: Vec<u64> = space.changed_lines(&guard).unwrap().into_iter().collect();
        assert_eq!(lines, vec![0x4000, 0x4100]);
    }

    #[test]
    fn test_host_mapping_needs_paging() {
        let cfg = BridgeConfig { host_mapping: true, ..config(false) };
        assert!(matches!(AddressSpace::new(&cfg), Err(BridgeError::InvalidConfig(_))));
    }

    #[test]
    fn test_paging_needs_host_mapping() {
        let cfg = BridgeConfig { host_mapping: false, ..config(true) };
        assert!(matches!(AddressSpace::new(&cfg), Err(BridgeError::InvalidConfig(_))));
    }

    #[test]
    fn test_host_pointer_spans_pages() {
        let mut space = AddressSpace::new(&config(true)).unwrap();
        let data: Vec<u8> = (0..6000u32).map(|i| (i % 251) as u8 + 1).collect();
        space.write_virtual(0x4000_0800, &data).unwrap();
        let host = space.host_address(0x4000_0800).unwrap();
        // SAFETY: every page of the range was bound by write_virtual
        let seen = unsafe { std::slice::from_raw_parts(host as *const u8, data.len()) };
        assert_eq!(seen, &data[..]);
    }
}
