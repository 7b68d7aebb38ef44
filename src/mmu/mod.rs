//! Software MMU
//!
//! Walks a 4-level page table stored in physical memory, demand-allocating
//! directory and leaf frames on first reference. Entries, once valid, never
//! change: frames are never reclaimed.

pub mod allocator;
pub mod host_map;

use crate::error::{BridgeError, Result};
use crate::memory::{PhysicalMemory, PAGE_SHIFT, PAGE_SIZE};
pub use allocator::PageAllocator;
pub use host_map::HostMapping;

pub const LEVELS: u32 = 4;
const INDEX_BITS: u32 = 9;
const INDEX_MASK: u64 = (1 << INDEX_BITS) - 1;
const PAGE_OFFSET_MASK: u64 = PAGE_SIZE - 1;
const PPN_SHIFT: u32 = 10;
const TAG_MASK: u64 = 0b11;
/// Bits a four-level walk resolves
pub const VIRTUAL_BITS: u32 = PAGE_SHIFT + INDEX_BITS * LEVELS;

/// Validity tag of a page-table entry (bits [0..2))
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Invalid,
    Directory,
    Leaf,
}

impl EntryKind {
    const DIRECTORY: u64 = 0b01;
    const LEAF: u64 = 0b11;

    fn tag(self) -> u64 {
        match self {
            EntryKind::Invalid => 0,
            EntryKind::Directory => Self::DIRECTORY,
            EntryKind::Leaf => Self::LEAF,
        }
    }
}

/// One 8-byte page-table entry: `ppn << 10 | tag`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageTableEntry(pub u64);

impl PageTableEntry {
    pub fn new(ppn: u64, kind: EntryKind) -> Self {
        PageTableEntry((ppn << PPN_SHIFT) | kind.tag())
    }

    pub fn kind(self) -> EntryKind {
        match self.0 & TAG_MASK {
            EntryKind::DIRECTORY => EntryKind::Directory,
            EntryKind::LEAF => EntryKind::Leaf,
            _ => EntryKind::Invalid,
        }
    }

    pub fn is_valid(self) -> bool {
        self.kind() != EntryKind::Invalid
    }

    pub fn ppn(self) -> u64 {
        self.0 >> PPN_SHIFT
    }

    pub fn read(mem: &PhysicalMemory, addr: u64) -> Result<Self> {
        Ok(PageTableEntry(mem.read64(addr)?))
    }

    pub fn write(self, mem: &mut PhysicalMemory, addr: u64) -> Result<()> {
        mem.write64(addr, self.0)
    }
}

/// Index into the table at `level` (0 = root)
#[inline(always)]
pub fn level_index(vaddr: u64, level: u32) -> u64 {
    (vaddr >> (PAGE_SHIFT + INDEX_BITS * (LEVELS - 1 - level))) & INDEX_MASK
}

pub struct Mmu {
    enabled: bool,
    root: u64,
    allocator: PageAllocator,
    host: Option<HostMapping>,
    walks: u64,
    page_faults: u64,
}

impl Mmu {
    /// Identity translation, bounds-checked against physical memory
    pub fn disabled(allocator: PageAllocator) -> Self {
        Mmu { enabled: false, root: 0, allocator, host: None, walks: 0, page_faults: 0 }
    }

    /// Paged translation; allocates and zeroes the root table
    pub fn enabled(mut allocator: PageAllocator, mem: &mut PhysicalMemory, host: Option<HostMapping>) -> Result<Self> {
        let root_ppn = allocator.allocate()?;
        mem.clear_page(root_ppn)?;
        log::debug!("[MMU] page table root at {:#x}", root_ppn << PAGE_SHIFT);
        Ok(Mmu { enabled: true, root: root_ppn << PAGE_SHIFT, allocator, host, walks: 0, page_faults: 0 })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Physical address of the root table
    pub fn root(&self) -> u64 {
        self.root
    }

    pub fn set_root(&mut self, root: u64) {
        self.root = root & !PAGE_OFFSET_MASK;
    }

    pub fn allocator(&self) -> &PageAllocator {
        &self.allocator
    }

    pub fn allocator_mut(&mut self) -> &mut PageAllocator {
        &mut self.allocator
    }

    pub fn host_mapping(&self) -> Option<&HostMapping> {
        self.host.as_ref()
    }

    /// (walks, demand-allocated leaf pages)
    pub fn stats(&self) -> (u64, u64) {
        (self.walks, self.page_faults)
    }

    /// Virtual to physical. Never fails for in-range addresses when paging is on.
    pub fn translate(&mut self, mem: &mut PhysicalMemory, vaddr: u64) -> Result<u64> {
        if !self.enabled {
            if vaddr >= mem.size() {
                return Err(BridgeError::OutOfRange { addr: vaddr, limit: mem.size() });
            }
            return Ok(vaddr);
        }
        let limit = self.host.as_ref().map_or(1u64 << VIRTUAL_BITS, |h| h.len().min(1 << VIRTUAL_BITS));
        if vaddr >= limit {
            return Err(BridgeError::VirtualOutOfRange { vaddr, limit });
        }

        self.walks += 1;
        let mut table = self.root;
        let mut ppn = 0;
        for level in 0..LEVELS {
            let pte_addr = table + level_index(vaddr, level) * 8;
            let mut pte = PageTableEntry::read(mem, pte_addr)?;
            if !pte.is_valid() {
                let leaf = level == LEVELS - 1;
                let frame = self.allocator.allocate()?;
                mem.clear_page(frame)?;
                let kind = if leaf { EntryKind::Leaf } else { EntryKind::Directory };
                pte = PageTableEntry::new(frame, kind);
                pte.write(mem, pte_addr)?;
                if leaf {
                    self.page_faults += 1;
                    log::trace!("[MMU] map vpage {:#x} -> frame {:#x}", vaddr >> PAGE_SHIFT, frame);
                    if let Some(host) = self.host.as_mut() {
                        host.bind(vaddr >> PAGE_SHIFT, frame)?;
                    }
                }
            }
            ppn = pte.ppn();
            table = ppn << PAGE_SHIFT;
        }

        let paddr = (ppn << PAGE_SHIFT) | (vaddr & PAGE_OFFSET_MASK);
        if paddr >= mem.size() {
            return Err(BridgeError::OutOfRange { addr: paddr, limit: mem.size() });
        }
        Ok(paddr)
    }

    /// Split `[vaddr, vaddr+len)` into physically contiguous pieces
    pub fn translate_range(&mut self, mem: &mut PhysicalMemory, vaddr: u64, len: u64) -> Result<Vec<(u64, u64)>> {
        let mut chunks = Vec::new();
        let mut cursor = vaddr;
        let end = vaddr.checked_add(len).ok_or(BridgeError::VirtualOutOfRange { vaddr, limit: u64::MAX })?;
        while cursor < end {
            let page_end = (cursor | PAGE_OFFSET_MASK) + 1;
            let piece = page_end.min(end) - cursor;
            let paddr = self.translate(mem, cursor)?;
            match chunks.last_mut() {
                Some((start, n)) if *start + *n == paddr => *n += piece,
                _ => chunks.push((paddr, piece)),
            }
            cursor += piece;
        }
        Ok(chunks)
    }

    /// Host pointer value the kernel can use for a guest address
    ///
    /// Paged guests need the host mapping: a raw frame pointer only covers
    /// one page and the kernel would run on into unrelated frames.
    pub fn host_address(&mut self, mem: &mut PhysicalMemory, vaddr: u64) -> Result<u64> {
        // translating first binds the page before the kernel touches it
        let paddr = self.translate(mem, vaddr)?;
        match (&self.host, self.enabled) {
            (Some(host), _) => host.host_address(vaddr),
            (None, false) => Ok(mem.host_ptr(paddr)? as u64),
            (None, true) => Err(BridgeError::InvalidConfig("paged guest pointers need the host mapping".into())),
        }
    }

    /// Every valid leaf as (vpn, ppn)
    pub fn leaves(&self, mem: &PhysicalMemory) -> Result<Vec<(u64, u64)>> {
        let mut out = Vec::new();
        if self.enabled {
            self.collect_leaves(mem, self.root, 0, 0, &mut out)?;
        }
        Ok(out)
    }

    fn collect_leaves(&self, mem: &PhysicalMemory, table: u64, level: u32, prefix: u64, out: &mut Vec<(u64, u64)>) -> Result<()> {
        for index in 0..(1u64 << INDEX_BITS) {
            let pte = PageTableEntry::read(mem, table + index * 8)?;
            let vpn = (prefix << INDEX_BITS) | index;
            match pte.kind() {
                EntryKind::Invalid => {}
                EntryKind::Leaf if level == LEVELS - 1 => out.push((vpn, pte.ppn())),
                _ if level < LEVELS - 1 => self.collect_leaves(mem, pte.ppn() << PAGE_SHIFT, level + 1, vpn, out)?,
                _ => {}
            }
        }
        Ok(())
    }

    /// Re-establish host bindings for every leaf (after a snapshot restore)
    pub fn rebind_all(&mut self, mem: &PhysicalMemory) -> Result<()> {
        if self.host.is_none() {
            return Ok(());
        }
        let leaves = self.leaves(mem)?;
        if let Some(host) = self.host.as_mut() {
            for (vpn, ppn) in leaves {
                host.bind(vpn, ppn)?;
            }
        }
        Ok(())
    }
}
