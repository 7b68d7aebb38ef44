//! Physical memory
//!
//! One contiguous, fixed-size byte region: the only true storage of the
//! bridge. Page tables, guest data and the console window all live here.
//!
//! Memory layout (physical):
//! 0x00000000 - 0x00000FFF: reserved (never handed out as a page)
//! 0x000B8000 - 0x000B8F9F: console text window (80x25 cells, 2 bytes each)
//! everything else:        page frames, handed out by the page allocator

pub mod backing;
pub mod pending;

use crate::error::{BridgeError, Result};
use backing::Backing;

pub use pending::PendingWrites;

/// Page size (4KB)
pub const PAGE_SIZE: u64 = 4096;
pub const PAGE_SHIFT: u32 = 12;
/// Coherency granularity between the bus model and the syscall proxy
pub const LINE_SIZE: u64 = 64;

/// Align an address down to its 64-byte line
#[inline(always)]
pub const fn line_of(addr: u64) -> u64 {
    addr & !(LINE_SIZE - 1)
}

/// Physical memory
pub struct PhysicalMemory {
    ram: Backing,
}

impl PhysicalMemory {
    /// Private memory (no host mapping possible)
    pub fn new(ram_size: u64) -> Result<Self> {
        Ok(PhysicalMemory { ram: Backing::anonymous(Self::checked_len(ram_size)?)? })
    }

    /// memfd-backed memory whose pages can be bound into a host mapping
    pub fn new_shared(ram_size: u64) -> Result<Self> {
        Ok(PhysicalMemory { ram: Backing::shared(Self::checked_len(ram_size)?)? })
    }

    fn checked_len(ram_size: u64) -> Result<usize> {
        if ram_size == 0 || ram_size % PAGE_SIZE != 0 {
            return Err(BridgeError::InvalidConfig(format!(
                "physical memory size {:#x} must be a non-zero multiple of the page size",
                ram_size
            )));
        }
        usize::try_from(ram_size).map_err(|_| BridgeError::OutOfRange { addr: ram_size, limit: usize::MAX as u64 })
    }

    /// Get RAM size in bytes
    pub fn size(&self) -> u64 {
        self.ram.len() as u64
    }

    /// Descriptor of a memfd backing
    pub fn shared_fd(&self) -> Option<std::os::fd::RawFd> {
        self.ram.fd()
    }

    #[inline(always)]
    fn check(&self, addr: u64, len: u64) -> Result<usize> {
        let end = addr.checked_add(len).ok_or(BridgeError::OutOfRange { addr, limit: self.size() })?;
        if end > self.size() {
            return Err(BridgeError::OutOfRange { addr, limit: self.size() });
        }
        Ok(addr as usize)
    }

    /// `[addr, addr+len)` lies inside physical memory
    pub fn check_range(&self, addr: u64, len: u64) -> Result<()> {
        self.check(addr, len).map(|_| ())
    }

    /// Host pointer to a physical address
    ///
    /// The pointer is only valid while `self` lives. Writers through it
    /// (the host kernel) must not race with a live slice from `bytes_mut`.
    pub fn host_ptr(&self, addr: u64) -> Result<*mut u8> {
        let offset = self.check(addr, 0)?;
        // SAFETY: offset <= len, so the result stays within (or one past) the mapping.
        Ok(unsafe { self.ram.as_ptr().add(offset) })
    }

    pub fn bytes(&self, addr: u64, len: u64) -> Result<&[u8]> {
        let offset = self.check(addr, len)?;
        Ok(&self.ram.as_slice()[offset..offset + len as usize])
    }

    pub fn bytes_mut(&mut self, addr: u64, len: u64) -> Result<&mut [u8]> {
        let offset = self.check(addr, len)?;
        Ok(&mut self.ram.as_mut_slice()[offset..offset + len as usize])
    }

    /// Read 8 bits
    pub fn read8(&self, addr: u64) -> Result<u8> {
        let offset = self.check(addr, 1)?;
        Ok(self.ram.as_slice()[offset])
    }

    /// Write 8 bits
    pub fn write8(&mut self, addr: u64, value: u8) -> Result<()> {
        let offset = self.check(addr, 1)?;
        self.ram.as_mut_slice()[offset] = value;
        Ok(())
    }

    /// Read 32 bits (little endian)
    pub fn read32(&self, addr: u64) -> Result<u32> {
        let b = self.bytes(addr, 4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Write 32 bits (little endian)
    pub fn write32(&mut self, addr: u64, value: u32) -> Result<()> {
        self.bytes_mut(addr, 4)?.copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    /// Read 64 bits (little endian) - page table entries and bus beats
    pub fn read64(&self, addr: u64) -> Result<u64> {
        let b = self.bytes(addr, 8)?;
        let mut word = [0u8; 8];
        word.copy_from_slice(b);
        Ok(u64::from_le_bytes(word))
    }

    /// Write 64 bits (little endian)
    pub fn write64(&mut self, addr: u64, value: u64) -> Result<()> {
        self.bytes_mut(addr, 8)?.copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    /// Load binary data at a physical address
    pub fn load_binary(&mut self, data: &[u8], addr: u64) -> Result<()> {
        self.bytes_mut(addr, data.len() as u64)?.copy_from_slice(data);
        Ok(())
    }

    /// Zero one page frame
    pub fn clear_page(&mut self, page: u64) -> Result<()> {
        self.bytes_mut(page << PAGE_SHIFT, PAGE_SIZE)?.fill(0);
        Ok(())
    }
}
