//! Host mapping of the guest virtual address space
//!
//! A PROT_NONE reservation spanning the guest's virtual range. Each guest page
//! gets its physical frame mapped in (from the memfd behind physical memory)
//! the moment its leaf entry is created, so `base + vaddr` is a plain host
//! pointer to the guest's bytes from then on.

use std::collections::HashSet;
use std::io;
use std::os::fd::RawFd;
use std::ptr::NonNull;

use crate::error::{BridgeError, Result};
use crate::memory::{PAGE_SHIFT, PAGE_SIZE};

pub struct HostMapping {
    base: NonNull<u8>,
    len: u64,
    fd: RawFd,
    bound: HashSet<u64>,
}

// SAFETY: the reservation is owned by this struct and only remapped through &mut self.
unsafe impl Send for HostMapping {}

impl HostMapping {
    /// Reserve `1 << bits` bytes of address space backed by nothing
    pub fn reserve(bits: u8, fd: RawFd) -> Result<Self> {
        let len = 1u64
            .checked_shl(bits as u32)
            .filter(|&l| l >= PAGE_SIZE)
            .ok_or_else(|| BridgeError::InvalidConfig(format!("virtual address bits {} out of range", bits)))?;
        // SAFETY: fresh PROT_NONE reservation at a kernel-chosen address.
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len as usize,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(BridgeError::HostMapping(io::Error::last_os_error()));
        }
        let base = NonNull::new(addr.cast::<u8>())
            .ok_or_else(|| BridgeError::HostMapping(io::Error::new(io::ErrorKind::Other, "mmap returned null")))?;
        log::debug!("reserved {:#x} bytes of guest address space at {:p}", len, base);
        Ok(HostMapping { base, len, fd, bound: HashSet::new() })
    }

    pub fn base(&self) -> u64 {
        self.base.as_ptr() as u64
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_bound(&self, vpn: u64) -> bool {
        self.bound.contains(&vpn)
    }

    pub fn bound_pages(&self) -> usize {
        self.bound.len()
    }

    /// Map physical frame `ppn` at guest virtual page `vpn`
    pub fn bind(&mut self, vpn: u64, ppn: u64) -> Result<()> {
        let vaddr = vpn << PAGE_SHIFT;
        if vaddr >= self.len {
            return Err(BridgeError::VirtualOutOfRange { vaddr, limit: self.len });
        }
        if !self.bound.insert(vpn) {
            return Ok(());
        }
        // SAFETY: the target lies inside our own reservation, so MAP_FIXED
        // replaces only memory we own.
        let addr = unsafe {
            libc::mmap(
                self.base.as_ptr().add(vaddr as usize).cast(),
                PAGE_SIZE as usize,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_FIXED,
                self.fd,
                (ppn << PAGE_SHIFT) as libc::off_t,
            )
        };
        if addr == libc::MAP_FAILED {
            self.bound.remove(&vpn);
            return Err(BridgeError::HostMapping(io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Host address of a guest virtual address
    pub fn host_address(&self, vaddr: u64) -> Result<u64> {
        if vaddr >= self.len {
            return Err(BridgeError::VirtualOutOfRange { vaddr, limit: self.len });
        }
        Ok(self.base() + vaddr)
    }
}

impl Drop for HostMapping {
    fn drop(&mut self) {
        // SAFETY: the whole reservation, bound pages included, belongs to us.
        unsafe {
            libc::munmap(self.base.as_ptr().cast(), self.len as usize);
        }
    }
}
