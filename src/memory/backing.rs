//! Host storage behind physical memory
//!
//! Physical memory lives in its own mmap region rather than a `Vec` so that
//! the host kernel may write into it through raw pointers handed out by the
//! syscall proxy. A shared (memfd) backing additionally lets individual pages
//! be mapped a second time at guest-virtual offsets.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr::NonNull;

pub struct Backing {
    ptr: NonNull<u8>,
    len: usize,
    fd: Option<OwnedFd>,
}

// SAFETY: the region is owned exclusively by the Backing and only touched
// through &self/&mut self methods of PhysicalMemory.
unsafe impl Send for Backing {}

impl Backing {
    /// Private anonymous zero-filled region
    pub fn anonymous(len: usize) -> io::Result<Self> {
        let ptr = Self::map(len, libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE, -1)?;
        Ok(Backing { ptr, len, fd: None })
    }

    /// memfd-backed region whose pages can be mapped again elsewhere
    pub fn shared(len: usize) -> io::Result<Self> {
        let name = b"simbridge-ram\0";
        // SAFETY: name is NUL terminated.
        let raw = unsafe { libc::memfd_create(name.as_ptr().cast(), libc::MFD_CLOEXEC) };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: raw is a fresh descriptor we own.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };
        // SAFETY: fd is valid.
        if unsafe { libc::ftruncate(fd.as_raw_fd(), len as libc::off_t) } != 0 {
            return Err(io::Error::last_os_error());
        }
        let ptr = Self::map(len, libc::MAP_SHARED, fd.as_raw_fd())?;
        Ok(Backing { ptr, len, fd: Some(fd) })
    }

    fn map(len: usize, flags: libc::c_int, fd: RawFd) -> io::Result<NonNull<u8>> {
        // SAFETY: a fresh mapping at a kernel-chosen address aliases nothing.
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                flags,
                fd,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        NonNull::new(addr.cast::<u8>()).ok_or_else(|| io::Error::new(io::ErrorKind::Other, "mmap returned null"))
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Descriptor of a shared backing
    pub fn fd(&self) -> Option<RawFd> {
        self.fd.as_ref().map(|fd| fd.as_raw_fd())
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr..ptr+len is a live mapping owned by self.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, and &mut self guarantees exclusivity on our side.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for Backing {
    fn drop(&mut self) {
        // SAFETY: we created this mapping with exactly this length.
        unsafe {
            libc::munmap(self.ptr.as_ptr().cast(), self.len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_anonymous_is_zeroed() {
        let mut b = Backing::anonymous(8192).unwrap();
        assert!(b.as_slice().iter().all(|&x| x == 0));
        b.as_mut_slice()[4097] = 7;
        assert_eq!(b.as_slice()[4097], 7);
        assert!(b.fd().is_none());
    }

    #[test]
    fn test_shared_has_fd() {
        let b = Backing::shared(4096).unwrap();
        assert!(b.fd().is_some());
        assert_eq!(b.len(), 4096);
    }
}
