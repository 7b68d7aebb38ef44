//! Host system call gateway
//!
//! The only place a guest request reaches the real kernel. Kept behind a
//! trait so the proxy can be driven by a recording gateway in tests or by a
//! different host.

use std::io;

/// What the host kernel answered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostReturn {
    pub value: i64,
    /// Set when the call changed the host errno
    pub errno: Option<i32>,
}

impl HostReturn {
    pub fn ok(value: i64) -> Self {
        HostReturn { value, errno: None }
    }

    pub fn failed(errno: i32) -> Self {
        HostReturn { value: -1, errno: Some(errno) }
    }
}

pub trait HostGateway {
    /// Issue call `number` with already-rewritten arguments
    fn syscall(&mut self, number: u64, args: [u64; 7]) -> HostReturn;
}

/// Forwards straight to `syscall(2)` of the running Linux kernel
#[derive(Debug, Default)]
pub struct LinuxGateway;

fn last_errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
fn clear_errno() {
    // SAFETY: __errno_location points at this thread's errno.
    unsafe { *libc::__errno_location() = 0 }
}

impl HostGateway for LinuxGateway {
    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    fn syscall(&mut self, number: u64, args: [u64; 7]) -> HostReturn {
        // a call that leaves errno alone must not report a stale value
        clear_errno();
        // SAFETY: pointer arguments were rewritten to host addresses of
        // bound guest pages; everything else is passed through as the
        // guest supplied it.
        let value = unsafe {
            libc::syscall(
                number as libc::c_long,
                args[0],
                args[1],
                args[2],
                args[3],
                args[4],
                args[5],
                args[6],
            )
        };
        let after = last_errno();
        HostReturn {
            value: value as i64,
            errno: (after != 0).then_some(after),
        }
    }

    #[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
    fn syscall(&mut self, number: u64, _args: [u64; 7]) -> HostReturn {
        log::error!("host syscall {} unavailable on this platform", number);
        HostReturn::failed(libc::ENOSYS)
    }
}
