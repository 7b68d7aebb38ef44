//! Syscall proxy
//!
//! Every guest trap comes through `SyscallProxy::handle_trap`. Pointer
//! arguments are translated to host pointers and guarded: the window around
//! each is snapshotted, pending writes inside it are applied, the host call
//! runs, and every 64-byte physical line that changed is announced to the
//! pipeline as an invalidation.

pub mod gateway;
pub mod numbers;
pub mod table;

use std::collections::BTreeSet;

use log::{debug, error, trace};
use serde::Serialize;

use crate::address_space::{AddressSpace, GuardWindow};
use crate::bus::BusController;
use crate::error::{BridgeError, Result};
use crate::memory::{line_of, PAGE_SIZE};
pub use gateway::{HostGateway, HostReturn, LinuxGateway};
use table::{CallClass, PointerArg};

/// Operations of the arch-specific call
pub const ATOMIC_CMPXCHG32: u64 = 1;
pub const ATOMIC_CMPXCHG64: u64 = 2;

/// Bytes per iovec entry (base, len)
const IOVEC_SIZE: u64 = 16;
/// Largest iovec array the host kernel accepts
pub const IOV_MAX: u64 = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TrapOutcome {
    Completed { value: i64, errno: Option<i32> },
    /// The guest asked to stop
    Exit { code: i64 },
}

impl TrapOutcome {
    fn completed(value: i64) -> Self {
        TrapOutcome::Completed { value, errno: None }
    }
}

pub struct SyscallProxy<G: HostGateway> {
    gateway: G,
    heap_cursor: u64,
    heap_limit: u64,
    /// Guest virtual address of the runtime's errno
    errno_address: Option<u64>,
    guard_window: u64,
    calls: u64,
    invalidations: u64,
}

impl<G: HostGateway> SyscallProxy<G> {
    pub fn new(gateway: G, guard_window: u64) -> Self {
        SyscallProxy {
            gateway,
            heap_cursor: 0,
            heap_limit: u64::MAX,
            errno_address: None,
            guard_window: guard_window.max(1),
            calls: 0,
            invalidations: 0,
        }
    }

    pub fn gateway(&self) -> &G {
        &self.gateway
    }

    pub fn gateway_mut(&mut self) -> &mut G {
        &mut self.gateway
    }

    pub fn heap_cursor(&self) -> u64 {
        self.heap_cursor
    }

    pub fn set_heap_cursor(&mut self, cursor: u64) {
        self.heap_cursor = cursor;
    }

    /// Heap allocations must end at or below `limit`
    pub fn set_heap_limit(&mut self, limit: u64) {
        self.heap_limit = limit;
    }

    pub fn errno_address(&self) -> Option<u64> {
        self.errno_address
    }

    pub fn set_errno_address(&mut self, addr: Option<u64>) {
        self.errno_address = addr;
    }

    /// (traps handled, invalidations issued)
    pub fn stats(&self) -> (u64, u64) {
        (self.calls, self.invalidations)
    }

    pub fn handle_trap(
        &mut self,
        space: &mut AddressSpace,
        bus: &mut BusController,
        number: u64,
        args: [u64; 7],
    ) -> Result<TrapOutcome> {
        self.calls += 1;
        let class = table::lookup(number).map(|c| c.class);
        trace!("ecall {} ({}) args {:x?}", number, table::name_of(number), args);

        match class {
            Some(CallClass::HeapAlloc) => self.heap_alloc(args[0]).map(|v| TrapOutcome::completed(v as i64)),
            Some(CallClass::AnonymousMap) => self.anonymous_map(args).map(|v| TrapOutcome::completed(v as i64)),
            Some(CallClass::Unmap) | Some(CallClass::NoOp) => Ok(TrapOutcome::completed(0)),
            Some(CallClass::Terminate) => {
                // a killed process reports 128 + signal; signals fit in 7 bits
                let code = if number == numbers::TGKILL { 128 + (args[2] & 0x7f) as i64 } else { args[0] as i64 };
                debug!("guest terminated through {} with {}", table::name_of(number), code);
                Ok(TrapOutcome::Exit { code })
            }
            Some(CallClass::ArchSpecific) => self.arch_specific(space, bus, args),
            Some(CallClass::Rejected) => {
                let name = table::name_of(number);
                error!("unsupported syscall {} ({})", number, name);
                Err(BridgeError::UnsupportedSyscall { number, name })
            }
            Some(CallClass::Forward(pointers)) => self.forward(space, bus, number, args, pointers),
            None => self.forward(space, bus, number, args, &[]),
        }
    }

    fn heap_alloc(&mut self, size: u64) -> Result<u64> {
        let cursor = self.heap_cursor;
        let end = cursor
            .checked_add(size)
            .filter(|&end| end <= self.heap_limit)
            .ok_or(BridgeError::HeapExhausted { cursor, size })?;
        trace!("allocate {} bytes at {:#x}", size, cursor);
        self.heap_cursor = end;
        Ok(cursor)
    }

    fn anonymous_map(&mut self, args: [u64; 7]) -> Result<u64> {
        let (addr, len, flags) = (args[0], args[1], args[3]);
        if addr != 0 || flags & libc::MAP_ANONYMOUS as u64 == 0 {
            return Err(BridgeError::UnsupportedMmap { addr, flags });
        }
        let cursor = self.heap_cursor;
        self.heap_cursor = cursor
            .checked_next_multiple_of(PAGE_SIZE)
            .ok_or(BridgeError::HeapExhausted { cursor, size: len })?;
        self.heap_alloc(len)
    }

    /// Compare-and-swap on guest memory the pipeline cannot do atomically
    fn arch_specific(&mut self, space: &mut AddressSpace, bus: &mut BusController, args: [u64; 7]) -> Result<TrapOutcome> {
        let (op, vaddr, expected, new) = (args[0], args[1], args[2], args[3]);
        let size = match op {
            ATOMIC_CMPXCHG32 => 4,
            ATOMIC_CMPXCHG64 => 8,
            _ => {
                error!("unsupported arch-specific syscall {}", op);
                return Err(BridgeError::UnsupportedArchCall { op });
            }
        };
        if vaddr % size != 0 {
            return Err(BridgeError::Misaligned { addr: vaddr });
        }
        let paddr = space.translate(vaddr)?;
        space.pending.drain_range(&mut space.memory, paddr, size)?;
        let (old, swapped) = if size == 4 {
            let old = space.memory.read32(paddr)?;
            let swapped = old == expected as u32;
            if swapped {
                space.memory.write32(paddr, new as u32)?;
            }
            (old as i32 as i64, swapped)
        } else {
            let old = space.memory.read64(paddr)?;
            let swapped = old == expected;
            if swapped {
                space.memory.write64(paddr, new)?;
            }
            (old as i64, swapped)
        };
        if swapped {
            self.invalidations += 1;
            bus.invalidate(paddr);
        }
        Ok(TrapOutcome::completed(old))
    }

    fn guard(&mut self, space: &mut AddressSpace, vaddr: u64, guards: &mut Vec<GuardWindow>) -> Result<u64> {
        let guard = space.open_guard(vaddr, self.guard_window)?;
        if guard.drained > 0 {
            trace!("applied {} pending bytes under {:#x}", guard.drained, guard.vaddr);
        }
        guards.push(guard);
        space.host_address(vaddr)
    }

    fn forward(
        &mut self,
        space: &mut AddressSpace,
        bus: &mut BusController,
        number: u64,
        args: [u64; 7],
        pointers: &[PointerArg],
    ) -> Result<TrapOutcome> {
        if number == numbers::WRITEV && args[2] > IOV_MAX {
            debug!("writev with {} iovecs refused", args[2]);
            return self.fail(space, bus, libc::EINVAL);
        }

        let mut host_args = args;
        let mut guards = Vec::with_capacity(pointers.len());
        for p in pointers {
            let vaddr = args[p.index];
            if vaddr == 0 {
                continue;
            }
            host_args[p.index] = self.guard(space, vaddr, &mut guards)?;
        }

        // writev: the kernel gets a host-side copy of the iovec array with
        // rewritten bases; guest memory keeps guest pointers
        let mut iovecs: Vec<u64> = Vec::new();
        if number == numbers::WRITEV && args[1] != 0 {
            let raw = space.read_virtual(args[1], args[2] * IOVEC_SIZE)?;
            iovecs = raw
                .chunks_exact(8)
                .map(|w| {
                    let mut b = [0u8; 8];
                    b.copy_from_slice(w);
                    u64::from_le_bytes(b)
                })
                .collect();
            for i in (0..iovecs.len()).step_by(2) {
                if iovecs[i] != 0 {
                    iovecs[i] = self.guard(space, iovecs[i], &mut guards)?;
                }
            }
            host_args[1] = iovecs.as_ptr() as u64;
        }

        let ret = self.gateway.syscall(number, host_args);
        drop(iovecs);
        trace!("{} => {} (errno {:?})", table::name_of(number), ret.value, ret.errno);

        let mut lines = BTreeSet::new();
        if let (Some(errno), Some(addr)) = (ret.errno, self.errno_address) {
            lines.insert(self.mirror_errno(space, addr, errno)?);
        }
        for guard in &guards {
            lines.extend(space.changed_lines(guard)?);
        }
        for &line in &lines {
            bus.invalidate(line);
        }
        self.invalidations += lines.len() as u64;

        Ok(TrapOutcome::Completed { value: ret.value, errno: ret.errno })
    }

    /// Answer a call with -1 and `errno` without reaching the host
    fn fail(&mut self, space: &mut AddressSpace, bus: &mut BusController, errno: i32) -> Result<TrapOutcome> {
        if let Some(addr) = self.errno_address {
            let line = self.mirror_errno(space, addr, errno)?;
            bus.invalidate(line);
            self.invalidations += 1;
        }
        Ok(TrapOutcome::Completed { value: -1, errno: Some(errno) })
    }

    /// Store the new errno where the guest runtime reads it; returns its line
    fn mirror_errno(&mut self, space: &mut AddressSpace, vaddr: u64, errno: i32) -> Result<u64> {
        let paddr = space.translate(vaddr)?;
        space.pending.drain_range(&mut space.memory, paddr, 4)?;
        space.memory.write32(paddr, errno as u32)?;
        debug!("errno -> {}", errno);
        Ok(line_of(paddr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeConfig;

    struct Fixed(HostReturn);

    impl HostGateway for Fixed {
        fn syscall(&mut self, _number: u64, _args: [u64; 7]) -> HostReturn {
            self.0
        }
    }

    fn rig() -> (SyscallProxy<Fixed>, AddressSpace, BusController) {
        let config = BridgeConfig {
            ram_size: 512 * PAGE_SIZE,
            virtual_memory: true,
            host_mapping: true,
            virtual_address_bits: 32,
            page_seed: Some(5),
            ..BridgeConfig::default()
        };
        let proxy = SyscallProxy::new(Fixed(HostReturn::ok(0)), 10 * 1024);
        (proxy, AddressSpace::new(&config).unwrap(), BusController::new(1000))
    }

    #[test]
    fn test_heap_growth() {
        let (mut proxy, mut space, mut bus) = rig();
        proxy.set_heap_cursor(0x40_0000);
        let out = proxy.handle_trap(&mut space, &mut bus, numbers::BRK, [4096, 0, 0, 0, 0, 0, 0]).unwrap();
        assert_eq!(out, TrapOutcome::Completed { value: 0x40_0000, errno: None });
        assert_eq!(proxy.heap_cursor(), 0x40_1000);
    }

    #[test]
    fn test_heap_limit() {
        let (mut proxy, mut space, mut bus) = rig();
        proxy.set_heap_cursor(0x1000);
        proxy.set_heap_limit(0x2000);
        let err = proxy.handle_trap(&mut space, &mut bus, numbers::BRK, [0x2000, 0, 0, 0, 0, 0, 0]);
        assert!(matches!(err, Err(BridgeError::HeapExhausted { cursor: 0x1000, size: 0x2000 })));
    }

    #[test]
    fn test_anonymous_mmap_aligns_cursor() {
        let (mut proxy, mut space, mut bus) = rig();
        proxy.set_heap_cursor(0x40_0010);
        let flags = (libc::MAP_PRIVATE | libc::MAP_ANONYMOUS) as u64;
        let out = proxy.handle_trap(&mut space, &mut bus, numbers::MMAP, [0, 8192, 3, flags, u64::MAX, 0, 0]).unwrap();
        assert_eq!(out, TrapOutcome::Completed { value: 0x40_1000, errno: None });
        assert_eq!(proxy.heap_cursor(), 0x40_3000);

        let file = libc::MAP_PRIVATE as u64;
        let err = proxy.handle_trap(&mut space, &mut bus, numbers::MMAP, [0, 8192, 3, file, 3, 0, 0]);
        assert!(matches!(err, Err(BridgeError::UnsupportedMmap { .. })));
    }

    #[test]
    fn test_synthetic_answers() {
        let (mut proxy, mut space, mut bus) = rig();
        proxy.gateway_mut().0 = HostReturn::ok(99);
        for n in [numbers::MUNMAP, numbers::RT_SIGACTION, numbers::SIGALTSTACK] {
            let out = proxy.handle_trap(&mut space, &mut bus, n, [1; 7]).unwrap();
            assert_eq!(out, TrapOutcome::Completed { value: 0, errno: None });
        }
        let out = proxy.handle_trap(&mut space, &mut bus, numbers::EXIT_GROUP, [3, 0, 0, 0, 0, 0, 0]).unwrap();
        assert_eq!(out, TrapOutcome::Exit { code: 3 });
    }

    #[test]
    fn test_tgkill_exit_code() {
        let (mut proxy, mut space, mut bus) = rig();
        let out = proxy.handle_trap(&mut space, &mut bus, numbers::TGKILL, [1, 1, 6, 0, 0, 0, 0]).unwrap();
        assert_eq!(out, TrapOutcome::Exit { code: 134 });
        let out = proxy.handle_trap(&mut space, &mut bus, numbers::TGKILL, [1, 1, i64::MAX as u64, 0, 0, 0, 0]).unwrap();
        assert_eq!(out, TrapOutcome::Exit { code: 128 + 0x7f });
    }

    #[test]
    fn test_oversized_writev_fails_with_einval() {
        let (mut proxy, mut space, mut bus) = rig();
        proxy.set_errno_address(Some(0x9000));
        proxy.gateway_mut().0 = HostReturn::ok(99);
        for count in [IOV_MAX + 1, 1 << 61, u64::MAX] {
            let out = proxy.handle_trap(&mut space, &mut bus, numbers::WRITEV, [1, 0x5000, count, 0, 0, 0, 0]).unwrap();
            assert_eq!(out, TrapOutcome::Completed { value: -1, errno: Some(libc::EINVAL) });
        }
        assert_eq!(space.read_virtual(0x9000, 4).unwrap(), (libc::EINVAL as u32).to_le_bytes().to_vec());
        // the limit itself still goes to the host
        let out = proxy.handle_trap(&mut space, &mut bus, numbers::WRITEV, [1, 0x5000, IOV_MAX, 0, 0, 0, 0]).unwrap();
        assert_eq!(out, TrapOutcome::Completed { value: 99, errno: None });
    }

    #[test]
    fn test_mmap_cursor_overflow_is_an_error() {
        let (mut proxy, mut space, mut bus) = rig();
        proxy.set_heap_cursor(u64::MAX - 10);
        let flags = (libc::MAP_PRIVATE | libc::MAP_ANONYMOUS) as u64;
        let err = proxy.handle_trap(&mut space, &mut bus, numbers::MMAP, [0, 4096, 3, flags, u64::MAX, 0, 0]);
        assert!(matches!(err, Err(BridgeError::HeapExhausted { .. })));
    }

    #[test]
    fn test_rejected_call_halts() {
        let (mut proxy, mut space, mut bus) = rig();
        let err = proxy.handle_trap(&mut space, &mut bus, numbers::CLONE, [0; 7]);
        assert!(matches!(err, Err(BridgeError::UnsupportedSyscall { number: 56, name: "clone" })));
    }

    #[test]
    fn test_cmpxchg() {
        let (mut proxy, mut space, mut bus) = rig();
        let paddr = space.translate(0x8000).unwrap();
        space.memory.write32(paddr, 5).unwrap();
        // pending value is the current one
        space.pending.record(&mut space.memory, paddr, 7, 4).unwrap();

        let out = proxy.handle_trap(&mut space, &mut bus, 1244, [1, 0x8000, 7, 9, 0, 0, 0]).unwrap();
        assert_eq!(out, TrapOutcome::Completed { value: 7, errno: None });
        assert_eq!(space.memory.read32(paddr).unwrap(), 9);
        assert_eq!(bus.pending_responses(), 1);

        // mismatch leaves memory alone
        let out = proxy.handle_trap(&mut space, &mut bus, 1244, [2, 0x8000, 1, 2, 0, 0, 0]).unwrap();
        assert_eq!(out, TrapOutcome::Completed { value: 9, errno: None });
        assert_eq!(space.memory.read64(paddr).unwrap(), 9);
        assert_eq!(bus.pending_responses(), 1);

        let err = proxy.handle_trap(&mut space, &mut bus, 1244, [3, 0x8000, 0, 0, 0, 0, 0]);
        assert!(matches!(err, Err(BridgeError::UnsupportedArchCall { op: 3 })));
    }

    #[test]
    fn test_errno_mirrored() {
        let (mut proxy, mut space, mut bus) = rig();
        proxy.set_errno_address(Some(0x9020));
        proxy.gateway_mut().0 = HostReturn::failed(libc::ENOENT);
        let out = proxy.handle_trap(&mut space, &mut bus, numbers::OPEN, [0, 0, 0, 0, 0, 0, 0]).unwrap();
        assert_eq!(out, TrapOutcome::Completed { value: -1, errno: Some(libc::ENOENT) });
        assert_eq!(space.read_virtual(0x9020, 4).unwrap(), (libc::ENOENT as u32).to_le_bytes().to_vec());
        let paddr = space.translate(0x9020).unwrap();
        assert_eq!(bus.responses().next().map(|r| r.0), Some(line_of(paddr)));
    }

    #[test]
    fn test_guard_drains_before_host_call() {
        let (mut proxy, mut space, mut bus) = rig();
        let paddr = space.translate(0x6000).unwrap();
        space.pending.record(&mut space.memory, paddr, 0x41, 1).unwrap();
        proxy.handle_trap(&mut space, &mut bus, numbers::WRITE, [1, 0x6000, 1, 0, 0, 0, 0]).unwrap();
        assert!(space.pending.is_empty());
        assert_eq!(space.memory.read8(paddr).unwrap(), 0x41);
        // the drained byte differs from the snapshot, so its line is announced
        assert_eq!(bus.pending_responses(), 1);
    }
}
