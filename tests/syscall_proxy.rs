use std::collections::BTreeSet;

use simbridge::bus::tag::{self, INVALIDATE};
use simbridge::memory::line_of;
use simbridge::syscall::numbers;
use simbridge::{Bridge, BridgeConfig, HostGateway, HostReturn, LinuxGateway, TrapOutcome};

/// Fills the buffer argument of `read` at chosen offsets, like a kernel would
struct Scatter {
    offsets: Vec<u64>,
    calls: Vec<(u64, [u64; 7])>,
}

impl HostGateway for Scatter {
    fn syscall(&mut self, number: u64, args: [u64; 7]) -> HostReturn {
        self.calls.push((number, args));
        if number == numbers::READ {
            for &off in &self.offsets {
                // the pointer is a host address into guest memory
                unsafe { *((args[1] + off) as *mut u8) = 0x5a };
            }
            return HostReturn::ok(args[2] as i64);
        }
        HostReturn::ok(0)
    }
}

fn config(virtual_memory: bool) -> BridgeConfig {
    BridgeConfig {
        ram_size: 16 << 20,
        virtual_memory,
        host_mapping: virtual_memory,
        virtual_address_bits: 32,
        page_seed: Some(21),
        stack_offset: 1 << 20,
        ..BridgeConfig::default()
    }
}

fn invalidated(bridge: &Bridge<impl HostGateway>) -> BTreeSet<u64> {
    bridge
        .bus()
        .responses()
        .filter(|&&(_, t)| t == tag::response(INVALIDATE))
        .map(|&(v, _)| v)
        .collect()
}

#[test]
fn test_every_written_line_is_invalidated() {
    let gateway = Scatter { offsets: vec![0, 1, 130, 640, 4000], calls: Vec::new() };
    let mut bridge = Bridge::with_gateway(config(false), gateway).unwrap();
    let buf = 0x20000;
    let out = bridge.ecall(numbers::READ, [3, buf, 4096, 0, 0, 0, 0]).unwrap();
    assert_eq!(out, TrapOutcome::Completed { value: 4096, errno: None });

    let expected: BTreeSet<u64> = [0, 128, 640, 3968].iter().map(|off| buf + off).collect();
    assert_eq!(invalidated(&bridge), expected);
    assert_eq!(bridge.space_mut().read_virtual(buf + 130, 1).unwrap(), vec![0x5a]);
}

#[test]
fn test_paged_pointer_translated_and_invalidated_physically() {
    let gateway = Scatter { offsets: vec![8], calls: Vec::new() };
    let mut bridge = Bridge::with_gateway(config(true), gateway).unwrap();
    let buf = 0x4000_0040;
    bridge.ecall(numbers::READ, [3, buf, 64, 0, 0, 0, 0]).unwrap();

    let paddr = bridge.space_mut().translate(buf).unwrap();
    let host = bridge.space_mut().host_address(buf).unwrap();
    let (_, args) = bridge.proxy().gateway().calls[0];
    assert_eq!(args[1], host);
    assert_ne!(args[1], buf);
    assert_eq!(invalidated(&bridge), BTreeSet::from([line_of(paddr)]));
    // guest reads see what the host wrote
    assert_eq!(bridge.space_mut().read_virtual(buf + 8, 1).unwrap(), vec![0x5a]);
}

#[test]
fn test_null_pointer_passed_through() {
    let gateway = Scatter { offsets: Vec::new(), calls: Vec::new() };
    let mut bridge = Bridge::with_gateway(config(true), gateway).unwrap();
    bridge.ecall(numbers::WRITE, [1, 0, 0, 0, 0, 0, 0]).unwrap();
    let (number, args) = bridge.proxy().gateway().calls[0];
    assert_eq!(number, numbers::WRITE);
    assert_eq!(args[1], 0);
    assert!(invalidated(&bridge).is_empty());
}

#[test]
fn test_pending_bytes_reach_the_host() {
    let gateway = Scatter { offsets: Vec::new(), calls: Vec::new() };
    let mut bridge = Bridge::with_gateway(config(false), gateway).unwrap();
    bridge.space_mut().write_virtual(0x30000, b"old!").unwrap();
    bridge.pending_write(0x30000, u64::from(u32::from_le_bytes(*b"new!")), 4).unwrap();
    bridge.ecall(numbers::WRITE, [1, 0x30000, 4, 0, 0, 0, 0]).unwrap();
    assert!(bridge.space().pending.is_empty());
    assert_eq!(bridge.space().memory.bytes(0x30000, 4).unwrap(), b"new!");
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
#[test]
fn test_real_pipe_round_trip() {
    let mut fds = [0i32; 2];
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
    let (rd, wr) = (fds[0] as u64, fds[1] as u64);

    let mut bridge = Bridge::with_gateway(config(false), LinuxGateway).unwrap();
    bridge.space_mut().write_virtual(0x10000, b"ping").unwrap();

    let out = bridge.ecall(numbers::WRITE, [wr, 0x10000, 4, 0, 0, 0, 0]).unwrap();
    assert_eq!(out, TrapOutcome::Completed { value: 4, errno: None });
    assert!(invalidated(&bridge).is_empty());

    let out = bridge.ecall(numbers::READ, [rd, 0x18000, 4, 0, 0, 0, 0]).unwrap();
    assert_eq!(out, TrapOutcome::Completed { value: 4, errno: None });
    assert_eq!(bridge.space_mut().read_virtual(0x18000, 4).unwrap(), b"ping".to_vec());
    assert_eq!(invalidated(&bridge), BTreeSet::from([0x18000]));

    bridge.ecall(numbers::CLOSE, [rd, 0, 0, 0, 0, 0, 0]).unwrap();
    bridge.ecall(numbers::CLOSE, [wr, 0, 0, 0, 0, 0, 0]).unwrap();
}

/// Push 6000 bytes through a real pipe, reading into a buffer that spans two pages
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
fn pipe_across_pages(virtual_memory: bool) {
    let mut fds = [0i32; 2];
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
    let (rd, wr) = (fds[0] as u64, fds[1] as u64);

    let mut bridge = Bridge::with_gateway(config(virtual_memory), LinuxGateway).unwrap();
    let (src, dst) = (0x40_0800u64, 0x60_0800u64);
    let data: Vec<u8> = (0..6000u32).map(|i| (i % 251) as u8 + 1).collect();
    bridge.space_mut().write_virtual(src, &data).unwrap();

    let out = bridge.ecall(numbers::WRITE, [wr, src, 6000, 0, 0, 0, 0]).unwrap();
    assert_eq!(out, TrapOutcome::Completed { value: 6000, errno: None });
    let out = bridge.ecall(numbers::READ, [rd, dst, 6000, 0, 0, 0, 0]).unwrap();
    assert_eq!(out, TrapOutcome::Completed { value: 6000, errno: None });

    assert_eq!(bridge.space_mut().read_virtual(dst, 6000).unwrap(), data);
    assert_eq!(bridge.space_mut().read_virtual(dst + 6000, 16).unwrap(), vec![0; 16]);
    let expected: BTreeSet<u64> =
        (0..6000).step_by(64).map(|off| line_of(bridge.space_mut().translate(dst + off).unwrap())).collect();
    assert_eq!(expected.len(), 94);
    assert_eq!(invalidated(&bridge), expected);

    bridge.ecall(numbers::CLOSE, [rd, 0, 0, 0, 0, 0, 0]).unwrap();
    bridge.ecall(numbers::CLOSE, [wr, 0, 0, 0, 0, 0, 0]).unwrap();
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
#[test]
fn test_pipe_across_pages_identity() {
    pipe_across_pages(false);
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
#[test]
fn test_pipe_across_pages_paged() {
    pipe_across_pages(true);
}

#[test]
fn test_paging_without_host_mapping_rejected() {
    let cfg = BridgeConfig { host_mapping: false, ..config(true) };
    let gateway = Scatter { offsets: Vec::new(), calls: Vec::new() };
    assert!(Bridge::with_gateway(cfg, gateway).is_err());
}

#[test]
fn test_huge_writev_count_refused() {
    let gateway = Scatter { offsets: Vec::new(), calls: Vec::new() };
    let mut bridge = Bridge::with_gateway(config(true), gateway).unwrap();
    let out = bridge.ecall(numbers::WRITEV, [1, 0x5000_0000, 1 << 61, 0, 0, 0, 0]).unwrap();
    assert_eq!(out, TrapOutcome::Completed { value: -1, errno: Some(libc::EINVAL) });
    assert!(bridge.proxy().gateway().calls.is_empty());
    assert!(bridge.halted().is_none());
}

#[test]
fn test_tgkill_with_huge_signal_exits() {
    let gateway = Scatter { offsets: Vec::new(), calls: Vec::new() };
    let mut bridge = Bridge::with_gateway(config(true), gateway).unwrap();
    let out = bridge.ecall(numbers::TGKILL, [1, 1, i64::MAX as u64, 0, 0, 0, 0]).unwrap();
    assert_eq!(out, TrapOutcome::Exit { code: 255 });
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
#[test]
fn test_host_failure_mirrors_errno() {
    let mut bridge = Bridge::with_gateway(config(false), LinuxGateway).unwrap();
    bridge.proxy_mut().set_errno_address(Some(0x9000));
    let out = bridge.ecall(numbers::CLOSE, [u64::MAX >> 33, 0, 0, 0, 0, 0, 0]).unwrap();
    assert_eq!(out, TrapOutcome::Completed { value: -1, errno: Some(libc::EBADF) });
    assert_eq!(bridge.space().memory.read32(0x9000).unwrap(), libc::EBADF as u32);
    assert_eq!(invalidated(&bridge), BTreeSet::from([0x9000]));
}

#[test]
fn test_writev_gets_host_iovecs() {
    let gateway = Scatter { offsets: Vec::new(), calls: Vec::new() };
    let mut bridge = Bridge::with_gateway(config(true), gateway).unwrap();
    let iov = 0x5000_0000u64;
    let mut table = Vec::new();
    for (base, len) in [(0x5000_1000u64, 3u64), (0, 0), (0x5000_2000, 5)] {
        table.extend_from_slice(&base.to_le_bytes());
        table.extend_from_slice(&len.to_le_bytes());
    }
    bridge.space_mut().write_virtual(iov, &table).unwrap();
    bridge.ecall(numbers::WRITEV, [1, iov, 3, 0, 0, 0, 0]).unwrap();

    let (_, args) = bridge.proxy().gateway().calls[0];
    assert_ne!(args[1], iov);
    // guest memory still holds guest pointers
    let raw = bridge.space_mut().read_virtual(iov, 8).unwrap();
    assert_eq!(raw, 0x5000_1000u64.to_le_bytes().to_vec());
}
