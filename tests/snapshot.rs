use simbridge::{Bridge, BridgeConfig, BridgeSnapshot, HostGateway, HostReturn};

struct Quiet;

impl HostGateway for Quiet {
    fn syscall(&mut self, _number: u64, _args: [u64; 7]) -> HostReturn {
        HostReturn::ok(0)
    }
}

fn config(seed: u64) -> BridgeConfig {
    BridgeConfig {
        ram_size: 16 << 20,
        virtual_memory: true,
        host_mapping: true,
        virtual_address_bits: 32,
        page_seed: Some(seed),
        stack_offset: 1 << 20,
        ..BridgeConfig::default()
    }
}

fn populated() -> Bridge<Quiet> {
    let mut b = Bridge::with_gateway(config(1), Quiet).unwrap();
    b.space_mut().write_virtual(0x1_0000, b"hello snapshot").unwrap();
    b.space_mut().write_virtual(0x7f0_0ff8, &[0xee; 16]).unwrap();
    let paddr = b.space_mut().translate(0x1_0020).unwrap();
    b.pending_write(paddr, 0x99, 1).unwrap();
    b.proxy_mut().set_heap_cursor(0x40_0000);
    b.proxy_mut().set_errno_address(Some(0x1_0100));
    b
}

#[test]
fn test_restore_into_fresh_bridge() {
    let a = populated();
    let bytes = a.create_snapshot().unwrap().to_bytes().unwrap();
    let snap = BridgeSnapshot::from_bytes(&bytes).unwrap();

    let mut b = Bridge::with_gateway(config(2), Quiet).unwrap();
    b.restore_snapshot(&snap).unwrap();

    assert_eq!(b.reset_vector(), a.reset_vector());
    assert_eq!(b.space().mmu.root(), a.space().mmu.root());
    assert_eq!(b.proxy().heap_cursor(), 0x40_0000);
    assert_eq!(b.proxy().errno_address(), Some(0x1_0100));
    assert_eq!(b.space_mut().read_virtual(0x1_0000, 14).unwrap(), b"hello snapshot".to_vec());
    assert_eq!(b.space_mut().read_virtual(0x7f0_0ff8, 16).unwrap(), vec![0xee; 16]);
    assert_eq!(b.space_mut().read_virtual(0x1_0020, 1).unwrap(), vec![0x99]);
    assert_eq!(b.space().pending.len(), 1);
    assert_eq!(b.space().mmu.allocator().bitmap(), a.space().mmu.allocator().bitmap());
}

#[test]
fn test_restore_rebinds_host_mapping() {
    let a = populated();
    let snap = a.create_snapshot().unwrap();

    let mut b = Bridge::with_gateway(config(3), Quiet).unwrap();
    b.restore_snapshot(&snap).unwrap();

    let host = b.space_mut().host_address(0x1_0000).unwrap();
    let seen = unsafe { std::slice::from_raw_parts(host as *const u8, 5) };
    assert_eq!(seen, b"hello");
}

#[test]
fn test_shape_mismatch_rejected() {
    let a = populated();
    let snap = a.create_snapshot().unwrap();
    let other = BridgeConfig { ram_size: 32 << 20, ..config(1) };
    let mut b = Bridge::with_gateway(other, Quiet).unwrap();
    assert!(b.restore_snapshot(&snap).is_err());
}
