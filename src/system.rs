//! Bridge orchestrator
//!
//! Owns the address space, the bus state machine, the console, the timing
//! model and the syscall proxy, and offers the pipeline its two entry
//! points: clock edges (`tick`) and traps (`ecall`).

use std::collections::BTreeMap;
use std::io::Write;

use log::{error, info};
use serde::{Deserialize, Serialize};

use crate::address_space::AddressSpace;
use crate::bus::{BusController, BusPins, FixedLatencyModel, TimingModel};
use crate::config::BridgeConfig;
use crate::devices::console::{StdinKeyboard, TextConsole};
use crate::error::{BridgeError, HaltReason, Result};
use crate::loader::{self, LoadedImage, STACK_PAGES};
use crate::memory::PAGE_SIZE;
use crate::snapshot::{BridgeSnapshot, SNAPSHOT_VERSION};
use crate::syscall::{HostGateway, LinuxGateway, SyscallProxy, TrapOutcome};

/// Registers the pipeline samples at reset
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResetVector {
    pub entry: u64,
    pub stack_pointer: u64,
    pub page_table_root: u64,
}

pub struct Bridge<G: HostGateway = LinuxGateway> {
    config: BridgeConfig,
    space: AddressSpace,
    bus: BusController,
    console: TextConsole,
    model: Box<dyn TimingModel>,
    proxy: SyscallProxy<G>,
    reset: ResetVector,
    halted: Option<HaltReason>,
}

impl Bridge<LinuxGateway> {
    /// Bridge forwarding to the running kernel
    pub fn new(config: BridgeConfig) -> Result<Self> {
        Self::with_gateway(config, LinuxGateway)
    }
}

impl<G: HostGateway> Bridge<G> {
    pub fn with_gateway(config: BridgeConfig, gateway: G) -> Result<Self> {
        let top = config.guest_space_top();
        let stack_pointer = top
            .checked_sub(config.stack_offset)
            .filter(|&sp| sp > STACK_PAGES * PAGE_SIZE)
            .ok_or_else(|| BridgeError::InvalidConfig(format!("stack offset {:#x} leaves no stack", config.stack_offset)))?;

        let space = AddressSpace::new(&config)?;
        let mut console = TextConsole::new(config.console);
        if config.console {
            console = console.with_keyboard(Box::new(StdinKeyboard));
        }
        let mut proxy = SyscallProxy::new(gateway, config.guard_window as u64);
        proxy.set_heap_limit(stack_pointer - STACK_PAGES * PAGE_SIZE);

        let reset = ResetVector { entry: 0, stack_pointer, page_table_root: space.mmu.root() };
        info!(
            "bridge: {} MiB memory, paging {}, host mapping {}",
            config.ram_size >> 20,
            if config.virtual_memory { "on" } else { "off" },
            if space.mmu.host_mapping().is_some() { "on" } else { "off" }
        );

        Ok(Bridge {
            bus: BusController::new(config.cycles_per_ms()),
            model: Box::new(FixedLatencyModel::new(config.memory_latency, config.memory_queue_depth)),
            console,
            space,
            proxy,
            reset,
            halted: None,
            config,
        })
    }

    /// Replace the built-in timing model
    pub fn set_timing_model(&mut self, model: Box<dyn TimingModel>) {
        self.model = model;
    }

    pub fn set_console(&mut self, console: TextConsole) {
        self.console = console;
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn space(&self) -> &AddressSpace {
        &self.space
    }

    pub fn space_mut(&mut self) -> &mut AddressSpace {
        &mut self.space
    }

    pub fn bus(&self) -> &BusController {
        &self.bus
    }

    pub fn console(&self) -> &TextConsole {
        &self.console
    }

    pub fn proxy(&self) -> &SyscallProxy<G> {
        &self.proxy
    }

    pub fn proxy_mut(&mut self) -> &mut SyscallProxy<G> {
        &mut self.proxy
    }

    pub fn reset_vector(&self) -> ResetVector {
        self.reset
    }

    pub fn halted(&self) -> Option<&HaltReason> {
        self.halted.as_ref()
    }

    /// Load a (possibly compressed) ELF image; sets entry point, heap start and errno mirror
    pub fn load_image(&mut self, image: &[u8]) -> Result<LoadedImage> {
        let loaded = loader::load_image(&mut self.space, image)?;
        self.reset.entry = loaded.entry;
        self.proxy.set_heap_cursor(loaded.image_end);
        self.proxy.set_errno_address(loaded.errno_address);
        info!("entry {:#x}, heap at {:#x}", loaded.entry, loaded.image_end);
        Ok(loaded)
    }

    /// Write argc/argv at the initial stack pointer
    pub fn setup_stack(&mut self, args: &[String]) -> Result<()> {
        loader::setup_stack(&mut self.space, self.reset.stack_pointer, args)
    }

    fn check_running(&self) -> Result<()> {
        match self.halted {
            Some(_) => Err(BridgeError::Halted),
            None => Ok(()),
        }
    }

    fn fatal(&mut self, err: BridgeError) -> BridgeError {
        error!("halting: {}", err);
        self.halted = Some(HaltReason::Fatal(err.to_string()));
        err
    }

    /// One clock edge on the bus
    pub fn tick(&mut self, clk: bool, pins: &mut BusPins) -> Result<()> {
        self.check_running()?;
        let result = self
            .bus
            .tick(clk, pins, self.model.as_mut(), &mut self.space, &mut self.console);
        if let Err(err) = result {
            return Err(self.fatal(err));
        }
        if self.console.is_enabled() {
            let out = self.console.take_output();
            if !out.is_empty() {
                let mut stdout = std::io::stdout().lock();
                stdout.write_all(out.as_bytes())?;
                stdout.flush()?;
            }
        }
        Ok(())
    }

    /// A trap from the pipeline
    pub fn ecall(&mut self, number: u64, args: [u64; 7]) -> Result<TrapOutcome> {
        self.check_running()?;
        match self.proxy.handle_trap(&mut self.space, &mut self.bus, number, args) {
            Ok(TrapOutcome::Exit { code }) => {
                info!("guest exited with {}", code);
                self.halted = Some(HaltReason::Exit(code));
                Ok(TrapOutcome::Exit { code })
            }
            Ok(outcome) => Ok(outcome),
            Err(err) => Err(self.fatal(err)),
        }
    }

    /// The pipeline started a write whose data is known now but lands later
    pub fn pending_write(&mut self, addr: u64, value: u64, size: usize) -> Result<()> {
        self.space.pending.record(&mut self.space.memory, addr, value, size)
    }

    /// A write recorded with `pending_write` has landed
    pub fn finish_write(&mut self, addr: u64, size: u64) {
        self.space.pending.commit(addr, size);
    }

    pub fn acknowledge_keyboard(&mut self) -> Option<u8> {
        self.console.acknowledge()
    }

    pub fn create_snapshot(&self) -> Result<BridgeSnapshot> {
        let mem = &self.space.memory;
        let mut pages = BTreeMap::new();
        for frame in 0..mem.size() / PAGE_SIZE {
            let bytes = mem.bytes(frame * PAGE_SIZE, PAGE_SIZE)?;
            if bytes.iter().any(|&b| b != 0) {
                pages.insert(frame, bytes.to_vec());
            }
        }
        Ok(BridgeSnapshot {
            version: SNAPSHOT_VERSION,
            ram_size: mem.size(),
            virtual_memory: self.space.mmu.is_enabled(),
            reset: self.reset,
            heap_cursor: self.proxy.heap_cursor(),
            errno_address: self.proxy.errno_address(),
            allocator: self.space.mmu.allocator().bitmap().to_vec(),
            pages,
            pending: self.space.pending.iter().collect(),
        })
    }

    /// Restore into this bridge, which must be fresh and of the same shape
    pub fn restore_snapshot(&mut self, snapshot: &BridgeSnapshot) -> Result<()> {
        if snapshot.ram_size != self.space.memory.size() || snapshot.virtual_memory != self.space.mmu.is_enabled() {
            return Err(BridgeError::Snapshot(format!(
                "snapshot is for {:#x} bytes (paging {}), bridge has {:#x} bytes (paging {})",
                snapshot.ram_size,
                snapshot.virtual_memory,
                self.space.memory.size(),
                self.space.mmu.is_enabled()
            )));
        }
        let space = &mut self.space;
        let in_use: Vec<u64> = space.mmu.allocator().allocated().collect();
        for frame in in_use {
            space.memory.clear_page(frame)?;
        }
        for (&frame, data) in &snapshot.pages {
            if data.len() as u64 != PAGE_SIZE {
                return Err(BridgeError::Snapshot(format!("page {:#x} has {} bytes", frame, data.len())));
            }
            space.memory.load_binary(data, frame * PAGE_SIZE)?;
        }
        space.mmu.allocator_mut().restore_bitmap(&snapshot.allocator)?;
        space.mmu.set_root(snapshot.reset.page_table_root);
        space.mmu.rebind_all(&space.memory)?;

        space.pending.clear();
        for &(addr, value) in &snapshot.pending {
            space.pending.record_bytes(&mut space.memory, addr, &[value])?;
        }

        self.proxy.set_heap_cursor(snapshot.heap_cursor);
        self.proxy.set_errno_address(snapshot.errno_address);
        self.reset = snapshot.reset;
        self.halted = None;
        info!("restored {} pages", snapshot.pages.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syscall::HostReturn;

    struct Quiet;

    impl HostGateway for Quiet {
        fn syscall(&mut self, _number: u64, _args: [u64; 7]) -> HostReturn {
            HostReturn::ok(0)
        }
    }

    fn bridge() -> Bridge<Quiet> {
        let config = BridgeConfig {
            ram_size: 8 << 20,
            virtual_address_bits: 32,
            page_seed: Some(2),
            ..BridgeConfig::default()
        };
        Bridge::with_gateway(config, Quiet).unwrap()
    }

    #[test]
    fn test_reset_vector() {
        let b = bridge();
        let rv = b.reset_vector();
        assert_eq!(rv.stack_pointer, (8 << 20) - (4 << 20));
        assert_eq!(rv.page_table_root, b.space().mmu.root());
        assert_eq!(rv.page_table_root % PAGE_SIZE, 0);
    }

    #[test]
    fn test_exit_halts() {
        let mut b = bridge();
        let out = b.ecall(crate::syscall::numbers::EXIT, [7, 0, 0, 0, 0, 0, 0]).unwrap();
        assert_eq!(out, TrapOutcome::Exit { code: 7 });
        assert_eq!(b.halted(), Some(&HaltReason::Exit(7)));
        let mut pins = BusPins::default();
        assert!(matches!(b.tick(true, &mut pins), Err(BridgeError::Halted)));
    }

    #[test]
    fn test_fatal_error_halts() {
        let mut b = bridge();
        assert!(b.ecall(crate::syscall::numbers::EXECVE, [0; 7]).is_err());
        assert!(matches!(b.halted(), Some(HaltReason::Fatal(_))));
        assert!(matches!(b.ecall(39, [0; 7]), Err(BridgeError::Halted)));
    }

    #[test]
    fn test_pending_write_entry_points() {
        let mut b = bridge();
        b.pending_write(0x2000, 0xbeef, 2).unwrap();
        assert_eq!(b.space().pending.len(), 2);
        b.finish_write(0x2000, 64);
        assert!(b.space().pending.is_empty());
    }

    #[test]
    fn test_pending_write_beyond_memory_rejected() {
        let mut b = bridge();
        let err = b.pending_write((8 << 20) + 0x100, 0xff, 8);
        assert!(matches!(err, Err(BridgeError::OutOfRange { .. })));
        assert!(b.space().pending.is_empty());
    }

    #[test]
    fn test_rejects_oversized_stack_offset() {
        let config = BridgeConfig {
            ram_size: 1 << 20,
            virtual_address_bits: 32,
            ..BridgeConfig::default()
        };
        assert!(matches!(Bridge::with_gateway(config, Quiet), Err(BridgeError::InvalidConfig(_))));
    }
}
