//! Bridge configuration

use serde::{Serialize, Deserialize};

pub const KILO: u64 = 1024;
pub const MEGA: u64 = 1024 * 1024;
pub const GIGA: u64 = 1024 * 1024 * 1024;

/// Bridge configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Physical memory size in bytes
    pub ram_size: u64,
    /// Walk the software page table; off means identity translation
    pub virtual_memory: bool,
    /// Bind guest pages into a host reservation so guest pointers can be handed to the kernel
    pub host_mapping: bool,
    /// Size of the host reservation as a power of two
    pub virtual_address_bits: u8,
    /// Bytes snapshotted and diffed around each syscall pointer argument
    pub guard_window: usize,
    /// Pending-write entries kept before forced eviction
    pub pending_write_capacity: usize,
    /// Seed for physical page selection (None = entropy)
    pub page_seed: Option<u64>,
    /// Initial stack pointer sits this far below the top of the guest space
    pub stack_offset: u64,
    /// Render the MMIO text window and poll the keyboard
    pub console: bool,
    /// Picoseconds per clock cycle
    pub clock_ps: u64,
    /// Cycles the built-in timing model takes per transaction
    pub memory_latency: u64,
    /// Transactions the built-in timing model keeps in flight
    pub memory_queue_depth: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        BridgeConfig {
            ram_size: GIGA,
            virtual_memory: true,
            host_mapping: true,
            virtual_address_bits: 39,
            guard_window: 10 * KILO as usize,
            pending_write_capacity: 1_000_000,
            page_seed: None,
            stack_offset: 4 * MEGA,
            console: false,
            clock_ps: 500,
            memory_latency: 40,
            memory_queue_depth: 32,
        }
    }
}

impl BridgeConfig {
    /// Cycles per simulated millisecond (keyboard poll period)
    pub fn cycles_per_ms(&self) -> u64 {
        (1_000_000_000 / self.clock_ps.max(1)).max(1)
    }

    /// Highest guest address + 1 the guest may use for its stack
    pub fn guest_space_top(&self) -> u64 {
        self.ram_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_clock() {
        let cfg = BridgeConfig::default();
        // 500ps clock = 2GHz
        assert_eq!(cfg.cycles_per_ms(), 2_000_000);
        assert_eq!(cfg.guest_space_top() - cfg.stack_offset, GIGA - 4 * MEGA);
    }
}
