//! RISC-V co-simulation bridge
//!
//! Host-side half of a co-simulation: serves a cycle-level pipeline model's
//! memory bus from a simulated physical memory, keeps a pending-write buffer
//! coherent with it, and proxies the guest's system calls to the host kernel
//! with address translation and cacheline invalidation.

pub mod address_space;
pub mod bus;
pub mod config;
pub mod devices;
pub mod error;
pub mod loader;
pub mod logger;
pub mod memory;
pub mod mmu;
pub mod pipeline;
pub mod snapshot;
pub mod syscall;
pub mod system;

pub use address_space::AddressSpace;
pub use config::BridgeConfig;
pub use error::{BridgeError, HaltReason, Result};
pub use pipeline::{run, HostServices, Pipeline, RunSummary};
pub use snapshot::BridgeSnapshot;
pub use syscall::{HostGateway, HostReturn, LinuxGateway, TrapOutcome};
pub use system::{Bridge, ResetVector};
