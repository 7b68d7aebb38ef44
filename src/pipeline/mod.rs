//! Pipeline side of the co-simulation
//!
//! The pipeline is an opaque clocked device: it sees the bus pins and may
//! call back into the bridge for traps and pending writes. `run` drives the
//! clock the way an RTL testbench does: toggle, evaluate, let the bridge
//! react, evaluate again.

pub mod script;

use log::info;

use crate::bus::BusPins;
use crate::error::{HaltReason, Result};
use crate::syscall::{HostGateway, TrapOutcome};
use crate::system::{Bridge, ResetVector};

/// Edges with reset asserted before the run starts
pub const RESET_TICKS: usize = 3;

/// Entry points the bridge offers the pipeline
pub trait HostServices {
    fn ecall(&mut self, number: u64, args: [u64; 7]) -> Result<TrapOutcome>;
    fn pending_write(&mut self, addr: u64, value: u64, size: usize) -> Result<()>;
    fn finish_write(&mut self, addr: u64, size: u64);
}

impl<G: HostGateway> HostServices for Bridge<G> {
    fn ecall(&mut self, number: u64, args: [u64; 7]) -> Result<TrapOutcome> {
        Bridge::ecall(self, number, args)
    }

    fn pending_write(&mut self, addr: u64, value: u64, size: usize) -> Result<()> {
        Bridge::pending_write(self, addr, value, size)
    }

    fn finish_write(&mut self, addr: u64, size: u64) {
        Bridge::finish_write(self, addr, size)
    }
}

pub trait Pipeline {
    /// Sample the reset registers
    fn reset(&mut self, _vector: &ResetVector) {}

    /// The clock just changed; bridge outputs still show the previous edge
    fn eval(&mut self, clk: bool, pins: &mut BusPins, host: &mut dyn HostServices) -> Result<()>;

    /// The bridge has reacted to this edge
    fn settle(&mut self, clk: bool, pins: &mut BusPins, host: &mut dyn HostServices) -> Result<()>;

    fn finished(&self) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    /// Rising edges after reset
    pub cycles: u64,
    pub halt: Option<HaltReason>,
}

fn edge<G: HostGateway>(bridge: &mut Bridge<G>, pipeline: &mut dyn Pipeline, pins: &mut BusPins, clk: bool) -> Result<()> {
    pipeline.eval(clk, pins, bridge)?;
    bridge.tick(clk, pins)?;
    pipeline.settle(clk, pins, bridge)
}

/// Reset, then clock until the pipeline finishes, the guest exits or
/// `max_cycles` rising edges have passed.
pub fn run<G: HostGateway>(bridge: &mut Bridge<G>, pipeline: &mut dyn Pipeline, max_cycles: u64) -> Result<RunSummary> {
    let mut pins = BusPins { reset: true, ..BusPins::default() };
    pipeline.reset(&bridge.reset_vector());

    let mut clk = false;
    for _ in 0..RESET_TICKS {
        clk = !clk;
        edge(bridge, pipeline, &mut pins, clk)?;
    }
    pins.reset = false;

    let mut cycles = 0;
    while cycles < max_cycles && !pipeline.finished() && bridge.halted().is_none() {
        clk = !clk;
        if let Err(err) = edge(bridge, pipeline, &mut pins, clk) {
            // bridge faults are already recorded as the halt reason
            if bridge.halted().is_none() {
                return Err(err);
            }
            break;
        }
        if clk {
            cycles += 1;
        }
    }

    let halt = bridge.halted().cloned();
    info!("run ended after {} cycles ({})", cycles, halt.as_ref().map_or("running".to_string(), |h| h.to_string()));
    Ok(RunSummary { cycles, halt })
}
