//! Bus transaction state machine
//!
//! Driven once per clock edge. The falling edge only publishes request
//! readiness; the rising edge advances the timing model, delivers at most one
//! response and services at most one request or write beat.

use std::collections::{BTreeMap, VecDeque};

use log::{trace, warn};

use super::model::{Completion, TimingModel};
use super::tag::{self, IDLE_TAG, IDLE_VALUE, INVALIDATE, IRQ, IRQ_KEYBOARD, MEMORY, MMIO};
use super::BusPins;
use crate::address_space::AddressSpace;
use crate::devices::console::TextConsole;
use crate::error::{BridgeError, Result};
use crate::memory::{line_of, LINE_SIZE};

/// Beats in one cacheline transfer
pub const LINE_BEATS: u32 = (LINE_SIZE / 8) as u32;

pub struct BusController {
    /// (value, tag) pairs waiting to be delivered
    responses: VecDeque<(u64, u16)>,
    /// Head of `responses` is on the response lines
    head_presented: bool,
    /// Read requests in flight: line address -> (requested address, tag)
    outstanding: BTreeMap<u64, (u64, u16)>,
    remaining: u32,
    xfer_addr: u64,
    xfer_class: u8,
    cycles: u64,
    poll_period: u64,
    dropped: u64,
}

impl BusController {
    pub fn new(poll_period: u64) -> Self {
        BusController {
            responses: VecDeque::new(),
            head_presented: false,
            outstanding: BTreeMap::new(),
            remaining: 0,
            xfer_addr: 0,
            xfer_class: 0,
            cycles: 0,
            poll_period: poll_period.max(1),
            dropped: 0,
        }
    }

    pub fn pending_responses(&self) -> usize {
        self.responses.len()
    }

    pub fn responses(&self) -> impl Iterator<Item = &(u64, u16)> {
        self.responses.iter()
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    pub fn remaining_beats(&self) -> u32 {
        self.remaining
    }

    /// Requests dropped because their line was already outstanding
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Tell the pipeline that physical line `addr` changed behind its back.
    /// Goes ahead of everything not yet on the response lines.
    pub fn invalidate(&mut self, addr: u64) {
        let line = line_of(addr);
        trace!("invalidate {:#x}", line);
        let at = usize::from(self.head_presented).min(self.responses.len());
        self.responses.insert(at, (line, tag::response(INVALIDATE)));
    }

    pub fn tick(
        &mut self,
        clk: bool,
        pins: &mut BusPins,
        model: &mut dyn TimingModel,
        space: &mut AddressSpace,
        console: &mut TextConsole,
    ) -> Result<()> {
        if pins.reset && pins.req_valid {
            warn!("request presented during reset, ignoring");
            return Ok(());
        }

        if !clk {
            if pins.req_valid {
                if self.remaining > 0 {
                    // mid-transfer the earlier answer has to stand
                    if !pins.req_ready {
                        return Err(BridgeError::ReadyDroppedMidTransfer);
                    }
                } else {
                    pins.req_ready = model.will_accept();
                }
            }
            return Ok(());
        }

        if self.cycles % self.poll_period == 0 && console.poll_keyboard() {
            self.responses.push_back((IRQ_KEYBOARD, tag::response(IRQ)));
        }
        self.cycles += 1;

        for completion in model.advance_one_cycle() {
            self.complete(completion, space)?;
        }

        if self.head_presented && pins.resp_ready {
            self.responses.pop_front();
        }
        match self.responses.front() {
            Some(&(value, tag)) => {
                pins.resp_valid = true;
                pins.resp = value;
                pins.resp_tag = tag;
                self.head_presented = true;
            }
            None => {
                pins.resp_valid = false;
                pins.resp = IDLE_VALUE;
                pins.resp_tag = IDLE_TAG;
                self.head_presented = false;
            }
        }

        if !pins.req_valid {
            pins.req_ready = false;
            self.remaining = 0;
            return Ok(());
        }

        if self.remaining > 0 {
            return self.write_beat(pins.req, space, console);
        }
        if !pins.req_ready {
            // refused on the falling edge; the pipeline keeps holding it
            return Ok(());
        }

        let class = tag::class(pins.req_tag);
        let is_write = tag::is_write(pins.req_tag);
        match class {
            MEMORY => {
                let line = line_of(pins.req);
                let limit = space.memory.size();
                if line + LINE_SIZE > limit {
                    return Err(BridgeError::OutOfRange { addr: pins.req, limit });
                }
                self.xfer_addr = line;
                self.xfer_class = MEMORY;
                self.remaining = if is_write { LINE_BEATS } else { 0 };
                if self.outstanding.contains_key(&line) {
                    warn!("access for {:#x} already outstanding, ignoring", line);
                    self.dropped += 1;
                    return Ok(());
                }
                if !model.add_transaction(is_write, line) {
                    return Err(BridgeError::TransactionRejected { addr: line });
                }
                trace!("{} {:#x} tag {:#06x}", if is_write { "write" } else { "read" }, line, pins.req_tag);
                if !is_write {
                    self.outstanding.insert(line, (pins.req, pins.req_tag));
                }
            }
            MMIO => {
                if pins.req & 7 != 0 {
                    return Err(BridgeError::Misaligned { addr: pins.req });
                }
                self.xfer_addr = pins.req;
                self.xfer_class = MMIO;
                if is_write {
                    self.remaining = 1;
                } else {
                    self.remaining = 0;
                    let value = space.memory.read64(pins.req)?;
                    self.responses.push_back((value, pins.req_tag));
                }
            }
            _ => return Err(BridgeError::UnknownCommand { class, tag: pins.req_tag }),
        }
        Ok(())
    }

    fn write_beat(&mut self, value: u64, space: &mut AddressSpace, console: &mut TextConsole) -> Result<()> {
        match self.xfer_class {
            MEMORY => {
                let addr = self.xfer_addr + u64::from(LINE_BEATS - self.remaining) * 8;
                space.memory.write64(addr, value)?;
            }
            _ => {
                space.memory.write64(self.xfer_addr, value)?;
                console.write_beat(self.xfer_addr, value);
            }
        }
        self.remaining -= 1;
        Ok(())
    }

    fn complete(&mut self, completion: Completion, space: &mut AddressSpace) -> Result<()> {
        match completion {
            Completion::Read(line) => {
                let (addr, tag) = self
                    .outstanding
                    .remove(&line)
                    .ok_or(BridgeError::UnexpectedCompletion { addr: line })?;
                // critical word first, wrapping inside the line
                let first = (addr & (LINE_SIZE - 1)) / 8;
                for i in 0..u64::from(LINE_BEATS) {
                    let word = (first + i) % u64::from(LINE_BEATS);
                    let value = space.memory.read64(line + word * 8)?;
                    self.responses.push_back((value, tag));
                }
            }
            Completion::Write(line) => space.pending.commit(line, LINE_SIZE),
        }
        Ok(())
    }
}
