//! Memory timing model interface
//!
//! The timing model decides when a transaction on a 64-byte line completes.
//! Completions are handed back from `advance_one_cycle` rather than through
//! callbacks, so the controller stays the only owner of bridge state.

use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Read(u64),
    Write(u64),
}

impl Completion {
    pub fn addr(&self) -> u64 {
        match *self {
            Completion::Read(a) | Completion::Write(a) => a,
        }
    }
}

pub trait TimingModel {
    /// Whether a new transaction would be accepted this cycle
    fn will_accept(&self) -> bool;

    /// Submit a transaction for the line at `addr`; false if refused
    fn add_transaction(&mut self, is_write: bool, addr: u64) -> bool;

    /// Advance one clock and report transactions that completed on it
    fn advance_one_cycle(&mut self) -> Vec<Completion>;
}

/// In-order model: every transaction completes `latency` cycles after submission
pub struct FixedLatencyModel {
    latency: u64,
    depth: usize,
    cycle: u64,
    queue: VecDeque<(u64, Completion)>,
    accepted: u64,
}

impl FixedLatencyModel {
    pub fn new(latency: u64, depth: usize) -> Self {
        FixedLatencyModel {
            latency,
            depth: depth.max(1),
            cycle: 0,
            queue: VecDeque::new(),
            accepted: 0,
        }
    }

    pub fn in_flight(&self) -> usize {
        self.queue.len()
    }

    pub fn accepted(&self) -> u64 {
        self.accepted
    }
}

impl TimingModel for FixedLatencyModel {
    fn will_accept(&self) -> bool {
        self.queue.len() < self.depth
    }

    fn add_transaction(&mut self, is_write: bool, addr: u64) -> bool {
        if !self.will_accept() {
            return false;
        }
        let done = if is_write { Completion::Write(addr) } else { Completion::Read(addr) };
        self.queue.push_back((self.cycle + self.latency, done));
        self.accepted += 1;
        true
    }

    fn advance_one_cycle(&mut self) -> Vec<Completion> {
        self.cycle += 1;
        let mut done = Vec::new();
        while let Some(&(due, completion)) = self.queue.front() {
            if due > self.cycle {
                break;
            }
            self.queue.pop_front();
            done.push(completion);
        }
        done
    }
}
