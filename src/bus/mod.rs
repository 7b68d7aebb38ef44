//! Pipeline bus
//!
//! Signals shared with the pipeline, the timing model interface and the
//! transaction state machine that sits between them.

pub mod controller;
pub mod model;
pub mod tag;

pub use controller::{BusController, LINE_BEATS};
pub use model::{Completion, FixedLatencyModel, TimingModel};

/// Bus signals as seen from the bridge side. `req_ready`, `resp_valid`,
/// `resp` and `resp_tag` are driven by the bridge; the rest by the pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusPins {
    pub reset: bool,
    pub req_valid: bool,
    pub req: u64,
    pub req_tag: u16,
    pub req_ready: bool,
    pub resp_valid: bool,
    pub resp: u64,
    pub resp_tag: u16,
    pub resp_ready: bool,
}

impl BusPins {
    pub fn request(&mut self, value: u64, tag: u16) {
        self.req_valid = true;
        self.req = value;
        self.req_tag = tag;
    }

    pub fn release(&mut self) {
        self.req_valid = false;
    }
}
