//! Scripted stand-in for the pipeline
//!
//! Replays a JSON list of bus requests and traps against the bridge. Used by
//! the command line driver and the integration tests in place of a compiled
//! RTL model.

use std::collections::VecDeque;

use log::debug;
use serde::{Deserialize, Serialize};

use super::{HostServices, Pipeline};
use crate::bus::tag::{self, MEMORY, MMIO};
use crate::bus::{BusPins, LINE_BEATS};
use crate::error::{BridgeError, Result};
use crate::syscall::TrapOutcome;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Step {
    /// Cacheline read; waits for all eight words
    Read { addr: u64, id: u8 },
    Write { addr: u64, id: u8, data: [u64; 8] },
    MmioRead { addr: u64, id: u8 },
    MmioWrite { addr: u64, id: u8, value: u64 },
    Ecall {
        number: u64,
        #[serde(default)]
        args: [u64; 7],
    },
    PendingWrite { addr: u64, value: u64, size: usize },
    FinishWrite { addr: u64, size: u64 },
    Idle { cycles: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Response {
    pub value: u64,
    pub tag: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EcallRecord {
    pub number: u64,
    pub outcome: TrapOutcome,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ScriptReport {
    /// Every response the bridge presented, in delivery order
    pub responses: Vec<Response>,
    pub ecalls: Vec<EcallRecord>,
    /// All steps ran (or the guest exited)
    pub completed: bool,
}

impl ScriptReport {
    /// Responses carrying `tag`, in delivery order
    pub fn values_for(&self, tag: u16) -> Vec<u64> {
        self.responses.iter().filter(|r| r.tag == tag).map(|r| r.value).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Start the next step
    Next,
    /// Request on the lines, not yet accepted
    Issuing,
    /// Sending write beat `beat`
    Beats { beat: usize },
    /// Waiting for `left` responses with `tag`
    Awaiting { tag: u16, left: u32 },
    Idle { left: u64 },
    Done,
}

pub struct ScriptedPipeline {
    steps: VecDeque<Step>,
    current: Option<Step>,
    state: State,
    report: ScriptReport,
}

impl ScriptedPipeline {
    pub fn new(steps: Vec<Step>) -> Self {
        ScriptedPipeline {
            steps: steps.into(),
            current: None,
            state: State::Next,
            report: ScriptReport::default(),
        }
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let steps: Vec<Step> =
            serde_json::from_str(text).map_err(|e| BridgeError::Script(format!("bad script: {}", e)))?;
        Ok(Self::new(steps))
    }

    pub fn report(&self) -> &ScriptReport {
        &self.report
    }

    pub fn into_report(self) -> ScriptReport {
        self.report
    }

    fn write_data(&self) -> Option<([u64; 8], usize)> {
        match self.current {
            Some(Step::Write { data, .. }) => Some((data, LINE_BEATS as usize)),
            Some(Step::MmioWrite { value, .. }) => Some(([value; 8], 1)),
            _ => None,
        }
    }

    /// The request on the lines was taken this edge
    fn accepted(&mut self, pins: &mut BusPins) {
        match self.current {
            Some(Step::Read { .. }) => {
                let tag = pins.req_tag;
                pins.release();
                self.state = State::Awaiting { tag, left: LINE_BEATS };
            }
            Some(Step::MmioRead { .. }) => {
                let tag = pins.req_tag;
                pins.release();
                self.state = State::Awaiting { tag, left: 1 };
            }
            Some(Step::Write { data, .. }) => {
                pins.req = data[0];
                self.state = State::Beats { beat: 0 };
            }
            Some(Step::MmioWrite { value, .. }) => {
                pins.req = value;
                self.state = State::Beats { beat: 0 };
            }
            _ => self.state = State::Next,
        }
    }

    fn start_next(&mut self, pins: &mut BusPins, host: &mut dyn HostServices) -> Result<()> {
        while self.state == State::Next {
            let Some(step) = self.steps.pop_front() else {
                pins.release();
                self.current = None;
                self.state = State::Done;
                self.report.completed = true;
                return Ok(());
            };
            debug!("script: {:?}", step);
            self.state = match step {
                Step::Read { addr, id } => {
                    pins.request(addr, tag::request(MEMORY, true, id));
                    State::Issuing
                }
                Step::Write { addr, id, .. } => {
                    pins.request(addr, tag::request(MEMORY, false, id));
                    State::Issuing
                }
                Step::MmioRead { addr, id } => {
                    pins.request(addr, tag::request(MMIO, true, id));
                    State::Issuing
                }
                Step::MmioWrite { addr, id, .. } => {
                    pins.request(addr, tag::request(MMIO, false, id));
                    State::Issuing
                }
                Step::Ecall { number, args } => {
                    pins.release();
                    let outcome = host.ecall(number, args)?;
                    self.report.ecalls.push(EcallRecord { number, outcome });
                    if let TrapOutcome::Exit { .. } = outcome {
                        self.steps.clear();
                        self.report.completed = true;
                        State::Done
                    } else {
                        State::Next
                    }
                }
                Step::PendingWrite { addr, value, size } => {
                    host.pending_write(addr, value, size)?;
                    State::Next
                }
                Step::FinishWrite { addr, size } => {
                    host.finish_write(addr, size);
                    State::Next
                }
                Step::Idle { cycles } => {
                    pins.release();
                    State::Idle { left: cycles }
                }
            };
            self.current = Some(step);
            // an Idle of zero cycles falls straight through
            if self.state == (State::Idle { left: 0 }) {
                self.state = State::Next;
            }
        }
        Ok(())
    }
}

impl Pipeline for ScriptedPipeline {
    fn eval(&mut self, _clk: bool, _pins: &mut BusPins, _host: &mut dyn HostServices) -> Result<()> {
        Ok(())
    }

    fn settle(&mut self, clk: bool, pins: &mut BusPins, host: &mut dyn HostServices) -> Result<()> {
        if !clk || pins.reset {
            return Ok(());
        }

        match self.state {
            State::Issuing if pins.req_ready => self.accepted(pins),
            State::Beats { beat } => {
                // beat `beat` went out on this edge
                if let Some((data, count)) = self.write_data() {
                    let next = beat + 1;
                    if next >= count {
                        pins.release();
                        self.state = State::Next;
                    } else {
                        pins.req = data[next];
                        self.state = State::Beats { beat: next };
                    }
                }
            }
            State::Idle { left } => {
                self.state = if left <= 1 { State::Next } else { State::Idle { left: left - 1 } };
            }
            _ => {}
        }

        if pins.resp_valid {
            let response = Response { value: pins.resp, tag: pins.resp_tag };
            self.report.responses.push(response);
            if let State::Awaiting { tag, left } = self.state {
                if response.tag == tag {
                    self.state = if left <= 1 { State::Next } else { State::Awaiting { tag, left: left - 1 } };
                }
            }
        }
        pins.resp_ready = pins.resp_valid;

        self.start_next(pins, host)
    }

    fn finished(&self) -> bool {
        self.state == State::Done
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_steps() {
        let text = r#"[
            {"op": "read", "addr": 4096, "id": 1},
            {"op": "mmio_write", "addr": 753664, "id": 0, "value": 65},
            {"op": "ecall", "number": 60, "args": [3, 0, 0, 0, 0, 0, 0]},
            {"op": "ecall", "number": 39},
            {"op": "idle", "cycles": 5}
        ]"#;
        let script = ScriptedPipeline::from_json(text).unwrap();
        assert_eq!(script.steps.len(), 5);
        assert_eq!(script.steps[0], Step::Read { addr: 4096, id: 1 });
        assert_eq!(script.steps[3], Step::Ecall { number: 39, args: [0; 7] });
    }

    #[test]
    fn test_rejects_unknown_op() {
        let text = r#"[{"op": "fence"}]"#;
        assert!(matches!(ScriptedPipeline::from_json(text), Err(BridgeError::Script(_))));
    }
}
