//! Text console
//!
//! An 80x25 grid of 16-bit cells (character in the low byte, VGA attribute
//! in the high byte) mirroring the MMIO window at `CONSOLE_BASE`, plus the
//! keyboard side: a polled key source, a scan-code queue and the pending
//! keyboard interrupt.

use std::collections::VecDeque;
use std::fmt::Write as _;

use crate::address_space::{CONSOLE_BASE, CONSOLE_SIZE};

pub const COLUMNS: usize = 80;
pub const ROWS: usize = 25;

/// VGA color index to ANSI color index
const VGA_TO_ANSI: [u8; 8] = [0, 4, 2, 6, 1, 5, 3, 7];

/// Something keys can be read from without blocking
pub trait KeyboardSource {
    fn poll_key(&mut self) -> Option<u8>;
}

/// Scripted key source
impl KeyboardSource for VecDeque<u8> {
    fn poll_key(&mut self) -> Option<u8> {
        self.pop_front()
    }
}

/// Non-blocking stdin reader
pub struct StdinKeyboard;

impl KeyboardSource for StdinKeyboard {
    fn poll_key(&mut self) -> Option<u8> {
        let mut fds = libc::pollfd { fd: libc::STDIN_FILENO, events: libc::POLLIN, revents: 0 };
        // SAFETY: one valid pollfd, zero timeout.
        let ready = unsafe { libc::poll(&mut fds, 1, 0) };
        if ready <= 0 || fds.revents & libc::POLLIN == 0 {
            return None;
        }
        let mut byte = 0u8;
        // SAFETY: reading one byte into a local.
        let n = unsafe { libc::read(libc::STDIN_FILENO, (&mut byte as *mut u8).cast(), 1) };
        (n == 1).then_some(byte)
    }
}

pub struct TextConsole {
    cells: Vec<u16>,
    /// Render cell updates as ANSI output
    enabled: bool,
    output: String,
    keyboard: Option<Box<dyn KeyboardSource>>,
    keys: VecDeque<u8>,
    irq_pending: bool,
}

impl TextConsole {
    pub fn new(enabled: bool) -> Self {
        TextConsole {
            cells: vec![0; COLUMNS * ROWS],
            enabled,
            output: String::new(),
            keyboard: None,
            keys: VecDeque::new(),
            irq_pending: false,
        }
    }

    pub fn with_keyboard(mut self, keyboard: Box<dyn KeyboardSource>) -> Self {
        self.keyboard = Some(keyboard);
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn contains(addr: u64) -> bool {
        addr >= CONSOLE_BASE && addr < CONSOLE_BASE + CONSOLE_SIZE
    }

    pub fn cell(&self, row: usize, col: usize) -> u16 {
        self.cells[row * COLUMNS + col]
    }

    /// Row `row` as text, trailing blanks trimmed
    pub fn row_text(&self, row: usize) -> String {
        let line: String = self.cells[row * COLUMNS..(row + 1) * COLUMNS]
            .iter()
            .map(|&c| match (c & 0xff) as u8 {
                0 => ' ',
                ch => ch as char,
            })
            .collect();
        line.trim_end().to_string()
    }

    /// Apply one 8-byte MMIO beat written at physical `addr`: four cells
    pub fn write_beat(&mut self, addr: u64, value: u64) {
        if !Self::contains(addr) {
            return;
        }
        let first = ((addr - CONSOLE_BASE) / 2) as usize;
        for i in 0..4 {
            let idx = first + i;
            if idx >= self.cells.len() {
                break;
            }
            let cell = (value >> (16 * i)) as u16;
            self.cells[idx] = cell;
            if self.enabled {
                self.render_cell(idx, cell);
            }
        }
    }

    fn render_cell(&mut self, idx: usize, cell: u16) {
        let (row, col) = (idx / COLUMNS, idx % COLUMNS);
        let attr = (cell >> 8) as u8;
        let fg = VGA_TO_ANSI[(attr & 7) as usize];
        let bg = VGA_TO_ANSI[((attr >> 4) & 7) as usize];
        let bold = if attr & 0x08 != 0 { "1;" } else { "" };
        let ch = match (cell & 0xff) as u8 {
            c @ 0x20..=0x7e => c as char,
            _ => ' ',
        };
        let _ = write!(self.output, "\x1b[{};{}H\x1b[{}3{};4{}m{}\x1b[0m", row + 1, col + 1, bold, fg, bg, ch);
    }

    /// Drain rendered escape output
    pub fn take_output(&mut self) -> String {
        std::mem::take(&mut self.output)
    }

    /// Poll the key source once. Returns true when a keyboard interrupt
    /// should be raised; later keys queue behind the pending one.
    pub fn poll_keyboard(&mut self) -> bool {
        let key = match self.keyboard.as_mut().and_then(|k| k.poll_key()) {
            Some(key) => key,
            None => return false,
        };
        self.keys.push_back(key);
        if self.irq_pending {
            return false;
        }
        self.irq_pending = true;
        true
    }

    pub fn irq_pending(&self) -> bool {
        self.irq_pending
    }

    pub fn queued_keys(&self) -> usize {
        self.keys.len()
    }

    /// Guest acknowledged the keyboard interrupt: hand over the next scan code
    pub fn acknowledge(&mut self) -> Option<u8> {
        self.irq_pending = false;
        self.keys.pop_front()
    }
}
