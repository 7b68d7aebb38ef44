//! Bus request tags
//!
//! A tag is opaque to the bridge except for the command class in bits
//! `[8..12)` and the direction bit 12 (1 = read, 0 = write).

pub const CLASS_SHIFT: u32 = 8;
pub const READ_BIT: u16 = 1 << 12;

/// Command classes
pub const MEMORY: u8 = 0b0001;
pub const MMIO: u8 = 0b0011;
pub const INVALIDATE: u8 = 0b1000;
pub const IRQ: u8 = 0b1110;

/// Interrupt numbers carried in IRQ responses
pub const IRQ_TIMER: u64 = 0;
pub const IRQ_KEYBOARD: u64 = 1;

/// Response lines while the FIFO is empty
pub const IDLE_VALUE: u64 = 0xaaaa_aaaa_aaaa_aaaa;
pub const IDLE_TAG: u16 = 0xaaaa;

#[inline]
pub fn class(tag: u16) -> u8 {
    ((tag >> CLASS_SHIFT) & 0xf) as u8
}

#[inline]
pub fn is_read(tag: u16) -> bool {
    tag & READ_BIT != 0
}

#[inline]
pub fn is_write(tag: u16) -> bool {
    !is_read(tag)
}

/// Build a request tag; `id` occupies the low byte
pub fn request(class: u8, read: bool, id: u8) -> u16 {
    let dir = if read { READ_BIT } else { 0 };
    dir | ((class as u16 & 0xf) << CLASS_SHIFT) | id as u16
}

/// Tag of a bridge-originated response
pub fn response(class: u8) -> u16 {
    (class as u16 & 0xf) << CLASS_SHIFT
}
