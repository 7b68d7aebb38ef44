//! Devices module
//!
//! Contains the text console and its keyboard

pub mod console;

pub use console::{KeyboardSource, TextConsole};
