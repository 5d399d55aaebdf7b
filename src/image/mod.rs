//! Firmware image handling.

pub mod scramble;

pub use scramble::{decode_firmware, encode_firmware};
