//! Error types for kbflash.

use std::io;
use thiserror::Error;

/// Result type for kbflash operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for kbflash operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// HID backend error.
    #[cfg(feature = "native")]
    #[error("HID error: {0}")]
    Hid(#[from] hidapi::HidError),

    /// Transport failure: send/recv failed, short read, or timeout.
    #[error("Transport error: {0}")]
    Transport(String),

    /// No device with a matching firmware or bootloader product id.
    #[error("Device not found")]
    DeviceNotFound,

    /// Command payload exceeds the packet payload capacity.
    #[error("Payload too large: {len} bytes (max {max})")]
    PayloadTooLarge {
        /// Offending payload length.
        len: usize,
        /// Maximum payload a packet can carry.
        max: usize,
    },

    /// Flash erase command failed.
    #[error("Erase failed for {start:#010x}..{end:#010x}")]
    Erase {
        /// Start address of the erase range.
        start: u32,
        /// Exclusive end address of the erase range.
        end: u32,
    },

    /// Flash write failed.
    #[error("Write failed at {addr:#010x} (chunk {chunk})")]
    Write {
        /// Start address of the failing chunk.
        addr: u32,
        /// Index of the failing chunk.
        chunk: usize,
    },

    /// Device reported one or more failed verify chunks.
    #[error("Verify failed near {addr:#010x}: {failed} chunk(s) rejected")]
    VerifyFailed {
        /// Base address of the verified region.
        addr: u32,
        /// Failed-chunk count from the status report.
        failed: u32,
    },

    /// Flash contents did not match expectations.
    #[error("Flash error: {0}")]
    Flash(String),

    /// Reset/reopen did not land in the requested mode.
    #[error("Mode switch failed: {0}")]
    ModeSwitch(String),

    /// Operation not available in the selected command table.
    #[error("Unsupported: {0}")]
    Unsupported(String),
}
