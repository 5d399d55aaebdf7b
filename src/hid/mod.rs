//! HID transport abstraction.
//!
//! This module provides a unified [`HidDevice`] trait that abstracts over
//! the raw HID channel the update protocol runs on:
//!
//! - **Native platforms** (Linux, macOS, Windows): Uses the `hidapi` crate
//! - **Tests**: Scripted in-memory devices implementing the same trait
//!
//! ## Architecture
//!
//! The design separates I/O from protocol logic, so the engine is
//! transport-agnostic and testable without hardware.
//!
//! ```text
//! +------------------+     +------------------+
//! |   Update Engine  |     |   Update Engine  |
//! |  (Ht32Flasher)   |     |  (Ht32Flasher)   |
//! +--------+---------+     +--------+---------+
//!          |                        |
//!          v                        v
//! +--------+---------+     +--------+---------+
//! |  HidDevice Trait |     |  HidDevice Trait |
//! +--------+---------+     +--------+---------+
//!          |                        |
//!          v                        v
//! +--------+---------+     +--------+---------+
//! |    NativeHid     |     | Simulated device |
//! |    (hidapi)      |     |     (tests)      |
//! +------------------+     +------------------+
//!        Desktop                 cargo test
//! ```

#[cfg(feature = "native")]
pub mod native;

use crate::error::Result;

/// Usage page of the vendor update interface these controllers expose.
pub const UPDATE_USAGE_PAGE: u16 = 0xFF00;

/// Usage id of the vendor update interface.
pub const UPDATE_USAGE: u16 = 0x01;

/// Fixed HID report length for this device class.
pub const REPORT_LEN: usize = 64;

/// Capability interface for the raw HID channel.
///
/// One instance represents at most one open device at a time. All calls
/// block the calling thread; receive implementations must bound their
/// wall-clock wait and report a transport error on timeout.
pub trait HidDevice: Send {
    /// Try to open the device matching the given ids on its vendor update
    /// interface.
    ///
    /// Returns `Ok(false)` when no matching device is present; `Err` is
    /// reserved for backend failures. Any previously open handle is closed
    /// first.
    fn open(&mut self, vid: u16, pid: u16, usage_page: u16, usage: u16) -> Result<bool>;

    /// Close the device handle, if open.
    fn close(&mut self);

    /// Whether a device is currently open.
    fn is_open(&self) -> bool;

    /// Send one fixed-size report.
    ///
    /// With `tolerate_disconnect` set, failures caused by the device
    /// dropping off the bus are reported as success; the reset command
    /// intentionally makes the device disappear mid-send.
    fn send(&mut self, data: &[u8], tolerate_disconnect: bool) -> Result<()>;

    /// Receive one report, blocking up to a bounded timeout.
    ///
    /// Returns the number of bytes read; callers treat a size mismatch
    /// against the fixed packet length as a transport failure.
    fn recv(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Read the vendor status report (HID "get report").
    fn get_status_report(&mut self, report_id: u8, buf: &mut [u8]) -> Result<usize>;
}

// Re-export the native implementation
#[cfg(feature = "native")]
pub use native::NativeHid;
