//! # kbflash
//!
//! A library for reflashing USB-HID keyboard controllers.
//!
//! This crate implements the vendor firmware-update protocol spoken by a
//! family of HT32-based keyboard controllers over fixed 64-byte HID
//! reports, including:
//!
//! - Command packet framing with CRC16 integrity
//! - Chunked flash erase/write/verify with batched status polling
//! - Bootloader/firmware mode transitions across USB resets
//! - Version-string management in flash
//! - The reversible scramble applied to firmware images on flash
//!
//! ## Supported Devices
//!
//! - MasterKeys-generation boards (primary support)
//! - Pok3r RGB-generation boards (reduced command set)
//!
//! ## Supported Platforms
//!
//! - **Native** (default): Linux, macOS, Windows via the `hidapi` crate
//! - Any other transport by implementing the [`HidDevice`] trait
//!
//! ## Features
//!
//! - `native` (default): hidapi-backed transport
//! - `serde`: Serialization support for profile types
//!
//! ## Example
//!
//! ```rust,no_run
//! use kbflash::{DeviceMode, DeviceProfile, Ht32Flasher};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let profile = DeviceProfile::pok3r_rgb();
//!
//!     // Open whichever mode the keyboard is currently in
//!     let mut flasher = Ht32Flasher::open_native(profile)?;
//!     println!("device opened in {} mode", flasher.mode().unwrap());
//!
//!     // Flashing requires the bootloader
//!     flasher.reboot_to(DeviceMode::Bootloader, true)?;
//!
//!     let firmware = std::fs::read("firmware.bin")?;
//!     flasher.update_firmware(&firmware)?;
//!
//!     flasher.reboot_to(DeviceMode::Firmware, false)?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod hid;
pub mod image;
pub mod protocol;
pub mod target;

// Re-exports for convenience
// Native-specific re-exports
#[cfg(feature = "native")]
pub use hid::NativeHid;
pub use {
    error::{Error, Result},
    hid::{HidDevice, REPORT_LEN, UPDATE_USAGE, UPDATE_USAGE_PAGE},
    image::scramble::{decode_firmware, encode_firmware},
    protocol::{
        crc::crc16,
        packet::{MAX_PAYLOAD, PACKET_LEN, Packet},
        status::{STATUS_REPORT_ID, StatusTally},
    },
    target::{
        ht32::flasher::{DeviceInfo, FirmwareVersion, Ht32Flasher, UpdateStage},
        keyboard::{CommandSet, DeviceMode, DeviceProfile, HOLTEK_VID, KeyboardFamily},
    },
};
