//! Device profiles for supported keyboard controller generations.
//!
//! Two bootloader generations of the same HT32-based controller line speak
//! the update protocol with different opcode numbers and capabilities. One
//! engine serves both: everything generation-specific lives in a
//! [`DeviceProfile`] value selected at configuration time, never in code
//! paths. Operations a generation's table lacks surface
//! [`Error::Unsupported`](crate::Error::Unsupported) when invoked.

use std::fmt;

/// Vendor id used by the Vortex/Holtek retail boards.
pub const HOLTEK_VID: u16 = 0x04D9;

/// Execution mode of the controller.
///
/// The controller enumerates with a different USB product id per mode, so
/// the current mode is inferred from which id successfully opened. It is
/// authoritative only between an open and the next close or reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DeviceMode {
    /// Running the flashed application firmware.
    Firmware,
    /// Running the bootloader; flash commands are available.
    Bootloader,
}

impl fmt::Display for DeviceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Firmware => write!(f, "firmware"),
            Self::Bootloader => write!(f, "bootloader"),
        }
    }
}

/// Supported controller generations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum KeyboardFamily {
    /// Current bootloader generation (CRC-stamped packets, full erase,
    /// write and verify support).
    #[default]
    MasterKeys,
    /// Earlier RGB-era bootloader (no packet CRC, reduced command set).
    Pok3rRgb,
}

impl KeyboardFamily {
    /// Whether this generation's bootloader checks the packet CRC field.
    pub fn uses_crc(&self) -> bool {
        matches!(self, Self::MasterKeys)
    }

    /// Get the family from a string name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "masterkeys" | "cm" => Some(Self::MasterKeys),
            "pok3r-rgb" | "rgb" => Some(Self::Pok3rRgb),
            _ => None,
        }
    }
}

impl fmt::Display for KeyboardFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MasterKeys => write!(f, "MasterKeys"),
            Self::Pok3rRgb => write!(f, "Pok3r RGB"),
        }
    }
}

/// Opcode table for one bootloader generation.
///
/// Operations absent from a generation are `None`; the engine reports them
/// as unsupported instead of guessing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CommandSet {
    /// Bootloader info query opcode.
    pub info: Option<u8>,
    /// Erase opcode.
    pub erase: Option<u8>,
    /// Argument byte of the erase command (the bootloader expects the
    /// payload length here).
    pub erase_arg: u8,
    /// Write opcode and subcommand argument.
    pub write: Option<(u8, u8)>,
    /// Verify-check opcode and subcommand argument.
    pub check: Option<(u8, u8)>,
    /// Read-by-address opcode and subcommand argument.
    pub read: Option<(u8, u8)>,
    /// Read-version opcode and subcommand argument.
    pub read_version: Option<(u8, u8)>,
    /// Reset opcode.
    pub reset: u8,
    /// Reset argument selecting firmware mode.
    pub reset_firmware: u8,
    /// Reset argument selecting bootloader mode.
    pub reset_bootloader: u8,
}

impl CommandSet {
    /// Command table of the MasterKeys-generation bootloader.
    pub fn masterkeys() -> Self {
        Self {
            info: Some(0x03),
            erase: Some(0x00),
            erase_arg: 0x08,
            write: Some((0x01, 0x01)),
            check: Some((0x01, 0x00)),
            read: Some((0x02, 0x00)),
            read_version: Some((0x01, 0x02)),
            reset: 0x04,
            reset_firmware: 0x00,
            reset_bootloader: 0x01,
        }
    }

    /// Command table of the Pok3r RGB-generation bootloader.
    ///
    /// This generation exposes no erase or verify-check command over the
    /// update interface.
    pub fn pok3r_rgb() -> Self {
        Self {
            info: None,
            erase: None,
            erase_arg: 0,
            write: Some((0x1F, 0x00)),
            check: None,
            read: Some((0x12, 0x02)),
            read_version: Some((0x12, 0x01)),
            reset: 0x11,
            reset_firmware: 0x01,
            reset_bootloader: 0x00,
        }
    }
}

/// Everything the engine needs to know about one target device.
///
/// All protocol constants are configuration carried by this value; the
/// engine itself holds no per-device literals.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceProfile {
    /// Controller generation.
    pub family: KeyboardFamily,
    /// USB vendor id.
    pub vid: u16,
    /// Product id in firmware mode.
    pub pid: u16,
    /// Product id in bootloader mode.
    pub boot_pid: u16,
    /// Base address of the application firmware in flash.
    pub fw_addr: u32,
    /// Offset of the version field relative to `fw_addr` (negative: the
    /// version block sits just below the firmware).
    pub ver_offset: i32,
    /// Total flash length.
    pub flash_len: u32,
    /// Payload bytes per write/verify chunk.
    pub write_chunk: usize,
    /// Payload bytes per read chunk.
    pub read_chunk: usize,
    /// Whether command packets carry a CRC16.
    pub uses_crc: bool,
    /// Opcode table.
    pub commands: CommandSet,
}

impl DeviceProfile {
    /// Profile for a MasterKeys-generation board with the given USB ids
    /// and firmware base address.
    pub fn masterkeys(vid: u16, pid: u16, boot_pid: u16, fw_addr: u32) -> Self {
        Self {
            family: KeyboardFamily::MasterKeys,
            vid,
            pid,
            boot_pid,
            fw_addr,
            ver_offset: -0x400,
            flash_len: 0x10000,
            write_chunk: 52,
            read_chunk: 60,
            uses_crc: true,
            commands: CommandSet::masterkeys(),
        }
    }

    /// Profile for the retail Pok3r RGB board.
    pub fn pok3r_rgb() -> Self {
        Self {
            family: KeyboardFamily::Pok3rRgb,
            vid: HOLTEK_VID,
            pid: 0x0167,
            boot_pid: 0x1167,
            fw_addr: 0x3400,
            ver_offset: -0x400,
            flash_len: 0x10000,
            write_chunk: 60,
            read_chunk: 60,
            uses_crc: false,
            commands: CommandSet::pok3r_rgb(),
        }
    }

    /// Absolute flash address of the version field.
    pub fn ver_addr(&self) -> u32 {
        self.fw_addr.wrapping_add_signed(self.ver_offset)
    }
}
