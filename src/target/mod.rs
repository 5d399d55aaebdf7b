//! Target device abstraction.

pub mod ht32;
pub mod keyboard;

// Re-export common types
pub use ht32::flasher::{DeviceInfo, FirmwareVersion, Ht32Flasher, UpdateStage};
pub use keyboard::{CommandSet, DeviceMode, DeviceProfile, HOLTEK_VID, KeyboardFamily};
