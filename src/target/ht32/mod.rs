//! HT32-family keyboard controller support.

pub mod flasher;

pub use flasher::Ht32Flasher;
