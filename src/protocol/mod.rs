//! Update protocol implementation.

pub mod crc;
pub mod packet;
pub mod status;

// Re-export common types
pub use crc::crc16;
pub use packet::{MAX_PAYLOAD, PACKET_LEN, Packet};
pub use status::{MARK_FAIL, MARK_PASS, STATUS_REPORT_ID, StatusTally};
