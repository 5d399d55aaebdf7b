//! Update engine for HT32-based keyboard controllers.
//!
//! One engine drives every supported bootloader generation; the selected
//! [`DeviceProfile`] supplies the opcode table, chunk sizes and addresses.
//! The engine owns its transport exclusively for its entire lifetime —
//! callers serialize whole operations, never individual packets.
//!
//! ## Example
//!
//! ```rust,no_run
//! use kbflash::{DeviceMode, DeviceProfile, Ht32Flasher};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let profile = DeviceProfile::masterkeys(0x2516, 0x003B, 0x103B, 0x3400);
//!     let mut flasher = Ht32Flasher::open_native(profile)?;
//!
//!     flasher.reboot_to(DeviceMode::Bootloader, true)?;
//!
//!     let firmware = std::fs::read("firmware.bin")?;
//!     flasher.update_firmware(&firmware)?;
//!
//!     flasher.reboot_to(DeviceMode::Firmware, false)?;
//!     Ok(())
//! }
//! ```

use crate::error::{Error, Result};
use crate::hid::{HidDevice, REPORT_LEN, UPDATE_USAGE, UPDATE_USAGE_PAGE};
use crate::image::scramble;
use crate::protocol::packet::{PACKET_LEN, PAYLOAD_OFFSET, Packet};
use crate::protocol::status::{STATUS_REPORT_ID, StatusTally};
use crate::target::keyboard::{DeviceMode, DeviceProfile};
use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use log::{debug, info, trace, warn};
use std::thread;
use std::time::Duration;

/// Settle interval after a reset or a full-range erase.
const SETTLE: Duration = Duration::from_secs(5);

/// Settle interval before polling the status report in a verify batch.
const VERIFY_SETTLE: Duration = Duration::from_millis(2);

/// Maximum verify-check commands in flight before a status poll.
const VERIFY_BATCH: u32 = 30;

/// Length of the erased version region.
const VER_REGION_LEN: u32 = 8;

/// Progress of one firmware update operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpdateStage {
    /// No update attempted yet.
    #[default]
    Idle,
    /// Erasing the target range.
    Erasing,
    /// Writing chunks.
    Writing,
    /// Running the batched verify loop.
    Verifying,
    /// Last update completed successfully.
    Done,
    /// Last update aborted at some stage.
    Failed,
}

/// Contents of the version field in flash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FirmwareVersion {
    /// The version region is erased (all `0xFF`).
    Cleared,
    /// A stored version string.
    Text(String),
}

impl std::fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cleared => write!(f, "CLEARED"),
            Self::Text(text) => write!(f, "{text}"),
        }
    }
}

/// Fields of the bootloader info response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Chip/build identification word.
    pub chip_id: u32,
    /// Firmware base address as the bootloader reports it.
    pub fw_addr: u16,
    /// Flash page size.
    pub page_size: u16,
    /// Reserved counters following the page size.
    pub reserved: [u16; 2],
    /// Address of the version field.
    pub ver_addr: u32,
}

/// Update flasher, generic over the HID transport `T`.
///
/// Holds the transport by value; no other code may touch the device while
/// the flasher exists.
pub struct Ht32Flasher<T: HidDevice> {
    dev: T,
    profile: DeviceProfile,
    mode: Option<DeviceMode>,
    stage: UpdateStage,
    settle: Duration,
}

impl<T: HidDevice> Ht32Flasher<T> {
    /// Create a flasher over an existing transport.
    ///
    /// The device is not opened; call [`open`](Self::open).
    pub fn new(dev: T, profile: DeviceProfile) -> Self {
        Self {
            dev,
            profile,
            mode: None,
            stage: UpdateStage::Idle,
            settle: SETTLE,
        }
    }

    /// Override the settle interval used after resets and erases.
    #[must_use]
    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    /// The active device profile.
    pub fn profile(&self) -> &DeviceProfile {
        &self.profile
    }

    /// Mode the device was in when last opened, if open.
    pub fn mode(&self) -> Option<DeviceMode> {
        self.mode
    }

    /// Stage reached by the most recent update operation.
    pub fn stage(&self) -> UpdateStage {
        self.stage
    }

    /// Get a reference to the underlying transport.
    pub fn device(&self) -> &T {
        &self.dev
    }

    /// Get a mutable reference to the underlying transport.
    pub fn device_mut(&mut self) -> &mut T {
        &mut self.dev
    }

    /// Consume the flasher and return the underlying transport.
    pub fn into_device(self) -> T {
        self.dev
    }

    /// Find and open the device.
    ///
    /// The firmware product id is tried first, then the bootloader product
    /// id; whichever opened determines the recorded [`DeviceMode`].
    pub fn open(&mut self) -> Result<()> {
        let p = &self.profile;
        if self
            .dev
            .open(p.vid, p.pid, UPDATE_USAGE_PAGE, UPDATE_USAGE)?
        {
            debug!("opened {:04x}:{:04x} in firmware mode", p.vid, p.pid);
            self.mode = Some(DeviceMode::Firmware);
            return Ok(());
        }
        if self
            .dev
            .open(p.vid, p.boot_pid, UPDATE_USAGE_PAGE, UPDATE_USAGE)?
        {
            debug!("opened {:04x}:{:04x} in bootloader mode", p.vid, p.boot_pid);
            self.mode = Some(DeviceMode::Bootloader);
            return Ok(());
        }
        Err(Error::DeviceNotFound)
    }

    /// Close the device.
    pub fn close(&mut self) {
        self.dev.close();
        self.mode = None;
    }

    /// Whether the device is open.
    pub fn is_open(&self) -> bool {
        self.dev.is_open()
    }

    /// Reset the device into `target` mode.
    ///
    /// No transport I/O happens when the device is already in `target`
    /// mode. Otherwise the reset command is sent, the handle is closed,
    /// and — with `reopen` — the device is reopened after the settle
    /// interval. Landing in any mode other than `target` is an error; the
    /// device may refuse to switch, for example with no valid firmware to
    /// boot into.
    pub fn reboot_to(&mut self, target: DeviceMode, reopen: bool) -> Result<()> {
        if self.mode == Some(target) {
            return Ok(());
        }

        info!("Reset to {target}");
        let cmds = self.profile.commands;
        let arg = match target {
            DeviceMode::Firmware => cmds.reset_firmware,
            DeviceMode::Bootloader => cmds.reset_bootloader,
        };
        self.send_cmd(cmds.reset, arg, &[])?;
        self.close();

        if reopen {
            thread::sleep(self.settle);

            self.open()
                .map_err(|e| Error::ModeSwitch(format!("reopen after reset failed: {e}")))?;

            if self.mode != Some(target) {
                return Err(Error::ModeSwitch(format!(
                    "device came back in {} mode, wanted {target}",
                    self.mode.map_or_else(|| "no".to_string(), |m| m.to_string()),
                )));
            }
        }
        Ok(())
    }

    /// Query the bootloader info block.
    pub fn device_info(&mut self) -> Result<DeviceInfo> {
        let opcode = self.require(self.profile.commands.info, "info query")?;
        let resp = self.send_recv_cmd(opcode, 0, &[])?;

        let mut r = &resp[..];
        let chip_id = r.read_u32::<LittleEndian>()?;
        let fw_addr = r.read_u16::<LittleEndian>()?;
        let page_size = r.read_u16::<LittleEndian>()?;
        let reserved = [r.read_u16::<LittleEndian>()?, r.read_u16::<LittleEndian>()?];
        let ver_addr = r.read_u32::<LittleEndian>()?;

        debug!(
            "info: chip {chip_id:#010x}, firmware at {fw_addr:#06x}, page size {page_size:#06x}, \
             version at {ver_addr:#010x}"
        );

        Ok(DeviceInfo {
            chip_id,
            fw_addr,
            page_size,
            reserved,
            ver_addr,
        })
    }

    /// Erase the flash range `[start, end)`.
    ///
    /// A single command covers the whole range; the bootloader handles
    /// page alignment itself.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn erase_flash(&mut self, start: u32, end: u32) -> Result<()> {
        let opcode = self.require(self.profile.commands.erase, "flash erase")?;
        if end < start {
            return Err(Error::Flash(format!(
                "invalid erase range {start:#010x}..{end:#010x}"
            )));
        }

        debug!("erase_flash {start:#x} {end:#x}");
        let mut arg = Vec::with_capacity(8);
        arg.write_u32::<LittleEndian>(start).unwrap();
        arg.write_u32::<LittleEndian>(end).unwrap();
        self.send_cmd(opcode, self.profile.commands.erase_arg, &arg)
            .map_err(|e| {
                warn!("erase command failed: {e}");
                Error::Erase { start, end }
            })
    }

    /// Write `data` to flash starting at `addr`.
    ///
    /// The blob is split into profile-sized chunks, one command per chunk,
    /// strictly sequential. The first transport failure aborts the write
    /// and leaves flash partially written; there is no resumption state,
    /// callers re-run the whole operation.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    #[allow(clippy::cast_possible_truncation)] // Firmware images are always < 4GB
    pub fn write_flash(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        let (opcode, arg) = self.require(self.profile.commands.write, "flash write")?;
        if data.is_empty() {
            return Err(Error::Flash("empty write".into()));
        }

        debug!("write_flash {addr:#x} ({} bytes)", data.len());
        let chunk_size = self.profile.write_chunk;
        for (i, chunk) in data.chunks(chunk_size).enumerate() {
            let start = addr + (i * chunk_size) as u32;
            let end = start + chunk.len() as u32 - 1;

            let mut payload = Vec::with_capacity(8 + chunk.len());
            payload.write_u32::<LittleEndian>(start).unwrap();
            payload.write_u32::<LittleEndian>(end).unwrap();
            payload.extend_from_slice(chunk);

            trace!("write chunk {i}: {start:#x}..={end:#x}");
            self.send_cmd(opcode, arg, &payload).map_err(|e| {
                warn!("write chunk {i} failed: {e}");
                Error::Write { addr: start, chunk: i }
            })?;
        }
        Ok(())
    }

    /// Verify that flash starting at `addr` matches `data`.
    ///
    /// Chunked exactly like [`write_flash`](Self::write_flash), but check
    /// commands get no individual reply — the device only records one
    /// pass/fail marker per chunk. The status report is polled after every
    /// batch of 30 outstanding checks, and after the final chunk. Any
    /// failed marker aborts the whole verify. The device completes checks
    /// asynchronously, so a poll may report fewer passes than were issued
    /// in the batch; the shortfall is carried into the next batch rather
    /// than treated as an error.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    #[allow(clippy::cast_possible_truncation)] // Firmware images are always < 4GB
    pub fn check_flash(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        let (opcode, arg) = self.require(self.profile.commands.check, "flash verify")?;
        if data.is_empty() {
            return Err(Error::Flash("empty verify".into()));
        }

        debug!("check_flash {addr:#x} ({} bytes)", data.len());
        let chunk_size = self.profile.write_chunk;
        let nchunks = data.len().div_ceil(chunk_size);
        let mut outstanding: u32 = 0;

        for (i, chunk) in data.chunks(chunk_size).enumerate() {
            let start = addr + (i * chunk_size) as u32;
            let end = start + chunk.len() as u32 - 1;

            let mut payload = Vec::with_capacity(8 + chunk.len());
            payload.write_u32::<LittleEndian>(start).unwrap();
            payload.write_u32::<LittleEndian>(end).unwrap();
            payload.extend_from_slice(chunk);

            trace!("check chunk {i}: {start:#x}..={end:#x}");
            self.send_cmd(opcode, arg, &payload)?;
            outstanding += 1;

            if outstanding == VERIFY_BATCH || i + 1 == nchunks {
                thread::sleep(VERIFY_SETTLE);

                let tally = self.read_status()?;
                if tally.failed > 0 {
                    warn!("verify reported {} failed chunk(s)", tally.failed);
                    return Err(Error::VerifyFailed {
                        addr,
                        failed: tally.failed,
                    });
                }
                if tally.passed != outstanding {
                    debug!(
                        "check status mismatch: expected {outstanding}, got {}",
                        tally.passed
                    );
                }
                outstanding = outstanding.saturating_sub(tally.passed);
            }
        }
        Ok(())
    }

    /// Read one chunk of flash at `addr`.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn read_flash(&mut self, addr: u32) -> Result<Vec<u8>> {
        let (opcode, arg) = self.require(self.profile.commands.read, "flash read")?;

        trace!("read_flash {addr:#x}");
        let mut payload = Vec::with_capacity(4);
        payload.write_u32::<LittleEndian>(addr).unwrap();
        let resp = self.send_recv_cmd(opcode, arg, &payload)?;
        Ok(resp[PAYLOAD_OFFSET..PAYLOAD_OFFSET + self.profile.read_chunk].to_vec())
    }

    /// Dump `len` bytes of flash starting at `addr`.
    ///
    /// Reads whole chunks; a trailing partial chunk is satisfied by one
    /// extra full-size read ending exactly at `addr + len`, with the
    /// already-dumped overlap spliced out. The result is always exactly
    /// `len` bytes and no read covers addresses past `addr + len`.
    /// `progress` is invoked with `(bytes_done, len)` at 10% increments
    /// and once at completion.
    #[allow(clippy::cast_possible_truncation)]
    pub fn dump_flash<F>(&mut self, addr: u32, len: u32, progress: &mut F) -> Result<Vec<u8>>
    where
        F: FnMut(u32, u32),
    {
        debug!("dump_flash {addr:#x} ({len} bytes)");
        let chunk = self.profile.read_chunk as u32;
        let mut out = Vec::with_capacity(len as usize);
        let mut offset: u32 = 0;
        let mut last_decile: u64 = 0;

        while offset + chunk <= len {
            out.extend_from_slice(&self.read_flash(addr + offset)?);
            offset += chunk;

            let decile = u64::from(offset) * 10 / u64::from(len);
            if decile > last_decile && decile < 10 {
                last_decile = decile;
                progress(offset, len);
            }
        }

        if offset < len {
            let remaining = (len - offset) as usize;
            // Full-size read ending at addr + len; the front overlaps data
            // already dumped
            let read_start = (addr + len).saturating_sub(chunk);
            let skip = (addr + offset - read_start) as usize;
            let tail = self.read_flash(read_start)?;
            out.extend_from_slice(&tail[skip..skip + remaining]);
        }

        progress(len, len);
        Ok(out)
    }

    /// Dump the entire flash.
    pub fn dump_all<F>(&mut self, progress: &mut F) -> Result<Vec<u8>>
    where
        F: FnMut(u32, u32),
    {
        let len = self.profile.flash_len;
        self.dump_flash(0, len, progress)
    }

    /// Update the application firmware from a raw (unscrambled) image.
    ///
    /// Runs erase, write and verify over the firmware region. Any stage
    /// failure aborts the remaining stages; flash is left as-is, there is
    /// no rollback. The caller is responsible for having the device in
    /// bootloader mode.
    pub fn update_firmware(&mut self, firmware: &[u8]) -> Result<()> {
        self.stage = UpdateStage::Idle;
        let result = self.run_update(firmware);
        self.stage = if result.is_ok() {
            UpdateStage::Done
        } else {
            UpdateStage::Failed
        };
        result
    }

    #[allow(clippy::cast_possible_truncation)] // Firmware images are always < 4GB
    fn run_update(&mut self, firmware: &[u8]) -> Result<()> {
        debug!("update_firmware ({} bytes)", firmware.len());

        let fw_addr = self.profile.fw_addr;
        let mut image = firmware.to_vec();
        scramble::encode_firmware(&mut image);

        // Info query first; the bootloader uses it to reset its update
        // state machine
        if let Some(info) = self.profile.commands.info {
            self.send_recv_cmd(info, 0, &[])?;
        }

        info!("Erase...");
        self.stage = UpdateStage::Erasing;
        self.erase_flash(fw_addr, fw_addr + image.len() as u32)?;

        thread::sleep(self.settle);

        info!("Write...");
        self.stage = UpdateStage::Writing;
        self.write_flash(fw_addr, &image)?;

        // Drain any stale status report before verifying
        let _ = self.read_status();

        info!("Verify...");
        self.stage = UpdateStage::Verifying;
        self.check_flash(fw_addr, &image)?;

        info!("Firmware updated");
        Ok(())
    }

    /// Read the version string stored below the firmware.
    #[allow(clippy::cast_possible_truncation)] // Clamp keeps len within the packet
    pub fn get_version(&mut self) -> Result<FirmwareVersion> {
        let (opcode, arg) = self.require(self.profile.commands.read_version, "version read")?;

        debug!("get_version");
        let resp = self.send_recv_cmd(opcode, arg, &[])?;
        if resp.iter().all(|&b| b == 0xFF) {
            return Ok(FirmwareVersion::Cleared);
        }

        let len = LittleEndian::read_u32(&resp[..4]).min((PACKET_LEN - 4) as u32) as usize;
        let text = String::from_utf8_lossy(&resp[4..4 + len]).into_owned();
        debug!("version: {text}");
        Ok(FirmwareVersion::Text(text))
    }

    /// Erase the version field and confirm it reads back blank.
    ///
    /// Re-enters bootloader mode first when necessary.
    pub fn clear_version(&mut self) -> Result<()> {
        debug!("clear_version");
        self.reboot_to(DeviceMode::Bootloader, true)?;

        info!("Clear version");
        let ver = self.profile.ver_addr();
        self.erase_flash(ver, ver + VER_REGION_LEN)?;

        // Drain the stale status report the erase leaves behind
        let _ = self.read_status();

        self.check_flash(ver, &[0xFF; VER_REGION_LEN as usize])
            .map_err(|e| match e {
                Error::VerifyFailed { .. } => {
                    Error::Flash("version region not blank after erase".into())
                },
                other => other,
            })
    }

    /// Store a version string in the version field.
    ///
    /// Clears the field first, then writes a 4-byte little-endian length
    /// prefix plus the text, zero-padded past the next 4-byte boundary.
    #[allow(clippy::cast_possible_truncation)] // Version strings are tiny
    pub fn set_version(&mut self, version: &str) -> Result<()> {
        debug!("set_version {version}");
        self.clear_version()?;

        info!("Writing version: {version}");
        let text = version.as_bytes();
        let vlen = text.len() + 4;
        let padded = vlen + (4 - vlen % 4);
        let mut vdata = vec![0u8; padded];
        LittleEndian::write_u32(&mut vdata[..4], text.len() as u32);
        vdata[4..4 + text.len()].copy_from_slice(text);

        let ver = self.profile.ver_addr();
        self.write_flash(ver, &vdata)?;

        let _ = self.read_status();

        self.check_flash(ver, &vdata).map_err(|e| match e {
            Error::VerifyFailed { .. } => Error::Flash("version mismatch after write".into()),
            other => other,
        })
    }

    /// Send one command packet.
    ///
    /// Disconnect-type failures are tolerated for the reset opcode only.
    fn send_cmd(&mut self, opcode: u8, arg: u8, payload: &[u8]) -> Result<()> {
        let packet = Packet::encode(opcode, arg, payload, self.profile.uses_crc)?;
        trace!(
            "send: cmd {opcode:#04x} arg {arg:#04x} ({} payload bytes)",
            payload.len()
        );

        let tolerate = opcode == self.profile.commands.reset;
        self.dev
            .send(packet.as_bytes(), tolerate)
            .map_err(|e| Error::Transport(format!("send failed: {e}")))
    }

    /// Receive one response packet.
    fn recv_cmd(&mut self) -> Result<[u8; PACKET_LEN]> {
        let mut buf = [0u8; PACKET_LEN];
        let n = self
            .dev
            .recv(&mut buf)
            .map_err(|e| Error::Transport(format!("recv failed: {e}")))?;
        if n != PACKET_LEN {
            return Err(Error::Transport(format!(
                "short read: {n} of {PACKET_LEN} bytes"
            )));
        }
        trace!("recv: {n} bytes");
        Ok(buf)
    }

    /// Send a query command and receive its single response packet.
    fn send_recv_cmd(&mut self, opcode: u8, arg: u8, payload: &[u8]) -> Result<[u8; PACKET_LEN]> {
        self.send_cmd(opcode, arg, payload)?;
        self.recv_cmd()
    }

    /// Read and tally the vendor status report.
    fn read_status(&mut self) -> Result<StatusTally> {
        let mut report = [0u8; REPORT_LEN];
        let n = self
            .dev
            .get_status_report(STATUS_REPORT_ID, &mut report)
            .map_err(|e| Error::Transport(format!("status report failed: {e}")))?;
        let tally = StatusTally::from_report(&report[..n]);
        trace!("status: {} passed, {} failed", tally.passed, tally.failed);
        Ok(tally)
    }

    fn require<C>(&self, entry: Option<C>, what: &str) -> Result<C> {
        entry.ok_or_else(|| {
            Error::Unsupported(format!("{what} not available on {}", self.profile.family))
        })
    }
}

// Native-specific convenience functions
#[cfg(feature = "native")]
mod native_impl {
    use super::{DeviceProfile, Ht32Flasher, Result};
    use crate::hid::NativeHid;

    impl Ht32Flasher<NativeHid> {
        /// Create a flasher over the native HID backend and open the
        /// device described by `profile`.
        pub fn open_native(profile: DeviceProfile) -> Result<Self> {
            let mut flasher = Self::new(NativeHid::new()?, profile);
            flasher.open()?;
            Ok(flasher)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::status::{MARK_FAIL, MARK_PASS};
    use crate::target::keyboard::CommandSet;
    use std::collections::VecDeque;

    const FLASH_LEN: usize = 0x10000;
    const FW_ADDR: u32 = 0x3400;

    fn masterkeys_profile() -> DeviceProfile {
        DeviceProfile::masterkeys(0x2516, 0x003B, 0x103B, FW_ADDR)
    }

    /// Scripted in-memory device. Executes erase/write/check/read commands
    /// against a simulated flash array and accumulates status markers the
    /// way the real bootloader does.
    struct SimDevice {
        profile: DeviceProfile,
        /// Product ids that currently enumerate.
        present: Vec<u16>,
        open_pid: Option<u16>,
        flash: Vec<u8>,
        /// Markers accumulated since the last status read.
        marks: Vec<u8>,
        /// Queued query responses.
        replies: VecDeque<Vec<u8>>,
        /// Every accepted command: (opcode, arg, payload).
        sent: Vec<(u8, u8, Vec<u8>)>,
        status_reads: usize,
        /// Report at most this many markers per status read (0 = all).
        hold_marks: usize,
        /// Fail sends of the reset opcode unless tolerated.
        fail_reset_send: bool,
        /// Ignore mode-switch requests (stay on the current pids).
        refuse_switch: bool,
    }

    impl SimDevice {
        fn new(profile: DeviceProfile, present: Vec<u16>) -> Self {
            Self {
                profile,
                present,
                open_pid: None,
                flash: vec![0xFF; FLASH_LEN],
                marks: Vec::new(),
                replies: VecDeque::new(),
                sent: Vec::new(),
                status_reads: 0,
                hold_marks: 0,
                fail_reset_send: false,
                refuse_switch: false,
            }
        }

        fn range_from(payload: &[u8]) -> (usize, usize) {
            let start = LittleEndian::read_u32(&payload[..4]) as usize;
            let end = LittleEndian::read_u32(&payload[4..8]) as usize;
            (start, end)
        }

        fn handle(&mut self, opcode: u8, arg: u8, payload: &[u8]) {
            let cmds = self.profile.commands;

            if cmds.erase == Some(opcode) && arg == cmds.erase_arg {
                // The bootloader erases whole pages covering the range
                const PAGE: usize = 0x400;
                let (start, end) = Self::range_from(payload);
                let start = start & !(PAGE - 1);
                let end = end.div_ceil(PAGE) * PAGE;
                self.flash[start..end.min(FLASH_LEN)].fill(0xFF);
            } else if cmds.write == Some((opcode, arg)) {
                let (start, end) = Self::range_from(payload);
                let len = end - start + 1;
                self.flash[start..=end].copy_from_slice(&payload[8..8 + len]);
            } else if cmds.check == Some((opcode, arg)) {
                let (start, end) = Self::range_from(payload);
                let len = end - start + 1;
                let ok = self.flash[start..=end] == payload[8..8 + len];
                self.marks.push(if ok { MARK_PASS } else { MARK_FAIL });
            } else if cmds.read == Some((opcode, arg)) {
                let addr = LittleEndian::read_u32(&payload[..4]) as usize;
                let mut resp = vec![0u8; 4];
                resp.extend_from_slice(&self.flash[addr..addr + self.profile.read_chunk]);
                self.replies.push_back(resp);
            } else if cmds.read_version == Some((opcode, arg)) {
                let ver = self.profile.ver_addr() as usize;
                self.replies.push_back(self.flash[ver..ver + 64].to_vec());
            } else if cmds.info == Some(opcode) {
                self.replies.push_back(vec![0u8; 64]);
            } else if opcode == cmds.reset {
                self.open_pid = None;
                if !self.refuse_switch {
                    self.present = if arg == cmds.reset_bootloader {
                        vec![self.profile.boot_pid]
                    } else {
                        vec![self.profile.pid]
                    };
                }
            }
        }
    }

    impl HidDevice for SimDevice {
        fn open(&mut self, vid: u16, pid: u16, _usage_page: u16, _usage: u16) -> Result<bool> {
            self.open_pid = None;
            if vid == self.profile.vid && self.present.contains(&pid) {
                self.open_pid = Some(pid);
                return Ok(true);
            }
            Ok(false)
        }

        fn close(&mut self) {
            self.open_pid = None;
        }

        fn is_open(&self) -> bool {
            self.open_pid.is_some()
        }

        fn send(&mut self, data: &[u8], tolerate_disconnect: bool) -> Result<()> {
            if !self.is_open() {
                return Err(Error::Transport("not open".into()));
            }
            let (opcode, arg) = (data[0], data[1]);
            if opcode == self.profile.commands.reset && self.fail_reset_send {
                // The device already dropped off the bus
                self.handle(opcode, arg, &data[4..]);
                return if tolerate_disconnect {
                    Ok(())
                } else {
                    Err(Error::Transport("pipe error".into()))
                };
            }
            self.sent.push((opcode, arg, data[4..].to_vec()));
            self.handle(opcode, arg, &data[4..]);
            Ok(())
        }

        fn recv(&mut self, buf: &mut [u8]) -> Result<usize> {
            let reply = self
                .replies
                .pop_front()
                .ok_or_else(|| Error::Transport("no response".into()))?;
            buf[..reply.len()].copy_from_slice(&reply);
            Ok(reply.len())
        }

        fn get_status_report(&mut self, _report_id: u8, buf: &mut [u8]) -> Result<usize> {
            self.status_reads += 1;
            let take = if self.hold_marks > 0 {
                self.marks.len().min(self.hold_marks)
            } else {
                self.marks.len()
            };
            buf.fill(0);
            for (slot, mark) in buf.iter_mut().zip(self.marks.drain(..take)) {
                *slot = mark;
            }
            Ok(buf.len())
        }
    }

    fn boot_flasher() -> Ht32Flasher<SimDevice> {
        let profile = masterkeys_profile();
        let dev = SimDevice::new(profile.clone(), vec![profile.boot_pid]);
        let mut flasher = Ht32Flasher::new(dev, profile).with_settle(Duration::ZERO);
        flasher.open().unwrap();
        flasher
    }

    fn seed_flash(flasher: &mut Ht32Flasher<SimDevice>) {
        for (i, byte) in flasher.device_mut().flash.iter_mut().enumerate() {
            *byte = (i % 251) as u8;
        }
    }

    #[test]
    fn test_open_prefers_firmware_pid() {
        let profile = masterkeys_profile();
        let dev = SimDevice::new(profile.clone(), vec![profile.pid, profile.boot_pid]);
        let mut flasher = Ht32Flasher::new(dev, profile);
        flasher.open().unwrap();
        assert_eq!(flasher.mode(), Some(DeviceMode::Firmware));
    }

    #[test]
    fn test_open_device_not_found() {
        let profile = masterkeys_profile();
        let dev = SimDevice::new(profile.clone(), Vec::new());
        let mut flasher = Ht32Flasher::new(dev, profile);
        assert!(matches!(flasher.open(), Err(Error::DeviceNotFound)));
        assert_eq!(flasher.mode(), None);
    }

    #[test]
    fn test_update_firmware_end_to_end() {
        let mut flasher = boot_flasher();
        let firmware: Vec<u8> = (0u16..300).map(|i| (i % 256) as u8).collect();

        flasher.update_firmware(&firmware).unwrap();
        assert_eq!(flasher.stage(), UpdateStage::Done);

        let mut expected = firmware.clone();
        scramble::encode_firmware(&mut expected);
        let base = FW_ADDR as usize;
        assert_eq!(
            &flasher.device().flash[base..base + expected.len()],
            expected.as_slice()
        );
    }

    #[test]
    fn test_update_firmware_failure_sets_stage() {
        let profile = DeviceProfile::pok3r_rgb();
        let dev = SimDevice::new(profile.clone(), vec![profile.boot_pid]);
        let mut rgb = Ht32Flasher::new(dev, profile).with_settle(Duration::ZERO);
        rgb.open().unwrap();

        // The RGB table has no erase command, so the update aborts early
        let err = rgb.update_firmware(&[1, 2, 3]).unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)));
        assert_eq!(rgb.stage(), UpdateStage::Failed);
    }

    #[test]
    fn test_write_flash_chunking() {
        let mut flasher = boot_flasher();
        let data = vec![0xAB; 130];
        flasher.write_flash(FW_ADDR, &data).unwrap();

        let write_op = flasher.profile().commands.write.unwrap();
        let writes: Vec<_> = flasher
            .device()
            .sent
            .iter()
            .filter(|(op, arg, _)| (*op, *arg) == write_op)
            .collect();

        // ceil(130 / 52) commands
        assert_eq!(writes.len(), 3);
        let expected = [(FW_ADDR, 52usize), (FW_ADDR + 52, 52), (FW_ADDR + 104, 26)];
        for ((_, _, payload), (start, len)) in writes.iter().zip(expected) {
            let (s, e) = SimDevice::range_from(payload);
            assert_eq!(s as u32, start);
            assert_eq!(e, s + len - 1);
        }
    }

    #[test]
    fn test_write_flash_rejects_empty() {
        let mut flasher = boot_flasher();
        assert!(matches!(
            flasher.write_flash(FW_ADDR, &[]),
            Err(Error::Flash(_))
        ));
    }

    #[test]
    fn test_check_flash_polls_per_batch() {
        let mut flasher = boot_flasher();
        // 35 chunks: one poll at the 30-command batch boundary, one after
        // the final chunk
        let data = vec![0x5A; 35 * 52];
        flasher.write_flash(FW_ADDR, &data).unwrap();
        flasher.check_flash(FW_ADDR, &data).unwrap();
        assert_eq!(flasher.device().status_reads, 2);
    }

    #[test]
    fn test_check_flash_fails_on_mismatch() {
        let mut flasher = boot_flasher();
        let data = vec![0x11; 52];
        // Flash still blank: the device records a failed marker
        let err = flasher.check_flash(FW_ADDR, &data).unwrap_err();
        match err {
            Error::VerifyFailed { addr, failed } => {
                assert_eq!(addr, FW_ADDR);
                assert_eq!(failed, 1);
            },
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_check_flash_tolerates_slow_status() {
        let mut flasher = boot_flasher();
        let data = vec![0x33; 2 * 52];
        flasher.write_flash(FW_ADDR, &data).unwrap();
        // Device reports only one completed check per poll; the shortfall
        // must carry over instead of failing
        flasher.device_mut().hold_marks = 1;
        flasher.check_flash(FW_ADDR, &data).unwrap();
    }

    #[test]
    fn test_dump_flash_exact_length_unaligned() {
        let mut flasher = boot_flasher();
        seed_flash(&mut flasher);
        let flash = flasher.device().flash.clone();

        for len in [1u32, 59, 60, 61, 125, 600] {
            let dump = flasher.dump_flash(FW_ADDR, len, &mut |_, _| {}).unwrap();
            assert_eq!(dump.len(), len as usize, "len {len}");
            let base = FW_ADDR as usize;
            assert_eq!(dump, flash[base..base + len as usize], "len {len}");
        }
    }

    #[test]
    fn test_dump_flash_never_reads_past_end() {
        let mut flasher = boot_flasher();
        seed_flash(&mut flasher);
        let len = 125u32;
        flasher.dump_flash(FW_ADDR, len, &mut |_, _| {}).unwrap();

        let read_op = flasher.profile().commands.read.unwrap();
        let chunk = flasher.profile().read_chunk as u32;
        for (op, arg, payload) in &flasher.device().sent {
            if (*op, *arg) == read_op {
                let addr = LittleEndian::read_u32(&payload[..4]);
                assert!(addr + chunk <= FW_ADDR + len);
            }
        }
    }

    #[test]
    fn test_dump_flash_progress_marks() {
        let mut flasher = boot_flasher();
        let mut calls = Vec::new();
        flasher
            .dump_flash(FW_ADDR, 600, &mut |done, total| calls.push((done, total)))
            .unwrap();
        assert_eq!(calls.last(), Some(&(600, 600)));
        // Deciles reported while in flight
        assert!(calls.len() >= 9);
        assert!(calls.windows(2).all(|w| w[0].0 < w[1].0));
    }

    #[test]
    fn test_version_set_get_round_trip() {
        let mut flasher = boot_flasher();
        flasher.set_version("1.2.3").unwrap();
        assert_eq!(
            flasher.get_version().unwrap(),
            FirmwareVersion::Text("1.2.3".into())
        );
    }

    #[test]
    fn test_clear_version_reports_cleared() {
        let mut flasher = boot_flasher();
        flasher.set_version("4.5.6").unwrap();
        flasher.clear_version().unwrap();
        assert_eq!(flasher.get_version().unwrap(), FirmwareVersion::Cleared);
    }

    #[test]
    fn test_set_version_padding() {
        let mut flasher = boot_flasher();
        flasher.set_version("1.2.3").unwrap();

        // 4-byte length prefix + 5 text bytes, padded past the next 4-byte
        // boundary
        let ver = flasher.profile().ver_addr() as usize;
        let stored = &flasher.device().flash[ver..ver + 12];
        assert_eq!(&stored[..4], &[5, 0, 0, 0]);
        assert_eq!(&stored[4..9], b"1.2.3");
        assert_eq!(&stored[9..12], &[0, 0, 0]);
    }

    #[test]
    fn test_reboot_to_same_mode_is_silent() {
        let mut flasher = boot_flasher();
        flasher.reboot_to(DeviceMode::Bootloader, true).unwrap();
        assert!(flasher.device().sent.is_empty());
        assert_eq!(flasher.mode(), Some(DeviceMode::Bootloader));
    }

    #[test]
    fn test_reboot_switches_mode() {
        let mut flasher = boot_flasher();
        flasher.reboot_to(DeviceMode::Firmware, true).unwrap();
        assert_eq!(flasher.mode(), Some(DeviceMode::Firmware));
    }

    #[test]
    fn test_reboot_without_reopen_leaves_closed() {
        let mut flasher = boot_flasher();
        flasher.reboot_to(DeviceMode::Firmware, false).unwrap();
        assert!(!flasher.is_open());
        assert_eq!(flasher.mode(), None);
    }

    #[test]
    fn test_reboot_fails_when_device_refuses() {
        let mut flasher = boot_flasher();
        // No valid firmware to boot into: the device re-enumerates as the
        // bootloader again
        flasher.device_mut().refuse_switch = true;
        let err = flasher.reboot_to(DeviceMode::Firmware, true).unwrap_err();
        assert!(matches!(err, Error::ModeSwitch(_)));
    }

    #[test]
    fn test_reset_send_tolerates_disconnect() {
        let mut flasher = boot_flasher();
        flasher.device_mut().fail_reset_send = true;
        flasher.reboot_to(DeviceMode::Firmware, true).unwrap();
        assert_eq!(flasher.mode(), Some(DeviceMode::Firmware));
    }

    #[test]
    fn test_unsupported_operations_on_rgb_table() {
        let profile = DeviceProfile::pok3r_rgb();
        let dev = SimDevice::new(profile.clone(), vec![profile.boot_pid]);
        let mut flasher = Ht32Flasher::new(dev, profile).with_settle(Duration::ZERO);
        flasher.open().unwrap();

        assert!(matches!(
            flasher.erase_flash(0x3400, 0x3500),
            Err(Error::Unsupported(_))
        ));
        assert!(matches!(
            flasher.check_flash(0x3400, &[0; 4]),
            Err(Error::Unsupported(_))
        ));
        assert!(matches!(
            flasher.device_info(),
            Err(Error::Unsupported(_))
        ));
        // Write is still available on the old table
        assert!(flasher.write_flash(0x3400, &[1, 2, 3]).is_ok());
    }

    #[test]
    fn test_erase_rejects_inverted_range() {
        let mut flasher = boot_flasher();
        assert!(matches!(
            flasher.erase_flash(0x4000, 0x3000),
            Err(Error::Flash(_))
        ));
    }

    #[test]
    fn test_commands_carry_crc_only_on_masterkeys() {
        let packet = Packet::encode(0x01, 0x01, &[0xAA], true).unwrap();
        assert_ne!(packet.crc_field(), 0);
        let packet = Packet::encode(0x1F, 0x00, &[0xAA], false).unwrap();
        assert_eq!(packet.crc_field(), 0);
        // Table flags select between the two
        assert!(CommandSet::masterkeys().check.is_some());
        assert!(masterkeys_profile().uses_crc);
        assert!(!DeviceProfile::pok3r_rgb().uses_crc);
    }
}
