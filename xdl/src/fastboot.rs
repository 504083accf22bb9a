// SPDX-License-Identifier: BSD-3-Clause
//! Android fastboot engine.
//!
//! ASCII commands, four-byte reply tags: `INFO` lines stream until a
//! terminal `OKAY`/`FAIL`, and `DATA<hex8>` opens a host-to-device phase of
//! exactly that many bytes. One command in flight at a time; the terminal
//! envelope is always consumed before the next command goes out. Images
//! larger than the advertised `max-download-size` are cut into sparse
//! pieces that carry their absolute block offsets, one `download`/`flash`
//! pair per piece.

use std::io::{Read, Seek, SeekFrom};

use crate::error::{Error, ProtocolError, Result, SecurityError, TransportError};
use crate::sparse::{self, SparseSplitter};
use crate::transport::Transport;
use crate::types::DeviceInfo;
use crate::watchdog::Watchdog;

/// Sparse scaffolding allowance when cutting to `max-download-size`: the
/// splitter bounds data payload, the headers ride on top.
pub(crate) const SPARSE_OVERHEAD: u64 = 64 * 1024;

const REPLY_BUF_LEN: usize = 512;
const DEFAULT_BLOCK_SIZE: u32 = 4096;

pub struct FastbootDevice {
    pub rw: Box<dyn Transport>,
    pub info: DeviceInfo,
    /// `max-download-size` as advertised by the bootloader
    pub max_download: u64,
    pub watchdog: Option<Watchdog>,
}

impl FastbootDevice {
    pub fn new(rw: Box<dyn Transport>) -> Self {
        Self {
            rw,
            info: DeviceInfo::default(),
            max_download: 0,
            watchdog: None,
        }
    }

    pub fn feed_watchdog(&self) {
        if let Some(dog) = &self.watchdog {
            dog.feed();
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Reply {
    Okay(String),
    Info(String),
    Data(u64),
    Fail(String),
}

fn unexpected(phase: &str, detail: impl Into<String>) -> Error {
    ProtocolError::UnexpectedResponse {
        phase: format!("fastboot {phase}"),
        detail: detail.into(),
    }
    .into()
}

fn read_reply(dev: &mut FastbootDevice, phase: &str) -> Result<Reply> {
    let mut buf = [0u8; REPLY_BUF_LEN];
    let n = dev.rw.recv(&mut buf)?;
    if n == 0 {
        return Err(TransportError::Timeout {
            phase: format!("fastboot {phase}"),
            elapsed: dev.rw.timeout(),
        }
        .into());
    }
    if n < 4 {
        return Err(unexpected(phase, format!("{n}-byte reply")));
    }

    let tag = &buf[..4];
    let rest = String::from_utf8_lossy(&buf[4..n]).into_owned();
    match tag {
        b"OKAY" => Ok(Reply::Okay(rest)),
        b"INFO" => Ok(Reply::Info(rest)),
        b"FAIL" => Ok(Reply::Fail(rest)),
        b"DATA" => {
            let size = u64::from_str_radix(rest.trim(), 16)
                .map_err(|_| unexpected(phase, format!("DATA size '{rest}'")))?;
            Ok(Reply::Data(size))
        }
        other => Err(unexpected(
            phase,
            format!("reply tag {:?}", String::from_utf8_lossy(other)),
        )),
    }
}

/// Send one command and consume envelopes until the terminal one. INFO
/// lines are traced; OKAY's payload is the return value.
fn command(dev: &mut FastbootDevice, cmd: &str) -> Result<String> {
    tracing::trace!(cmd, "fastboot command");
    dev.rw.send(cmd.as_bytes())?;
    loop {
        match read_reply(dev, cmd)? {
            Reply::Info(line) => tracing::info!(target: "fastboot", "{line}"),
            Reply::Okay(value) => return Ok(value),
            Reply::Fail(msg) => {
                return Err(ProtocolError::CommandRejected { device_msg: msg }.into());
            }
            Reply::Data(_) => {
                return Err(unexpected(cmd, "unsolicited DATA phase"));
            }
        }
    }
}

pub fn fb_getvar(dev: &mut FastbootDevice, var: &str) -> Result<String> {
    command(dev, &format!("getvar:{var}"))
}

/// Literal command passthrough (`oem ...` and friends): one command out,
/// envelopes consumed to the terminal, OKAY payload back.
pub fn fb_raw_command(dev: &mut FastbootDevice, cmd: &str) -> Result<String> {
    command(dev, cmd)
}

fn parse_size(s: &str) -> Option<u64> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else {
        s.parse().ok()
    }
}

/// Populate [`DeviceInfo`] from the standard variables. Absent variables
/// are not an error; bootloaders differ in what they implement.
pub fn fb_connect(dev: &mut FastbootDevice) -> Result<()> {
    if let Ok(size) = fb_getvar(dev, "max-download-size") {
        dev.max_download = parse_size(&size).unwrap_or(0);
        dev.info.max_download_size = Some(dev.max_download);
    }
    if let Ok(product) = fb_getvar(dev, "product") {
        if !product.is_empty() {
            dev.info.chip_id = Some(product);
        }
    }
    if let Ok(slot) = fb_getvar(dev, "current-slot") {
        let slot = slot.trim_start_matches('_').to_owned();
        if !slot.is_empty() {
            dev.info.current_slot = Some(slot);
        }
    }
    if let Ok(secure) = fb_getvar(dev, "secure") {
        dev.info.secure_boot = Some(secure.trim() == "yes");
    }
    tracing::info!(summary = dev.info.summary().as_str(), "fastboot device");
    Ok(())
}

/// `download:` + data phase. A zero-length download completes on the next
/// terminal envelope with no data bytes in between.
pub fn fb_download(dev: &mut FastbootDevice, data: &[u8]) -> Result<()> {
    if dev.max_download > 0 && data.len() as u64 > dev.max_download {
        return Err(Error::InvalidArgument(format!(
            "{} bytes exceed max-download-size {}",
            data.len(),
            dev.max_download
        )));
    }

    let cmd = format!("download:{:08x}", data.len());
    dev.rw.send(cmd.as_bytes())?;

    let declared = loop {
        match read_reply(dev, "download")? {
            Reply::Info(line) => tracing::info!(target: "fastboot", "{line}"),
            Reply::Data(size) => break size,
            Reply::Fail(msg) => {
                return Err(ProtocolError::CommandRejected { device_msg: msg }.into());
            }
            Reply::Okay(_) => return Err(unexpected("download", "OKAY before data phase")),
        }
    };
    if declared != data.len() as u64 {
        return Err(ProtocolError::DataPhaseMismatch {
            expected: data.len() as u64,
            actual: declared,
        }
        .into());
    }

    if !data.is_empty() {
        dev.rw.send(data)?;
        dev.feed_watchdog();
    }

    loop {
        match read_reply(dev, "download data")? {
            Reply::Info(line) => tracing::info!(target: "fastboot", "{line}"),
            Reply::Okay(_) => return Ok(()),
            Reply::Fail(msg) => {
                return Err(ProtocolError::CommandRejected { device_msg: msg }.into());
            }
            Reply::Data(_) => return Err(unexpected("download data", "nested DATA phase")),
        }
    }
}

fn locked_aware(err: Error) -> Error {
    if let Error::Protocol(ProtocolError::CommandRejected { device_msg }) = &err {
        let lower = device_msg.to_lowercase();
        if lower.contains("lock") && !lower.contains("unlock command") {
            return SecurityError::DeviceLocked(device_msg.clone()).into();
        }
    }
    err
}

pub fn fb_flash(dev: &mut FastbootDevice, partition: &str) -> Result<()> {
    command(dev, &format!("flash:{partition}"))
        .map(drop)
        .map_err(locked_aware)
}

pub fn fb_erase(dev: &mut FastbootDevice, partition: &str) -> Result<()> {
    command(dev, &format!("erase:{partition}"))
        .map(drop)
        .map_err(locked_aware)
}

/// `boot`: run the last downloaded image without flashing it.
pub fn fb_boot(dev: &mut FastbootDevice) -> Result<()> {
    command(dev, "boot").map(drop)
}

pub fn fb_continue(dev: &mut FastbootDevice) -> Result<()> {
    command(dev, "continue").map(drop)
}

pub fn fb_reboot(dev: &mut FastbootDevice) -> Result<()> {
    command(dev, "reboot").map(drop)
}

pub fn fb_reboot_bootloader(dev: &mut FastbootDevice) -> Result<()> {
    command(dev, "reboot-bootloader").map(drop)
}

pub fn fb_set_active(dev: &mut FastbootDevice, slot: &str) -> Result<()> {
    let slot = slot.trim_start_matches('_');
    command(dev, &format!("set_active:{slot}")).map(drop)?;
    dev.info.current_slot = Some(slot.to_owned());
    Ok(())
}

/// `flashing unlock|lock`. Expect user interaction on the device side;
/// a refusal surfaces as [`SecurityError::DeviceLocked`].
pub fn fb_flashing(dev: &mut FastbootDevice, subcmd: &str) -> Result<()> {
    match subcmd {
        "unlock" | "lock" | "unlock_critical" | "lock_critical" => {}
        other => {
            return Err(Error::InvalidArgument(format!(
                "unknown flashing subcommand '{other}'"
            )));
        }
    }
    command(dev, &format!("flashing {subcmd}"))
        .map(drop)
        .map_err(locked_aware)
}

/// Route a slotless partition name to the active slot on A/B devices.
pub fn fb_resolve_slot(dev: &FastbootDevice, partition: &str) -> String {
    if partition.ends_with("_a") || partition.ends_with("_b") {
        return partition.to_owned();
    }
    match &dev.info.current_slot {
        Some(slot) => format!("{partition}_{slot}"),
        None => partition.to_owned(),
    }
}

/// Flash an image, cutting it into offset-preserving sparse pieces when it
/// exceeds what the bootloader will take in one download.
pub fn fb_flash_image<S>(dev: &mut FastbootDevice, partition: &str, src: &mut S) -> Result<()>
where
    S: Read + Seek + ?Sized,
{
    let len = src.seek(SeekFrom::End(0))?;
    src.seek(SeekFrom::Start(0))?;

    let whole_fits = dev.max_download == 0 || len <= dev.max_download;
    if whole_fits {
        let mut data = vec![0u8; len as usize];
        src.read_exact(&mut data)?;
        fb_download(dev, &data)?;
        fb_flash(dev, partition)?;
        return Ok(());
    }

    let budget = dev.max_download.saturating_sub(SPARSE_OVERHEAD);
    let splitter = if sparse::is_sparse_image(src)? {
        SparseSplitter::from_sparse(&mut *src, budget)?
    } else {
        SparseSplitter::from_raw(&mut *src, DEFAULT_BLOCK_SIZE, budget)?
    };

    let total = splitter.piece_count();
    tracing::info!(
        partition,
        pieces = total,
        image_bytes = len,
        "image exceeds max-download-size, sending sparse pieces"
    );
    for piece in splitter {
        let piece = piece?;
        dev.feed_watchdog();
        tracing::debug!(
            index = piece.index + 1,
            total = piece.total,
            first_block = piece.first_block,
            bytes = piece.bytes.len(),
            "flashing sparse piece"
        );
        fb_download(dev, &piece.bytes)?;
        fb_flash(dev, partition)?;
    }
    Ok(())
}

/// `getvar:all` sweep: bootloaders that support it answer with one INFO
/// line per variable, `name: value`. Returns the pairs in device order.
pub fn fb_getvar_all(dev: &mut FastbootDevice) -> Result<Vec<(String, String)>> {
    dev.rw.send(b"getvar:all")?;
    let mut vars = Vec::new();
    loop {
        match read_reply(dev, "getvar:all")? {
            Reply::Info(line) => {
                if let Some((name, value)) = line.rsplit_once(':') {
                    vars.push((name.trim().to_owned(), value.trim().to_owned()));
                }
            }
            Reply::Okay(_) => return Ok(vars),
            Reply::Fail(msg) => {
                return Err(ProtocolError::CommandRejected { device_msg: msg }.into());
            }
            Reply::Data(_) => return Err(unexpected("getvar:all", "unsolicited DATA phase")),
        }
    }
}

/// Partition geometry over getvar, for the unified partition model.
pub fn fb_partition_size(dev: &mut FastbootDevice, partition: &str) -> Result<Option<u64>> {
    match fb_getvar(dev, &format!("partition-size:{partition}")) {
        Ok(size) => Ok(parse_size(&size)),
        Err(Error::Protocol(ProtocolError::CommandRejected { .. })) => Ok(None),
        Err(e) => Err(e),
    }
}
