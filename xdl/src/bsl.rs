// SPDX-License-Identifier: BSD-3-Clause
//! Spreadtrum/Unisoc BSL engine.
//!
//! Every message rides in an HDLC frame: 16-bit big-endian command type,
//! 16-bit big-endian payload length, payload. A session walks CONNECT →
//! FDL1 (staged into IRAM and executed, then the line speeds up to 921600)
//! → FDL2, after which partition I/O opens up. The optional signature
//! bypass for the T7xx family is just another staged payload, supplied by
//! the caller as opaque bytes and executed before FDL1.

use crate::error::{Error, FrameError, ProtocolError, Result, TransportError};
use crate::hdlc::{self, Deframer};
use crate::transport::Transport;
use crate::types::DeviceInfo;
use crate::watchdog::Watchdog;

pub const BSL_CMD_CONNECT: u16 = 0x0000;
pub const BSL_CMD_START_DATA: u16 = 0x0001;
pub const BSL_CMD_MIDST_DATA: u16 = 0x0002;
pub const BSL_CMD_END_DATA: u16 = 0x0003;
pub const BSL_CMD_EXEC_DATA: u16 = 0x0004;
pub const BSL_CMD_NORMAL_RESET: u16 = 0x0005;
pub const BSL_CMD_CHANGE_BAUD: u16 = 0x0009;
pub const BSL_CMD_ERASE_FLASH: u16 = 0x000A;
pub const BSL_CMD_READ_FLASH: u16 = 0x0010;
pub const BSL_CMD_READ_PARTITION_LIST: u16 = 0x0015;
pub const BSL_CMD_POWER_OFF: u16 = 0x0017;

pub const BSL_REP_ACK: u16 = 0x0080;
pub const BSL_REP_VER: u16 = 0x0081;
pub const BSL_REP_INVALID_CMD: u16 = 0x0082;
pub const BSL_REP_UNKNOWN_CMD: u16 = 0x0083;
pub const BSL_REP_OPERATION_FAILED: u16 = 0x0084;
pub const BSL_REP_NOT_SUPPORT_BAUDRATE: u16 = 0x0085;
pub const BSL_REP_DOWN_NOT_START: u16 = 0x0086;
pub const BSL_REP_VERIFY_ERROR: u16 = 0x008B;
pub const BSL_REP_READ_FLASH: u16 = 0x0093;

/// High line rate used once FDL1 runs.
pub const FDL_BAUD: u32 = 921_600;

/// UTF-16LE partition name field length (36 code units, NUL included).
const NAME_FIELD_LEN: usize = 72;

const DEFAULT_CHUNK: usize = 0x1000;
const MAX_MESSAGE: usize = 0x1_0000;

/// One BSL session from boot ROM to FDL2 partition I/O.
pub struct SpdDevice {
    pub rw: Box<dyn Transport>,
    pub info: DeviceInfo,
    /// Transfer unit for staging and partition windows; FDL2 reports its
    /// preference in its hello.
    pub chunk_size: usize,
    pub watchdog: Option<Watchdog>,
    deframer: Deframer,
}

impl SpdDevice {
    pub fn new(rw: Box<dyn Transport>) -> Self {
        Self {
            rw,
            info: DeviceInfo::default(),
            chunk_size: DEFAULT_CHUNK,
            watchdog: None,
            deframer: Deframer::new(MAX_MESSAGE),
        }
    }

    pub fn feed_watchdog(&self) {
        if let Some(dog) = &self.watchdog {
            dog.feed();
        }
    }
}

/// The two downloader stages plus their execution addresses, straight from
/// the caller's firmware package.
#[derive(Debug, Clone)]
pub struct FdlImage {
    pub fdl1: Vec<u8>,
    pub fdl1_addr: u32,
    pub fdl2: Vec<u8>,
    pub fdl2_addr: u32,
}

/// Opaque signature-bypass payload (T700/T760/T770 family) with its
/// chip-specific load address.
#[derive(Debug, Clone)]
pub struct SpdBypass {
    pub payload: Vec<u8>,
    pub addr: u32,
}

fn unexpected(phase: &str, detail: impl Into<String>) -> Error {
    ProtocolError::UnexpectedResponse {
        phase: format!("bsl {phase}"),
        detail: detail.into(),
    }
    .into()
}

fn rep_name(rep: u16) -> &'static str {
    match rep {
        BSL_REP_INVALID_CMD => "invalid command",
        BSL_REP_UNKNOWN_CMD => "unknown command",
        BSL_REP_OPERATION_FAILED => "operation failed",
        BSL_REP_NOT_SUPPORT_BAUDRATE => "unsupported baud rate",
        BSL_REP_DOWN_NOT_START => "download not started",
        BSL_REP_VERIFY_ERROR => "verification error",
        _ => "unrecognised reply",
    }
}

pub(crate) fn bsl_message(cmd: u16, payload: &[u8]) -> Vec<u8> {
    let mut msg = Vec::with_capacity(4 + payload.len());
    msg.extend(cmd.to_be_bytes());
    msg.extend((payload.len() as u16).to_be_bytes());
    msg.extend_from_slice(payload);
    msg
}

fn send_message(dev: &mut SpdDevice, cmd: u16, payload: &[u8]) -> Result<()> {
    if payload.len() > u16::MAX as usize {
        return Err(Error::InvalidArgument(format!(
            "BSL payload of {} bytes cannot be framed",
            payload.len()
        )));
    }
    let frame = hdlc::encode(&bsl_message(cmd, payload));
    dev.rw.send(&frame)?;
    Ok(())
}

fn read_message(dev: &mut SpdDevice) -> Result<(u16, Vec<u8>)> {
    loop {
        if let Some(msg) = dev.deframer.next_frame()? {
            if msg.len() < 4 {
                return Err(FrameError::Truncated.into());
            }
            let cmd = u16::from_be_bytes([msg[0], msg[1]]);
            let len = u16::from_be_bytes([msg[2], msg[3]]) as usize;
            if msg.len() - 4 != len {
                return Err(FrameError::BadFrame.into());
            }
            return Ok((cmd, msg[4..].to_vec()));
        }

        let mut buf = [0u8; 4096];
        match dev.rw.recv(&mut buf)? {
            0 => {
                return Err(TransportError::Timeout {
                    phase: "bsl response".into(),
                    elapsed: dev.rw.timeout(),
                }
                .into());
            }
            n => dev.deframer.push(&buf[..n]),
        }
    }
}

fn expect_ack(dev: &mut SpdDevice, phase: &str) -> Result<()> {
    let (rep, _) = read_message(dev)?;
    if rep == BSL_REP_ACK {
        return Ok(());
    }
    if rep == BSL_REP_VERIFY_ERROR {
        return Err(crate::error::SecurityError::SignatureRequired(format!(
            "device refused unsigned payload during {phase}"
        ))
        .into());
    }
    Err(ProtocolError::CommandRejected {
        device_msg: format!("{phase}: {} ({rep:#06x})", rep_name(rep)),
    }
    .into())
}

fn name_field(name: &str) -> Result<[u8; NAME_FIELD_LEN]> {
    let units: Vec<u16> = name.encode_utf16().collect();
    if units.len() >= NAME_FIELD_LEN / 2 {
        return Err(Error::InvalidArgument(format!(
            "partition name '{name}' exceeds {} UTF-16 units",
            NAME_FIELD_LEN / 2 - 1
        )));
    }
    let mut field = [0u8; NAME_FIELD_LEN];
    for (i, unit) in units.iter().enumerate() {
        field[2 * i..2 * i + 2].copy_from_slice(&unit.to_le_bytes());
    }
    Ok(field)
}

fn parse_name_field(field: &[u8]) -> String {
    let units: Vec<u16> = field
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .take_while(|&u| u != 0)
        .collect();
    String::from_utf16_lossy(&units)
}

/// CONNECT probe. The boot ROM (and each FDL stage after it) identifies
/// itself with a version string.
pub fn spd_connect(dev: &mut SpdDevice) -> Result<String> {
    send_message(dev, BSL_CMD_CONNECT, &[])?;
    let (rep, payload) = read_message(dev)?;
    match rep {
        BSL_REP_VER => {
            let ver = String::from_utf8_lossy(
                payload.split(|&b| b == 0).next().unwrap_or(&payload),
            )
            .into_owned();
            tracing::debug!(version = ver.as_str(), "BSL peer identity");
            Ok(ver)
        }
        BSL_REP_ACK => Ok(String::new()),
        other => Err(unexpected("connect", format!("reply {other:#06x}"))),
    }
}

/// Stage a blob at `addr`: START_DATA, chunked MIDST_DATA, END_DATA, and
/// optionally EXEC_DATA to jump into it.
pub fn spd_send_file(dev: &mut SpdDevice, addr: u32, data: &[u8], exec: bool) -> Result<()> {
    let mut start = Vec::with_capacity(8);
    start.extend(addr.to_be_bytes());
    start.extend((data.len() as u32).to_be_bytes());
    send_message(dev, BSL_CMD_START_DATA, &start)?;
    expect_ack(dev, "start_data")?;

    for chunk in data.chunks(dev.chunk_size) {
        dev.feed_watchdog();
        send_message(dev, BSL_CMD_MIDST_DATA, chunk)?;
        expect_ack(dev, "midst_data")?;
    }

    send_message(dev, BSL_CMD_END_DATA, &[])?;
    expect_ack(dev, "end_data")?;

    if exec {
        send_message(dev, BSL_CMD_EXEC_DATA, &addr.to_be_bytes())?;
        expect_ack(dev, "exec_data")?;
    }
    Ok(())
}

/// Renegotiate the line rate, device first, then our side of the wire.
pub fn spd_change_baud(dev: &mut SpdDevice, baud: u32) -> Result<()> {
    send_message(dev, BSL_CMD_CHANGE_BAUD, &baud.to_be_bytes())?;
    expect_ack(dev, "change_baud")?;
    dev.rw.set_baud(baud)?;
    Ok(())
}

/// FDL2's hello carries an ASCII identity, optionally followed by a
/// big-endian preferred transfer size. The 16-bit message length field
/// caps what we will honour.
fn parse_fdl2_hello(ver: &str, payload_tail: &[u8]) -> Option<usize> {
    if payload_tail.len() >= 4 {
        let chunk = u32::from_be_bytes(payload_tail[..4].try_into().unwrap()) as usize;
        if (0x400..=0xFFE0).contains(&chunk) {
            return Some(chunk);
        }
    }
    let _ = ver;
    None
}

fn spd_connect_with_tail(dev: &mut SpdDevice) -> Result<(String, Vec<u8>)> {
    send_message(dev, BSL_CMD_CONNECT, &[])?;
    let (rep, payload) = read_message(dev)?;
    if rep != BSL_REP_VER && rep != BSL_REP_ACK {
        return Err(unexpected("connect", format!("reply {rep:#06x}")));
    }
    let split = payload.iter().position(|&b| b == 0).unwrap_or(payload.len());
    let ver = String::from_utf8_lossy(&payload[..split]).into_owned();
    let tail = payload.get(split + 1..).unwrap_or(&[]).to_vec();
    Ok((ver, tail))
}

/// Stage FDL1 and FDL2 and leave the session in partition-I/O state.
///
/// `bypass`, when present, is executed before FDL1 staging; the engine
/// treats the payload as opaque configuration.
pub fn spd_stage_fdl(
    dev: &mut SpdDevice,
    fdl: &FdlImage,
    bypass: Option<&SpdBypass>,
) -> Result<()> {
    let rom_ver = spd_connect(dev)?;
    if !rom_ver.is_empty() {
        dev.info.chip_id = Some(rom_ver);
    }

    if let Some(bypass) = bypass {
        tracing::info!(
            addr = format_args!("{:#010x}", bypass.addr),
            len = bypass.payload.len(),
            "executing signature-bypass payload"
        );
        spd_send_file(dev, bypass.addr, &bypass.payload, true)?;
        // The ROM comes back around after the payload runs
        spd_connect(dev)?;
    }

    spd_send_file(dev, fdl.fdl1_addr, &fdl.fdl1, true)?;

    // FDL1 is up; greet it and move the line to full speed
    let fdl1_ver = spd_connect(dev)?;
    tracing::debug!(version = fdl1_ver.as_str(), "FDL1 running");
    spd_change_baud(dev, FDL_BAUD)?;

    spd_send_file(dev, fdl.fdl2_addr, &fdl.fdl2, true)?;

    let (fdl2_ver, tail) = spd_connect_with_tail(dev)?;
    if let Some(chunk) = parse_fdl2_hello(&fdl2_ver, &tail) {
        dev.chunk_size = chunk;
    }
    if !fdl2_ver.is_empty() {
        dev.info.chip_id.get_or_insert(fdl2_ver);
    }
    dev.info.max_download_size = Some(dev.chunk_size as u64);
    tracing::info!(chunk = dev.chunk_size, "FDL2 running, partition I/O ready");
    Ok(())
}

/// READ_FLASH windows: `{name[72] | length be32 | offset be32}` per
/// request, data coming back in READ_FLASH replies.
pub fn spd_read_partition(
    dev: &mut SpdDevice,
    name: &str,
    offset: u64,
    length: u64,
    out: &mut dyn std::io::Write,
) -> Result<()> {
    let field = name_field(name)?;
    let mut done: u64 = 0;
    while done < length {
        dev.feed_watchdog();
        let want = std::cmp::min(dev.chunk_size as u64, length - done) as u32;
        let at = offset + done;
        let at = u32::try_from(at).map_err(|_| {
            Error::InvalidArgument(format!("read offset {at:#x} beyond 32-bit range"))
        })?;

        let mut payload = Vec::with_capacity(NAME_FIELD_LEN + 8);
        payload.extend(field);
        payload.extend(want.to_be_bytes());
        payload.extend(at.to_be_bytes());
        send_message(dev, BSL_CMD_READ_FLASH, &payload)?;

        let (rep, data) = read_message(dev)?;
        if rep != BSL_REP_READ_FLASH {
            return Err(ProtocolError::CommandRejected {
                device_msg: format!("read_flash: {} ({rep:#06x})", rep_name(rep)),
            }
            .into());
        }
        if data.len() != want as usize {
            return Err(ProtocolError::DataPhaseMismatch {
                expected: want as u64,
                actual: data.len() as u64,
            }
            .into());
        }
        out.write_all(&data)?;
        done += data.len() as u64;
    }
    Ok(())
}

/// Partition write: START_DATA re-purposed with `{name[72] | total be32}`,
/// then the familiar MIDST/END cadence.
pub fn spd_write_partition<I>(dev: &mut SpdDevice, name: &str, total: u64, chunks: I) -> Result<()>
where
    I: IntoIterator<Item = Result<Vec<u8>>>,
{
    let total32 = u32::try_from(total)
        .map_err(|_| Error::InvalidArgument(format!("write of {total} bytes beyond 32-bit range")))?;

    let mut start = Vec::with_capacity(NAME_FIELD_LEN + 4);
    start.extend(name_field(name)?);
    start.extend(total32.to_be_bytes());
    send_message(dev, BSL_CMD_START_DATA, &start)?;
    expect_ack(dev, "write start")?;

    let mut sent: u64 = 0;
    for chunk in chunks {
        let chunk = chunk?;
        // Protocol frames cap one MIDST at 64 KiB; re-chunk defensively
        for piece in chunk.chunks(dev.chunk_size.min(u16::MAX as usize)) {
            dev.feed_watchdog();
            send_message(dev, BSL_CMD_MIDST_DATA, piece)?;
            expect_ack(dev, "write midst")?;
            sent += piece.len() as u64;
        }
    }
    if sent != total {
        return Err(ProtocolError::DataPhaseMismatch {
            expected: total,
            actual: sent,
        }
        .into());
    }

    send_message(dev, BSL_CMD_END_DATA, &[])?;
    expect_ack(dev, "write end")?;
    Ok(())
}

/// ERASE_FLASH by partition name.
pub fn spd_erase_partition(dev: &mut SpdDevice, name: &str) -> Result<()> {
    let field = name_field(name)?;
    send_message(dev, BSL_CMD_ERASE_FLASH, &field)?;
    expect_ack(dev, "erase")
}

/// Partition catalogue from FDL2: `{name[72] | size be32}` entries.
pub fn spd_partition_list(dev: &mut SpdDevice) -> Result<Vec<(String, u64)>> {
    send_message(dev, BSL_CMD_READ_PARTITION_LIST, &[])?;
    let (rep, payload) = read_message(dev)?;
    if rep != BSL_REP_ACK {
        return Err(ProtocolError::CommandRejected {
            device_msg: format!("partition list: {} ({rep:#06x})", rep_name(rep)),
        }
        .into());
    }

    const ENTRY_LEN: usize = NAME_FIELD_LEN + 4;
    if payload.len() % ENTRY_LEN != 0 {
        return Err(unexpected(
            "partition list",
            format!("{} bytes is not a whole entry count", payload.len()),
        ));
    }
    let mut entries = Vec::with_capacity(payload.len() / ENTRY_LEN);
    for entry in payload.chunks_exact(ENTRY_LEN) {
        let name = parse_name_field(&entry[..NAME_FIELD_LEN]);
        let size = u32::from_be_bytes(entry[NAME_FIELD_LEN..].try_into().unwrap()) as u64;
        entries.push((name, size));
    }
    Ok(entries)
}

/// Raw escape hatch: one framed request, one framed reply, no
/// interpretation beyond the message layer.
pub fn spd_execute_raw(
    dev: &mut SpdDevice,
    cmd: u16,
    payload: &[u8],
) -> Result<(u16, Vec<u8>)> {
    send_message(dev, cmd, payload)?;
    read_message(dev)
}

/// Reboot into the OS.
pub fn spd_reset(dev: &mut SpdDevice) -> Result<()> {
    send_message(dev, BSL_CMD_NORMAL_RESET, &[])?;
    expect_ack(dev, "reset")
}

/// Power the device down.
pub fn spd_power_off(dev: &mut SpdDevice) -> Result<()> {
    send_message(dev, BSL_CMD_POWER_OFF, &[])?;
    expect_ack(dev, "power off")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedTransport;

    fn framed(cmd: u16, payload: &[u8]) -> Vec<u8> {
        hdlc::encode(&bsl_message(cmd, payload))
    }

    fn device(script: ScriptedTransport) -> SpdDevice {
        SpdDevice::new(Box::new(script))
    }

    #[test]
    fn connect_reads_the_version_banner() {
        let script = ScriptedTransport::new()
            .expect(framed(BSL_CMD_CONNECT, &[]))
            .reply(framed(BSL_REP_VER, b"SPRD3\0"));
        let ver = spd_connect(&mut device(script)).unwrap();
        assert_eq!(ver, "SPRD3");
    }

    #[test]
    fn send_file_walks_start_midst_end_exec() {
        let blob = vec![0x61_u8; 0x1800]; // 1.5 chunks at the 0x1000 default
        let mut start = Vec::new();
        start.extend(0x5000_u32.to_be_bytes());
        start.extend(0x1800_u32.to_be_bytes());

        let script = ScriptedTransport::new()
            .expect(framed(BSL_CMD_START_DATA, &start))
            .reply(framed(BSL_REP_ACK, &[]))
            .expect(framed(BSL_CMD_MIDST_DATA, &blob[..0x1000]))
            .reply(framed(BSL_REP_ACK, &[]))
            .expect(framed(BSL_CMD_MIDST_DATA, &blob[0x1000..]))
            .reply(framed(BSL_REP_ACK, &[]))
            .expect(framed(BSL_CMD_END_DATA, &[]))
            .reply(framed(BSL_REP_ACK, &[]))
            .expect(framed(BSL_CMD_EXEC_DATA, &0x5000_u32.to_be_bytes()))
            .reply(framed(BSL_REP_ACK, &[]));

        spd_send_file(&mut device(script), 0x5000, &blob, true).unwrap();
    }

    #[test]
    fn operation_failure_names_the_reply() {
        let script = ScriptedTransport::new()
            .expect(framed(BSL_CMD_ERASE_FLASH, &name_field("nv").unwrap()))
            .reply(framed(BSL_REP_OPERATION_FAILED, &[]));
        let err = spd_erase_partition(&mut device(script), "nv").unwrap_err();
        match err {
            Error::Protocol(ProtocolError::CommandRejected { device_msg }) => {
                assert!(device_msg.contains("operation failed"));
            }
            other => panic!("wrong error: {other:?}"),
        }
    }

    #[test]
    fn verify_error_maps_to_signature_required() {
        let blob = vec![0u8; 16];
        let mut start = Vec::new();
        start.extend(0x1000_u32.to_be_bytes());
        start.extend(16_u32.to_be_bytes());

        let script = ScriptedTransport::new()
            .expect(framed(BSL_CMD_START_DATA, &start))
            .reply(framed(BSL_REP_VERIFY_ERROR, &[]));
        let err = spd_send_file(&mut device(script), 0x1000, &blob, false).unwrap_err();
        assert!(matches!(
            err,
            Error::Security(crate::error::SecurityError::SignatureRequired(_))
        ));
    }

    #[test]
    fn read_partition_windows_and_reassembles() {
        let mut dev_data = Vec::new();
        dev_data.extend([1u8, 2, 3, 4]);

        let field = name_field("nvram").unwrap();
        let mut req1 = Vec::new();
        req1.extend(field);
        req1.extend(4096_u32.to_be_bytes());
        req1.extend(0_u32.to_be_bytes());
        let mut req2 = Vec::new();
        req2.extend(field);
        req2.extend(4_u32.to_be_bytes());
        req2.extend(4096_u32.to_be_bytes());

        let script = ScriptedTransport::new()
            .expect(framed(BSL_CMD_READ_FLASH, &req1))
            .reply(framed(BSL_REP_READ_FLASH, &vec![0xEE; 4096]))
            .expect(framed(BSL_CMD_READ_FLASH, &req2))
            .reply(framed(BSL_REP_READ_FLASH, &dev_data));

        let mut out = Vec::new();
        spd_read_partition(&mut device(script), "nvram", 0, 4100, &mut out).unwrap();
        assert_eq!(out.len(), 4100);
        assert_eq!(&out[4096..], &[1, 2, 3, 4]);
    }

    #[test]
    fn write_partition_uses_the_name_flavoured_start() {
        let field = name_field("boot").unwrap();
        let mut start = Vec::new();
        start.extend(field);
        start.extend(8_u32.to_be_bytes());

        let script = ScriptedTransport::new()
            .expect(framed(BSL_CMD_START_DATA, &start))
            .reply(framed(BSL_REP_ACK, &[]))
            .expect(framed(BSL_CMD_MIDST_DATA, &[9, 9, 9, 9, 8, 8, 8, 8]))
            .reply(framed(BSL_REP_ACK, &[]))
            .expect(framed(BSL_CMD_END_DATA, &[]))
            .reply(framed(BSL_REP_ACK, &[]));

        spd_write_partition(
            &mut device(script),
            "boot",
            8,
            vec![Ok(vec![9, 9, 9, 9, 8, 8, 8, 8])],
        )
        .unwrap();
    }

    #[test]
    fn partition_list_parses_fixed_entries() {
        let mut payload = Vec::new();
        for (name, size) in [("boot", 0x800000_u32), ("userdata", 0x4000000)] {
            payload.extend(name_field(name).unwrap());
            payload.extend(size.to_be_bytes());
        }

        let script = ScriptedTransport::new()
            .expect(framed(BSL_CMD_READ_PARTITION_LIST, &[]))
            .reply(framed(BSL_REP_ACK, &payload));

        let list = spd_partition_list(&mut device(script)).unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0], ("boot".to_owned(), 0x800000));
        assert_eq!(list[1], ("userdata".to_owned(), 0x4000000));
    }

    #[test]
    fn fdl2_hello_chunk_size_is_adopted() {
        assert_eq!(parse_fdl2_hello("FDL2", &0x8000_u32.to_be_bytes()), Some(0x8000));
        assert_eq!(parse_fdl2_hello("FDL2", &[]), None);
        // Implausible sizes are ignored
        assert_eq!(parse_fdl2_hello("FDL2", &3_u32.to_be_bytes()), None);
    }

    #[test]
    fn staging_sequence_reaches_fdl2() {
        let fdl = FdlImage {
            fdl1: vec![0x11; 0x200],
            fdl1_addr: 0x5000,
            fdl2: vec![0x22; 0x300],
            fdl2_addr: 0x9efffe00,
        };

        let mut start1 = Vec::new();
        start1.extend(0x5000_u32.to_be_bytes());
        start1.extend(0x200_u32.to_be_bytes());
        let mut start2 = Vec::new();
        start2.extend(0x9efffe00_u32.to_be_bytes());
        start2.extend(0x300_u32.to_be_bytes());

        let mut fdl2_hello = b"FDL2-OK\0".to_vec();
        fdl2_hello.extend(0x8000_u32.to_be_bytes());

        let script = ScriptedTransport::new()
            .expect(framed(BSL_CMD_CONNECT, &[]))
            .reply(framed(BSL_REP_VER, b"SPRD3\0"))
            .expect(framed(BSL_CMD_START_DATA, &start1))
            .reply(framed(BSL_REP_ACK, &[]))
            .expect(framed(BSL_CMD_MIDST_DATA, &vec![0x11; 0x200]))
            .reply(framed(BSL_REP_ACK, &[]))
            .expect(framed(BSL_CMD_END_DATA, &[]))
            .reply(framed(BSL_REP_ACK, &[]))
            .expect(framed(BSL_CMD_EXEC_DATA, &0x5000_u32.to_be_bytes()))
            .reply(framed(BSL_REP_ACK, &[]))
            .expect(framed(BSL_CMD_CONNECT, &[]))
            .reply(framed(BSL_REP_VER, b"FDL1\0"))
            .expect(framed(BSL_CMD_CHANGE_BAUD, &FDL_BAUD.to_be_bytes()))
            .reply(framed(BSL_REP_ACK, &[]))
            .expect(framed(BSL_CMD_START_DATA, &start2))
            .reply(framed(BSL_REP_ACK, &[]))
            .expect(framed(BSL_CMD_MIDST_DATA, &vec![0x22; 0x300]))
            .reply(framed(BSL_REP_ACK, &[]))
            .expect(framed(BSL_CMD_END_DATA, &[]))
            .reply(framed(BSL_REP_ACK, &[]))
            .expect(framed(BSL_CMD_EXEC_DATA, &0x9efffe00_u32.to_be_bytes()))
            .reply(framed(BSL_REP_ACK, &[]))
            .expect(framed(BSL_CMD_CONNECT, &[]))
            .reply(framed(BSL_REP_VER, &fdl2_hello));

        let mut dev = device(script);
        spd_stage_fdl(&mut dev, &fdl, None).unwrap();
        assert_eq!(dev.chunk_size, 0x8000);
        assert_eq!(dev.info.chip_id.as_deref(), Some("SPRD3"));
    }
}
