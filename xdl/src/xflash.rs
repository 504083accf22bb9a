// SPDX-License-Identifier: BSD-3-Clause
//! MediaTek DA "XFlash" (v5) dialect, plus the framed envelope both DA
//! dialects share.
//!
//! Every message is `magic | data-type | length | payload` with
//! little-endian words. Commands are 32-bit words in the `0x01xxxx` range;
//! the `0x0F0000..0x0FFFFF` band is reserved for vendor extension commands
//! and is exposed here only as a raw escape hatch. Each step of a command
//! is acknowledged with a 32-bit status frame, 0 meaning fine.

use crate::brom::MtkDevice;
use crate::error::{Error, FrameError, ProtocolError, Result};
use crate::transport::Transport;
use crate::types::DaMode;

pub(crate) const DA_MAGIC: u32 = 0xFEEE_EEEF;
pub(crate) const DT_PROTOCOL_FLOW: u32 = 1;
pub(crate) const DT_MESSAGE: u32 = 2;

const FRAME_HEADER_LEN: usize = 12;
const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;
const PARTITION_NAME_LEN: usize = 64;

pub const CMD_DOWNLOAD: u32 = 0x01_0001;
pub const CMD_UPLOAD: u32 = 0x01_0002;
pub const CMD_FORMAT: u32 = 0x01_0003;
pub const CMD_WRITE_DATA: u32 = 0x01_0004;
pub const CMD_READ_DATA: u32 = 0x01_0005;
pub const CMD_FORMAT_PARTITION: u32 = 0x01_0006;
pub const CMD_SHUTDOWN: u32 = 0x01_0007;
pub const CMD_BOOT_TO: u32 = 0x01_0008;
pub const CMD_DEVICE_CTRL: u32 = 0x01_0009;
pub const CMD_PROGRESS_REPORT: u32 = 0x01_000A;

/// Vendor-reserved extension band (custom unlock commands live here)
pub const CMD_EXT_FIRST: u32 = 0x0F_0000;
pub const CMD_EXT_LAST: u32 = 0x0F_FFFF;

pub const CTRL_GET_PARTITION_TABLE: u32 = 0x04_0001;
pub const CTRL_GET_STORAGE_INFO: u32 = 0x04_0002;

fn unexpected(phase: &str, detail: impl Into<String>) -> Error {
    ProtocolError::UnexpectedResponse {
        phase: format!("xflash {phase}"),
        detail: detail.into(),
    }
    .into()
}

pub(crate) fn send_frame(dev: &mut MtkDevice, dtype: u32, payload: &[u8]) -> Result<()> {
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.extend(DA_MAGIC.to_le_bytes());
    frame.extend(dtype.to_le_bytes());
    frame.extend((payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(payload);
    dev.rw.send(&frame)?;
    Ok(())
}

pub(crate) fn read_frame(dev: &mut MtkDevice) -> Result<(u32, Vec<u8>)> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    dev.rw.recv_exact(&mut header, "da frame header")?;

    let magic = u32::from_le_bytes(header[0..4].try_into().unwrap());
    if magic != DA_MAGIC {
        return Err(FrameError::BadFrame.into());
    }
    let dtype = u32::from_le_bytes(header[4..8].try_into().unwrap());
    let length = u32::from_le_bytes(header[8..12].try_into().unwrap()) as usize;
    if length > MAX_FRAME_LEN {
        return Err(FrameError::Oversize {
            limit: MAX_FRAME_LEN,
        }
        .into());
    }

    let mut payload = vec![0u8; length];
    dev.rw.recv_exact(&mut payload, "da frame body")?;
    Ok((dtype, payload))
}

fn read_status(dev: &mut MtkDevice, phase: &str) -> Result<()> {
    let (_, payload) = read_frame(dev)?;
    if payload.len() < 4 {
        return Err(unexpected(phase, "short status frame"));
    }
    let status = u32::from_le_bytes(payload[..4].try_into().unwrap());
    if status != 0 {
        return Err(ProtocolError::CommandRejected {
            device_msg: format!("xflash {phase} status {status:#010x}"),
        }
        .into());
    }
    Ok(())
}

fn send_cmd(dev: &mut MtkDevice, cmd: u32, phase: &str) -> Result<()> {
    send_frame(dev, DT_PROTOCOL_FLOW, &cmd.to_le_bytes())?;
    read_status(dev, phase)
}

fn ack_ok(dev: &mut MtkDevice) -> Result<()> {
    send_frame(dev, DT_PROTOCOL_FLOW, &0u32.to_le_bytes())
}

fn name_field(name: &str) -> Result<[u8; PARTITION_NAME_LEN]> {
    let bytes = name.as_bytes();
    if bytes.len() >= PARTITION_NAME_LEN {
        return Err(Error::InvalidArgument(format!(
            "partition name '{name}' exceeds {} bytes",
            PARTITION_NAME_LEN - 1
        )));
    }
    let mut field = [0u8; PARTITION_NAME_LEN];
    field[..bytes.len()].copy_from_slice(bytes);
    Ok(field)
}

/// Wait for the agent's `SYNC` greeting after it takes over the pipe.
pub fn da_wait_sync(dev: &mut MtkDevice) -> Result<()> {
    let (_, payload) = read_frame(dev)?;
    if payload != b"SYNC" {
        return Err(unexpected("sync", format!("greeting {payload:02x?}")));
    }
    Ok(())
}

/// `BOOT_TO`: hand DA1 the second stage and transfer control to it.
pub fn da_boot_to(dev: &mut MtkDevice, addr: u32, image: &[u8]) -> Result<()> {
    send_cmd(dev, CMD_BOOT_TO, "boot_to")?;

    let mut params = Vec::with_capacity(16);
    params.extend((addr as u64).to_le_bytes());
    params.extend((image.len() as u64).to_le_bytes());
    send_frame(dev, DT_PROTOCOL_FLOW, &params)?;
    read_status(dev, "boot_to params")?;

    send_frame(dev, DT_MESSAGE, image)?;
    dev.feed_watchdog();
    read_status(dev, "boot_to image")?;
    Ok(())
}

/// Classify the second stage from its greeting: XFlash agents repeat the
/// binary `SYNC`, XML agents announce themselves with a document.
pub fn da_detect_dialect(dev: &mut MtkDevice) -> Result<DaMode> {
    let (_, payload) = read_frame(dev)?;
    if payload == b"SYNC" {
        return Ok(DaMode::XFlash);
    }
    let text = String::from_utf8_lossy(&payload);
    if text.contains("<da>") || text.starts_with("<?xml") {
        return Ok(DaMode::Xml);
    }
    Err(unexpected("dialect", format!("unrecognised greeting {payload:02x?}")))
}

/// `DOWNLOAD`: open a named-partition write of `total` bytes, then stream
/// `chunks`. The agent acknowledges the setup, every chunk, and the close.
pub fn xflash_write_partition<I>(dev: &mut MtkDevice, name: &str, total: u64, chunks: I) -> Result<()>
where
    I: IntoIterator<Item = Result<Vec<u8>>>,
{
    send_cmd(dev, CMD_DOWNLOAD, "download")?;

    let mut params = Vec::with_capacity(PARTITION_NAME_LEN + 8);
    params.extend(name_field(name)?);
    params.extend(total.to_le_bytes());
    send_frame(dev, DT_PROTOCOL_FLOW, &params)?;
    read_status(dev, "download params")?;

    let mut sent: u64 = 0;
    for chunk in chunks {
        let chunk = chunk?;
        dev.feed_watchdog();
        send_frame(dev, DT_MESSAGE, &chunk)?;
        read_status(dev, "download data")?;
        sent += chunk.len() as u64;
    }
    if sent != total {
        return Err(ProtocolError::DataPhaseMismatch {
            expected: total,
            actual: sent,
        }
        .into());
    }
    read_status(dev, "download close")?;
    Ok(())
}

/// `UPLOAD`: read a window of a named partition. Data arrives in
/// agent-sized frames, each acknowledged by the host.
pub fn xflash_read_partition(
    dev: &mut MtkDevice,
    name: &str,
    offset: u64,
    length: u64,
    out: &mut dyn std::io::Write,
) -> Result<()> {
    send_cmd(dev, CMD_UPLOAD, "upload")?;

    let mut params = Vec::with_capacity(PARTITION_NAME_LEN + 16);
    params.extend(name_field(name)?);
    params.extend(offset.to_le_bytes());
    params.extend(length.to_le_bytes());
    send_frame(dev, DT_PROTOCOL_FLOW, &params)?;
    read_status(dev, "upload params")?;

    let mut received: u64 = 0;
    while received < length {
        dev.feed_watchdog();
        let (_, payload) = read_frame(dev)?;
        if payload.is_empty() || received + payload.len() as u64 > length {
            return Err(ProtocolError::DataPhaseMismatch {
                expected: length,
                actual: received + payload.len() as u64,
            }
            .into());
        }
        out.write_all(&payload)?;
        received += payload.len() as u64;
        ack_ok(dev)?;
    }
    read_status(dev, "upload close")?;
    Ok(())
}

/// `FORMAT_PARTITION`: wipe one named partition.
pub fn xflash_erase_partition(dev: &mut MtkDevice, name: &str) -> Result<()> {
    send_cmd(dev, CMD_FORMAT_PARTITION, "format")?;
    send_frame(dev, DT_PROTOCOL_FLOW, &name_field(name)?)?;
    read_status(dev, "format params")?;
    read_status(dev, "format done")?;
    Ok(())
}

/// `DEVICE_CTRL`: control-code query returning one response payload.
pub fn xflash_device_ctrl(dev: &mut MtkDevice, ctrl: u32, args: &[u8]) -> Result<Vec<u8>> {
    send_cmd(dev, CMD_DEVICE_CTRL, "device_ctrl")?;
    let mut params = Vec::with_capacity(4 + args.len());
    params.extend(ctrl.to_le_bytes());
    params.extend_from_slice(args);
    send_frame(dev, DT_PROTOCOL_FLOW, &params)?;
    read_status(dev, "device_ctrl params")?;

    let (_, payload) = read_frame(dev)?;
    read_status(dev, "device_ctrl close")?;
    Ok(payload)
}

/// Storage geometry as reported over `DEVICE_CTRL`.
#[derive(Debug, Clone, Copy)]
pub struct XflashStorageInfo {
    pub storage: u32,
    pub block_size: u32,
    pub total_bytes: u64,
    /// Largest data frame the agent accepts
    pub max_packet: u32,
}

pub fn xflash_get_storage_info(dev: &mut MtkDevice) -> Result<XflashStorageInfo> {
    let payload = xflash_device_ctrl(dev, CTRL_GET_STORAGE_INFO, &[])?;
    if payload.len() < 20 {
        return Err(unexpected("storage info", "short payload"));
    }
    let info = XflashStorageInfo {
        storage: u32::from_le_bytes(payload[0..4].try_into().unwrap()),
        block_size: u32::from_le_bytes(payload[4..8].try_into().unwrap()),
        total_bytes: u64::from_le_bytes(payload[8..16].try_into().unwrap()),
        max_packet: u32::from_le_bytes(payload[16..20].try_into().unwrap()),
    };
    dev.max_packet = info.max_packet as usize;
    Ok(info)
}

/// Partition catalogue entry: `name[64] | start_byte u64 | length u64`.
pub fn xflash_get_partition_table(dev: &mut MtkDevice) -> Result<Vec<(String, u64, u64)>> {
    let payload = xflash_device_ctrl(dev, CTRL_GET_PARTITION_TABLE, &[])?;
    const ENTRY_LEN: usize = PARTITION_NAME_LEN + 16;
    if payload.len() % ENTRY_LEN != 0 {
        return Err(unexpected(
            "partition table",
            format!("payload of {} bytes is not a whole entry count", payload.len()),
        ));
    }

    let mut entries = Vec::with_capacity(payload.len() / ENTRY_LEN);
    for entry in payload.chunks_exact(ENTRY_LEN) {
        let name_end = entry[..PARTITION_NAME_LEN]
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(PARTITION_NAME_LEN);
        let name = String::from_utf8_lossy(&entry[..name_end]).into_owned();
        let start = u64::from_le_bytes(entry[64..72].try_into().unwrap());
        let len = u64::from_le_bytes(entry[72..80].try_into().unwrap());
        entries.push((name, start, len));
    }
    Ok(entries)
}

/// `SHUTDOWN`: leave download mode (the agent reboots or powers off per
/// its own configuration).
pub fn xflash_shutdown(dev: &mut MtkDevice) -> Result<()> {
    send_cmd(dev, CMD_SHUTDOWN, "shutdown")
}

/// Raw escape hatch for the vendor-reserved extension band. The caller
/// owns the payload layout; the agent must answer with one response frame
/// before its closing status.
pub fn xflash_execute_raw(dev: &mut MtkDevice, cmd: u32, payload: &[u8]) -> Result<Vec<u8>> {
    if !(CMD_EXT_FIRST..=CMD_EXT_LAST).contains(&cmd) {
        return Err(Error::InvalidArgument(format!(
            "command {cmd:#x} is outside the extension band"
        )));
    }
    send_cmd(dev, cmd, "extension")?;
    send_frame(dev, DT_PROTOCOL_FLOW, payload)?;
    read_status(dev, "extension params")?;
    let (_, response) = read_frame(dev)?;
    read_status(dev, "extension close")?;
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedTransport;

    fn frame(dtype: u32, payload: &[u8]) -> Vec<u8> {
        let mut f = Vec::new();
        f.extend(DA_MAGIC.to_le_bytes());
        f.extend(dtype.to_le_bytes());
        f.extend((payload.len() as u32).to_le_bytes());
        f.extend_from_slice(payload);
        f
    }

    fn ok_status() -> Vec<u8> {
        frame(DT_PROTOCOL_FLOW, &0u32.to_le_bytes())
    }

    fn device(script: ScriptedTransport) -> MtkDevice {
        MtkDevice::new(Box::new(script))
    }

    #[test]
    fn sync_greeting_is_recognised() {
        let script = ScriptedTransport::new().reply(frame(DT_PROTOCOL_FLOW, b"SYNC"));
        da_wait_sync(&mut device(script)).unwrap();
    }

    #[test]
    fn dialect_detection_tells_xflash_from_xml() {
        let script = ScriptedTransport::new().reply(frame(DT_PROTOCOL_FLOW, b"SYNC"));
        assert_eq!(da_detect_dialect(&mut device(script)).unwrap(), DaMode::XFlash);

        let banner = br#"<?xml version="1.0"?><da><version>1.0</version></da>"#;
        let script = ScriptedTransport::new().reply(frame(DT_PROTOCOL_FLOW, banner));
        assert_eq!(da_detect_dialect(&mut device(script)).unwrap(), DaMode::Xml);
    }

    #[test]
    fn bad_magic_is_a_frame_error() {
        let mut bad = frame(DT_PROTOCOL_FLOW, b"SYNC");
        bad[0] = 0;
        let script = ScriptedTransport::new().reply(bad);
        let err = da_wait_sync(&mut device(script)).unwrap_err();
        assert!(matches!(err, Error::Frame(FrameError::BadFrame)));
    }

    #[test]
    fn write_partition_streams_and_checks_totals() {
        let name = "boot";
        let mut params = name_field(name).unwrap().to_vec();
        params.extend(32u64.to_le_bytes());

        let chunk_a = vec![0x41_u8; 16];
        let chunk_b = vec![0x42_u8; 16];

        let script = ScriptedTransport::new()
            .expect(frame(DT_PROTOCOL_FLOW, &CMD_DOWNLOAD.to_le_bytes()))
            .reply(ok_status())
            .expect(frame(DT_PROTOCOL_FLOW, &params))
            .reply(ok_status())
            .expect(frame(DT_MESSAGE, &chunk_a))
            .reply(ok_status())
            .expect(frame(DT_MESSAGE, &chunk_b))
            .reply(ok_status())
            .reply(ok_status()); // close

        let chunks = vec![Ok(chunk_a.clone()), Ok(chunk_b.clone())];
        xflash_write_partition(&mut device(script), name, 32, chunks).unwrap();
    }

    #[test]
    fn short_write_is_a_data_phase_mismatch() {
        let name = "boot";
        let mut params = name_field(name).unwrap().to_vec();
        params.extend(32u64.to_le_bytes());
        let chunk = vec![0x41_u8; 16];

        let script = ScriptedTransport::new()
            .expect(frame(DT_PROTOCOL_FLOW, &CMD_DOWNLOAD.to_le_bytes()))
            .reply(ok_status())
            .expect(frame(DT_PROTOCOL_FLOW, &params))
            .reply(ok_status())
            .expect(frame(DT_MESSAGE, &chunk))
            .reply(ok_status());

        let chunks = vec![Ok(chunk.clone())];
        let err = xflash_write_partition(&mut device(script), name, 32, chunks).unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::DataPhaseMismatch {
                expected: 32,
                actual: 16
            })
        ));
    }

    #[test]
    fn read_partition_acks_each_frame() {
        let name = "nvram";
        let mut params = name_field(name).unwrap().to_vec();
        params.extend(0u64.to_le_bytes());
        params.extend(8u64.to_le_bytes());

        let script = ScriptedTransport::new()
            .expect(frame(DT_PROTOCOL_FLOW, &CMD_UPLOAD.to_le_bytes()))
            .reply(ok_status())
            .expect(frame(DT_PROTOCOL_FLOW, &params))
            .reply(ok_status())
            .reply(frame(DT_MESSAGE, &[1, 2, 3, 4]))
            .expect(ok_status())
            .reply(frame(DT_MESSAGE, &[5, 6, 7, 8]))
            .expect(ok_status())
            .reply(ok_status()); // close

        let mut out = Vec::new();
        xflash_read_partition(&mut device(script), name, 0, 8, &mut out).unwrap();
        assert_eq!(out, vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn partition_table_parses_fixed_entries() {
        let mut payload = Vec::new();
        for (name, start, len) in [("boot", 0x4000_u64, 0x2000_u64), ("userdata", 0x8000, 0x10000)]
        {
            let mut entry = [0u8; 80];
            entry[..name.len()].copy_from_slice(name.as_bytes());
            entry[64..72].copy_from_slice(&start.to_le_bytes());
            entry[72..80].copy_from_slice(&len.to_le_bytes());
            payload.extend(entry);
        }

        let mut params = Vec::new();
        params.extend(CTRL_GET_PARTITION_TABLE.to_le_bytes());

        let script = ScriptedTransport::new()
            .expect(frame(DT_PROTOCOL_FLOW, &CMD_DEVICE_CTRL.to_le_bytes()))
            .reply(ok_status())
            .expect(frame(DT_PROTOCOL_FLOW, &params))
            .reply(ok_status())
            .reply(frame(DT_MESSAGE, &payload))
            .reply(ok_status());

        let table = xflash_get_partition_table(&mut device(script)).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table[0], ("boot".to_owned(), 0x4000, 0x2000));
        assert_eq!(table[1], ("userdata".to_owned(), 0x8000, 0x10000));
    }

    #[test]
    fn extension_commands_must_stay_in_their_band() {
        let script = ScriptedTransport::new();
        let err = xflash_execute_raw(&mut device(script), CMD_DOWNLOAD, &[]).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn nonzero_status_carries_the_code() {
        let script = ScriptedTransport::new()
            .expect(frame(DT_PROTOCOL_FLOW, &CMD_SHUTDOWN.to_le_bytes()))
            .reply(frame(DT_PROTOCOL_FLOW, &0xC001_0004_u32.to_le_bytes()));
        let err = xflash_shutdown(&mut device(script)).unwrap_err();
        match err {
            Error::Protocol(ProtocolError::CommandRejected { device_msg }) => {
                assert!(device_msg.contains("0xc0010004"));
            }
            other => panic!("wrong error: {other:?}"),
        }
    }
}
