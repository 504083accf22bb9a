// SPDX-License-Identifier: BSD-3-Clause
//! Qualcomm Sahara: the EDL-mode protocol that gets a Firehose programmer
//! onto the device.
//!
//! Four-phase exchange: the device opens with a Hello, the host answers
//! with the mode it wants, the device then pulls the loader through
//! repeated ReadData windows, and an EndOfImage/Done handshake closes the
//! transfer. A command mode bolted onto the same packet format hands out
//! chip identity before the image transfer starts.

use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};

use crate::error::{Error, ProtocolError, Result, SecurityError};
use crate::transport::Transport;
use crate::types::QcomChan;

pub const SAHARA_VERSION: u32 = 2;
pub const SAHARA_COMPATIBLE_VERSION: u32 = 1;

/// File id EDL devices conventionally request the programmer under.
pub const SAHARA_PROGRAMMER_IMAGE_ID: u32 = 0x0D;

const HANDSHAKE_RETRIES: u32 = 3;
const MAX_PACKET_LEN: u32 = 1024 * 1024;

#[derive(Serialize_repr, Deserialize_repr, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SaharaCommand {
    Hello = 0x01,
    HelloResponse = 0x02,
    ReadData = 0x03,
    EndOfImage = 0x04,
    Done = 0x05,
    DoneResponse = 0x06,
    Reset = 0x07,
    MemoryDebug = 0x08,
    MemoryRead = 0x09,
    CommandReady = 0x0B,
    CommandSwitchMode = 0x0C,
    CommandExecute = 0x0D,
    CommandExecuteResponse = 0x0E,
    CommandExecuteData = 0x0F,
    MemoryRead64 = 0x11,
    ReadData64 = 0x12,
}

#[derive(Serialize_repr, Deserialize_repr, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SaharaMode {
    ImageTxPending = 0x0,
    ImageTxComplete = 0x1,
    MemoryDebug = 0x2,
    Command = 0x3,
}

/// Requests the command mode can run before any image is transferred.
#[derive(Serialize_repr, Deserialize_repr, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SaharaCmdModeCmd {
    ReadSerialNum = 0x01,
    ReadHwId = 0x02,
    ReadOemPkHash = 0x03,
    ReadSblVersion = 0x07,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy)]
struct PacketHeader {
    cmd: u32,
    length: u32,
}

const PACKET_HEADER_LEN: usize = 8;

#[derive(Serialize, Deserialize, Debug, Clone, Copy)]
pub struct SaharaHello {
    pub version: u32,
    pub compatible: u32,
    pub max_len: u32,
    pub mode: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy)]
struct HelloResponse {
    version: u32,
    compatible: u32,
    status: u32,
    mode: u32,
    reserved: [u32; 6],
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy)]
struct ReadDataArgs {
    image: u32,
    offset: u32,
    length: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy)]
struct ReadData64Args {
    image: u64,
    offset: u64,
    length: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy)]
struct EndOfImageArgs {
    image: u32,
    status: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy)]
struct DoneResponseArgs {
    status: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy)]
struct CmdExecArgs {
    client_cmd: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy)]
struct CmdExecResponseArgs {
    client_cmd: u32,
    data_len: u32,
}

fn unexpected(phase: &str, detail: impl Into<String>) -> Error {
    ProtocolError::UnexpectedResponse {
        phase: format!("sahara {phase}"),
        detail: detail.into(),
    }
    .into()
}

fn send_packet<T: QcomChan + ?Sized>(
    chan: &mut T,
    cmd: SaharaCommand,
    payload: &[u8],
) -> Result<()> {
    let header = PacketHeader {
        cmd: cmd as u32,
        length: (PACKET_HEADER_LEN + payload.len()) as u32,
    };
    let mut pkt = bincode::serialize(&header).expect("fixed-layout header");
    pkt.extend_from_slice(payload);
    chan.rw().send(&pkt)?;
    Ok(())
}

fn read_packet<T: QcomChan + ?Sized>(chan: &mut T) -> Result<(SaharaCommand, Vec<u8>)> {
    let mut hdr = [0u8; PACKET_HEADER_LEN];
    chan.rw().recv_exact(&mut hdr, "sahara packet header")?;
    let header: PacketHeader =
        bincode::deserialize(&hdr).map_err(|e| unexpected("header", e.to_string()))?;

    if header.length < PACKET_HEADER_LEN as u32 || header.length > MAX_PACKET_LEN {
        return Err(unexpected(
            "header",
            format!("implausible packet length {}", header.length),
        ));
    }

    let cmd: SaharaCommand = bincode::deserialize(&hdr[..4])
        .map_err(|_| unexpected("header", format!("unknown command {:#x}", header.cmd)))?;

    let mut payload = vec![0u8; header.length as usize - PACKET_HEADER_LEN];
    chan.rw().recv_exact(&mut payload, "sahara packet body")?;
    Ok((cmd, payload))
}

/// Wait for the device's Hello. Transient transport errors are retried a
/// few times with a linear backoff; everything else propagates.
pub fn sahara_wait_hello<T: QcomChan + ?Sized>(chan: &mut T) -> Result<SaharaHello> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match read_packet(chan) {
            Ok((SaharaCommand::Hello, payload)) => {
                let hello: SaharaHello = bincode::deserialize(&payload)
                    .map_err(|e| unexpected("hello", e.to_string()))?;
                tracing::debug!(
                    version = hello.version,
                    compatible = hello.compatible,
                    mode = hello.mode,
                    "device hello"
                );
                if hello.version < SAHARA_COMPATIBLE_VERSION {
                    return Err(ProtocolError::VersionUnsupported {
                        device_version: hello.version,
                    }
                    .into());
                }
                return Ok(hello);
            }
            Ok((cmd, _)) => {
                return Err(unexpected("hello", format!("got {cmd:?} instead of Hello")));
            }
            Err(e) if e.is_retryable() && attempt < HANDSHAKE_RETRIES => {
                tracing::debug!(attempt, "hello not seen yet, retrying: {e}");
                std::thread::sleep(std::time::Duration::from_millis(100 * attempt as u64));
            }
            Err(e) => return Err(e),
        }
    }
}

/// Answer a Hello (seen or assumed lost) with the mode we want.
pub fn sahara_send_hello_rsp<T: QcomChan + ?Sized>(chan: &mut T, mode: SaharaMode) -> Result<()> {
    let rsp = HelloResponse {
        version: SAHARA_VERSION,
        compatible: SAHARA_COMPATIBLE_VERSION,
        status: 0,
        mode: mode as u32,
        reserved: [0; 6],
    };
    send_packet(
        chan,
        SaharaCommand::HelloResponse,
        &bincode::serialize(&rsp).expect("fixed-layout packet"),
    )
}

/// Run one command-mode request and return the raw response bytes.
///
/// The device answers an Execute with a length, then streams that many
/// bytes un-packetized after the ExecuteData nudge.
pub fn sahara_cmd_exec<T: QcomChan + ?Sized>(
    chan: &mut T,
    cmd: SaharaCmdModeCmd,
) -> Result<Vec<u8>> {
    let args = CmdExecArgs {
        client_cmd: cmd as u32,
    };
    let args = bincode::serialize(&args).expect("fixed-layout packet");
    send_packet(chan, SaharaCommand::CommandExecute, &args)?;

    let (reply, payload) = read_packet(chan)?;
    if reply != SaharaCommand::CommandExecuteResponse {
        return Err(unexpected("command", format!("got {reply:?}")));
    }
    let rsp: CmdExecResponseArgs =
        bincode::deserialize(&payload).map_err(|e| unexpected("command", e.to_string()))?;
    if rsp.data_len > MAX_PACKET_LEN {
        return Err(unexpected(
            "command",
            format!("implausible response length {}", rsp.data_len),
        ));
    }

    send_packet(chan, SaharaCommand::CommandExecuteData, &args)?;
    let mut data = vec![0u8; rsp.data_len as usize];
    chan.rw().recv_exact(&mut data, "sahara command data")?;
    Ok(data)
}

/// Pull chip identity over command mode and record it in the session's
/// [`DeviceInfo`](crate::types::DeviceInfo). Leaves the device back in
/// image-transfer mode, Hello consumed and answered.
pub fn sahara_collect_identity<T: QcomChan + ?Sized>(chan: &mut T) -> Result<()> {
    let (cmd, _) = read_packet(chan)?;
    if cmd != SaharaCommand::CommandReady {
        return Err(unexpected("command", format!("got {cmd:?}, not CommandReady")));
    }

    if let Ok(sn) = sahara_cmd_exec(chan, SaharaCmdModeCmd::ReadSerialNum) {
        if sn.len() >= 4 {
            let sn = u32::from_le_bytes([sn[0], sn[1], sn[2], sn[3]]);
            chan.mut_device_info().chip_id = Some(format!("{sn:#010x}"));
        }
    }
    if let Ok(hash) = sahara_cmd_exec(chan, SaharaCmdModeCmd::ReadOemPkHash) {
        if !hash.is_empty() {
            chan.mut_device_info().pk_hash = Some(hash);
        }
    }

    // Back to image transfer: the device re-introduces itself
    let switch = bincode::serialize(&(SaharaMode::ImageTxPending as u32)).unwrap();
    send_packet(chan, SaharaCommand::CommandSwitchMode, &switch)?;
    sahara_wait_hello(chan)?;
    sahara_send_hello_rsp(chan, SaharaMode::ImageTxPending)
}

fn loader_window(loader: &[u8], offset: u64, length: u64) -> Result<&[u8]> {
    let end = offset.checked_add(length).ok_or_else(|| {
        Error::from(ProtocolError::DataPhaseMismatch {
            expected: loader.len() as u64,
            actual: u64::MAX,
        })
    })?;
    if end > loader.len() as u64 {
        return Err(ProtocolError::DataPhaseMismatch {
            expected: loader.len() as u64,
            actual: end,
        }
        .into());
    }
    Ok(&loader[offset as usize..end as usize])
}

/// Serve the image-transfer phase: answer ReadData windows until the device
/// declares EndOfImage, then close with Done.
pub fn sahara_upload_loader<T: QcomChan + ?Sized>(chan: &mut T, loader: &[u8]) -> Result<()> {
    let mut sent: u64 = 0;
    loop {
        chan.feed_watchdog();
        let (cmd, payload) = read_packet(chan)?;
        match cmd {
            SaharaCommand::ReadData => {
                let req: ReadDataArgs = bincode::deserialize(&payload)
                    .map_err(|e| unexpected("read-data", e.to_string()))?;
                let window = loader_window(loader, req.offset as u64, req.length as u64)?;
                chan.rw().send(window).map_err(Error::from)?;
                sent += window.len() as u64;
            }
            SaharaCommand::ReadData64 => {
                let req: ReadData64Args = bincode::deserialize(&payload)
                    .map_err(|e| unexpected("read-data64", e.to_string()))?;
                let window = loader_window(loader, req.offset, req.length)?;
                chan.rw().send(window).map_err(Error::from)?;
                sent += window.len() as u64;
            }
            SaharaCommand::EndOfImage => {
                let eoi: EndOfImageArgs = bincode::deserialize(&payload)
                    .map_err(|e| unexpected("end-of-image", e.to_string()))?;
                if eoi.status != 0 {
                    return Err(SecurityError::LoaderRejected { status: eoi.status }.into());
                }
                tracing::info!(bytes = sent, "loader accepted");
                break;
            }
            other => return Err(unexpected("image transfer", format!("got {other:?}"))),
        }
    }

    send_packet(chan, SaharaCommand::Done, &[])?;
    let (cmd, payload) = read_packet(chan)?;
    if cmd != SaharaCommand::DoneResponse {
        return Err(unexpected("done", format!("got {cmd:?}")));
    }
    let done: DoneResponseArgs =
        bincode::deserialize(&payload).map_err(|e| unexpected("done", e.to_string()))?;
    if done.status != 0 {
        return Err(SecurityError::LoaderRejected {
            status: done.status,
        }
        .into());
    }
    Ok(())
}

/// Ask the boot ROM to reset the target.
pub fn sahara_reset<T: QcomChan + ?Sized>(chan: &mut T) -> Result<()> {
    send_packet(chan, SaharaCommand::Reset, &[])
}

/// Full Sahara bring-up: wait for Hello, optionally harvest identity over
/// command mode, then feed the Firehose programmer. After this returns Ok
/// the device is executing the loader and speaks Firehose.
pub fn sahara_run<T: QcomChan + ?Sized>(
    chan: &mut T,
    loader: &[u8],
    collect_identity: bool,
) -> Result<()> {
    if loader.is_empty() {
        return Err(Error::InvalidArgument("empty loader image".into()));
    }

    let hello = sahara_wait_hello(chan)?;

    if collect_identity && hello.version >= SAHARA_VERSION {
        sahara_send_hello_rsp(chan, SaharaMode::Command)?;
        sahara_collect_identity(chan)?;
    } else {
        sahara_send_hello_rsp(chan, SaharaMode::ImageTxPending)?;
    }

    sahara_upload_loader(chan, loader)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedTransport;
    use crate::types::{FirehoseConfig, QcomDevice};

    fn packet(cmd: u32, payload: &[u8]) -> Vec<u8> {
        let mut pkt = Vec::new();
        pkt.extend(cmd.to_le_bytes());
        pkt.extend(((payload.len() + 8) as u32).to_le_bytes());
        pkt.extend(payload);
        pkt
    }

    fn hello_payload(version: u32, mode: u32) -> Vec<u8> {
        let mut p = Vec::new();
        p.extend(version.to_le_bytes());
        p.extend(1u32.to_le_bytes()); // compatible
        p.extend(1024u32.to_le_bytes()); // max_len
        p.extend(mode.to_le_bytes());
        p.extend([0u8; 24]); // reserved
        p
    }

    fn hello_rsp_bytes(mode: u32) -> Vec<u8> {
        let mut p = Vec::new();
        p.extend(2u32.to_le_bytes());
        p.extend(1u32.to_le_bytes());
        p.extend(0u32.to_le_bytes());
        p.extend(mode.to_le_bytes());
        p.extend([0u8; 24]);
        packet(0x02, &p)
    }

    fn read_data(image: u32, offset: u32, length: u32) -> Vec<u8> {
        let mut p = Vec::new();
        p.extend(image.to_le_bytes());
        p.extend(offset.to_le_bytes());
        p.extend(length.to_le_bytes());
        packet(0x03, &p)
    }

    fn end_of_image(status: u32) -> Vec<u8> {
        let mut p = Vec::new();
        p.extend(0x0Du32.to_le_bytes());
        p.extend(status.to_le_bytes());
        packet(0x04, &p)
    }

    fn device(script: ScriptedTransport) -> QcomDevice {
        QcomDevice::new(Box::new(script), FirehoseConfig::default())
    }

    #[test]
    fn uploads_a_loader_in_requested_windows() {
        let loader = vec![0xC3_u8; 0x2000];

        let script = ScriptedTransport::new()
            .reply(packet(0x01, &hello_payload(2, 0)))
            .expect(hello_rsp_bytes(0))
            .reply(read_data(0x0D, 0, 0x1000))
            .expect(loader[..0x1000].to_vec())
            .reply(read_data(0x0D, 0x1000, 0x1000))
            .expect(loader[0x1000..].to_vec())
            .reply(end_of_image(0))
            .expect(packet(0x05, &[]))
            .reply(packet(0x06, &0u32.to_le_bytes()));

        let mut dev = device(script);
        sahara_run(&mut dev, &loader, false).unwrap();
    }

    #[test]
    fn nonzero_end_of_image_is_a_loader_rejection() {
        let loader = vec![0u8; 0x1000];
        let script = ScriptedTransport::new()
            .reply(packet(0x01, &hello_payload(2, 0)))
            .expect(hello_rsp_bytes(0))
            .reply(end_of_image(0x23));

        let mut dev = device(script);
        let err = sahara_run(&mut dev, &loader, false).unwrap_err();
        assert!(matches!(
            err,
            Error::Security(SecurityError::LoaderRejected { status: 0x23 })
        ));
    }

    #[test]
    fn out_of_range_read_window_is_a_data_phase_mismatch() {
        let loader = vec![0u8; 0x100];
        let script = ScriptedTransport::new()
            .reply(packet(0x01, &hello_payload(2, 0)))
            .expect(hello_rsp_bytes(0))
            .reply(read_data(0x0D, 0, 0x1000));

        let mut dev = device(script);
        let err = sahara_run(&mut dev, &loader, false).unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::DataPhaseMismatch { .. })
        ));
    }

    #[test]
    fn ancient_protocol_version_is_rejected() {
        let script = ScriptedTransport::new().reply(packet(0x01, &hello_payload(0, 0)));
        let mut dev = device(script);
        let err = sahara_run(&mut dev, &[0u8; 16], false).unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::VersionUnsupported { device_version: 0 })
        ));
    }

    #[test]
    fn command_mode_harvests_serial_and_pk_hash() {
        let mut exec_serial = Vec::new();
        exec_serial.extend(1u32.to_le_bytes());

        let mut exec_rsp_serial = Vec::new();
        exec_rsp_serial.extend(1u32.to_le_bytes());
        exec_rsp_serial.extend(4u32.to_le_bytes());

        let mut exec_hash = Vec::new();
        exec_hash.extend(3u32.to_le_bytes());

        let mut exec_rsp_hash = Vec::new();
        exec_rsp_hash.extend(3u32.to_le_bytes());
        exec_rsp_hash.extend(8u32.to_le_bytes());

        let loader = vec![0xAA_u8; 0x1000];
        let script = ScriptedTransport::new()
            .reply(packet(0x01, &hello_payload(2, 3)))
            .expect(hello_rsp_bytes(3))
            .reply(packet(0x0B, &[])) // CommandReady
            .expect(packet(0x0D, &exec_serial))
            .reply(packet(0x0E, &exec_rsp_serial))
            .expect(packet(0x0F, &exec_serial))
            .reply(vec![0x78, 0x56, 0x34, 0x12])
            .expect(packet(0x0D, &exec_hash))
            .reply(packet(0x0E, &exec_rsp_hash))
            .expect(packet(0x0F, &exec_hash))
            .reply(vec![0xAB; 8])
            .expect(packet(0x0C, &0u32.to_le_bytes()))
            .reply(packet(0x01, &hello_payload(2, 0)))
            .expect(hello_rsp_bytes(0))
            .reply(read_data(0x0D, 0, 0x1000))
            .expect(loader.clone())
            .reply(end_of_image(0))
            .expect(packet(0x05, &[]))
            .reply(packet(0x06, &0u32.to_le_bytes()));

        let mut dev = device(script);
        sahara_run(&mut dev, &loader, true).unwrap();
        assert_eq!(dev.info.chip_id.as_deref(), Some("0x12345678"));
        assert_eq!(dev.info.pk_hash.as_deref(), Some(&[0xAB_u8; 8][..]));
    }
}
