// SPDX-License-Identifier: BSD-3-Clause
//! MediaTek boot ROM protocol and Download Agent staging.
//!
//! The BROM echoes every command byte and big-endian argument word back at
//! the host, then answers with a 16-bit status. Bringing a device up means:
//! seed-byte handshake, identity queries, `SEND_DA` + `JUMP_DA` for the
//! first-stage agent, then a `BOOT_TO` through DA1's own framed protocol to
//! land DA2, whose greeting tells us which dialect (XFlash or XML) the rest
//! of the session speaks.

use crate::error::{Error, ProtocolError, Result, SecurityError};
use crate::transport::Transport;
use crate::types::{DaMode, DeviceInfo};
use crate::watchdog::Watchdog;
use crate::xflash;

pub const BROM_CMD_GET_HW_SW_VER: u8 = 0xFC;
pub const BROM_CMD_GET_HW_CODE: u8 = 0xFD;
pub const BROM_CMD_JUMP_DA: u8 = 0xD5;
pub const BROM_CMD_SEND_DA: u8 = 0xD7;
pub const BROM_CMD_GET_TARGET_CONFIG: u8 = 0xD8;

const HANDSHAKE_TX: [u8; 4] = [0xA0, 0x0A, 0x50, 0x05];
const HANDSHAKE_RX: [u8; 4] = [0x5F, 0xF5, 0xAF, 0xFA];
const HANDSHAKE_ATTEMPTS: usize = 100;

/// Target-config flag word bits
const CFG_SECURE_BOOT: u32 = 1 << 0;
const CFG_SLA_REQUIRED: u32 = 1 << 1;
const CFG_DAA_REQUIRED: u32 = 1 << 2;

/// One MediaTek session, from BROM through a running DA.
pub struct MtkDevice {
    pub rw: Box<dyn Transport>,
    pub info: DeviceInfo,
    /// Chunk size for DA data phases, reported after DA2 comes up
    pub max_packet: usize,
    pub watchdog: Option<Watchdog>,
}

impl MtkDevice {
    pub fn new(rw: Box<dyn Transport>) -> Self {
        Self {
            rw,
            info: DeviceInfo::default(),
            max_packet: 64 * 1024,
            watchdog: None,
        }
    }

    pub fn feed_watchdog(&self) {
        if let Some(dog) = &self.watchdog {
            dog.feed();
        }
    }
}

/// The two DA stages plus the load metadata the loader service hands us.
/// The engine treats the binaries as opaque.
#[derive(Debug, Clone)]
pub struct DaImage {
    pub da1: Vec<u8>,
    pub da1_addr: u32,
    pub da1_sig_len: u32,
    pub da2: Vec<u8>,
    pub da2_addr: u32,
    pub da2_sig_len: u32,
}

/// A pre-load binary patch (signature-check bypasses and the like),
/// supplied by the caller and applied verbatim before `SEND_DA`. The
/// engine does not generate these.
#[derive(Debug, Clone)]
pub struct DaPatch {
    pub offset: usize,
    pub bytes: Vec<u8>,
}

/// Secure-state flags from `GET_TARGET_CONFIG`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TargetConfig {
    pub secure_boot: bool,
    pub sla_required: bool,
    pub daa_required: bool,
}

fn unexpected(phase: &str, detail: impl Into<String>) -> Error {
    ProtocolError::UnexpectedResponse {
        phase: format!("brom {phase}"),
        detail: detail.into(),
    }
    .into()
}

fn echo_u8(dev: &mut MtkDevice, byte: u8, phase: &str) -> Result<()> {
    dev.rw.send(&[byte])?;
    let mut back = [0u8; 1];
    dev.rw.recv_exact(&mut back, phase)?;
    if back[0] != byte {
        return Err(unexpected(
            phase,
            format!("echo {:#04x} for {byte:#04x}", back[0]),
        ));
    }
    Ok(())
}

fn echo_u32(dev: &mut MtkDevice, word: u32, phase: &str) -> Result<()> {
    let be = word.to_be_bytes();
    dev.rw.send(&be)?;
    let mut back = [0u8; 4];
    dev.rw.recv_exact(&mut back, phase)?;
    if back != be {
        return Err(unexpected(phase, format!("echo {back:02x?} for {be:02x?}")));
    }
    Ok(())
}

fn read_u16(dev: &mut MtkDevice, phase: &str) -> Result<u16> {
    let mut buf = [0u8; 2];
    dev.rw.recv_exact(&mut buf, phase)?;
    Ok(u16::from_be_bytes(buf))
}

fn read_u32(dev: &mut MtkDevice, phase: &str) -> Result<u32> {
    let mut buf = [0u8; 4];
    dev.rw.recv_exact(&mut buf, phase)?;
    Ok(u32::from_be_bytes(buf))
}

fn read_status(dev: &mut MtkDevice, phase: &str) -> Result<()> {
    let status = read_u16(dev, phase)?;
    if status != 0 {
        return Err(ProtocolError::CommandRejected {
            device_msg: format!("brom {phase} status {status:#06x}"),
        }
        .into());
    }
    Ok(())
}

/// Seed-byte handshake. The first byte is retried since the ROM may be
/// mid-poll when we attach; the remaining three must come back exact.
pub fn brom_handshake(dev: &mut MtkDevice) -> Result<()> {
    let mut synced = false;
    for _ in 0..HANDSHAKE_ATTEMPTS {
        dev.rw.send(&[HANDSHAKE_TX[0]])?;
        let mut back = [0u8; 1];
        if dev.rw.recv(&mut back)? == 1 && back[0] == HANDSHAKE_RX[0] {
            synced = true;
            break;
        }
    }
    if !synced {
        return Err(ProtocolError::HandshakeFailed("no BROM seed echo".into()).into());
    }

    for (tx, rx) in HANDSHAKE_TX.iter().zip(HANDSHAKE_RX.iter()).skip(1) {
        dev.rw.send(&[*tx])?;
        let mut back = [0u8; 1];
        dev.rw.recv_exact(&mut back, "handshake")?;
        if back[0] != *rx {
            return Err(ProtocolError::HandshakeFailed(format!(
                "seed complement {:#04x}, wanted {rx:#04x}",
                back[0]
            ))
            .into());
        }
    }
    tracing::debug!("BROM handshake complete");
    Ok(())
}

pub fn brom_get_hw_code(dev: &mut MtkDevice) -> Result<u16> {
    echo_u8(dev, BROM_CMD_GET_HW_CODE, "get_hw_code")?;
    let hw_code = read_u16(dev, "get_hw_code")?;
    read_status(dev, "get_hw_code")?;
    Ok(hw_code)
}

/// Returns (hw_sub_code, hw_version, sw_version).
pub fn brom_get_hw_sw_ver(dev: &mut MtkDevice) -> Result<(u16, u16, u16)> {
    echo_u8(dev, BROM_CMD_GET_HW_SW_VER, "get_hw_sw_ver")?;
    let hw_sub = read_u16(dev, "get_hw_sw_ver")?;
    let hw_ver = read_u16(dev, "get_hw_sw_ver")?;
    let sw_ver = read_u16(dev, "get_hw_sw_ver")?;
    read_status(dev, "get_hw_sw_ver")?;
    Ok((hw_sub, hw_ver, sw_ver))
}

pub fn brom_get_target_config(dev: &mut MtkDevice) -> Result<TargetConfig> {
    echo_u8(dev, BROM_CMD_GET_TARGET_CONFIG, "get_target_config")?;
    let flags = read_u32(dev, "get_target_config")?;
    read_status(dev, "get_target_config")?;
    Ok(TargetConfig {
        secure_boot: flags & CFG_SECURE_BOOT != 0,
        sla_required: flags & CFG_SLA_REQUIRED != 0,
        daa_required: flags & CFG_DAA_REQUIRED != 0,
    })
}

/// Apply caller-supplied patches to a DA image copy.
pub fn apply_patches(image: &mut [u8], patches: &[DaPatch]) -> Result<()> {
    for patch in patches {
        let end = patch
            .offset
            .checked_add(patch.bytes.len())
            .filter(|&end| end <= image.len())
            .ok_or_else(|| {
                Error::InvalidArgument(format!(
                    "patch at {:#x}+{} falls outside the {}-byte DA image",
                    patch.offset,
                    patch.bytes.len(),
                    image.len()
                ))
            })?;
        image[patch.offset..end].copy_from_slice(&patch.bytes);
    }
    Ok(())
}

/// `SEND_DA`: stream a DA stage into SRAM. The ROM answers the header with
/// one status, the data with a 16-bit checksum plus a second status.
pub fn brom_send_da(
    dev: &mut MtkDevice,
    addr: u32,
    sig_len: u32,
    da: &[u8],
    daa_required: bool,
) -> Result<()> {
    echo_u8(dev, BROM_CMD_SEND_DA, "send_da")?;
    echo_u32(dev, addr, "send_da")?;
    echo_u32(dev, da.len() as u32, "send_da")?;
    echo_u32(dev, sig_len, "send_da")?;
    match read_status(dev, "send_da") {
        Ok(()) => {}
        // A rejection here is the ROM refusing the image outright
        Err(Error::Protocol(ProtocolError::CommandRejected { .. })) if daa_required => {
            return Err(SecurityError::SignatureRequired("DA image (DAA enforced)".into()).into());
        }
        Err(e) => return Err(e),
    }

    dev.rw.send(da)?;
    dev.feed_watchdog();

    let _checksum = read_u16(dev, "send_da data")?;
    let status = read_u16(dev, "send_da data")?;
    if status != 0 {
        return Err(SecurityError::LoaderRejected {
            status: status as u32,
        }
        .into());
    }
    tracing::debug!(addr = format_args!("{addr:#010x}"), len = da.len(), "DA staged");
    Ok(())
}

pub fn brom_jump_da(dev: &mut MtkDevice, addr: u32) -> Result<()> {
    echo_u8(dev, BROM_CMD_JUMP_DA, "jump_da")?;
    echo_u32(dev, addr, "jump_da")?;
    read_status(dev, "jump_da")?;
    Ok(())
}

/// Full bring-up: handshake, identity, DA1 over BROM, DA2 over DA1, then
/// dialect detection from DA2's greeting. Patches apply to both stages
/// before they are sent.
pub fn mtk_stage_da(dev: &mut MtkDevice, da: &DaImage, patches: &[DaPatch]) -> Result<DaMode> {
    brom_handshake(dev)?;

    let hw_code = brom_get_hw_code(dev)?;
    let (hw_sub, hw_ver, sw_ver) = brom_get_hw_sw_ver(dev)?;
    let target = brom_get_target_config(dev)?;
    dev.info.hw_code = Some(hw_code);
    dev.info.sw_code = Some(sw_ver);
    dev.info.chip_id = Some(format!("mt{hw_code:04x} ({hw_sub:#06x}/{hw_ver:#06x})"));
    dev.info.secure_boot = Some(target.secure_boot);
    tracing::info!(
        hw_code = format_args!("{hw_code:#06x}"),
        secure_boot = target.secure_boot,
        sla = target.sla_required,
        daa = target.daa_required,
        "BROM identity"
    );

    let mut da1 = da.da1.clone();
    apply_patches(&mut da1, patches)?;
    brom_send_da(dev, da.da1_addr, da.da1_sig_len, &da1, target.daa_required)?;
    brom_jump_da(dev, da.da1_addr)?;

    // DA1 takes over the pipe with its framed protocol
    xflash::da_wait_sync(dev)?;

    let mut da2 = da.da2.clone();
    apply_patches(&mut da2, patches)?;
    xflash::da_boot_to(dev, da.da2_addr, &da2)?;

    let mode = xflash::da_detect_dialect(dev)?;
    dev.info.da_mode = Some(mode);
    tracing::info!(%mode, "DA2 running");
    Ok(mode)
}
