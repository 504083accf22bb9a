// SPDX-License-Identifier: BSD-3-Clause
use std::str::FromStr;

use crate::error::Error;
use crate::transport::Transport;
use crate::watchdog::Watchdog;

/// Storage medium behind the partition table. Encoded into every Firehose
/// command and reported by the MTK/SPD downloaders after staging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageKind {
    #[default]
    Emmc,
    Ufs,
    Nvme,
    Spinor,
    Nand,
}

impl FromStr for StorageKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s.to_lowercase().as_str() {
            "emmc" => Ok(StorageKind::Emmc),
            "ufs" => Ok(StorageKind::Ufs),
            "nvme" => Ok(StorageKind::Nvme),
            "spinor" | "nor" => Ok(StorageKind::Spinor),
            "nand" => Ok(StorageKind::Nand),
            other => Err(Error::InvalidArgument(format!(
                "unknown storage type '{other}'"
            ))),
        }
    }
}

impl std::fmt::Display for StorageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageKind::Emmc => write!(f, "emmc"),
            StorageKind::Ufs => write!(f, "ufs"),
            StorageKind::Nvme => write!(f, "nvme"),
            StorageKind::Spinor => write!(f, "spinor"),
            StorageKind::Nand => write!(f, "nand"),
        }
    }
}

/// Which second-stage dialect a MediaTek DA speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaMode {
    /// Binary 32-bit opcodes (DA v5)
    XFlash,
    /// Length-prefixed XML documents (DA v6)
    Xml,
}

impl std::fmt::Display for DaMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DaMode::XFlash => write!(f, "xflash"),
            DaMode::Xml => write!(f, "xml"),
        }
    }
}

/// Identity and capabilities discovered while connecting.
///
/// Built up by the engine during its handshake and frozen for the rest of
/// the session. Fields a given vendor never reports stay `None`.
#[derive(Debug, Clone, Default)]
pub struct DeviceInfo {
    /// Qualcomm chip serial / MTK chip id / SPD chip string
    pub chip_id: Option<String>,
    /// MTK hardware code (e.g. 0x0707 for MT6768)
    pub hw_code: Option<u16>,
    /// MTK software/hardware version words
    pub sw_code: Option<u16>,
    pub storage_kind: Option<StorageKind>,
    pub secure_boot: Option<bool>,
    /// OEM public-key hash, when the bootloader reveals it
    pub pk_hash: Option<Vec<u8>>,
    /// Negotiated Firehose protocol version (Qualcomm only)
    pub firehose_version: Option<u32>,
    /// Active DA dialect (MediaTek only)
    pub da_mode: Option<DaMode>,
    /// Currently active A/B slot suffix ("a"/"b"), when slotted
    pub current_slot: Option<String>,
    /// Largest single data-phase transfer the device accepts
    pub max_download_size: Option<u64>,
}

impl DeviceInfo {
    /// One-line operator summary; anything unknown is left out.
    pub fn summary(&self) -> String {
        let mut parts = Vec::new();
        if let Some(chip) = &self.chip_id {
            parts.push(format!("chip {chip}"));
        }
        if let Some(hw) = self.hw_code {
            parts.push(format!("hw_code {hw:#06x}"));
        }
        if let Some(storage) = self.storage_kind {
            parts.push(format!("storage {storage}"));
        }
        if let Some(secure) = self.secure_boot {
            parts.push(format!(
                "secure boot {}",
                if secure { "on" } else { "off" }
            ));
        }
        if let Some(da) = self.da_mode {
            parts.push(format!("da {da}"));
        }
        if let Some(v) = self.firehose_version {
            parts.push(format!("firehose v{v}"));
        }
        if let Some(slot) = &self.current_slot {
            parts.push(format!("slot {slot}"));
        }
        if let Some(max) = self.max_download_size {
            parts.push(format!("max transfer {} KiB", max / 1024));
        }
        if parts.is_empty() {
            "no identity reported".to_owned()
        } else {
            parts.join(", ")
        }
    }
}

/// ACK/NAK verdict of one Firehose exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirehoseStatus {
    Ack,
    Nak,
}

/// Where `<power>` sends the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FirehoseResetMode {
    /// Reboot into the OS
    #[default]
    System,
    /// Power off
    Off,
    /// Reboot back into emergency download mode
    ResetToEdl,
}

impl FromStr for FirehoseResetMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s.to_lowercase().as_str() {
            "system" | "reset" => Ok(FirehoseResetMode::System),
            "off" => Ok(FirehoseResetMode::Off),
            "edl" => Ok(FirehoseResetMode::ResetToEdl),
            other => Err(Error::InvalidArgument(format!(
                "unknown reset mode '{other}'"
            ))),
        }
    }
}

impl std::fmt::Display for FirehoseResetMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FirehoseResetMode::System => write!(f, "reset"),
            FirehoseResetMode::Off => write!(f, "off"),
            FirehoseResetMode::ResetToEdl => write!(f, "edl"),
        }
    }
}

/// Usual logical sector size for each medium; overridable from the CLI for
/// unusual provisioning.
pub fn default_sector_size(storage: StorageKind) -> usize {
    match storage {
        StorageKind::Ufs | StorageKind::Spinor | StorageKind::Nand => 4096,
        StorageKind::Emmc | StorageKind::Nvme => 512,
    }
}

/// Host-side Firehose knobs. The buffer sizes start at conservative values
/// and are overwritten by the `<configure>` handshake.
#[derive(Debug, Clone)]
pub struct FirehoseConfig {
    pub storage_type: StorageKind,
    pub storage_sector_size: usize,
    /// Physical device index (e.g. 1 for a secondary UFS)
    pub storage_slot: u8,
    /// MaxPayloadSizeToTargetInBytes in force
    pub send_buffer_size: usize,
    pub xml_buf_size: usize,
    /// Read every programmed range back and compare digests
    pub read_back_verify: bool,
    pub skip_storage_init: bool,
    pub show_progress: bool,
}

impl Default for FirehoseConfig {
    fn default() -> Self {
        Self {
            storage_type: StorageKind::default(),
            storage_sector_size: default_sector_size(StorageKind::default()),
            storage_slot: 0,
            send_buffer_size: 1024 * 1024,
            xml_buf_size: 4096,
            read_back_verify: false,
            skip_storage_init: false,
            show_progress: false,
        }
    }
}

/// Access the transport and configuration behind a Qualcomm session.
///
/// The Sahara and Firehose functions are generic over this so tests can run
/// them against a scripted channel.
pub trait QcomChan {
    fn rw(&mut self) -> &mut dyn Transport;
    fn fh_config(&self) -> &FirehoseConfig;
    fn mut_fh_config(&mut self) -> &mut FirehoseConfig;
    fn device_info(&self) -> &DeviceInfo;
    fn mut_device_info(&mut self) -> &mut DeviceInfo;
    /// Progress notification for any supervising watchdog.
    fn feed_watchdog(&self) {}
}

/// One Qualcomm EDL session: a transport plus everything negotiated on it.
pub struct QcomDevice {
    pub rw: Box<dyn Transport>,
    pub fh_cfg: FirehoseConfig,
    pub info: DeviceInfo,
    pub watchdog: Option<Watchdog>,
    /// Send the device back to the OS if this session unwinds mid-flash
    pub reset_on_drop: bool,
}

impl QcomDevice {
    pub fn new(rw: Box<dyn Transport>, fh_cfg: FirehoseConfig) -> Self {
        Self {
            rw,
            fh_cfg,
            info: DeviceInfo::default(),
            watchdog: None,
            reset_on_drop: false,
        }
    }
}

impl QcomChan for QcomDevice {
    fn rw(&mut self) -> &mut dyn Transport {
        self.rw.as_mut()
    }

    fn fh_config(&self) -> &FirehoseConfig {
        &self.fh_cfg
    }

    fn mut_fh_config(&mut self) -> &mut FirehoseConfig {
        &mut self.fh_cfg
    }

    fn device_info(&self) -> &DeviceInfo {
        &self.info
    }

    fn mut_device_info(&mut self) -> &mut DeviceInfo {
        &mut self.info
    }

    fn feed_watchdog(&self) {
        if let Some(dog) = &self.watchdog {
            dog.feed();
        }
    }
}

impl Drop for QcomDevice {
    fn drop(&mut self) {
        if self.reset_on_drop {
            let _ = crate::firehose::firehose_reset(self, FirehoseResetMode::System, 0);
        }
    }
}
