// SPDX-License-Identifier: BSD-3-Clause
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::time::Duration;

use crate::error::{Error, Result, TransportError};
use crate::transport::{CancelToken, DeviceDescriptor, Transport, TransportKind};

/// ISP-mode transport: the device has been driven into USB mass storage and
/// its eMMC shows up as an ordinary block device. Vendor protocols are
/// bypassed entirely; the engine addresses storage by LBA.
pub struct BlockDevTransport {
    file: File,
    descriptor: DeviceDescriptor,
    sector_size: u64,
    timeout: Duration,
    cancel: CancelToken,
}

impl BlockDevTransport {
    pub fn open(wanted: &DeviceDescriptor) -> Result<Self> {
        let Some(path) = &wanted.path else {
            return Err(Error::InvalidArgument("block device path unspecified".into()));
        };

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => TransportError::NotFound,
                std::io::ErrorKind::PermissionDenied => TransportError::AccessDenied,
                _ => TransportError::Io(e),
            })?;

        Ok(Self {
            file,
            descriptor: DeviceDescriptor {
                vendor_id: None,
                product_id: None,
                serial: None,
                path: Some(path.clone()),
                kind: TransportKind::BlockDevice,
            },
            sector_size: 512,
            timeout: Duration::from_secs(30),
            cancel: CancelToken::new(),
        })
    }

    pub fn sector_size(&self) -> u64 {
        self.sector_size
    }

    pub fn set_sector_size(&mut self, sector_size: u64) {
        self.sector_size = sector_size;
    }

    pub fn seek_lba(&mut self, lba: u64) -> std::result::Result<(), TransportError> {
        self.file
            .seek(SeekFrom::Start(lba * self.sector_size))
            .map_err(TransportError::Io)?;
        Ok(())
    }

    pub fn read_sectors(
        &mut self,
        lba: u64,
        buf: &mut [u8],
    ) -> std::result::Result<(), TransportError> {
        self.cancel.bail_if_cancelled()?;
        self.seek_lba(lba)?;
        self.file.read_exact(buf).map_err(TransportError::Io)
    }

    pub fn write_sectors(
        &mut self,
        lba: u64,
        buf: &[u8],
    ) -> std::result::Result<(), TransportError> {
        self.cancel.bail_if_cancelled()?;
        self.seek_lba(lba)?;
        self.file.write_all(buf).map_err(TransportError::Io)
    }
}

impl Read for BlockDevTransport {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.file.read(buf)
    }
}

impl Write for BlockDevTransport {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.file.flush()
    }
}

impl Seek for BlockDevTransport {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.file.seek(pos)
    }
}

impl Transport for BlockDevTransport {
    fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn is_connected(&self) -> bool {
        self.file.metadata().is_ok()
    }

    fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }
}
