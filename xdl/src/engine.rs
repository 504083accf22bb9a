// SPDX-License-Identifier: BSD-3-Clause
//! Vendor engine dispatch and session plumbing.
//!
//! One [`Session`] owns one [`Engine`], which owns one transport; command/
//! response traffic is linearised by `&mut` access. The engine variants
//! expose a common capability surface (partition read/write/erase, table
//! enumeration, raw command escape hatch, reboot); everything
//! vendor-specific about *reaching* that state lives in the per-vendor
//! connect paths.

use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::time::Duration;

use crate::blockdev::BlockDevTransport;
use crate::bsl::{self, SpdDevice};
use crate::brom::MtkDevice;
use crate::daxml;
use crate::error::{Error, ImageError, Result, TransportError};
use crate::fastboot::{self, FastbootDevice};
use crate::firehose;
use crate::partitions::{PartitionEntry, PartitionTable};
use crate::sparse::{self, ChunkDesc, SparseReader, SparseSplitter};
use crate::transport::{CancelToken, Transport};
use crate::types::{DaMode, DeviceInfo, FirehoseResetMode, QcomChan, QcomDevice};
use crate::watchdog::{Watchdog, default_handler};
use crate::xflash;

/// Seekable byte source for partition images.
pub trait ReadSeek: Read + Seek {}
impl<T: Read + Seek + ?Sized> ReadSeek for T {}

/// eMMC-direct session: the device is in USB mass storage, vendor
/// protocols are out of the picture, and the GPT is the ground truth.
pub struct IspSession {
    pub dev: BlockDevTransport,
    pub info: DeviceInfo,
    table: Option<PartitionTable>,
}

impl IspSession {
    pub fn new(dev: BlockDevTransport) -> Self {
        Self {
            dev,
            info: DeviceInfo::default(),
            table: None,
        }
    }

    fn table(&mut self) -> Result<&PartitionTable> {
        if self.table.is_none() {
            let sector_size = self.dev.sector_size();
            let table = PartitionTable::from_gpt_source(&mut self.dev, sector_size)?;
            table.validate()?;
            self.table = Some(table);
        }
        Ok(self.table.as_ref().expect("just filled"))
    }
}

/// The vendor engines behind one capability surface.
pub enum Engine {
    Qualcomm(QcomDevice),
    Mediatek(MtkDevice),
    Spreadtrum(SpdDevice),
    Fastboot(FastbootDevice),
    Isp(IspSession),
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Engine::Qualcomm(_) => "Qualcomm",
            Engine::Mediatek(_) => "Mediatek",
            Engine::Spreadtrum(_) => "Spreadtrum",
            Engine::Fastboot(_) => "Fastboot",
            Engine::Isp(_) => "Isp",
        };
        f.debug_tuple(name).finish()
    }
}

/// Repeats a 4-byte pattern for a fixed byte count; feeds FILL chunks into
/// sector-oriented writers.
struct FillReader {
    pattern: [u8; 4],
    remaining: u64,
    phase: usize,
}

impl FillReader {
    fn new(pattern: [u8; 4], remaining: u64) -> Self {
        Self {
            pattern,
            remaining,
            phase: 0,
        }
    }
}

impl Read for FillReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let want = std::cmp::min(self.remaining, buf.len() as u64) as usize;
        for slot in buf.iter_mut().take(want) {
            *slot = self.pattern[self.phase];
            self.phase = (self.phase + 1) % 4;
        }
        self.remaining -= want as u64;
        Ok(want)
    }
}

fn image_len(src: &mut dyn ReadSeek) -> Result<u64> {
    let len = src.seek(SeekFrom::End(0))?;
    src.seek(SeekFrom::Start(0))?;
    Ok(len)
}

/// Logical (expanded) size of an image file, sparse-aware.
fn logical_len(src: &mut dyn ReadSeek) -> Result<u64> {
    if sparse::is_sparse_image(src)? {
        let reader = SparseReader::open(&mut *src)?;
        let size = reader.expanded_size();
        src.seek(SeekFrom::Start(0))?;
        Ok(size)
    } else {
        image_len(src)
    }
}

fn too_small(name: &str, image: u64, partition: u64) -> Error {
    ImageError::PartitionTooSmall {
        name: name.to_owned(),
        image_size: image,
        partition_size: partition,
    }
    .into()
}

/// Read the primary GPT off a Firehose device: probe the header at LBA 1
/// for the table extent, then pull and parse the whole thing.
pub fn qcom_read_gpt(dev: &mut QcomDevice, phys_part_idx: u8) -> Result<PartitionTable> {
    let sector_size = dev.fh_config().storage_sector_size as u64;

    let mut probe = Cursor::new(Vec::new());
    firehose::firehose_read_storage(dev, &mut probe, 1, phys_part_idx, 1)?;
    probe.rewind()?;
    let header = gptman::GPTHeader::read_from(&mut probe)
        .map_err(|e| Error::from(ImageError::InconsistentChunks(format!("GPT header: {e}"))))?;

    let mut full = Cursor::new(Vec::new());
    firehose::firehose_read_storage(
        dev,
        &mut full,
        header.first_usable_lba as usize,
        phys_part_idx,
        0,
    )?;
    full.rewind()?;
    let table = PartitionTable::from_gpt_source(&mut full, sector_size)?;
    table.validate()?;
    Ok(table)
}

fn qcom_write_image(dev: &mut QcomDevice, entry: &PartitionEntry, src: &mut dyn ReadSeek) -> Result<()> {
    let sector_size = dev.fh_config().storage_sector_size as u64;
    let part_bytes = entry.size_bytes(sector_size);
    let logical = logical_len(src)?;
    if logical > part_bytes {
        return Err(too_small(&entry.name, logical, part_bytes));
    }

    if !sparse::is_sparse_image(src)? {
        let num_sectors = image_len(src)?.div_ceil(sector_size) as usize;
        return firehose::firehose_program_storage(
            dev,
            src,
            &entry.name,
            num_sectors,
            dev.fh_cfg.storage_slot,
            &entry.start_lba.to_string(),
        );
    }

    // Sparse: program each data-bearing chunk at its own offset, leaving
    // the holes untouched.
    let (block_size, chunks) = {
        let reader = SparseReader::open(&mut *src)?;
        (reader.block_size() as u64, reader.chunks().to_vec())
    };
    if block_size % sector_size != 0 {
        return Err(ImageError::UnalignedSize(block_size).into());
    }
    let spb = block_size / sector_size; // sectors per block

    let mut cursor_block: u64 = 0;
    for desc in chunks {
        let start_sector = entry.start_lba + cursor_block * spb;
        match desc {
            ChunkDesc::Raw { blocks, data_off } => {
                src.seek(SeekFrom::Start(data_off))?;
                let len = blocks as u64 * block_size;
                let mut window = Read::take(&mut *src, len);
                firehose::firehose_program_storage(
                    dev,
                    &mut window,
                    &entry.name,
                    (blocks as u64 * spb) as usize,
                    dev.fh_cfg.storage_slot,
                    &start_sector.to_string(),
                )?;
            }
            ChunkDesc::Fill { blocks, pattern } => {
                // All-zero fills would only re-write what erase left behind
                if pattern != [0u8; 4] {
                    let len = blocks as u64 * block_size;
                    let mut fill = FillReader::new(pattern, len);
                    firehose::firehose_program_storage(
                        dev,
                        &mut fill,
                        &entry.name,
                        (blocks as u64 * spb) as usize,
                        dev.fh_cfg.storage_slot,
                        &start_sector.to_string(),
                    )?;
                }
            }
            ChunkDesc::DontCare { .. } | ChunkDesc::Crc32 { .. } => {}
        }
        cursor_block += desc.blocks() as u64;
    }
    Ok(())
}

/// Cut an image into DA-sized transfers: raw images that fit go as one
/// piece, anything larger goes through the sparse splitter so every piece
/// lands at its declared block offset.
fn chunked_pieces<'a>(
    src: &'a mut dyn ReadSeek,
    max_packet: u64,
) -> Result<(u64, Box<dyn Iterator<Item = Result<Vec<u8>>> + 'a>)> {
    let len = image_len(src)?;
    if len <= max_packet && !sparse::is_sparse_image(src)? {
        let mut data = vec![0u8; len as usize];
        src.read_exact(&mut data)?;
        return Ok((len, Box::new(std::iter::once(Ok(data)))));
    }

    let splitter = if sparse::is_sparse_image(src)? {
        SparseSplitter::from_sparse(&mut *src, max_packet)?
    } else {
        SparseSplitter::from_raw(&mut *src, 4096, max_packet)?
    };
    let total = splitter.total_output_len();
    Ok((total, Box::new(splitter.map(|p| p.map(|p| p.bytes)))))
}

impl Engine {
    pub fn info(&self) -> &DeviceInfo {
        match self {
            Engine::Qualcomm(d) => &d.info,
            Engine::Mediatek(d) => &d.info,
            Engine::Spreadtrum(d) => &d.info,
            Engine::Fastboot(d) => &d.info,
            Engine::Isp(s) => &s.info,
        }
    }

    pub(crate) fn transport_mut(&mut self) -> &mut dyn Transport {
        match self {
            Engine::Qualcomm(d) => d.rw.as_mut(),
            Engine::Mediatek(d) => d.rw.as_mut(),
            Engine::Spreadtrum(d) => d.rw.as_mut(),
            Engine::Fastboot(d) => d.rw.as_mut(),
            Engine::Isp(s) => &mut s.dev,
        }
    }

    fn set_watchdog(&mut self, dog: Watchdog) {
        match self {
            Engine::Qualcomm(d) => d.watchdog = Some(dog),
            Engine::Mediatek(d) => d.watchdog = Some(dog),
            Engine::Spreadtrum(d) => d.watchdog = Some(dog),
            Engine::Fastboot(d) => d.watchdog = Some(dog),
            // ISP transfers are plain file I/O with no device lockups to
            // supervise beyond the kernel's own timeouts
            Engine::Isp(_) => {}
        }
    }

    /// Enumerate partitions the way this vendor allows.
    pub fn partitions(&mut self) -> Result<PartitionTable> {
        match self {
            Engine::Qualcomm(dev) => {
                let slot = dev.fh_cfg.storage_slot;
                qcom_read_gpt(dev, slot)
            }
            Engine::Mediatek(dev) => {
                let list = match dev.info.da_mode {
                    Some(DaMode::Xml) => daxml::daxml_get_hw_info(dev)?.partitions,
                    _ => xflash::xflash_get_partition_table(dev)?,
                };
                let entries: Vec<(String, u64)> = list
                    .iter()
                    .map(|(name, _, len)| (name.clone(), *len))
                    .collect();
                let mut table = PartitionTable::from_name_sizes(&entries, 512);
                // Byte layout is known here, unlike the other name/size sources
                for (entry, (_, start, _)) in table.entries.iter_mut().zip(list.iter()) {
                    entry.start_lba = start / 512;
                }
                table.layout_known = true;
                table.validate()?;
                Ok(table)
            }
            Engine::Spreadtrum(dev) => {
                let list = bsl::spd_partition_list(dev)?;
                Ok(PartitionTable::from_name_sizes(&list, 512))
            }
            Engine::Fastboot(dev) => {
                let mut sizes = Vec::new();
                for (name, value) in fastboot::fb_getvar_all(dev)? {
                    if let Some(part) = name.strip_prefix("partition-size:") {
                        if let Some(bytes) = parse_hex_or_dec(&value) {
                            sizes.push((part.to_owned(), bytes));
                        }
                    }
                }
                Ok(PartitionTable::from_name_sizes(&sizes, 512))
            }
            Engine::Isp(session) => Ok(session.table()?.clone()),
        }
    }

    /// Write an image (raw or sparse) to a named partition.
    pub fn write_partition(&mut self, name: &str, src: &mut dyn ReadSeek) -> Result<()> {
        match self {
            Engine::Qualcomm(dev) => {
                let slot = dev.fh_cfg.storage_slot;
                let table = qcom_read_gpt(dev, slot)?;
                let entry = table
                    .resolve(name, dev.info.current_slot.as_deref())
                    .ok_or_else(|| Error::InvalidArgument(format!("no partition '{name}'")))?
                    .clone();
                qcom_write_image(dev, &entry, src)
            }
            Engine::Mediatek(dev) => {
                let max_packet = dev.max_packet as u64;
                let (total, pieces) = chunked_pieces(src, max_packet)?;
                match dev.info.da_mode {
                    Some(DaMode::Xml) => daxml::daxml_write_partition(dev, name, total, pieces),
                    _ => xflash::xflash_write_partition(dev, name, total, pieces),
                }
            }
            Engine::Spreadtrum(dev) => {
                let max_packet = dev.chunk_size as u64;
                let (total, pieces) = chunked_pieces(src, max_packet)?;
                bsl::spd_write_partition(dev, name, total, pieces)
            }
            Engine::Fastboot(dev) => {
                let target = fastboot::fb_resolve_slot(dev, name);
                fastboot::fb_flash_image(dev, &target, src)
            }
            Engine::Isp(session) => {
                let entry = {
                    let table = session.table()?;
                    table
                        .resolve(name, None)
                        .ok_or_else(|| Error::InvalidArgument(format!("no partition '{name}'")))?
                        .clone()
                };
                isp_write_image(session, &entry, src)
            }
        }
    }

    /// Read a whole named partition into `out`.
    pub fn read_partition(&mut self, name: &str, out: &mut dyn Write) -> Result<()> {
        match self {
            Engine::Qualcomm(dev) => {
                let slot = dev.fh_cfg.storage_slot;
                let table = qcom_read_gpt(dev, slot)?;
                let entry = table
                    .resolve(name, dev.info.current_slot.as_deref())
                    .ok_or_else(|| Error::InvalidArgument(format!("no partition '{name}'")))?;
                firehose::firehose_read_storage(
                    dev,
                    out,
                    entry.block_count as usize,
                    dev.fh_cfg.storage_slot,
                    entry.start_lba,
                )
            }
            Engine::Mediatek(dev) => {
                let len = {
                    let list = match dev.info.da_mode {
                        Some(DaMode::Xml) => daxml::daxml_get_hw_info(dev)?.partitions,
                        _ => xflash::xflash_get_partition_table(dev)?,
                    };
                    list.iter()
                        .find(|(n, _, _)| n == name)
                        .map(|(_, _, len)| *len)
                        .ok_or_else(|| Error::InvalidArgument(format!("no partition '{name}'")))?
                };
                match dev.info.da_mode {
                    Some(DaMode::Xml) => daxml::daxml_read_partition(dev, name, 0, len, out),
                    _ => xflash::xflash_read_partition(dev, name, 0, len, out),
                }
            }
            Engine::Spreadtrum(dev) => {
                let size = bsl::spd_partition_list(dev)?
                    .into_iter()
                    .find(|(n, _)| n == name)
                    .map(|(_, size)| size)
                    .ok_or_else(|| Error::InvalidArgument(format!("no partition '{name}'")))?;
                bsl::spd_read_partition(dev, name, 0, size, out)
            }
            Engine::Fastboot(_) => Err(Error::InvalidArgument(
                "fastboot has no partition read-back path".into(),
            )),
            Engine::Isp(session) => {
                let entry = {
                    let table = session.table()?;
                    table
                        .resolve(name, None)
                        .ok_or_else(|| Error::InvalidArgument(format!("no partition '{name}'")))?
                        .clone()
                };
                let sector_size = session.dev.sector_size();
                let mut remaining = entry.size_bytes(sector_size);
                let mut lba = entry.start_lba;
                let mut buf = vec![0u8; (sector_size as usize) * 2048];
                while remaining > 0 {
                    let want = std::cmp::min(remaining, buf.len() as u64) as usize;
                    session.dev.read_sectors(lba, &mut buf[..want])?;
                    out.write_all(&buf[..want])?;
                    lba += (want as u64) / sector_size;
                    remaining -= want as u64;
                }
                Ok(())
            }
        }
    }

    /// Erase a named partition.
    pub fn erase_partition(&mut self, name: &str) -> Result<()> {
        match self {
            Engine::Qualcomm(dev) => {
                let slot = dev.fh_cfg.storage_slot;
                let table = qcom_read_gpt(dev, slot)?;
                let entry = table
                    .resolve(name, dev.info.current_slot.as_deref())
                    .ok_or_else(|| Error::InvalidArgument(format!("no partition '{name}'")))?;
                firehose::firehose_erase_storage(
                    dev,
                    entry.block_count as usize,
                    dev.fh_cfg.storage_slot,
                    entry.start_lba,
                )
            }
            Engine::Mediatek(dev) => match dev.info.da_mode {
                Some(DaMode::Xml) => daxml::daxml_erase_partition(dev, name),
                _ => xflash::xflash_erase_partition(dev, name),
            },
            Engine::Spreadtrum(dev) => bsl::spd_erase_partition(dev, name),
            Engine::Fastboot(dev) => {
                let target = fastboot::fb_resolve_slot(dev, name);
                fastboot::fb_erase(dev, &target)
            }
            Engine::Isp(session) => {
                let entry = {
                    let table = session.table()?;
                    table
                        .resolve(name, None)
                        .ok_or_else(|| Error::InvalidArgument(format!("no partition '{name}'")))?
                        .clone()
                };
                let sector_size = session.dev.sector_size();
                let zeros = vec![0u8; (sector_size as usize) * 2048];
                let mut remaining = entry.size_bytes(sector_size);
                let mut lba = entry.start_lba;
                while remaining > 0 {
                    let want = std::cmp::min(remaining, zeros.len() as u64) as usize;
                    session.dev.write_sectors(lba, &zeros[..want])?;
                    lba += (want as u64) / sector_size;
                    remaining -= want as u64;
                }
                Ok(())
            }
        }
    }

    /// Vendor-specific raw command escape hatch. The `cmd` syntax follows
    /// the engine: a Firehose XML tag, a hex XFlash opcode, a `CMD:` DA
    /// string, a hex BSL message type, or a literal fastboot command.
    pub fn execute_raw(&mut self, cmd: &str, payload: &[u8]) -> Result<Vec<u8>> {
        match self {
            Engine::Qualcomm(dev) => {
                let logs = firehose::firehose_execute_raw(dev, cmd)?;
                Ok(logs.join("\n").into_bytes())
            }
            Engine::Mediatek(dev) => match dev.info.da_mode {
                Some(DaMode::Xml) => {
                    let doc = daxml::daxml_execute_raw(dev, cmd, &[])?;
                    let mut buf = Vec::new();
                    doc.write(&mut buf)
                        .map_err(|e| Error::InvalidArgument(e.to_string()))?;
                    Ok(buf)
                }
                _ => {
                    let opcode = parse_hex_or_dec(cmd).ok_or_else(|| {
                        Error::InvalidArgument(format!("'{cmd}' is not an XFlash opcode"))
                    })? as u32;
                    xflash::xflash_execute_raw(dev, opcode, payload)
                }
            },
            Engine::Spreadtrum(dev) => {
                let msg_type = parse_hex_or_dec(cmd).ok_or_else(|| {
                    Error::InvalidArgument(format!("'{cmd}' is not a BSL message type"))
                })? as u16;
                let (rep, data) = bsl::spd_execute_raw(dev, msg_type, payload)?;
                let mut out = rep.to_be_bytes().to_vec();
                out.extend(data);
                Ok(out)
            }
            Engine::Fastboot(dev) => {
                let mut full = cmd.to_owned();
                if !payload.is_empty() {
                    full.push(':');
                    full.push_str(&String::from_utf8_lossy(payload));
                }
                let value = fastboot::fb_raw_command(dev, &full)?;
                Ok(value.into_bytes())
            }
            Engine::Isp(_) => Err(Error::InvalidArgument(
                "ISP mode has no command channel".into(),
            )),
        }
    }

    /// Leave flashing mode: reboot into the OS (or the vendor's closest
    /// equivalent).
    pub fn reboot(&mut self) -> Result<()> {
        match self {
            Engine::Qualcomm(dev) => {
                dev.reset_on_drop = false;
                firehose::firehose_reset(dev, FirehoseResetMode::System, 0)
            }
            Engine::Mediatek(dev) => match dev.info.da_mode {
                Some(DaMode::Xml) => daxml::daxml_set_boot_mode(dev, "reboot"),
                _ => xflash::xflash_shutdown(dev),
            },
            Engine::Spreadtrum(dev) => bsl::spd_reset(dev),
            Engine::Fastboot(dev) => fastboot::fb_reboot(dev),
            Engine::Isp(_) => Ok(()),
        }
    }

    /// Release the transport. Scoped acquisition means dropping is enough;
    /// this exists so callers can make the hand-back explicit.
    pub fn disconnect(self) {}
}

fn isp_write_image(
    session: &mut IspSession,
    entry: &PartitionEntry,
    src: &mut dyn ReadSeek,
) -> Result<()> {
    let sector_size = session.dev.sector_size();
    let part_bytes = entry.size_bytes(sector_size);
    let logical = logical_len(src)?;
    if logical > part_bytes {
        return Err(too_small(&entry.name, logical, part_bytes));
    }

    if sparse::is_sparse_image(src)? {
        let (block_size, chunks) = {
            let reader = SparseReader::open(&mut *src)?;
            (reader.block_size() as u64, reader.chunks().to_vec())
        };
        if block_size % sector_size != 0 {
            return Err(ImageError::UnalignedSize(block_size).into());
        }
        let spb = block_size / sector_size;

        let mut cursor_block: u64 = 0;
        for desc in chunks {
            let lba = entry.start_lba + cursor_block * spb;
            match desc {
                ChunkDesc::Raw { blocks, data_off } => {
                    src.seek(SeekFrom::Start(data_off))?;
                    let mut data = vec![0u8; (blocks as u64 * block_size) as usize];
                    src.read_exact(&mut data)?;
                    session.dev.write_sectors(lba, &data)?;
                }
                ChunkDesc::Fill { blocks, pattern } => {
                    let block: Vec<u8> = pattern
                        .iter()
                        .copied()
                        .cycle()
                        .take(block_size as usize)
                        .collect();
                    for b in 0..blocks as u64 {
                        session.dev.write_sectors(lba + b * spb, &block)?;
                    }
                }
                ChunkDesc::DontCare { .. } | ChunkDesc::Crc32 { .. } => {}
            }
            cursor_block += desc.blocks() as u64;
        }
        return Ok(());
    }

    let mut lba = entry.start_lba;
    let mut buf = vec![0u8; (sector_size as usize) * 2048];
    loop {
        let mut got = 0;
        while got < buf.len() {
            match src.read(&mut buf[got..])? {
                0 => break,
                n => got += n,
            }
        }
        if got == 0 {
            break;
        }
        // Pad the tail to a whole sector
        let padded = got.div_ceil(sector_size as usize) * sector_size as usize;
        buf[got..padded].fill(0);
        session.dev.write_sectors(lba, &buf[..padded])?;
        lba += (padded as u64) / sector_size;
        if got < buf.len() {
            break;
        }
    }
    Ok(())
}

fn parse_hex_or_dec(s: &str) -> Option<u64> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else {
        s.parse().ok()
    }
}

/// One device session: engine, cancel handle, optional watchdog.
///
/// Dropping the session from any point releases the OS handles (transports
/// close on drop) and stops the watchdog. A cancelled session stays dead.
pub struct Session {
    engine: Engine,
    cancel: CancelToken,
}

impl Session {
    pub fn new(mut engine: Engine) -> Self {
        let cancel = engine.transport_mut().cancel_token();
        Self { engine, cancel }
    }

    /// Attach a watchdog that trips this session's cancel token when its
    /// policy gives up. Transfer loops feed it automatically.
    pub fn with_watchdog(mut self, module: impl Into<String>, timeout: Duration) -> Self {
        let mut dog =
            Watchdog::with_policy(module, timeout, default_handler(), Some(self.cancel.clone()));
        dog.start();
        self.engine.set_watchdog(dog);
        self
    }

    /// Handle for cancelling from another thread (a UI, a signal handler).
    pub fn cancel_handle(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn info(&self) -> &DeviceInfo {
        self.engine.info()
    }

    /// Borrow the engine for one linearised command sequence. Refused once
    /// the session has been cancelled.
    pub fn engine_mut(&mut self) -> Result<&mut Engine> {
        if self.cancel.is_cancelled() {
            return Err(TransportError::Cancelled.into());
        }
        Ok(&mut self.engine)
    }

    /// Trip the cancel token; the in-flight transport operation fails and
    /// the session is permanently unusable.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedTransport;
    use crate::types::FirehoseConfig;

    #[test]
    fn fill_reader_repeats_the_pattern() {
        let mut r = FillReader::new([0xDE, 0xAD, 0xBE, 0xEF], 10);
        let mut out = Vec::new();
        r.read_to_end(&mut out).unwrap();
        assert_eq!(out, vec![0xDE, 0xAD, 0xBE, 0xEF, 0xDE, 0xAD, 0xBE, 0xEF, 0xDE, 0xAD]);
    }

    #[test]
    fn cancelled_sessions_refuse_further_commands() {
        let dev = QcomDevice::new(Box::new(ScriptedTransport::new()), FirehoseConfig::default());
        let mut session = Session::new(Engine::Qualcomm(dev));
        assert!(session.engine_mut().is_ok());

        session.cancel();
        assert!(session.is_cancelled());
        let err = session.engine_mut().unwrap_err();
        assert!(matches!(
            err,
            Error::Transport(TransportError::Cancelled)
        ));
    }

    #[test]
    fn cancel_handle_reaches_the_transport() {
        let dev = FastbootDevice::new(Box::new(ScriptedTransport::new()));
        let session = Session::new(Engine::Fastboot(dev));
        let handle = session.cancel_handle();
        handle.cancel();
        assert!(session.is_cancelled());
    }

    #[test]
    fn chunked_pieces_passes_small_raw_images_through() {
        let image = vec![0x42_u8; 1000];
        let mut cursor = Cursor::new(image.clone());
        let (total, pieces) = chunked_pieces(&mut cursor, 4096).unwrap();
        assert_eq!(total, 1000);
        let pieces: Vec<_> = pieces.collect::<Result<_>>().unwrap();
        assert_eq!(pieces, vec![image]);
    }

    #[test]
    fn chunked_pieces_splits_large_raw_images_sparsely() {
        let image = vec![0x42_u8; 64 * 1024];
        let mut cursor = Cursor::new(image);
        let (total, pieces) = chunked_pieces(&mut cursor, 16 * 1024).unwrap();
        let pieces: Vec<_> = pieces.collect::<Result<_>>().unwrap();
        assert_eq!(pieces.len(), 4);
        assert_eq!(total, pieces.iter().map(|p| p.len() as u64).sum::<u64>());
        for p in &pieces {
            crate::sparse::SparseReader::open(Cursor::new(p.clone())).unwrap();
        }
    }
}
