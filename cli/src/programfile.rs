// SPDX-License-Identifier: BSD-3-Clause
use anyhow::bail;
use indexmap::IndexMap;
use std::{
    fs,
    io::{Seek, SeekFrom},
    path::Path,
};
use xmltree::{Element, XMLNode};

use xdl::firehose::{
    firehose_patch, firehose_program_storage, firehose_read_digest, firehose_read_storage,
};
use xdl::types::{QcomChan, QcomDevice};

fn attr<'a>(attrs: &'a IndexMap<String, String>, key: &str) -> anyhow::Result<&'a str> {
    match attrs.get(key) {
        Some(v) => Ok(v.as_str()),
        None => bail!("tag is missing its '{key}' attribute"),
    }
}

fn attr_num<T: std::str::FromStr>(attrs: &IndexMap<String, String>, key: &str) -> anyhow::Result<T> {
    match attr(attrs, key)?.parse::<T>() {
        Ok(v) => Ok(v),
        Err(_) => bail!("unparseable '{key}' attribute"),
    }
}

fn parse_read_cmd(
    dev: &mut QcomDevice,
    out_dir: &Path,
    attrs: &IndexMap<String, String>,
    checksum_only: bool,
) -> anyhow::Result<()> {
    let num_sectors: usize = attr_num(attrs, "num_partition_sectors")?;
    let phys_part_idx: u8 = attr_num(attrs, "physical_partition_number")?;
    let start_sector: u64 = attr_num(attrs, "start_sector")?;

    if checksum_only {
        let digest = firehose_read_digest(
            dev,
            num_sectors,
            phys_part_idx,
            &start_sector.to_string(),
        )?;
        println!("sha256({start_sector}+{num_sectors}) = {digest}");
        return Ok(());
    }

    if !attrs.contains_key("filename") {
        bail!("<read> gives no filename to dump into");
    }
    let mut outfile = fs::File::create(out_dir.join(attr(attrs, "filename")?))?;

    Ok(firehose_read_storage(
        dev,
        &mut outfile,
        num_sectors,
        phys_part_idx,
        start_sector,
    )?)
}

fn parse_patch_cmd(dev: &mut QcomDevice, attrs: &IndexMap<String, String>) -> anyhow::Result<()> {
    // Patches addressed at files on the host are vendor-tool artifacts;
    // only DISK patches touch the device
    match attrs.get("filename") {
        Some(f) if f == "DISK" => {}
        Some(f) => {
            tracing::debug!("skipping <patch> aimed at host file {f}");
            return Ok(());
        }
        None => bail!("<patch> names no target"),
    }

    let byte_off: u64 = attr_num(attrs, "byte_offset")?;
    let phys_part_idx: u8 = attr_num(attrs, "physical_partition_number")?;
    let size: u64 = attr_num(attrs, "size_in_bytes")?;
    let start_sector = attr(attrs, "start_sector")?;
    let val = attr(attrs, "value")?;

    Ok(firehose_patch(
        dev,
        byte_off,
        phys_part_idx,
        size,
        start_sector,
        val,
    )?)
}

const BOOTABLE_PART_NAMES: [&str; 3] = ["xbl", "xbl_a", "sbl1"];

fn parse_program_cmd(
    dev: &mut QcomDevice,
    program_file_dir: &Path,
    attrs: &IndexMap<String, String>,
    allow_missing_files: bool,
    bootable_part_idx: &mut Option<u8>,
) -> anyhow::Result<()> {
    let sector_size: usize = attr_num(attrs, "SECTOR_SIZE_IN_BYTES")?;
    if sector_size != dev.fh_config().storage_sector_size {
        bail!(
            "program file assumes {}-byte sectors, this session negotiated {}",
            sector_size,
            dev.fh_config().storage_sector_size
        );
    }
    let num_sectors: usize = attr_num(attrs, "num_partition_sectors")?;
    let phys_part_idx: u8 = attr_num(attrs, "physical_partition_number")?;
    let start_sector = attr(attrs, "start_sector")?.to_owned();
    let file_sector_offset: u64 = attrs
        .get("file_sector_offset")
        .and_then(|a| a.parse().ok())
        .unwrap_or(0);

    let label = attr(attrs, "label")?.to_owned();
    if num_sectors == 0 {
        tracing::debug!("nothing to send for zero-length entry {label}");
        return Ok(());
    }
    if BOOTABLE_PART_NAMES.contains(&&label[..]) {
        *bootable_part_idx = Some(phys_part_idx);
    }

    let filename = attr(attrs, "filename")?;
    let file_path = program_file_dir.join(filename);
    if allow_missing_files {
        if filename.is_empty() {
            tracing::debug!("entry {label} names no image, skipping");
            return Ok(());
        } else if !file_path.exists() {
            tracing::debug!(
                "no {} on disk, tolerated by the missing-file policy",
                file_path.display()
            );
            return Ok(());
        }
    }

    let mut buf = fs::File::open(file_path)?;
    buf.seek(SeekFrom::Start(sector_size as u64 * file_sector_offset))?;

    Ok(firehose_program_storage(
        dev,
        &mut buf,
        &label,
        num_sectors,
        phys_part_idx,
        &start_sector,
    )?)
}

/// Execute one vendor rawprogram/patch XML against the device. Returns the
/// physical partition index that ended up holding a boot stage, when one
/// of the programmed labels says so.
pub fn parse_program_xml(
    dev: &mut QcomDevice,
    xml: &Element,
    program_file_dir: &Path,
    out_dir: &Path,
    allow_missing_files: bool,
) -> anyhow::Result<Option<u8>> {
    let mut bootable_part_idx: Option<u8> = None;

    // Validation pass: every <program> must name an image we can find,
    // unless the caller opted into the missing-file policy. Catching this
    // before the first write keeps the device out of half-flashed states.
    for node in xml.children.iter() {
        if let XMLNode::Element(e) = node {
            if e.name.to_lowercase() == "program" {
                if !e.attributes.contains_key("filename") {
                    bail!("<program> names no image file");
                }

                let filename = attr(&e.attributes, "filename")?;
                let file_path = program_file_dir.join(filename);

                if !file_path.exists() && !allow_missing_files {
                    bail!("referenced image {} is absent", file_path.display())
                }
            }
        }
    }

    // Execution pass, in document order
    for node in xml.children.iter() {
        if let XMLNode::Element(e) = node {
            match e.name.to_lowercase().as_str() {
                "getsha256digest" => parse_read_cmd(dev, out_dir, &e.attributes, true)?,
                "patch" => parse_patch_cmd(dev, &e.attributes)?,
                "program" => parse_program_cmd(
                    dev,
                    program_file_dir,
                    &e.attributes,
                    allow_missing_files,
                    &mut bootable_part_idx,
                )?,
                "read" => parse_read_cmd(dev, out_dir, &e.attributes, false)?,

                unknown => bail!("unrecognised instruction <{unknown}>, stopping before it does damage"),
            };
        }
    }

    Ok(bootable_part_idx)
}
