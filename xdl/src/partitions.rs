// SPDX-License-Identifier: BSD-3-Clause
//! Unified partition model.
//!
//! The same table type is filled from four very different sources: an
//! on-disk GPT (the ISP path and Firehose GPT reads), Firehose
//! `<getstorageinfo>`, fastboot variable sweeps, and the FDL2 partition
//! list. Not every source knows the physical layout; tables that only
//! carry names and sizes say so and skip the overlap validation.

use gptman::GPT;
use std::io::{Read, Seek};

use crate::error::{Error, ImageError, Result};

/// One partition, as uniformly as the sources allow.
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionEntry {
    pub name: String,
    pub start_lba: u64,
    pub block_count: u64,
    /// GPT type GUID (formatted) or a source-specific type name
    pub type_name: Option<String>,
    pub attrs: u64,
    /// `Some("a")`/`Some("b")` when the name carries an A/B suffix
    pub slot_suffix: Option<String>,
}

impl PartitionEntry {
    pub fn size_bytes(&self, sector_size: u64) -> u64 {
        self.block_count * sector_size
    }

    /// Name with any slot suffix removed.
    pub fn base_name(&self) -> &str {
        match &self.slot_suffix {
            Some(suffix) => self
                .name
                .strip_suffix(&format!("_{suffix}"))
                .unwrap_or(&self.name),
            None => &self.name,
        }
    }

    pub fn end_lba(&self) -> u64 {
        self.start_lba + self.block_count
    }
}

pub(crate) fn slot_suffix_of(name: &str) -> Option<String> {
    if name.ends_with("_a") {
        Some("a".to_owned())
    } else if name.ends_with("_b") {
        Some("b".to_owned())
    } else {
        None
    }
}

/// GPT mixed-endian GUID text form.
fn format_guid(guid: &[u8; 16]) -> String {
    format!(
        "{:02X}{:02X}{:02X}{:02X}-{:02X}{:02X}-{:02X}{:02X}-{:02X}{:02X}-{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}",
        guid[3], guid[2], guid[1], guid[0],
        guid[5], guid[4],
        guid[7], guid[6],
        guid[8], guid[9],
        guid[10], guid[11], guid[12], guid[13], guid[14], guid[15]
    )
}

#[derive(Debug, Clone, Default)]
pub struct PartitionTable {
    pub entries: Vec<PartitionEntry>,
    pub disk_guid: Option<String>,
    pub first_usable_lba: Option<u64>,
    pub last_usable_lba: Option<u64>,
    pub sector_size: u64,
    /// False for sources that only report names and sizes; such tables
    /// have meaningless `start_lba` values and skip overlap checks.
    pub layout_known: bool,
}

impl PartitionTable {
    /// Build from a parsed GPT.
    pub fn from_gpt(gpt: &GPT) -> Self {
        let mut entries = Vec::new();
        for (_, part) in gpt.iter() {
            if part.partition_name.as_str().is_empty() && part.starting_lba == 0 {
                continue;
            }
            let name = part.partition_name.as_str().to_owned();
            entries.push(PartitionEntry {
                slot_suffix: slot_suffix_of(&name),
                name,
                start_lba: part.starting_lba,
                block_count: part.ending_lba - part.starting_lba + 1,
                type_name: Some(format_guid(&part.partition_type_guid)),
                attrs: part.attribute_bits,
            });
        }
        Self {
            entries,
            disk_guid: Some(format_guid(&gpt.header.disk_guid)),
            first_usable_lba: Some(gpt.header.first_usable_lba),
            last_usable_lba: Some(gpt.header.last_usable_lba),
            sector_size: gpt.sector_size,
            layout_known: true,
        }
    }

    /// Parse a GPT straight from a seekable source (a block device in ISP
    /// mode, or a storage dump).
    pub fn from_gpt_source<R: Read + Seek>(src: &mut R, sector_size: u64) -> Result<Self> {
        let gpt = GPT::read_from(src, sector_size)
            .map_err(|e| Error::from(ImageError::InconsistentChunks(format!("GPT: {e}"))))?;
        Ok(Self::from_gpt(&gpt))
    }

    /// Build from a source that reports names and byte sizes only (FDL2
    /// partition lists, fastboot variable sweeps).
    pub fn from_name_sizes(list: &[(String, u64)], sector_size: u64) -> Self {
        let entries = list
            .iter()
            .map(|(name, bytes)| PartitionEntry {
                slot_suffix: slot_suffix_of(name),
                name: name.clone(),
                start_lba: 0,
                block_count: bytes.div_ceil(sector_size.max(1)),
                type_name: None,
                attrs: 0,
            })
            .collect();
        Self {
            entries,
            sector_size,
            layout_known: false,
            ..Self::default()
        }
    }

    /// Enforce the range-disjointness invariant for layout-bearing tables.
    pub fn validate(&self) -> Result<()> {
        if !self.layout_known {
            return Ok(());
        }
        let mut ranges: Vec<(&PartitionEntry, u64, u64)> = self
            .entries
            .iter()
            .map(|e| (e, e.start_lba, e.end_lba()))
            .collect();
        ranges.sort_by_key(|&(_, start, _)| start);
        for pair in ranges.windows(2) {
            let (a, _, a_end) = pair[0];
            let (b, b_start, _) = pair[1];
            if b_start < a_end {
                return Err(ImageError::InconsistentChunks(format!(
                    "partitions '{}' and '{}' overlap",
                    a.name, b.name
                ))
                .into());
            }
        }
        Ok(())
    }

    pub fn find(&self, name: &str) -> Option<&PartitionEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    /// Look a name up, routing slotless names on slotted tables to the
    /// active slot.
    pub fn resolve(&self, name: &str, active_slot: Option<&str>) -> Option<&PartitionEntry> {
        if let Some(hit) = self.find(name) {
            return Some(hit);
        }
        let slot = active_slot?;
        self.find(&format!("{name}_{slot}"))
    }

    /// Whether any entry carries an A/B suffix.
    pub fn is_slotted(&self) -> bool {
        self.entries.iter().any(|e| e.slot_suffix.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, start: u64, count: u64) -> PartitionEntry {
        PartitionEntry {
            name: name.to_owned(),
            start_lba: start,
            block_count: count,
            type_name: None,
            attrs: 0,
            slot_suffix: slot_suffix_of(name),
        }
    }

    #[test]
    fn slot_suffixes_are_detected() {
        assert_eq!(slot_suffix_of("boot_a").as_deref(), Some("a"));
        assert_eq!(slot_suffix_of("boot_b").as_deref(), Some("b"));
        assert_eq!(slot_suffix_of("userdata"), None);
        assert_eq!(entry("boot_a", 0, 1).base_name(), "boot");
    }

    #[test]
    fn overlapping_entries_fail_validation() {
        let table = PartitionTable {
            entries: vec![entry("a", 0, 100), entry("b", 99, 10)],
            sector_size: 512,
            layout_known: true,
            ..PartitionTable::default()
        };
        assert!(table.validate().is_err());

        let ok = PartitionTable {
            entries: vec![entry("a", 0, 100), entry("b", 100, 10)],
            sector_size: 512,
            layout_known: true,
            ..PartitionTable::default()
        };
        ok.validate().unwrap();
    }

    #[test]
    fn size_only_tables_skip_layout_checks() {
        let table = PartitionTable::from_name_sizes(
            &[("boot".to_owned(), 0x100_0000), ("system".to_owned(), 0x200_0000)],
            512,
        );
        assert!(!table.layout_known);
        table.validate().unwrap();
        assert_eq!(table.find("boot").unwrap().block_count, 0x100_0000 / 512);
    }

    #[test]
    fn slotless_lookups_route_to_the_active_slot() {
        let table = PartitionTable {
            entries: vec![entry("boot_a", 0, 10), entry("boot_b", 10, 10)],
            sector_size: 512,
            layout_known: true,
            ..PartitionTable::default()
        };
        assert!(table.is_slotted());
        assert_eq!(table.resolve("boot", Some("b")).unwrap().name, "boot_b");
        assert_eq!(table.resolve("boot_a", Some("b")).unwrap().name, "boot_a");
        assert!(table.resolve("boot", None).is_none());
    }

    #[test]
    fn guids_format_mixed_endian() {
        // EFI system partition type GUID, on-disk byte order
        let guid: [u8; 16] = [
            0x28, 0x73, 0x2A, 0xC1, 0x1F, 0xF8, 0xD2, 0x11, 0xBA, 0x4B, 0x00, 0xA0, 0xC9, 0x3E,
            0xC9, 0x3B,
        ];
        assert_eq!(format_guid(&guid), "C12A7328-F81F-11D2-BA4B-00A0C93EC93B");
    }
}
