// SPDX-License-Identifier: BSD-3-Clause
use anyhow::{Result, bail};
use std::fs;
use std::path::Path;

use xdl::firehose::firehose_set_bootable;
use xdl::types::QcomDevice;

use crate::programfile::parse_program_xml;

/// Walk a set of rawprogram/patch XML files in order and apply each one to
/// the device. When any of them programs a boot-stage label, the physical
/// partition it landed on is flagged bootable afterwards.
pub(crate) fn run_flash(
    dev: &mut QcomDevice,
    program_file_paths: Vec<String>,
    patch_file_paths: Vec<String>,
) -> Result<()> {
    // Refuse to start with an incomplete file set; half a flash is worse
    // than none
    let file_paths = [&program_file_paths[..], &patch_file_paths[..]].concat();
    if let Some(f) = file_paths.iter().find(|f| !Path::new(f).is_file()) {
        bail!("missing input file {f}");
    }
    let dump_dir = std::env::temp_dir().join("xdl-out");
    fs::create_dir_all(&dump_dir)?;

    let mut bootable_part_idx: Option<u8> = None;
    for program_file_path in file_paths {
        let path = Path::new(&program_file_path);

        // Sibling images live next to the program file
        let program_file_dir = match path.parent() {
            Some(dir) => dir,
            None => Path::new("."),
        };
        let program_file = fs::read(path)?;
        let xml = xmltree::Element::parse(&program_file[..])?;

        if let Some(n) = parse_program_xml(dev, &xml, program_file_dir, &dump_dir, true)? {
            bootable_part_idx = Some(n)
        };
    }

    // eMMC boot LUNs and the like need an explicit bootable mark once the
    // boot stages are in place
    if let Some(idx) = bootable_part_idx {
        println!("Marking physical partition {idx} bootable");
        firehose_set_bootable(dev, idx)?;
    }

    Ok(())
}
