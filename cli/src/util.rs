// SPDX-License-Identifier: BSD-3-Clause
use anyhow::Result;
use owo_colors::OwoColorize;
use std::fs::{self, File};
use std::path::Path;

use xdl::engine::Session;

pub fn print_partition_table(session: &mut Session) -> Result<()> {
    let table = session.engine_mut()?.partitions()?;

    match &table.disk_guid {
        Some(guid) => println!("Disk {}:", guid.bright_yellow()),
        None => println!("Partitions (layout {}):", if table.layout_known { "known" } else { "reported sizes only" }),
    }
    for part in &table.entries {
        if table.layout_known {
            println!(
                "{}: start_lba = {}, {} bytes ({} kiB){}",
                part.name,
                part.start_lba,
                part.size_bytes(table.sector_size),
                part.size_bytes(table.sector_size) / 1024,
                match &part.slot_suffix {
                    Some(s) => format!(" [slot {s}]"),
                    None => String::new(),
                },
            );
        } else {
            println!(
                "{}: {} bytes ({} kiB)",
                part.name,
                part.size_bytes(table.sector_size),
                part.size_bytes(table.sector_size) / 1024,
            );
        }
    }

    Ok(())
}

/// Dump every named partition into `outdir`, one file per partition.
pub fn dump_all_partitions(session: &mut Session, outdir: &str) -> Result<()> {
    fs::create_dir_all(outdir)?;
    let outpath = Path::new(outdir);

    let table = session.engine_mut()?.partitions()?;
    for part in &table.entries {
        if part.name.is_empty() || part.block_count == 0 {
            continue;
        }

        println!("{} {}", "Dumping".bright_black(), part.name);
        let mut out = File::create(outpath.join(&part.name))?;
        session.engine_mut()?.read_partition(&part.name, &mut out)?;
    }
    Ok(())
}
