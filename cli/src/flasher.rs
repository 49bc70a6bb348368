// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.
use anyhow::Result;
use qdl::manifest::{find_bootable_partition, PlanContext, Program};
use qdl::types::QdlChan;
use qdl::{firehose_patch, firehose_program_storage, firehose_reset, firehose_set_bootable};

use std::fs::File;
use std::io::{Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// Partitions that carry the OS rather than firmware; skipped with -f.
const FW_SKIP_LABELS: [&str; 7] = [
    "system", "cust", "userdata", "keystore", "boot", "recovery", "sec",
];

fn resolve_payload_path(filename: &str, incdir: Option<&Path>) -> PathBuf {
    if let Some(dir) = incdir {
        let candidate = dir.join(filename);
        if candidate.exists() {
            return candidate;
        }
    }
    PathBuf::from(filename)
}

fn apply_program<T: QdlChan>(
    channel: &mut T,
    program: &Program,
    incdir: Option<&Path>,
) -> Result<()> {
    if program.filename.is_empty() {
        return Ok(());
    }

    if channel.fh_config().fw_only && FW_SKIP_LABELS.contains(&program.label.as_str()) {
        println!("[FIREHOSE] skipping {}", program.label);
        return Ok(());
    }

    let path = resolve_payload_path(&program.filename, incdir);
    let mut file = match File::open(&path) {
        Ok(f) => f,
        Err(_) => {
            println!("Unable to open {}...ignoring", path.display());
            return Ok(());
        }
    };

    // The declared sector count is only an upper bound; what's actually on
    // disk decides how much goes over the wire.
    let file_len = file.metadata()?.len();
    let mut num_sectors = file_len.div_ceil(program.sector_size as u64) as usize;
    if program.num_sectors != 0 && num_sectors > program.num_sectors {
        eprintln!(
            "[PROGRAM] {} truncated to {} bytes",
            program.label,
            program.num_sectors * program.sector_size
        );
        num_sectors = program.num_sectors;
    }

    file.seek(SeekFrom::Start(
        program.file_offset * program.sector_size as u64,
    ))?;

    firehose_program_storage(
        channel,
        &mut file,
        &program.label,
        num_sectors,
        program.sector_size,
        program.partition,
        &program.start_sector,
        Some(&program.filename),
    )?;

    Ok(())
}

/// Walk the loaded plan: program every entry, patch storage metadata, mark
/// the boot partition, reset. The first NAK aborts the run.
pub(crate) fn run_flash<T: QdlChan>(
    channel: &mut T,
    ctx: &PlanContext,
    incdir: Option<&Path>,
) -> Result<()> {
    for program in &ctx.programs {
        apply_program(channel, program, incdir)?;
    }

    for patch in ctx.patches.iter().filter(|p| p.filename == "DISK") {
        firehose_patch(channel, patch)?;
    }

    match find_bootable_partition(&ctx.programs) {
        Ok(Some(part)) => {
            println!("Setting partition {part} as bootable!");
            firehose_set_bootable(channel, part)?;
        }
        Ok(None) => eprintln!("no boot partition found"),
        Err(e) => eprintln!("{e}, skipping set-bootable"),
    }

    firehose_reset(channel)?;

    Ok(())
}
