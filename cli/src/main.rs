// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.
use anyhow::{bail, Context, Result};
use clap::Parser;
use owo_colors::OwoColorize;
use qdl::manifest::PlanContext;
use qdl::sahara::sahara_run;
use qdl::types::{FirehoseConfiguration, FirehoseStorageType, QdlDevice};
use qdl::{firehose_configure, firehose_drain, setup_target_device, ufs};

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::thread;
use std::time::Duration;

mod flasher;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Dump all firehose traffic to stderr
    #[arg(short, long)]
    debug: bool,

    /// Flash firmware partitions only, leaving the OS alone
    #[arg(short, long)]
    firmware: bool,

    /// Storage medium behind the loader
    #[arg(short, long, default_value = "ufs", value_name = "emmc/ufs")]
    storage: String,

    /// Allow provisioning XMLs that lock the UFS config descriptor
    #[arg(long)]
    finalize_provisioning: bool,

    /// Directory searched first for program payload files
    #[arg(short, long, value_name = "PATH")]
    include: Option<PathBuf>,

    /// Loader image fed to the boot ROM over sahara
    #[arg(value_name = "prog.mbn")]
    prog_mbn: String,

    /// rawprogram/patch/provisioning manifests, executed in order
    #[arg(value_name = "manifest.xml", required = true, num_args = 1..)]
    manifests: Vec<String>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let storage_type = FirehoseStorageType::from_str(&args.storage)?;

    // Everything host-side is validated before the device is touched; a
    // manifest problem must not leave a half-driven target behind.
    let mut ctx = PlanContext::default();
    for manifest in &args.manifests {
        ctx.load_file(Path::new(manifest), args.finalize_provisioning)?;
    }

    let mbn = fs::read(&args.prog_mbn)
        .with_context(|| format!("couldn't open the loader binary {}", args.prog_mbn))?;

    let mut rw_channel = match setup_target_device() {
        Ok(c) => c,
        Err(e) => bail!("Couldn't set up device: {e}"),
    };
    let mut qdl_dev = QdlDevice {
        rw: rw_channel.as_mut(),
        fh_cfg: FirehoseConfiguration {
            storage_type,
            fw_only: args.firmware,
            debug: args.debug,
            ..Default::default()
        },
    };

    sahara_run(&mut qdl_dev, &mbn)?;

    // Give the loader time to come up, then absorb its boot chatter
    thread::sleep(Duration::from_secs(3));
    firehose_drain(&mut qdl_dev, Duration::from_millis(1000));

    if let Some(plan) = &ctx.ufs {
        firehose_configure(&mut qdl_dev, true)?;

        match ufs::provisioning_execute(&mut qdl_dev, plan) {
            Ok(()) => println!("{}", "UFS provisioning succeeded".green()),
            Err(e) => {
                println!("{}", "UFS provisioning failed".red());
                return Err(e.into());
            }
        }

        return Ok(());
    }

    firehose_configure(&mut qdl_dev, false)?;
    flasher::run_flash(&mut qdl_dev, &ctx, args.include.as_deref())?;

    println!("{}", "All went well!".green());

    Ok(())
}
