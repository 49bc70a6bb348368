// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.

//! Host-side implementation of the Qualcomm Emergency Download protocols:
//! sahara to get a loader onto the bare boot ROM, firehose to drive that
//! loader over XML-framed USB bulk transfers.

use std::cmp;
use std::io::{self, Read};
use std::str;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use itertools::Itertools;
use xmltree::{Element, XMLNode};

pub mod manifest;
pub mod parsers;
pub mod sahara;
pub mod types;
pub mod ufs;
mod usb;

#[cfg(test)]
pub(crate) mod testutil;

use parsers::{firehose_parser_ack_nak, firehose_parser_configure_response};
use types::{FirehoseError, FirehoseStatus, NakError, QdlChan, QdlReadWrite};
use ufs::{UfsBody, UfsCommon, UfsEpilogue};

const FIREHOSE_READ_BUF_SIZE: usize = 4096;
const FIREHOSE_FIRST_READ_TIMEOUT: Duration = Duration::from_millis(1000);
const FIREHOSE_DRAIN_TIMEOUT: Duration = Duration::from_millis(100);
const FIREHOSE_POST_RSP_TIMEOUT: Duration = Duration::from_millis(1);

/// Open the USB backend. Blocks until a device in EDL mode appears.
pub fn setup_target_device() -> anyhow::Result<Box<dyn QdlReadWrite>> {
    Ok(Box::new(usb::setup_usb_device()?))
}

pub fn print_hex_dump(prefix: &str, buf: &[u8]) {
    for chunk in buf.chunks(16) {
        eprintln!("{prefix}: {:02x}", chunk.iter().format(" "));
    }
}

/// Serialize a single firehose command into its <data> envelope.
pub fn firehose_xml_setup(cmd: &str, attrs: &[(&str, &str)]) -> Result<Vec<u8>, FirehoseError> {
    let mut node = Element::new(cmd);
    for (attr, value) in attrs {
        node.attributes
            .insert((*attr).to_owned(), (*value).to_owned());
    }

    let mut root = Element::new("data");
    root.children.push(XMLNode::Element(node));

    let mut packet = vec![];
    root.write(&mut packet)?;
    Ok(packet)
}

fn firehose_write<T: QdlChan>(channel: &mut T, packet: &[u8]) -> Result<(), FirehoseError> {
    if channel.fh_config().debug {
        eprintln!("FIREHOSE WRITE: {}", String::from_utf8_lossy(packet));
    }

    let written = channel.rw().write_eot(packet, true)?;
    if written != packet.len() {
        return Err(FirehoseError::ShortWrite {
            written,
            expected: packet.len(),
        });
    }

    Ok(())
}

/// A callback digesting the attributes of one <response> element.
pub type FirehoseRspParser<T> =
    fn(&mut T, &IndexMap<String, String>) -> Result<FirehoseStatus, FirehoseError>;

/// Collect the reply to one firehose command.
///
/// The device interleaves any number of <log> packets with exactly one
/// <response>, back-to-back in the same bulk stream. Keep reading until the
/// response shows up, hand it to `parser`, then drain trailing packets on a
/// short timeout until the channel goes quiet.
pub fn firehose_read<T: QdlChan>(
    channel: &mut T,
    parser: FirehoseRspParser<T>,
) -> Result<FirehoseStatus, FirehoseError> {
    firehose_read_loop(channel, FIREHOSE_FIRST_READ_TIMEOUT, Some(parser))
}

/// Swallow whatever the loader prints while booting. Used once, between
/// sahara handing over and the first <configure>.
pub fn firehose_drain<T: QdlChan>(channel: &mut T, wait: Duration) {
    let _ = firehose_read_loop(channel, wait, None);
}

fn firehose_read_loop<T: QdlChan>(
    channel: &mut T,
    first_timeout: Duration,
    parser: Option<FirehoseRspParser<T>>,
) -> Result<FirehoseStatus, FirehoseError> {
    let mut buf = [0u8; FIREHOSE_READ_BUF_SIZE];
    let mut timeout = first_timeout;
    let mut result: Option<Result<FirehoseStatus, FirehoseError>> = None;

    loop {
        let n = match channel.rw().read_timeout(&mut buf, timeout) {
            Ok(n) => n,
            Err(_) if result.is_some() || parser.is_none() => break,
            Err(e) if e.kind() == io::ErrorKind::TimedOut => return Err(FirehoseError::Timeout),
            Err(e) => return Err(e.into()),
        };

        if n == 0 {
            continue;
        }

        if channel.fh_config().debug {
            eprintln!("FIREHOSE READ: {}", String::from_utf8_lossy(&buf[..n]));
        }

        let text = str::from_utf8(&buf[..n]).map_err(|_| FirehoseError::NonTextResponse)?;

        let mut rest = text;
        loop {
            rest = rest.trim_start_matches(['\0', '\r', '\n', ' ']);
            if rest.is_empty() {
                break;
            }

            let Some(end) = rest.find("</data>") else {
                eprintln!("firehose response truncated");
                return Err(FirehoseError::TruncatedPacket);
            };
            let (packet, tail) = rest.split_at(end + "</data>".len());
            rest = tail;

            let root = Element::parse(packet.as_bytes())?;
            for node in &root.children {
                let Some(e) = node.as_element() else { continue };
                match e.name.as_str() {
                    "log" => println!(
                        "LOG: {}",
                        e.attributes.get("value").map(String::as_str).unwrap_or("")
                    ),
                    "response" => {
                        if let Some(parser) = parser {
                            result = Some(parser(channel, &e.attributes));
                            timeout = FIREHOSE_POST_RSP_TIMEOUT;
                        }
                    }
                    _ => (),
                }
            }
        }

        if parser.is_none() {
            timeout = FIREHOSE_DRAIN_TIMEOUT;
        }
    }

    // No result can only happen in drain mode
    result.unwrap_or(Ok(FirehoseStatus::Ack))
}

/// Write one command, expect a bare ack.
fn firehose_simple_command<T: QdlChan>(
    channel: &mut T,
    cmd: &str,
    attrs: &[(&str, &str)],
    nak: NakError,
) -> Result<(), FirehoseError> {
    let packet = firehose_xml_setup(cmd, attrs)?;
    firehose_write(channel, &packet)?;

    match firehose_read(channel, firehose_parser_ack_nak)? {
        FirehoseStatus::Ack => Ok(()),
        FirehoseStatus::Nak => Err(FirehoseError::Nak(nak)),
    }
}

fn firehose_send_configure<T: QdlChan>(
    channel: &mut T,
    payload_size: usize,
    skip_storage_init: bool,
) -> Result<FirehoseStatus, FirehoseError> {
    let storage = channel.fh_config().storage_type.to_string();
    let payload_size = payload_size.to_string();

    let packet = firehose_xml_setup(
        "configure",
        &[
            ("MemoryName", storage.as_str()),
            ("MaxPayloadSizeToTargetInBytes", payload_size.as_str()),
            ("verbose", "0"),
            ("ZLPAwareHost", "1"),
            ("SkipStorageInit", if skip_storage_init { "1" } else { "0" }),
        ],
    )?;
    firehose_write(channel, &packet)?;

    firehose_read(channel, firehose_parser_configure_response)
}

/// Negotiate the session payload size with the loader.
///
/// The response parser rewrites max_payload_size in the session config with
/// whatever the device answered; when that differs from our proposal the
/// command is re-issued with the device's value so both ends agree.
pub fn firehose_configure<T: QdlChan>(
    channel: &mut T,
    skip_storage_init: bool,
) -> Result<(), FirehoseError> {
    let proposed = channel.fh_config().max_payload_size;
    let status = firehose_send_configure(channel, proposed, skip_storage_init)?;

    let device_max = channel.fh_config().max_payload_size;
    if device_max != proposed {
        if firehose_send_configure(channel, device_max, skip_storage_init)?
            != FirehoseStatus::Ack
        {
            return Err(FirehoseError::Nak(NakError::Configure));
        }
    } else if status != FirehoseStatus::Ack {
        return Err(FirehoseError::Nak(NakError::Configure));
    }

    if channel.fh_config().debug {
        eprintln!(
            "[CONFIGURE] max payload size: {}",
            channel.fh_config().max_payload_size
        );
    }

    Ok(())
}

fn read_fill(src: &mut dyn Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = src.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Program `num_sectors` sectors read from `src` into a partition.
///
/// Announces the write with a <program> command, then streams the payload
/// in chunks sized to the negotiated max payload. A short tail read is
/// zero-filled so every transfer stays sector-aligned on the wire.
#[allow(clippy::too_many_arguments)]
pub fn firehose_program_storage<T: QdlChan>(
    channel: &mut T,
    src: &mut dyn Read,
    label: &str,
    num_sectors: usize,
    sector_size: usize,
    partition: u32,
    start_sector: &str,
    filename: Option<&str>,
) -> Result<(), FirehoseError> {
    let max_payload = channel.fh_config().max_payload_size;
    if sector_size == 0 || sector_size > max_payload {
        return Err(FirehoseError::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("can't fit {sector_size} byte sectors into {max_payload} byte payloads"),
        )));
    }

    let sector_size_str = sector_size.to_string();
    let num_sectors_str = num_sectors.to_string();
    let partition_str = partition.to_string();

    let mut attrs = vec![
        ("SECTOR_SIZE_IN_BYTES", sector_size_str.as_str()),
        ("num_partition_sectors", num_sectors_str.as_str()),
        ("physical_partition_number", partition_str.as_str()),
        ("start_sector", start_sector),
    ];
    if let Some(filename) = filename {
        attrs.push(("filename", filename));
    }

    let packet = firehose_xml_setup("program", &attrs)?;
    firehose_write(channel, &packet)?;

    if firehose_read(channel, firehose_parser_ack_nak)? != FirehoseStatus::Ack {
        eprintln!("[PROGRAM] failed to setup programming");
        return Err(FirehoseError::Nak(NakError::Program));
    }

    let mut buf = vec![0u8; max_payload];
    let t0 = Instant::now();

    let mut left = num_sectors;
    while left > 0 {
        let chunk_sectors = cmp::min(max_payload / sector_size, left);
        let chunk_len = chunk_sectors * sector_size;

        let n = read_fill(src, &mut buf[..chunk_len])?;
        buf[n..chunk_len].fill(0);

        let written = channel.rw().write_eot(&buf[..chunk_len], true)?;
        if written != chunk_len {
            return Err(FirehoseError::ShortWrite {
                written,
                expected: chunk_len,
            });
        }

        left -= chunk_sectors;
    }

    if firehose_read(channel, firehose_parser_ack_nak)? != FirehoseStatus::Ack {
        eprintln!("[PROGRAM] failed");
        return Err(FirehoseError::Nak(NakError::Program));
    }

    let elapsed = t0.elapsed().as_secs() as usize;
    if elapsed > 0 {
        eprintln!(
            "[PROGRAM] flashed \"{label}\" successfully at {}kB/s",
            sector_size * num_sectors / elapsed / 1024
        );
    } else {
        eprintln!("[PROGRAM] flashed \"{label}\" successfully");
    }

    Ok(())
}

/// Ask the target to rewrite storage metadata in place. No payload follows;
/// the scalar value travels inside the command itself.
pub fn firehose_patch<T: QdlChan>(
    channel: &mut T,
    patch: &manifest::Patch,
) -> Result<(), FirehoseError> {
    println!("{}", patch.what);

    let sector_size = patch.sector_size.to_string();
    let byte_offset = patch.byte_offset.to_string();
    let partition = patch.partition.to_string();
    let size_in_bytes = patch.size_in_bytes.to_string();

    firehose_simple_command(
        channel,
        "patch",
        &[
            ("SECTOR_SIZE_IN_BYTES", sector_size.as_str()),
            ("byte_offset", byte_offset.as_str()),
            ("filename", patch.filename.as_str()),
            ("physical_partition_number", partition.as_str()),
            ("size_in_bytes", size_in_bytes.as_str()),
            ("start_sector", patch.start_sector.as_str()),
            ("value", patch.value.as_str()),
        ],
        NakError::Patch,
    )
}

/// OTP safety policy: a non-zero bConfigDescrLock only ever reaches the
/// device when the crate is built with the `otp-lock` feature, no matter
/// what the provisioning XML said.
fn wire_lock_value(common: &UfsCommon) -> u8 {
    if cfg!(feature = "otp-lock") {
        common.config_descr_lock as u8
    } else {
        0
    }
}

pub fn firehose_apply_ufs_common<T: QdlChan>(
    channel: &mut T,
    common: &UfsCommon,
) -> Result<(), FirehoseError> {
    let number_lu = common.number_lu.to_string();
    let boot_enable = (common.boot_enable as u8).to_string();
    let descr_access_en = (common.descr_access_en as u8).to_string();
    let init_power_mode = common.init_power_mode.to_string();
    let high_priority_lun = common.high_priority_lun.to_string();
    let secure_removal_type = common.secure_removal_type.to_string();
    let init_active_icc_level = common.init_active_icc_level.to_string();
    let periodic_rtc_update = common.periodic_rtc_update.to_string();
    let lock = wire_lock_value(common).to_string();

    firehose_simple_command(
        channel,
        "ufs",
        &[
            ("bNumberLU", number_lu.as_str()),
            ("bBootEnable", boot_enable.as_str()),
            ("bDescrAccessEn", descr_access_en.as_str()),
            ("bInitPowerMode", init_power_mode.as_str()),
            ("bHighPriorityLUN", high_priority_lun.as_str()),
            ("bSecureRemovalType", secure_removal_type.as_str()),
            ("bInitActiveICCLevel", init_active_icc_level.as_str()),
            ("wPeriodicRTCUpdate", periodic_rtc_update.as_str()),
            ("bConfigDescrLock", lock.as_str()),
        ],
        NakError::Ufs,
    )
}

pub fn firehose_apply_ufs_body<T: QdlChan>(
    channel: &mut T,
    body: &UfsBody,
) -> Result<(), FirehoseError> {
    let lu_num = body.lu_num.to_string();
    let lu_enable = (body.lu_enable as u8).to_string();
    let boot_lun_id = body.boot_lun_id.to_string();
    let size_in_kb = body.size_in_kb.to_string();
    let data_reliability = body.data_reliability.to_string();
    let lu_write_protect = body.lu_write_protect.to_string();
    let memory_type = body.memory_type.to_string();
    let logical_block_size = body.logical_block_size.to_string();
    let provisioning_type = body.provisioning_type.to_string();
    let context_capabilities = body.context_capabilities.to_string();

    let mut attrs = vec![
        ("LUNum", lu_num.as_str()),
        ("bLUEnable", lu_enable.as_str()),
        ("bBootLunID", boot_lun_id.as_str()),
        ("size_in_kb", size_in_kb.as_str()),
        ("bDataReliability", data_reliability.as_str()),
        ("bLUWriteProtect", lu_write_protect.as_str()),
        ("bMemoryType", memory_type.as_str()),
        ("bLogicalBlockSize", logical_block_size.as_str()),
        ("bProvisioningType", provisioning_type.as_str()),
        ("wContextCapabilities", context_capabilities.as_str()),
    ];
    if let Some(desc) = &body.desc {
        attrs.push(("desc", desc.as_str()));
    }

    firehose_simple_command(channel, "ufs", &attrs, NakError::Ufs)
}

pub fn firehose_apply_ufs_epilogue<T: QdlChan>(
    channel: &mut T,
    epilogue: &UfsEpilogue,
    commit: bool,
) -> Result<(), FirehoseError> {
    let lun_to_grow = epilogue.lun_to_grow.to_string();

    firehose_simple_command(
        channel,
        "ufs",
        &[
            ("LUNtoGrow", lun_to_grow.as_str()),
            ("commit", if commit { "1" } else { "0" }),
        ],
        NakError::Ufs,
    )
}

/// Mark physical partition `part` as the one the boot ROM loads from.
pub fn firehose_set_bootable<T: QdlChan>(channel: &mut T, part: u32) -> Result<(), FirehoseError> {
    let part_str = part.to_string();

    firehose_simple_command(
        channel,
        "setbootablestoragedrive",
        &[("value", part_str.as_str())],
        NakError::SetBootable,
    )?;

    println!("partition {part} is now bootable");
    Ok(())
}

pub fn firehose_reset<T: QdlChan>(channel: &mut T) -> Result<(), FirehoseError> {
    firehose_simple_command(channel, "power", &[("value", "reset")], NakError::Power)
}
