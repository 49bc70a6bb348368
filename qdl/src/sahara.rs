// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.
use std::time::Duration;

use serde::Serialize;

use crate::print_hex_dump;
use crate::types::{QdlChan, SaharaError};

const SAHARA_HELLO: u32 = 1;
const SAHARA_HELLO_RSP: u32 = 2;
const SAHARA_READ: u32 = 3;
const SAHARA_END_OF_IMAGE: u32 = 4;
const SAHARA_DONE: u32 = 5;
const SAHARA_DONE_RSP: u32 = 6;
const SAHARA_READ64: u32 = 0x12;

const SAHARA_READ_TIMEOUT: Duration = Duration::from_millis(1000);
const SAHARA_READ_BUF_SIZE: usize = 4096;

/// One decoded target-to-host packet. The boot ROM drives the protocol;
/// the host only ever reacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaharaPkt {
    Hello {
        version: u32,
        compatible: u32,
        max_len: u32,
        mode: u32,
    },
    Read {
        image: u32,
        offset: u32,
        length: u32,
    },
    Read64 {
        image: u64,
        offset: u64,
        length: u64,
    },
    EndOfImage {
        image: u32,
        status: u32,
    },
    DoneRsp {
        status: u32,
    },
    Unknown {
        cmd: u32,
    },
}

fn le_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(buf[off..off + 4].try_into().unwrap())
}

fn le_u64(buf: &[u8], off: usize) -> u64 {
    u64::from_le_bytes(buf[off..off + 8].try_into().unwrap())
}

/// Decode one packet off the wire. The header length field has to match the
/// transfer size exactly; the ROM never coalesces packets.
pub fn sahara_decode(buf: &[u8]) -> Result<SaharaPkt, SaharaError> {
    if buf.len() < 8 {
        return Err(SaharaError::Runt(buf.len()));
    }

    let cmd = le_u32(buf, 0);
    let length = le_u32(buf, 4) as usize;
    if length != buf.len() {
        return Err(SaharaError::LengthMismatch {
            header: length,
            wire: buf.len(),
        });
    }

    let pkt = match (cmd, length) {
        (SAHARA_HELLO, 0x30) => SaharaPkt::Hello {
            version: le_u32(buf, 8),
            compatible: le_u32(buf, 12),
            max_len: le_u32(buf, 16),
            mode: le_u32(buf, 20),
        },
        (SAHARA_READ, 0x14) => SaharaPkt::Read {
            image: le_u32(buf, 8),
            offset: le_u32(buf, 12),
            length: le_u32(buf, 16),
        },
        (SAHARA_READ64, 0x20) => SaharaPkt::Read64 {
            image: le_u64(buf, 8),
            offset: le_u64(buf, 16),
            length: le_u64(buf, 24),
        },
        (SAHARA_END_OF_IMAGE, 0x10) => SaharaPkt::EndOfImage {
            image: le_u32(buf, 8),
            status: le_u32(buf, 12),
        },
        (SAHARA_DONE_RSP, 0xc) => SaharaPkt::DoneRsp {
            status: le_u32(buf, 8),
        },
        (
            SAHARA_HELLO | SAHARA_READ | SAHARA_READ64 | SAHARA_END_OF_IMAGE | SAHARA_DONE_RSP,
            _,
        ) => {
            return Err(SaharaError::UnexpectedLength { cmd, length });
        }
        _ => SaharaPkt::Unknown { cmd },
    };

    Ok(pkt)
}

#[derive(Serialize)]
struct SaharaHelloRsp {
    cmd: u32,
    length: u32,
    version: u32,
    compatible: u32,
    status: u32,
    mode: u32,
    reserved: [u32; 6],
}

#[derive(Serialize)]
struct SaharaDone {
    cmd: u32,
    length: u32,
}

fn sahara_send<T: QdlChan>(channel: &mut T, pkt: &impl Serialize) -> Result<(), SaharaError> {
    let bytes = bincode::serialize(pkt)?;
    let n = channel.rw().write_eot(&bytes, true)?;
    if n != bytes.len() {
        return Err(SaharaError::ShortWrite {
            written: n,
            expected: bytes.len(),
        });
    }
    Ok(())
}

fn sahara_send_image_chunk<T: QdlChan>(
    channel: &mut T,
    mbn: &[u8],
    offset: u64,
    length: u64,
) -> Result<(), SaharaError> {
    let end = offset.checked_add(length).filter(|&e| e <= mbn.len() as u64);
    let Some(end) = end else {
        return Err(SaharaError::ReadOutOfBounds {
            offset,
            length,
            image_len: mbn.len(),
        });
    };

    let chunk = &mbn[offset as usize..end as usize];
    let n = channel.rw().write_eot(chunk, true)?;
    if n != chunk.len() {
        return Err(SaharaError::ShortWrite {
            written: n,
            expected: chunk.len(),
        });
    }

    Ok(())
}

/// Feed the loader image to the boot ROM. Returns once the target reports
/// DONE; at that point the loader is executing and speaks firehose.
pub fn sahara_run<T: QdlChan>(channel: &mut T, mbn: &[u8]) -> Result<(), SaharaError> {
    let mut buf = [0u8; SAHARA_READ_BUF_SIZE];

    loop {
        let n = channel.rw().read_timeout(&mut buf, SAHARA_READ_TIMEOUT)?;
        if n == 0 {
            continue;
        }

        match sahara_decode(&buf[..n])? {
            SaharaPkt::Hello {
                version,
                compatible,
                max_len,
                mode,
            } => {
                println!(
                    "HELLO version: {version:#x} compatible: {compatible:#x} \
                     max_len: {max_len} mode: {mode}"
                );

                sahara_send(
                    channel,
                    &SaharaHelloRsp {
                        cmd: SAHARA_HELLO_RSP,
                        length: 0x30,
                        version: 2,
                        compatible: 1,
                        status: 0,
                        mode,
                        reserved: [0; 6],
                    },
                )?;
            }
            SaharaPkt::Read {
                image,
                offset,
                length,
            } => {
                println!("READ image: {image} offset: {offset:#x} length: {length:#x}");
                sahara_send_image_chunk(channel, mbn, offset as u64, length as u64)?;
            }
            SaharaPkt::Read64 {
                image,
                offset,
                length,
            } => {
                println!("READ64 image: {image} offset: {offset:#x} length: {length:#x}");
                sahara_send_image_chunk(channel, mbn, offset, length)?;
            }
            SaharaPkt::EndOfImage { image, status } => {
                println!("END OF IMAGE image: {image} status: {status}");

                if status != 0 {
                    // Target will re-request the image or give up on its own
                    eprintln!("received non-successful result");
                    continue;
                }

                sahara_send(
                    channel,
                    &SaharaDone {
                        cmd: SAHARA_DONE,
                        length: 0x8,
                    },
                )?;
            }
            SaharaPkt::DoneRsp { status } => {
                println!("DONE status: {status}");

                return match status {
                    0 => Ok(()),
                    _ => Err(SaharaError::TargetStatus(status)),
                };
            }
            SaharaPkt::Unknown { cmd } => {
                print_hex_dump(&format!("CMD{cmd:x}"), &buf[..n]);
            }
        }
    }
}
