// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.
use std::io;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use rusb::{Device, DeviceHandle, Direction, GlobalContext, TransferType};

use crate::types::QdlReadWrite;

const USB_VID_QCOM: u16 = 0x05c6;
const USB_PID_EDL: u16 = 0x9008;

// bInterfaceProtocol of 0xff and 0x10 have both been seen in the wild
const INTF_DESC_PROTO_CODES: [u8; 2] = [0xff, 0x10];

const WRITE_TIMEOUT: Duration = Duration::from_secs(1);
const ENUM_POLL_INTERVAL: Duration = Duration::from_millis(500);

pub struct QdlUsbConfig {
    dev_handle: DeviceHandle<GlobalContext>,
    in_ep: u8,
    out_ep: u8,
    out_maxpktsize: usize,
}

impl QdlReadWrite for QdlUsbConfig {
    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        self.dev_handle
            .read_bulk(self.in_ep, buf, timeout)
            .map_err(rusb_err_xlate)
    }

    fn write_eot(&mut self, buf: &[u8], eot: bool) -> io::Result<usize> {
        let (handle, ep) = (&self.dev_handle, self.out_ep);
        write_chunked(self.out_maxpktsize, buf, eot, |chunk| {
            handle
                .write_bulk(ep, chunk, WRITE_TIMEOUT)
                .map_err(rusb_err_xlate)
        })
    }
}

/// Split `buf` into bulk transfers of at most `maxpkt` bytes, terminated by
/// a ZLP when `eot` is set and the total length lands on a packet boundary.
fn write_chunked(
    maxpkt: usize,
    buf: &[u8],
    eot: bool,
    mut bulk_out: impl FnMut(&[u8]) -> io::Result<usize>,
) -> io::Result<usize> {
    if buf.is_empty() {
        if eot {
            bulk_out(&[])?;
        }
        return Ok(0);
    }

    let mut sent = 0;
    for chunk in buf.chunks(maxpkt) {
        let n = bulk_out(chunk)?;
        if n != chunk.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("bulk transfer wrote {n} of {} bytes", chunk.len()),
            ));
        }
        sent += n;
    }

    if eot && buf.len() % maxpkt == 0 {
        bulk_out(&[])?;
    }

    Ok(sent)
}

fn match_edl_interface(dev: &Device<GlobalContext>) -> Option<(u8, (u8, u8), usize)> {
    let cfg_desc = dev.active_config_descriptor().ok()?;

    for intf in cfg_desc.interfaces() {
        for desc in intf.descriptors() {
            if desc.class_code() != 0xff
                || desc.sub_class_code() != 0xff
                || !INTF_DESC_PROTO_CODES.contains(&desc.protocol_code())
            {
                continue;
            }

            let in_ep = desc.endpoint_descriptors().find(|e| {
                e.direction() == Direction::In && e.transfer_type() == TransferType::Bulk
            })?;
            let out_ep = desc.endpoint_descriptors().find(|e| {
                e.direction() == Direction::Out && e.transfer_type() == TransferType::Bulk
            })?;

            return Some((
                desc.interface_number(),
                (in_ep.address(), out_ep.address()),
                out_ep.max_packet_size() as usize,
            ));
        }
    }

    None
}

fn find_edl_device() -> Result<Option<Device<GlobalContext>>> {
    let devices = rusb::devices()?;

    Ok(devices.iter().find(|d| {
        d.device_descriptor()
            .map(|desc| desc.vendor_id() == USB_VID_QCOM && desc.product_id() == USB_PID_EDL)
            .unwrap_or(false)
    }))
}

/// Find a device in EDL mode and claim its flashing interface. Blocks until
/// one shows up on the bus.
pub fn setup_usb_device() -> Result<QdlUsbConfig> {
    let mut announced = false;
    let dev = loop {
        if let Some(d) = find_edl_device()? {
            break d;
        }
        if !announced {
            eprintln!("Waiting for EDL device");
            announced = true;
        }
        thread::sleep(ENUM_POLL_INTERVAL);
    };

    let (intf_no, (in_ep, out_ep), out_maxpktsize) = match_edl_interface(&dev)
        .context("EDL device exposes no vendor interface with bulk endpoints")?;

    let dev_handle = dev.open().context("couldn't open the EDL device")?;

    // Make sure we can actually poke at the device
    dev_handle.set_auto_detach_kernel_driver(true).ok();
    dev_handle
        .claim_interface(intf_no)
        .with_context(|| format!("couldn't claim interface {intf_no}"))?;

    Ok(QdlUsbConfig {
        dev_handle,
        in_ep,
        out_ep,
        out_maxpktsize,
    })
}

fn rusb_err_xlate(e: rusb::Error) -> io::Error {
    io::Error::from(match e {
        rusb::Error::Timeout => io::ErrorKind::TimedOut,
        rusb::Error::Access => io::ErrorKind::PermissionDenied,
        rusb::Error::NoDevice => io::ErrorKind::NotConnected,
        _ => io::ErrorKind::Other,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(log: &mut Vec<usize>) -> impl FnMut(&[u8]) -> io::Result<usize> + '_ {
        |chunk| {
            log.push(chunk.len());
            Ok(chunk.len())
        }
    }

    #[test]
    fn aligned_write_gets_a_zlp() {
        let mut transfers = vec![];
        let n = write_chunked(512, &[0xaa; 1536], true, record(&mut transfers)).unwrap();
        assert_eq!(n, 1536);
        assert_eq!(transfers, [512, 512, 512, 0]);
    }

    #[test]
    fn unaligned_write_needs_no_zlp() {
        let mut transfers = vec![];
        let n = write_chunked(512, &[0xaa; 1000], true, record(&mut transfers)).unwrap();
        assert_eq!(n, 1000);
        assert_eq!(transfers, [512, 488]);
    }

    #[test]
    fn zlp_suppressed_without_eot() {
        let mut transfers = vec![];
        write_chunked(512, &[0xaa; 1024], false, record(&mut transfers)).unwrap();
        assert_eq!(transfers, [512, 512]);
    }

    #[test]
    fn empty_eot_write_is_a_lone_zlp() {
        let mut transfers = vec![];
        let n = write_chunked(512, &[], true, record(&mut transfers)).unwrap();
        assert_eq!(n, 0);
        assert_eq!(transfers, [0]);

        transfers.clear();
        write_chunked(512, &[], false, record(&mut transfers)).unwrap();
        assert!(transfers.is_empty());
    }

    #[test]
    fn short_bulk_transfer_is_an_error() {
        let err = write_chunked(512, &[0xaa; 600], true, |chunk| Ok(chunk.len() / 2));
        assert_eq!(err.unwrap_err().kind(), io::ErrorKind::WriteZero);
    }
}
