// SPDX-License-Identifier: BSD-3-Clause
use rusb::{Context, DeviceHandle, Direction, TransferType, UsbContext};
use std::io::{Read, Write};
use std::time::Duration;

use crate::error::{Result, TransportError};
use crate::transport::{CancelToken, DeviceDescriptor, Transport, TransportKind};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
const READ_BUF_LEN: usize = 1024 * 1024;

/// Bulk-endpoint USB transport.
///
/// The interface is chosen by scanning the active configuration for an alt
/// setting carrying a bulk-in and bulk-out pair (vendor-specific class 0xFF
/// preferred); the pipe addresses come from its endpoint descriptors.
pub struct UsbTransport {
    handle: DeviceHandle<Context>,
    descriptor: DeviceDescriptor,
    interface_number: u8,
    ep_in: u8,
    ep_out: u8,
    timeout: Duration,
    cancel: CancelToken,
    // Bulk reads land here first so short protocol reads never truncate a
    // longer device packet.
    buf: Vec<u8>,
    pos: usize,
    cap: usize,
}

fn io_err(e: rusb::Error) -> std::io::Error {
    match e {
        rusb::Error::Timeout => std::io::Error::new(std::io::ErrorKind::TimedOut, "usb timeout"),
        rusb::Error::NoDevice | rusb::Error::Pipe => {
            std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "usb pipe closed")
        }
        other => std::io::Error::other(other.to_string()),
    }
}

struct BulkInterface {
    number: u8,
    ep_in: u8,
    ep_out: u8,
    vendor_class: bool,
}

fn find_bulk_interface(cfg: &rusb::ConfigDescriptor) -> Option<BulkInterface> {
    let mut fallback = None;
    for intf in cfg.interfaces() {
        for alt in intf.descriptors() {
            let mut ep_in = None;
            let mut ep_out = None;
            for ep in alt.endpoint_descriptors() {
                if ep.transfer_type() != TransferType::Bulk {
                    continue;
                }
                match ep.direction() {
                    Direction::In => ep_in = Some(ep.address()),
                    Direction::Out => ep_out = Some(ep.address()),
                }
            }
            if let (Some(i), Some(o)) = (ep_in, ep_out) {
                let found = BulkInterface {
                    number: alt.interface_number(),
                    ep_in: i,
                    ep_out: o,
                    vendor_class: alt.class_code() == 0xFF,
                };
                if found.vendor_class {
                    return Some(found);
                }
                fallback.get_or_insert(found);
            }
        }
    }
    fallback
}

impl UsbTransport {
    pub fn open(wanted: &DeviceDescriptor) -> Result<Self> {
        let context = Context::new().map_err(TransportError::from)?;

        let mut matched = None;
        for device in context.devices().map_err(TransportError::from)?.iter() {
            let Ok(desc) = device.device_descriptor() else {
                continue;
            };
            if wanted.vendor_id.is_some_and(|vid| vid != desc.vendor_id()) {
                continue;
            }
            if wanted.product_id.is_some_and(|pid| pid != desc.product_id()) {
                continue;
            }
            let handle = match device.open() {
                Ok(h) => h,
                Err(rusb::Error::Access) => return Err(TransportError::AccessDenied.into()),
                Err(rusb::Error::Busy) => return Err(TransportError::Busy.into()),
                Err(_) => continue,
            };
            if let Some(wanted_sn) = &wanted.serial {
                let sn = handle
                    .read_serial_number_string_ascii(&desc)
                    .unwrap_or_default();
                if !sn.eq_ignore_ascii_case(wanted_sn) {
                    continue;
                }
            }
            matched = Some((device, handle, desc));
            break;
        }

        let Some((device, handle, dev_desc)) = matched else {
            return Err(TransportError::NotFound.into());
        };

        let cfg = device
            .active_config_descriptor()
            .map_err(TransportError::from)?;
        let Some(intf) = find_bulk_interface(&cfg) else {
            return Err(TransportError::NotFound.into());
        };
        if !intf.vendor_class {
            tracing::debug!("no vendor-specific interface, using first bulk pair");
        }

        let _ = handle.set_auto_detach_kernel_driver(true);
        match handle.claim_interface(intf.number) {
            Ok(()) => {}
            Err(rusb::Error::Busy) => return Err(TransportError::Busy.into()),
            Err(rusb::Error::Access) => return Err(TransportError::AccessDenied.into()),
            Err(e) => return Err(TransportError::from(e).into()),
        }

        let serial = handle
            .read_serial_number_string_ascii(&dev_desc)
            .ok()
            .or_else(|| wanted.serial.clone());

        tracing::debug!(
            vid = format_args!("{:04x}", dev_desc.vendor_id()),
            pid = format_args!("{:04x}", dev_desc.product_id()),
            interface = intf.number,
            ep_in = format_args!("{:#04x}", intf.ep_in),
            ep_out = format_args!("{:#04x}", intf.ep_out),
            "claimed USB download interface"
        );

        Ok(Self {
            handle,
            descriptor: DeviceDescriptor {
                vendor_id: Some(dev_desc.vendor_id()),
                product_id: Some(dev_desc.product_id()),
                serial,
                path: None,
                kind: TransportKind::UsbBulk,
            },
            interface_number: intf.number,
            ep_in: intf.ep_in,
            ep_out: intf.ep_out,
            timeout: DEFAULT_TIMEOUT,
            cancel: CancelToken::new(),
            buf: vec![0u8; READ_BUF_LEN],
            pos: 0,
            cap: 0,
        })
    }
}

impl Read for UsbTransport {
    fn read(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
        // Drain the internal buffer first
        if self.pos < self.cap {
            let n = std::cmp::min(out.len(), self.cap - self.pos);
            out[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
            self.pos += n;
            return Ok(n);
        }

        // Large reads can skip the bounce buffer entirely
        if out.len() >= self.buf.len() {
            return self
                .handle
                .read_bulk(self.ep_in, out, self.timeout)
                .map_err(io_err);
        }

        self.pos = 0;
        self.cap = self
            .handle
            .read_bulk(self.ep_in, &mut self.buf, self.timeout)
            .map_err(io_err)?;
        let n = std::cmp::min(out.len(), self.cap);
        out[..n].copy_from_slice(&self.buf[..n]);
        self.pos = n;
        Ok(n)
    }
}

impl Write for UsbTransport {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.handle
            .write_bulk(self.ep_out, buf, self.timeout)
            .map_err(io_err)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Transport for UsbTransport {
    fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn is_connected(&self) -> bool {
        self.handle.device().device_descriptor().is_ok()
    }

    fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }
}

impl Drop for UsbTransport {
    fn drop(&mut self) {
        let _ = self.handle.release_interface(self.interface_number);
    }
}
