// SPDX-License-Identifier: BSD-3-Clause
use std::io::{Read, Write};
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::error::{Error, Result, TransportError};

/// Which kind of channel a [`Transport`] rides on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportKind {
    #[default]
    UsbBulk,
    Serial,
    BlockDevice,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::UsbBulk => write!(f, "usb"),
            TransportKind::Serial => write!(f, "serial"),
            TransportKind::BlockDevice => write!(f, "blockdev"),
        }
    }
}

/// How a caller names the device it wants to talk to.
///
/// USB devices match on vendor/product id (and serial number, when given),
/// serial and block devices on `path`.
#[derive(Debug, Clone, Default)]
pub struct DeviceDescriptor {
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
    pub serial: Option<String>,
    pub path: Option<String>,
    pub kind: TransportKind,
}

/// The transport backend selected on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backend {
    #[default]
    Usb,
    Serial,
    BlockDev,
}

impl FromStr for Backend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "usb" => Ok(Backend::Usb),
            "serial" | "com" => Ok(Backend::Serial),
            "blockdev" | "isp" => Ok(Backend::BlockDev),
            other => Err(Error::InvalidArgument(format!("unknown backend '{other}'"))),
        }
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Backend::Usb => write!(f, "usb"),
            Backend::Serial => write!(f, "serial"),
            Backend::BlockDev => write!(f, "blockdev"),
        }
    }
}

/// Shared cancellation flag for one session.
///
/// Cloning hands out another handle to the same flag. Transports check it
/// between bulk sub-transfers, so cancellation takes effect within one
/// per-pipe timeout at worst.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub(crate) fn bail_if_cancelled(&self) -> std::result::Result<(), TransportError> {
        if self.is_cancelled() {
            Err(TransportError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// An opaque duplex byte channel to a device in download mode.
///
/// `Read`/`Write` provide the stream face the framers build on; the inherent
/// methods add deadlines and cancellation. A `recv` that returns `Ok(0)`
/// means the deadline expired with no data, which is distinct from the
/// channel being torn down (`TransportError::Closed`).
pub trait Transport: Read + Write {
    fn descriptor(&self) -> &DeviceDescriptor;

    /// Deadline applied to each `recv`/`send` attempt.
    fn set_timeout(&mut self, timeout: Duration);
    fn timeout(&self) -> Duration;

    fn is_connected(&self) -> bool;

    fn cancel_token(&self) -> CancelToken;

    /// Write the whole buffer or fail. Partial writes are retried until the
    /// per-attempt deadline expires.
    fn send(&mut self, buf: &[u8]) -> std::result::Result<(), TransportError> {
        self.cancel_token().bail_if_cancelled()?;
        let started = Instant::now();
        let mut done = 0;
        while done < buf.len() {
            self.cancel_token().bail_if_cancelled()?;
            match self.write(&buf[done..]) {
                Ok(0) => return Err(TransportError::Closed),
                Ok(n) => done += n,
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                    return Err(TransportError::Timeout {
                        phase: "send".into(),
                        elapsed: started.elapsed(),
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(TransportError::Io(e)),
            }
        }
        Ok(())
    }

    /// Read up to `buf.len()` bytes. `Ok(0)` when the deadline passed.
    fn recv(&mut self, buf: &mut [u8]) -> std::result::Result<usize, TransportError> {
        self.cancel_token().bail_if_cancelled()?;
        match self.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(0),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                Err(TransportError::Closed)
            }
            Err(e) => Err(TransportError::Io(e)),
        }
    }

    /// Read exactly `buf.len()` bytes, failing with a phase-tagged timeout
    /// if the device stalls.
    fn recv_exact(
        &mut self,
        buf: &mut [u8],
        phase: &str,
    ) -> std::result::Result<(), TransportError> {
        let started = Instant::now();
        let mut done = 0;
        while done < buf.len() {
            match self.recv(&mut buf[done..])? {
                0 => {
                    return Err(TransportError::Timeout {
                        phase: phase.to_owned(),
                        elapsed: started.elapsed(),
                    });
                }
                n => done += n,
            }
        }
        Ok(())
    }

    /// Renegotiate the line rate. Meaningful for serial links only; USB and
    /// block-device transports accept and ignore it.
    fn set_baud(&mut self, _baud: u32) -> std::result::Result<(), TransportError> {
        Ok(())
    }
}

/// Open the transport named by `descriptor` over the chosen backend.
pub fn setup_transport(
    backend: Backend,
    descriptor: &DeviceDescriptor,
) -> Result<Box<dyn Transport>> {
    match backend {
        #[cfg(feature = "usb")]
        Backend::Usb => Ok(Box::new(crate::usb::UsbTransport::open(descriptor)?)),
        #[cfg(not(feature = "usb"))]
        Backend::Usb => Err(Error::InvalidArgument(
            "this build carries no USB backend".into(),
        )),
        #[cfg(feature = "serial")]
        Backend::Serial => Ok(Box::new(crate::serial::SerialTransport::open(descriptor)?)),
        #[cfg(not(feature = "serial"))]
        Backend::Serial => Err(Error::InvalidArgument(
            "this build carries no serial backend".into(),
        )),
        Backend::BlockDev => Ok(Box::new(crate::blockdev::BlockDevTransport::open(
            descriptor,
        )?)),
    }
}
