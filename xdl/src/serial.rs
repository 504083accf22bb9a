// SPDX-License-Identifier: BSD-3-Clause
use serial2::SerialPort;
use std::io::{Read, Write};
use std::time::Duration;

use crate::error::{Error, Result, TransportError};
use crate::transport::{CancelToken, DeviceDescriptor, Transport, TransportKind};

const DEFAULT_BAUD: u32 = 115_200;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Raw-mode serial transport. The stream has no message boundary of its
/// own; framing is the caller's job.
pub struct SerialTransport {
    port: SerialPort,
    descriptor: DeviceDescriptor,
    timeout: Duration,
    cancel: CancelToken,
}

impl SerialTransport {
    pub fn open(wanted: &DeviceDescriptor) -> Result<Self> {
        let Some(path) = &wanted.path else {
            return Err(Error::InvalidArgument("serial port path unspecified".into()));
        };

        let mut port = SerialPort::open(path, |mut settings: serial2::Settings| {
            settings.set_raw();
            settings.set_baud_rate(DEFAULT_BAUD)?;
            Ok(settings)
        })
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => TransportError::NotFound,
            std::io::ErrorKind::PermissionDenied => TransportError::AccessDenied,
            _ => TransportError::Io(e),
        })?;

        port.set_read_timeout(DEFAULT_TIMEOUT)
            .map_err(TransportError::Io)?;
        port.set_write_timeout(DEFAULT_TIMEOUT)
            .map_err(TransportError::Io)?;

        Ok(Self {
            port,
            descriptor: DeviceDescriptor {
                vendor_id: None,
                product_id: None,
                serial: None,
                path: Some(path.clone()),
                kind: TransportKind::Serial,
            },
            timeout: DEFAULT_TIMEOUT,
            cancel: CancelToken::new(),
        })
    }
}

impl Read for SerialTransport {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.port.read(buf)
    }
}

impl Write for SerialTransport {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.port.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.port.flush()
    }
}

impl Transport for SerialTransport {
    fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
        let _ = self.port.set_read_timeout(timeout);
        let _ = self.port.set_write_timeout(timeout);
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn is_connected(&self) -> bool {
        self.port.get_configuration().is_ok()
    }

    fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Spreadtrum renegotiates to 921600 between FDL stages.
    fn set_baud(&mut self, baud: u32) -> std::result::Result<(), TransportError> {
        let mut settings = self.port.get_configuration().map_err(TransportError::Io)?;
        settings.set_baud_rate(baud).map_err(TransportError::Io)?;
        self.port
            .set_configuration(&settings)
            .map_err(TransportError::Io)?;
        tracing::debug!(baud, "serial line renegotiated");
        Ok(())
    }
}
