// SPDX-License-Identifier: BSD-3-Clause
//! Scripted in-memory transport for engine tests.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::time::Duration;

use crate::transport::{CancelToken, DeviceDescriptor, Transport, TransportKind};

#[derive(Debug, Clone)]
enum Step {
    Expect(Vec<u8>),
    Reply(Vec<u8>),
}

/// Plays one side of a protocol exchange from a script.
///
/// `expect` steps consume host writes (byte-exact, possibly split across
/// several `write` calls); `reply` steps queue device bytes for subsequent
/// reads. A read with nothing queued behaves like a bus timeout, and a
/// mismatched write panics with both byte strings so the test shows the
/// divergence.
pub struct ScriptedTransport {
    steps: VecDeque<Step>,
    pending_read: VecDeque<u8>,
    pending_write: Vec<u8>,
    descriptor: DeviceDescriptor,
    timeout: Duration,
    cancel: CancelToken,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self {
            steps: VecDeque::new(),
            pending_read: VecDeque::new(),
            pending_write: Vec::new(),
            descriptor: DeviceDescriptor {
                vendor_id: Some(0x1234),
                product_id: Some(0x5678),
                serial: Some("scripted".into()),
                path: None,
                kind: TransportKind::UsbBulk,
            },
            timeout: Duration::from_millis(50),
            cancel: CancelToken::new(),
        }
    }

    pub fn expect(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.steps.push_back(Step::Expect(bytes.into()));
        self
    }

    pub fn reply(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.steps.push_back(Step::Reply(bytes.into()));
        self
    }

    /// True when every scripted step has been consumed.
    pub fn script_done(&self) -> bool {
        self.steps.is_empty() && self.pending_write.is_empty()
    }

    // One reply models one bus transfer: a read never crosses into the
    // next reply, mirroring USB packet boundaries.
    fn promote_one_reply(&mut self) {
        if let Some(Step::Reply(_)) = self.steps.front() {
            let Some(Step::Reply(bytes)) = self.steps.pop_front() else {
                unreachable!();
            };
            self.pending_read.extend(bytes);
        }
    }
}

impl Default for ScriptedTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Read for ScriptedTransport {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.pending_read.is_empty() {
            self.promote_one_reply();
        }
        if self.pending_read.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "script has no bytes to read",
            ));
        }
        let n = std::cmp::min(buf.len(), self.pending_read.len());
        for slot in buf.iter_mut().take(n) {
            *slot = self.pending_read.pop_front().unwrap();
        }
        Ok(n)
    }
}

impl Write for ScriptedTransport {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.pending_write.extend_from_slice(buf);

        while let Some(Step::Expect(expected)) = self.steps.front() {
            if self.pending_write.len() < expected.len() {
                // Partial write so far; it must still be a prefix
                assert!(
                    expected.starts_with(&self.pending_write),
                    "host wrote {:02x?}, script expects {:02x?}",
                    self.pending_write,
                    expected
                );
                break;
            }
            assert_eq!(
                &self.pending_write[..expected.len()],
                &expected[..],
                "host write does not match script"
            );
            let len = expected.len();
            self.pending_write.drain(..len);
            self.steps.pop_front();
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Transport for ScriptedTransport {
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
        true
    }

    fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }
}
