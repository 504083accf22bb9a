// SPDX-License-Identifier: BSD-3-Clause
//! # xdl
//!
//! Host-side engines for driving phones in their low-level download modes:
//! Qualcomm EDL (Sahara + Firehose), MediaTek BROM/DA (XFlash and XML
//! dialects), Spreadtrum BSL/FDL, and Android fastboot, plus the Android
//! Sparse codec that cuts multi-gigabyte images into protocol-legal pieces
//! without losing their block offsets.
//!
//! The crate exposes capabilities, not policy: callers decide which
//! partitions to touch and which loader binaries to trust, and hand the
//! engines `(bytes, metadata)`. A typical Qualcomm bring-up:
//!
//! ```no_run
//! use xdl::transport::{Backend, DeviceDescriptor, setup_transport};
//! use xdl::types::{FirehoseConfig, QcomDevice};
//! use xdl::{engine::{Engine, Session}, firehose, parsers, sahara};
//!
//! # fn main() -> xdl::error::Result<()> {
//! let loader = std::fs::read("prog_firehose_ddr.elf")?;
//! let descriptor = DeviceDescriptor {
//!     vendor_id: Some(0x05c6),
//!     product_id: Some(0x9008),
//!     ..DeviceDescriptor::default()
//! };
//! let rw = setup_transport(Backend::Usb, &descriptor)?;
//! let mut dev = QcomDevice::new(rw, FirehoseConfig::default());
//!
//! sahara::sahara_run(&mut dev, &loader, true)?;
//! firehose::firehose_drain_logs(&mut dev)?;
//! firehose::firehose_configure(&mut dev, false)?;
//! firehose::firehose_read(&mut dev, parsers::firehose_parser_configure_response)?;
//!
//! let mut session = Session::new(Engine::Qualcomm(dev))
//!     .with_watchdog("firehose", std::time::Duration::from_secs(60));
//! let mut image = std::fs::File::open("boot.img")?;
//! session.engine_mut()?.write_partition("boot_a", &mut image)?;
//! # Ok(())
//! # }
//! ```

pub mod blockdev;
pub mod brom;
pub mod bsl;
pub mod daxml;
pub mod engine;
pub mod error;
pub mod fastboot;
pub mod firehose;
pub mod hdlc;
pub mod parsers;
pub mod partitions;
pub mod sahara;
#[cfg(feature = "serial")]
pub mod serial;
pub mod sparse;
pub mod transport;
pub mod types;
#[cfg(feature = "usb")]
pub mod usb;
pub mod watchdog;
pub mod xflash;

#[cfg(test)]
pub(crate) mod testing;

pub use engine::{Engine, Session};
pub use error::{Error, Result};
pub use transport::{Backend, CancelToken, DeviceDescriptor, Transport, TransportKind};
pub use types::{DaMode, DeviceInfo, StorageKind};
