//! Talk to a single Bluetooth Low Energy peripheral.
//!
//! Written for Flowtime EEG headbands but usable with any peripheral that
//! exposes the standard device information and battery characteristics.
//!
//! - Discover peripherals by advertised name and/or service
//! - Read and write characteristics without managing the connection: every
//!   operation connects on demand and reconnects after a drop
//! - Route notifications to callbacks or queues by characteristic UUID
//! - Track the battery state of charge through an optional calibration
//!
//! The Bluetooth stack sits behind the [`Transport`] trait. With the default
//! `bluest` feature, [`BluestTransport`] talks to the platform stack;
//! [`mock::MockTransport`] is an in-memory stand-in for tests.
//!
//! # Example
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use std::time::Duration;
//! # use enterble::{BluestTransport, DeviceScanner, ScanFilter};
//! #
//! # #[tokio::main]
//! # pub async fn main() -> anyhow::Result<()> {
//!     let transport = Arc::new(BluestTransport::new().await?);
//!     let scanner = DeviceScanner::new(transport).with_window(Duration::from_secs(10));
//!     let devices = scanner.discover(&ScanFilter::new().name("Flowtime")).await?;
//!     for device in devices {
//!         println!("{:?} {:?}", device.mac_address().await?, device.soc().await?);
//!         device.disconnect().await;
//!     }
//! #   Ok(())
//! # }
//! ```

#[cfg(feature = "bluest")]
mod bluest_transport;
pub mod characteristic;
pub mod codec;
mod collector;
mod error;
pub mod mock;
mod router;
mod scanner;
mod session;
mod soc;
mod transport;

#[cfg(feature = "bluest")]
pub use bluest_transport::{BluestLink, BluestTransport};
pub use collector::{FlowtimeCollector, FlowtimeEvent, START_STREAMING};
pub use error::{DecodeError, Error, Result, TransportError};
pub use router::{NotificationCallback, NotificationRouter};
pub use scanner::{DeviceScanner, ScanFilter, DEFAULT_SCAN_WINDOW};
pub use session::{
    ConnectionState, DeviceSession, Notification, SessionConfig, WriteFailurePolicy,
};
pub use soc::{Calibration, SocCalibrator, SocReading};
pub use transport::{DeviceDescriptor, FrameHandler, LinkLostHandler, Transport};
pub use uuid::Uuid;
