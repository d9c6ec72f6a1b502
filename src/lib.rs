//! A library for reading and configuring Marstek B2500 batteries over Bluetooth LE.
//!
//! The B2500 talks a small request/response protocol over one write and one
//! notify GATT characteristic. This crate provides:
//!
//! 1.  **Protocol and decoders**: the frame codec, the opcodes and the decoders
//!     for every structured response. See [`protocol`] and [`response`].
//!
//! 2.  **Asynchronous client**: [`tokio_async_client::B2500`] correlates each
//!     command with the notification answering it and keeps the latest decoded
//!     records. It works on any [`transport::Transport`]; the `ble` feature
//!     provides one based on `bluest`.
//!
//! 3.  **Monitoring**: [`monitor::run`] polls the device periodically and hands
//!     the records to a [`monitor::Persistence`] sink such as
//!     `store::FileStore`.
//!
//! ## Features
//!
//! - **Strongly-Typed API**: Validated setter parameters (e.g. `DepthOfDischarge`, `Region`) are rejected before anything is sent.
//! - **Firmware variance**: Cell voltages are decoded from the text and the binary response layout.
//! - **Serde**: All decoded records serialize to JSON (feature `serde`, enabled by default).
//!
//! ## Quick Start
//!
//! ```no_run
//! # #[cfg(feature = "ble")]
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! use b2500_lib::{ble::BleTransport, tokio_async_client::{B2500, Timeouts}};
//! use std::time::Duration;
//!
//! let transport = BleTransport::connect(None, Duration::from_secs(10)).await?;
//! let client = B2500::connect(transport, Timeouts::default()).await?;
//!
//! if let Some(runtime) = client.get_runtime_info().await? {
//!     println!("{runtime}");
//! }
//! client.set_depth_of_discharge(80).await?;
//! client.disconnect().await?;
//! # Ok(())
//! # }
//! ```

pub mod correlator;
pub mod dispatcher;
pub mod monitor;
pub mod protocol;
pub mod response;
pub mod store;
pub mod tokio_async_client;
pub mod tokio_common;
pub mod transport;

#[cfg_attr(docsrs, doc(cfg(feature = "serde")))]
#[cfg(feature = "serde")]
pub mod config;

#[cfg_attr(docsrs, doc(cfg(feature = "ble")))]
#[cfg(feature = "ble")]
pub mod ble;
