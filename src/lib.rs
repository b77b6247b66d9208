//! # cloudlink - device-side IoT platform SDK
//!
//! Connects a device to an MQTT based IoT platform: telemetry upload,
//! attribute and RPC requests correlated by id, persistent shared attribute
//! subscriptions, server-side RPC, and chunked over-the-air firmware updates
//! with checksum verification. The crate is `no_std` with `alloc`.
//!
//! ## Layers
//!
//! - [`network`]: the [`Transport`](network::Transport) seam plus a blocking
//!   MQTT 3.1.1 client that implements it
//! - [`storage`]: flash traits and a partition backed
//!   [`FlashWriter`](storage::FlashWriter)
//! - [`request`]: the pending request table shared by every request service
//! - [`attributes`], [`rpc`], [`telemetry`]: the device API
//! - [`ota`]: the firmware update state machine
//! - [`device`]: one [`Device`] owning a transport and all services
//!
//! ## Execution model
//!
//! Nothing blocks and nothing reads a clock. The host loop hands every
//! received message to [`Device::on_message`] and calls [`Device::tick`] with
//! the current [`Instant`]; deadlines are evaluated there. Callbacks are
//! `'static` closures and run inside those two calls.
//!
//! ```rust,no_run
//! use cloudlink::network::client::mqtt::{Client, Options};
//! use cloudlink::ota::UpdateRequest;
//! use cloudlink::{Config, Device, Instant};
//! # use cloudlink::network::{Close, Connection, Read, Write};
//! # use cloudlink::storage::FlashWriter;
//! # use cloudlink::storage::error::Error as StorageError;
//! # struct Socket;
//! # impl Connection for Socket {}
//! # impl Read for Socket {
//! #     type Error = ();
//! #     fn read(&mut self, _buf: &mut [u8]) -> Result<usize, Self::Error> { Ok(0) }
//! # }
//! # impl Write for Socket {
//! #     type Error = ();
//! #     fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> { Ok(buf.len()) }
//! #     fn flush(&mut self) -> Result<(), Self::Error> { Ok(()) }
//! # }
//! # impl Close for Socket {
//! #     type Error = ();
//! #     fn close(self) -> Result<(), Self::Error> { Ok(()) }
//! # }
//! # struct Flash;
//! # impl FlashWriter for Flash {
//! #     fn begin(&mut self, _: usize) -> Result<(), StorageError> { Ok(()) }
//! #     fn write(&mut self, _: &[u8]) -> Result<(), StorageError> { Ok(()) }
//! #     fn commit(&mut self) -> Result<(), StorageError> { Ok(()) }
//! #     fn abort(&mut self) -> Result<(), StorageError> { Ok(()) }
//! # }
//! # fn millis() -> u64 { 0 }
//!
//! let options = Options {
//!     client_id: "sensor-17",
//!     keep_alive_seconds: 60,
//!     clean_session: true,
//!     username: Some("ACCESS_TOKEN"),
//!     password: None,
//! };
//! let client = Client::connect(Socket, options).unwrap();
//! let mut device = Device::new(client, Config::default());
//!
//! let update = UpdateRequest::new("sensor-fw", "1.0.0", Flash);
//! device
//!     .start_firmware_update(update, Instant::from_millis(millis()))
//!     .unwrap();
//!
//! loop {
//!     let now = Instant::from_millis(millis());
//!     if let Ok(Some(message)) = device.transport_mut().poll() {
//!         let _ = device.on_message(&message.topic, &message.payload, now);
//!     }
//!     device.tick(now);
//! }
//! ```
//!
//! ## Optional Features
//!
//! - `std`: standard library support for `serde_json` and `hex`
//! - `defmt`: `defmt::Format` for every error and state type

#![cfg_attr(not(any(feature = "std", test)), no_std)]
#![deny(missing_docs)]
#![warn(missing_debug_implementations)]

extern crate alloc;

/// Transport seam and the MQTT client.
pub mod network;

/// Flash storage traits and the firmware image writer.
pub mod storage;

pub mod attributes;
pub mod config;
pub mod device;
pub mod error;
pub mod ota;
pub mod request;
pub mod rpc;
pub mod telemetry;
pub mod time;
pub mod topic;

pub use config::Config;
pub use device::Device;
pub use error::Error;
pub use time::Instant;
