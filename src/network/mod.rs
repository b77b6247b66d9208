//! Network abstraction layer.
//!
//! Two layers of traits live here:
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │  Device services (requests, OTA, telemetry)  │
//! └──────────────────────┬───────────────────────┘
//!                        │ Transport
//!                        ▼
//! ┌──────────────────────────────────────────────┐
//! │     client::mqtt::Client (MQTT 3.1.1)        │
//! └──────────────────────┬───────────────────────┘
//!                        │ Connection = Read + Write + Close
//!                        ▼
//! ┌──────────────────────────────────────────────┐
//! │  TCP / TLS socket supplied by the platform   │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! The services only ever see [`Transport`], so any publish/subscribe client
//! can be plugged in. The bundled MQTT client needs nothing more than a byte
//! stream implementing [`Connection`].

#![deny(unsafe_code)]

/// Common error types for network operations
pub mod error;

/// Protocol client implementations
pub mod client;

use self::error::Error;

/// Re-exports of common traits
pub mod prelude {
    pub use super::{Close, Connection, Read, Transport, Write};
}

/// Byte-level read half of a connection.
pub trait Read {
    /// Associated error type
    type Error: core::fmt::Debug;
    /// Read data from the connection
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error>;
}

/// Byte-level write half of a connection.
pub trait Write {
    /// Associated error type
    type Error: core::fmt::Debug;
    /// Write data to the connection
    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error>;
    /// Flush the write buffer
    fn flush(&mut self) -> Result<(), Self::Error>;
}

/// Orderly shutdown of a connection.
pub trait Close {
    /// Associated error type
    type Error: core::fmt::Debug;
    /// Close the connection
    fn close(self) -> Result<(), Self::Error>;
}

/// A synchronous connection
pub trait Connection: Read + Write + Close {}

/// Publish/subscribe transport used by the device services.
///
/// Implementations deliver inbound messages by calling
/// [`Device::on_message`](crate::device::Device::on_message) from the host
/// loop; the trait only covers the outbound direction.
pub trait Transport {
    /// Publishes `payload` on `topic`.
    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), Error>;

    /// Subscribes to a topic filter. Subscribing twice to the same filter
    /// must be harmless.
    fn subscribe(&mut self, filter: &str) -> Result<(), Error>;

    /// Removes a subscription.
    fn unsubscribe(&mut self, filter: &str) -> Result<(), Error>;

    /// Current size of the receive buffer in bytes.
    fn buffer_size(&self) -> usize;

    /// Resizes the receive buffer. Fails if the memory is not available.
    fn set_buffer_size(&mut self, size: usize) -> Result<(), Error>;
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), Error> {
        (**self).publish(topic, payload)
    }

    fn subscribe(&mut self, filter: &str) -> Result<(), Error> {
        (**self).subscribe(filter)
    }

    fn unsubscribe(&mut self, filter: &str) -> Result<(), Error> {
        (**self).unsubscribe(filter)
    }

    fn buffer_size(&self) -> usize {
        (**self).buffer_size()
    }

    fn set_buffer_size(&mut self, size: usize) -> Result<(), Error> {
        (**self).set_buffer_size(size)
    }
}
