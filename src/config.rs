//! Runtime configuration.
//!
//! All limits are plain public fields with defaults suitable for a small
//! microcontroller. Construct with [`Config::default`] and override what the
//! target needs:
//!
//! ```rust
//! use cloudlink::config::{Capacity, Config};
//!
//! let config = Config {
//!     attribute_requests: Capacity::Unbounded,
//!     ..Config::default()
//! };
//! assert_eq!(config.payload.max_fields, 8);
//! ```

use alloc::vec::Vec;
use core::time::Duration;

use crate::error::Error;

/// Default number of bytes requested per firmware chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 4096;
/// Default number of consecutive timeouts tolerated per chunk.
pub const DEFAULT_CHUNK_RETRIES: u8 = 5;
/// Default time to wait for a single firmware chunk.
pub const DEFAULT_CHUNK_TIMEOUT: Duration = Duration::from_secs(5);
/// Extra receive buffer reserved on top of the chunk size for topic and header.
pub const DEFAULT_BUFFER_OVERHEAD: usize = 50;
/// Default deadline for request/response exchanges.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Sizing policy for request and subscription tables.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Capacity {
    /// At most `n` entries; storage is reserved up front.
    Bounded(usize),
    /// Grows on demand.
    Unbounded,
}

impl Capacity {
    /// Returns `true` if a table currently holding `len` entries may take one more.
    pub fn admits(self, len: usize) -> bool {
        match self {
            Capacity::Bounded(max) => len < max,
            Capacity::Unbounded => true,
        }
    }

    pub(crate) fn allocate<T>(self) -> Vec<T> {
        match self {
            Capacity::Bounded(max) => Vec::with_capacity(max),
            Capacity::Unbounded => Vec::new(),
        }
    }
}

/// What happens when an update is started while another session is running.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
pub enum StartPolicy {
    /// The new request is refused with [`Error::SessionActive`].
    #[default]
    Reject,
    /// The running session is stopped and reported as failed first.
    Supersede,
}

/// Limits applied to every serialized telemetry or attribute payload.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct PayloadPolicy {
    /// Largest encoded payload in bytes.
    pub max_payload_size: usize,
    /// Largest number of top-level key/value pairs.
    pub max_fields: usize,
}

impl PayloadPolicy {
    /// Checks the number of top-level fields.
    pub fn check_fields(&self, count: usize) -> Result<(), Error> {
        if count > self.max_fields {
            return Err(Error::TooManyFields {
                count,
                limit: self.max_fields,
            });
        }
        Ok(())
    }

    /// Checks the encoded size.
    pub fn check_size(&self, size: usize) -> Result<(), Error> {
        if size > self.max_payload_size {
            return Err(Error::PayloadTooLarge {
                size,
                limit: self.max_payload_size,
            });
        }
        Ok(())
    }
}

impl Default for PayloadPolicy {
    fn default() -> Self {
        Self {
            max_payload_size: 1024,
            max_fields: 8,
        }
    }
}

/// Settings of the firmware update controller that apply to every session.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct OtaOptions {
    /// Bytes added to the chunk size when enlarging the receive buffer.
    pub buffer_overhead: usize,
    /// Deadline for the one-shot firmware metadata request.
    pub metadata_timeout: Duration,
    /// Behaviour on a start request while a session is active.
    pub start_policy: StartPolicy,
}

impl Default for OtaOptions {
    fn default() -> Self {
        Self {
            buffer_overhead: DEFAULT_BUFFER_OVERHEAD,
            metadata_timeout: DEFAULT_REQUEST_TIMEOUT,
            start_policy: StartPolicy::Reject,
        }
    }
}

/// Device-wide configuration.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Config {
    /// Pending attribute requests.
    pub attribute_requests: Capacity,
    /// Pending client-side RPC requests.
    pub rpc_requests: Capacity,
    /// Shared attribute subscriptions.
    pub shared_subscriptions: Capacity,
    /// Registered server-side RPC handlers.
    pub rpc_handlers: Capacity,
    /// Payload limits.
    pub payload: PayloadPolicy,
    /// Firmware update settings.
    pub ota: OtaOptions,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            attribute_requests: Capacity::Bounded(4),
            rpc_requests: Capacity::Bounded(4),
            shared_subscriptions: Capacity::Bounded(4),
            rpc_handlers: Capacity::Bounded(8),
            payload: PayloadPolicy::default(),
            ota: OtaOptions::default(),
        }
    }
}
