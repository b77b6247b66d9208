//! Error type shared by the device-side services

use core::fmt;

/// Errors reported by the request, subscription and update services.
///
/// Every variant describes a condition that was handled locally: the operation
/// that returned it left no half-registered request, subscription or session
/// behind.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Error {
    /// A bounded request or subscription table is full.
    CapacityExceeded,
    /// An argument was rejected before any network action was taken.
    InvalidArgument(&'static str),
    /// A payload could not be encoded or decoded.
    Serialization,
    /// An encoded payload exceeds the configured maximum size.
    PayloadTooLarge {
        /// Encoded size in bytes.
        size: usize,
        /// Configured limit in bytes.
        limit: usize,
    },
    /// A payload carries more fields than the configured maximum.
    TooManyFields {
        /// Number of fields supplied.
        count: usize,
        /// Configured limit.
        limit: usize,
    },
    /// An inbound message did not have the expected shape.
    Protocol(&'static str),
    /// No response arrived before the deadline.
    Timeout,
    /// The downloaded image does not match the announced checksum.
    ChecksumMismatch,
    /// The transport refused a subscribe request.
    SubscriptionFailure,
    /// The transport refused a publish request.
    PublishFailure,
    /// An update session is already running.
    SessionActive,
    /// The firmware storage backend reported an error.
    Storage(crate::storage::error::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::CapacityExceeded => f.write_str("capacity exceeded"),
            Error::InvalidArgument(what) => write!(f, "invalid argument: {what}"),
            Error::Serialization => f.write_str("payload could not be serialized"),
            Error::PayloadTooLarge { size, limit } => {
                write!(f, "payload of {size} bytes exceeds limit of {limit}")
            }
            Error::TooManyFields { count, limit } => {
                write!(f, "{count} fields exceed limit of {limit}")
            }
            Error::Protocol(what) => write!(f, "protocol error: {what}"),
            Error::Timeout => f.write_str("timed out"),
            Error::ChecksumMismatch => f.write_str("checksum mismatch"),
            Error::SubscriptionFailure => f.write_str("subscribe failed"),
            Error::PublishFailure => f.write_str("publish failed"),
            Error::SessionActive => f.write_str("update session already active"),
            Error::Storage(err) => write!(f, "storage error: {err}"),
        }
    }
}

impl From<crate::storage::error::Error> for Error {
    fn from(err: crate::storage::error::Error) -> Self {
        Error::Storage(err)
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for Error {
    fn format(&self, f: defmt::Formatter) {
        match self {
            Error::CapacityExceeded => defmt::write!(f, "CapacityExceeded"),
            Error::InvalidArgument(what) => defmt::write!(f, "InvalidArgument({=str})", what),
            Error::Serialization => defmt::write!(f, "Serialization"),
            Error::PayloadTooLarge { size, limit } => {
                defmt::write!(f, "PayloadTooLarge({=usize}/{=usize})", size, limit)
            }
            Error::TooManyFields { count, limit } => {
                defmt::write!(f, "TooManyFields({=usize}/{=usize})", count, limit)
            }
            Error::Protocol(what) => defmt::write!(f, "Protocol({=str})", what),
            Error::Timeout => defmt::write!(f, "Timeout"),
            Error::ChecksumMismatch => defmt::write!(f, "ChecksumMismatch"),
            Error::SubscriptionFailure => defmt::write!(f, "SubscriptionFailure"),
            Error::PublishFailure => defmt::write!(f, "PublishFailure"),
            Error::SessionActive => defmt::write!(f, "SessionActive"),
            Error::Storage(err) => defmt::write!(f, "Storage({})", err),
        }
    }
}
