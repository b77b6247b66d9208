//! Common error types for network operations

use core::fmt;

/// Error returned by connections and transports.
///
/// Kept `Copy` and allocation free so it can cross the [`Transport`]
/// boundary from any client implementation.
///
/// [`Transport`]: super::Transport
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Error {
    /// An operation was attempted on a connection that is not open.
    NotOpen,
    /// An error occurred during a write operation.
    WriteError,
    /// An error occurred during a read operation.
    ReadError,
    /// The broker refused the connection.
    ConnectionRefused,
    /// A timeout occurred.
    Timeout,
    /// The connection was closed.
    ConnectionClosed,
    /// The broker rejected a subscription.
    SubscriptionRejected,
    /// A packet does not fit into the configured buffer.
    PacketTooLarge,
    /// A buffer could not be resized.
    OutOfMemory,
    /// The peer sent something the protocol does not allow.
    ProtocolError,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Error::NotOpen => "connection not open",
            Error::WriteError => "write failed",
            Error::ReadError => "read failed",
            Error::ConnectionRefused => "connection refused",
            Error::Timeout => "timed out",
            Error::ConnectionClosed => "connection closed",
            Error::SubscriptionRejected => "subscription rejected",
            Error::PacketTooLarge => "packet too large for buffer",
            Error::OutOfMemory => "out of memory",
            Error::ProtocolError => "protocol error",
        };
        f.write_str(text)
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for Error {
    fn format(&self, f: defmt::Formatter) {
        match self {
            Error::NotOpen => defmt::write!(f, "NotOpen"),
            Error::WriteError => defmt::write!(f, "WriteError"),
            Error::ReadError => defmt::write!(f, "ReadError"),
            Error::ConnectionRefused => defmt::write!(f, "ConnectionRefused"),
            Error::Timeout => defmt::write!(f, "Timeout"),
            Error::ConnectionClosed => defmt::write!(f, "ConnectionClosed"),
            Error::SubscriptionRejected => defmt::write!(f, "SubscriptionRejected"),
            Error::PacketTooLarge => defmt::write!(f, "PacketTooLarge"),
            Error::OutOfMemory => defmt::write!(f, "OutOfMemory"),
            Error::ProtocolError => defmt::write!(f, "ProtocolError"),
        }
    }
}
