//! Topic layout of the device API.
//!
//! Request-style exchanges embed a numeric correlator as the last topic level:
//! the device publishes on `<request prefix><id>` and the platform answers on
//! `<response prefix><id>`, which the device receives through a single
//! wildcard subscription per exchange type.

use core::fmt::Write;

use heapless::String;

use crate::error::Error;

/// Telemetry upload.
pub const TELEMETRY: &str = "v1/devices/me/telemetry";
/// Client attribute upload and shared attribute updates.
pub const ATTRIBUTES: &str = "v1/devices/me/attributes";

/// Attribute request, followed by the request id.
pub const ATTRIBUTE_REQUEST: &str = "v1/devices/me/attributes/request/";
/// Attribute response, followed by the request id.
pub const ATTRIBUTE_RESPONSE: &str = "v1/devices/me/attributes/response/";
/// Wildcard filter for attribute responses.
pub const ATTRIBUTE_RESPONSE_FILTER: &str = "v1/devices/me/attributes/response/+";

/// Device or server initiated RPC request, followed by the request id.
pub const RPC_REQUEST: &str = "v1/devices/me/rpc/request/";
/// Wildcard filter for server initiated RPC requests.
pub const RPC_REQUEST_FILTER: &str = "v1/devices/me/rpc/request/+";
/// RPC response, followed by the request id.
pub const RPC_RESPONSE: &str = "v1/devices/me/rpc/response/";
/// Wildcard filter for RPC responses.
pub const RPC_RESPONSE_FILTER: &str = "v1/devices/me/rpc/response/+";

/// Firmware chunk request, followed by the chunk index.
pub const FIRMWARE_REQUEST: &str = "v2/fw/request/0/chunk/";
/// Firmware chunk response, followed by the chunk index.
pub const FIRMWARE_RESPONSE: &str = "v2/fw/response/0/chunk/";
/// Wildcard filter for firmware chunk responses.
pub const FIRMWARE_RESPONSE_FILTER: &str = "v2/fw/response/#";

/// Longest topic the device ever publishes.
pub const MAX_TOPIC_LEN: usize = 64;

/// A topic built on the stack.
pub type Topic = String<MAX_TOPIC_LEN>;

/// Appends `id` to `prefix`.
pub fn with_id(prefix: &str, id: u32) -> Result<Topic, Error> {
    let mut topic = Topic::new();
    write!(topic, "{prefix}{id}").map_err(|_| Error::InvalidArgument("topic too long"))?;
    Ok(topic)
}

/// Extracts the trailing id from `topic` if it starts with `prefix`.
///
/// Returns `None` for foreign topics and for trailing levels that are not a
/// decimal `u32`.
pub fn parse_id(topic: &str, prefix: &str) -> Option<u32> {
    topic.strip_prefix(prefix)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_request_topic() {
        let topic = with_id(ATTRIBUTE_REQUEST, 42).unwrap();
        assert_eq!(topic.as_str(), "v1/devices/me/attributes/request/42");
    }

    #[test]
    fn parses_trailing_id() {
        assert_eq!(parse_id("v1/devices/me/rpc/response/7", RPC_RESPONSE), Some(7));
        assert_eq!(parse_id("v2/fw/response/0/chunk/3", FIRMWARE_RESPONSE), Some(3));
    }

    #[test]
    fn rejects_foreign_or_malformed_topics() {
        assert_eq!(parse_id("v1/devices/me/attributes", ATTRIBUTE_RESPONSE), None);
        assert_eq!(parse_id("v1/devices/me/rpc/response/abc", RPC_RESPONSE), None);
        assert_eq!(parse_id("v1/devices/me/rpc/response/", RPC_RESPONSE), None);
    }
}
