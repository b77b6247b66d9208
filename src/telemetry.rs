//! Telemetry and client attribute upload.
//!
//! Both are flat JSON objects published without correlation:
//!
//! | Data              | Topic                        |
//! |-------------------|------------------------------|
//! | Telemetry         | `v1/devices/me/telemetry`    |
//! | Client attributes | `v1/devices/me/attributes`   |
//!
//! Every payload is checked against the configured [`PayloadPolicy`] before
//! it reaches the transport, so an oversized document is reported as
//! [`Error::PayloadTooLarge`] or [`Error::TooManyFields`] instead of being
//! truncated.

use alloc::string::String;

use serde::Serialize;
use serde_json::{Map, Value, json};

use crate::config::PayloadPolicy;
use crate::error::Error;
use crate::network::Transport;

/// Stack buffer for fixed-shape status payloads.
const COMPACT_PAYLOAD: usize = 512;

/// Publishes `fields` as one JSON object.
pub fn publish_fields<T: Transport + ?Sized>(
    transport: &mut T,
    topic: &str,
    fields: &[(&str, Value)],
    policy: &PayloadPolicy,
) -> Result<(), Error> {
    policy.check_fields(fields.len())?;
    let document: Map<String, Value> = fields
        .iter()
        .map(|(key, value)| (String::from(*key), value.clone()))
        .collect();
    publish_json(transport, topic, &Value::Object(document), policy)
}

/// Publishes an arbitrary JSON document.
pub fn publish_json<T: Transport + ?Sized>(
    transport: &mut T,
    topic: &str,
    document: &Value,
    policy: &PayloadPolicy,
) -> Result<(), Error> {
    if let Value::Object(members) = document {
        policy.check_fields(members.len())?;
    }
    let payload = serde_json::to_vec(document).map_err(|_| Error::Serialization)?;
    policy.check_size(payload.len())?;
    transport.publish(topic, &payload).map_err(|err| {
        log::warn!("publish {} failed: {}", topic, err);
        Error::PublishFailure
    })
}

/// Publishes telemetry stamped with a Unix time in milliseconds.
pub fn publish_timestamped<T: Transport + ?Sized>(
    transport: &mut T,
    topic: &str,
    timestamp_ms: u64,
    fields: &[(&str, Value)],
    policy: &PayloadPolicy,
) -> Result<(), Error> {
    policy.check_fields(fields.len())?;
    let values: Map<String, Value> = fields
        .iter()
        .map(|(key, value)| (String::from(*key), value.clone()))
        .collect();
    let document = json!({ "ts": timestamp_ms, "values": values });
    let payload = serde_json::to_vec(&document).map_err(|_| Error::Serialization)?;
    policy.check_size(payload.len())?;
    transport
        .publish(topic, &payload)
        .map_err(|_| Error::PublishFailure)
}

/// Publishes a small fixed-shape status document without touching the heap.
pub(crate) fn publish_compact<T: Transport + ?Sized, S: Serialize>(
    transport: &mut T,
    topic: &str,
    status: &S,
) -> Result<(), Error> {
    let mut buf = [0u8; COMPACT_PAYLOAD];
    let len = serde_json_core::to_slice(status, &mut buf).map_err(|_| Error::Serialization)?;
    transport
        .publish(topic, &buf[..len])
        .map_err(|_| Error::PublishFailure)
}
