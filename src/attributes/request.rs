use alloc::string::String;
use core::time::Duration;

use serde_json::{Map, Value};

use crate::config::{Capacity, PayloadPolicy};
use crate::error::Error;
use crate::network::Transport;
use crate::request::{Correlator, ExchangeTopics, RequestId, RequestIdGenerator, ResponseCallbacks};
use crate::time::Instant;
use crate::topic;

/// Request member naming client attribute keys.
pub const CLIENT_REQUEST_KEY: &str = "clientKeys";
/// Response member holding client attributes.
pub const CLIENT_RESPONSE_KEY: &str = "client";
/// Request member naming shared attribute keys.
pub const SHARED_REQUEST_KEY: &str = "sharedKeys";
/// Response member holding shared attributes.
pub const SHARED_RESPONSE_KEY: &str = "shared";

const TOPICS: ExchangeTopics = ExchangeTopics {
    request: topic::ATTRIBUTE_REQUEST,
    response: topic::ATTRIBUTE_RESPONSE,
    response_filter: topic::ATTRIBUTE_RESPONSE_FILTER,
};

/// One-shot attribute fetches.
///
/// A request publishes `{"<request key>": "k1,k2"}` and resolves with the
/// member `<response key>` of the answer, or with the whole answer if the
/// platform omitted that member.
#[derive(Debug)]
pub struct AttributeRequestService {
    correlator: Correlator,
    policy: PayloadPolicy,
}

impl AttributeRequestService {
    /// Creates the service.
    pub fn new(capacity: Capacity, ids: RequestIdGenerator, policy: PayloadPolicy) -> Self {
        Self {
            correlator: Correlator::new(TOPICS, capacity, ids),
            policy,
        }
    }

    /// Requests `keys` under arbitrary request/response member names.
    ///
    /// Rejects an empty key list, an empty key, or an empty member name
    /// with [`Error::InvalidArgument`] before anything is published.
    #[allow(clippy::too_many_arguments)]
    pub fn request<T: Transport + ?Sized>(
        &mut self,
        transport: &mut T,
        keys: &[&str],
        callbacks: ResponseCallbacks,
        timeout: Duration,
        now: Instant,
        request_key: &str,
        response_key: &str,
    ) -> Result<RequestId, Error> {
        if keys.is_empty() {
            log::error!("attribute request without keys");
            return Err(Error::InvalidArgument("no attribute keys"));
        }
        if keys.iter().any(|key| key.is_empty()) {
            log::error!("attribute request with empty key");
            return Err(Error::InvalidArgument("empty attribute key"));
        }
        if request_key.is_empty() || response_key.is_empty() {
            log::error!("attribute request without member names");
            return Err(Error::InvalidArgument("empty request or response key"));
        }

        let mut body = Map::new();
        body.insert(String::from(request_key), Value::String(keys.join(",")));
        let payload = serde_json::to_vec(&body).map_err(|_| Error::Serialization)?;
        self.policy.check_size(payload.len())?;

        self.correlator
            .send(transport, &payload, callbacks, Some(response_key), timeout, now)
    }

    /// Requests client-scope attributes.
    pub fn request_client_attributes<T: Transport + ?Sized>(
        &mut self,
        transport: &mut T,
        keys: &[&str],
        callbacks: ResponseCallbacks,
        timeout: Duration,
        now: Instant,
    ) -> Result<RequestId, Error> {
        self.request(
            transport,
            keys,
            callbacks,
            timeout,
            now,
            CLIENT_REQUEST_KEY,
            CLIENT_RESPONSE_KEY,
        )
    }

    /// Requests shared-scope attributes.
    pub fn request_shared_attributes<T: Transport + ?Sized>(
        &mut self,
        transport: &mut T,
        keys: &[&str],
        callbacks: ResponseCallbacks,
        timeout: Duration,
        now: Instant,
    ) -> Result<RequestId, Error> {
        self.request(
            transport,
            keys,
            callbacks,
            timeout,
            now,
            SHARED_REQUEST_KEY,
            SHARED_RESPONSE_KEY,
        )
    }

    /// Number of unanswered requests.
    pub fn pending(&self) -> usize {
        self.correlator.registry().len()
    }

    /// Returns `true` if `topic` is an attribute response.
    pub fn handles(&self, topic: &str) -> bool {
        self.correlator.matches(topic)
    }

    /// Routes an attribute response.
    pub fn on_response<T: Transport + ?Sized>(
        &mut self,
        transport: &mut T,
        topic: &str,
        payload: &Value,
    ) -> bool {
        self.correlator.on_response(transport, topic, payload)
    }

    /// Abandons request `id`; neither of its callbacks runs.
    pub fn cancel<T: Transport + ?Sized>(&mut self, transport: &mut T, id: RequestId) -> bool {
        self.correlator.cancel(transport, id)
    }

    /// Expires overdue requests.
    pub fn tick<T: Transport + ?Sized>(&mut self, transport: &mut T, now: Instant) -> usize {
        self.correlator.tick(transport, now)
    }

    /// Restores the response subscription after a reconnect.
    pub fn resubscribe<T: Transport + ?Sized>(&mut self, transport: &mut T) -> Result<(), Error> {
        self.correlator.resubscribe(transport)
    }
}
