use core::time::Duration;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::config::Capacity;
use crate::config::PayloadPolicy;
use crate::error::Error;
use crate::network::Transport;
use crate::request::{Correlator, ExchangeTopics, RequestId, RequestIdGenerator, ResponseCallbacks};
use crate::time::Instant;
use crate::topic;

const TOPICS: ExchangeTopics = ExchangeTopics {
    request: topic::RPC_REQUEST,
    response: topic::RPC_RESPONSE,
    response_filter: topic::RPC_RESPONSE_FILTER,
};

#[derive(Serialize)]
struct RpcRequest<'a> {
    method: &'a str,
    params: &'a Value,
}

/// Device-initiated RPC.
///
/// Publishes `{"method": …, "params": …}` and hands the complete response
/// document to the callback. Missing parameters are sent as `{}`.
#[derive(Debug)]
pub struct RpcRequestService {
    correlator: Correlator,
    policy: PayloadPolicy,
}

impl RpcRequestService {
    /// Creates the service.
    pub fn new(capacity: Capacity, ids: RequestIdGenerator, policy: PayloadPolicy) -> Self {
        Self {
            correlator: Correlator::new(TOPICS, capacity, ids),
            policy,
        }
    }

    /// Calls `method` on the platform.
    pub fn request<T: Transport + ?Sized>(
        &mut self,
        transport: &mut T,
        method: &str,
        params: Option<&Value>,
        callbacks: ResponseCallbacks,
        timeout: Duration,
        now: Instant,
    ) -> Result<RequestId, Error> {
        if method.is_empty() {
            log::error!("rpc request without method name");
            return Err(Error::InvalidArgument("empty method name"));
        }

        let empty = Value::Object(Map::new());
        let params = params.unwrap_or(&empty);
        if let Value::Object(members) = params {
            self.policy.check_fields(members.len())?;
        }
        let payload =
            serde_json::to_vec(&RpcRequest { method, params }).map_err(|_| Error::Serialization)?;
        self.policy.check_size(payload.len())?;

        self.correlator
            .send(transport, &payload, callbacks, None, timeout, now)
    }

    /// Number of unanswered calls.
    pub fn pending(&self) -> usize {
        self.correlator.registry().len()
    }

    /// Returns `true` if `topic` is an RPC response.
    pub fn handles(&self, topic: &str) -> bool {
        self.correlator.matches(topic)
    }

    /// Routes an RPC response.
    pub fn on_response<T: Transport + ?Sized>(
        &mut self,
        transport: &mut T,
        topic: &str,
        payload: &Value,
    ) -> bool {
        self.correlator.on_response(transport, topic, payload)
    }

    /// Expires overdue calls.
    pub fn tick<T: Transport + ?Sized>(&mut self, transport: &mut T, now: Instant) -> usize {
        self.correlator.tick(transport, now)
    }

    /// Restores the response subscription after a reconnect.
    pub fn resubscribe<T: Transport + ?Sized>(&mut self, transport: &mut T) -> Result<(), Error> {
        self.correlator.resubscribe(transport)
    }
}
