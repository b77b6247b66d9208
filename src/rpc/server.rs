use alloc::borrow::Cow;
use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

use serde_json::Value;

use crate::config::{Capacity, PayloadPolicy};
use crate::error::Error;
use crate::network::Transport;
use crate::topic;

use super::{METHOD_KEY, PARAMS_KEY};

/// Handler of one server-side method. Returning `None` sends no reply.
pub type RpcHandler = Box<dyn FnMut(&Value) -> Option<Value>>;

struct Handler {
    method: String,
    callback: RpcHandler,
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handler")
            .field("method", &self.method)
            .finish_non_exhaustive()
    }
}

/// Server-initiated RPC.
#[derive(Debug)]
pub struct ServerRpcService {
    handlers: Vec<Handler>,
    capacity: Capacity,
    policy: PayloadPolicy,
    subscribed: bool,
}

impl ServerRpcService {
    /// Creates a service without handlers.
    pub fn new(capacity: Capacity, policy: PayloadPolicy) -> Self {
        Self {
            handlers: capacity.allocate(),
            capacity,
            policy,
            subscribed: false,
        }
    }

    /// Registers `handler` for `method` and subscribes the request topic.
    pub fn subscribe<T: Transport + ?Sized>(
        &mut self,
        transport: &mut T,
        method: &str,
        handler: impl FnMut(&Value) -> Option<Value> + 'static,
    ) -> Result<(), Error> {
        if method.is_empty() {
            return Err(Error::InvalidArgument("empty method name"));
        }
        if !self.capacity.admits(self.handlers.len()) {
            log::error!("rpc handlers full");
            return Err(Error::CapacityExceeded);
        }
        if !self.subscribed {
            transport
                .subscribe(topic::RPC_REQUEST_FILTER)
                .map_err(|_| Error::SubscriptionFailure)?;
            self.subscribed = true;
        }
        self.handlers.push(Handler {
            method: String::from(method),
            callback: Box::new(handler),
        });
        Ok(())
    }

    /// Drops every handler and releases the request topic.
    pub fn unsubscribe<T: Transport + ?Sized>(&mut self, transport: &mut T) {
        self.handlers.clear();
        if self.subscribed {
            self.subscribed = false;
            if let Err(err) = transport.unsubscribe(topic::RPC_REQUEST_FILTER) {
                log::warn!("unsubscribe {} failed: {}", topic::RPC_REQUEST_FILTER, err);
            }
        }
    }

    /// Subscribes the request topic again after a reconnect.
    pub fn resubscribe<T: Transport + ?Sized>(&mut self, transport: &mut T) -> Result<(), Error> {
        self.subscribed = false;
        if self.handlers.is_empty() {
            return Ok(());
        }
        transport
            .subscribe(topic::RPC_REQUEST_FILTER)
            .map_err(|_| Error::SubscriptionFailure)?;
        self.subscribed = true;
        Ok(())
    }

    /// Returns `true` if `topic` is a server-side RPC request.
    pub fn handles(&self, topic: &str) -> bool {
        topic.starts_with(topic::RPC_REQUEST)
    }

    /// Runs the handler for one request and publishes its reply.
    ///
    /// Returns `Ok(false)` if no handler is registered for the method.
    pub fn on_request<T: Transport + ?Sized>(
        &mut self,
        transport: &mut T,
        topic: &str,
        payload: &Value,
    ) -> Result<bool, Error> {
        let id = topic::parse_id(topic, topic::RPC_REQUEST)
            .ok_or(Error::Protocol("rpc request topic without id"))?;
        let method = payload
            .get(METHOD_KEY)
            .and_then(Value::as_str)
            .ok_or(Error::Protocol("rpc request without method"))?;

        let Some(handler) = self.handlers.iter_mut().find(|h| h.method == method) else {
            log::warn!("no handler for rpc method {}", method);
            return Ok(false);
        };
        log::debug!("calling rpc method {}", method);

        let params = decode_params(payload.get(PARAMS_KEY));
        let Some(reply) = (handler.callback)(&*params) else {
            return Ok(true);
        };

        let body = serde_json::to_vec(&reply).map_err(|_| Error::Serialization)?;
        self.policy.check_size(body.len())?;
        let response = topic::with_id(topic::RPC_RESPONSE, id)?;
        transport
            .publish(&response, &body)
            .map_err(|_| Error::PublishFailure)?;
        Ok(true)
    }
}

/// Parameters sometimes arrive as a JSON document encoded in a string.
fn decode_params(raw: Option<&Value>) -> Cow<'_, Value> {
    let Some(value) = raw else {
        log::debug!("rpc request without params");
        return Cow::Owned(Value::Null);
    };
    if let Value::String(text) = value {
        if let Ok(parsed) = serde_json::from_str::<Value>(text) {
            return Cow::Owned(parsed);
        }
    }
    Cow::Borrowed(value)
}
