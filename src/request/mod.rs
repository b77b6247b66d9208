//! Request/response correlation.
//!
//! Publish/subscribe has no notion of a reply. Request-style exchanges work
//! around that by embedding a numeric id in the request topic; the platform
//! echoes the id as the last level of the response topic:
//!
//! ```text
//!   device                                   platform
//!     │  publish  …/request/17   {payload}      │
//!     │ ───────────────────────────────────────►│
//!     │                                         │
//!     │  message  …/response/17  {result}       │
//!     │◄─────────────────────────────────────── │
//!     │                                         │
//!  RequestRegistry::resolve(17, result)
//!     └─► on_response(result), entry removed
//! ```
//!
//! [`RequestRegistry`] is the table of pending ids with their deadlines and
//! callbacks. [`Correlator`] adds the topic handling shared by every request
//! type: one wildcard response subscription that is held while requests are
//! pending and released when the table drains.

use alloc::boxed::Box;
use alloc::rc::Rc;
use alloc::string::String;
use alloc::vec::Vec;
use core::cell::Cell;
use core::fmt;
use core::time::Duration;

use serde_json::Value;

use crate::config::Capacity;
use crate::error::Error;
use crate::network::Transport;
use crate::time::Instant;
use crate::topic;


/// Correlator embedded in request and response topics.
pub type RequestId = u32;

/// Source of request ids shared by all request services of one device.
///
/// Cloning yields a handle to the same counter, so attribute and RPC requests
/// never hand out the same id while both are pending. The counter wraps on
/// overflow.
#[derive(Debug, Clone)]
pub struct RequestIdGenerator {
    next: Rc<Cell<RequestId>>,
}

impl RequestIdGenerator {
    /// Starts counting at 1.
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    /// Starts counting at `first`.
    pub fn starting_at(first: RequestId) -> Self {
        Self {
            next: Rc::new(Cell::new(first)),
        }
    }

    /// Returns the next id and advances the counter.
    pub fn next_id(&self) -> RequestId {
        let id = self.next.get();
        self.next.set(id.wrapping_add(1));
        id
    }
}

impl Default for RequestIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Callbacks of one request. Each fires at most once.
pub struct ResponseCallbacks {
    on_response: Box<dyn FnOnce(&Value)>,
    on_timeout: Option<Box<dyn FnOnce()>>,
}

impl ResponseCallbacks {
    /// Calls `on_response` with the response document.
    pub fn new(on_response: impl FnOnce(&Value) + 'static) -> Self {
        Self {
            on_response: Box::new(on_response),
            on_timeout: None,
        }
    }

    /// Calls `on_timeout` if the deadline passes first.
    pub fn with_timeout(mut self, on_timeout: impl FnOnce() + 'static) -> Self {
        self.on_timeout = Some(Box::new(on_timeout));
        self
    }
}

impl fmt::Debug for ResponseCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseCallbacks")
            .field("on_timeout", &self.on_timeout.is_some())
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
struct PendingRequest {
    id: RequestId,
    response_key: Option<String>,
    deadline: Instant,
    callbacks: ResponseCallbacks,
}

/// Outcome of [`RequestRegistry::resolve`].
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Resolution {
    /// The pending entry was found and its callback invoked.
    Resolved {
        /// The table is now empty.
        drained: bool,
    },
    /// No entry with that id; late or duplicate response.
    Unknown,
}

/// Outcome of [`RequestRegistry::tick`].
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
pub struct Expiry {
    /// Entries whose deadline passed during this tick.
    pub expired: usize,
    /// The table became empty because of this tick.
    pub drained: bool,
}

/// Table of in-flight requests.
#[derive(Debug)]
pub struct RequestRegistry {
    pending: Vec<PendingRequest>,
    capacity: Capacity,
    ids: RequestIdGenerator,
}

impl RequestRegistry {
    /// Creates an empty table drawing ids from `ids`.
    pub fn new(capacity: Capacity, ids: RequestIdGenerator) -> Self {
        Self {
            pending: capacity.allocate(),
            capacity,
            ids,
        }
    }

    /// Number of pending requests.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Returns `true` if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Returns `true` if another request can be registered.
    pub fn has_room(&self) -> bool {
        self.capacity.admits(self.pending.len())
    }

    /// Returns `true` if `id` is pending.
    pub fn contains(&self, id: RequestId) -> bool {
        self.pending.iter().any(|entry| entry.id == id)
    }

    /// Registers a request due at `now + timeout`.
    ///
    /// When `response_key` is given and the response document contains it,
    /// only that member is handed to the response callback.
    ///
    /// Fails with [`Error::CapacityExceeded`] and no side effects if the
    /// table is bounded and full.
    pub fn register(
        &mut self,
        callbacks: ResponseCallbacks,
        response_key: Option<&str>,
        timeout: Duration,
        now: Instant,
    ) -> Result<RequestId, Error> {
        if !self.has_room() {
            return Err(Error::CapacityExceeded);
        }

        // after a full wrap an id may still be pending
        let mut id = self.ids.next_id();
        while self.contains(id) {
            id = self.ids.next_id();
        }

        self.pending.push(PendingRequest {
            id,
            response_key: response_key.map(String::from),
            deadline: now + timeout,
            callbacks,
        });
        Ok(id)
    }

    /// Drops a pending request without invoking any callback.
    pub fn cancel(&mut self, id: RequestId) -> bool {
        match self.position(id) {
            Some(index) => {
                self.pending.remove(index);
                true
            }
            None => false,
        }
    }

    /// Delivers `payload` to the request `id`.
    pub fn resolve(&mut self, id: RequestId, payload: &Value) -> Resolution {
        let Some(index) = self.position(id) else {
            log::debug!("no pending request {}", id);
            return Resolution::Unknown;
        };
        let entry = self.pending.remove(index);
        let drained = self.pending.is_empty();

        let body = entry
            .response_key
            .as_deref()
            .and_then(|key| payload.get(key))
            .unwrap_or(payload);
        (entry.callbacks.on_response)(body);

        Resolution::Resolved { drained }
    }

    /// Expires every request whose deadline has been reached.
    pub fn tick(&mut self, now: Instant) -> Expiry {
        if self.pending.is_empty() {
            return Expiry::default();
        }

        let mut expired = Vec::new();
        let mut index = 0;
        while index < self.pending.len() {
            if now.has_reached(self.pending[index].deadline) {
                expired.push(self.pending.remove(index));
            } else {
                index += 1;
            }
        }

        let result = Expiry {
            expired: expired.len(),
            drained: !expired.is_empty() && self.pending.is_empty(),
        };
        for entry in expired {
            log::warn!("request {} timed out", entry.id);
            if let Some(on_timeout) = entry.callbacks.on_timeout {
                on_timeout();
            }
        }
        result
    }

    /// Drops every pending request without invoking callbacks.
    pub fn clear(&mut self) {
        self.pending.clear();
    }

    fn position(&self, id: RequestId) -> Option<usize> {
        self.pending.iter().position(|entry| entry.id == id)
    }
}

/// Topics of one request/response exchange type.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct ExchangeTopics {
    /// Request topic prefix; the id is appended.
    pub request: &'static str,
    /// Response topic prefix the id is parsed from.
    pub response: &'static str,
    /// Wildcard filter covering every response.
    pub response_filter: &'static str,
}

/// Publishes requests and routes responses for one exchange type.
///
/// Holds the response subscription only while requests are pending: the
/// filter is subscribed on the first request and released when the last
/// pending entry resolves or expires.
#[derive(Debug)]
pub struct Correlator {
    registry: RequestRegistry,
    topics: ExchangeTopics,
    subscribed: bool,
}

impl Correlator {
    /// Creates a correlator for `topics`.
    pub fn new(topics: ExchangeTopics, capacity: Capacity, ids: RequestIdGenerator) -> Self {
        Self {
            registry: RequestRegistry::new(capacity, ids),
            topics,
            subscribed: false,
        }
    }

    /// The pending request table.
    pub fn registry(&self) -> &RequestRegistry {
        &self.registry
    }

    /// Returns `true` if `topic` is a response of this exchange type.
    pub fn matches(&self, topic: &str) -> bool {
        topic.starts_with(self.topics.response)
    }

    /// Registers and publishes one request.
    ///
    /// On any failure nothing stays registered.
    pub fn send<T: Transport + ?Sized>(
        &mut self,
        transport: &mut T,
        payload: &[u8],
        callbacks: ResponseCallbacks,
        response_key: Option<&str>,
        timeout: Duration,
        now: Instant,
    ) -> Result<RequestId, Error> {
        if !self.registry.has_room() {
            log::error!("request table full ({} pending)", self.registry.len());
            return Err(Error::CapacityExceeded);
        }
        self.ensure_subscribed(transport)?;

        let id = self.registry.register(callbacks, response_key, timeout, now)?;
        let published = topic::with_id(self.topics.request, id)
            .and_then(|topic| {
                transport
                    .publish(&topic, payload)
                    .map_err(|_| Error::PublishFailure)
            });

        if let Err(err) = published {
            log::error!("request {} not sent: {}", id, err);
            self.registry.cancel(id);
            self.release_if_idle(transport);
            return Err(err);
        }
        log::debug!("request {} sent on {}{}", id, self.topics.request, id);
        Ok(id)
    }

    /// Routes a response message. Returns `false` for foreign or malformed topics.
    pub fn on_response<T: Transport + ?Sized>(
        &mut self,
        transport: &mut T,
        topic: &str,
        payload: &Value,
    ) -> bool {
        let Some(id) = topic::parse_id(topic, self.topics.response) else {
            return false;
        };
        if let Resolution::Resolved { drained: true } = self.registry.resolve(id, payload) {
            self.release(transport);
        }
        true
    }

    /// Drops the pending request `id` without invoking its callbacks.
    ///
    /// The response filter is released if no request remains.
    pub fn cancel<T: Transport + ?Sized>(&mut self, transport: &mut T, id: RequestId) -> bool {
        if !self.registry.cancel(id) {
            return false;
        }
        log::debug!("request {} cancelled", id);
        self.release_if_idle(transport);
        true
    }

    /// Expires overdue requests. Returns how many expired.
    pub fn tick<T: Transport + ?Sized>(&mut self, transport: &mut T, now: Instant) -> usize {
        let expiry = self.registry.tick(now);
        if expiry.drained {
            self.release(transport);
        }
        expiry.expired
    }

    /// Restores the response subscription after a reconnect.
    pub fn resubscribe<T: Transport + ?Sized>(&mut self, transport: &mut T) -> Result<(), Error> {
        self.subscribed = false;
        if self.registry.is_empty() {
            return Ok(());
        }
        self.ensure_subscribed(transport)
    }

    fn ensure_subscribed<T: Transport + ?Sized>(&mut self, transport: &mut T) -> Result<(), Error> {
        if self.subscribed {
            return Ok(());
        }
        transport
            .subscribe(self.topics.response_filter)
            .map_err(|err| {
                log::error!("subscribe {} failed: {}", self.topics.response_filter, err);
                Error::SubscriptionFailure
            })?;
        self.subscribed = true;
        Ok(())
    }

    fn release_if_idle<T: Transport + ?Sized>(&mut self, transport: &mut T) {
        if self.registry.is_empty() {
            self.release(transport);
        }
    }

    fn release<T: Transport + ?Sized>(&mut self, transport: &mut T) {
        if !self.subscribed {
            return;
        }
        self.subscribed = false;
        if let Err(err) = transport.unsubscribe(self.topics.response_filter) {
            log::warn!("unsubscribe {} failed: {}", self.topics.response_filter, err);
        }
    }
}
