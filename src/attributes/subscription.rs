use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

use serde_json::Value;

use crate::config::Capacity;
use crate::error::Error;
use crate::network::Transport;
use crate::topic;

use super::SHARED_RESPONSE_KEY;

/// Handle of one shared attribute subscription.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub struct SubscriptionId(u32);

struct Subscription {
    id: SubscriptionId,
    keys: Vec<String>,
    callback: Box<dyn FnMut(&Value)>,
}

impl Subscription {
    fn wants(&self, update: &Value) -> bool {
        self.keys.is_empty() || self.keys.iter().any(|key| update.get(key.as_str()).is_some())
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("keys", &self.keys)
            .finish_non_exhaustive()
    }
}

/// Persistent watchers of shared attribute updates.
///
/// Every update the platform pushes on the attribute topic is offered to
/// each subscription. A subscription with no keys receives every update; one
/// with keys receives the update if it carries at least one of them. The
/// callback always gets the whole update, not just the matched members.
#[derive(Debug)]
pub struct SharedAttributeSubscriptionService {
    subscriptions: Vec<Subscription>,
    capacity: Capacity,
    next_id: u32,
}

impl SharedAttributeSubscriptionService {
    /// Creates an empty service.
    pub fn new(capacity: Capacity) -> Self {
        Self {
            subscriptions: capacity.allocate(),
            capacity,
            next_id: 0,
        }
    }

    /// Number of active subscriptions.
    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    /// Returns `true` if nothing is subscribed.
    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    /// Adds a subscription for `keys`; an empty slice matches every update.
    ///
    /// The attribute topic is subscribed on every call. If the transport
    /// refuses, nothing is added.
    pub fn subscribe<T: Transport + ?Sized>(
        &mut self,
        transport: &mut T,
        keys: &[&str],
        callback: impl FnMut(&Value) + 'static,
    ) -> Result<SubscriptionId, Error> {
        if keys.iter().any(|key| key.is_empty()) {
            return Err(Error::InvalidArgument("empty attribute key"));
        }
        if !self.capacity.admits(self.subscriptions.len()) {
            log::error!("shared attribute subscriptions full");
            return Err(Error::CapacityExceeded);
        }
        transport.subscribe(topic::ATTRIBUTES).map_err(|err| {
            log::error!("subscribe {} failed: {}", topic::ATTRIBUTES, err);
            Error::SubscriptionFailure
        })?;

        let id = SubscriptionId(self.next_id);
        self.next_id = self.next_id.wrapping_add(1);
        self.subscriptions.push(Subscription {
            id,
            keys: keys.iter().map(|key| String::from(*key)).collect(),
            callback: Box::new(callback),
        });
        Ok(id)
    }

    /// Removes one subscription; the topic is released with the last one.
    pub fn remove<T: Transport + ?Sized>(&mut self, transport: &mut T, id: SubscriptionId) -> bool {
        let Some(index) = self.subscriptions.iter().position(|s| s.id == id) else {
            return false;
        };
        self.subscriptions.remove(index);
        if self.subscriptions.is_empty() {
            release(transport);
        }
        true
    }

    /// Removes every subscription and releases the topic.
    pub fn unsubscribe<T: Transport + ?Sized>(&mut self, transport: &mut T) {
        self.subscriptions.clear();
        release(transport);
    }

    /// Subscribes the topic again after a reconnect.
    pub fn resubscribe<T: Transport + ?Sized>(&mut self, transport: &mut T) -> Result<(), Error> {
        if self.subscriptions.is_empty() {
            return Ok(());
        }
        transport
            .subscribe(topic::ATTRIBUTES)
            .map_err(|_| Error::SubscriptionFailure)
    }

    /// Offers an update to every subscription. Returns how many fired.
    ///
    /// Updates wrapped in a `shared` member are unwrapped first.
    pub fn dispatch(&mut self, message: &Value) -> usize {
        let update = message.get(SHARED_RESPONSE_KEY).unwrap_or(message);
        if !update.is_object() {
            log::warn!("shared attribute update is not an object");
            return 0;
        }

        let mut fired = 0;
        for subscription in self.subscriptions.iter_mut() {
            if subscription.wants(update) {
                (subscription.callback)(update);
                fired += 1;
            }
        }
        fired
    }
}

fn release<T: Transport + ?Sized>(transport: &mut T) {
    if let Err(err) = transport.unsubscribe(topic::ATTRIBUTES) {
        log::warn!("unsubscribe {} failed: {}", topic::ATTRIBUTES, err);
    }
}
