//! One device session on top of a [`Transport`].
//!
//! [`Device`] owns the transport and every service, and is the single entry
//! point for inbound traffic. The host loop feeds it each received message and
//! calls [`Device::tick`] periodically:
//!
//! ```rust
//! use cloudlink::network::Transport;
//! use cloudlink::network::error::Error;
//! use cloudlink::{Config, Device, Instant};
//! use serde_json::json;
//!
//! # #[derive(Default)]
//! # struct Loopback { sent: Vec<(String, Vec<u8>)> }
//! # impl Transport for Loopback {
//! #     fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), Error> {
//! #         self.sent.push((topic.into(), payload.into()));
//! #         Ok(())
//! #     }
//! #     fn subscribe(&mut self, _filter: &str) -> Result<(), Error> { Ok(()) }
//! #     fn unsubscribe(&mut self, _filter: &str) -> Result<(), Error> { Ok(()) }
//! #     fn buffer_size(&self) -> usize { 256 }
//! #     fn set_buffer_size(&mut self, _size: usize) -> Result<(), Error> { Ok(()) }
//! # }
//! let mut device = Device::new(Loopback::default(), Config::default());
//! device.send_telemetry(&[("temperature", json!(21.5))]).unwrap();
//!
//! device.subscribe_rpc("reboot", |_| Some(json!({ "ok": true }))).unwrap();
//! device
//!     .on_message(
//!         "v1/devices/me/rpc/request/7",
//!         br#"{"method":"reboot","params":{}}"#,
//!         Instant::from_millis(0),
//!     )
//!     .unwrap();
//!
//! let (topic, reply) = device.transport().sent.last().unwrap();
//! assert_eq!(topic, "v1/devices/me/rpc/response/7");
//! assert_eq!(reply.as_slice(), br#"{"ok":true}"#);
//! ```

use core::time::Duration;

use serde_json::Value;

use crate::attributes::{AttributeRequestService, SharedAttributeSubscriptionService, SubscriptionId};
use crate::config::Config;
use crate::error::Error;
use crate::network::Transport;
use crate::ota::{OtaUpdateController, State, UpdateRequest};
use crate::request::{RequestId, RequestIdGenerator, ResponseCallbacks};
use crate::rpc::{RpcRequestService, ServerRpcService};
use crate::telemetry;
use crate::time::Instant;
use crate::topic;

/// A connected device.
#[derive(Debug)]
pub struct Device<T: Transport> {
    transport: T,
    config: Config,
    attributes: AttributeRequestService,
    shared: SharedAttributeSubscriptionService,
    rpc: RpcRequestService,
    server_rpc: ServerRpcService,
    ota: OtaUpdateController,
}

impl<T: Transport> Device<T> {
    /// Creates a device with its own request id counter.
    pub fn new(transport: T, config: Config) -> Self {
        Self::with_ids(transport, config, RequestIdGenerator::new())
    }

    /// Creates a device drawing request ids from `ids`.
    pub fn with_ids(transport: T, config: Config, ids: RequestIdGenerator) -> Self {
        Self {
            transport,
            attributes: AttributeRequestService::new(
                config.attribute_requests,
                ids.clone(),
                config.payload,
            ),
            shared: SharedAttributeSubscriptionService::new(config.shared_subscriptions),
            rpc: RpcRequestService::new(config.rpc_requests, ids, config.payload),
            server_rpc: ServerRpcService::new(config.rpc_handlers, config.payload),
            ota: OtaUpdateController::new(config.ota),
            config,
        }
    }

    /// The configuration in use.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The underlying transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// The underlying transport, e.g. to poll it for messages.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Consumes the device and returns the transport.
    pub fn into_transport(self) -> T {
        self.transport
    }

    /// Publishes telemetry.
    pub fn send_telemetry(&mut self, fields: &[(&str, Value)]) -> Result<(), Error> {
        telemetry::publish_fields(&mut self.transport, topic::TELEMETRY, fields, &self.config.payload)
    }

    /// Publishes a prepared telemetry document.
    pub fn send_telemetry_json(&mut self, document: &Value) -> Result<(), Error> {
        telemetry::publish_json(&mut self.transport, topic::TELEMETRY, document, &self.config.payload)
    }

    /// Publishes telemetry with an explicit Unix timestamp in milliseconds.
    pub fn send_telemetry_at(&mut self, timestamp_ms: u64, fields: &[(&str, Value)]) -> Result<(), Error> {
        telemetry::publish_timestamped(
            &mut self.transport,
            topic::TELEMETRY,
            timestamp_ms,
            fields,
            &self.config.payload,
        )
    }

    /// Publishes client attributes.
    pub fn send_attributes(&mut self, fields: &[(&str, Value)]) -> Result<(), Error> {
        telemetry::publish_fields(&mut self.transport, topic::ATTRIBUTES, fields, &self.config.payload)
    }

    /// Publishes a prepared client attribute document.
    pub fn send_attributes_json(&mut self, document: &Value) -> Result<(), Error> {
        telemetry::publish_json(&mut self.transport, topic::ATTRIBUTES, document, &self.config.payload)
    }

    /// Fetches client-scope attributes.
    pub fn request_client_attributes(
        &mut self,
        keys: &[&str],
        callbacks: ResponseCallbacks,
        timeout: Duration,
        now: Instant,
    ) -> Result<RequestId, Error> {
        self.attributes
            .request_client_attributes(&mut self.transport, keys, callbacks, timeout, now)
    }

    /// Fetches shared-scope attributes.
    pub fn request_shared_attributes(
        &mut self,
        keys: &[&str],
        callbacks: ResponseCallbacks,
        timeout: Duration,
        now: Instant,
    ) -> Result<RequestId, Error> {
        self.attributes
            .request_shared_attributes(&mut self.transport, keys, callbacks, timeout, now)
    }

    /// Calls `method` on the platform.
    pub fn rpc_request(
        &mut self,
        method: &str,
        params: Option<&Value>,
        callbacks: ResponseCallbacks,
        timeout: Duration,
        now: Instant,
    ) -> Result<RequestId, Error> {
        self.rpc
            .request(&mut self.transport, method, params, callbacks, timeout, now)
    }

    /// Watches shared attribute updates carrying any of `keys`.
    pub fn subscribe_shared_attributes(
        &mut self,
        keys: &[&str],
        callback: impl FnMut(&Value) + 'static,
    ) -> Result<SubscriptionId, Error> {
        self.shared.subscribe(&mut self.transport, keys, callback)
    }

    /// Drops one shared attribute subscription.
    ///
    /// Removing the subscription of a firmware watch stops that watch.
    pub fn remove_shared_subscription(&mut self, id: SubscriptionId) -> bool {
        if self.ota.watch_subscription() == Some(id) {
            return self.stop_firmware_update();
        }
        self.shared.remove(&mut self.transport, id)
    }

    /// Drops every shared attribute subscription, stopping a firmware watch
    /// along with them.
    pub fn unsubscribe_shared_attributes(&mut self) {
        if self.ota.watch_subscription().is_some() {
            self.stop_firmware_update();
        }
        self.shared.unsubscribe(&mut self.transport)
    }

    /// Serves `method` for the platform.
    pub fn subscribe_rpc(
        &mut self,
        method: &str,
        handler: impl FnMut(&Value) -> Option<Value> + 'static,
    ) -> Result<(), Error> {
        self.server_rpc.subscribe(&mut self.transport, method, handler)
    }

    /// Drops every server-side RPC handler.
    pub fn unsubscribe_rpc(&mut self) {
        self.server_rpc.unsubscribe(&mut self.transport)
    }

    /// Checks once for assigned firmware and installs it.
    pub fn start_firmware_update(&mut self, request: UpdateRequest, now: Instant) -> Result<(), Error> {
        self.ota.start(
            &mut self.transport,
            &mut self.attributes,
            &mut self.shared,
            request,
            now,
        )
    }

    /// Installs firmware whenever a new image is assigned.
    pub fn subscribe_firmware_update(&mut self, request: UpdateRequest) -> Result<(), Error> {
        self.ota.subscribe(
            &mut self.transport,
            &mut self.attributes,
            &mut self.shared,
            request,
        )
    }

    /// Aborts and disarms any firmware update.
    pub fn stop_firmware_update(&mut self) -> bool {
        self.ota
            .stop(&mut self.transport, &mut self.attributes, &mut self.shared)
    }

    /// State of the firmware update.
    pub fn firmware_state(&self) -> State {
        self.ota.state()
    }

    /// The firmware update controller.
    pub fn ota(&self) -> &OtaUpdateController {
        &self.ota
    }

    /// Dispatches one inbound message.
    ///
    /// Firmware chunks are consumed as raw bytes; everything else must be a
    /// JSON document. Messages on topics no service owns are ignored.
    pub fn on_message(&mut self, topic: &str, payload: &[u8], now: Instant) -> Result<(), Error> {
        if self.ota.handles(topic) {
            self.ota.on_message(&mut self.transport, topic, payload, now);
            return Ok(());
        }

        let result = self.dispatch_json(topic, payload);
        self.ota.process(&mut self.transport, now);
        result
    }

    /// Expires overdue requests and drives the firmware download.
    pub fn tick(&mut self, now: Instant) {
        self.attributes.tick(&mut self.transport, now);
        self.rpc.tick(&mut self.transport, now);
        self.ota.process(&mut self.transport, now);
        self.ota.tick(&mut self.transport, now);
    }

    /// Restores every subscription after the transport reconnected.
    ///
    /// All services are attempted; the first failure is returned.
    pub fn resubscribe(&mut self) -> Result<(), Error> {
        let results = [
            self.attributes.resubscribe(&mut self.transport),
            self.rpc.resubscribe(&mut self.transport),
            self.server_rpc.resubscribe(&mut self.transport),
            self.shared.resubscribe(&mut self.transport),
            self.ota.resubscribe(&mut self.transport),
        ];
        results.into_iter().collect()
    }

    fn dispatch_json(&mut self, topic: &str, payload: &[u8]) -> Result<(), Error> {
        let owned = self.attributes.handles(topic)
            || self.rpc.handles(topic)
            || self.server_rpc.handles(topic)
            || topic == topic::ATTRIBUTES;
        if !owned {
            log::debug!("no handler for {}", topic);
            return Ok(());
        }

        let document: Value = serde_json::from_slice(payload).map_err(|_| {
            log::warn!("undecodable payload on {}", topic);
            Error::Serialization
        })?;

        if self.attributes.handles(topic) {
            self.attributes
                .on_response(&mut self.transport, topic, &document);
        } else if self.rpc.handles(topic) {
            self.rpc.on_response(&mut self.transport, topic, &document);
        } else if self.server_rpc.handles(topic) {
            self.server_rpc
                .on_request(&mut self.transport, topic, &document)?;
        } else {
            self.shared.dispatch(&document);
        }
        Ok(())
    }
}
