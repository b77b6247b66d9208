#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;

use cloudlink::network::Transport;
use cloudlink::network::error::Error;
use cloudlink::ota::{ChecksumAlgorithm, HashAccumulator};
use cloudlink::storage::FlashWriter;
use cloudlink::storage::error::Error as StorageError;
use cloudlink::topic;
use serde_json::Value;

/// Records everything the services do to the transport.
#[derive(Debug)]
pub struct MockTransport {
    pub published: Vec<(String, Vec<u8>)>,
    pub subscribed: Vec<String>,
    pub unsubscribed: Vec<String>,
    pub buffer_size: usize,
    pub max_buffer_size: usize,
    pub fail_publish: bool,
    pub fail_subscribe: bool,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            published: Vec::new(),
            subscribed: Vec::new(),
            unsubscribed: Vec::new(),
            buffer_size: 256,
            max_buffer_size: usize::MAX,
            fail_publish: false,
            fail_subscribe: false,
        }
    }

    /// Subscribed and not released since.
    pub fn is_subscribed(&self, filter: &str) -> bool {
        let subscribes = self.subscribed.iter().filter(|f| *f == filter).count();
        let unsubscribes = self.unsubscribed.iter().filter(|f| *f == filter).count();
        subscribes > unsubscribes
    }

    pub fn published_on(&self, prefix: &str) -> Vec<(String, Vec<u8>)> {
        self.published
            .iter()
            .filter(|(topic, _)| topic.starts_with(prefix))
            .cloned()
            .collect()
    }

    pub fn last_json(&self) -> (String, Value) {
        let (topic, payload) = self.published.last().expect("nothing published");
        (topic.clone(), serde_json::from_slice(payload).unwrap())
    }

    pub fn telemetry(&self) -> Vec<Value> {
        self.published
            .iter()
            .filter(|(topic, _)| topic == topic::TELEMETRY)
            .map(|(_, payload)| serde_json::from_slice(payload).unwrap())
            .collect()
    }

    /// Every reported `fw_state`, in order.
    pub fn fw_states(&self) -> Vec<String> {
        self.telemetry()
            .iter()
            .filter_map(|doc| doc.get("fw_state").and_then(Value::as_str).map(String::from))
            .collect()
    }

    pub fn last_fw_error(&self) -> Option<String> {
        self.telemetry()
            .iter()
            .rev()
            .find_map(|doc| doc.get("fw_error").and_then(Value::as_str).map(String::from))
    }

    /// Indexes of every chunk request, in order.
    pub fn chunk_requests(&self) -> Vec<u32> {
        self.published
            .iter()
            .filter_map(|(topic, _)| topic::parse_id(topic, topic::FIRMWARE_REQUEST))
            .collect()
    }

    /// Id of the most recent request published under `prefix`.
    pub fn last_request_id(&self, prefix: &str) -> u32 {
        self.published
            .iter()
            .rev()
            .find_map(|(topic, _)| topic::parse_id(topic, prefix))
            .expect("no request published")
    }
}

impl Transport for MockTransport {
    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), Error> {
        if self.fail_publish {
            return Err(Error::WriteError);
        }
        self.published.push((topic.to_string(), payload.to_vec()));
        Ok(())
    }

    fn subscribe(&mut self, filter: &str) -> Result<(), Error> {
        if self.fail_subscribe {
            return Err(Error::SubscriptionRejected);
        }
        self.subscribed.push(filter.to_string());
        Ok(())
    }

    fn unsubscribe(&mut self, filter: &str) -> Result<(), Error> {
        self.unsubscribed.push(filter.to_string());
        Ok(())
    }

    fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    fn set_buffer_size(&mut self, size: usize) -> Result<(), Error> {
        if size > self.max_buffer_size {
            return Err(Error::OutOfMemory);
        }
        self.buffer_size = size;
        Ok(())
    }
}

/// What happened to a [`RamFlash`], readable after the writer moved away.
#[derive(Debug, Default)]
pub struct FlashLog {
    pub begun: Option<usize>,
    pub image: Vec<u8>,
    pub committed: bool,
    pub aborted: bool,
}

#[derive(Debug, Clone, Default)]
pub struct RamFlash {
    pub log: Rc<RefCell<FlashLog>>,
    pub fail_writes: bool,
}

impl RamFlash {
    pub fn failing() -> Self {
        Self {
            fail_writes: true,
            ..Self::default()
        }
    }
}

impl FlashWriter for RamFlash {
    fn begin(&mut self, total_size: usize) -> Result<(), StorageError> {
        let mut log = self.log.borrow_mut();
        log.begun = Some(total_size);
        log.image.clear();
        Ok(())
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), StorageError> {
        if self.fail_writes {
            return Err(StorageError::WriteError);
        }
        self.log.borrow_mut().image.extend_from_slice(bytes);
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StorageError> {
        self.log.borrow_mut().committed = true;
        Ok(())
    }

    fn abort(&mut self) -> Result<(), StorageError> {
        let mut log = self.log.borrow_mut();
        log.aborted = true;
        log.image.clear();
        Ok(())
    }
}

struct FixedDigest;

impl HashAccumulator for FixedDigest {
    fn update(&mut self, _bytes: &[u8]) {}

    fn digest_hex(self: Box<Self>) -> String {
        "abc123".to_string()
    }
}

/// Hasher whose digest is always `abc123`.
pub fn fixed_hasher(_algorithm: ChecksumAlgorithm) -> Box<dyn HashAccumulator> {
    Box::new(FixedDigest)
}
