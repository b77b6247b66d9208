use alloc::boxed::Box;
use alloc::string::String;
use core::fmt::{self, Write as _};
use core::time::Duration;

use crate::network::Transport;
use crate::storage::FlashWriter;
use crate::time::Instant;
use crate::topic;

use super::FailureReason;
use super::hash::HashAccumulator;

/// What one call into the engine produced.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub(crate) enum Step {
    /// Nothing changed.
    Idle,
    /// The awaited chunk timed out or arrived short and was requested again.
    Retried,
    /// A chunk was stored and the next one requested.
    Advanced {
        /// Chunks stored so far.
        received: usize,
        /// Chunks in the image.
        total: usize,
    },
    /// The last chunk was stored.
    Complete,
    /// The download cannot continue.
    Failed(FailureReason),
}

/// Pulls an image chunk by chunk.
///
/// Exactly one chunk is outstanding at a time. Every accepted chunk goes to
/// flash first and then into the hash; the retry budget is refilled after
/// each accepted chunk and drained by timeouts of the awaited one.
pub(crate) struct ChunkTransferEngine {
    total_size: usize,
    chunk_size: usize,
    num_chunks: usize,
    current: usize,
    retry_budget: u8,
    retries_remaining: u8,
    timeout: Duration,
    deadline: Instant,
    hasher: Box<dyn HashAccumulator>,
}

impl fmt::Debug for ChunkTransferEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkTransferEngine")
            .field("total_size", &self.total_size)
            .field("chunk_size", &self.chunk_size)
            .field("current", &self.current)
            .field("num_chunks", &self.num_chunks)
            .field("retries_remaining", &self.retries_remaining)
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}

impl ChunkTransferEngine {
    pub(crate) fn new(
        total_size: usize,
        chunk_size: usize,
        retry_budget: u8,
        timeout: Duration,
        hasher: Box<dyn HashAccumulator>,
    ) -> Self {
        Self {
            total_size,
            chunk_size,
            num_chunks: total_size.div_ceil(chunk_size),
            current: 0,
            retry_budget,
            retries_remaining: retry_budget,
            timeout,
            deadline: Instant::from_millis(0),
            hasher,
        }
    }

    pub(crate) fn num_chunks(&self) -> usize {
        self.num_chunks
    }

    pub(crate) fn current_chunk(&self) -> usize {
        self.current
    }

    /// Requests the first chunk.
    pub(crate) fn start<T: Transport + ?Sized>(&mut self, transport: &mut T, now: Instant) {
        log::info!(
            "downloading {} bytes in {} chunks of {}",
            self.total_size,
            self.num_chunks,
            self.chunk_size
        );
        self.request_current(transport, now);
    }

    /// Handles a chunk delivered on the response topic for `index`.
    pub(crate) fn on_chunk<T: Transport + ?Sized>(
        &mut self,
        transport: &mut T,
        flash: &mut dyn FlashWriter,
        index: u32,
        bytes: &[u8],
        now: Instant,
    ) -> Step {
        if usize::try_from(index).ok() != Some(self.current) {
            log::debug!("ignoring chunk {} while awaiting {}", index, self.current);
            return Step::Idle;
        }

        let expected = self.expected_len();
        if bytes.len() > expected {
            log::error!(
                "chunk {} carries {} bytes, {} expected",
                index,
                bytes.len(),
                expected
            );
            return Step::Failed(FailureReason::ChunkOverflow);
        }
        if bytes.len() < expected {
            log::warn!("chunk {} short ({} of {} bytes)", index, bytes.len(), expected);
            return self.retry(transport, now);
        }

        if let Err(err) = flash.write(bytes) {
            log::error!("writing chunk {} failed: {}", index, err);
            return Step::Failed(FailureReason::Flash(err));
        }
        self.hasher.update(bytes);

        self.current += 1;
        self.retries_remaining = self.retry_budget;
        if self.current == self.num_chunks {
            return Step::Complete;
        }
        self.request_current(transport, now);
        Step::Advanced {
            received: self.current,
            total: self.num_chunks,
        }
    }

    /// Re-requests the awaited chunk once its deadline has passed.
    pub(crate) fn tick<T: Transport + ?Sized>(&mut self, transport: &mut T, now: Instant) -> Step {
        if self.current >= self.num_chunks || !now.has_reached(self.deadline) {
            return Step::Idle;
        }
        log::warn!("chunk {} timed out", self.current);
        self.retry(transport, now)
    }

    /// Finishes the hash over everything stored.
    pub(crate) fn into_digest(self) -> String {
        self.hasher.digest_hex()
    }

    fn retry<T: Transport + ?Sized>(&mut self, transport: &mut T, now: Instant) -> Step {
        self.retries_remaining = self.retries_remaining.saturating_sub(1);
        if self.retries_remaining == 0 {
            log::error!("chunk {} failed after {} attempts", self.current, self.retry_budget);
            return Step::Failed(FailureReason::RetriesExhausted);
        }
        self.request_current(transport, now);
        Step::Retried
    }

    fn expected_len(&self) -> usize {
        let offset = self.current * self.chunk_size;
        self.chunk_size.min(self.total_size - offset)
    }

    fn request_current<T: Transport + ?Sized>(&mut self, transport: &mut T, now: Instant) {
        // a lost request is recovered by the deadline like a lost chunk
        self.deadline = now + self.timeout;

        let Ok(index) = u32::try_from(self.current) else {
            log::error!("chunk index {} out of range", self.current);
            return;
        };
        let topic = match topic::with_id(topic::FIRMWARE_REQUEST, index) {
            Ok(topic) => topic,
            Err(err) => {
                log::error!("chunk topic: {}", err);
                return;
            }
        };
        let mut size: heapless::String<20> = heapless::String::new();
        if write!(size, "{}", self.chunk_size).is_err() {
            return;
        }
        match transport.publish(&topic, size.as_bytes()) {
            Ok(()) => log::debug!("requested chunk {}", index),
            Err(err) => log::warn!("chunk {} request failed: {}", index, err),
        }
    }
}
