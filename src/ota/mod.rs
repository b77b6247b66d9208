//! Over-the-air firmware updates.
//!
//! An update runs through these states:
//!
//! ```text
//!  Idle ──start/subscribe──► AwaitingMetadata ──valid info──► Downloading
//!                                  │                              │ last chunk
//!                                  │ invalid / timeout            ▼
//!                                  │                          Verifying
//!                                  ▼                         │         │
//!                               Failed ◄──── mismatch ───────┘         └──► Succeeded
//! ```
//!
//! [`OtaUpdateController::start`] asks for the firmware shared attributes once;
//! [`OtaUpdateController::subscribe`] watches them and reacts to every new
//! assignment. Either way the metadata is validated before a single chunk is
//! requested, and every terminal transition restores the transport buffer,
//! releases the chunk topic and reports `fw_state` telemetry.
//!
//! Metadata arrives through attribute callbacks that cannot borrow the
//! controller. They queue it instead; [`OtaUpdateController::process`] picks
//! it up once the message that carried it has been dispatched.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::format;
use alloc::rc::Rc;
use alloc::string::String;
use core::cell::RefCell;
use core::fmt;
use core::time::Duration;

use serde::Serialize;
use serde_json::Value;

use crate::attributes::{
    AttributeRequestService, SHARED_RESPONSE_KEY, SharedAttributeSubscriptionService,
    SubscriptionId,
};
use crate::config::{
    DEFAULT_CHUNK_RETRIES, DEFAULT_CHUNK_SIZE, DEFAULT_CHUNK_TIMEOUT, OtaOptions, StartPolicy,
};
use crate::error::Error;
use crate::network::Transport;
use crate::request::{RequestId, ResponseCallbacks};
use crate::storage::FlashWriter;
use crate::storage::error::Error as StorageError;
use crate::telemetry;
use crate::time::Instant;
use crate::topic;

use self::chunk::{ChunkTransferEngine, Step};

mod chunk;
mod hash;

pub use self::hash::{ChecksumAlgorithm, HashAccumulator, HasherFactory, software_hasher};

/// Shared attribute holding the image checksum.
pub const FW_CHECKSUM_KEY: &str = "fw_checksum";
/// Shared attribute naming the checksum algorithm.
pub const FW_CHECKSUM_ALGORITHM_KEY: &str = "fw_checksum_algorithm";
/// Shared attribute holding the image size in bytes.
pub const FW_SIZE_KEY: &str = "fw_size";
/// Shared attribute holding the image title.
pub const FW_TITLE_KEY: &str = "fw_title";
/// Shared attribute holding the image version.
pub const FW_VERSION_KEY: &str = "fw_version";

/// Every shared attribute describing an assigned image, in request order.
pub const FIRMWARE_KEYS: [&str; 5] = [
    FW_CHECKSUM_KEY,
    FW_CHECKSUM_ALGORITHM_KEY,
    FW_SIZE_KEY,
    FW_TITLE_KEY,
    FW_VERSION_KEY,
];

/// Why an update session ended without installing an image.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum FailureReason {
    /// One of the firmware attributes is missing.
    NoFirmware,
    /// A firmware attribute is null or of the wrong type.
    Malformed,
    /// The assigned image is the one already running.
    UpToDate,
    /// The assigned image carries a different title.
    NotApplicable,
    /// The checksum algorithm is not one of MD5 or SHA256/384/512.
    UnsupportedAlgorithm,
    /// The firmware attributes were not received in time.
    MetadataTimeout,
    /// The chunk topic could not be subscribed.
    SubscriptionFailed,
    /// The transport buffer could not be enlarged for a chunk.
    BufferResize,
    /// The flash writer failed.
    Flash(StorageError),
    /// A chunk was larger than the remaining image.
    ChunkOverflow,
    /// A chunk did not arrive within its retry budget.
    RetriesExhausted,
    /// The image digest differs from the announced checksum.
    ChecksumMismatch,
    /// The session was stopped by the application.
    Stopped,
    /// The session was replaced by a newer one.
    Superseded,
}

impl FailureReason {
    /// Returns `false` for outcomes that are not a fault, such as an image
    /// that is already installed.
    pub fn is_error(self) -> bool {
        !matches!(self, FailureReason::UpToDate)
    }

    /// Human readable summary, also used as `fw_error`.
    pub fn description(self) -> &'static str {
        match self {
            FailureReason::NoFirmware => "No new firmware assigned on the given device",
            FailureReason::Malformed => "Firmware info is empty or malformed",
            FailureReason::UpToDate => "Firmware already up to date",
            FailureReason::NotApplicable => "Firmware not applicable to this device",
            FailureReason::UnsupportedAlgorithm => "Checksum algorithm is not supported",
            FailureReason::MetadataTimeout => "Firmware info not received in time",
            FailureReason::SubscriptionFailed => "Subscribing to firmware chunks failed",
            FailureReason::BufferResize => "Not enough memory for the chunk buffer",
            FailureReason::Flash(_) => "Writing firmware to storage failed",
            FailureReason::ChunkOverflow => "Chunk exceeds the announced firmware size",
            FailureReason::RetriesExhausted => "Download failed after exhausting retries",
            FailureReason::ChecksumMismatch => "Checksum verification failed",
            FailureReason::Stopped => "Update stopped",
            FailureReason::Superseded => "Update superseded by a newer request",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

impl From<FailureReason> for Error {
    fn from(reason: FailureReason) -> Self {
        match reason {
            FailureReason::MetadataTimeout | FailureReason::RetriesExhausted => Error::Timeout,
            FailureReason::ChecksumMismatch => Error::ChecksumMismatch,
            FailureReason::SubscriptionFailed => Error::SubscriptionFailure,
            FailureReason::BufferResize => Error::CapacityExceeded,
            FailureReason::Flash(err) => Error::Storage(err),
            FailureReason::Superseded => Error::SessionActive,
            other => Error::Protocol(other.description()),
        }
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for FailureReason {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(f, "{=str}", self.description())
    }
}

/// Progress of the controller.
///
/// `Succeeded` and `Failed` are resting states like `Idle`: they keep the
/// outcome of the last session visible, and a new session may start from
/// any of the three.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum State {
    /// Nothing requested yet.
    Idle,
    /// Waiting for the firmware attributes.
    AwaitingMetadata,
    /// Pulling chunks.
    Downloading,
    /// Comparing the digest.
    Verifying,
    /// The last session installed its image.
    Succeeded,
    /// The last session ended early, including metadata that was rejected
    /// before any chunk was requested.
    Failed(FailureReason),
}

impl State {
    /// Returns `true` between the metadata request and the terminal state.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            State::AwaitingMetadata | State::Downloading | State::Verifying
        )
    }
}

/// Validated description of an assigned image.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct FirmwareDescriptor {
    /// Image title.
    pub title: String,
    /// Image version.
    pub version: String,
    /// Expected digest, hex encoded.
    pub checksum: String,
    /// Algorithm of `checksum`.
    pub algorithm: ChecksumAlgorithm,
    /// Image size in bytes.
    pub total_size: usize,
}

/// Everything one update needs from the application.
pub struct UpdateRequest {
    /// Title of the running image.
    pub current_title: String,
    /// Version of the running image.
    pub current_version: String,
    /// Destination of the downloaded image.
    pub flash: Box<dyn FlashWriter>,
    /// Digest implementation per algorithm.
    pub hasher: HasherFactory,
    /// Bytes requested per chunk.
    pub chunk_size: usize,
    /// Consecutive timeouts tolerated for one chunk.
    pub chunk_retries: u8,
    /// Wait for each chunk.
    pub chunk_timeout: Duration,
    /// Called with `(chunks stored, chunks total)` after every chunk.
    pub on_progress: Option<Box<dyn FnMut(usize, usize)>>,
    /// Called with the outcome when a session ends.
    pub on_finished: Option<Box<dyn FnMut(bool)>>,
}

impl UpdateRequest {
    /// A request with default chunking and software hashing.
    pub fn new(title: &str, version: &str, flash: impl FlashWriter + 'static) -> Self {
        Self {
            current_title: String::from(title),
            current_version: String::from(version),
            flash: Box::new(flash),
            hasher: software_hasher,
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_retries: DEFAULT_CHUNK_RETRIES,
            chunk_timeout: DEFAULT_CHUNK_TIMEOUT,
            on_progress: None,
            on_finished: None,
        }
    }

    /// Sets the progress callback.
    pub fn with_progress(mut self, on_progress: impl FnMut(usize, usize) + 'static) -> Self {
        self.on_progress = Some(Box::new(on_progress));
        self
    }

    /// Sets the completion callback.
    pub fn with_finished(mut self, on_finished: impl FnMut(bool) + 'static) -> Self {
        self.on_finished = Some(Box::new(on_finished));
        self
    }

    fn check(&self) -> Result<(), Error> {
        if self.current_title.is_empty() || self.current_version.is_empty() {
            log::error!("firmware update without current title or version");
            return Err(Error::InvalidArgument("empty firmware title or version"));
        }
        if self.chunk_size == 0 {
            return Err(Error::InvalidArgument("zero chunk size"));
        }
        if self.chunk_retries == 0 {
            return Err(Error::InvalidArgument("zero chunk retries"));
        }
        Ok(())
    }
}

impl fmt::Debug for UpdateRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdateRequest")
            .field("current_title", &self.current_title)
            .field("current_version", &self.current_version)
            .field("chunk_size", &self.chunk_size)
            .field("chunk_retries", &self.chunk_retries)
            .field("chunk_timeout", &self.chunk_timeout)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
enum Reported {
    Downloading,
    Downloaded,
    Verified,
    Updating,
    Updated,
    Failed,
}

impl Reported {
    fn as_str(self) -> &'static str {
        match self {
            Reported::Downloading => "DOWNLOADING",
            Reported::Downloaded => "DOWNLOADED",
            Reported::Verified => "VERIFIED",
            Reported::Updating => "UPDATING",
            Reported::Updated => "UPDATED",
            Reported::Failed => "FAILED",
        }
    }
}

#[derive(Serialize)]
struct StateReport<'a> {
    fw_state: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    fw_error: Option<&'a str>,
}

#[derive(Serialize)]
struct FirmwareInfo<'a> {
    current_fw_title: &'a str,
    current_fw_version: &'a str,
}

#[derive(Debug)]
enum Notice {
    Metadata(Value),
    MetadataTimeout,
}

type Inbox = Rc<RefCell<VecDeque<(u32, Notice)>>>;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
enum Mode {
    OneShot,
    Watch(SubscriptionId),
}

#[derive(Debug)]
struct Rejection {
    reason: FailureReason,
    message: String,
}

impl Rejection {
    fn new(reason: FailureReason, message: String) -> Self {
        Self { reason, message }
    }
}

impl From<FailureReason> for Rejection {
    fn from(reason: FailureReason) -> Self {
        Self::new(reason, String::from(reason.description()))
    }
}

/// Drives firmware updates.
#[derive(Debug)]
pub struct OtaUpdateController {
    options: OtaOptions,
    state: State,
    request: Option<UpdateRequest>,
    mode: Option<Mode>,
    installed: Option<(String, String)>,
    metadata_request: Option<RequestId>,
    descriptor: Option<FirmwareDescriptor>,
    engine: Option<ChunkTransferEngine>,
    chunk_subscribed: bool,
    restore_buffer: Option<usize>,
    flash_open: bool,
    inbox: Inbox,
    generation: u32,
}

impl OtaUpdateController {
    /// Creates an idle controller.
    pub fn new(options: OtaOptions) -> Self {
        Self {
            options,
            state: State::Idle,
            request: None,
            mode: None,
            installed: None,
            metadata_request: None,
            descriptor: None,
            engine: None,
            chunk_subscribed: false,
            restore_buffer: None,
            flash_open: false,
            inbox: Rc::new(RefCell::new(VecDeque::new())),
            generation: 0,
        }
    }

    /// Current state.
    pub fn state(&self) -> State {
        self.state
    }

    /// Returns `true` while an update request is armed.
    pub fn is_armed(&self) -> bool {
        self.request.is_some()
    }

    /// Shared attribute subscription of a watch-mode update.
    pub fn watch_subscription(&self) -> Option<SubscriptionId> {
        match self.mode {
            Some(Mode::Watch(id)) => Some(id),
            _ => None,
        }
    }

    /// Image being downloaded, once its metadata was accepted.
    pub fn descriptor(&self) -> Option<&FirmwareDescriptor> {
        self.descriptor.as_ref()
    }

    /// `(chunks stored, chunks total)` while downloading.
    pub fn progress(&self) -> Option<(usize, usize)> {
        self.engine
            .as_ref()
            .map(|engine| (engine.current_chunk(), engine.num_chunks()))
    }

    /// Title and version of the running image as last reported.
    pub fn current_firmware(&self) -> Option<(&str, &str)> {
        self.installed
            .as_ref()
            .map(|(title, version)| (title.as_str(), version.as_str()))
    }

    /// Fetches the firmware attributes once and updates if they describe a
    /// new image.
    pub fn start<T: Transport + ?Sized>(
        &mut self,
        transport: &mut T,
        attributes: &mut AttributeRequestService,
        shared: &mut SharedAttributeSubscriptionService,
        request: UpdateRequest,
        now: Instant,
    ) -> Result<(), Error> {
        self.admit(transport, attributes, shared, &request)?;
        publish_current(transport, &request.current_title, &request.current_version)?;

        let generation = self.next_generation();
        let on_metadata = Rc::clone(&self.inbox);
        let on_timeout = Rc::clone(&self.inbox);
        let callbacks = ResponseCallbacks::new(move |metadata| {
            on_metadata
                .borrow_mut()
                .push_back((generation, Notice::Metadata(metadata.clone())));
        })
        .with_timeout(move || {
            on_timeout
                .borrow_mut()
                .push_back((generation, Notice::MetadataTimeout));
        });
        let id = attributes.request_shared_attributes(
            transport,
            &FIRMWARE_KEYS,
            callbacks,
            self.options.metadata_timeout,
            now,
        )?;

        log::info!(
            "requested firmware info, running {} {}",
            request.current_title,
            request.current_version
        );
        self.arm(request, Mode::OneShot);
        self.metadata_request = Some(id);
        Ok(())
    }

    /// Watches the firmware attributes and updates on every new assignment.
    pub fn subscribe<T: Transport + ?Sized>(
        &mut self,
        transport: &mut T,
        attributes: &mut AttributeRequestService,
        shared: &mut SharedAttributeSubscriptionService,
        request: UpdateRequest,
    ) -> Result<(), Error> {
        self.admit(transport, attributes, shared, &request)?;
        publish_current(transport, &request.current_title, &request.current_version)?;

        let generation = self.next_generation();
        let inbox = Rc::clone(&self.inbox);
        let id = shared.subscribe(transport, &FIRMWARE_KEYS, move |update| {
            inbox
                .borrow_mut()
                .push_back((generation, Notice::Metadata(update.clone())));
        })?;

        log::info!(
            "watching firmware assignments, running {} {}",
            request.current_title,
            request.current_version
        );
        self.arm(request, Mode::Watch(id));
        Ok(())
    }

    /// Aborts any session and disarms the controller.
    ///
    /// An unanswered metadata request is cancelled and a watch subscription
    /// removed. Returns `false` if nothing was armed.
    pub fn stop<T: Transport + ?Sized>(
        &mut self,
        transport: &mut T,
        attributes: &mut AttributeRequestService,
        shared: &mut SharedAttributeSubscriptionService,
    ) -> bool {
        if self.request.is_none() {
            return false;
        }
        self.shutdown(transport, attributes, shared, FailureReason::Stopped);
        true
    }

    /// Handles queued metadata and metadata timeouts.
    pub fn process<T: Transport + ?Sized>(&mut self, transport: &mut T, now: Instant) {
        loop {
            let next = self.inbox.borrow_mut().pop_front();
            let Some((generation, notice)) = next else {
                break;
            };
            if generation != self.generation {
                log::debug!("dropping firmware notice of an earlier request");
                continue;
            }
            // the registry has already settled the request
            self.metadata_request = None;
            match notice {
                Notice::Metadata(update) => self.on_metadata(transport, &update, now),
                Notice::MetadataTimeout => {
                    if self.state == State::AwaitingMetadata {
                        self.conclude(transport, Err(FailureReason::MetadataTimeout.into()));
                    }
                }
            }
        }
    }

    /// Returns `true` if `topic` carries firmware chunks.
    pub fn handles(&self, topic: &str) -> bool {
        topic.starts_with(topic::FIRMWARE_RESPONSE)
    }

    /// Routes a message from the chunk topic.
    pub fn on_message<T: Transport + ?Sized>(
        &mut self,
        transport: &mut T,
        topic: &str,
        payload: &[u8],
        now: Instant,
    ) {
        match topic::parse_id(topic, topic::FIRMWARE_RESPONSE) {
            Some(index) => self.on_chunk(transport, index, payload, now),
            None => log::warn!("malformed chunk topic {}", topic),
        }
    }

    /// Handles chunk `index`.
    pub fn on_chunk<T: Transport + ?Sized>(
        &mut self,
        transport: &mut T,
        index: u32,
        bytes: &[u8],
        now: Instant,
    ) {
        let (Some(engine), Some(request)) = (self.engine.as_mut(), self.request.as_mut()) else {
            log::debug!("chunk {} outside a download", index);
            return;
        };
        let step = engine.on_chunk(transport, &mut *request.flash, index, bytes, now);
        self.advance(transport, step);
    }

    /// Re-requests an overdue chunk or fails the download.
    pub fn tick<T: Transport + ?Sized>(&mut self, transport: &mut T, now: Instant) {
        let Some(engine) = self.engine.as_mut() else {
            return;
        };
        let step = engine.tick(transport, now);
        self.advance(transport, step);
    }

    /// Restores the chunk subscription after a reconnect.
    pub fn resubscribe<T: Transport + ?Sized>(&mut self, transport: &mut T) -> Result<(), Error> {
        if self.chunk_subscribed {
            transport
                .subscribe(topic::FIRMWARE_RESPONSE_FILTER)
                .map_err(|_| Error::SubscriptionFailure)?;
        }
        Ok(())
    }

    fn admit<T: Transport + ?Sized>(
        &mut self,
        transport: &mut T,
        attributes: &mut AttributeRequestService,
        shared: &mut SharedAttributeSubscriptionService,
        request: &UpdateRequest,
    ) -> Result<(), Error> {
        request.check()?;
        if self.request.is_none() {
            return Ok(());
        }
        if !self.state.is_active() {
            // a watch between sessions gives way to the new request
            log::info!("replacing idle firmware watch");
            self.shutdown(transport, attributes, shared, FailureReason::Superseded);
            return Ok(());
        }
        match self.options.start_policy {
            StartPolicy::Reject => {
                log::warn!("firmware update already armed");
                Err(Error::SessionActive)
            }
            StartPolicy::Supersede => {
                log::info!("replacing armed firmware update");
                self.shutdown(transport, attributes, shared, FailureReason::Superseded);
                Ok(())
            }
        }
    }

    fn arm(&mut self, request: UpdateRequest, mode: Mode) {
        self.installed = Some((request.current_title.clone(), request.current_version.clone()));
        self.request = Some(request);
        self.mode = Some(mode);
        self.state = State::AwaitingMetadata;
    }

    fn next_generation(&mut self) -> u32 {
        self.generation = self.generation.wrapping_add(1);
        self.generation
    }

    fn shutdown<T: Transport + ?Sized>(
        &mut self,
        transport: &mut T,
        attributes: &mut AttributeRequestService,
        shared: &mut SharedAttributeSubscriptionService,
        reason: FailureReason,
    ) {
        if let Some(id) = self.metadata_request.take() {
            attributes.cancel(transport, id);
        }
        if self.state.is_active() {
            self.conclude(transport, Err(reason.into()));
        }
        if let Some(Mode::Watch(id)) = self.mode.take() {
            shared.remove(transport, id);
        }
        self.request = None;
        // notices already queued for this request are stale now
        self.next_generation();
    }

    fn on_metadata<T: Transport + ?Sized>(&mut self, transport: &mut T, update: &Value, now: Instant) {
        if matches!(self.state, State::Downloading | State::Verifying) {
            match self.options.start_policy {
                StartPolicy::Reject => {
                    log::warn!("firmware assignment changed during download, ignored");
                    return;
                }
                StartPolicy::Supersede => {
                    self.conclude(transport, Err(FailureReason::Superseded.into()));
                }
            }
        }
        let Some(request) = self.request.as_ref() else {
            return;
        };
        match validate(update, &request.current_title, &request.current_version) {
            Ok(descriptor) => self.begin_download(transport, descriptor, now),
            Err(rejection) => self.conclude(transport, Err(rejection)),
        }
    }

    fn begin_download<T: Transport + ?Sized>(
        &mut self,
        transport: &mut T,
        descriptor: FirmwareDescriptor,
        now: Instant,
    ) {
        let Some(request) = self.request.as_ref() else {
            return;
        };
        log::info!(
            "firmware {} {} assigned: {} bytes, {}",
            descriptor.title,
            descriptor.version,
            descriptor.total_size,
            descriptor.algorithm
        );
        let chunk_size = request.chunk_size;
        let retries = request.chunk_retries;
        let chunk_timeout = request.chunk_timeout;
        let hasher = (request.hasher)(descriptor.algorithm);
        let total_size = descriptor.total_size;
        self.descriptor = Some(descriptor);
        self.state = State::Downloading;

        if let Err(err) = transport.subscribe(topic::FIRMWARE_RESPONSE_FILTER) {
            log::error!("subscribe {} failed: {}", topic::FIRMWARE_RESPONSE_FILTER, err);
            return self.conclude(transport, Err(FailureReason::SubscriptionFailed.into()));
        }
        self.chunk_subscribed = true;

        let needed = chunk_size.saturating_add(self.options.buffer_overhead);
        let previous = transport.buffer_size();
        if previous < needed {
            if let Err(err) = transport.set_buffer_size(needed) {
                log::error!("growing buffer to {} bytes failed: {}", needed, err);
                return self.conclude(transport, Err(FailureReason::BufferResize.into()));
            }
            self.restore_buffer = Some(previous);
        }

        let begun = match self.request.as_mut() {
            Some(request) => request.flash.begin(total_size),
            None => return,
        };
        if let Err(err) = begun {
            log::error!("flash begin failed: {}", err);
            return self.conclude(transport, Err(FailureReason::Flash(err).into()));
        }
        self.flash_open = true;

        let mut engine = ChunkTransferEngine::new(total_size, chunk_size, retries, chunk_timeout, hasher);
        report(transport, Reported::Downloading, None);
        engine.start(transport, now);
        self.engine = Some(engine);
    }

    fn advance<T: Transport + ?Sized>(&mut self, transport: &mut T, step: Step) {
        match step {
            Step::Idle | Step::Retried => {}
            Step::Advanced { received, total } => self.notify_progress(received, total),
            Step::Complete => {
                if let Some((received, total)) = self.progress() {
                    self.notify_progress(received, total);
                }
                self.verify(transport);
            }
            Step::Failed(reason) => self.conclude(transport, Err(reason.into())),
        }
    }

    fn notify_progress(&mut self, received: usize, total: usize) {
        if let Some(on_progress) = self.request.as_mut().and_then(|r| r.on_progress.as_mut()) {
            on_progress(received, total);
        }
    }

    fn verify<T: Transport + ?Sized>(&mut self, transport: &mut T) {
        self.state = State::Verifying;
        report(transport, Reported::Downloaded, None);

        let Some(engine) = self.engine.take() else {
            return;
        };
        let digest = engine.into_digest();
        let Some(expected) = self.descriptor.as_ref().map(|d| d.checksum.as_str()) else {
            return;
        };
        if digest != expected {
            log::error!("checksum mismatch: announced {}, computed {}", expected, digest);
            return self.conclude(transport, Err(FailureReason::ChecksumMismatch.into()));
        }
        report(transport, Reported::Verified, None);

        report(transport, Reported::Updating, None);
        let committed = match self.request.as_mut() {
            Some(request) => request.flash.commit(),
            None => return,
        };
        if let Err(err) = committed {
            log::error!("flash commit failed: {}", err);
            return self.conclude(transport, Err(FailureReason::Flash(err).into()));
        }
        self.flash_open = false;
        self.conclude(transport, Ok(()));
    }

    fn conclude<T: Transport + ?Sized>(&mut self, transport: &mut T, outcome: Result<(), Rejection>) {
        let success = outcome.is_ok();
        match outcome {
            Ok(()) => {
                if let (Some(request), Some(descriptor)) =
                    (self.request.as_mut(), self.descriptor.as_ref())
                {
                    request.current_title.clone_from(&descriptor.title);
                    request.current_version.clone_from(&descriptor.version);
                    self.installed = Some((descriptor.title.clone(), descriptor.version.clone()));
                    log::info!("firmware updated to {} {}", descriptor.title, descriptor.version);
                    if let Err(err) =
                        publish_current(transport, &descriptor.title, &descriptor.version)
                    {
                        log::warn!("current firmware not reported: {}", err);
                    }
                }
                report(transport, Reported::Updated, None);
                self.state = State::Succeeded;
            }
            Err(rejection) => {
                if rejection.reason.is_error() {
                    log::error!("firmware update failed: {}", rejection.message);
                } else {
                    log::info!("{}", rejection.message);
                }
                if self.flash_open {
                    if let Some(Err(err)) = self.request.as_mut().map(|r| r.flash.abort()) {
                        log::warn!("flash abort failed: {}", err);
                    }
                }
                report(transport, Reported::Failed, Some(&rejection.message));
                self.state = State::Failed(rejection.reason);
            }
        }

        self.release(transport);
        if let Some(on_finished) = self.request.as_mut().and_then(|r| r.on_finished.as_mut()) {
            on_finished(success);
        }
        if self.mode == Some(Mode::OneShot) {
            self.request = None;
            self.mode = None;
        }
    }

    fn release<T: Transport + ?Sized>(&mut self, transport: &mut T) {
        self.engine = None;
        self.descriptor = None;
        self.flash_open = false;
        if let Some(size) = self.restore_buffer.take() {
            if let Err(err) = transport.set_buffer_size(size) {
                log::warn!("restoring buffer to {} bytes failed: {}", size, err);
            }
        }
        if core::mem::take(&mut self.chunk_subscribed) {
            if let Err(err) = transport.unsubscribe(topic::FIRMWARE_RESPONSE_FILTER) {
                log::warn!("unsubscribe {} failed: {}", topic::FIRMWARE_RESPONSE_FILTER, err);
            }
        }
    }
}

/// Checks firmware attributes against the running image.
///
/// The first failing check decides: missing keys, then null or mistyped
/// values, then an image that is already installed, then a foreign title,
/// then the checksum algorithm.
fn validate(update: &Value, title: &str, version: &str) -> Result<FirmwareDescriptor, Rejection> {
    let update = update.get(SHARED_RESPONSE_KEY).unwrap_or(update);
    if let Some(missing) = FIRMWARE_KEYS.iter().find(|key| update.get(**key).is_none()) {
        log::debug!("firmware info lacks {}", missing);
        return Err(FailureReason::NoFirmware.into());
    }

    let (Some(new_title), Some(new_version), Some(checksum), Some(algorithm), Some(size)) = (
        update[FW_TITLE_KEY].as_str(),
        update[FW_VERSION_KEY].as_str(),
        update[FW_CHECKSUM_KEY].as_str(),
        update[FW_CHECKSUM_ALGORITHM_KEY].as_str(),
        update[FW_SIZE_KEY].as_u64(),
    ) else {
        return Err(FailureReason::Malformed.into());
    };
    if title.is_empty() || version.is_empty() || size == 0 {
        return Err(FailureReason::Malformed.into());
    }
    let Ok(total_size) = usize::try_from(size) else {
        return Err(FailureReason::Malformed.into());
    };

    if new_title == title && new_version == version {
        return Err(Rejection::new(
            FailureReason::UpToDate,
            format!("Firmware version ({version}) already up to date"),
        ));
    }
    if new_title != title {
        return Err(Rejection::new(
            FailureReason::NotApplicable,
            format!("Firmware title ({title}) not same as received title ({new_title})"),
        ));
    }
    let Ok(parsed) = algorithm.parse::<ChecksumAlgorithm>() else {
        return Err(Rejection::new(
            FailureReason::UnsupportedAlgorithm,
            format!("Checksum algorithm ({algorithm}) is not supported"),
        ));
    };

    Ok(FirmwareDescriptor {
        title: String::from(new_title),
        version: String::from(new_version),
        checksum: String::from(checksum),
        algorithm: parsed,
        total_size,
    })
}

fn publish_current<T: Transport + ?Sized>(
    transport: &mut T,
    title: &str,
    version: &str,
) -> Result<(), Error> {
    let info = FirmwareInfo {
        current_fw_title: title,
        current_fw_version: version,
    };
    telemetry::publish_compact(transport, topic::TELEMETRY, &info)
}

fn report<T: Transport + ?Sized>(transport: &mut T, state: Reported, error: Option<&str>) {
    let status = StateReport {
        fw_state: state.as_str(),
        fw_error: error,
    };
    match telemetry::publish_compact(transport, topic::TELEMETRY, &status) {
        Ok(()) => log::debug!("fw_state {}", state.as_str()),
        Err(err) => log::warn!("fw_state {} not reported: {}", state.as_str(), err),
    }
}
