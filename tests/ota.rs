mod common;

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use cloudlink::config::StartPolicy;
use cloudlink::ota::{
    ChecksumAlgorithm, FailureReason, State, UpdateRequest, software_hasher,
};
use cloudlink::{Config, Device, Error, Instant, topic};
use serde_json::{Value, json};

use common::{FlashLog, MockTransport, RamFlash, fixed_hasher};

const T0: Instant = Instant::from_millis(0);

fn device() -> Device<MockTransport> {
    Device::new(MockTransport::new(), Config::default())
}

fn assignment(version: &str, size: usize, checksum: &str) -> Value {
    json!({
        "fw_title": "fw",
        "fw_version": version,
        "fw_checksum": checksum,
        "fw_checksum_algorithm": "SHA256",
        "fw_size": size
    })
}

fn request(flash: &RamFlash) -> UpdateRequest {
    let mut request = UpdateRequest::new("fw", "1.0", flash.clone());
    request.hasher = fixed_hasher;
    request
}

fn answer_metadata(device: &mut Device<MockTransport>, metadata: Value, now: Instant) {
    let id = device.transport().last_request_id(topic::ATTRIBUTE_REQUEST);
    let body = serde_json::to_vec(&json!({ "shared": metadata })).unwrap();
    device
        .on_message(&format!("{}{}", topic::ATTRIBUTE_RESPONSE, id), &body, now)
        .unwrap();
}

fn send_chunk(device: &mut Device<MockTransport>, index: u32, bytes: &[u8], now: Instant) {
    device
        .on_message(&format!("{}{}", topic::FIRMWARE_RESPONSE, index), bytes, now)
        .unwrap();
}

fn flash_log(flash: &RamFlash) -> std::cell::Ref<'_, FlashLog> {
    flash.log.borrow()
}

#[test]
fn test_start_requests_firmware_attributes() {
    let flash = RamFlash::default();
    let mut device = device();
    device.start_firmware_update(request(&flash), T0).unwrap();

    let transport = device.transport();
    assert_eq!(
        transport.telemetry()[0],
        json!({ "current_fw_title": "fw", "current_fw_version": "1.0" })
    );
    let (request_topic, body) = transport.last_json();
    assert_eq!(request_topic, "v1/devices/me/attributes/request/1");
    assert_eq!(
        body,
        json!({ "sharedKeys": "fw_checksum,fw_checksum_algorithm,fw_size,fw_title,fw_version" })
    );
    assert!(transport.is_subscribed(topic::ATTRIBUTE_RESPONSE_FILTER));
    assert_eq!(device.firmware_state(), State::AwaitingMetadata);
}

#[test]
fn test_update_end_to_end() {
    let flash = RamFlash::default();
    let progress = Rc::new(RefCell::new(Vec::new()));
    let finished = Rc::new(Cell::new(None));
    let progress_sink = progress.clone();
    let finished_sink = finished.clone();
    let update = request(&flash)
        .with_progress(move |chunk, total| progress_sink.borrow_mut().push((chunk, total)))
        .with_finished(move |success| finished_sink.set(Some(success)));

    let mut device = device();
    device.start_firmware_update(update, T0).unwrap();
    answer_metadata(&mut device, assignment("2.0", 8192, "abc123"), T0);

    assert_eq!(device.firmware_state(), State::Downloading);
    assert!(device.transport().is_subscribed(topic::FIRMWARE_RESPONSE_FILTER));
    assert_eq!(device.transport().buffer_size, 4096 + 50);
    let (request_topic, size) = device.transport().published.last().unwrap().clone();
    assert_eq!(request_topic, "v2/fw/request/0/chunk/0");
    assert_eq!(size, b"4096");

    send_chunk(&mut device, 0, &[0xAA; 4096], T0);
    assert_eq!(device.ota().progress(), Some((1, 2)));
    send_chunk(&mut device, 1, &[0x55; 4096], T0);

    assert_eq!(device.firmware_state(), State::Succeeded);
    assert_eq!(device.transport().chunk_requests(), vec![0, 1]);
    assert_eq!(device.ota().current_firmware(), Some(("fw", "2.0")));
    assert_eq!(
        device.transport().fw_states(),
        vec!["DOWNLOADING", "DOWNLOADED", "VERIFIED", "UPDATING", "UPDATED"]
    );
    assert!(
        device
            .transport()
            .telemetry()
            .contains(&json!({ "current_fw_title": "fw", "current_fw_version": "2.0" }))
    );

    let log = flash_log(&flash);
    assert_eq!(log.begun, Some(8192));
    assert_eq!(log.image.len(), 8192);
    assert!(log.committed);
    assert!(!log.aborted);

    assert_eq!(*progress.borrow(), vec![(1, 2), (2, 2)]);
    assert_eq!(finished.get(), Some(true));

    // cleanup
    assert_eq!(device.transport().buffer_size, 256);
    assert!(!device.transport().is_subscribed(topic::FIRMWARE_RESPONSE_FILTER));
    assert!(!device.ota().is_armed());
}

#[test]
fn test_update_with_real_digest() {
    let image: Vec<u8> = (0u8..10).collect();
    let mut hasher = software_hasher(ChecksumAlgorithm::Sha256);
    hasher.update(&image);
    let checksum = hasher.digest_hex();

    let flash = RamFlash::default();
    let mut update = UpdateRequest::new("fw", "1.0", flash.clone());
    update.chunk_size = 4;

    let mut device = device();
    device.start_firmware_update(update, T0).unwrap();
    answer_metadata(&mut device, assignment("1.1", image.len(), &checksum), T0);
    for (index, chunk) in image.chunks(4).enumerate() {
        send_chunk(&mut device, index as u32, chunk, T0);
    }

    assert_eq!(device.firmware_state(), State::Succeeded);
    assert_eq!(device.transport().chunk_requests(), vec![0, 1, 2]);
    assert_eq!(flash_log(&flash).image, image);
}

#[test]
fn test_checksum_mismatch_aborts_image() {
    let flash = RamFlash::default();
    let finished = Rc::new(Cell::new(None));
    let finished_sink = finished.clone();
    let update = request(&flash).with_finished(move |success| finished_sink.set(Some(success)));

    let mut device = device();
    device.start_firmware_update(update, T0).unwrap();
    answer_metadata(&mut device, assignment("2.0", 8192, "zzz999"), T0);
    send_chunk(&mut device, 0, &[0; 4096], T0);
    send_chunk(&mut device, 1, &[0; 4096], T0);

    assert_eq!(
        device.firmware_state(),
        State::Failed(FailureReason::ChecksumMismatch)
    );
    let log = flash_log(&flash);
    assert!(!log.committed);
    assert!(log.aborted);
    assert_eq!(finished.get(), Some(false));
    assert_eq!(device.transport().fw_states().last().unwrap(), "FAILED");
    assert_eq!(
        device.transport().last_fw_error().as_deref(),
        Some("Checksum verification failed")
    );
    assert_eq!(device.ota().current_firmware(), Some(("fw", "1.0")));
}

#[test]
fn test_retries_exhausted_without_advancing() {
    let flash = RamFlash::default();
    let mut update = request(&flash);
    update.chunk_retries = 3;

    let mut device = device();
    device.start_firmware_update(update, T0).unwrap();
    answer_metadata(&mut device, assignment("2.0", 10000, "abc123"), T0);
    assert_eq!(device.ota().progress(), Some((0, 3)));

    send_chunk(&mut device, 0, &[0; 4096], T0);
    assert_eq!(device.ota().progress(), Some((1, 3)));

    device.tick(Instant::from_millis(4_999));
    assert_eq!(device.transport().chunk_requests(), vec![0, 1]);

    device.tick(Instant::from_millis(5_000));
    device.tick(Instant::from_millis(10_000));
    assert_eq!(device.ota().progress(), Some((1, 3)));
    assert_eq!(device.firmware_state(), State::Downloading);

    device.tick(Instant::from_millis(15_000));
    assert_eq!(
        device.firmware_state(),
        State::Failed(FailureReason::RetriesExhausted)
    );
    assert_eq!(device.transport().chunk_requests(), vec![0, 1, 1, 1]);
    assert!(flash_log(&flash).aborted);
    assert!(!device.transport().is_subscribed(topic::FIRMWARE_RESPONSE_FILTER));
}

#[test]
fn test_retry_budget_refills_after_each_chunk() {
    let flash = RamFlash::default();
    let mut update = request(&flash);
    update.chunk_retries = 2;
    update.chunk_timeout = Duration::from_millis(100);

    let mut device = device();
    device.start_firmware_update(update, T0).unwrap();
    answer_metadata(&mut device, assignment("2.0", 8192, "abc123"), T0);

    device.tick(Instant::from_millis(100));
    send_chunk(&mut device, 0, &[0; 4096], Instant::from_millis(150));
    device.tick(Instant::from_millis(250));
    send_chunk(&mut device, 1, &[0; 4096], Instant::from_millis(300));

    assert_eq!(device.firmware_state(), State::Succeeded);
    assert_eq!(device.transport().chunk_requests(), vec![0, 0, 1, 1]);
}

#[test]
fn test_unexpected_chunk_index_is_ignored() {
    let flash = RamFlash::default();
    let mut device = device();
    device.start_firmware_update(request(&flash), T0).unwrap();
    answer_metadata(&mut device, assignment("2.0", 8192, "abc123"), T0);

    send_chunk(&mut device, 1, &[0; 4096], T0);

    assert_eq!(device.firmware_state(), State::Downloading);
    assert_eq!(device.ota().progress(), Some((0, 2)));
    assert!(flash_log(&flash).image.is_empty());
}

#[test]
fn test_oversized_chunk_fails() {
    let flash = RamFlash::default();
    let mut device = device();
    device.start_firmware_update(request(&flash), T0).unwrap();
    answer_metadata(&mut device, assignment("2.0", 5000, "abc123"), T0);

    send_chunk(&mut device, 0, &[0; 4096], T0);
    send_chunk(&mut device, 1, &[0; 1000], T0);

    assert_eq!(
        device.firmware_state(),
        State::Failed(FailureReason::ChunkOverflow)
    );
}

#[test]
fn test_short_chunk_is_requested_again() {
    let flash = RamFlash::default();
    let mut device = device();
    device.start_firmware_update(request(&flash), T0).unwrap();
    answer_metadata(&mut device, assignment("2.0", 8192, "abc123"), T0);

    send_chunk(&mut device, 0, &[0; 100], T0);

    assert_eq!(device.firmware_state(), State::Downloading);
    assert_eq!(device.transport().chunk_requests(), vec![0, 0]);
    assert!(flash_log(&flash).image.is_empty());
}

#[test]
fn test_write_failure_is_terminal() {
    let flash = RamFlash::failing();
    let mut device = device();
    device.start_firmware_update(request(&flash), T0).unwrap();
    answer_metadata(&mut device, assignment("2.0", 8192, "abc123"), T0);

    send_chunk(&mut device, 0, &[0; 4096], T0);

    assert!(matches!(
        device.firmware_state(),
        State::Failed(FailureReason::Flash(_))
    ));
    assert_eq!(device.transport().chunk_requests(), vec![0]);
    assert!(flash_log(&flash).aborted);
}

#[test]
fn test_null_title_is_malformed() {
    let flash = RamFlash::default();
    let mut device = device();
    device.start_firmware_update(request(&flash), T0).unwrap();
    let mut metadata = assignment("2.0", 8192, "abc123");
    metadata["fw_title"] = Value::Null;
    answer_metadata(&mut device, metadata, T0);

    assert_eq!(device.firmware_state(), State::Failed(FailureReason::Malformed));
    assert!(device.transport().chunk_requests().is_empty());
    assert_eq!(
        device.transport().last_fw_error().as_deref(),
        Some("Firmware info is empty or malformed")
    );
    assert!(flash_log(&flash).begun.is_none());
}

#[test]
fn test_missing_attributes_mean_no_firmware() {
    let flash = RamFlash::default();
    let mut device = device();
    device.start_firmware_update(request(&flash), T0).unwrap();
    answer_metadata(&mut device, json!({}), T0);

    assert_eq!(device.firmware_state(), State::Failed(FailureReason::NoFirmware));
    assert_eq!(
        device.transport().last_fw_error().as_deref(),
        Some("No new firmware assigned on the given device")
    );
}

#[test]
fn test_up_to_date_requests_no_chunk() {
    let flash = RamFlash::default();
    let mut device = device();
    device.start_firmware_update(request(&flash), T0).unwrap();
    answer_metadata(&mut device, assignment("1.0", 8192, "abc123"), T0);

    let state = device.firmware_state();
    assert_eq!(state, State::Failed(FailureReason::UpToDate));
    assert!(!FailureReason::UpToDate.is_error());
    assert!(device.transport().chunk_requests().is_empty());
    assert!(!device.transport().is_subscribed(topic::FIRMWARE_RESPONSE_FILTER));
    assert_eq!(device.transport().fw_states(), vec!["FAILED"]);
    assert_eq!(
        device.transport().last_fw_error().as_deref(),
        Some("Firmware version (1.0) already up to date")
    );
}

#[test]
fn test_metadata_timeout() {
    let flash = RamFlash::default();
    let mut device = device();
    device.start_firmware_update(request(&flash), T0).unwrap();

    device.tick(Instant::from_millis(5_000));

    assert_eq!(
        device.firmware_state(),
        State::Failed(FailureReason::MetadataTimeout)
    );
    assert!(!device.ota().is_armed());
}

#[test]
fn test_buffer_resize_failure_is_terminal() {
    let flash = RamFlash::default();
    let mut transport = MockTransport::new();
    transport.max_buffer_size = 1024;
    let mut device = Device::new(transport, Config::default());
    device.start_firmware_update(request(&flash), T0).unwrap();
    answer_metadata(&mut device, assignment("2.0", 8192, "abc123"), T0);

    assert_eq!(
        device.firmware_state(),
        State::Failed(FailureReason::BufferResize)
    );
    assert_eq!(device.transport().buffer_size, 256);
    assert!(!device.transport().is_subscribed(topic::FIRMWARE_RESPONSE_FILTER));
    assert!(device.transport().chunk_requests().is_empty());
}

#[test]
fn test_start_rejects_empty_version() {
    let mut device = device();
    let result = device.start_firmware_update(UpdateRequest::new("fw", "", RamFlash::default()), T0);

    assert!(matches!(result, Err(Error::InvalidArgument(_))));
    assert!(device.transport().published.is_empty());
    assert_eq!(device.firmware_state(), State::Idle);
}

#[test]
fn test_second_start_is_rejected() {
    let mut device = device();
    device
        .start_firmware_update(request(&RamFlash::default()), T0)
        .unwrap();

    let result = device.start_firmware_update(request(&RamFlash::default()), T0);

    assert_eq!(result, Err(Error::SessionActive));
    assert_eq!(device.firmware_state(), State::AwaitingMetadata);
}

#[test]
fn test_second_start_supersedes() {
    let mut config = Config::default();
    config.ota.start_policy = StartPolicy::Supersede;
    let mut device = Device::new(MockTransport::new(), config);

    let finished = Rc::new(Cell::new(None));
    let finished_sink = finished.clone();
    let first = request(&RamFlash::default()).with_finished(move |ok| finished_sink.set(Some(ok)));
    device.start_firmware_update(first, T0).unwrap();
    let first_id = device.transport().last_request_id(topic::ATTRIBUTE_REQUEST);

    let flash = RamFlash::default();
    device.start_firmware_update(request(&flash), T0).unwrap();
    assert_eq!(finished.get(), Some(false));

    // the answer to the superseded request changes nothing
    let body = serde_json::to_vec(&json!({ "shared": assignment("2.0", 8192, "abc123") })).unwrap();
    device
        .on_message(&format!("{}{}", topic::ATTRIBUTE_RESPONSE, first_id), &body, T0)
        .unwrap();
    assert_eq!(device.firmware_state(), State::AwaitingMetadata);

    answer_metadata(&mut device, assignment("2.0", 8192, "abc123"), T0);
    assert_eq!(device.firmware_state(), State::Downloading);
}

#[test]
fn test_subscribed_update_stays_armed() {
    let flash = RamFlash::default();
    let mut device = device();
    device.subscribe_firmware_update(request(&flash)).unwrap();
    assert!(device.transport().is_subscribed(topic::ATTRIBUTES));

    let update = serde_json::to_vec(&assignment("2.0", 4096, "abc123")).unwrap();
    device.on_message(topic::ATTRIBUTES, &update, T0).unwrap();
    send_chunk(&mut device, 0, &[1; 4096], T0);

    assert_eq!(device.firmware_state(), State::Succeeded);
    assert!(device.ota().is_armed());

    // the new image is now the running one
    device.on_message(topic::ATTRIBUTES, &update, T0).unwrap();
    assert_eq!(device.firmware_state(), State::Failed(FailureReason::UpToDate));

    let next = serde_json::to_vec(&assignment("3.0", 4096, "abc123")).unwrap();
    device.on_message(topic::ATTRIBUTES, &next, T0).unwrap();
    assert_eq!(device.firmware_state(), State::Downloading);
}

#[test]
fn test_stop_aborts_download() {
    let flash = RamFlash::default();
    let mut device = device();
    device.subscribe_firmware_update(request(&flash)).unwrap();
    let update = serde_json::to_vec(&assignment("2.0", 8192, "abc123")).unwrap();
    device.on_message(topic::ATTRIBUTES, &update, T0).unwrap();
    send_chunk(&mut device, 0, &[1; 4096], T0);

    assert!(device.stop_firmware_update());

    assert_eq!(device.firmware_state(), State::Failed(FailureReason::Stopped));
    assert!(flash_log(&flash).aborted);
    assert!(!device.ota().is_armed());
    assert!(!device.transport().is_subscribed(topic::ATTRIBUTES));
    assert!(!device.transport().is_subscribed(topic::FIRMWARE_RESPONSE_FILTER));
    assert!(!device.stop_firmware_update());

    // late chunks are dropped
    send_chunk(&mut device, 1, &[1; 4096], T0);
    assert_eq!(device.firmware_state(), State::Failed(FailureReason::Stopped));
}

#[test]
fn test_start_after_watch_session_ended() {
    let mut device = device();
    device.subscribe_firmware_update(request(&RamFlash::default())).unwrap();
    let running = serde_json::to_vec(&assignment("1.0", 4096, "abc123")).unwrap();
    device.on_message(topic::ATTRIBUTES, &running, T0).unwrap();
    assert_eq!(device.firmware_state(), State::Failed(FailureReason::UpToDate));

    let flash = RamFlash::default();
    device.start_firmware_update(request(&flash), T0).unwrap();

    assert_eq!(device.firmware_state(), State::AwaitingMetadata);
    assert_eq!(device.ota().watch_subscription(), None);
    assert!(!device.transport().is_subscribed(topic::ATTRIBUTES));

    answer_metadata(&mut device, assignment("2.0", 4096, "abc123"), T0);
    send_chunk(&mut device, 0, &[7; 4096], T0);
    assert_eq!(device.firmware_state(), State::Succeeded);
    assert!(flash_log(&flash).committed);
}

#[test]
fn test_clearing_shared_subscriptions_stops_watch() {
    let finished = Rc::new(Cell::new(None));
    let finished_sink = finished.clone();
    let watch = request(&RamFlash::default()).with_finished(move |ok| finished_sink.set(Some(ok)));
    let mut device = device();
    device.subscribe_firmware_update(watch).unwrap();

    device.unsubscribe_shared_attributes();

    assert!(!device.ota().is_armed());
    assert_eq!(device.firmware_state(), State::Failed(FailureReason::Stopped));
    assert_eq!(finished.get(), Some(false));

    let update = serde_json::to_vec(&assignment("2.0", 4096, "abc123")).unwrap();
    device.on_message(topic::ATTRIBUTES, &update, T0).unwrap();
    assert_eq!(device.firmware_state(), State::Failed(FailureReason::Stopped));

    device
        .start_firmware_update(request(&RamFlash::default()), T0)
        .unwrap();
    assert_eq!(device.firmware_state(), State::AwaitingMetadata);
}

#[test]
fn test_removing_watch_subscription_stops_watch() {
    let mut device = device();
    device.subscribe_firmware_update(request(&RamFlash::default())).unwrap();
    let id = device.ota().watch_subscription().unwrap();

    assert!(device.remove_shared_subscription(id));

    assert!(!device.ota().is_armed());
    assert!(!device.transport().is_subscribed(topic::ATTRIBUTES));
    assert!(!device.remove_shared_subscription(id));
}

#[test]
fn test_stop_while_awaiting_metadata() {
    let finished = Rc::new(Cell::new(0));
    let finished_sink = finished.clone();
    let update = request(&RamFlash::default())
        .with_finished(move |_| finished_sink.set(finished_sink.get() + 1));
    let mut device = device();
    device.start_firmware_update(update, T0).unwrap();
    let id = device.transport().last_request_id(topic::ATTRIBUTE_REQUEST);

    assert!(device.stop_firmware_update());

    assert_eq!(device.firmware_state(), State::Failed(FailureReason::Stopped));
    assert!(!device.transport().is_subscribed(topic::ATTRIBUTE_RESPONSE_FILTER));

    // neither the late answer nor the deadline reaches the stopped session
    let body = serde_json::to_vec(&json!({ "shared": assignment("2.0", 4096, "abc123") })).unwrap();
    device
        .on_message(&format!("{}{}", topic::ATTRIBUTE_RESPONSE, id), &body, T0)
        .unwrap();
    device.tick(T0 + Duration::from_secs(60));
    assert_eq!(device.firmware_state(), State::Failed(FailureReason::Stopped));
    assert_eq!(finished.get(), 1);
}
