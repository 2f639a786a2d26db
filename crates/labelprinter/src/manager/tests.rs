use std::sync::Arc;
use std::time::Duration;

use image::{DynamicImage, GrayImage, Luma};
use pretty_assertions::assert_eq;
use tokio::time::Instant;
use uuid::Uuid;

use super::*;
use crate::mock::{MOCK_SERVICE, MockCentral};
use crate::preference::MemoryPreferenceStore;
use crate::protocol::tspl;
use crate::state::{PeripheralId, RadioState};
use crate::transmit::chunk_count;
use crate::transport::{Capability, CentralEvent};

const WAIT: Duration = Duration::from_secs(60);

fn config() -> ManagerConfig {
    ManagerConfig {
        label: LabelOptions::new().with_dot_width(64).with_size(1.0, 1.0),
        ..ManagerConfig::default()
    }
}

fn spawn(central: &MockCentral, store: &Arc<MemoryPreferenceStore>) -> PrinterHandle {
    ConnectionManager::spawn(Arc::new(central.clone()), store.clone(), config())
}

fn label_image(height: u32) -> DynamicImage {
    DynamicImage::ImageLuma8(GrayImage::from_fn(64, height, |x, y| {
        Luma([if (x + y) % 3 == 0 { 0 } else { 255 }])
    }))
}

fn named(name: &str) -> PeripheralRef {
    PeripheralRef::new(
        PeripheralId::from_platform_id(name),
        Some(name.to_string()),
        Some(-60),
    )
}

async fn ready(handle: &PrinterHandle) -> ConnectionState {
    handle
        .wait_for_state(ConnectionState::is_ready, WAIT)
        .await
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn restores_saved_printer_on_startup() {
    let (central, printer) = MockCentral::simulated_printer("PM-241-BT");
    let store = Arc::new(MemoryPreferenceStore::with_value(printer.id));
    let handle = spawn(&central, &store);

    let state = ready(&handle).await;
    assert_eq!(state.peripheral(), Some(&printer));
    assert_eq!(central.connect_attempts(), vec![printer.id]);
    assert_eq!(central.scan_starts(), 0);
}

#[tokio::test(start_paused = true)]
async fn scan_lists_named_devices_once_then_times_out() {
    let (central, printer) = MockCentral::simulated_printer("PM-241-BT");
    let central = central.with_advertised(PeripheralRef::new(
        PeripheralId::from_platform_id("anonymous"),
        None,
        Some(-80),
    ));
    let store = Arc::new(MemoryPreferenceStore::new());
    let handle = spawn(&central, &store);

    let started = Instant::now();
    handle.start_scanning().await.unwrap();
    assert_eq!(handle.state(), ConnectionState::Scanning);
    central.inject(CentralEvent::Discovered(printer.clone()));

    handle
        .wait_for_state(|s| *s == ConnectionState::Disconnected, WAIT)
        .await
        .unwrap();
    assert!(started.elapsed() >= DEFAULT_SCAN_TIMEOUT);
    assert!(!central.is_scanning());
    assert_eq!(handle.discovered(), vec![printer]);
}

#[tokio::test(start_paused = true)]
async fn stop_scanning_returns_to_disconnected() {
    let (central, _) = MockCentral::simulated_printer("PM-241-BT");
    let store = Arc::new(MemoryPreferenceStore::new());
    let handle = spawn(&central, &store);

    handle.start_scanning().await.unwrap();
    handle.stop_scanning().await.unwrap();
    assert_eq!(handle.state(), ConnectionState::Disconnected);
    assert!(!central.is_scanning());
}

#[tokio::test(start_paused = true)]
async fn each_scan_starts_with_an_empty_device_list() {
    let central = MockCentral::new();
    let store = Arc::new(MemoryPreferenceStore::new());
    let handle = spawn(&central, &store);
    let first = named("PM-241-A");
    let second = named("PM-241-B");

    handle.start_scanning().await.unwrap();
    central.inject(CentralEvent::Discovered(first.clone()));
    handle
        .subscribe_devices()
        .wait_for(|devices| !devices.is_empty())
        .await
        .unwrap();
    handle.stop_scanning().await.unwrap();
    assert_eq!(handle.discovered(), vec![first]);

    handle.start_scanning().await.unwrap();
    assert!(handle.discovered().is_empty());

    central.inject(CentralEvent::Discovered(second.clone()));
    handle
        .subscribe_devices()
        .wait_for(|devices| !devices.is_empty())
        .await
        .unwrap();
    assert_eq!(handle.discovered(), vec![second]);
    assert_eq!(central.scan_starts(), 2);
}

#[tokio::test(start_paused = true)]
async fn connect_stops_scan_and_freezes_device_list() {
    let (central, printer) = MockCentral::simulated_printer("PM-241-BT");
    let store = Arc::new(MemoryPreferenceStore::new());
    let handle = spawn(&central, &store);

    handle.start_scanning().await.unwrap();
    handle
        .subscribe_devices()
        .wait_for(|devices| !devices.is_empty())
        .await
        .unwrap();

    handle.connect(printer.clone()).await.unwrap();
    assert!(!central.is_scanning());
    central.inject(CentralEvent::Discovered(named("late-arrival")));

    let state = ready(&handle).await;
    assert_eq!(state.peripheral(), Some(&printer));
    assert_eq!(handle.discovered(), vec![printer.clone()]);
    assert_eq!(store.load().unwrap(), Some(printer.id));
}

#[tokio::test(start_paused = true)]
async fn connect_while_connecting_to_same_printer_is_idempotent() {
    let (central, printer) = MockCentral::simulated_printer("PM-241-BT");
    let central = central.with_connect_delay(Duration::from_secs(1));
    let store = Arc::new(MemoryPreferenceStore::new());
    let handle = spawn(&central, &store);

    handle.connect(printer.clone()).await.unwrap();
    assert!(matches!(handle.state(), ConnectionState::Connecting(_)));
    handle.connect(printer.clone()).await.unwrap();

    ready(&handle).await;
    assert_eq!(central.connect_attempts(), vec![printer.id]);
}

#[tokio::test(start_paused = true)]
async fn switching_printers_saves_the_new_one() {
    let first = named("PM-241-A");
    let second = named("PM-241-B");
    let central = MockCentral::new()
        .with_advertised(first.clone())
        .with_advertised(second.clone());
    let store = Arc::new(MemoryPreferenceStore::new());
    let handle = spawn(&central, &store);

    handle.connect(first.clone()).await.unwrap();
    ready(&handle).await;

    handle.connect(second.clone()).await.unwrap();
    let state = handle
        .wait_for_state(|s| s.is_ready() && s.peripheral().is_some_and(|p| p.id == second.id), WAIT)
        .await
        .unwrap();
    assert_eq!(state.peripheral(), Some(&second));
    assert_eq!(store.load().unwrap(), Some(second.id));
    assert_eq!(central.connected(), Some(second.id));
}

#[tokio::test(start_paused = true)]
async fn connect_failure_surfaces_error_state() {
    let (central, printer) = MockCentral::simulated_printer("PM-241-BT");
    let central = central.failing_connect("peer refused");
    let store = Arc::new(MemoryPreferenceStore::new());
    let handle = spawn(&central, &store);

    handle.connect(printer).await.unwrap();
    let state = handle
        .wait_for_state(|s| matches!(s, ConnectionState::Error(_)), WAIT)
        .await
        .unwrap();
    assert_eq!(
        state,
        ConnectionState::Error(PrinterError::ConnectionFailed("peer refused".into()))
    );
    assert_eq!(store.load().unwrap(), None);

    // an error state can be cleared by the user
    handle.disconnect().await.unwrap();
    assert_eq!(handle.state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn missing_writable_characteristic_is_an_error() {
    let (central, printer) = MockCentral::simulated_printer("PM-241-BT");
    let central = central.with_capabilities(vec![Capability {
        service: MOCK_SERVICE,
        characteristic: Uuid::from_u128(0x2a19),
        write: false,
        write_without_response: false,
    }]);
    let store = Arc::new(MemoryPreferenceStore::new());
    let handle = spawn(&central, &store);

    handle.connect(printer).await.unwrap();
    let state = handle
        .wait_for_state(|s| matches!(s, ConnectionState::Error(_)), WAIT)
        .await
        .unwrap();
    assert_eq!(state, ConnectionState::Error(PrinterError::MissingCharacteristic));
    assert_eq!(handle.print(label_image(8)).await.unwrap_err(), PrinterError::NotReady);
}

#[tokio::test(start_paused = true)]
async fn print_writes_the_encoded_frame_in_order() {
    let (central, printer) = MockCentral::simulated_printer("PM-241-BT");
    let store = Arc::new(MemoryPreferenceStore::with_value(printer.id));
    let handle = spawn(&central, &store);
    ready(&handle).await;

    let image = label_image(120);
    let expected = tspl::encode(&image, &config().label).unwrap();
    let mut notices = handle.subscribe_notices();

    let ticket = handle.print(image).await.unwrap();
    let job = ticket.job();
    let report = ticket.wait().await.unwrap();

    assert_eq!(report.bytes, expected.len());
    assert_eq!(report.chunks, chunk_count(expected.len(), 180));
    assert!(central.writes().iter().all(|chunk| chunk.len() <= 180));
    assert_eq!(central.written_bytes(), expected.into_bytes());

    let notice = notices.recv().await.unwrap();
    assert_eq!(notice.job, job);
    assert_eq!(notice.outcome, Ok(report));
}

#[tokio::test(start_paused = true)]
async fn second_print_is_rejected_while_transfer_runs() {
    let (central, printer) = MockCentral::simulated_printer("PM-241-BT");
    let central = central.with_write_delay(Duration::from_millis(5));
    let store = Arc::new(MemoryPreferenceStore::with_value(printer.id));
    let handle = spawn(&central, &store);
    ready(&handle).await;

    let first = handle.print(label_image(200)).await.unwrap();
    assert_eq!(
        handle.print(label_image(8)).await.unwrap_err(),
        PrinterError::NotReady
    );

    let expected = tspl::encode(&label_image(200), &config().label).unwrap();
    first.wait().await.unwrap();
    assert_eq!(central.written_bytes(), expected.into_bytes());

    // slot is free again once the first job has completed
    let next = handle.print(label_image(8)).await.unwrap();
    next.wait().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn peripheral_disconnect_aborts_transfer_and_keeps_preference() {
    let (central, printer) = MockCentral::simulated_printer("PM-241-BT");
    let central = central.with_write_delay(Duration::from_millis(5));
    let store = Arc::new(MemoryPreferenceStore::with_value(printer.id));
    let handle = spawn(&central, &store);
    ready(&handle).await;

    let ticket = handle.print(label_image(400)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(12)).await;
    central.drop_connection();

    assert_eq!(ticket.wait().await, Err(PrinterError::TransferAborted));
    handle
        .wait_for_state(|s| *s == ConnectionState::Disconnected, WAIT)
        .await
        .unwrap();
    assert_eq!(store.load().unwrap(), Some(printer.id));
    assert!(central.written_bytes().len() < 400 * 8);
    assert_eq!(
        handle.print(label_image(8)).await.unwrap_err(),
        PrinterError::NotReady
    );
}

#[tokio::test(start_paused = true)]
async fn user_disconnect_forgets_printer() {
    let (central, printer) = MockCentral::simulated_printer("PM-241-BT");
    let store = Arc::new(MemoryPreferenceStore::with_value(printer.id));
    let handle = spawn(&central, &store);
    ready(&handle).await;

    handle.disconnect().await.unwrap();
    assert_eq!(handle.state(), ConnectionState::Disconnected);
    assert_eq!(store.load().unwrap(), None);
    assert_eq!(central.connected(), None);
    assert_eq!(
        handle.print(label_image(8)).await.unwrap_err(),
        PrinterError::NotReady
    );

    // nothing left to tear down
    handle.disconnect().await.unwrap();
    assert_eq!(handle.state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn radio_cycle_reconnects_known_printer() {
    let (central, printer) = MockCentral::simulated_printer("PM-241-BT");
    let store = Arc::new(MemoryPreferenceStore::with_value(printer.id));
    let handle = spawn(&central, &store);
    ready(&handle).await;

    central.set_radio(RadioState::PoweredOff);
    handle
        .wait_for_state(|s| *s == ConnectionState::RadioOff, WAIT)
        .await
        .unwrap();
    assert_eq!(
        handle.print(label_image(8)).await.unwrap_err(),
        PrinterError::NotReady
    );
    assert_eq!(
        handle.start_scanning().await.unwrap_err(),
        PrinterError::RadioUnavailable
    );

    central.set_radio(RadioState::PoweredOn);
    ready(&handle).await;
    assert_eq!(central.connect_attempts(), vec![printer.id, printer.id]);
    assert_eq!(store.load().unwrap(), Some(printer.id));
}

#[tokio::test(start_paused = true)]
async fn unknown_saved_printer_falls_back_to_scan() {
    let printer = named("PM-241-BT");
    let central = MockCentral::new().with_advertised(printer.clone());
    let store = Arc::new(MemoryPreferenceStore::with_value(printer.id));
    let handle = spawn(&central, &store);

    handle
        .wait_for_state(|s| *s == ConnectionState::Scanning, WAIT)
        .await
        .unwrap();
    assert_eq!(central.scan_starts(), 1);
    assert!(central.connect_attempts().is_empty());
}

#[tokio::test(start_paused = true)]
async fn connect_to_vanished_printer_falls_back_to_scan() {
    let (central, printer) = MockCentral::simulated_printer("PM-241-BT");
    let central = central.with_vanished(printer.id);
    let store = Arc::new(MemoryPreferenceStore::new());
    let handle = spawn(&central, &store);

    handle.connect(printer.clone()).await.unwrap();
    handle
        .wait_for_state(|s| *s == ConnectionState::Scanning, WAIT)
        .await
        .unwrap();
    assert_eq!(central.connect_attempts(), vec![printer.id]);
    assert_eq!(central.scan_starts(), 1);
    assert!(central.is_scanning());
    assert_eq!(store.load().unwrap(), None);

    handle
        .subscribe_devices()
        .wait_for(|devices| !devices.is_empty())
        .await
        .unwrap();
    assert_eq!(handle.discovered(), vec![printer]);
}

#[tokio::test(start_paused = true)]
async fn unauthorized_radio_is_an_error() {
    let central = MockCentral::new().with_radio(RadioState::Unauthorized);
    let store = Arc::new(MemoryPreferenceStore::new());
    let handle = spawn(&central, &store);

    handle
        .wait_for_state(
            |s| *s == ConnectionState::Error(PrinterError::RadioUnavailable),
            WAIT,
        )
        .await
        .unwrap();
    assert_eq!(
        handle.start_scanning().await.unwrap_err(),
        PrinterError::RadioUnavailable
    );
}

#[tokio::test(start_paused = true)]
async fn powered_off_radio_rejects_scan_and_connect() {
    let (central, printer) = MockCentral::simulated_printer("PM-241-BT");
    let central = central.with_radio(RadioState::PoweredOff);
    let store = Arc::new(MemoryPreferenceStore::new());
    let handle = spawn(&central, &store);

    handle
        .wait_for_state(|s| *s == ConnectionState::RadioOff, WAIT)
        .await
        .unwrap();
    assert_eq!(
        handle.start_scanning().await.unwrap_err(),
        PrinterError::RadioUnavailable
    );
    assert_eq!(
        handle.connect(printer).await.unwrap_err(),
        PrinterError::RadioUnavailable
    );
}

#[tokio::test(start_paused = true)]
async fn scanning_while_connected_is_rejected() {
    let (central, printer) = MockCentral::simulated_printer("PM-241-BT");
    let store = Arc::new(MemoryPreferenceStore::with_value(printer.id));
    let handle = spawn(&central, &store);
    ready(&handle).await;

    assert_eq!(
        handle.start_scanning().await.unwrap_err(),
        PrinterError::AlreadyConnected("PM-241-BT".into())
    );
    assert!(handle.state().is_ready());
}

#[tokio::test(start_paused = true)]
async fn wait_for_state_times_out() {
    let central = MockCentral::new();
    let store = Arc::new(MemoryPreferenceStore::new());
    let handle = spawn(&central, &store);

    assert_eq!(
        handle
            .wait_for_state(ConnectionState::is_ready, Duration::from_secs(2))
            .await,
        Err(PrinterError::Timeout(2000))
    );
}
