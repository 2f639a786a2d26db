use std::sync::Arc;

use futures::StreamExt;
use futures::stream::BoxStream;
use image::DynamicImage;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use super::{Command, ManagerConfig, PrintNotice, PrintTicket};
use crate::label::LabelOptions;
use crate::preference::PreferenceStore;
use crate::protocol::tspl;
use crate::state::{ConnectionState, PeripheralId, PeripheralRef, RadioState};
use crate::transmit::{self, TransferReport, TransmitOptions};
use crate::transport::{self, Central, CentralEvent, Session, WritableEndpoint};
use crate::{PrinterError, Result};

/// Completions reported back by tasks the actor spawned.
pub(super) enum Internal {
    ConnectFinished {
        attempt: u64,
        peripheral: PeripheralRef,
        result: Result<Arc<dyn Session>>,
    },
    EndpointResolved {
        attempt: u64,
        result: Result<Option<Arc<dyn WritableEndpoint>>>,
    },
    ScanTimedOut {
        scan: u64,
    },
    TransferFinished {
        job: u64,
    },
}

struct ActiveTransfer {
    job: u64,
    cancel: CancellationToken,
}

pub(super) struct Actor {
    central: Arc<dyn Central>,
    store: Arc<dyn PreferenceStore>,
    config: ManagerConfig,
    state_tx: watch::Sender<ConnectionState>,
    devices_tx: watch::Sender<Vec<PeripheralRef>>,
    notices_tx: broadcast::Sender<PrintNotice>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    radio: RadioState,
    /// Scan generation; a timer only ends the scan it was started for.
    scan: u64,
    /// Connection attempt generation; completions from older attempts are stale.
    attempt: u64,
    session: Option<Arc<dyn Session>>,
    endpoint: Option<Arc<dyn WritableEndpoint>>,
    transfer: Option<ActiveTransfer>,
    next_job: u64,
}

impl Actor {
    pub(super) fn new(
        central: Arc<dyn Central>,
        store: Arc<dyn PreferenceStore>,
        config: ManagerConfig,
        state_tx: watch::Sender<ConnectionState>,
        devices_tx: watch::Sender<Vec<PeripheralRef>>,
        notices_tx: broadcast::Sender<PrintNotice>,
        internal_tx: mpsc::UnboundedSender<Internal>,
    ) -> Self {
        Self {
            central,
            store,
            config,
            state_tx,
            devices_tx,
            notices_tx,
            internal_tx,
            radio: RadioState::Unknown,
            scan: 0,
            attempt: 0,
            session: None,
            endpoint: None,
            transfer: None,
            next_job: 0,
        }
    }

    pub(super) async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
    ) {
        let mut events = match self.central.events().await {
            Ok(stream) => Some(stream),
            Err(err) => {
                tracing::error!(error = %err, "Failed to subscribe to BLE events");
                None
            }
        };

        match self.central.radio_state().await {
            Ok(radio) => self.on_radio(radio).await,
            Err(err) => tracing::warn!(error = %err, "Could not read radio state"),
        }

        loop {
            tokio::select! {
                biased;
                Some(done) = internal.recv() => self.on_internal(done).await,
                event = next_event(&mut events) => match event {
                    Some(event) => self.on_event(event).await,
                    None => {
                        tracing::warn!("BLE event stream ended");
                        events = None;
                    }
                },
                command = commands.recv() => match command {
                    Some(command) => self.on_command(command).await,
                    None => break,
                },
            }
        }

        self.shutdown().await;
    }

    fn state(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }

    fn set_state(&self, next: ConnectionState) {
        let changed = self.state_tx.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next.clone();
            true
        });
        if changed {
            tracing::info!(state = next.label(), detail = ?next, "Connection state changed");
        }
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::StartScanning(reply) => {
                let _ = reply.send(self.start_scanning().await);
            }
            Command::StopScanning(reply) => {
                self.stop_scanning().await;
                let _ = reply.send(());
            }
            Command::Connect(peripheral, reply) => {
                let _ = reply.send(self.connect(peripheral).await);
            }
            Command::Disconnect(reply) => {
                self.disconnect().await;
                let _ = reply.send(());
            }
            Command::Print(image, reply) => {
                let _ = reply.send(self.print(*image));
            }
            Command::RestoreLastConnection(reply) => {
                self.restore_last_connection().await;
                let _ = reply.send(());
            }
        }
    }

    async fn on_event(&mut self, event: CentralEvent) {
        match event {
            CentralEvent::RadioChanged(radio) => self.on_radio(radio).await,
            CentralEvent::Discovered(peripheral) => self.on_discovered(peripheral),
            CentralEvent::Disconnected(id) => self.on_peripheral_disconnected(id),
        }
    }

    async fn on_internal(&mut self, done: Internal) {
        match done {
            Internal::ConnectFinished {
                attempt,
                peripheral,
                result,
            } => self.on_connect_finished(attempt, peripheral, result).await,
            Internal::EndpointResolved { attempt, result } => {
                self.on_endpoint_resolved(attempt, result)
            }
            Internal::ScanTimedOut { scan } => self.on_scan_timeout(scan).await,
            Internal::TransferFinished { job } => {
                if self.transfer.as_ref().is_some_and(|t| t.job == job) {
                    self.transfer = None;
                }
            }
        }
    }

    // -- radio --

    async fn on_radio(&mut self, radio: RadioState) {
        let previous = std::mem::replace(&mut self.radio, radio);
        tracing::debug!(?previous, ?radio, "Radio state");

        match radio {
            RadioState::PoweredOff => {
                self.scan += 1;
                self.drop_connection();
                self.set_state(ConnectionState::RadioOff);
            }
            RadioState::Unauthorized => {
                self.scan += 1;
                self.drop_connection();
                self.set_state(ConnectionState::Error(PrinterError::RadioUnavailable));
            }
            RadioState::PoweredOn if previous != RadioState::PoweredOn => {
                if matches!(
                    self.state(),
                    ConnectionState::RadioOff | ConnectionState::Error(_)
                ) {
                    self.set_state(ConnectionState::Disconnected);
                }
                self.restore_last_connection().await;
            }
            RadioState::PoweredOn | RadioState::Unknown => {}
        }
    }

    // -- scanning --

    async fn start_scanning(&mut self) -> Result<()> {
        if self.radio != RadioState::PoweredOn {
            return Err(PrinterError::RadioUnavailable);
        }
        if let Some(current) = self.state().peripheral() {
            return Err(PrinterError::AlreadyConnected(current.display_name()));
        }

        self.scan += 1;
        let scan = self.scan;
        self.devices_tx.send_replace(Vec::new());
        self.central.start_scan().await?;
        self.set_state(ConnectionState::Scanning);

        let internal = self.internal_tx.clone();
        let timeout = self.config.scan_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = internal.send(Internal::ScanTimedOut { scan });
        });

        tracing::info!(timeout_secs = timeout.as_secs(), "Scanning for printers");
        Ok(())
    }

    async fn stop_scanning(&mut self) {
        if self.state() == ConnectionState::Scanning {
            self.halt_scan().await;
            self.set_state(ConnectionState::Disconnected);
        }
    }

    /// Stop the platform scan and invalidate its timer. State is left to the caller.
    async fn halt_scan(&mut self) {
        self.scan += 1;
        if let Err(err) = self.central.stop_scan().await {
            tracing::warn!(error = %err, "Failed to stop scan");
        }
    }

    async fn on_scan_timeout(&mut self, scan: u64) {
        if scan != self.scan || self.state() != ConnectionState::Scanning {
            return;
        }
        tracing::info!(
            count = self.devices_tx.borrow().len(),
            "BLE scan window elapsed"
        );
        self.halt_scan().await;
        self.set_state(ConnectionState::Disconnected);
    }

    fn on_discovered(&mut self, peripheral: PeripheralRef) {
        if self.state() != ConnectionState::Scanning || !peripheral.has_name() {
            return;
        }
        let added = self.devices_tx.send_if_modified(|devices| {
            if devices.iter().any(|d| d.id == peripheral.id) {
                return false;
            }
            devices.push(peripheral.clone());
            true
        });
        if added {
            tracing::info!(
                name = %peripheral.display_name(),
                id = %peripheral.id,
                rssi = ?peripheral.rssi,
                "Found printer"
            );
        }
    }

    // -- connection lifecycle --

    async fn connect(&mut self, peripheral: PeripheralRef) -> Result<()> {
        if self.radio != RadioState::PoweredOn {
            return Err(PrinterError::RadioUnavailable);
        }

        match self.state() {
            ConnectionState::Connecting(current)
            | ConnectionState::Connected {
                peripheral: current,
                ..
            } if current.id == peripheral.id => return Ok(()),
            ConnectionState::Connecting(current)
            | ConnectionState::Connected {
                peripheral: current,
                ..
            } => {
                tracing::info!(from = %current.id, to = %peripheral.id, "Switching printer");
                if let Some(session) = self.drop_connection() {
                    spawn_disconnect(session);
                }
            }
            ConnectionState::Scanning => self.halt_scan().await,
            _ => {}
        }

        self.attempt += 1;
        let attempt = self.attempt;
        self.set_state(ConnectionState::Connecting(peripheral.clone()));

        let central = self.central.clone();
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = central.connect(&peripheral.id).await;
            let _ = internal.send(Internal::ConnectFinished {
                attempt,
                peripheral,
                result,
            });
        });
        Ok(())
    }

    async fn on_connect_finished(
        &mut self,
        attempt: u64,
        peripheral: PeripheralRef,
        result: Result<Arc<dyn Session>>,
    ) {
        let current = attempt == self.attempt
            && matches!(self.state(), ConnectionState::Connecting(ref p) if p.id == peripheral.id);
        if !current {
            if let Ok(session) = result {
                tracing::debug!(id = %peripheral.id, "Discarding superseded connection");
                spawn_disconnect(session);
            }
            return;
        }

        match result {
            Ok(session) => {
                if let Err(err) = self.store.save(&peripheral.id) {
                    tracing::warn!(error = %err, "Failed to save printer preference");
                }
                self.session = Some(session.clone());
                self.set_state(ConnectionState::Connected {
                    peripheral,
                    endpoint_ready: false,
                });

                let internal = self.internal_tx.clone();
                tokio::spawn(async move {
                    let result = transport::resolve_endpoint(session.as_ref()).await;
                    let _ = internal.send(Internal::EndpointResolved { attempt, result });
                });
            }
            Err(PrinterError::DeviceNotFound(id)) => {
                tracing::info!(id = %id, "Printer not cached, scanning instead");
                self.set_state(ConnectionState::Disconnected);
                if let Err(err) = self.start_scanning().await {
                    tracing::warn!(error = %err, "Fallback scan failed");
                }
            }
            Err(err) => {
                tracing::warn!(id = %peripheral.id, error = %err, "Connection failed");
                self.set_state(ConnectionState::Error(as_connection_failure(err)));
            }
        }
    }

    fn on_endpoint_resolved(
        &mut self,
        attempt: u64,
        result: Result<Option<Arc<dyn WritableEndpoint>>>,
    ) {
        if attempt != self.attempt {
            return;
        }
        let ConnectionState::Connected { peripheral, .. } = self.state() else {
            return;
        };

        match result {
            Ok(Some(endpoint)) => {
                self.endpoint = Some(endpoint);
                self.set_state(ConnectionState::Connected {
                    peripheral,
                    endpoint_ready: true,
                });
            }
            Ok(None) => self.fail_connection(PrinterError::MissingCharacteristic),
            Err(err) => self.fail_connection(as_connection_failure(err)),
        }
    }

    fn fail_connection(&mut self, err: PrinterError) {
        tracing::warn!(error = %err, "Endpoint resolution failed");
        if let Some(session) = self.drop_connection() {
            spawn_disconnect(session);
        }
        self.set_state(ConnectionState::Error(err));
    }

    fn on_peripheral_disconnected(&mut self, id: PeripheralId) {
        let ours = self.session.as_ref().is_some_and(|s| *s.peripheral() == id)
            || self.state().peripheral().is_some_and(|p| p.id == id);
        if !ours {
            return;
        }
        tracing::info!(id = %id, "Peripheral disconnected");
        self.drop_connection();
        self.set_state(ConnectionState::Disconnected);
    }

    async fn disconnect(&mut self) {
        let state = self.state();
        if state == ConnectionState::Scanning {
            self.halt_scan().await;
            self.set_state(ConnectionState::Disconnected);
            return;
        }

        let had_connection = state.peripheral().is_some() || self.session.is_some();
        if let Some(session) = self.drop_connection() {
            if let Err(err) = session.disconnect().await {
                tracing::warn!(error = %err, "Disconnect failed");
            }
        }
        if had_connection {
            if let Err(err) = self.store.clear() {
                tracing::warn!(error = %err, "Failed to clear printer preference");
            }
        }
        if had_connection || matches!(state, ConnectionState::Error(_)) {
            self.set_state(ConnectionState::Disconnected);
        }
    }

    /// Forget the session and endpoint, abort any transfer and invalidate
    /// in-flight connection work. Returns the session for the caller to close.
    fn drop_connection(&mut self) -> Option<Arc<dyn Session>> {
        if let Some(transfer) = &self.transfer {
            transfer.cancel.cancel();
        }
        self.endpoint = None;
        self.attempt += 1;
        self.session.take()
    }

    async fn restore_last_connection(&mut self) {
        if self.radio != RadioState::PoweredOn || self.state().peripheral().is_some() {
            return;
        }

        let saved = match self.store.load() {
            Ok(Some(id)) => id,
            Ok(None) => {
                tracing::debug!("No saved printer to restore");
                return;
            }
            Err(err) => {
                tracing::warn!(error = %err, "Failed to read printer preference");
                return;
            }
        };

        match self.central.retrieve_known(&saved).await {
            Ok(Some(peripheral)) => {
                tracing::info!(name = %peripheral.display_name(), "Found known device");
                if let Err(err) = self.connect(peripheral).await {
                    tracing::warn!(error = %err, "Reconnect failed");
                }
            }
            other => {
                if let Err(err) = other {
                    tracing::debug!(error = %err, "Known-device lookup failed");
                }
                tracing::info!(
                    error = %PrinterError::DeviceNotFound(saved.to_string()),
                    "Falling back to scan"
                );
                if let Err(err) = self.start_scanning().await {
                    tracing::warn!(error = %err, "Fallback scan failed");
                }
            }
        }
    }

    // -- printing --

    fn print(&mut self, image: DynamicImage) -> Result<PrintTicket> {
        if self.transfer.is_some() || !self.state().is_ready() {
            return Err(PrinterError::NotReady);
        }
        let endpoint = self.endpoint.clone().ok_or(PrinterError::NotReady)?;

        self.next_job += 1;
        let job = self.next_job;
        let cancel = CancellationToken::new();
        self.transfer = Some(ActiveTransfer {
            job,
            cancel: cancel.clone(),
        });

        let (done_tx, done_rx) = oneshot::channel();
        let label = self.config.label.clone();
        let options = self.config.transmit.clone();
        let internal = self.internal_tx.clone();
        let notices = self.notices_tx.clone();

        tokio::spawn(async move {
            let outcome = run_print_job(image, label, endpoint, options, cancel).await;
            match &outcome {
                Ok(report) => tracing::info!(
                    job,
                    bytes = report.bytes,
                    chunks = report.chunks,
                    elapsed_ms = report.elapsed.as_millis() as u64,
                    "Print job completed"
                ),
                Err(err) => tracing::error!(job, error = %err, "Print job failed"),
            }
            // free the slot before the caller can observe completion
            let _ = internal.send(Internal::TransferFinished { job });
            let _ = notices.send(PrintNotice {
                job,
                outcome: outcome.clone(),
            });
            let _ = done_tx.send(outcome);
        });

        tracing::info!(job, "Print job accepted");
        Ok(PrintTicket { job, done: done_rx })
    }

    async fn shutdown(&mut self) {
        if self.state() == ConnectionState::Scanning {
            self.halt_scan().await;
        }
        if let Some(session) = self.drop_connection() {
            if let Err(err) = session.disconnect().await {
                tracing::warn!(error = %err, "Disconnect on shutdown failed");
            }
        }
        tracing::info!("Connection manager stopped");
    }
}

async fn next_event(events: &mut Option<BoxStream<'static, CentralEvent>>) -> Option<CentralEvent> {
    match events {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

async fn run_print_job(
    image: DynamicImage,
    label: LabelOptions,
    endpoint: Arc<dyn WritableEndpoint>,
    options: TransmitOptions,
    cancel: CancellationToken,
) -> Result<TransferReport> {
    let buffer = tokio::task::spawn_blocking(move || tspl::encode(&image, &label))
        .await
        .map_err(|e| PrinterError::EncodeFailed(e.to_string()))??;
    transmit::transmit(endpoint.as_ref(), buffer.as_bytes(), &options, &cancel).await
}

fn spawn_disconnect(session: Arc<dyn Session>) {
    tokio::spawn(async move {
        if let Err(err) = session.disconnect().await {
            tracing::warn!(error = %err, "Background disconnect failed");
        }
    });
}

fn as_connection_failure(err: PrinterError) -> PrinterError {
    match err {
        PrinterError::ConnectionFailed(_)
        | PrinterError::RadioUnavailable
        | PrinterError::MissingCharacteristic => err,
        other => PrinterError::ConnectionFailed(other.to_string()),
    }
}
