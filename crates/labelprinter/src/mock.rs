//! Simulated printer transport.
//!
//! Used by the test suite and by the application's dry-run mode. Radio state,
//! advertised and bonded peripherals are scripted; every written chunk is
//! recorded.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use uuid::Uuid;

use crate::state::{PeripheralId, PeripheralRef, RadioState};
use crate::transport::{Capability, Central, CentralEvent, Session, WritableEndpoint, WriteMode};
use crate::{PrinterError, Result};

/// Service and characteristic advertised by the simulated printer.
pub const MOCK_SERVICE: Uuid = Uuid::from_u128(0x0000_18f0_0000_1000_8000_0080_5f9b_34fb);
pub const MOCK_WRITE_CHAR: Uuid = Uuid::from_u128(0x0000_2af1_0000_1000_8000_0080_5f9b_34fb);

#[derive(Debug)]
struct MockState {
    radio: RadioState,
    advertised: Vec<PeripheralRef>,
    known: Vec<PeripheralRef>,
    capabilities: Vec<Capability>,
    fail_connect: Option<String>,
    vanished: Vec<PeripheralId>,
    connect_delay: Duration,
    write_delay: Duration,
    scanning: bool,
    scan_starts: usize,
    connected: Option<PeripheralId>,
    connects: Vec<PeripheralId>,
    writes: Vec<Vec<u8>>,
}

/// In-process [`Central`] simulating one or more label printers.
#[derive(Clone)]
pub struct MockCentral {
    state: Arc<Mutex<MockState>>,
    events_tx: mpsc::UnboundedSender<CentralEvent>,
    events_rx: Arc<Mutex<Option<mpsc::UnboundedReceiver<CentralEvent>>>>,
}

impl Default for MockCentral {
    fn default() -> Self {
        Self::new()
    }
}

impl MockCentral {
    /// Powered-on radio, nothing advertised, one write-without-response characteristic.
    pub fn new() -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            state: Arc::new(Mutex::new(MockState {
                radio: RadioState::PoweredOn,
                advertised: Vec::new(),
                known: Vec::new(),
                capabilities: vec![Capability {
                    service: MOCK_SERVICE,
                    characteristic: MOCK_WRITE_CHAR,
                    write: true,
                    write_without_response: true,
                }],
                fail_connect: None,
                vanished: Vec::new(),
                connect_delay: Duration::ZERO,
                write_delay: Duration::ZERO,
                scanning: false,
                scan_starts: 0,
                connected: None,
                connects: Vec::new(),
                writes: Vec::new(),
            })),
            events_tx,
            events_rx: Arc::new(Mutex::new(Some(events_rx))),
        }
    }

    /// A single printer that is both advertised and already bonded.
    pub fn simulated_printer(name: &str) -> (Self, PeripheralRef) {
        let printer = PeripheralRef::new(
            PeripheralId::from_platform_id(&format!("simulated:{name}")),
            Some(name.to_string()),
            Some(-55),
        );
        let central = Self::new()
            .with_advertised(printer.clone())
            .with_known(printer.clone());
        (central, printer)
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Builder: peripheral reported on every scan.
    pub fn with_advertised(self, peripheral: PeripheralRef) -> Self {
        self.lock().advertised.push(peripheral);
        self
    }

    /// Builder: peripheral the platform already knows (bonded/cached).
    pub fn with_known(self, peripheral: PeripheralRef) -> Self {
        self.lock().known.push(peripheral);
        self
    }

    pub fn with_capabilities(self, capabilities: Vec<Capability>) -> Self {
        self.lock().capabilities = capabilities;
        self
    }

    pub fn with_radio(self, radio: RadioState) -> Self {
        self.lock().radio = radio;
        self
    }

    pub fn with_connect_delay(self, delay: Duration) -> Self {
        self.lock().connect_delay = delay;
        self
    }

    /// Builder: simulated time per chunk write.
    pub fn with_write_delay(self, delay: Duration) -> Self {
        self.lock().write_delay = delay;
        self
    }

    /// Builder: every connect attempt fails with `reason`.
    pub fn failing_connect(self, reason: &str) -> Self {
        self.lock().fail_connect = Some(reason.to_string());
        self
    }

    /// Builder: the platform has lost track of `id`, so connecting to it
    /// fails with `DeviceNotFound`.
    pub fn with_vanished(self, id: PeripheralId) -> Self {
        self.lock().vanished.push(id);
        self
    }

    /// Change radio power and notify the manager.
    pub fn set_radio(&self, radio: RadioState) {
        {
            let mut state = self.lock();
            state.radio = radio;
            if radio != RadioState::PoweredOn {
                state.scanning = false;
                state.connected = None;
            }
        }
        self.inject(CentralEvent::RadioChanged(radio));
    }

    /// Peripheral-initiated disconnect of the current connection.
    pub fn drop_connection(&self) {
        let dropped = self.lock().connected.take();
        if let Some(id) = dropped {
            self.inject(CentralEvent::Disconnected(id));
        }
    }

    /// Deliver a raw platform event.
    pub fn inject(&self, event: CentralEvent) {
        let _ = self.events_tx.send(event);
    }

    pub fn is_scanning(&self) -> bool {
        self.lock().scanning
    }

    pub fn scan_starts(&self) -> usize {
        self.lock().scan_starts
    }

    pub fn connected(&self) -> Option<PeripheralId> {
        self.lock().connected
    }

    /// Every id passed to `connect`, in order.
    pub fn connect_attempts(&self) -> Vec<PeripheralId> {
        self.lock().connects.clone()
    }

    /// Chunks written so far, in order.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.lock().writes.clone()
    }

    /// All written bytes concatenated.
    pub fn written_bytes(&self) -> Vec<u8> {
        self.lock().writes.concat()
    }

    fn ensure_powered(&self) -> Result<()> {
        match self.lock().radio {
            RadioState::PoweredOn => Ok(()),
            _ => Err(PrinterError::RadioUnavailable),
        }
    }
}

#[async_trait]
impl Central for MockCentral {
    async fn events(&self) -> Result<BoxStream<'static, CentralEvent>> {
        let rx = self
            .events_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| PrinterError::ConnectionFailed("event stream already taken".into()))?;
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn radio_state(&self) -> Result<RadioState> {
        Ok(self.lock().radio)
    }

    async fn start_scan(&self) -> Result<()> {
        self.ensure_powered()?;
        let advertised = {
            let mut state = self.lock();
            state.scanning = true;
            state.scan_starts += 1;
            state.advertised.clone()
        };
        for peripheral in advertised {
            self.inject(CentralEvent::Discovered(peripheral));
        }
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.lock().scanning = false;
        Ok(())
    }

    async fn retrieve_known(&self, id: &PeripheralId) -> Result<Option<PeripheralRef>> {
        Ok(self.lock().known.iter().find(|p| p.id == *id).cloned())
    }

    async fn connect(&self, id: &PeripheralId) -> Result<Arc<dyn Session>> {
        self.ensure_powered()?;
        let (delay, failure, vanished) = {
            let mut state = self.lock();
            state.connects.push(*id);
            (
                state.connect_delay,
                state.fail_connect.clone(),
                state.vanished.contains(id),
            )
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if vanished {
            return Err(PrinterError::DeviceNotFound(id.to_string()));
        }
        if let Some(reason) = failure {
            return Err(PrinterError::ConnectionFailed(reason));
        }

        self.lock().connected = Some(*id);
        Ok(Arc::new(MockSession {
            id: *id,
            central: self.clone(),
        }))
    }
}

struct MockSession {
    id: PeripheralId,
    central: MockCentral,
}

#[async_trait]
impl Session for MockSession {
    fn peripheral(&self) -> &PeripheralId {
        &self.id
    }

    async fn capabilities(&self) -> Result<Vec<Capability>> {
        Ok(self.central.lock().capabilities.clone())
    }

    async fn endpoint(
        &self,
        capability: &Capability,
        mode: WriteMode,
    ) -> Result<Arc<dyn WritableEndpoint>> {
        let exists = self
            .central
            .lock()
            .capabilities
            .iter()
            .any(|c| c.characteristic == capability.characteristic);
        if !exists {
            return Err(PrinterError::MissingCharacteristic);
        }
        Ok(Arc::new(MockEndpoint {
            id: self.id,
            central: self.central.clone(),
            mode,
        }))
    }

    async fn disconnect(&self) -> Result<()> {
        let mut state = self.central.lock();
        if state.connected == Some(self.id) {
            state.connected = None;
        }
        Ok(())
    }
}

struct MockEndpoint {
    id: PeripheralId,
    central: MockCentral,
    mode: WriteMode,
}

#[async_trait]
impl WritableEndpoint for MockEndpoint {
    fn write_mode(&self) -> WriteMode {
        self.mode
    }

    async fn write_chunk(&self, chunk: &[u8]) -> Result<()> {
        let delay = self.central.lock().write_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.central.lock();
        if state.connected != Some(self.id) {
            return Err(PrinterError::Write("peripheral not connected".into()));
        }
        state.writes.push(chunk.to_vec());
        Ok(())
    }
}
