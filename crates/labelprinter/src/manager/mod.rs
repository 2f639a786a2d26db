//! Connection manager.
//!
//! A single actor task owns the [`ConnectionState`], the discovered-device set,
//! the active session and its writable endpoint. Platform events, user
//! commands and worker completions are all funnelled into that task, so state
//! transitions happen in the order their causes arrived.
//!
//! [`PrinterHandle`] is the cheap, cloneable front end used by the application.

mod actor;

#[cfg(test)]
mod tests;

use std::sync::Arc;
use std::time::Duration;

use image::DynamicImage;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use crate::label::LabelOptions;
use crate::preference::PreferenceStore;
use crate::state::{ConnectionState, PeripheralRef};
use crate::transmit::{TransferReport, TransmitOptions};
use crate::transport::Central;
use crate::{PrinterError, Result};

use actor::Actor;

/// Default scan window before giving up and returning to `Disconnected`.
pub const DEFAULT_SCAN_TIMEOUT: Duration = Duration::from_secs(10);

const COMMAND_CAPACITY: usize = 32;
const NOTICE_CAPACITY: usize = 16;

/// Tunables for the connection manager.
#[derive(Debug, Clone, PartialEq)]
pub struct ManagerConfig {
    pub scan_timeout: Duration,
    pub label: LabelOptions,
    pub transmit: TransmitOptions,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            scan_timeout: DEFAULT_SCAN_TIMEOUT,
            label: LabelOptions::default(),
            transmit: TransmitOptions::default(),
        }
    }
}

/// One-shot print outcome for the UI, separate from the connection indicator.
#[derive(Debug, Clone, PartialEq)]
pub struct PrintNotice {
    pub job: u64,
    pub outcome: std::result::Result<TransferReport, PrinterError>,
}

/// Accepted print job. Await [`PrintTicket::wait`] for the transfer result.
#[derive(Debug)]
pub struct PrintTicket {
    job: u64,
    done: oneshot::Receiver<Result<TransferReport>>,
}

impl PrintTicket {
    pub fn job(&self) -> u64 {
        self.job
    }

    pub async fn wait(self) -> Result<TransferReport> {
        self.done.await.unwrap_or(Err(PrinterError::ManagerStopped))
    }
}

pub(crate) enum Command {
    StartScanning(oneshot::Sender<Result<()>>),
    StopScanning(oneshot::Sender<()>),
    Connect(PeripheralRef, oneshot::Sender<Result<()>>),
    Disconnect(oneshot::Sender<()>),
    Print(Box<DynamicImage>, oneshot::Sender<Result<PrintTicket>>),
    RestoreLastConnection(oneshot::Sender<()>),
}

/// Entry point: spawns the actor and returns its handle.
pub struct ConnectionManager;

impl ConnectionManager {
    /// Spawn the manager on the current tokio runtime.
    ///
    /// On start-up the actor subscribes to platform events, reads the radio
    /// state and, if the radio is on, restores the last connection.
    pub fn spawn(
        central: Arc<dyn Central>,
        store: Arc<dyn PreferenceStore>,
        config: ManagerConfig,
    ) -> PrinterHandle {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (devices_tx, devices_rx) = watch::channel(Vec::new());
        let (notices_tx, _) = broadcast::channel(NOTICE_CAPACITY);
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();

        let actor = Actor::new(
            central,
            store,
            config,
            state_tx,
            devices_tx,
            notices_tx.clone(),
            internal_tx,
        );
        tokio::spawn(actor.run(commands_rx, internal_rx));

        PrinterHandle {
            commands: commands_tx,
            state: state_rx,
            devices: devices_rx,
            notices: notices_tx,
        }
    }
}

/// Cloneable handle to the connection manager actor.
#[derive(Clone)]
pub struct PrinterHandle {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<ConnectionState>,
    devices: watch::Receiver<Vec<PeripheralRef>>,
    notices: broadcast::Sender<PrintNotice>,
}

impl PrinterHandle {
    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Devices found by the current (or last) scan, in discovery order.
    pub fn discovered(&self) -> Vec<PeripheralRef> {
        self.devices.borrow().clone()
    }

    pub fn subscribe_devices(&self) -> watch::Receiver<Vec<PeripheralRef>> {
        self.devices.clone()
    }

    pub fn subscribe_notices(&self) -> broadcast::Receiver<PrintNotice> {
        self.notices.subscribe()
    }

    /// Begin a scan. Fails with `RadioUnavailable` unless the radio is on.
    pub async fn start_scanning(&self) -> Result<()> {
        self.request(Command::StartScanning).await?
    }

    pub async fn stop_scanning(&self) -> Result<()> {
        self.request(Command::StopScanning).await
    }

    /// Connect to `peripheral`, stopping any scan first.
    ///
    /// Returns once the attempt has started; watch the state for the outcome.
    pub async fn connect(&self, peripheral: PeripheralRef) -> Result<()> {
        self.request(|tx| Command::Connect(peripheral, tx)).await?
    }

    /// Tear down the active connection and forget the saved printer.
    pub async fn disconnect(&self) -> Result<()> {
        self.request(Command::Disconnect).await
    }

    /// Queue `image` for encoding and transmission.
    ///
    /// Fails with `NotReady` unless an endpoint is ready and no other
    /// transfer is in flight. Returns as soon as the job is accepted.
    pub async fn print(&self, image: DynamicImage) -> Result<PrintTicket> {
        self.request(|tx| Command::Print(Box::new(image), tx)).await?
    }

    /// Reconnect to the saved printer, or scan if the platform doesn't know it.
    pub async fn restore_last_connection(&self) -> Result<()> {
        self.request(Command::RestoreLastConnection).await
    }

    /// Wait until the state satisfies `predicate`.
    pub async fn wait_for_state<F>(&self, mut predicate: F, timeout: Duration) -> Result<ConnectionState>
    where
        F: FnMut(&ConnectionState) -> bool,
    {
        let mut rx = self.state.clone();
        let waited = tokio::time::timeout(timeout, rx.wait_for(|s| predicate(s))).await;
        match waited {
            Ok(Ok(state)) => Ok(state.clone()),
            Ok(Err(_)) => Err(PrinterError::ManagerStopped),
            Err(_) => Err(PrinterError::Timeout(timeout.as_millis() as u64)),
        }
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .await
            .map_err(|_| PrinterError::ManagerStopped)?;
        rx.await.map_err(|_| PrinterError::ManagerStopped)
    }
}
