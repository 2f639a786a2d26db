//! BLE transport using btleplug.
//!
//! Wraps the first platform adapter as a [`Central`], translating btleplug's
//! adapter events into [`CentralEvent`]s and its peripherals into sessions
//! and writable endpoints.

use std::sync::Arc;

use async_trait::async_trait;
use btleplug::api::{
    Central as _, CentralEvent as BtleEvent, CentralState, CharPropFlags, Characteristic,
    Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use futures::stream::BoxStream;

use crate::ble_init::{
    RETRY_COUNT, RETRY_DELAY, is_central_manager_transient, wrap_ble_init_error,
};
use crate::state::{PeripheralId, PeripheralRef, RadioState};
use crate::transport::{Capability, Central, CentralEvent, Session, WritableEndpoint, WriteMode};
use crate::{PrinterError, Result};

fn ble_error(err: btleplug::Error) -> PrinterError {
    PrinterError::ConnectionFailed(err.to_string())
}

fn peripheral_id(peripheral: &Peripheral) -> PeripheralId {
    PeripheralId::from_platform_id(&peripheral.id().to_string())
}

fn radio_state(state: CentralState) -> RadioState {
    match state {
        CentralState::PoweredOn => RadioState::PoweredOn,
        CentralState::PoweredOff => RadioState::PoweredOff,
        _ => RadioState::Unknown,
    }
}

async fn describe(peripheral: &Peripheral) -> PeripheralRef {
    let props = peripheral.properties().await.ok().flatten();
    PeripheralRef {
        id: peripheral_id(peripheral),
        name: props.as_ref().and_then(|p| p.local_name.clone()),
        rssi: props.as_ref().and_then(|p| p.rssi),
    }
}

/// [`Central`] backed by the first available platform BLE adapter.
#[derive(Clone)]
pub struct BtleCentral {
    adapter: Adapter,
}

impl BtleCentral {
    /// Initialize the platform BLE adapter (first available).
    ///
    /// Retries while macOS reports the CentralManager as not yet settled.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new().await.map_err(ble_error)?;

        let adapter = manager
            .adapters()
            .await
            .map_err(ble_error)?
            .into_iter()
            .next()
            .ok_or_else(|| PrinterError::ConnectionFailed("No BLE adapter found".into()))?;

        let mut attempt = 1;
        loop {
            match adapter.adapter_state().await.map_err(ble_error) {
                Ok(state) => {
                    tracing::info!(state = ?state, "BLE adapter ready");
                    return Ok(Self { adapter });
                }
                Err(err) if is_central_manager_transient(&err) && attempt < RETRY_COUNT => {
                    tracing::debug!(attempt, "CentralManager not settled, retrying");
                    attempt += 1;
                    tokio::time::sleep(RETRY_DELAY).await;
                }
                Err(err) => return Err(wrap_ble_init_error(err)),
            }
        }
    }

    async fn find_peripheral(&self, id: &PeripheralId) -> Result<Option<Peripheral>> {
        let peripherals = self.adapter.peripherals().await.map_err(ble_error)?;
        Ok(peripherals.into_iter().find(|p| peripheral_id(p) == *id))
    }
}

async fn translate(adapter: Adapter, event: BtleEvent) -> Option<CentralEvent> {
    match event {
        BtleEvent::DeviceDiscovered(id) | BtleEvent::DeviceUpdated(id) => {
            let peripheral = adapter.peripheral(&id).await.ok()?;
            Some(CentralEvent::Discovered(describe(&peripheral).await))
        }
        BtleEvent::DeviceDisconnected(id) => Some(CentralEvent::Disconnected(
            PeripheralId::from_platform_id(&id.to_string()),
        )),
        BtleEvent::StateUpdate(state) => Some(CentralEvent::RadioChanged(radio_state(state))),
        _ => None,
    }
}

#[async_trait]
impl Central for BtleCentral {
    async fn events(&self) -> Result<BoxStream<'static, CentralEvent>> {
        let events = self.adapter.events().await.map_err(ble_error)?;
        let adapter = self.adapter.clone();
        Ok(events
            .filter_map(move |event| translate(adapter.clone(), event))
            .boxed())
    }

    async fn radio_state(&self) -> Result<RadioState> {
        let state = self.adapter.adapter_state().await.map_err(ble_error)?;
        Ok(radio_state(state))
    }

    async fn start_scan(&self) -> Result<()> {
        tracing::info!("Starting BLE scan");
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(|e| PrinterError::Scan(e.to_string()))
    }

    async fn stop_scan(&self) -> Result<()> {
        self.adapter
            .stop_scan()
            .await
            .map_err(|e| PrinterError::Scan(e.to_string()))
    }

    async fn retrieve_known(&self, id: &PeripheralId) -> Result<Option<PeripheralRef>> {
        match self.find_peripheral(id).await? {
            Some(peripheral) => Ok(Some(describe(&peripheral).await)),
            None => Ok(None),
        }
    }

    async fn connect(&self, id: &PeripheralId) -> Result<Arc<dyn Session>> {
        let peripheral = self
            .find_peripheral(id)
            .await?
            .ok_or_else(|| PrinterError::DeviceNotFound(id.to_string()))?;

        tracing::info!(id = %id, "Connecting to device");
        peripheral.connect().await.map_err(ble_error)?;

        Ok(Arc::new(BtleSession {
            id: *id,
            peripheral,
        }))
    }
}

/// An open btleplug connection.
pub struct BtleSession {
    id: PeripheralId,
    peripheral: Peripheral,
}

#[async_trait]
impl Session for BtleSession {
    fn peripheral(&self) -> &PeripheralId {
        &self.id
    }

    async fn capabilities(&self) -> Result<Vec<Capability>> {
        self.peripheral
            .discover_services()
            .await
            .map_err(ble_error)?;

        Ok(self
            .peripheral
            .services()
            .into_iter()
            .flat_map(|service| {
                service.characteristics.into_iter().map(move |c| Capability {
                    service: service.uuid,
                    characteristic: c.uuid,
                    write: c.properties.contains(CharPropFlags::WRITE),
                    write_without_response: c
                        .properties
                        .contains(CharPropFlags::WRITE_WITHOUT_RESPONSE),
                })
            })
            .collect())
    }

    async fn endpoint(
        &self,
        capability: &Capability,
        mode: WriteMode,
    ) -> Result<Arc<dyn WritableEndpoint>> {
        let characteristic = self
            .peripheral
            .characteristics()
            .into_iter()
            .find(|c| {
                c.uuid == capability.characteristic && c.service_uuid == capability.service
            })
            .ok_or(PrinterError::MissingCharacteristic)?;

        Ok(Arc::new(BtleEndpoint {
            peripheral: self.peripheral.clone(),
            characteristic,
            mode,
        }))
    }

    async fn disconnect(&self) -> Result<()> {
        tracing::info!(id = %self.id, "Disconnecting BLE device");
        self.peripheral.disconnect().await.map_err(ble_error)
    }
}

/// A writable GATT characteristic with its chosen write type.
pub struct BtleEndpoint {
    peripheral: Peripheral,
    characteristic: Characteristic,
    mode: WriteMode,
}

#[async_trait]
impl WritableEndpoint for BtleEndpoint {
    fn write_mode(&self) -> WriteMode {
        self.mode
    }

    async fn write_chunk(&self, chunk: &[u8]) -> Result<()> {
        let write_type = match self.mode {
            WriteMode::WithResponse => WriteType::WithResponse,
            WriteMode::WithoutResponse => WriteType::WithoutResponse,
        };
        self.peripheral
            .write(&self.characteristic, chunk, write_type)
            .await
            .map_err(|e| PrinterError::Write(e.to_string()))
    }
}
