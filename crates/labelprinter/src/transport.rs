//! BLE transport seam.
//!
//! The connection manager talks to the radio only through these traits, so
//! the same state machine drives btleplug on real hardware and the simulated
//! printer in tests and dry runs.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use uuid::Uuid;

use crate::Result;
use crate::state::{PeripheralId, PeripheralRef, RadioState};

/// Platform events delivered to the connection manager.
#[derive(Debug, Clone, PartialEq)]
pub enum CentralEvent {
    RadioChanged(RadioState),
    Discovered(PeripheralRef),
    Disconnected(PeripheralId),
}

/// GATT write mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Acknowledged write; each chunk waits for the peripheral's response.
    WithResponse,
    /// Unacknowledged write; pacing is up to the sender.
    WithoutResponse,
}

/// A characteristic found during endpoint resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capability {
    pub service: Uuid,
    pub characteristic: Uuid,
    pub write: bool,
    pub write_without_response: bool,
}

impl Capability {
    /// Preferred write mode for this characteristic, if it is writable at all.
    pub fn write_mode(&self) -> Option<WriteMode> {
        if self.write_without_response {
            Some(WriteMode::WithoutResponse)
        } else if self.write {
            Some(WriteMode::WithResponse)
        } else {
            None
        }
    }
}

/// Pick the first writable capability, in service then characteristic order.
pub fn select_capability(capabilities: &[Capability]) -> Option<(&Capability, WriteMode)> {
    capabilities
        .iter()
        .find_map(|c| c.write_mode().map(|mode| (c, mode)))
}

/// Enumerate a session's characteristics and open the first writable one.
pub async fn resolve_endpoint(session: &dyn Session) -> Result<Option<Arc<dyn WritableEndpoint>>> {
    let capabilities = session.capabilities().await?;
    tracing::debug!(
        peripheral = %session.peripheral(),
        count = capabilities.len(),
        "Enumerated characteristics"
    );

    let Some((capability, mode)) = select_capability(&capabilities) else {
        return Ok(None);
    };
    tracing::info!(
        service = %capability.service,
        characteristic = %capability.characteristic,
        ?mode,
        "Selected write endpoint"
    );
    session.endpoint(capability, mode).await.map(Some)
}

/// BLE central role: radio state, scanning and connecting.
#[async_trait]
pub trait Central: Send + Sync {
    /// Subscribe to platform events. Called once by the connection manager.
    async fn events(&self) -> Result<BoxStream<'static, CentralEvent>>;

    async fn radio_state(&self) -> Result<RadioState>;

    async fn start_scan(&self) -> Result<()>;

    async fn stop_scan(&self) -> Result<()>;

    /// Look up a bonded or cached peripheral without scanning.
    async fn retrieve_known(&self, id: &PeripheralId) -> Result<Option<PeripheralRef>>;

    async fn connect(&self, id: &PeripheralId) -> Result<Arc<dyn Session>>;
}

/// An open connection to one peripheral.
#[async_trait]
pub trait Session: Send + Sync {
    fn peripheral(&self) -> &PeripheralId;

    /// Discover services, then their characteristics.
    async fn capabilities(&self) -> Result<Vec<Capability>>;

    async fn endpoint(
        &self,
        capability: &Capability,
        mode: WriteMode,
    ) -> Result<Arc<dyn WritableEndpoint>>;

    async fn disconnect(&self) -> Result<()>;
}

/// A writable characteristic on a connected peripheral.
#[async_trait]
pub trait WritableEndpoint: Send + Sync {
    fn write_mode(&self) -> WriteMode;

    /// Write one chunk. Callers keep chunks within the transport's write limit.
    async fn write_chunk(&self, chunk: &[u8]) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cap(n: u128, write: bool, without_response: bool) -> Capability {
        Capability {
            service: Uuid::from_u128(0x18f0),
            characteristic: Uuid::from_u128(n),
            write,
            write_without_response: without_response,
        }
    }

    #[test]
    fn selects_first_writable_characteristic() {
        let caps = vec![cap(1, false, false), cap(2, true, false), cap(3, false, true)];
        let (selected, mode) = select_capability(&caps).unwrap();
        assert_eq!(selected.characteristic, Uuid::from_u128(2));
        assert_eq!(mode, WriteMode::WithResponse);
    }

    #[test]
    fn prefers_unacknowledged_when_both_supported() {
        let caps = vec![cap(7, true, true)];
        assert_eq!(
            select_capability(&caps).map(|(_, m)| m),
            Some(WriteMode::WithoutResponse)
        );
    }

    #[test]
    fn no_writable_characteristic() {
        assert!(select_capability(&[cap(1, false, false)]).is_none());
        assert!(select_capability(&[]).is_none());
    }
}
