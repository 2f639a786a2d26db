//! Observable connection state and peripheral identity types.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::PrinterError;

/// Stable 128-bit identifier of a peripheral.
///
/// Produced by the transport from the platform's own device id, so the same
/// printer keeps the same identifier across scans and app launches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeripheralId(Uuid);

impl PeripheralId {
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Derive an identifier from a platform-specific id string
    /// (BD address on Linux/Windows, CoreBluetooth UUID on macOS).
    pub fn from_platform_id(raw: &str) -> Self {
        Self(Uuid::new_v5(&Uuid::NAMESPACE_OID, raw.as_bytes()))
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for PeripheralId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.hyphenated().fmt(f)
    }
}

impl FromStr for PeripheralId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

/// A peripheral as seen by discovery or the platform's known-device cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeripheralRef {
    pub id: PeripheralId,
    /// Advertised local name, if any.
    pub name: Option<String>,
    /// Signal strength of the last advertisement.
    pub rssi: Option<i16>,
}

impl PeripheralRef {
    pub fn new(id: PeripheralId, name: Option<String>, rssi: Option<i16>) -> Self {
        Self { id, name, rssi }
    }

    /// Name for logs and UI, falling back to the identifier.
    pub fn display_name(&self) -> String {
        match &self.name {
            Some(name) if !name.is_empty() => name.clone(),
            _ => self.id.to_string(),
        }
    }

    /// Discovery only lists devices that advertise a non-empty name.
    pub fn has_name(&self) -> bool {
        self.name.as_deref().is_some_and(|n| !n.is_empty())
    }
}

/// Radio power state reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RadioState {
    #[default]
    Unknown,
    PoweredOn,
    PoweredOff,
    Unauthorized,
}

/// Connection state observed by the UI. Only the connection manager mutates it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    RadioOff,
    Scanning,
    Connecting(PeripheralRef),
    Connected {
        peripheral: PeripheralRef,
        endpoint_ready: bool,
    },
    Error(PrinterError),
}

impl ConnectionState {
    /// Whether a print can be started right now (ignoring an in-flight transfer).
    pub fn is_ready(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connected {
                endpoint_ready: true,
                ..
            }
        )
    }

    /// The peripheral being connected to or connected, if any.
    pub fn peripheral(&self) -> Option<&PeripheralRef> {
        match self {
            ConnectionState::Connecting(p) => Some(p),
            ConnectionState::Connected { peripheral, .. } => Some(peripheral),
            _ => None,
        }
    }

    /// Short label for status output.
    pub fn label(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::RadioOff => "radio-off",
            ConnectionState::Scanning => "scanning",
            ConnectionState::Connecting(_) => "connecting",
            ConnectionState::Connected {
                endpoint_ready: false,
                ..
            } => "connected",
            ConnectionState::Connected { .. } => "ready",
            ConnectionState::Error(_) => "error",
        }
    }
}
