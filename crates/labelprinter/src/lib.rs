//! BLE thermal label printer library.
//!
//! Provides TSPL bitmap encoding, paced chunk transmission, and a connection
//! manager that owns discovery, connection lifecycle and reconnection for a
//! single label printer over Bluetooth Low Energy.

pub mod btle;
mod ble_init;
pub mod label;
pub mod manager;
pub mod mock;
pub mod preference;
pub mod protocol;
pub mod state;
pub mod transmit;
pub mod transport;

// Re-exports for convenience
pub use btle::BtleCentral;
pub use label::{LabelOptions, PrintDirection};
pub use manager::{ConnectionManager, ManagerConfig, PrintNotice, PrintTicket, PrinterHandle};
pub use preference::{FilePreferenceStore, MemoryPreferenceStore, PreferenceStore};
pub use protocol::tspl::PrintCommandBuffer;
pub use state::{ConnectionState, PeripheralId, PeripheralRef, RadioState};
pub use transmit::{TransferReport, TransmitOptions};
pub use transport::{Capability, Central, CentralEvent, Session, WritableEndpoint, WriteMode};

/// Print width in dots (4 inch head at 203 dpi, rounded to whole bytes).
pub const PRINT_WIDTH_DOTS: u32 = 800;

/// Errors that can occur during printer operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PrinterError {
    #[error("Bluetooth radio is off or not authorized")]
    RadioUnavailable,

    #[error("Printer {0} is not known to the Bluetooth stack")]
    DeviceNotFound(String),

    #[error("BLE connection error: {0}")]
    ConnectionFailed(String),

    #[error("Printer is not ready to print")]
    NotReady,

    #[error("Transfer aborted: printer disconnected")]
    TransferAborted,

    #[error("Image encoding failed: {0}")]
    EncodeFailed(String),

    #[error("Missing writable characteristic on connected device")]
    MissingCharacteristic,

    #[error("BLE write error: {0}")]
    Write(String),

    #[error("BLE scan error: {0}")]
    Scan(String),

    #[error("Already connected to {0}")]
    AlreadyConnected(String),

    #[error("Timed out after {0} ms")]
    Timeout(u64),

    #[error("Preference store error: {0}")]
    Preference(String),

    #[error("Connection manager has stopped")]
    ManagerStopped,
}

/// Result type alias for printer operations.
pub type Result<T> = std::result::Result<T, PrinterError>;
