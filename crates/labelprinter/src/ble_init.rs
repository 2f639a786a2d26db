//! Retry and error hints for BLE adapter start-up (macOS CentralManager).
//!
//! [`BtleCentral::new`](crate::btle::BtleCentral::new) retries adapter
//! discovery up to [`RETRY_COUNT`] times, [`RETRY_DELAY`] apart, while the
//! error is transient. Anything else goes through [`wrap_ble_init_error`] so a
//! denied or powered-off radio reaches the connection manager as
//! [`PrinterError::RadioUnavailable`] and shows up as the radio error state
//! rather than a failed connection.

use std::time::Duration;

use crate::PrinterError;

/// Attempts before giving up on a transient start-up error (about 3 s total).
pub(crate) const RETRY_COUNT: usize = 6;
/// Pause between start-up attempts.
pub(crate) const RETRY_DELAY: Duration = Duration::from_millis(500);

/// CoreBluetooth reports `have=0` (unknown) for a short while after the
/// manager is created; the adapter becomes usable once it settles.
///
/// btleplug surfaces this as a connection error string, which is all there is
/// to match on. Always `false` off macOS.
pub(crate) fn is_central_manager_transient(err: &PrinterError) -> bool {
    #[cfg(target_os = "macos")]
    {
        if let PrinterError::ConnectionFailed(msg) = err {
            let msg = msg.to_ascii_lowercase();
            return msg.contains("central manager has invalid state") && msg.contains("have=0");
        }
    }
    #[cfg(not(target_os = "macos"))]
    let _ = err;

    false
}

/// Map a permanent CentralManager failure to `RadioUnavailable` with a hint.
///
/// The hint about Bluetooth privacy settings is logged here because
/// `RadioUnavailable` carries no message. Other errors pass through unchanged.
pub(crate) fn wrap_ble_init_error(err: PrinterError) -> PrinterError {
    #[cfg(target_os = "macos")]
    {
        if let PrinterError::ConnectionFailed(msg) = &err {
            if msg
                .to_ascii_lowercase()
                .contains("central manager has invalid state")
            {
                tracing::error!(
                    "{msg} (macOS: turn Bluetooth on and allow this app under System Settings > Privacy & Security > Bluetooth)"
                );
                return PrinterError::RadioUnavailable;
            }
        }
    }

    err
}
