//! CLI command implementations.
//!
//! Each command builds its own radio backend and connection manager, runs to
//! completion and tears the link down again.
//!
//! The manager is always handed a [`MemoryPreferenceStore`] seeded with the
//! resolved target, so its restore policy connects to that printer and nothing
//! else. The on-disk [`FilePreferenceStore`] is only written here, by
//! [`print_image`] once a real printer is ready. A dry run, or an explicit
//! `--device` that never connects, leaves the saved printer alone.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use image::DynamicImage;
use serde::Serialize;

use labelprinter::mock::MockCentral;
use labelprinter::protocol::{decode_image, encode_bytes};
use labelprinter::{
    BtleCentral, Central, ConnectionManager, ConnectionState, FilePreferenceStore,
    MemoryPreferenceStore, PeripheralId, PeripheralRef, PreferenceStore, PrintCommandBuffer,
    PrinterHandle, RadioState, TransferReport,
};

use crate::config::AppConfig;

/// Name advertised by the dry-run printer.
pub const SIMULATED_PRINTER_NAME: &str = "Simulated TSPL Printer";

/// Budget for connect plus endpoint resolution, on top of any scan.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(20);

/// Pause before disconnecting so queued unacknowledged writes reach the printer.
const DRAIN_DELAY: Duration = Duration::from_millis(500);

struct Backend {
    central: Arc<dyn Central>,
    simulated: Option<(MockCentral, PeripheralRef)>,
}

impl Backend {
    async fn open(dry_run: bool) -> Result<Self, anyhow::Error> {
        if dry_run {
            let (mock, printer) = MockCentral::simulated_printer(SIMULATED_PRINTER_NAME);
            tracing::info!(id = %printer.id, "Dry run: using simulated printer");
            return Ok(Self {
                central: Arc::new(mock.clone()),
                simulated: Some((mock, printer)),
            });
        }

        let central = BtleCentral::new()
            .await
            .context("Failed to initialize Bluetooth")?;
        Ok(Self {
            central: Arc::new(central),
            simulated: None,
        })
    }
}

/// Result of a print command.
#[derive(Debug)]
pub struct PrintOutcome {
    pub printer: PeripheralRef,
    pub report: TransferReport,
    /// Where the transmitted bytes were written, in dry-run mode.
    pub dump: Option<PathBuf>,
}

/// Snapshot reported by `status`.
#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub radio: String,
    pub radio_error: Option<String>,
    pub saved_printer: Option<String>,
    pub configured_printer: Option<String>,
    pub data_dir: String,
    pub dry_run: bool,
}

/// Scan for one scan window and return the named printers found.
pub async fn scan(config: &AppConfig, dry_run: bool) -> Result<Vec<PeripheralRef>, anyhow::Error> {
    let backend = Backend::open(dry_run).await?;
    let handle = ConnectionManager::spawn(
        backend.central.clone(),
        Arc::new(MemoryPreferenceStore::new()),
        config.manager_config(),
    );

    handle.start_scanning().await.context("Failed to start scan")?;
    handle
        .wait_for_state(
            |s| *s != ConnectionState::Scanning,
            config.scan_timeout() + CONNECT_TIMEOUT,
        )
        .await?;

    let devices = handle.discovered();
    tracing::info!(count = devices.len(), "Scan finished");
    Ok(devices)
}

/// Read and decode an image file.
pub fn load_image(path: &Path) -> Result<DynamicImage, anyhow::Error> {
    let bytes = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    decode_image(&bytes).with_context(|| format!("Failed to decode {}", path.display()))
}

/// Connect to a printer and send one label.
///
/// The printer is `device`, else `PRINTER_ADDRESS`, else the saved printer.
/// In dry-run mode the simulated printer is always used.
pub async fn print_image(
    config: &AppConfig,
    dry_run: bool,
    image: DynamicImage,
    device: Option<PeripheralId>,
) -> Result<PrintOutcome, anyhow::Error> {
    let backend = Backend::open(dry_run).await?;
    let store = FilePreferenceStore::in_dir(&config.data_dir);

    let target = match &backend.simulated {
        Some((_, printer)) => {
            if device.is_some() {
                tracing::warn!("Dry run: ignoring --device");
            }
            printer.id
        }
        None => match device.or(config.printer_address) {
            Some(id) => id,
            None => store
                .load()?
                .context("No printer selected: run `magicprinter scan` and pass --device")?,
        },
    };

    let handle = connect_printer(config, &backend, target).await?;
    let printer = handle
        .state()
        .peripheral()
        .cloned()
        .context("Connection dropped before printing")?;

    if backend.simulated.is_none() {
        if let Err(e) = store.save(&target) {
            tracing::warn!(error = %e, "Failed to save printer preference");
        }
    }

    let ticket = handle.print(image).await.context("Printer rejected the job")?;
    tracing::info!(job = ticket.job(), printer = %printer.display_name(), "Sending label");
    let report = ticket.wait().await.context("Print failed")?;

    tokio::time::sleep(DRAIN_DELAY).await;
    handle.disconnect().await?;

    let dump = match &backend.simulated {
        Some((mock, _)) => Some(write_dry_run_dump(&config.data_dir, &mock.written_bytes())?),
        None => None,
    };

    Ok(PrintOutcome {
        printer,
        report,
        dump,
    })
}

/// Spawn a manager whose restore policy targets `target`, then wait until it
/// is ready, scanning for the printer if the platform doesn't know it yet.
async fn connect_printer(
    config: &AppConfig,
    backend: &Backend,
    target: PeripheralId,
) -> Result<PrinterHandle, anyhow::Error> {
    let handle = ConnectionManager::spawn(
        backend.central.clone(),
        Arc::new(MemoryPreferenceStore::with_value(target)),
        config.manager_config(),
    );

    let settled = |s: &ConnectionState| {
        s.is_ready()
            || matches!(
                s,
                ConnectionState::Scanning | ConnectionState::RadioOff | ConnectionState::Error(_)
            )
    };
    let mut state = handle
        .wait_for_state(settled, config.scan_timeout() + CONNECT_TIMEOUT)
        .await
        .context("Printer did not respond")?;

    if state == ConnectionState::Scanning {
        tracing::info!(id = %target, "Printer not known yet, scanning");
        let mut devices = handle.subscribe_devices();
        let found = match tokio::time::timeout(
            config.scan_timeout(),
            devices.wait_for(|list| list.iter().any(|p| p.id == target)),
        )
        .await
        {
            Ok(Ok(list)) => list.iter().find(|p| p.id == target).cloned(),
            _ => None,
        };
        let peripheral = found.with_context(|| format!("Printer {target} not found"))?;

        handle.connect(peripheral).await?;
        state = handle
            .wait_for_state(
                |s| {
                    s.is_ready()
                        || matches!(
                            s,
                            ConnectionState::Disconnected
                                | ConnectionState::RadioOff
                                | ConnectionState::Error(_)
                        )
                },
                CONNECT_TIMEOUT,
            )
            .await
            .context("Printer did not respond")?;
    }

    match state {
        s if s.is_ready() => Ok(handle),
        ConnectionState::RadioOff => bail!("Bluetooth is powered off"),
        ConnectionState::Error(err) => Err(err).context("Failed to connect"),
        other => bail!("Printer is not ready ({})", other.label()),
    }
}

fn write_dry_run_dump(dir: &Path, bytes: &[u8]) -> Result<PathBuf, anyhow::Error> {
    let name = format!(
        "dry-run-{}.tspl",
        chrono::Local::now().format("%Y%m%d-%H%M%S%.3f")
    );
    let path = dir.join(name);
    std::fs::create_dir_all(dir)?;
    std::fs::write(&path, bytes).with_context(|| format!("Failed to write {}", path.display()))?;
    tracing::info!(path = %path.display(), bytes = bytes.len(), "Dry run output written");
    Ok(path)
}

/// Encode an image file to a command buffer on disk without touching the radio.
pub fn encode_file(
    config: &AppConfig,
    input: &Path,
    output: &Path,
) -> Result<PrintCommandBuffer, anyhow::Error> {
    let bytes = std::fs::read(input).with_context(|| format!("Failed to read {}", input.display()))?;
    let buffer = encode_bytes(&bytes, &config.label_options())
        .with_context(|| format!("Failed to encode {}", input.display()))?;
    std::fs::write(output, buffer.as_bytes())
        .with_context(|| format!("Failed to write {}", output.display()))?;
    Ok(buffer)
}

/// Report radio state and the saved printer.
pub async fn status(config: &AppConfig, dry_run: bool) -> Result<StatusReport, anyhow::Error> {
    let store = FilePreferenceStore::in_dir(&config.data_dir);
    let saved_printer = store.load()?.map(|id| id.to_string());

    let (radio, radio_error) = match Backend::open(dry_run).await {
        Ok(backend) => match backend.central.radio_state().await {
            Ok(state) => (radio_label(state).to_string(), None),
            Err(e) => ("unknown".to_string(), Some(e.to_string())),
        },
        Err(e) => ("unavailable".to_string(), Some(format!("{e:#}"))),
    };

    Ok(StatusReport {
        radio,
        radio_error,
        saved_printer,
        configured_printer: config.printer_address.map(|id| id.to_string()),
        data_dir: config.data_dir.display().to_string(),
        dry_run,
    })
}

/// Clear the saved printer. Returns the id that was forgotten.
pub fn forget(config: &AppConfig) -> Result<Option<PeripheralId>, anyhow::Error> {
    let store = FilePreferenceStore::in_dir(&config.data_dir);
    let previous = store.load()?;
    store.clear()?;
    Ok(previous)
}

fn radio_label(state: RadioState) -> &'static str {
    match state {
        RadioState::Unknown => "unknown",
        RadioState::PoweredOn => "powered-on",
        RadioState::PoweredOff => "powered-off",
        RadioState::Unauthorized => "unauthorized",
    }
}
