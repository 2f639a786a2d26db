//! Runtime application configuration loaded from the environment.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use labelprinter::manager::DEFAULT_SCAN_TIMEOUT;
use labelprinter::transmit::{DEFAULT_CHUNK_DELAY, DEFAULT_CHUNK_SIZE};
use labelprinter::{LabelOptions, ManagerConfig, PeripheralId, PrintDirection, TransmitOptions};

use super::validation::validate_setting;

/// Runtime configuration populated from `.env` and the process environment.
#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub printer_address: Option<PeripheralId>,
    pub chunk_size: usize,
    pub chunk_delay_ms: u64,
    pub scan_timeout_secs: u64,
    pub print_width_dots: u32,
    pub label_width_in: f32,
    pub label_height_in: f32,
    pub label_gap_mm: f32,
    pub print_direction: PrintDirection,
    pub dry_run_mode: bool,
}

impl AppConfig {
    /// Defaults for everything, rooted at `data_dir`.
    pub fn with_data_dir(data_dir: PathBuf) -> Self {
        let label = LabelOptions::default();
        Self {
            data_dir,
            printer_address: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_delay_ms: DEFAULT_CHUNK_DELAY.as_millis() as u64,
            scan_timeout_secs: DEFAULT_SCAN_TIMEOUT.as_secs(),
            print_width_dots: label.dot_width,
            label_width_in: label.width_in,
            label_height_in: label.height_in,
            label_gap_mm: label.gap_mm,
            print_direction: label.direction,
            dry_run_mode: false,
        }
    }

    /// Load configuration from environment variables.
    pub fn load(data_dir: PathBuf) -> Result<Self, anyhow::Error> {
        Self::from_lookup(data_dir, |key| std::env::var(key).ok())
    }

    /// Load configuration through `lookup`. Unset or blank keys keep their
    /// defaults; set keys must pass validation.
    pub fn from_lookup<F>(data_dir: PathBuf, lookup: F) -> Result<Self, anyhow::Error>
    where
        F: Fn(&str) -> Option<String>,
    {
        let g = |key: &str| -> Result<Option<String>, anyhow::Error> {
            let Some(value) = lookup(key).map(|v| v.trim().to_string()) else {
                return Ok(None);
            };
            if value.is_empty() {
                return Ok(None);
            }
            validate_setting(key, &value)
                .map_err(|e| anyhow::anyhow!("validation error for {key}: {e}"))?;
            Ok(Some(value))
        };

        let defaults = Self::with_data_dir(data_dir);

        let printer_address = g("PRINTER_ADDRESS")?
            .map(|v| PeripheralId::from_str(&v))
            .transpose()
            .context("PRINTER_ADDRESS is not a valid printer id")?;

        let print_direction = match g("PRINT_DIRECTION")? {
            Some(v) => v
                .parse::<u8>()
                .ok()
                .and_then(PrintDirection::from_flag)
                .unwrap_or(defaults.print_direction),
            None => defaults.print_direction,
        };

        Ok(Self {
            printer_address,
            chunk_size: parse_or(g("CHUNK_SIZE")?, defaults.chunk_size),
            chunk_delay_ms: parse_or(g("CHUNK_DELAY_MS")?, defaults.chunk_delay_ms),
            scan_timeout_secs: parse_or(g("SCAN_TIMEOUT_SECS")?, defaults.scan_timeout_secs),
            print_width_dots: parse_or(g("PRINT_WIDTH_DOTS")?, defaults.print_width_dots),
            label_width_in: parse_or(g("LABEL_WIDTH_IN")?, defaults.label_width_in),
            label_height_in: parse_or(g("LABEL_HEIGHT_IN")?, defaults.label_height_in),
            label_gap_mm: parse_or(g("LABEL_GAP_MM")?, defaults.label_gap_mm),
            print_direction,
            dry_run_mode: g("DRY_RUN_MODE")?.is_some_and(|v| v == "true"),
            ..defaults
        })
    }

    pub fn label_options(&self) -> LabelOptions {
        LabelOptions::new()
            .with_dot_width(self.print_width_dots)
            .with_size(self.label_width_in, self.label_height_in)
            .with_gap_mm(self.label_gap_mm)
            .with_direction(self.print_direction)
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_timeout_secs)
    }

    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            scan_timeout: self.scan_timeout(),
            label: self.label_options(),
            transmit: TransmitOptions {
                chunk_size: self.chunk_size,
                chunk_delay: Duration::from_millis(self.chunk_delay_ms),
                ..TransmitOptions::default()
            },
        }
    }
}

fn parse_or<T: FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|v| v.parse().ok()).unwrap_or(default)
}
