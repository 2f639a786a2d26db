pub mod commands;
pub mod config;
pub mod test_pattern;

use std::path::PathBuf;

use tracing_subscriber::EnvFilter;

use config::AppConfig;

/// Determine the data directory for the application.
/// Priority: MAGICPRINTER_DATA_DIR env var > ~/.magicprinter
pub fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("MAGICPRINTER_DATA_DIR") {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".magicprinter")
}

/// Load .env from multiple candidate paths.
pub fn load_dotenv() {
    let candidates = [".env", "../.env"];
    for path in &candidates {
        if dotenvy::from_filename(path).is_ok() {
            tracing::info!("Loaded .env from: {path}");
            return;
        }
    }
    tracing::debug!("No .env file found, using system environment variables");
}

pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
}

/// Load .env, create the data directory and read the configuration.
pub fn init_config() -> Result<AppConfig, anyhow::Error> {
    load_dotenv();

    let dir = data_dir();
    std::fs::create_dir_all(&dir)?;

    let config = AppConfig::load(dir)?;
    tracing::info!(
        data_dir = %config.data_dir.display(),
        dots = config.print_width_dots,
        chunk_size = config.chunk_size,
        chunk_delay_ms = config.chunk_delay_ms,
        "Settings loaded"
    );
    Ok(config)
}
