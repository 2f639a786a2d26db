//! Setting value validation.

use regex::Regex;
use std::sync::LazyLock;

static RE_UUID_NO_HYPHEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9A-Fa-f]{32}$").unwrap());
static RE_UUID_HYPHEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[0-9A-Fa-f]{8}-[0-9A-Fa-f]{4}-[0-9A-Fa-f]{4}-[0-9A-Fa-f]{4}-[0-9A-Fa-f]{12}$")
        .unwrap()
});

/// Validate a setting value. Returns `Ok(())` if valid, or an error message.
pub fn validate_setting(key: &str, value: &str) -> Result<(), String> {
    match key {
        "PRINTER_ADDRESS" => {
            if !value.is_empty()
                && !RE_UUID_NO_HYPHEN.is_match(value)
                && !RE_UUID_HYPHEN.is_match(value)
            {
                return Err("invalid printer id (expected a UUID as shown by `scan`)".into());
            }
        }
        "CHUNK_SIZE" => validate_int_range(value, 20, 512)?,
        "CHUNK_DELAY_MS" => validate_int_range(value, 0, 100)?,
        "SCAN_TIMEOUT_SECS" => validate_int_range(value, 1, 120)?,
        "PRINT_WIDTH_DOTS" => validate_int_range(value, 8, 2400)?,
        "LABEL_WIDTH_IN" | "LABEL_HEIGHT_IN" => validate_float_range(value, 0.5, 12.0)?,
        "LABEL_GAP_MM" => validate_float_range(value, 0.0, 20.0)?,
        "PRINT_DIRECTION" => {
            if value != "0" && value != "1" {
                return Err("must be 0 or 1".into());
            }
        }
        "DRY_RUN_MODE" => {
            if value != "true" && value != "false" {
                return Err("must be 'true' or 'false'".into());
            }
        }
        _ => {}
    }
    Ok(())
}

fn validate_int_range(value: &str, min: i64, max: i64) -> Result<(), String> {
    let v: i64 = value.parse().map_err(|_| "must be an integer")?;
    if v < min || v > max {
        return Err(format!("must be between {min} and {max}"));
    }
    Ok(())
}

fn validate_float_range(value: &str, min: f32, max: f32) -> Result<(), String> {
    let v: f32 = value.parse().map_err(|_| "must be a number")?;
    if !(min..=max).contains(&v) {
        return Err(format!("must be between {min} and {max}"));
    }
    Ok(())
}
