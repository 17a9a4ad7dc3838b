//! Persistent bridge settings (`config.json` in the platform config dir).

pub mod paths;

use std::fs;
use std::io::Write;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

const SETTINGS_SCHEMA_VERSION: u32 = 1;

/// How output reports reach the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputTransfer {
    /// HID class SET_REPORT on the control pipe.
    #[default]
    SetReport,
    /// Interrupt OUT endpoint.
    Interrupt,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeSettings {
    pub version: u32,
    /// Vendor used by `request` when the caller names none.
    pub default_vendor_id: u16,
    pub permission_timeout_ms: u64,
    pub poll_timeout_ms: u64,
    pub retry_delay_ms: u64,
    pub max_consecutive_errors: u32,
    pub close_grace_ms: u64,
    pub heartbeat_secs: u64,
    pub output_timeout_ms: u64,
    pub output_transfer: OutputTransfer,
    pub detach_kernel_driver: bool,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            version: SETTINGS_SCHEMA_VERSION,
            default_vendor_id: 0x0801,
            permission_timeout_ms: 30_000,
            poll_timeout_ms: 100,
            retry_delay_ms: 100,
            max_consecutive_errors: 10,
            close_grace_ms: 1_000,
            heartbeat_secs: 30,
            output_timeout_ms: 5_000,
            output_transfer: OutputTransfer::SetReport,
            detach_kernel_driver: true,
        }
    }
}

impl BridgeSettings {
    pub fn permission_timeout(&self) -> Duration {
        Duration::from_millis(self.permission_timeout_ms)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    pub fn output_timeout(&self) -> Duration {
        Duration::from_millis(self.output_timeout_ms)
    }
}

/// Load from the default location, falling back to defaults when absent.
pub fn load() -> anyhow::Result<BridgeSettings> {
    load_from_path(&paths::settings_path()?)
}

pub fn load_from_path(path: &Path) -> anyhow::Result<BridgeSettings> {
    if !path.exists() {
        debug!(path = %path.display(), "no settings file, using defaults");
        return Ok(BridgeSettings::default());
    }

    let raw = fs::read_to_string(path)?;
    let mut s: BridgeSettings = serde_json::from_str(&raw)?;

    if s.version == 0 {
        s.version = SETTINGS_SCHEMA_VERSION;
    }
    if s.version != SETTINGS_SCHEMA_VERSION {
        anyhow::bail!("unsupported settings version: {}", s.version);
    }

    // A zero ceiling would stop the pump before its first read.
    if s.max_consecutive_errors == 0 {
        s.max_consecutive_errors = 1;
    }

    Ok(s)
}

pub fn save(settings: &BridgeSettings) -> anyhow::Result<()> {
    save_to_path(settings, &paths::settings_path()?)
}

pub fn save_to_path(settings: &BridgeSettings, path: &Path) -> anyhow::Result<()> {
    if settings.version != SETTINGS_SCHEMA_VERSION {
        anyhow::bail!(
            "refusing to save unsupported settings version: {}",
            settings.version
        );
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let tmp_path = path.with_extension("json.tmp");
    let json = serde_json::to_vec_pretty(settings)?;

    {
        let mut f = fs::File::create(&tmp_path)?;
        f.write_all(&json)?;
        f.write_all(b"\n")?;
        f.sync_all()?;
    }

    // On Windows, rename over an existing file may fail; remove first.
    if cfg!(windows) && path.exists() {
        let _ = fs::remove_file(path);
    }
    fs::rename(tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let s = load_from_path(&dir.path().join("config.json")).unwrap();
        assert_eq!(s, BridgeSettings::default());
        assert_eq!(s.permission_timeout(), Duration::from_secs(30));
        assert_eq!(s.max_consecutive_errors, 10);
    }

    #[test]
    fn partial_file_fills_remaining_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{ "poll_timeout_ms": 20, "output_transfer": "interrupt" }"#).unwrap();

        let s = load_from_path(&path).unwrap();
        assert_eq!(s.poll_timeout(), Duration::from_millis(20));
        assert_eq!(s.output_transfer, OutputTransfer::Interrupt);
        assert_eq!(s.default_vendor_id, 0x0801);
        assert_eq!(s.version, SETTINGS_SCHEMA_VERSION);
    }

    #[test]
    fn save_then_load_preserves_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let s = BridgeSettings {
            default_vendor_id: 0x046d,
            close_grace_ms: 250,
            ..BridgeSettings::default()
        };

        save_to_path(&s, &path).unwrap();
        assert!(!path.with_extension("json.tmp").exists());
        assert_eq!(load_from_path(&path).unwrap(), s);
    }

    #[test]
    fn unknown_version_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{ "version": 7 }"#).unwrap();
        assert!(load_from_path(&path).is_err());
    }

    #[test]
    fn zero_error_ceiling_is_raised_to_one() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{ "max_consecutive_errors": 0 }"#).unwrap();
        assert_eq!(load_from_path(&path).unwrap().max_consecutive_errors, 1);
    }
}
