//! kioskd configuration.
//!
//! Resolution order: defaults, then the file named by `KIOSK_CONFIG` (JSON,
//! or TOML for a `.toml` extension), then environment overrides:
//! `KIOSK_DB_PATH`, `KIOSK_PACKAGE`, `KIOSK_TICK_SECS`, `KIOSK_MAX_ATTEMPTS`
//! and `KIOSK_LOCKOUT_SECS`. The result is validated before use.

use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::credential::CredentialLimits;
use crate::engine::DEFAULT_ADMIN_SESSION;
use crate::policy::PackageId;

const DEFAULT_DB_PATH: &str = "kiosk.db";
const DEFAULT_PACKAGE: &str = "com.kiosk.launcher";
const DEFAULT_TICK_SECS: u64 = 5;

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct KioskdConfigFile {
    db_path: Option<String>,
    own_package: Option<String>,
    tick_secs: Option<u64>,
    admin_session_secs: Option<u64>,
    credentials: Option<CredentialConfigFile>,
    simulator: Option<SimulatorConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct CredentialConfigFile {
    max_attempts: Option<u32>,
    lockout_secs: Option<u64>,
    min_secret_len: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct SimulatorConfigFile {
    privileged: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct KioskdConfig {
    pub db_path: String,
    pub own_package: PackageId,
    pub tick_interval: Duration,
    pub admin_session: Duration,
    pub credentials: CredentialLimits,
    /// Whether the simulated backend starts with device-owner privilege.
    pub simulate_privileged: bool,
}

impl KioskdConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("KIOSK_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: KioskdConfigFile) -> Result<Self> {
        let db_path = file.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string());
        let raw_package = file
            .own_package
            .unwrap_or_else(|| DEFAULT_PACKAGE.to_string());
        let own_package = PackageId::new(&raw_package)
            .map_err(|e| anyhow!("invalid own_package '{}': {}", raw_package, e))?;
        let creds = file.credentials.unwrap_or_default();
        let mut credentials = CredentialLimits::default();
        if let Some(max_attempts) = creds.max_attempts {
            credentials.max_attempts = max_attempts;
        }
        if let Some(lockout_secs) = creds.lockout_secs {
            credentials.lockout_duration = Duration::from_secs(lockout_secs);
        }
        if let Some(min_len) = creds.min_secret_len {
            credentials.min_secret_len = min_len;
        }
        Ok(Self {
            db_path,
            own_package,
            tick_interval: Duration::from_secs(file.tick_secs.unwrap_or(DEFAULT_TICK_SECS)),
            admin_session: file
                .admin_session_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_ADMIN_SESSION),
            credentials,
            simulate_privileged: file
                .simulator
                .and_then(|sim| sim.privileged)
                .unwrap_or(true),
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(path) = std::env::var("KIOSK_DB_PATH") {
            if !path.trim().is_empty() {
                self.db_path = path;
            }
        }
        if let Ok(package) = std::env::var("KIOSK_PACKAGE") {
            if !package.trim().is_empty() {
                self.own_package = PackageId::new(package.trim())
                    .map_err(|e| anyhow!("KIOSK_PACKAGE is invalid: {}", e))?;
            }
        }
        if let Ok(tick) = std::env::var("KIOSK_TICK_SECS") {
            let seconds: u64 = tick
                .parse()
                .map_err(|_| anyhow!("KIOSK_TICK_SECS must be an integer number of seconds"))?;
            self.tick_interval = Duration::from_secs(seconds);
        }
        if let Ok(attempts) = std::env::var("KIOSK_MAX_ATTEMPTS") {
            self.credentials.max_attempts = attempts
                .parse()
                .map_err(|_| anyhow!("KIOSK_MAX_ATTEMPTS must be a positive integer"))?;
        }
        if let Ok(lockout) = std::env::var("KIOSK_LOCKOUT_SECS") {
            let seconds: u64 = lockout.parse().map_err(|_| {
                anyhow!("KIOSK_LOCKOUT_SECS must be an integer number of seconds")
            })?;
            self.credentials.lockout_duration = Duration::from_secs(seconds);
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.db_path.trim().is_empty() {
            return Err(anyhow!("db_path must not be empty"));
        }
        if self.tick_interval.is_zero() {
            return Err(anyhow!("tick interval must be greater than zero"));
        }
        if self.admin_session.is_zero() {
            return Err(anyhow!("admin session must be greater than zero"));
        }
        if self.credentials.max_attempts == 0 {
            return Err(anyhow!("max_attempts must be greater than zero"));
        }
        if self.credentials.lockout_duration.is_zero() {
            return Err(anyhow!("lockout duration must be greater than zero"));
        }
        if self.credentials.min_secret_len == 0
            || self.credentials.default_secret.chars().count() < self.credentials.min_secret_len
        {
            return Err(anyhow!(
                "min_secret_len must be between 1 and the default secret length ({})",
                self.credentials.default_secret.chars().count()
            ));
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<KioskdConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let cfg = KioskdConfig::from_file(KioskdConfigFile::default()).expect("defaults");
        assert_eq!(cfg.db_path, "kiosk.db");
        assert_eq!(cfg.own_package.as_str(), "com.kiosk.launcher");
        assert_eq!(cfg.tick_interval, Duration::from_secs(5));
        assert_eq!(cfg.admin_session, Duration::from_secs(30 * 60));
        assert_eq!(cfg.credentials, CredentialLimits::default());
        assert!(cfg.simulate_privileged);
        cfg.validate().expect("defaults are valid");
    }

    fn defaults() -> KioskdConfig {
        KioskdConfig::from_file(KioskdConfigFile::default()).expect("defaults")
    }

    #[test]
    fn rejects_invalid_limits() {
        let mut cfg = defaults();
        cfg.credentials.max_attempts = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = defaults();
        cfg.credentials.min_secret_len = 8;
        assert!(cfg.validate().is_err());

        let mut cfg = defaults();
        cfg.tick_interval = Duration::ZERO;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_invalid_package_in_file() {
        let file = KioskdConfigFile {
            own_package: Some("not a package".to_string()),
            ..KioskdConfigFile::default()
        };
        assert!(KioskdConfig::from_file(file).is_err());
    }
}
