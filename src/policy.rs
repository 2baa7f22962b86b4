//! Kiosk policy: allow-list, startup behavior and restriction flags.

use anyhow::{anyhow, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;
use thiserror::Error;

use crate::storage::{get_json, put_json, KeyValueStore, Namespace};

const POLICY_KEY: &str = "current";
const MAX_PACKAGE_ID_LEN: usize = 255;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PackageIdError {
    #[error("package id cannot be empty")]
    Empty,
    #[error("package id exceeds {MAX_PACKAGE_ID_LEN} characters")]
    TooLong,
    #[error("malformed package id '{0}'")]
    Malformed(String),
}

/// Android application id, e.g. `com.example.kiosk`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PackageId(String);

fn package_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z][A-Za-z0-9_]*(\.[A-Za-z][A-Za-z0-9_]*)+$")
            .unwrap_or_else(|e| panic!("package id pattern must compile: {e}"))
    })
}

impl PackageId {
    pub fn new(raw: &str) -> Result<Self, PackageIdError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(PackageIdError::Empty);
        }
        if trimmed.len() > MAX_PACKAGE_ID_LEN {
            return Err(PackageIdError::TooLong);
        }
        if !package_id_pattern().is_match(trimmed) {
            return Err(PackageIdError::Malformed(trimmed.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for PackageId {
    type Error = PackageIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<PackageId> for String {
    fn from(value: PackageId) -> Self {
        value.0
    }
}

impl fmt::Display for PackageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartupMode {
    /// No automatic action at boot.
    #[default]
    Normal,
    /// Start monitoring at boot without surfacing any UI.
    Silent,
    /// Start monitoring and enter enforcement after the boot delay.
    ImmediateKiosk,
    /// Bring up the kiosk launcher at boot without enforcing.
    LauncherOnly,
}

impl StartupMode {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_lowercase().replace('-', "_").as_str() {
            "normal" => Ok(Self::Normal),
            "silent" => Ok(Self::Silent),
            "immediate_kiosk" | "immediate" | "kiosk" => Ok(Self::ImmediateKiosk),
            "launcher_only" | "launcher" => Ok(Self::LauncherOnly),
            other => Err(anyhow!(
                "unsupported startup mode '{}'; expected 'normal', 'silent', 'immediate-kiosk', or 'launcher-only'",
                other
            )),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    pub allowed_packages: BTreeSet<PackageId>,
    pub startup_mode: StartupMode,
    #[serde(with = "duration_secs")]
    pub boot_delay: Duration,
    pub persistent: bool,
    pub is_privileged: bool,
}

impl Policy {
    pub fn new(own_package: &PackageId) -> Self {
        let mut allowed_packages = BTreeSet::new();
        allowed_packages.insert(own_package.clone());
        Self {
            allowed_packages,
            startup_mode: StartupMode::default(),
            boot_delay: Duration::ZERO,
            persistent: false,
            is_privileged: false,
        }
    }

    pub fn is_allowed(&self, pkg: &PackageId) -> bool {
        self.allowed_packages.contains(pkg)
    }

    /// `persistent` only takes effect while the backend reports privilege.
    pub fn persistent_effective(&self) -> bool {
        self.persistent && self.is_privileged
    }
}

/// Partial policy change applied with a single persist.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyUpdate {
    pub allowed_packages: Option<BTreeSet<PackageId>>,
    pub startup_mode: Option<StartupMode>,
    #[serde(default, with = "opt_duration_secs")]
    pub boot_delay: Option<Duration>,
    pub persistent: Option<bool>,
}

/// Owner of the persisted [`Policy`].
///
/// Every mutation re-establishes the own-package invariant and persists.
pub struct PolicyStore {
    own_package: PackageId,
    store: Arc<dyn KeyValueStore>,
    policy: Mutex<Policy>,
}

impl PolicyStore {
    pub fn load(store: Arc<dyn KeyValueStore>, own_package: PackageId) -> Result<Self> {
        let mut policy = get_json::<Policy>(store.as_ref(), Namespace::Policy, POLICY_KEY)?
            .unwrap_or_else(|| Policy::new(&own_package));
        policy.allowed_packages.insert(own_package.clone());
        Ok(Self {
            own_package,
            store,
            policy: Mutex::new(policy),
        })
    }

    pub fn own_package(&self) -> &PackageId {
        &self.own_package
    }

    pub fn snapshot(&self) -> Result<Policy> {
        Ok(self.lock()?.clone())
    }

    pub fn save(&self) -> Result<()> {
        let policy = self.lock()?;
        self.persist(&policy)
    }

    /// Re-reads the persisted policy, discarding unsaved in-memory state.
    pub fn reload(&self) -> Result<Policy> {
        let mut loaded = get_json::<Policy>(self.store.as_ref(), Namespace::Policy, POLICY_KEY)?
            .unwrap_or_else(|| Policy::new(&self.own_package));
        loaded.allowed_packages.insert(self.own_package.clone());
        let mut policy = self.lock()?;
        *policy = loaded.clone();
        Ok(loaded)
    }

    pub fn allowed_packages(&self) -> Result<BTreeSet<PackageId>> {
        Ok(self.lock()?.allowed_packages.clone())
    }

    pub fn set_allowed_packages(&self, packages: BTreeSet<PackageId>) -> Result<()> {
        self.mutate(|policy| policy.allowed_packages = packages)
    }

    pub fn allow(&self, pkg: PackageId) -> Result<()> {
        self.mutate(|policy| {
            policy.allowed_packages.insert(pkg);
        })
    }

    pub fn revoke(&self, pkg: &PackageId) -> Result<()> {
        self.mutate(|policy| {
            policy.allowed_packages.remove(pkg);
        })
    }

    pub fn is_allowed(&self, pkg: &PackageId) -> Result<bool> {
        Ok(self.lock()?.is_allowed(pkg))
    }

    pub fn startup_mode(&self) -> Result<StartupMode> {
        Ok(self.lock()?.startup_mode)
    }

    pub fn set_startup_mode(&self, mode: StartupMode) -> Result<()> {
        self.mutate(|policy| policy.startup_mode = mode)
    }

    pub fn boot_delay(&self) -> Result<Duration> {
        Ok(self.lock()?.boot_delay)
    }

    pub fn set_boot_delay(&self, delay: Duration) -> Result<()> {
        self.mutate(|policy| policy.boot_delay = delay)
    }

    pub fn persistent(&self) -> Result<bool> {
        Ok(self.lock()?.persistent)
    }

    pub fn set_persistent(&self, persistent: bool) -> Result<()> {
        self.mutate(|policy| policy.persistent = persistent)
    }

    pub fn is_privileged(&self) -> Result<bool> {
        Ok(self.lock()?.is_privileged)
    }

    /// Records the privilege state last reported by the backend.
    pub fn record_privilege(&self, privileged: bool) -> Result<()> {
        {
            let policy = self.lock()?;
            if policy.is_privileged == privileged {
                return Ok(());
            }
        }
        self.mutate(|policy| policy.is_privileged = privileged)
    }

    pub fn update(&self, update: PolicyUpdate) -> Result<Policy> {
        self.mutate_with(|policy| {
            if let Some(packages) = update.allowed_packages {
                policy.allowed_packages = packages;
            }
            if let Some(mode) = update.startup_mode {
                policy.startup_mode = mode;
            }
            if let Some(delay) = update.boot_delay {
                policy.boot_delay = delay;
            }
            if let Some(persistent) = update.persistent {
                policy.persistent = persistent;
            }
        })
    }

    fn mutate(&self, change: impl FnOnce(&mut Policy)) -> Result<()> {
        self.mutate_with(change).map(|_| ())
    }

    /// Applies `change`, restores the own package and returns what was saved.
    fn mutate_with(&self, change: impl FnOnce(&mut Policy)) -> Result<Policy> {
        let mut policy = self.lock()?;
        change(&mut policy);
        policy.allowed_packages.insert(self.own_package.clone());
        self.persist(&policy)?;
        Ok(policy.clone())
    }

    fn persist(&self, policy: &Policy) -> Result<()> {
        put_json(self.store.as_ref(), Namespace::Policy, POLICY_KEY, policy)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Policy>> {
        self.policy
            .lock()
            .map_err(|_| anyhow!("policy lock poisoned"))
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

mod opt_duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&d.as_secs()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_secs))
    }
}
