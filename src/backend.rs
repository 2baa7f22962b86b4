//! Boundary to platform restriction primitives.
//!
//! The engine never calls the platform itself: it emits [`BackendCommand`]s,
//! and the runtime applies them through an [`EnforcementBackend`]. Capability
//! queries go through [`DeviceCapabilities`] so vendor differences stay out
//! of the decision logic.

use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

use crate::policy::PackageId;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// The platform refuses this operation, e.g. hiding a system package.
    #[error("operation not supported: {0}")]
    Unsupported(String),
    #[error("device-owner privilege required")]
    PrivilegeMissing,
    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

/// Vendor-specific capability differences.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct VendorQuirks {
    pub package_hiding: bool,
    pub system_ui_suppression: bool,
}

impl Default for VendorQuirks {
    fn default() -> Self {
        Self {
            package_hiding: true,
            system_ui_suppression: true,
        }
    }
}

/// Live, read-only device state consulted by the engine.
pub trait DeviceCapabilities {
    fn has_privilege(&self) -> bool;

    fn vendor_quirks(&self) -> VendorQuirks {
        VendorQuirks::default()
    }

    fn foreground_package(&self) -> Result<Option<PackageId>, BackendError>;

    fn settings_tamper_indicators(&self) -> Result<Vec<String>, BackendError>;

    fn root_indicators(&self) -> Result<Vec<String>, BackendError>;
}

pub trait EnforcementBackend: DeviceCapabilities + Send {
    fn hide_package(&self, pkg: &PackageId) -> Result<(), BackendError>;

    fn unhide_package(&self, pkg: &PackageId) -> Result<(), BackendError>;

    fn redirect_to_kiosk_app(&self) -> Result<(), BackendError>;

    fn lock_device_now(&self) -> Result<(), BackendError>;

    fn set_allowed_packages(&self, packages: &BTreeSet<PackageId>) -> Result<(), BackendError>;

    fn suppress_system_ui(&self) -> Result<(), BackendError>;

    fn release_restrictions(&self) -> Result<(), BackendError>;

    fn cancel_notification(&self, pkg: &PackageId) -> Result<(), BackendError>;

    fn pin_as_persistent_launcher(&self) -> Result<(), BackendError>;
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "command", content = "args", rename_all = "snake_case")]
pub enum BackendCommand {
    RedirectToKioskApp,
    LockDeviceNow,
    HidePackage(PackageId),
    UnhidePackage(PackageId),
    SetAllowedPackages(BTreeSet<PackageId>),
    SuppressSystemUi,
    ReleaseRestrictions,
    CancelNotification(PackageId),
    PinAsPersistentLauncher,
}

impl BackendCommand {
    pub fn apply(&self, backend: &dyn EnforcementBackend) -> Result<(), BackendError> {
        match self {
            BackendCommand::RedirectToKioskApp => backend.redirect_to_kiosk_app(),
            BackendCommand::LockDeviceNow => backend.lock_device_now(),
            BackendCommand::HidePackage(pkg) => backend.hide_package(pkg),
            BackendCommand::UnhidePackage(pkg) => backend.unhide_package(pkg),
            BackendCommand::SetAllowedPackages(packages) => backend.set_allowed_packages(packages),
            BackendCommand::SuppressSystemUi => backend.suppress_system_ui(),
            BackendCommand::ReleaseRestrictions => backend.release_restrictions(),
            BackendCommand::CancelNotification(pkg) => backend.cancel_notification(pkg),
            BackendCommand::PinAsPersistentLauncher => backend.pin_as_persistent_launcher(),
        }
    }
}

#[derive(Debug, Default)]
struct SimulatedDevice {
    privileged: bool,
    quirks: VendorQuirks,
    foreground: Option<PackageId>,
    tamper_indicators: Vec<String>,
    root_indicators: Vec<String>,
    failing_probe: Option<String>,
    unhideable: BTreeSet<PackageId>,
    hidden: BTreeSet<PackageId>,
    executed: Vec<BackendCommand>,
}

/// In-process stand-in for the platform backend.
///
/// Applies commands to a simulated device and records them. Clones share the
/// same device, so a handle kept outside the runtime observes every command.
#[derive(Clone, Debug, Default)]
pub struct SimulatedBackend {
    device: Arc<Mutex<SimulatedDevice>>,
}

impl SimulatedBackend {
    pub fn new(privileged: bool) -> Self {
        let backend = Self::default();
        backend.device().privileged = privileged;
        backend
    }

    pub fn set_privileged(&self, privileged: bool) {
        self.device().privileged = privileged;
    }

    pub fn set_quirks(&self, quirks: VendorQuirks) {
        self.device().quirks = quirks;
    }

    pub fn set_foreground(&self, pkg: Option<PackageId>) {
        self.device().foreground = pkg;
    }

    pub fn set_tamper_indicators(&self, indicators: Vec<String>) {
        self.device().tamper_indicators = indicators;
    }

    pub fn set_root_indicators(&self, indicators: Vec<String>) {
        self.device().root_indicators = indicators;
    }

    /// Makes every live probe fail with `reason`.
    pub fn fail_probes(&self, reason: Option<String>) {
        self.device().failing_probe = reason;
    }

    pub fn mark_unhideable(&self, pkg: PackageId) {
        self.device().unhideable.insert(pkg);
    }

    pub fn hidden_packages(&self) -> BTreeSet<PackageId> {
        self.device().hidden.clone()
    }

    pub fn executed(&self) -> Vec<BackendCommand> {
        self.device().executed.clone()
    }

    pub fn take_executed(&self) -> Vec<BackendCommand> {
        std::mem::take(&mut self.device().executed)
    }

    fn device(&self) -> MutexGuard<'_, SimulatedDevice> {
        // A poisoned simulator is still inspectable.
        self.device
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record(&self, command: BackendCommand) -> Result<(), BackendError> {
        log::info!("backend: {:?}", command);
        self.device().executed.push(command);
        Ok(())
    }

    fn probe<T>(&self, read: impl FnOnce(&SimulatedDevice) -> T) -> Result<T, BackendError> {
        let device = self.device();
        match &device.failing_probe {
            Some(reason) => Err(BackendError::Unavailable(reason.clone())),
            None => Ok(read(&device)),
        }
    }

    fn require_privilege(&self) -> Result<(), BackendError> {
        if self.device().privileged {
            Ok(())
        } else {
            Err(BackendError::PrivilegeMissing)
        }
    }
}

impl DeviceCapabilities for SimulatedBackend {
    fn has_privilege(&self) -> bool {
        self.device().privileged
    }

    fn vendor_quirks(&self) -> VendorQuirks {
        self.device().quirks
    }

    fn foreground_package(&self) -> Result<Option<PackageId>, BackendError> {
        self.probe(|device| device.foreground.clone())
    }

    fn settings_tamper_indicators(&self) -> Result<Vec<String>, BackendError> {
        self.probe(|device| device.tamper_indicators.clone())
    }

    fn root_indicators(&self) -> Result<Vec<String>, BackendError> {
        self.probe(|device| device.root_indicators.clone())
    }
}

impl EnforcementBackend for SimulatedBackend {
    fn hide_package(&self, pkg: &PackageId) -> Result<(), BackendError> {
        self.require_privilege()?;
        if self.device().unhideable.contains(pkg) {
            return Err(BackendError::Unsupported(format!(
                "{} is a system package",
                pkg
            )));
        }
        self.device().hidden.insert(pkg.clone());
        self.record(BackendCommand::HidePackage(pkg.clone()))
    }

    fn unhide_package(&self, pkg: &PackageId) -> Result<(), BackendError> {
        self.device().hidden.remove(pkg);
        self.record(BackendCommand::UnhidePackage(pkg.clone()))
    }

    fn redirect_to_kiosk_app(&self) -> Result<(), BackendError> {
        self.record(BackendCommand::RedirectToKioskApp)
    }

    fn lock_device_now(&self) -> Result<(), BackendError> {
        self.record(BackendCommand::LockDeviceNow)
    }

    fn set_allowed_packages(&self, packages: &BTreeSet<PackageId>) -> Result<(), BackendError> {
        self.require_privilege()?;
        self.record(BackendCommand::SetAllowedPackages(packages.clone()))
    }

    fn suppress_system_ui(&self) -> Result<(), BackendError> {
        self.record(BackendCommand::SuppressSystemUi)
    }

    fn release_restrictions(&self) -> Result<(), BackendError> {
        self.record(BackendCommand::ReleaseRestrictions)
    }

    fn cancel_notification(&self, pkg: &PackageId) -> Result<(), BackendError> {
        self.record(BackendCommand::CancelNotification(pkg.clone()))
    }

    fn pin_as_persistent_launcher(&self) -> Result<(), BackendError> {
        self.require_privilege()?;
        self.record(BackendCommand::PinAsPersistentLauncher)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pkg(raw: &str) -> PackageId {
        PackageId::new(raw).expect("valid package id")
    }

    #[test]
    fn hiding_a_system_package_is_unsupported() {
        let backend = SimulatedBackend::new(true);
        backend.mark_unhideable(pkg("com.android.systemui"));
        let err = BackendCommand::HidePackage(pkg("com.android.systemui"))
            .apply(&backend)
            .unwrap_err();
        assert!(matches!(err, BackendError::Unsupported(_)));
        assert!(backend.executed().is_empty());

        BackendCommand::HidePackage(pkg("com.evil.game"))
            .apply(&backend)
            .expect("hide");
        assert!(backend.hidden_packages().contains(&pkg("com.evil.game")));
    }

    #[test]
    fn privileged_commands_require_privilege() {
        let backend = SimulatedBackend::new(false);
        let err = BackendCommand::SetAllowedPackages(BTreeSet::new())
            .apply(&backend)
            .unwrap_err();
        assert_eq!(err, BackendError::PrivilegeMissing);
        BackendCommand::RedirectToKioskApp
            .apply(&backend)
            .expect("redirect needs no privilege");
        assert_eq!(backend.executed(), vec![BackendCommand::RedirectToKioskApp]);
    }

    #[test]
    fn failing_probes_report_unavailable() {
        let backend = SimulatedBackend::new(true);
        backend.fail_probes(Some("accessibility service disconnected".to_string()));
        assert!(matches!(
            backend.foreground_package(),
            Err(BackendError::Unavailable(_))
        ));
        backend.fail_probes(None);
        assert_eq!(backend.root_indicators(), Ok(Vec::new()));
    }
}
