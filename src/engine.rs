//! Enforcement state machine.
//!
//! The engine is level-triggered: every event is evaluated against the
//! current policy snapshot, security status and lockout state, and yields a
//! [`Reaction`] (backend commands, recorded violations, outbound signals and
//! an optional delayed follow-up event). The engine performs no platform
//! calls itself; it only reads device capabilities.

use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use crate::backend::{BackendCommand, DeviceCapabilities};
use crate::clock::{deadline_after, duration_until, Clock};
use crate::credential::{CredentialGate, VerifyOutcome};
use crate::event::{AdminSecret, EventKind};
use crate::policy::{PackageId, Policy, PolicyStore, StartupMode};
use crate::security::{SecurityStatus, Severity, SeverityAction, Violation, ViolationKind};

pub const DEFAULT_ADMIN_SESSION: Duration = Duration::from_secs(30 * 60);

/// Failed attempts at which authentication failures are logged as `Medium`.
const REPEATED_FAILURE_THRESHOLD: u32 = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineMode {
    Inactive,
    Monitoring,
    Enforcing,
}

/// Outbound notifications for the rendering layer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum Signal {
    ModeChanged { mode: EngineMode },
    PrivilegeRequired,
    StatusUpdated { status: SecurityStatus },
    AuthGranted { session_secs: u64 },
    AuthDenied { remaining_attempts: u32 },
    LockedOut { remaining_secs: u64 },
    AuthUnavailable,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FollowUp {
    pub delay: Duration,
    pub event: FollowUpEvent,
}

/// Events the engine may schedule for itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FollowUpEvent {
    Enable,
}

impl FollowUpEvent {
    pub fn into_event(self) -> EventKind {
        match self {
            FollowUpEvent::Enable => EventKind::Enable,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Reaction {
    pub commands: Vec<BackendCommand>,
    pub violations: Vec<Violation>,
    pub signals: Vec<Signal>,
    pub follow_up: Option<FollowUp>,
}

impl Reaction {
    /// Queues a command unless this reaction already carries it.
    pub fn command(&mut self, command: BackendCommand) {
        if !self.commands.contains(&command) {
            self.commands.push(command);
        }
    }

    fn signal(&mut self, signal: Signal) {
        self.signals.push(signal);
    }

    fn violation(&mut self, violation: Violation) {
        self.violations.push(violation);
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
            && self.violations.is_empty()
            && self.signals.is_empty()
            && self.follow_up.is_none()
    }

    pub fn count(&self, command: &BackendCommand) -> usize {
        self.commands.iter().filter(|c| *c == command).count()
    }
}

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub own_package: PackageId,
    pub admin_session: Duration,
}

impl EngineConfig {
    pub fn new(own_package: PackageId) -> Self {
        Self {
            own_package,
            admin_session: DEFAULT_ADMIN_SESSION,
        }
    }
}

pub struct EnforcementEngine {
    config: EngineConfig,
    policy: Arc<PolicyStore>,
    credentials: Arc<CredentialGate>,
    clock: Arc<dyn Clock>,
    mode: EngineMode,
    status: SecurityStatus,
    /// Packages hidden while enforcing; restored on disable.
    blocked: BTreeSet<PackageId>,
    admin_session_until: Option<u64>,
}

impl EnforcementEngine {
    pub fn new(
        config: EngineConfig,
        policy: Arc<PolicyStore>,
        credentials: Arc<CredentialGate>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            policy,
            credentials,
            clock,
            mode: EngineMode::Inactive,
            status: SecurityStatus::secure(),
            blocked: BTreeSet::new(),
            admin_session_until: None,
        }
    }

    pub fn mode(&self) -> EngineMode {
        self.mode
    }

    pub fn status(&self) -> &SecurityStatus {
        &self.status
    }

    pub fn blocked_packages(&self) -> &BTreeSet<PackageId> {
        &self.blocked
    }

    pub fn has_admin_session(&self) -> bool {
        self.admin_session_remaining() > Duration::ZERO
    }

    /// Session expiry in milliseconds since the Unix epoch.
    pub fn admin_session_until(&self) -> Option<u64> {
        self.admin_session_until
    }

    pub fn admin_session_remaining(&self) -> Duration {
        match self.admin_session_until {
            Some(until) => duration_until(self.clock.now_ms(), until),
            None => Duration::ZERO,
        }
    }

    pub fn end_admin_session(&mut self) {
        self.admin_session_until = None;
    }

    pub fn start(&mut self) -> Reaction {
        let mut reaction = Reaction::default();
        if self.mode == EngineMode::Inactive {
            self.set_mode(EngineMode::Monitoring, &mut reaction);
        }
        reaction
    }

    pub fn enable(&mut self, caps: &dyn DeviceCapabilities) -> Reaction {
        let mut reaction = Reaction::default();
        match self.mode {
            EngineMode::Enforcing => {
                log::debug!("enable requested while already enforcing");
                return reaction;
            }
            EngineMode::Inactive => {
                log::warn!("enable requested while monitoring is stopped; ignoring");
                return reaction;
            }
            EngineMode::Monitoring => {}
        }

        let privileged = caps.has_privilege();
        self.note_privilege(privileged);
        if !privileged {
            log::warn!("kiosk enforcement requires device-owner privilege");
            reaction.signal(Signal::PrivilegeRequired);
            return reaction;
        }

        let policy = self.policy_snapshot();
        self.set_mode(EngineMode::Enforcing, &mut reaction);
        reaction.command(BackendCommand::SetAllowedPackages(
            policy.allowed_packages.clone(),
        ));
        if caps.vendor_quirks().system_ui_suppression {
            reaction.command(BackendCommand::SuppressSystemUi);
        }
        if policy.persistent_effective() {
            reaction.command(BackendCommand::PinAsPersistentLauncher);
        }
        reaction.command(BackendCommand::RedirectToKioskApp);
        reaction
    }

    pub fn disable(&mut self) -> Reaction {
        let mut reaction = Reaction::default();
        if self.mode != EngineMode::Enforcing {
            log::debug!("disable requested while not enforcing");
            return reaction;
        }
        for pkg in std::mem::take(&mut self.blocked) {
            reaction.command(BackendCommand::UnhidePackage(pkg));
        }
        reaction.command(BackendCommand::ReleaseRestrictions);
        self.set_mode(EngineMode::Monitoring, &mut reaction);
        reaction
    }

    /// Drops to `Inactive`. No commands are produced.
    pub fn stop(&mut self) {
        if self.mode != EngineMode::Inactive {
            log::info!("enforcement engine stopped (was {:?})", self.mode);
        }
        self.mode = EngineMode::Inactive;
        self.admin_session_until = None;
    }

    pub fn handle(&mut self, event: &EventKind, caps: &dyn DeviceCapabilities) -> Reaction {
        match event {
            EventKind::Start => self.start(),
            EventKind::Enable => self.enable(caps),
            EventKind::Disable => self.disable(),
            EventKind::AdminRevoked => self.on_admin_revoked(),
            EventKind::AuthAttempt { secret } => self.on_auth_attempt(secret),
            EventKind::BootCompleted => self.on_boot_completed(),
            _ if self.mode == EngineMode::Inactive => {
                log::debug!("ignoring {} while inactive", event.name());
                Reaction::default()
            }
            EventKind::Tick => self.on_tick(caps),
            EventKind::ScreenOn | EventKind::UserPresent => self.reassert(caps),
            EventKind::ScreenOff => Reaction::default(),
            EventKind::ForegroundAppChanged { package } => self.on_foreground(package),
            EventKind::PackageInstalled { package } => self.on_package_installed(package, caps),
            EventKind::PackageRemoved { package } => self.on_package_removed(package),
            EventKind::NotificationPosted { package } => self.on_notification(package),
            EventKind::PolicyChanged => self.on_policy_changed(),
            EventKind::SecurityViolation { kind, detail } => {
                self.on_security_violation(kind.clone().reported(), detail)
            }
        }
    }

    /// Runs every live check in order and returns the combined status.
    pub fn perform_comprehensive_check(&mut self, caps: &dyn DeviceCapabilities) -> SecurityStatus {
        self.run_checks(caps).0
    }

    /// A failing probe is reported as its own `High` violation; the
    /// remaining checks still run.
    fn run_checks(&mut self, caps: &dyn DeviceCapabilities) -> (SecurityStatus, Vec<Violation>) {
        let mut violations = Vec::new();

        let privileged = caps.has_privilege();
        self.note_privilege(privileged);
        if !privileged {
            violations.push(
                Violation::new(ViolationKind::AdminBypass, "device-owner privilege missing")
                    .with_severity(Severity::High),
            );
        }

        match caps.foreground_package() {
            Ok(Some(pkg)) if !self.is_permitted(&pkg) => {
                violations.push(Violation::new(ViolationKind::UnauthorizedApp, pkg.as_str()));
            }
            Ok(_) => {}
            Err(e) => violations.push(Violation::check_failed("foreground app", e)),
        }

        match caps.settings_tamper_indicators() {
            Ok(indicators) => violations.extend(
                indicators
                    .into_iter()
                    .map(|detail| Violation::new(ViolationKind::SystemModification, detail)),
            ),
            Err(e) => violations.push(Violation::check_failed("system settings", e)),
        }

        match caps.root_indicators() {
            Ok(indicators) => violations.extend(
                indicators
                    .into_iter()
                    .map(|detail| Violation::new(ViolationKind::RootDetected, detail)),
            ),
            Err(e) => violations.push(Violation::check_failed("root indicators", e)),
        }

        let status = SecurityStatus::from_violations(&violations);
        self.status = status.clone();
        (status, violations)
    }

    fn on_tick(&mut self, caps: &dyn DeviceCapabilities) -> Reaction {
        let mut reaction = Reaction::default();
        if self.mode != EngineMode::Enforcing {
            return reaction;
        }
        let previous = self.status.clone();
        let (status, violations) = self.run_checks(caps);
        if violations.iter().any(|v| v.kind.always_redirects()) {
            reaction.command(BackendCommand::RedirectToKioskApp);
        }
        if !status.is_secure {
            self.apply_severity(status.severity, &mut reaction);
        }
        for violation in violations {
            reaction.violation(violation);
        }
        if status != previous {
            reaction.signal(Signal::StatusUpdated { status });
        }
        reaction
    }

    fn reassert(&mut self, caps: &dyn DeviceCapabilities) -> Reaction {
        let mut reaction = Reaction::default();
        if self.mode != EngineMode::Enforcing {
            return reaction;
        }
        if caps.vendor_quirks().system_ui_suppression {
            reaction.command(BackendCommand::SuppressSystemUi);
        }
        match caps.foreground_package() {
            Ok(Some(pkg)) if !self.is_permitted(&pkg) => {
                self.redirect_unauthorized(&pkg, &mut reaction);
            }
            Ok(_) => {}
            Err(e) => {
                let violation = Violation::check_failed("foreground app", e);
                self.status.record(&violation);
                reaction.violation(violation);
                reaction.command(BackendCommand::RedirectToKioskApp);
            }
        }
        reaction
    }

    fn on_foreground(&mut self, pkg: &PackageId) -> Reaction {
        let mut reaction = Reaction::default();
        if self.is_permitted(pkg) {
            return reaction;
        }
        match self.mode {
            EngineMode::Enforcing => self.redirect_unauthorized(pkg, &mut reaction),
            _ => {
                let violation = Violation::new(ViolationKind::UnauthorizedApp, pkg.as_str())
                    .with_severity(Severity::Low);
                log::info!("observed unauthorized foreground app {}", pkg);
                self.status.record(&violation);
                reaction.violation(violation);
            }
        }
        reaction
    }

    fn redirect_unauthorized(&mut self, pkg: &PackageId, reaction: &mut Reaction) {
        log::warn!("unauthorized foreground app {}; redirecting", pkg);
        let violation = Violation::new(ViolationKind::UnauthorizedApp, pkg.as_str());
        self.status.record(&violation);
        reaction.violation(violation);
        reaction.command(BackendCommand::RedirectToKioskApp);
    }

    fn on_package_installed(&mut self, pkg: &PackageId, caps: &dyn DeviceCapabilities) -> Reaction {
        let mut reaction = Reaction::default();
        if self.mode != EngineMode::Enforcing || self.is_permitted(pkg) {
            return reaction;
        }
        if !caps.vendor_quirks().package_hiding {
            log::warn!(
                "cannot hide {} on this device; relying on foreground redirect",
                pkg
            );
            return reaction;
        }
        self.blocked.insert(pkg.clone());
        reaction.command(BackendCommand::HidePackage(pkg.clone()));
        reaction
    }

    fn on_package_removed(&mut self, pkg: &PackageId) -> Reaction {
        if self.blocked.remove(pkg) {
            log::debug!("{} removed; dropped from block list", pkg);
        }
        Reaction::default()
    }

    fn on_notification(&mut self, pkg: &PackageId) -> Reaction {
        let mut reaction = Reaction::default();
        if self.mode == EngineMode::Enforcing && !self.is_permitted(pkg) {
            reaction.command(BackendCommand::CancelNotification(pkg.clone()));
        }
        reaction
    }

    /// Re-pushes the allow-list and releases packages that are now allowed.
    fn on_policy_changed(&mut self) -> Reaction {
        let mut reaction = Reaction::default();
        if self.mode != EngineMode::Enforcing {
            return reaction;
        }
        let policy = self.policy_snapshot();
        let released: Vec<PackageId> = self
            .blocked
            .iter()
            .filter(|pkg| policy.is_allowed(pkg))
            .cloned()
            .collect();
        for pkg in released {
            self.blocked.remove(&pkg);
            reaction.command(BackendCommand::UnhidePackage(pkg));
        }
        reaction.command(BackendCommand::SetAllowedPackages(
            policy.allowed_packages.clone(),
        ));
        if policy.persistent_effective() {
            reaction.command(BackendCommand::PinAsPersistentLauncher);
        }
        reaction
    }

    fn on_security_violation(&mut self, kind: ViolationKind, detail: &str) -> Reaction {
        let mut reaction = Reaction::default();
        let violation = Violation::new(kind, detail);
        log::warn!(
            "security violation ({}): {}",
            violation.severity,
            violation.describe()
        );
        self.status.record(&violation);
        if self.mode == EngineMode::Enforcing {
            if violation.kind.always_redirects() {
                reaction.command(BackendCommand::RedirectToKioskApp);
            }
            self.apply_severity(violation.severity, &mut reaction);
        }
        reaction.violation(violation);
        reaction.signal(Signal::StatusUpdated {
            status: self.status.clone(),
        });
        reaction
    }

    /// Privilege loss locks down unconditionally, in every mode.
    fn on_admin_revoked(&mut self) -> Reaction {
        let mut reaction = Reaction::default();
        log::error!("device admin privilege revoked; locking device");
        self.note_privilege(false);
        let violation = Violation::new(ViolationKind::AdminRevoked, "device admin revoked")
            .with_severity(Severity::Critical);
        self.status.record(&violation);
        reaction.command(BackendCommand::LockDeviceNow);
        reaction.command(BackendCommand::RedirectToKioskApp);
        reaction.violation(violation);
        reaction.signal(Signal::StatusUpdated {
            status: self.status.clone(),
        });
        reaction
    }

    fn on_auth_attempt(&mut self, secret: &AdminSecret) -> Reaction {
        let mut reaction = Reaction::default();
        match self.credentials.attempt(secret.expose()) {
            VerifyOutcome::Granted => {
                let now = self.clock.now_ms();
                self.admin_session_until = Some(deadline_after(now, self.config.admin_session));
                log::info!("admin authenticated; elevated session granted");
                reaction.signal(Signal::AuthGranted {
                    session_secs: self.config.admin_session.as_secs(),
                });
            }
            VerifyOutcome::Denied { remaining_attempts } => {
                let failed = self.credentials.failed_attempts();
                if failed >= REPEATED_FAILURE_THRESHOLD {
                    let violation = Violation::new(
                        ViolationKind::AuthFailure,
                        format!("{} consecutive failed admin attempts", failed),
                    );
                    log::warn!("repeated admin authentication failure ({})", failed);
                    reaction.violation(violation);
                } else {
                    log::info!("admin authentication failed");
                }
                reaction.signal(Signal::AuthDenied { remaining_attempts });
            }
            VerifyOutcome::LockedOut { remaining } => {
                let violation = Violation::new(
                    ViolationKind::AuthFailure,
                    format!("admin verification locked for {}s", remaining.as_secs()),
                );
                reaction.violation(violation);
                reaction.signal(Signal::LockedOut {
                    remaining_secs: remaining.as_secs(),
                });
            }
            VerifyOutcome::StoreUnavailable => {
                log::error!("admin authentication unavailable: credential store failure");
                reaction.signal(Signal::AuthUnavailable);
            }
        }
        reaction
    }

    fn on_boot_completed(&mut self) -> Reaction {
        let policy = self.policy_snapshot();
        let mut reaction = Reaction::default();
        match policy.startup_mode {
            StartupMode::Normal => {
                log::info!("boot completed; startup mode normal");
            }
            StartupMode::Silent => {
                reaction = self.start();
            }
            StartupMode::ImmediateKiosk => {
                reaction = self.start();
                reaction.follow_up = Some(FollowUp {
                    delay: policy.boot_delay,
                    event: FollowUpEvent::Enable,
                });
            }
            StartupMode::LauncherOnly => {
                reaction = self.start();
                reaction.command(BackendCommand::RedirectToKioskApp);
            }
        }
        reaction
    }

    fn apply_severity(&self, severity: Severity, reaction: &mut Reaction) {
        match severity.action() {
            SeverityAction::LockAndRedirect => {
                reaction.command(BackendCommand::LockDeviceNow);
                reaction.command(BackendCommand::RedirectToKioskApp);
            }
            SeverityAction::Redirect => reaction.command(BackendCommand::RedirectToKioskApp),
            SeverityAction::LogOnly => {}
        }
    }

    fn set_mode(&mut self, mode: EngineMode, reaction: &mut Reaction) {
        if self.mode != mode {
            log::info!("enforcement mode {:?} -> {:?}", self.mode, mode);
            self.mode = mode;
            reaction.signal(Signal::ModeChanged { mode });
        }
    }

    fn is_permitted(&self, pkg: &PackageId) -> bool {
        if *pkg == self.config.own_package {
            return true;
        }
        match self.policy.is_allowed(pkg) {
            Ok(allowed) => allowed,
            Err(e) => {
                log::error!("policy unavailable while checking {}: {}", pkg, e);
                false
            }
        }
    }

    fn policy_snapshot(&self) -> Policy {
        self.policy.snapshot().unwrap_or_else(|e| {
            log::error!("policy unavailable, using restrictive default: {}", e);
            Policy::new(&self.config.own_package)
        })
    }

    fn note_privilege(&self, privileged: bool) {
        if let Err(e) = self.policy.record_privilege(privileged) {
            log::warn!("failed to record privilege state: {}", e);
        }
    }
}
