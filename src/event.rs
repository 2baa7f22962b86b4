//! Inbound event vocabulary, decoded from JSON lines by `kioskd run`.

use serde::{Deserialize, Deserializer};
use std::fmt;
use std::time::Instant;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::policy::PackageId;
use crate::security::ViolationKind;

/// Admin secret carried by an authentication attempt.
///
/// Wiped on drop and never printed.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct AdminSecret(String);

impl AdminSecret {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AdminSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AdminSecret(<redacted>)")
    }
}

impl<'de> Deserialize<'de> for AdminSecret {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        Ok(Self(String::deserialize(d)?))
    }
}

/// Inbound events, including mode-switch requests and the periodic tick.
///
/// Mode switches travel through the same ordered stream as platform events,
/// so a switch can never overtake an earlier violation.
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventKind {
    Start,
    Enable,
    Disable,
    Tick,
    BootCompleted,
    UserPresent,
    ScreenOn,
    ScreenOff,
    PackageInstalled { package: PackageId },
    PackageRemoved { package: PackageId },
    ForegroundAppChanged { package: PackageId },
    NotificationPosted { package: PackageId },
    /// Policy was edited; the engine re-pushes the allow-list.
    PolicyChanged,
    SecurityViolation {
        #[serde(deserialize_with = "reported_kind")]
        kind: ViolationKind,
        detail: String,
    },
    AdminRevoked,
    AuthAttempt { secret: AdminSecret },
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::Start => "start",
            EventKind::Enable => "enable",
            EventKind::Disable => "disable",
            EventKind::Tick => "tick",
            EventKind::BootCompleted => "boot_completed",
            EventKind::UserPresent => "user_present",
            EventKind::ScreenOn => "screen_on",
            EventKind::ScreenOff => "screen_off",
            EventKind::PackageInstalled { .. } => "package_installed",
            EventKind::PackageRemoved { .. } => "package_removed",
            EventKind::ForegroundAppChanged { .. } => "foreground_app_changed",
            EventKind::NotificationPosted { .. } => "notification_posted",
            EventKind::PolicyChanged => "policy_changed",
            EventKind::SecurityViolation { .. } => "security_violation",
            EventKind::AdminRevoked => "admin_revoked",
            EventKind::AuthAttempt { .. } => "auth_attempt",
        }
    }
}

fn reported_kind<'de, D: Deserializer<'de>>(d: D) -> Result<ViolationKind, D::Error> {
    Ok(ViolationKind::parse_reported(&String::deserialize(d)?))
}

/// An event as delivered by the dispatcher: sequence number plus the
/// monotonic instant it was submitted.
#[derive(Clone, Debug)]
pub struct EnforcementEvent {
    pub seq: u64,
    pub received_at: Instant,
    pub kind: EventKind,
}

impl EnforcementEvent {
    pub fn new(seq: u64, kind: EventKind) -> Self {
        Self {
            seq,
            received_at: Instant::now(),
            kind,
        }
    }
}
