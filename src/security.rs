//! Severity classification and the severity → corrective action table.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Newest entries kept in [`SecurityStatus::violations`].
pub const MAX_STATUS_VIOLATIONS: usize = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn action(self) -> SeverityAction {
        match self {
            Severity::Critical => SeverityAction::LockAndRedirect,
            Severity::High => SeverityAction::Redirect,
            Severity::Medium => SeverityAction::LogOnly,
            Severity::Low => SeverityAction::LogOnly,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SeverityAction {
    LockAndRedirect,
    Redirect,
    LogOnly,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum ViolationKind {
    UnauthorizedApp,
    AdminBypass,
    SystemModification,
    RootDetected,
    AdminRevoked,
    AuthFailure,
    CheckFailed,
    Other(String),
}

impl ViolationKind {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "unauthorized_app" => Self::UnauthorizedApp,
            "admin_bypass" => Self::AdminBypass,
            "system_modification" => Self::SystemModification,
            "root_detected" => Self::RootDetected,
            "admin_revoked" => Self::AdminRevoked,
            "auth_failure" => Self::AuthFailure,
            "check_failed" => Self::CheckFailed,
            other => Self::Other(other.to_string()),
        }
    }

    /// Parses a kind reported from outside the engine.
    ///
    /// Only the externally reportable kinds are recognised. Names of kinds
    /// the engine raises itself come back as [`ViolationKind::Other`].
    pub fn parse_reported(raw: &str) -> Self {
        Self::parse(raw).reported()
    }

    /// Kinds only the engine itself may raise.
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            Self::AdminRevoked | Self::AuthFailure | Self::CheckFailed
        )
    }

    pub fn reported(self) -> Self {
        if self.is_internal() {
            Self::Other(self.as_str().to_string())
        } else {
            self
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::UnauthorizedApp => "unauthorized_app",
            Self::AdminBypass => "admin_bypass",
            Self::SystemModification => "system_modification",
            Self::RootDetected => "root_detected",
            Self::AdminRevoked => "admin_revoked",
            Self::AuthFailure => "auth_failure",
            Self::CheckFailed => "check_failed",
            Self::Other(raw) => raw,
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            Self::UnauthorizedApp => Severity::Medium,
            Self::AdminBypass => Severity::High,
            Self::SystemModification => Severity::High,
            Self::RootDetected => Severity::Critical,
            Self::AdminRevoked => Severity::Critical,
            Self::AuthFailure => Severity::Medium,
            Self::CheckFailed => Severity::High,
            Self::Other(_) => Severity::Medium,
        }
    }

    /// Foreground excursions are corrected regardless of severity.
    pub fn always_redirects(&self) -> bool {
        matches!(self, Self::UnauthorizedApp)
    }
}

impl From<String> for ViolationKind {
    fn from(value: String) -> Self {
        Self::parse(&value)
    }
}

impl From<ViolationKind> for String {
    fn from(value: ViolationKind) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub kind: ViolationKind,
    pub detail: String,
    pub severity: Severity,
}

impl Violation {
    pub fn new(kind: ViolationKind, detail: impl Into<String>) -> Self {
        let severity = kind.severity();
        Self {
            kind,
            detail: detail.into(),
            severity,
        }
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn check_failed(check: &str, err: impl fmt::Display) -> Self {
        Self::new(ViolationKind::CheckFailed, format!("check failed: {check}: {err}"))
    }

    pub fn describe(&self) -> String {
        format!("{}: {}", self.kind, self.detail)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityStatus {
    pub is_secure: bool,
    pub violations: Vec<String>,
    pub severity: Severity,
}

impl Default for SecurityStatus {
    fn default() -> Self {
        Self::secure()
    }
}

impl SecurityStatus {
    pub fn secure() -> Self {
        Self {
            is_secure: true,
            violations: Vec::new(),
            severity: Severity::Low,
        }
    }

    pub fn from_violations(violations: &[Violation]) -> Self {
        let mut status = Self::secure();
        for violation in violations {
            status.record(violation);
        }
        status
    }

    /// Severity keeps the maximum seen; only the newest
    /// [`MAX_STATUS_VIOLATIONS`] descriptions are retained.
    pub fn record(&mut self, violation: &Violation) {
        self.is_secure = false;
        self.violations.push(violation.describe());
        if self.violations.len() > MAX_STATUS_VIOLATIONS {
            let overflow = self.violations.len() - MAX_STATUS_VIOLATIONS;
            self.violations.drain(..overflow);
        }
        self.severity = self.severity.max(violation.severity);
    }
}
