//! Kiosk Warden
//!
//! Enforcement core for a device locked into a single-purpose kiosk mode.
//!
//! # Architecture
//!
//! Four components cooperate around one ordered event stream:
//!
//! 1. **CredentialGate** (`credential`): admin secret verification, change,
//!    lockout after repeated failures, and recovery.
//! 2. **PolicyStore** (`policy`): allow-list, startup mode and restriction
//!    flags, persisted on every mutation.
//! 3. **EnforcementEngine** (`engine`): the state machine that turns events
//!    into backend commands, violations and signals.
//! 4. **EventDispatcher** (`dispatch`): single consumer thread delivering
//!    events in submission order.
//!
//! # Module Structure
//!
//! - `storage`: key-value persistence (SQLite, in-memory)
//! - `backend`: platform restriction primitives and a simulated device
//! - `security`: severities, violation kinds, security status
//! - `audit`: hash-chained security event log
//! - `runtime`: engine + backend + log wiring, `KioskController`
//! - `config`: `kioskd` configuration from file and environment

use anyhow::Result;
use rand::RngCore;
use std::time::{SystemTime, UNIX_EPOCH};

pub mod audit;
pub mod backend;
pub mod clock;
pub mod config;
pub mod credential;
pub mod dispatch;
pub mod engine;
pub mod event;
pub mod policy;
pub mod runtime;
pub mod security;
pub mod storage;

pub use audit::{AuditRecord, SecurityLog};
pub use backend::{
    BackendCommand, BackendError, DeviceCapabilities, EnforcementBackend, SimulatedBackend,
    VendorQuirks,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use credential::{
    CredentialError, CredentialGate, CredentialLimits, LockoutState, VerifyOutcome,
    DEFAULT_SECRET,
};
pub use dispatch::{
    CancelToken, DispatchError, DispatchStats, EventDispatcher, EventHandler, EventSubmitter,
};
pub use engine::{EngineConfig, EngineMode, EnforcementEngine, Reaction, Signal};
pub use event::{AdminSecret, EnforcementEvent, EventKind};
pub use policy::{PackageId, PackageIdError, Policy, PolicyStore, PolicyUpdate, StartupMode};
pub use runtime::{Components, KioskController, KioskRuntime, RuntimeOptions, RuntimeStatus};
pub use security::{SecurityStatus, Severity, SeverityAction, Violation, ViolationKind};
pub use storage::{InMemoryKeyValueStore, KeyValueStore, Namespace, SqliteKeyValueStore};

/// Unique shared-cache in-memory SQLite URI, for tests and dry runs.
pub fn shared_memory_uri() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!(
        "file:kiosk_warden_{:x}?mode=memory&cache=shared",
        u64::from_le_bytes(bytes)
    )
}

pub(crate) fn now_s() -> Result<u64> {
    Ok(SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs())
}
