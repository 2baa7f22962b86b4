//! Admin credential lifecycle: verification, change, lockout and recovery.
//!
//! The record is persisted after every mutation. State changes are applied
//! in memory first, so a store failure can only make the gate stricter:
//! the caller sees [`VerifyOutcome::StoreUnavailable`] and access is denied.

use anyhow::{anyhow, Result};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use zeroize::{Zeroize, Zeroizing};

use crate::clock::{deadline_after, duration_until, Clock};
use crate::storage::{get_json, put_json, KeyValueStore, Namespace};

const CREDENTIAL_KEY: &str = "admin";
const SALT_LEN: usize = 16;
const HASH_ROUNDS: u32 = 10_000;
const DOMAIN_ADMIN_SECRET: &[u8] = b"kiosk-warden:admin-secret:v1";

pub const DEFAULT_SECRET: &str = "0000";
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_LOCKOUT: Duration = Duration::from_secs(30 * 60);
pub const DEFAULT_MIN_SECRET_LEN: usize = 4;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CredentialLimits {
    pub max_attempts: u32,
    pub lockout_duration: Duration,
    pub min_secret_len: usize,
    pub default_secret: String,
}

impl Default for CredentialLimits {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            lockout_duration: DEFAULT_LOCKOUT,
            min_secret_len: DEFAULT_MIN_SECRET_LEN,
            default_secret: DEFAULT_SECRET.to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CredentialRecord {
    #[serde(with = "hex_bytes")]
    pub password_hash: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub salt: Vec<u8>,
    pub is_default: bool,
    pub failed_attempts: u32,
    /// Milliseconds since the Unix epoch.
    pub lockout_until: Option<u64>,
}

impl CredentialRecord {
    fn with_secret(secret: &str, is_default: bool) -> Self {
        let salt = fresh_salt();
        let password_hash = hash_secret(&salt, secret).to_vec();
        Self {
            password_hash,
            salt,
            is_default,
            failed_attempts: 0,
            lockout_until: None,
        }
    }

    fn clear_counters(&mut self) {
        self.failed_attempts = 0;
        self.lockout_until = None;
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VerifyOutcome {
    Granted,
    Denied { remaining_attempts: u32 },
    LockedOut { remaining: Duration },
    StoreUnavailable,
}

impl VerifyOutcome {
    pub fn is_granted(&self) -> bool {
        matches!(self, VerifyOutcome::Granted)
    }
}

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("current admin secret is incorrect ({remaining_attempts} attempts left)")]
    WrongCredential { remaining_attempts: u32 },
    #[error("admin verification locked for another {}s", .remaining.as_secs())]
    LockedOut { remaining: Duration },
    #[error("new admin secret must be at least {min} characters")]
    TooShort { min: usize },
    #[error("credential store unavailable: {0}")]
    Store(#[from] anyhow::Error),
}

/// Read-only view for lockout countdowns.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LockoutState {
    pub locked_out: bool,
    pub remaining_secs: u64,
    pub failed_attempts: u32,
    pub remaining_attempts: u32,
    pub is_default: bool,
}

pub struct CredentialGate {
    limits: CredentialLimits,
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    record: Mutex<Option<CredentialRecord>>,
}

impl CredentialGate {
    /// Opens the gate and seeds the default secret on first start.
    pub fn open(
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        limits: CredentialLimits,
    ) -> Result<Self> {
        if limits.max_attempts == 0 {
            return Err(anyhow!("max_attempts must be greater than zero"));
        }
        if limits.default_secret.chars().count() < limits.min_secret_len {
            return Err(anyhow!(
                "default secret is shorter than the minimum secret length"
            ));
        }
        let gate = Self {
            limits,
            store,
            clock,
            record: Mutex::new(None),
        };
        gate.initialize()?;
        Ok(gate)
    }

    pub fn limits(&self) -> &CredentialLimits {
        &self.limits
    }

    /// Loads the persisted record, creating the default one if absent.
    pub fn initialize(&self) -> Result<()> {
        let mut slot = self.lock()?;
        if slot.is_some() {
            return Ok(());
        }
        let record = match get_json::<CredentialRecord>(
            self.store.as_ref(),
            Namespace::Credentials,
            CREDENTIAL_KEY,
        )? {
            Some(record) => record,
            None => {
                let record = CredentialRecord::with_secret(&self.limits.default_secret, true);
                self.persist(&record)?;
                log::info!("admin credential initialized with factory default");
                record
            }
        };
        *slot = Some(record);
        Ok(())
    }

    pub fn verify(&self, candidate: &str) -> bool {
        self.attempt(candidate).is_granted()
    }

    pub fn attempt(&self, candidate: &str) -> VerifyOutcome {
        let mut slot = match self.lock() {
            Ok(slot) => slot,
            Err(e) => {
                log::error!("credential verification unavailable: {}", e);
                return VerifyOutcome::StoreUnavailable;
            }
        };
        let Some(record) = slot.as_mut() else {
            return VerifyOutcome::StoreUnavailable;
        };

        let now = self.clock.now_ms();
        self.expire_lockout(record, now);
        if let Some(until) = record.lockout_until {
            return VerifyOutcome::LockedOut {
                remaining: duration_until(now, until),
            };
        }

        let candidate_hash = hash_secret(&record.salt, candidate);
        let outcome = if constant_time_eq(&candidate_hash, &record.password_hash) {
            record.clear_counters();
            VerifyOutcome::Granted
        } else {
            record.failed_attempts = record.failed_attempts.saturating_add(1);
            if record.failed_attempts >= self.limits.max_attempts {
                let until = deadline_after(now, self.limits.lockout_duration);
                record.lockout_until = Some(until);
                log::warn!(
                    "admin verification locked after {} failed attempts",
                    record.failed_attempts
                );
                VerifyOutcome::LockedOut {
                    remaining: self.limits.lockout_duration,
                }
            } else {
                VerifyOutcome::Denied {
                    remaining_attempts: self.limits.max_attempts - record.failed_attempts,
                }
            }
        };

        match self.persist(record) {
            Ok(()) => outcome,
            Err(e) => {
                log::error!("failed to persist credential record: {}", e);
                VerifyOutcome::StoreUnavailable
            }
        }
    }

    pub fn change(&self, old: &str, new: &str) -> Result<(), CredentialError> {
        match self.attempt(old) {
            VerifyOutcome::Granted => {}
            VerifyOutcome::Denied { remaining_attempts } => {
                return Err(CredentialError::WrongCredential { remaining_attempts })
            }
            VerifyOutcome::LockedOut { remaining } => {
                return Err(CredentialError::LockedOut { remaining })
            }
            VerifyOutcome::StoreUnavailable => {
                return Err(CredentialError::Store(anyhow!(
                    "could not verify current admin secret"
                )))
            }
        }
        if new.chars().count() < self.limits.min_secret_len {
            return Err(CredentialError::TooShort {
                min: self.limits.min_secret_len,
            });
        }

        let replacement = CredentialRecord::with_secret(new, false);
        self.persist(&replacement)?;
        *self.lock()? = Some(replacement);
        log::info!("admin secret changed");
        Ok(())
    }

    /// Restores the factory default secret and clears any lockout.
    ///
    /// Recovery path: no prior authentication is required.
    pub fn reset_to_default(&self) -> Result<()> {
        let record = CredentialRecord::with_secret(&self.limits.default_secret, true);
        self.persist(&record)?;
        *self.lock()? = Some(record);
        log::warn!("admin secret reset to factory default");
        Ok(())
    }

    pub fn is_locked_out(&self) -> bool {
        self.remaining_lockout() > Duration::ZERO
    }

    pub fn remaining_lockout(&self) -> Duration {
        let now = self.clock.now_ms();
        self.with_record(|record| match live_counters(record, now).1 {
            Some(until) => duration_until(now, until),
            None => Duration::ZERO,
        })
        .unwrap_or(Duration::ZERO)
    }

    pub fn failed_attempts(&self) -> u32 {
        let now = self.clock.now_ms();
        self.with_record(|record| live_counters(record, now).0)
            .unwrap_or(0)
    }

    pub fn remaining_attempts(&self) -> u32 {
        self.lockout_state().remaining_attempts
    }

    pub fn is_default(&self) -> bool {
        self.with_record(|record| record.is_default)
            .unwrap_or(true)
    }

    /// Reads every field under one lock, with an elapsed lockout already
    /// counted as cleared.
    pub fn lockout_state(&self) -> LockoutState {
        let now = self.clock.now_ms();
        let max_attempts = self.limits.max_attempts;
        self.with_record(|record| {
            let (failed_attempts, lockout_until) = live_counters(record, now);
            let remaining = lockout_until
                .map(|until| duration_until(now, until))
                .unwrap_or(Duration::ZERO);
            let locked_out = remaining > Duration::ZERO;
            LockoutState {
                locked_out,
                remaining_secs: remaining.as_secs(),
                failed_attempts,
                remaining_attempts: if locked_out {
                    0
                } else {
                    max_attempts.saturating_sub(failed_attempts)
                },
                is_default: record.is_default,
            }
        })
        .unwrap_or(LockoutState {
            locked_out: false,
            remaining_secs: 0,
            failed_attempts: 0,
            remaining_attempts: 0,
            is_default: true,
        })
    }

    /// Snapshot of the stored record.
    pub fn record(&self) -> Option<CredentialRecord> {
        self.with_record(|record| record.clone())
    }

    /// An elapsed lockout restarts the failure window.
    fn expire_lockout(&self, record: &mut CredentialRecord, now: u64) {
        if lockout_elapsed(record, now) {
            record.clear_counters();
            log::info!("admin verification lockout elapsed");
        }
    }

    fn with_record<T>(&self, f: impl FnOnce(&CredentialRecord) -> T) -> Option<T> {
        let slot = self.lock().ok()?;
        slot.as_ref().map(f)
    }

    fn persist(&self, record: &CredentialRecord) -> Result<()> {
        put_json(
            self.store.as_ref(),
            Namespace::Credentials,
            CREDENTIAL_KEY,
            record,
        )
    }

    fn lock(&self) -> Result<MutexGuard<'_, Option<CredentialRecord>>> {
        self.record
            .lock()
            .map_err(|_| anyhow!("credential lock poisoned"))
    }
}

fn lockout_elapsed(record: &CredentialRecord, now: u64) -> bool {
    matches!(record.lockout_until, Some(until) if until <= now)
}

/// `(failed_attempts, lockout_until)` as the next attempt would see them.
fn live_counters(record: &CredentialRecord, now: u64) -> (u32, Option<u64>) {
    if lockout_elapsed(record, now) {
        (0, None)
    } else {
        (record.failed_attempts, record.lockout_until)
    }
}

fn fresh_salt() -> Vec<u8> {
    let mut salt = vec![0u8; SALT_LEN];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    salt
}

/// Salted, stretched SHA-256 of an admin secret.
pub fn hash_secret(salt: &[u8], secret: &str) -> [u8; 32] {
    let secret_bytes = Zeroizing::new(secret.as_bytes().to_vec());
    let mut hasher = Sha256::new();
    hasher.update(DOMAIN_ADMIN_SECRET);
    hasher.update((salt.len() as u32).to_le_bytes());
    hasher.update(salt);
    hasher.update(secret_bytes.as_slice());
    let mut digest: [u8; 32] = hasher.finalize().into();
    for _ in 1..HASH_ROUNDS {
        let mut round = Sha256::new();
        round.update(digest);
        round.update(salt);
        round.update(secret_bytes.as_slice());
        let next: [u8; 32] = round.finalize().into();
        digest.zeroize();
        digest = next;
    }
    digest
}

/// Compares without returning early on length or content differences.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    let len = a.len().max(b.len());
    let mut diff = (a.len() != b.len()) as u8;
    for i in 0..len {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        diff |= x ^ y;
    }
    diff == 0
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let raw = String::deserialize(d)?;
        hex::decode(raw).map_err(serde::de::Error::custom)
    }
}
