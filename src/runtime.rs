//! Wiring of the engine, backend and security log behind the dispatcher,
//! plus the command surface used by the rendering layer.

use anyhow::{anyhow, Result};
use serde::Serialize;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::audit::SecurityLog;
use crate::backend::EnforcementBackend;
use crate::clock::{duration_until, Clock};
use crate::credential::{CredentialError, CredentialGate, LockoutState};
use crate::dispatch::{
    CancelToken, DispatchError, DispatchStats, EventDispatcher, EventHandler, EventSubmitter,
};
use crate::engine::{EngineConfig, EngineMode, EnforcementEngine, Reaction, Signal};
use crate::event::{AdminSecret, EnforcementEvent, EventKind};
use crate::policy::{Policy, PolicyStore, PolicyUpdate};
use crate::security::SecurityStatus;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RuntimeStatus {
    pub mode: EngineMode,
    pub status: SecurityStatus,
    pub admin_session_secs: u64,
    /// Milliseconds since the Unix epoch.
    pub admin_session_until: Option<u64>,
    pub last_seq: Option<u64>,
}

impl Default for RuntimeStatus {
    fn default() -> Self {
        Self {
            mode: EngineMode::Inactive,
            status: SecurityStatus::secure(),
            admin_session_secs: 0,
            admin_session_until: None,
            last_seq: None,
        }
    }
}

/// Consumer side of the dispatcher: feeds events to the engine and applies
/// the resulting reaction.
pub struct EngineRunner<B> {
    engine: EnforcementEngine,
    backend: B,
    audit: Option<Arc<SecurityLog>>,
    signals: Sender<Signal>,
    cancel: CancelToken,
    submitter: EventSubmitter,
    shared: Arc<Mutex<RuntimeStatus>>,
}

impl<B: EnforcementBackend> EngineRunner<B> {
    pub fn new(
        engine: EnforcementEngine,
        backend: B,
        audit: Option<Arc<SecurityLog>>,
        signals: Sender<Signal>,
        submitter: EventSubmitter,
    ) -> Self {
        Self {
            engine,
            backend,
            audit,
            signals,
            cancel: submitter.cancel_token().clone(),
            submitter,
            shared: Arc::new(Mutex::new(RuntimeStatus::default())),
        }
    }

    pub fn engine(&self) -> &EnforcementEngine {
        &self.engine
    }

    pub fn shared_status(&self) -> Arc<Mutex<RuntimeStatus>> {
        self.shared.clone()
    }

    /// Applies `reaction`. Commands are best effort per item, and none runs
    /// once the dispatcher has been cancelled.
    pub fn apply(&mut self, reaction: Reaction) {
        if let Some(audit) = &self.audit {
            for violation in &reaction.violations {
                if let Err(e) = audit.append(violation) {
                    log::error!("failed to append to security log: {:#}", e);
                }
            }
        }

        for (i, command) in reaction.commands.iter().enumerate() {
            if self.cancel.is_cancelled() {
                log::warn!(
                    "dispatcher cancelled; skipping {} backend command(s)",
                    reaction.commands.len() - i
                );
                break;
            }
            if let Err(e) = command.apply(&self.backend) {
                log::warn!("backend command {:?} failed: {}", command, e);
            }
        }

        for signal in reaction.signals {
            if self.signals.send(signal).is_err() {
                log::debug!("signal receiver dropped");
                break;
            }
        }

        if let Some(follow_up) = reaction.follow_up {
            log::info!(
                "scheduling {:?} in {}s",
                follow_up.event,
                follow_up.delay.as_secs()
            );
            self.submitter
                .submit_after(follow_up.delay, follow_up.event.into_event());
        }
    }

    fn publish(&self, seq: Option<u64>) {
        let mut shared = match self.shared.lock() {
            Ok(shared) => shared,
            Err(poisoned) => poisoned.into_inner(),
        };
        shared.mode = self.engine.mode();
        shared.status = self.engine.status().clone();
        shared.admin_session_secs = self.engine.admin_session_remaining().as_secs();
        shared.admin_session_until = self.engine.admin_session_until();
        if seq.is_some() {
            shared.last_seq = seq;
        }
    }
}

impl<B: EnforcementBackend> EventHandler for EngineRunner<B> {
    fn handle(&mut self, event: &EnforcementEvent) -> Result<()> {
        log::debug!("event #{} {}", event.seq, event.kind.name());
        let reaction = self.engine.handle(&event.kind, &self.backend);
        self.apply(reaction);
        self.publish(Some(event.seq));
        Ok(())
    }

    fn on_stop(&mut self) {
        self.engine.stop();
        self.publish(None);
    }
}

#[derive(Clone, Debug)]
pub struct RuntimeOptions {
    pub tick_interval: Option<Duration>,
    pub admin_session: Duration,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            tick_interval: Some(Duration::from_secs(5)),
            admin_session: crate::engine::DEFAULT_ADMIN_SESSION,
        }
    }
}

/// Shared components a runtime is assembled from.
#[derive(Clone)]
pub struct Components {
    pub policy: Arc<PolicyStore>,
    pub credentials: Arc<CredentialGate>,
    pub audit: Option<Arc<SecurityLog>>,
    pub clock: Arc<dyn Clock>,
}

pub struct KioskRuntime {
    dispatcher: EventDispatcher,
    controller: KioskController,
}

impl KioskRuntime {
    /// Starts the consumer thread (and ticker, if configured) and returns
    /// the runtime with the outbound signal stream.
    pub fn spawn<B: EnforcementBackend + 'static>(
        components: Components,
        backend: B,
        options: RuntimeOptions,
    ) -> Result<(Self, Receiver<Signal>)> {
        let mut dispatcher = EventDispatcher::new();
        let (signal_tx, signal_rx) = mpsc::channel();

        let mut engine_config = EngineConfig::new(components.policy.own_package().clone());
        engine_config.admin_session = options.admin_session;
        let engine = EnforcementEngine::new(
            engine_config,
            components.policy.clone(),
            components.credentials.clone(),
            components.clock.clone(),
        );
        let runner = EngineRunner::new(
            engine,
            backend,
            components.audit.clone(),
            signal_tx,
            dispatcher.submitter(),
        );
        let shared = runner.shared_status();
        dispatcher
            .subscribe(Box::new(runner))
            .map_err(|e| anyhow!("failed to start enforcement runner: {}", e))?;
        if let Some(interval) = options.tick_interval {
            dispatcher.start_ticker(interval);
        }

        let controller = KioskController {
            submitter: dispatcher.submitter(),
            policy: components.policy,
            credentials: components.credentials,
            audit: components.audit,
            clock: components.clock,
            shared,
        };
        log::info!(
            "kiosk runtime started for {}",
            controller.policy.own_package()
        );
        Ok((
            Self {
                dispatcher,
                controller,
            },
            signal_rx,
        ))
    }

    pub fn controller(&self) -> KioskController {
        self.controller.clone()
    }

    pub fn submitter(&self) -> EventSubmitter {
        self.dispatcher.submitter()
    }

    pub fn submit(&self, kind: EventKind) -> Result<u64, DispatchError> {
        self.dispatcher.submit(kind)
    }

    /// Cancels pending work, discards queued events and joins the consumer.
    pub fn stop(mut self) -> Result<DispatchStats, DispatchError> {
        self.dispatcher.stop()
    }
}

/// Command surface for the rendering layer.
///
/// Mode changes and password attempts travel through the event stream;
/// credential and policy administration act on the shared owners directly.
#[derive(Clone)]
pub struct KioskController {
    submitter: EventSubmitter,
    policy: Arc<PolicyStore>,
    credentials: Arc<CredentialGate>,
    audit: Option<Arc<SecurityLog>>,
    clock: Arc<dyn Clock>,
    shared: Arc<Mutex<RuntimeStatus>>,
}

impl KioskController {
    pub fn start_monitoring(&self) -> Result<u64, DispatchError> {
        self.submitter.submit(EventKind::Start)
    }

    pub fn request_enable(&self) -> Result<u64, DispatchError> {
        self.submitter.submit(EventKind::Enable)
    }

    pub fn request_disable(&self) -> Result<u64, DispatchError> {
        self.submitter.submit(EventKind::Disable)
    }

    /// Outcome arrives as `AuthGranted`, `AuthDenied`, `LockedOut` or
    /// `AuthUnavailable` on the signal stream.
    pub fn submit_password_attempt(&self, secret: AdminSecret) -> Result<u64, DispatchError> {
        self.submitter.submit(EventKind::AuthAttempt { secret })
    }

    pub fn change_password(&self, old: &str, new: &str) -> Result<(), CredentialError> {
        self.credentials.change(old, new)
    }

    pub fn reset_password_to_default(&self) -> Result<()> {
        self.credentials.reset_to_default()
    }

    /// Persists the update, then queues `PolicyChanged` so an enforcing
    /// engine re-pushes the allow-list.
    pub fn update_policy(&self, update: PolicyUpdate) -> Result<Policy> {
        let policy = self.policy.update(update)?;
        if let Err(e) = self.submitter.submit(EventKind::PolicyChanged) {
            log::warn!("policy saved but not re-applied: {}", e);
        }
        Ok(policy)
    }

    pub fn policy(&self) -> Result<Policy> {
        self.policy.snapshot()
    }

    /// True while a successful authentication attempt's session lasts.
    pub fn has_admin_session(&self) -> bool {
        self.admin_session_remaining() > Duration::ZERO
    }

    pub fn admin_session_remaining(&self) -> Duration {
        match self.status().admin_session_until {
            Some(until) => duration_until(self.clock.now_ms(), until),
            None => Duration::ZERO,
        }
    }

    pub fn lockout_status(&self) -> LockoutState {
        self.credentials.lockout_state()
    }

    pub fn status(&self) -> RuntimeStatus {
        match self.shared.lock() {
            Ok(shared) => shared.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn security_log(&self) -> Option<&Arc<SecurityLog>> {
        self.audit.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendCommand, SimulatedBackend};
    use crate::clock::ManualClock;
    use crate::credential::CredentialLimits;
    use crate::policy::PackageId;
    use crate::security::{Violation, ViolationKind};
    use crate::storage::{InMemoryKeyValueStore, KeyValueStore};

    fn pkg(raw: &str) -> PackageId {
        PackageId::new(raw).expect("valid package id")
    }

    type Harness = (
        EngineRunner<SimulatedBackend>,
        EventDispatcher,
        Receiver<Signal>,
        Arc<SecurityLog>,
    );

    fn runner(backend: SimulatedBackend) -> Harness {
        let kv: Arc<dyn KeyValueStore> = Arc::new(InMemoryKeyValueStore::new());
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(1_700_000_000_000));
        let policy =
            Arc::new(PolicyStore::load(kv.clone(), pkg("com.kiosk.launcher")).expect("policy"));
        let credentials = Arc::new(
            CredentialGate::open(kv.clone(), clock.clone(), CredentialLimits::default())
                .expect("gate"),
        );
        let audit = Arc::new(SecurityLog::new(kv, clock.clone()));
        let engine = EnforcementEngine::new(
            EngineConfig::new(pkg("com.kiosk.launcher")),
            policy,
            credentials,
            clock,
        );
        let dispatcher = EventDispatcher::new();
        let (tx, rx) = mpsc::channel();
        let runner = EngineRunner::new(
            engine,
            backend,
            Some(audit.clone()),
            tx,
            dispatcher.submitter(),
        );
        (runner, dispatcher, rx, audit)
    }

    #[test]
    fn applies_commands_and_records_violations() {
        let backend = SimulatedBackend::new(true);
        let (mut runner, _dispatcher, signals, audit) = runner(backend.clone());
        let mut reaction = Reaction::default();
        reaction.command(BackendCommand::LockDeviceNow);
        reaction.command(BackendCommand::HidePackage(pkg("com.evil.game")));
        reaction.command(BackendCommand::RedirectToKioskApp);
        reaction.violations.push(Violation::new(ViolationKind::RootDetected, "su"));
        reaction.signals.push(Signal::PrivilegeRequired);
        backend.mark_unhideable(pkg("com.evil.game"));

        runner.apply(reaction);

        assert_eq!(
            backend.executed(),
            vec![BackendCommand::LockDeviceNow, BackendCommand::RedirectToKioskApp],
            "a failing command does not abort the rest"
        );
        assert_eq!(audit.len().expect("len"), 1);
        assert_eq!(signals.try_recv().expect("signal"), Signal::PrivilegeRequired);
    }

    #[test]
    fn cancelled_runner_executes_no_commands() {
        let backend = SimulatedBackend::new(true);
        let (mut runner, dispatcher, _signals, _audit) = runner(backend.clone());
        dispatcher.cancel();
        let mut reaction = Reaction::default();
        reaction.command(BackendCommand::LockDeviceNow);
        reaction.command(BackendCommand::RedirectToKioskApp);
        runner.apply(reaction);
        assert!(backend.executed().is_empty());
    }

    #[test]
    fn controller_reports_admin_session_until_it_expires() {
        let kv: Arc<dyn KeyValueStore> = Arc::new(InMemoryKeyValueStore::new());
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let components = Components {
            policy: Arc::new(
                PolicyStore::load(kv.clone(), pkg("com.kiosk.launcher")).expect("policy"),
            ),
            credentials: Arc::new(
                CredentialGate::open(kv, clock.clone(), CredentialLimits::default())
                    .expect("gate"),
            ),
            audit: None,
            clock: clock.clone(),
        };
        let options = RuntimeOptions {
            tick_interval: None,
            ..RuntimeOptions::default()
        };
        let (runtime, signals) =
            KioskRuntime::spawn(components, SimulatedBackend::new(true), options).expect("spawn");
        let controller = runtime.controller();
        assert!(!controller.has_admin_session());

        controller
            .submit_password_attempt(AdminSecret::new(crate::credential::DEFAULT_SECRET))
            .expect("attempt");
        let granted = signals
            .recv_timeout(Duration::from_secs(5))
            .expect("auth signal");
        assert_eq!(granted, Signal::AuthGranted { session_secs: 1800 });
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !controller.has_admin_session() {
            assert!(std::time::Instant::now() < deadline, "session not published");
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(controller.admin_session_remaining(), Duration::from_secs(1800));

        clock.advance(Duration::from_secs(30 * 60));
        assert!(!controller.has_admin_session());
        runtime.stop().expect("stop");
    }

    #[test]
    fn handle_publishes_status() {
        let backend = SimulatedBackend::new(true);
        let (mut runner, _dispatcher, _signals, _audit) = runner(backend);
        let shared = runner.shared_status();
        runner
            .handle(&EnforcementEvent::new(7, EventKind::Start))
            .expect("handle");
        let status = shared.lock().expect("status").clone();
        assert_eq!(status.mode, EngineMode::Monitoring);
        assert_eq!(status.last_seq, Some(7));

        runner.on_stop();
        assert_eq!(shared.lock().expect("status").mode, EngineMode::Inactive);
        assert_eq!(runner.engine().mode(), EngineMode::Inactive);
    }
}
