use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use kiosk_warden::{
    AdminSecret, BackendCommand, BackendError, CancelToken, Clock, Components, CredentialGate,
    CredentialLimits, DeviceCapabilities, EngineMode, EnforcementBackend, EventKind,
    KeyValueStore, KioskController, KioskRuntime, PackageId, PolicyStore, PolicyUpdate,
    RuntimeOptions, SecurityLog, Signal, SimulatedBackend, SqliteKeyValueStore, StartupMode,
    SystemClock, ViolationKind, DEFAULT_SECRET,
};

const WAIT: Duration = Duration::from_secs(5);

fn pkg(raw: &str) -> PackageId {
    PackageId::new(raw).expect("valid package id")
}

fn components(db_path: &str) -> Components {
    let store: Arc<dyn KeyValueStore> =
        Arc::new(SqliteKeyValueStore::open(db_path).expect("open store"));
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let policy =
        Arc::new(PolicyStore::load(store.clone(), pkg("com.kiosk.launcher")).expect("policy"));
    let credentials = Arc::new(
        CredentialGate::open(store.clone(), clock.clone(), CredentialLimits::default())
            .expect("credentials"),
    );
    Components {
        policy,
        credentials,
        audit: Some(Arc::new(SecurityLog::new(store, clock.clone()))),
        clock,
    }
}

fn quiet() -> RuntimeOptions {
    RuntimeOptions {
        tick_interval: None,
        ..RuntimeOptions::default()
    }
}

fn wait_processed(controller: &KioskController, seq: u64) {
    let deadline = Instant::now() + WAIT;
    while controller.status().last_seq.map_or(true, |done| done < seq) {
        assert!(Instant::now() < deadline, "event #{seq} not processed in time");
        std::thread::sleep(Duration::from_millis(5));
    }
}

fn wait_signal(signals: &Receiver<Signal>, want: &Signal) {
    let deadline = Instant::now() + WAIT;
    loop {
        let left = deadline.saturating_duration_since(Instant::now());
        match signals.recv_timeout(left) {
            Ok(signal) if &signal == want => return,
            Ok(_) => continue,
            Err(e) => panic!("signal {:?} not received: {}", want, e),
        }
    }
}

#[test]
fn enforces_and_locks_down_end_to_end() {
    let db = tempfile::NamedTempFile::new().expect("temp db");
    let parts = components(db.path().to_str().expect("utf8 path"));
    let audit = parts.audit.clone().expect("audit");
    parts.policy.allow(pkg("com.android.chrome")).expect("allow");
    let backend = SimulatedBackend::new(true);

    let (runtime, signals) =
        KioskRuntime::spawn(parts, backend.clone(), quiet()).expect("spawn runtime");
    let controller = runtime.controller();
    controller.start_monitoring().expect("start");
    controller.request_enable().expect("enable");
    wait_signal(&signals, &Signal::ModeChanged { mode: EngineMode::Enforcing });

    backend.take_executed();
    runtime
        .submit(EventKind::ForegroundAppChanged { package: pkg("com.android.chrome") })
        .expect("submit");
    let seq = runtime
        .submit(EventKind::ForegroundAppChanged { package: pkg("com.evil.game") })
        .expect("submit");
    wait_processed(&controller, seq);
    assert_eq!(backend.take_executed(), vec![BackendCommand::RedirectToKioskApp]);

    let seq = runtime.submit(EventKind::AdminRevoked).expect("submit");
    wait_processed(&controller, seq);
    assert_eq!(
        backend.take_executed(),
        vec![BackendCommand::LockDeviceNow, BackendCommand::RedirectToKioskApp]
    );

    let stats = runtime.stop().expect("stop");
    assert_eq!(stats.failed, 0);
    assert_eq!(stats.discarded, 0);

    assert_eq!(audit.verify_chain().expect("verify"), 2);
    let kinds: Vec<ViolationKind> = audit
        .recent(10)
        .expect("recent")
        .into_iter()
        .map(|record| record.violation.kind)
        .collect();
    assert_eq!(kinds, vec![ViolationKind::UnauthorizedApp, ViolationKind::AdminRevoked]);
}

#[test]
fn enable_without_privilege_asks_for_it() {
    let parts = components(&kiosk_warden::shared_memory_uri());
    let backend = SimulatedBackend::new(false);
    let (runtime, signals) = KioskRuntime::spawn(parts, backend.clone(), quiet()).expect("spawn");
    let controller = runtime.controller();
    controller.start_monitoring().expect("start");
    controller.request_enable().expect("enable");
    wait_signal(&signals, &Signal::PrivilegeRequired);
    assert_eq!(controller.status().mode, EngineMode::Monitoring);
    runtime.stop().expect("stop");
    assert!(backend.executed().is_empty());
}

#[test]
fn password_attempts_flow_through_the_stream() {
    let parts = components(&kiosk_warden::shared_memory_uri());
    let (runtime, signals) =
        KioskRuntime::spawn(parts, SimulatedBackend::new(true), quiet()).expect("spawn");
    let controller = runtime.controller();

    controller
        .submit_password_attempt(AdminSecret::new("9999"))
        .expect("attempt");
    wait_signal(&signals, &Signal::AuthDenied { remaining_attempts: 4 });
    assert_eq!(controller.lockout_status().failed_attempts, 1);

    let seq = controller
        .submit_password_attempt(AdminSecret::new(DEFAULT_SECRET))
        .expect("attempt");
    wait_signal(&signals, &Signal::AuthGranted { session_secs: 1800 });
    wait_processed(&controller, seq);
    assert_eq!(controller.lockout_status().failed_attempts, 0);
    assert!(controller.status().admin_session_secs > 0);
    assert!(controller.has_admin_session());

    controller.change_password(DEFAULT_SECRET, "4821").expect("change");
    assert!(!controller.lockout_status().is_default);
    controller.reset_password_to_default().expect("reset");
    assert!(controller.lockout_status().is_default);

    runtime.stop().expect("stop");
}

#[test]
fn immediate_kiosk_boot_enables_after_delay() {
    let parts = components(&kiosk_warden::shared_memory_uri());
    let (runtime, signals) =
        KioskRuntime::spawn(parts, SimulatedBackend::new(true), quiet()).expect("spawn");
    let controller = runtime.controller();
    let policy = controller
        .update_policy(PolicyUpdate {
            startup_mode: Some(StartupMode::ImmediateKiosk),
            boot_delay: Some(Duration::from_millis(20)),
            ..PolicyUpdate::default()
        })
        .expect("update policy");
    assert!(policy.is_allowed(&pkg("com.kiosk.launcher")));

    runtime.submit(EventKind::BootCompleted).expect("boot");
    wait_signal(&signals, &Signal::ModeChanged { mode: EngineMode::Monitoring });
    wait_signal(&signals, &Signal::ModeChanged { mode: EngineMode::Enforcing });
    runtime.stop().expect("stop");
}

#[test]
fn policy_update_reaches_backend_while_enforcing() {
    let parts = components(&kiosk_warden::shared_memory_uri());
    let backend = SimulatedBackend::new(true);
    let (runtime, signals) = KioskRuntime::spawn(parts, backend.clone(), quiet()).expect("spawn");
    let controller = runtime.controller();
    controller.start_monitoring().expect("start");
    controller.request_enable().expect("enable");
    wait_signal(&signals, &Signal::ModeChanged { mode: EngineMode::Enforcing });

    let policy = controller
        .update_policy(PolicyUpdate {
            allowed_packages: Some(BTreeSet::from([pkg("com.maps.app")])),
            ..PolicyUpdate::default()
        })
        .expect("update policy");
    let expected = BackendCommand::SetAllowedPackages(policy.allowed_packages.clone());
    let deadline = Instant::now() + WAIT;
    while !backend.executed().contains(&expected) {
        assert!(Instant::now() < deadline, "allow-list was not re-pushed");
        std::thread::sleep(Duration::from_millis(5));
    }
    runtime.stop().expect("stop");
}

#[test]
fn lockout_and_policy_survive_restart() {
    let db = tempfile::NamedTempFile::new().expect("temp db");
    let path = db.path().to_str().expect("utf8 path").to_string();
    {
        let parts = components(&path);
        for _ in 0..5 {
            parts.credentials.attempt("1111");
        }
        assert!(parts.credentials.is_locked_out());
        parts.policy.allow(pkg("com.android.chrome")).expect("allow");
        parts.policy.set_persistent(true).expect("persistent");
    }

    let parts = components(&path);
    assert!(parts.credentials.is_locked_out());
    assert!(!parts.credentials.verify(DEFAULT_SECRET));
    let policy = parts.policy.snapshot().expect("policy");
    assert!(policy.is_allowed(&pkg("com.android.chrome")));
    assert!(policy.persistent);
}

/// Blocks inside the first `lock_device_now` until the runtime is cancelled.
struct GatedBackend {
    inner: SimulatedBackend,
    token: Arc<OnceLock<CancelToken>>,
    started: Mutex<SyncSender<()>>,
    blocked_once: AtomicBool,
}

impl DeviceCapabilities for GatedBackend {
    fn has_privilege(&self) -> bool {
        self.inner.has_privilege()
    }

    fn foreground_package(&self) -> Result<Option<PackageId>, BackendError> {
        self.inner.foreground_package()
    }

    fn settings_tamper_indicators(&self) -> Result<Vec<String>, BackendError> {
        self.inner.settings_tamper_indicators()
    }

    fn root_indicators(&self) -> Result<Vec<String>, BackendError> {
        self.inner.root_indicators()
    }
}

impl EnforcementBackend for GatedBackend {
    fn hide_package(&self, pkg: &PackageId) -> Result<(), BackendError> {
        self.inner.hide_package(pkg)
    }

    fn unhide_package(&self, pkg: &PackageId) -> Result<(), BackendError> {
        self.inner.unhide_package(pkg)
    }

    fn redirect_to_kiosk_app(&self) -> Result<(), BackendError> {
        self.inner.redirect_to_kiosk_app()
    }

    fn lock_device_now(&self) -> Result<(), BackendError> {
        if !self.blocked_once.swap(true, Ordering::SeqCst) {
            if let Some(token) = self.token.get() {
                let _ = self.started.lock().expect("started").send(());
                token.sleep(WAIT);
            }
        }
        self.inner.lock_device_now()
    }

    fn set_allowed_packages(&self, packages: &BTreeSet<PackageId>) -> Result<(), BackendError> {
        self.inner.set_allowed_packages(packages)
    }

    fn suppress_system_ui(&self) -> Result<(), BackendError> {
        self.inner.suppress_system_ui()
    }

    fn release_restrictions(&self) -> Result<(), BackendError> {
        self.inner.release_restrictions()
    }

    fn cancel_notification(&self, pkg: &PackageId) -> Result<(), BackendError> {
        self.inner.cancel_notification(pkg)
    }

    fn pin_as_persistent_launcher(&self) -> Result<(), BackendError> {
        self.inner.pin_as_persistent_launcher()
    }
}

#[test]
fn stop_runs_no_commands_for_queued_events() {
    let parts = components(&kiosk_warden::shared_memory_uri());
    let inner = SimulatedBackend::new(true);
    let token = Arc::new(OnceLock::new());
    let (started_tx, started_rx) = mpsc::sync_channel(1);
    let backend = GatedBackend {
        inner: inner.clone(),
        token: token.clone(),
        started: Mutex::new(started_tx),
        blocked_once: AtomicBool::new(false),
    };

    let (runtime, _signals) = KioskRuntime::spawn(parts, backend, quiet()).expect("spawn");
    token
        .set(runtime.submitter().cancel_token().clone())
        .expect("token set once");

    runtime.submit(EventKind::AdminRevoked).expect("submit");
    started_rx.recv_timeout(WAIT).expect("first event in progress");
    for _ in 0..3 {
        runtime.submit(EventKind::AdminRevoked).expect("submit");
    }

    let stats = runtime.stop().expect("stop");
    assert_eq!(stats.delivered, 1);
    assert_eq!(stats.discarded, 3);
    assert_eq!(
        inner.executed(),
        vec![BackendCommand::LockDeviceNow],
        "nothing runs once stop has been requested"
    );
}
