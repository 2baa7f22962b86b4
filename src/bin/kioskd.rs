//! kioskd - administer kiosk state and run the enforcement loop.
//!
//! `run` drives the engine against the simulated backend: JSON-line events on
//! stdin, JSON-line signals on stdout.

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use std::io::BufRead;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;

use kiosk_warden::config::KioskdConfig;
use kiosk_warden::{
    AdminSecret, Clock, Components, CredentialGate, EventKind, KeyValueStore, KioskController,
    KioskRuntime, PackageId, PolicyStore, RuntimeOptions, SecurityLog, SimulatedBackend,
    SqliteKeyValueStore, StartupMode, SystemClock, VerifyOutcome,
};

const SIGNAL_POLL: Duration = Duration::from_millis(100);

#[derive(Parser, Debug)]
#[command(name = "kioskd", about = "Kiosk mode enforcement daemon", version)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the enforcement loop (JSON-line events on stdin, signals on stdout)
    Run {
        /// Request enforcement right after monitoring starts
        #[arg(long)]
        enable: bool,
        /// Disable the periodic comprehensive check
        #[arg(long)]
        no_tick: bool,
    },

    /// Print policy, lockout state and security log summary
    Status,

    /// Admin secret management
    Password {
        #[command(subcommand)]
        action: PasswordCommand,
    },

    /// Policy administration
    Policy {
        #[command(subcommand)]
        action: PolicyCommand,
    },

    /// Show recent security log entries
    Log {
        #[arg(long, default_value_t = 20)]
        limit: usize,
        /// Verify the hash chain instead of listing entries
        #[arg(long)]
        verify: bool,
    },
}

#[derive(Subcommand, Debug)]
enum PasswordCommand {
    /// Check a secret (counts towards lockout)
    Verify {
        #[arg(long, env = "KIOSK_ADMIN_SECRET", hide_env_values = true)]
        secret: String,
    },
    Change {
        #[arg(long)]
        old: String,
        #[arg(long)]
        new: String,
    },
    /// Restore the factory default secret and clear any lockout
    Reset,
}

#[derive(Subcommand, Debug)]
enum PolicyCommand {
    Show,
    Allow { package: String },
    Revoke { package: String },
    StartupMode { mode: String },
    BootDelay { seconds: u64 },
    Persistent {
        #[arg(action = clap::ArgAction::Set)]
        enabled: bool,
    },
}

enum StopReason {
    Interrupted,
    EndOfInput(Option<u64>),
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let cfg = KioskdConfig::load()?;
    let components = open_components(&cfg)?;

    match args.command {
        Command::Run { enable, no_tick } => run(&cfg, components, enable, no_tick),
        Command::Status => status(&components),
        Command::Password { action } => password(&components, action),
        Command::Policy { action } => policy(&components, action),
        Command::Log { limit, verify } => security_log(&components, limit, verify),
    }
}

fn open_components(cfg: &KioskdConfig) -> Result<Components> {
    let store: Arc<dyn KeyValueStore> = Arc::new(SqliteKeyValueStore::open(&cfg.db_path)?);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let policy = Arc::new(PolicyStore::load(store.clone(), cfg.own_package.clone())?);
    let credentials = Arc::new(CredentialGate::open(
        store.clone(),
        clock.clone(),
        cfg.credentials.clone(),
    )?);
    let audit = Arc::new(SecurityLog::new(store, clock.clone()));
    Ok(Components {
        policy,
        credentials,
        audit: Some(audit),
        clock,
    })
}

fn run(cfg: &KioskdConfig, components: Components, enable: bool, no_tick: bool) -> Result<()> {
    let backend = SimulatedBackend::new(cfg.simulate_privileged);
    let options = RuntimeOptions {
        tick_interval: if no_tick { None } else { Some(cfg.tick_interval) },
        admin_session: cfg.admin_session,
    };
    let (runtime, signals) = KioskRuntime::spawn(components, backend, options)?;
    let controller = runtime.controller();
    controller.start_monitoring()?;
    if enable {
        controller.request_enable()?;
    }

    let (stop_tx, stop_rx) = mpsc::channel();
    let interrupt_tx = stop_tx.clone();
    ctrlc::set_handler(move || {
        let _ = interrupt_tx.send(StopReason::Interrupted);
    })
    .map_err(|e| anyhow!("failed to install Ctrl-C handler: {}", e))?;

    let submitter = runtime.submitter();
    std::thread::spawn(move || {
        let mut last = None;
        for line in std::io::stdin().lock().lines() {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    log::error!("stdin read failed: {}", e);
                    break;
                }
            };
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let kind: EventKind = match serde_json::from_str(trimmed) {
                Ok(kind) => kind,
                Err(e) => {
                    log::warn!("ignoring malformed event: {}", e);
                    continue;
                }
            };
            match submitter.submit(kind) {
                Ok(seq) => last = Some(seq),
                Err(e) => {
                    log::warn!("event not accepted: {}", e);
                    break;
                }
            }
        }
        let _ = stop_tx.send(StopReason::EndOfInput(last));
    });

    let mut drain_until: Option<Option<u64>> = None;
    loop {
        match signals.recv_timeout(SIGNAL_POLL) {
            Ok(signal) => println!("{}", serde_json::to_string(&signal)?),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        match stop_rx.try_recv() {
            Ok(StopReason::Interrupted) => {
                log::info!("interrupted; stopping");
                break;
            }
            Ok(StopReason::EndOfInput(last)) => drain_until = Some(last),
            Err(_) => {}
        }
        if let Some(last) = drain_until {
            if processed_through(&controller, last) {
                break;
            }
        }
    }

    let stats = runtime.stop()?;
    while let Ok(signal) = signals.try_recv() {
        println!("{}", serde_json::to_string(&signal)?);
    }
    log::info!(
        "kioskd stopped: delivered={} failed={} discarded={}",
        stats.delivered,
        stats.failed,
        stats.discarded
    );
    Ok(())
}

fn processed_through(controller: &KioskController, last: Option<u64>) -> bool {
    match last {
        None => true,
        Some(seq) => controller
            .status()
            .last_seq
            .is_some_and(|done| done >= seq),
    }
}

fn status(components: &Components) -> Result<()> {
    let policy = components.policy.snapshot()?;
    let lockout = components.credentials.lockout_state();
    let log_entries = match &components.audit {
        Some(audit) => audit.len()?,
        None => 0,
    };
    let report = serde_json::json!({
        "policy": policy,
        "persistent_effective": policy.persistent_effective(),
        "credentials": lockout,
        "security_log_entries": log_entries,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn password(components: &Components, action: PasswordCommand) -> Result<()> {
    let gate = &components.credentials;
    match action {
        PasswordCommand::Verify { secret } => {
            let secret = AdminSecret::new(secret);
            match gate.attempt(secret.expose()) {
                VerifyOutcome::Granted => println!("granted"),
                VerifyOutcome::Denied { remaining_attempts } => {
                    return Err(anyhow!(
                        "denied ({} attempt(s) remaining)",
                        remaining_attempts
                    ))
                }
                VerifyOutcome::LockedOut { remaining } => {
                    return Err(anyhow!("locked out for {}s", remaining.as_secs()))
                }
                VerifyOutcome::StoreUnavailable => {
                    return Err(anyhow!("credential store unavailable"))
                }
            }
        }
        PasswordCommand::Change { old, new } => {
            gate.change(&old, &new)?;
            println!("admin secret changed");
        }
        PasswordCommand::Reset => {
            gate.reset_to_default()?;
            println!("admin secret reset to factory default");
        }
    }
    Ok(())
}

fn policy(components: &Components, action: PolicyCommand) -> Result<()> {
    let store = &components.policy;
    match action {
        PolicyCommand::Show => {}
        PolicyCommand::Allow { package } => store.allow(parse_package(&package)?)?,
        PolicyCommand::Revoke { package } => store.revoke(&parse_package(&package)?)?,
        PolicyCommand::StartupMode { mode } => store.set_startup_mode(StartupMode::parse(&mode)?)?,
        PolicyCommand::BootDelay { seconds } => {
            store.set_boot_delay(Duration::from_secs(seconds))?
        }
        PolicyCommand::Persistent { enabled } => store.set_persistent(enabled)?,
    }
    println!("{}", serde_json::to_string_pretty(&store.snapshot()?)?);
    Ok(())
}

fn parse_package(raw: &str) -> Result<PackageId> {
    PackageId::new(raw).map_err(|e| anyhow!("invalid package '{}': {}", raw, e))
}

fn security_log(components: &Components, limit: usize, verify: bool) -> Result<()> {
    let audit = components
        .audit
        .as_ref()
        .ok_or_else(|| anyhow!("security log not configured"))?;
    if verify {
        let count = audit.verify_chain()?;
        println!("OK: security log verified ({} entries)", count);
        return Ok(());
    }
    for record in audit.recent(limit)? {
        println!(
            "#{} t={} [{}] {}",
            record.index,
            record.recorded_at,
            record.violation.severity,
            record.violation.describe()
        );
    }
    Ok(())
}
