//! Single ordered event stream with one consumer thread.
//!
//! Producers (platform sources, the UI, the ticker, delayed follow-ups) hold
//! cloneable [`EventSubmitter`]s and hand events off over `std::sync::mpsc`.
//! The consumer delivers them to the subscribed [`EventHandler`] in
//! submission order. Cancellation goes through a shared [`CancelToken`].

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::event::{EnforcementEvent, EventKind};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("event dispatcher stopped")]
    Stopped,
    #[error("an event handler is already subscribed")]
    AlreadySubscribed,
    #[error("dispatch worker panicked")]
    WorkerPanicked,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub delivered: u64,
    pub failed: u64,
    pub discarded: u64,
}

/// Shared cancellation flag that sleeping threads can wait on.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let (flag, cvar) = &*self.inner;
        *lock(flag) = true;
        cvar.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *lock(&self.inner.0)
    }

    /// Sleeps for `dur` or until cancelled. Returns `true` if cancelled.
    pub fn sleep(&self, dur: Duration) -> bool {
        let (flag, cvar) = &*self.inner;
        let deadline = Instant::now() + dur;
        let mut cancelled = lock(flag);
        while !*cancelled {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            cancelled = match cvar.wait_timeout(cancelled, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }
}

fn lock(flag: &Mutex<bool>) -> MutexGuard<'_, bool> {
    flag.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub trait EventHandler: Send {
    fn handle(&mut self, event: &EnforcementEvent) -> anyhow::Result<()>;

    /// Called once on the consumer thread after the last delivery.
    fn on_stop(&mut self) {}
}

enum Envelope {
    Event(EnforcementEvent),
    Wake,
}

#[derive(Clone)]
pub struct EventSubmitter {
    tx: Sender<Envelope>,
    seq: Arc<AtomicU64>,
    cancel: CancelToken,
}

impl EventSubmitter {
    /// Enqueues `kind` and returns its sequence number.
    pub fn submit(&self, kind: EventKind) -> Result<u64, DispatchError> {
        if self.cancel.is_cancelled() {
            return Err(DispatchError::Stopped);
        }
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        self.tx
            .send(Envelope::Event(EnforcementEvent::new(seq, kind)))
            .map_err(|_| DispatchError::Stopped)?;
        Ok(seq)
    }

    /// Submits `kind` after `delay` unless the dispatcher is cancelled first.
    pub fn submit_after(&self, delay: Duration, kind: EventKind) -> JoinHandle<()> {
        let submitter = self.clone();
        std::thread::spawn(move || {
            if submitter.cancel.sleep(delay) {
                log::debug!("delayed {} cancelled", kind.name());
                return;
            }
            let name = kind.name();
            if let Err(e) = submitter.submit(kind) {
                log::debug!("delayed {} not submitted: {}", name, e);
            }
        })
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    fn wake(&self) {
        let _ = self.tx.send(Envelope::Wake);
    }
}

pub struct EventDispatcher {
    submitter: EventSubmitter,
    rx: Option<Receiver<Envelope>>,
    worker: Option<JoinHandle<DispatchStats>>,
    ticker: Option<JoinHandle<()>>,
    stats: Option<DispatchStats>,
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl EventDispatcher {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            submitter: EventSubmitter {
                tx,
                seq: Arc::new(AtomicU64::new(0)),
                cancel: CancelToken::new(),
            },
            rx: Some(rx),
            worker: None,
            ticker: None,
            stats: None,
        }
    }

    pub fn submitter(&self) -> EventSubmitter {
        self.submitter.clone()
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.submitter.cancel.clone()
    }

    pub fn submit(&self, kind: EventKind) -> Result<u64, DispatchError> {
        self.submitter.submit(kind)
    }

    /// Registers the sole consumer and starts delivering, including any
    /// events queued before this call.
    pub fn subscribe(&mut self, mut handler: Box<dyn EventHandler>) -> Result<(), DispatchError> {
        let rx = self.rx.take().ok_or(DispatchError::AlreadySubscribed)?;
        let cancel = self.submitter.cancel.clone();
        self.worker = Some(std::thread::spawn(move || {
            let stats = consume(&rx, handler.as_mut(), &cancel);
            handler.on_stop();
            stats
        }));
        Ok(())
    }

    /// Injects `Tick` every `interval` until cancelled.
    pub fn start_ticker(&mut self, interval: Duration) {
        if self.ticker.is_some() {
            log::warn!("ticker already running");
            return;
        }
        let submitter = self.submitter.clone();
        self.ticker = Some(std::thread::spawn(move || loop {
            if submitter.cancel.sleep(interval) {
                break;
            }
            if submitter.submit(EventKind::Tick).is_err() {
                break;
            }
        }));
    }

    /// Cancels the ticker and pending delayed submissions. Queued events that
    /// have not started are discarded by the consumer.
    pub fn cancel(&self) {
        self.submitter.cancel.cancel();
        self.submitter.wake();
    }

    pub fn join(&mut self) -> Result<DispatchStats, DispatchError> {
        if let Some(stats) = self.stats {
            return Ok(stats);
        }
        if let Some(ticker) = self.ticker.take() {
            if ticker.join().is_err() {
                log::warn!("ticker thread panicked");
            }
        }
        let stats = match (self.worker.take(), self.rx.take()) {
            (Some(worker), _) => worker.join().map_err(|_| DispatchError::WorkerPanicked)?,
            (None, Some(rx)) => DispatchStats {
                discarded: drain(&rx),
                ..DispatchStats::default()
            },
            (None, None) => DispatchStats::default(),
        };
        log::info!(
            "event dispatcher stopped: delivered={} failed={} discarded={}",
            stats.delivered,
            stats.failed,
            stats.discarded
        );
        self.stats = Some(stats);
        Ok(stats)
    }

    pub fn stop(&mut self) -> Result<DispatchStats, DispatchError> {
        self.cancel();
        self.join()
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }
}

impl Drop for EventDispatcher {
    fn drop(&mut self) {
        if self.worker.is_some() || self.ticker.is_some() {
            if let Err(e) = self.stop() {
                log::error!("event dispatcher shutdown failed: {}", e);
            }
        }
    }
}

fn consume(
    rx: &Receiver<Envelope>,
    handler: &mut dyn EventHandler,
    cancel: &CancelToken,
) -> DispatchStats {
    let mut stats = DispatchStats::default();
    while let Ok(envelope) = rx.recv() {
        let event = match envelope {
            Envelope::Event(event) => event,
            Envelope::Wake => {
                if cancel.is_cancelled() {
                    break;
                }
                continue;
            }
        };
        if cancel.is_cancelled() {
            stats.discarded += 1;
            break;
        }
        let outcome = catch_unwind(AssertUnwindSafe(|| handler.handle(&event)));
        match outcome {
            Ok(Ok(())) => stats.delivered += 1,
            Ok(Err(e)) => {
                stats.failed += 1;
                log::warn!("handler failed on {} #{}: {:#}", event.kind.name(), event.seq, e);
            }
            Err(_) => {
                stats.failed += 1;
                log::error!("handler panicked on {} #{}", event.kind.name(), event.seq);
            }
        }
    }
    stats.discarded += drain(rx);
    stats
}

fn drain(rx: &Receiver<Envelope>) -> u64 {
    let mut discarded = 0;
    while let Ok(envelope) = rx.try_recv() {
        if let Envelope::Event(event) = envelope {
            log::debug!("discarding {} #{}", event.kind.name(), event.seq);
            discarded += 1;
        }
    }
    discarded
}
