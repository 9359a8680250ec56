//! Background auto-save of dirty metadata.
//!
//! A single tokio task wakes on a periodic deadline and persists the metadata
//! store if it is dirty. Table mutations shorten the deadline to a short
//! debounce window through [`SaveSignal`]; callers that need durability before
//! proceeding use [`AutosaveScheduler::force`].
//!
//! At most one save runs at a time: the periodic tick and `force` share one
//! async run lock, and `stop` waits for the task (and any tick in progress)
//! to finish.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::AutosaveConfig;
use crate::error::{RemapError, RemapResult};
use crate::metadata::MetadataStore;

struct SignalInner {
    notify: Notify,
    soon: AtomicBool,
    reset: AtomicBool,
    requests: AtomicU64,
}

/// Cloneable, non-blocking trigger handed to the metadata store.
#[derive(Clone)]
pub struct SaveSignal {
    inner: Arc<SignalInner>,
}

impl SaveSignal {
    fn new() -> Self {
        Self {
            inner: Arc::new(SignalInner {
                notify: Notify::new(),
                soon: AtomicBool::new(false),
                reset: AtomicBool::new(false),
                requests: AtomicU64::new(0),
            }),
        }
    }

    /// Asks for a save within the debounce window.
    pub fn request_soon(&self) {
        self.inner.requests.fetch_add(1, Ordering::Relaxed);
        self.inner.soon.store(true, Ordering::Release);
        self.inner.notify.notify_one();
    }

    /// Number of save requests received.
    pub fn requests(&self) -> u64 {
        self.inner.requests.load(Ordering::Relaxed)
    }

    fn reset_deadline(&self) {
        self.inner.reset.store(true, Ordering::Release);
        self.inner.notify.notify_one();
    }

    fn take_soon(&self) -> bool {
        self.inner.soon.swap(false, Ordering::AcqRel)
    }

    fn take_reset(&self) -> bool {
        self.inner.reset.swap(false, Ordering::AcqRel)
    }
}

/// Lifecycle of the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchedulerState {
    /// Initialized but no periodic run scheduled
    Idle,
    /// Periodic task running
    Active,
    /// Stopped by `stop` or `cleanup`
    Stopped,
}

/// Auto-save counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutosaveStats {
    /// Periodic ticks executed
    pub ticks: u64,
    /// Ticks skipped because metadata was clean
    pub skipped_clean: u64,
    /// Successful saves (periodic and forced)
    pub saves_ok: u64,
    /// Failed saves (periodic and forced)
    pub saves_failed: u64,
    /// Saves run through `force`
    pub forced_saves: u64,
    /// Calls to `trigger`
    pub triggers: u64,
}

#[derive(Default)]
struct Counters {
    ticks: AtomicU64,
    skipped_clean: AtomicU64,
    saves_ok: AtomicU64,
    saves_failed: AtomicU64,
    forced_saves: AtomicU64,
    triggers: AtomicU64,
}

#[derive(Clone)]
struct SaveContext {
    store: Arc<MetadataStore>,
    signal: SaveSignal,
    counters: Arc<Counters>,
    run_lock: Arc<AsyncMutex<()>>,
}

impl SaveContext {
    fn record(&self, result: &RemapResult<()>) {
        match result {
            Ok(()) => {
                self.counters.saves_ok.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.counters.saves_failed.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "metadata auto-save failed, will retry");
            }
        }
    }

    async fn tick(&self) {
        let _run = self.run_lock.lock().await;
        self.counters.ticks.fetch_add(1, Ordering::Relaxed);
        if !self.store.is_dirty() {
            self.counters.skipped_clean.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let result = self.store.sync().await;
        self.record(&result);
    }

    async fn run(self, config: AutosaveConfig, mut shutdown: watch::Receiver<bool>) {
        let interval = config.effective_interval();
        let debounce = config.effective_debounce();
        let mut deadline = Instant::now() + interval;
        debug!(interval_ms = interval.as_millis() as u64, "auto-save task running");

        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                _ = self.signal.inner.notify.notified() => {
                    if self.signal.take_reset() {
                        deadline = Instant::now() + interval;
                    }
                    if self.signal.take_soon() {
                        deadline = deadline.min(Instant::now() + debounce);
                    }
                    continue;
                }
                _ = tokio::time::sleep_until(deadline) => {}
            }

            self.tick().await;
            deadline = Instant::now() + interval;
        }
        debug!("auto-save task exiting");
    }
}

/// Periodic metadata persistence for one metadata store.
pub struct AutosaveScheduler {
    config: AutosaveConfig,
    ctx: SaveContext,
    state: Mutex<SchedulerState>,
    task: Mutex<Option<(JoinHandle<()>, watch::Sender<bool>)>>,
}

impl AutosaveScheduler {
    /// Allocates scheduling resources and connects the store's trigger.
    ///
    /// No periodic run is scheduled until [`start`](Self::start).
    pub fn init(config: AutosaveConfig, store: Arc<MetadataStore>) -> Self {
        let signal = SaveSignal::new();
        store.attach_signal(signal.clone());
        Self {
            config,
            ctx: SaveContext {
                store,
                signal,
                counters: Arc::new(Counters::default()),
                run_lock: Arc::new(AsyncMutex::new(())),
            },
            state: Mutex::new(SchedulerState::Idle),
            task: Mutex::new(None),
        }
    }

    /// Schedules the periodic run. Must be called inside a tokio runtime.
    pub fn start(&self) {
        if !self.config.enabled {
            info!("auto-save disabled, not scheduling");
            return;
        }
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(self.ctx.clone().run(self.config.clone(), rx));
        *task = Some((handle, tx));
        *self.state.lock() = SchedulerState::Active;
        info!(
            interval_ms = self.config.effective_interval().as_millis() as u64,
            "auto-save started"
        );
    }

    /// Cancels the pending run and waits for an in-flight save to finish.
    pub async fn stop(&self) {
        let task = self.task.lock().take();
        if let Some((handle, tx)) = task {
            let _ = tx.send(true);
            if let Err(e) = handle.await {
                warn!(error = %e, "auto-save task ended abnormally");
            }
            info!("auto-save stopped");
        }
        *self.state.lock() = SchedulerState::Stopped;
    }

    /// Saves now in the caller's context and pushes the periodic run out.
    ///
    /// Fails with [`RemapError::SchedulerStopped`] once the scheduler is stopped.
    pub async fn force(&self) -> RemapResult<()> {
        if self.state() == SchedulerState::Stopped {
            return Err(RemapError::SchedulerStopped);
        }
        self.ctx.counters.forced_saves.fetch_add(1, Ordering::Relaxed);
        let result = {
            let _run = self.ctx.run_lock.lock().await;
            self.ctx.store.sync().await
        };
        self.ctx.record(&result);
        self.ctx.signal.reset_deadline();
        result
    }

    /// Marks metadata dirty and saves now (`immediate`) or within the debounce window.
    pub async fn trigger(&self, immediate: bool) -> RemapResult<()> {
        self.ctx.counters.triggers.fetch_add(1, Ordering::Relaxed);
        self.ctx.store.mark_dirty();
        if immediate {
            self.force().await
        } else {
            self.ctx.signal.request_soon();
            Ok(())
        }
    }

    /// Stops the task and disconnects the store's trigger.
    pub async fn cleanup(self) {
        self.stop().await;
        self.ctx.store.detach_signal();
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SchedulerState {
        *self.state.lock()
    }

    /// The store this scheduler persists.
    pub fn store(&self) -> &Arc<MetadataStore> {
        &self.ctx.store
    }

    /// Number of save requests seen by the trigger.
    pub fn requests(&self) -> u64 {
        self.ctx.signal.requests()
    }

    /// Counter snapshot.
    pub fn stats(&self) -> AutosaveStats {
        let c = &self.ctx.counters;
        AutosaveStats {
            ticks: c.ticks.load(Ordering::Relaxed),
            skipped_clean: c.skipped_clean.load(Ordering::Relaxed),
            saves_ok: c.saves_ok.load(Ordering::Relaxed),
            saves_failed: c.saves_failed.load(Ordering::Relaxed),
            forced_saves: c.forced_saves.load(Ordering::Relaxed),
            triggers: c.triggers.load(Ordering::Relaxed),
        }
    }
}
