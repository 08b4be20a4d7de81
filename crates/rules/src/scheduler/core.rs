//! [`LateLoadScheduler`]: background retries of candidate rule files.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info, warn};

use defex_core::config::LateLoadConfig;
use defex_core::RuleSourceConfig;

use crate::loader::{LoadError, RuleLoader};
use crate::lookup::LoadTrigger;
use crate::store::{LoadState, RuleStore, MAX_SOURCES};

use super::signal::ShutdownSignal;

/// Result of a single pass over the candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Pass {
    /// Every expected class is loaded.
    Complete,
    /// Some class is still missing and a candidate for it may yet appear.
    Pending,
    /// Every usable candidate has been consumed and a class is still missing.
    Exhausted,
    /// `TIMEOUT` is already set; nothing was attempted.
    Frozen,
}

/// Why the worker thread stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    Completed,
    /// The wall-clock budget ran out, or `TIMEOUT` was already set.
    TimedOut,
    /// Nothing was left to try; `TIMEOUT` was set once the budget ran out.
    Exhausted,
    /// Shut down before finishing; `TIMEOUT` is left clear.
    Cancelled,
}

struct Worker {
    loader: RuleLoader,
    candidates: Vec<RuleSourceConfig>,
    config: LateLoadConfig,
    expected: LoadState,
    shutdown: ShutdownSignal,
}

impl Worker {
    fn store(&self) -> &RuleStore {
        self.loader.store()
    }

    /// Whether candidate `index` is still worth opening given `state`.
    fn wanted(&self, state: LoadState, index: usize) -> bool {
        let class = self.loader.class_for(self.candidates[index].class);
        !state.contains(LoadState::source(index)) && !state.contains(LoadState::class(class))
    }

    /// With no candidates there is nothing to complete, only to give up on.
    fn complete(&self, state: LoadState) -> bool {
        !self.expected.is_empty() && state.contains(self.expected)
    }

    fn attempt_once(&self) -> Pass {
        for index in 0..self.candidates.len() {
            let state = self.store().load_state();
            if state.timed_out() {
                return Pass::Frozen;
            }
            if self.complete(state) {
                return Pass::Complete;
            }
            if !self.wanted(state, index) {
                continue;
            }

            let source = &self.candidates[index];
            match self.loader.load_source(index, source) {
                Ok(size) => info!(path = %source.path.display(), size, "late rule source loaded"),
                Err(LoadError::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
                    debug!(path = %source.path.display(), "rule source not present yet")
                }
                Err(e) => warn!(path = %source.path.display(), error = %e, "rule source rejected"),
            }
        }

        let state = self.store().load_state();
        if state.timed_out() {
            Pass::Frozen
        } else if self.complete(state) {
            Pass::Complete
        } else if (0..self.candidates.len()).any(|i| self.wanted(state, i)) {
            Pass::Pending
        } else {
            Pass::Exhausted
        }
    }

    fn give_up(&self) {
        let state = self.store().mark(LoadState::TIMEOUT);
        warn!(state = ?state.names(), "late rule loading gave up");
    }

    fn run(&self) -> ExitReason {
        let deadline = Instant::now() + self.config.timeout;
        loop {
            match self.attempt_once() {
                Pass::Complete => {
                    info!("all rule classes loaded");
                    return ExitReason::Completed;
                }
                Pass::Frozen => return ExitReason::TimedOut,
                Pass::Exhausted => {
                    info!("no rule source left to try, waiting out the budget");
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if self.shutdown.wait(remaining) {
                        info!("late rule loading cancelled");
                        return ExitReason::Cancelled;
                    }
                    self.give_up();
                    return ExitReason::Exhausted;
                }
                Pass::Pending => {}
            }

            let now = Instant::now();
            if now >= deadline {
                self.give_up();
                return ExitReason::TimedOut;
            }
            let nap = self.config.retry_interval.min(deadline - now);
            if self.shutdown.wait(nap) {
                info!("late rule loading cancelled");
                return ExitReason::Cancelled;
            }
        }
    }
}

/// Retries candidate rule files on a dedicated thread until every expected
/// class is loaded or loading gives up.
pub struct LateLoadScheduler {
    worker: Arc<Worker>,
    started: AtomicBool,
    handle: Mutex<Option<JoinHandle<ExitReason>>>,
}

impl LateLoadScheduler {
    /// Candidates beyond [`MAX_SOURCES`] are dropped.
    pub fn new(loader: RuleLoader, candidates: Vec<RuleSourceConfig>, config: LateLoadConfig) -> Self {
        let mut candidates = candidates;
        if candidates.len() > MAX_SOURCES {
            warn!(count = candidates.len(), max = MAX_SOURCES, "too many rule sources, ignoring the rest");
            candidates.truncate(MAX_SOURCES);
        }
        let expected = candidates
            .iter()
            .fold(LoadState::empty(), |acc, c| acc | LoadState::class(loader.class_for(c.class)));

        Self {
            worker: Arc::new(Worker {
                loader,
                candidates,
                config,
                expected,
                shutdown: ShutdownSignal::new(),
            }),
            started: AtomicBool::new(false),
            handle: Mutex::new(None),
        }
    }

    pub fn store(&self) -> &Arc<RuleStore> {
        self.worker.loader.store()
    }

    /// Class bits that make the store fully loaded.
    pub fn expected(&self) -> LoadState {
        self.worker.expected
    }

    pub fn candidates(&self) -> &[RuleSourceConfig] {
        &self.worker.candidates
    }

    /// Run one pass on the calling thread.
    pub fn attempt_once(&self) -> Pass {
        self.worker.attempt_once()
    }

    /// Spawn the worker. Returns `true` only for the call that started it;
    /// later calls, and any call once `TIMEOUT` is set, do nothing.
    pub fn start(&self) -> bool {
        if self.store().load_state().timed_out() || self.worker.shutdown.is_triggered() {
            return false;
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return false;
        }

        let worker = Arc::clone(&self.worker);
        let spawned = thread::Builder::new()
            .name("defex-late-load".to_string())
            .spawn(move || worker.run());
        match spawned {
            Ok(handle) => {
                info!(candidates = self.worker.candidates.len(), "late rule loading started");
                *self.handle.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
                true
            }
            Err(e) => {
                warn!(error = %e, "failed to spawn late-load thread");
                self.started.store(false, Ordering::SeqCst);
                false
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Wait for the worker to stop on its own.
    pub fn join(&self) -> Option<ExitReason> {
        let handle = self.handle.lock().unwrap_or_else(PoisonError::into_inner).take()?;
        match handle.join() {
            Ok(reason) => Some(reason),
            Err(_) => {
                warn!("late-load thread panicked");
                None
            }
        }
    }

    /// Interrupt the worker's sleep and wait for it. The scheduler cannot be
    /// started again afterwards.
    pub fn shutdown(&self) -> Option<ExitReason> {
        self.worker.shutdown.trigger();
        self.join()
    }
}

impl LoadTrigger for LateLoadScheduler {
    fn trigger(&self) {
        self.start();
    }
}

impl Drop for LateLoadScheduler {
    fn drop(&mut self) {
        self.worker.shutdown.trigger();
    }
}
