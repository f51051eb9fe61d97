//! Replay protection for handshake nonces.
//!
//! Every accepted nonce is remembered for a fixed retention window. A nonce is
//! accepted only if it is not currently present; an entry that has aged past
//! the window but has not been swept yet still rejects.
//!
//! # Design
//!
//! - Nonces live in a sharded `DashMap`, so check-and-insert for unrelated
//!   nonces never contends on a global lock
//! - Check-and-insert goes through the map's entry API and is atomic per nonce
//! - A background task owned by the guard drops expired entries on a fixed
//!   interval, one shard at a time
//! - `shutdown()` stops that task and waits for it; dropping the guard aborts it
//!
//! Timestamps come from `tokio::time::Instant`, so tests can drive expiry with
//! a paused clock.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parley_common::KeyExchangeConfig;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum NonceGuardError {
    #[error("nonce guard must be started inside a tokio runtime")]
    NoRuntime,

    #[error("invalid nonce guard timing: {0}")]
    InvalidTiming(String),
}

struct Sweeper {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Aborts the task if dropped before it finishes, e.g. when a `shutdown()`
/// future is cancelled mid-await.
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Set of recently accepted nonces with background expiry.
pub struct NonceGuard {
    seen: Arc<DashMap<String, Instant>>,
    retention: Duration,
    sweeper: Mutex<Option<Sweeper>>,
}

impl NonceGuard {
    /// Create the guard and start its sweep task on the current tokio runtime.
    pub fn start(retention: Duration, sweep_interval: Duration) -> Result<Self, NonceGuardError> {
        if retention.is_zero() || sweep_interval.is_zero() {
            return Err(NonceGuardError::InvalidTiming(format!(
                "retention {:?} and sweep interval {:?} must be non-zero",
                retention, sweep_interval
            )));
        }
        let runtime = Handle::try_current().map_err(|_| NonceGuardError::NoRuntime)?;

        let seen = Arc::new(DashMap::new());
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let task_seen = Arc::clone(&seen);
        let handle = runtime.spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = sweep(&task_seen, retention);
                        if removed > 0 {
                            debug!(removed, remaining = task_seen.len(), "Swept expired nonces");
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("Nonce sweep: shutdown signal received");
                        break;
                    }
                }
            }
        });

        info!(
            retention_secs = retention.as_secs(),
            sweep_interval_secs = sweep_interval.as_secs(),
            "Nonce guard started"
        );

        Ok(Self {
            seen,
            retention,
            sweeper: Mutex::new(Some(Sweeper {
                shutdown_tx,
                handle,
            })),
        })
    }

    pub fn from_config(config: &KeyExchangeConfig) -> Result<Self, NonceGuardError> {
        Self::start(config.nonce_retention(), config.nonce_sweep_interval())
    }

    /// Accept `nonce` if it is not currently recorded, recording it.
    ///
    /// Returns false for a replay. Concurrent calls with the same nonce accept
    /// at most once.
    pub fn is_fresh_and_record(&self, nonce: &str) -> bool {
        match self.seen.entry(nonce.to_owned()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(Instant::now());
                true
            }
        }
    }

    /// Drop every entry older than the retention window. Returns how many went.
    pub fn sweep_expired(&self) -> usize {
        sweep(&self.seen, self.retention)
    }

    /// Stop the sweep task and wait for it to finish. Safe to call repeatedly.
    pub async fn shutdown(&self) {
        let sweeper = match self.sweeper.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };

        let Some(sweeper) = sweeper else {
            return;
        };

        let _ = sweeper.shutdown_tx.send(true);
        let mut task = AbortOnDrop(sweeper.handle);
        if let Err(e) = (&mut task.0).await {
            debug!("Nonce sweep task ended abnormally: {}", e);
        }
        info!("Nonce guard stopped");
    }

    /// Whether the sweep task is still owned by this guard.
    pub fn is_running(&self) -> bool {
        match self.sweeper.lock() {
            Ok(guard) => guard.as_ref().is_some_and(|s| !s.handle.is_finished()),
            Err(_) => false,
        }
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    /// Number of recorded nonces. May race with the sweep.
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    pub fn contains(&self, nonce: &str) -> bool {
        self.seen.contains_key(nonce)
    }

    /// Snapshot of recorded nonces. May race with the sweep.
    pub fn nonces(&self) -> Vec<String> {
        self.seen.iter().map(|entry| entry.key().clone()).collect()
    }
}

impl Drop for NonceGuard {
    fn drop(&mut self) {
        let sweeper = match self.sweeper.get_mut() {
            Ok(slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(sweeper) = sweeper {
            sweeper.handle.abort();
        }
    }
}

fn sweep(seen: &DashMap<String, Instant>, retention: Duration) -> usize {
    let before = seen.len();
    seen.retain(|_, accepted_at| accepted_at.elapsed() < retention);
    before.saturating_sub(seen.len())
}
