//! Debounced persistence of session content.
//!
//! Bursts of edits to one session collapse into a single
//! `overwrite_content` once the session has been quiet for the configured
//! interval. Writes run on their own tasks, so the relay path never waits on
//! storage.
//!
//! ```text
//! edit ─► note_edit ─► PendingWrite { content, generation, timer }
//!                              │  (re-armed on every edit)
//!                              ▼
//!                      timer fires ─► write gate ─► store.overwrite_content
//!                                                        │
//!                              ok: clear entry ◄─────────┤
//!                      failed: keep content for retry ◄──┘
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::protocol::SessionId;
use crate::store::{DocumentStore, StoreError};

/// Quiet interval used by the server unless configured otherwise.
pub const DEFAULT_SAVE_DELAY: Duration = Duration::from_millis(1000);

/// Latest unsaved content of one session.
struct PendingWrite {
    content: String,
    /// Generation of the edit that produced `content`.
    generation: u64,
    /// Armed quiet-interval timer. Taken (not aborted) once the timer claims
    /// the write, so an in-flight store call is never cancelled.
    timer: Option<JoinHandle<()>>,
    /// Held for the duration of a store call; one write per session at a time.
    gate: Arc<Mutex<()>>,
}

/// Statistics for monitoring persistence health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DebounceStats {
    pub writes: u64,
    pub failures: u64,
}

struct Inner {
    store: Arc<dyn DocumentStore>,
    delay: Duration,
    pending: Mutex<HashMap<SessionId, PendingWrite>>,
    next_generation: AtomicU64,
    writes: AtomicU64,
    failures: AtomicU64,
}

/// The persistence debouncer. Clones share state.
#[derive(Clone)]
pub struct PersistenceDebouncer {
    inner: Arc<Inner>,
}

impl PersistenceDebouncer {
    pub fn new(store: Arc<dyn DocumentStore>, delay: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                delay,
                pending: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(0),
                writes: AtomicU64::new(0),
                failures: AtomicU64::new(0),
            }),
        }
    }

    pub fn delay(&self) -> Duration {
        self.inner.delay
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.inner.store
    }

    /// Record `content` as the latest buffer for the session and (re)arm the
    /// quiet-interval timer.
    pub async fn note_edit(&self, session_id: &str, content: impl Into<String>) {
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
        let mut pending = self.inner.pending.lock().await;
        let entry = pending
            .entry(session_id.to_string())
            .or_insert_with(|| PendingWrite {
                content: String::new(),
                generation,
                timer: None,
                gate: Arc::new(Mutex::new(())),
            });

        entry.content = content.into();
        entry.generation = generation;
        if let Some(timer) = entry.timer.take() {
            timer.abort();
        }

        let this = self.clone();
        let session_id = session_id.to_string();
        let delay = self.inner.delay;
        entry.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            this.fire(&session_id, generation).await;
        }));
    }

    /// Cancel any armed timer and write the pending content now.
    ///
    /// Returns `Ok(false)` if nothing was pending.
    pub async fn flush_now(&self, session_id: &str) -> Result<bool, StoreError> {
        let gate = {
            let mut pending = self.inner.pending.lock().await;
            let Some(entry) = pending.get_mut(session_id) else {
                return Ok(false);
            };
            if let Some(timer) = entry.timer.take() {
                timer.abort();
            }
            entry.gate.clone()
        };
        self.write(session_id, gate).await
    }

    /// Flush every pending session. Returns the number of failed writes.
    pub async fn flush_all(&self) -> usize {
        let mut failed = 0;
        for session_id in self.pending_sessions().await {
            if self.flush_now(&session_id).await.is_err() {
                failed += 1;
            }
        }
        failed
    }

    /// Sessions with content not yet persisted.
    pub async fn pending_sessions(&self) -> Vec<SessionId> {
        self.inner.pending.lock().await.keys().cloned().collect()
    }

    /// Latest content not yet persisted, if any.
    pub async fn pending_content(&self, session_id: &str) -> Option<String> {
        self.inner
            .pending
            .lock()
            .await
            .get(session_id)
            .map(|entry| entry.content.clone())
    }

    pub async fn has_pending(&self, session_id: &str) -> bool {
        self.inner.pending.lock().await.contains_key(session_id)
    }

    pub fn stats(&self) -> DebounceStats {
        DebounceStats {
            writes: self.inner.writes.load(Ordering::Relaxed),
            failures: self.inner.failures.load(Ordering::Relaxed),
        }
    }

    /// Timer expiry. Does nothing if a newer edit superseded this timer.
    async fn fire(&self, session_id: &str, generation: u64) {
        let gate = {
            let mut pending = self.inner.pending.lock().await;
            match pending.get_mut(session_id) {
                Some(entry) if entry.generation == generation => {
                    entry.timer = None;
                    entry.gate.clone()
                }
                _ => return,
            }
        };
        // Failures are logged and counted inside `write`.
        let _ = self.write(session_id, gate).await;
    }

    async fn write(&self, session_id: &str, gate: Arc<Mutex<()>>) -> Result<bool, StoreError> {
        let _in_flight = gate.lock().await;

        let (content, generation) = {
            let pending = self.inner.pending.lock().await;
            match pending.get(session_id) {
                Some(entry) => (entry.content.clone(), entry.generation),
                // An earlier write already covered it.
                None => return Ok(false),
            }
        };

        let result = self.inner.store.overwrite_content(session_id, &content).await;

        let mut pending = self.inner.pending.lock().await;
        match result {
            Ok(_) => {
                self.inner.writes.fetch_add(1, Ordering::Relaxed);
                Self::clear_if_current(&mut pending, session_id, generation);
                log::debug!("Persisted {} bytes for {session_id}", content.len());
                Ok(true)
            }
            Err(e) if !e.is_retryable() => {
                self.inner.failures.fetch_add(1, Ordering::Relaxed);
                Self::clear_if_current(&mut pending, session_id, generation);
                log::warn!("Discarding pending content for {session_id}: {e}");
                Err(e)
            }
            Err(e) => {
                self.inner.failures.fetch_add(1, Ordering::Relaxed);
                log::error!("Failed to persist {session_id}, keeping content for retry: {e}");
                Err(e)
            }
        }
    }

    /// Drop the entry unless an edit newer than `generation` arrived.
    fn clear_if_current(
        pending: &mut HashMap<SessionId, PendingWrite>,
        session_id: &str,
        generation: u64,
    ) {
        if pending
            .get(session_id)
            .is_some_and(|entry| entry.generation == generation)
        {
            if let Some(mut entry) = pending.remove(session_id) {
                if let Some(timer) = entry.timer.take() {
                    timer.abort();
                }
            }
        }
    }
}
