//! C13 — Session orchestrator façade.
//!
//! Owns the per-session turn map and the session-local authority epoch
//! (spec §5: "the authority epoch is a session-local, monotonically
//! increasing lock"). Routes an inbound `turn_open_proposed` to a freshly
//! created [`TurnArbiter`] and keeps the map of in-flight turns so later
//! events for the same `turn_id` reach the arbiter that owns it. Also
//! guards idempotency-key / provider-invocation-id registration and the
//! graceful-shutdown drain (SPEC_FULL.md A.5).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::arbiter::TurnArbiter;
use crate::config::KernelConfig;
use crate::error::{codes, CoreError, ErrorKind};
use crate::ids::{IdempotencyKey, SessionId, TurnId};
use crate::recorder::BaselineRecorder;

/// Tracks which authority epoch last registered a given idempotency key, so
/// a duplicate within the same epoch is rejected while the same key
/// presented again under a later epoch is treated as fresh (spec §8:
/// "returns true on first call and false on any duplicate within the same
/// authority epoch").
struct IdempotencyLedger {
    registered_at_epoch: DashMap<String, u64>,
}

impl IdempotencyLedger {
    fn new() -> Self {
        Self {
            registered_at_epoch: DashMap::new(),
        }
    }

    /// Returns `true` if `key` is newly registered at `epoch` (or was
    /// previously registered at an earlier epoch), `false` if it was
    /// already registered at this exact `epoch`.
    fn register(&self, key: &IdempotencyKey, epoch: u64) -> bool {
        match self.registered_at_epoch.entry(key.as_str().to_string()) {
            Entry::Occupied(mut entry) => {
                if *entry.get() == epoch {
                    false
                } else {
                    entry.insert(epoch);
                    true
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(epoch);
                true
            }
        }
    }
}

/// A single session: the authority epoch, the idempotency ledger, and the
/// map of in-flight turns, all guarded for concurrent access from whichever
/// worker is driving a given turn (spec §5).
pub struct Session {
    session_id: SessionId,
    config: Arc<KernelConfig>,
    recorder: Arc<BaselineRecorder>,
    authority_epoch: AtomicU64,
    idempotency: IdempotencyLedger,
    turns: DashMap<TurnId, Arc<TurnArbiter>>,
    shutdown_requested: AtomicBool,
}

impl Session {
    pub fn new(session_id: SessionId, config: Arc<KernelConfig>, recorder: Arc<BaselineRecorder>) -> Self {
        Self {
            session_id,
            config,
            recorder,
            authority_epoch: AtomicU64::new(0),
            idempotency: IdempotencyLedger::new(),
            turns: DashMap::new(),
            shutdown_requested: AtomicBool::new(false),
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn authority_epoch(&self) -> u64 {
        self.authority_epoch.load(Ordering::SeqCst)
    }

    /// Advances the session-local authority epoch. Rejects any attempt to
    /// move it backward — the epoch is the session's monotonic lock (spec
    /// §5) and going backward would reopen a window the transport already
    /// closed.
    pub fn advance_authority_epoch(&self, new_epoch: u64) -> Result<(), CoreError> {
        let mut current = self.authority_epoch.load(Ordering::SeqCst);
        loop {
            if new_epoch < current {
                return Err(CoreError::new(
                    ErrorKind::StaleAuthority,
                    codes::STALE_AUTHORITY,
                    format!("authority epoch may not move backward: {new_epoch} < {current}"),
                ));
            }
            match self.authority_epoch.compare_exchange_weak(
                current,
                new_epoch,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Ok(()),
                Err(observed) => current = observed,
            }
        }
    }

    /// Registers an idempotency key (or provider-invocation-id, which
    /// shares this ledger) against the session's current authority epoch.
    /// Raises `StaleAuthority` if `epoch` trails the session's epoch (spec
    /// §8: "raises StaleAuthority when e < session.authority_epoch").
    pub fn register_idempotency_key(&self, key: &IdempotencyKey, epoch: u64) -> Result<bool, CoreError> {
        let current = self.authority_epoch();
        if epoch < current {
            return Err(CoreError::new(
                ErrorKind::StaleAuthority,
                codes::STALE_AUTHORITY,
                format!("registration epoch {epoch} is stale against session epoch {current}"),
            ));
        }
        Ok(self.idempotency.register(key, epoch))
    }

    /// Requests a graceful shutdown: no further `turn_open_proposed` is
    /// admitted, but turns already in flight are left to reach their
    /// terminal state undisturbed (SPEC_FULL.md A.5).
    pub fn request_shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::SeqCst);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    /// Creates and registers a new [`TurnArbiter`] for `turn_id`, or
    /// rejects with `BackendUnavailable` if the session is draining for
    /// shutdown. The caller drives `handle_turn_open_proposed` on the
    /// returned arbiter.
    pub fn open_turn(&self, turn_id: TurnId) -> Result<Arc<TurnArbiter>, CoreError> {
        if self.is_shutting_down() {
            return Err(CoreError::new(
                ErrorKind::BackendUnavailable,
                codes::BUNDLE_RESOLUTION_FAILED,
                "session is draining for shutdown; no new turns are admitted",
            ));
        }
        let arbiter = Arc::new(TurnArbiter::new(
            self.session_id.clone(),
            turn_id.clone(),
            self.config.clone(),
            self.recorder.clone(),
        ));
        self.turns.insert(turn_id, arbiter.clone());
        Ok(arbiter)
    }

    pub fn turn(&self, turn_id: &TurnId) -> Option<Arc<TurnArbiter>> {
        self.turns.get(turn_id).map(|entry| entry.clone())
    }

    /// Drops a closed turn from the in-flight map. The caller is
    /// responsible for having already drained its terminal lifecycle
    /// events and baseline evidence before calling this.
    pub fn retire_turn(&self, turn_id: &TurnId) {
        self.turns.remove(turn_id);
    }

    /// Number of turns still tracked as in flight, used by the shutdown
    /// path to know when draining has finished.
    pub fn in_flight_turn_count(&self) -> usize {
        self.turns.len()
    }
}
