use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{Mutex as LaneMutex, OwnedMutexGuard};
use tracing::{debug, warn};

use opsgraph_core::error::{OpsError, Result};
use opsgraph_core::session::{Cursor, Decision, Message, Session};
use opsgraph_core::traits::CheckpointBackend;
use opsgraph_core::types::{now, SessionId};

/// Working state plus the last durable snapshot of one session.
struct Slot {
    working: Session,
    durable: Option<Session>,
}

/// Guard that serializes invocations on one session.
pub type SessionLane = OwnedMutexGuard<()>;

/// Append-only session logs with explicit checkpoints.
///
/// Mutations touch the working copy only; `checkpoint` makes it durable
/// and `rollback` throws it away. Callers hold the session lane (see
/// [`ConversationStore::lock`]) for the whole of an invocation.
pub struct ConversationStore {
    slots: Mutex<HashMap<SessionId, Slot>>,
    lanes: Mutex<HashMap<SessionId, Arc<LaneMutex<()>>>>,
    backend: Arc<dyn CheckpointBackend>,
}

impl ConversationStore {
    pub fn new(backend: Arc<dyn CheckpointBackend>) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            lanes: Mutex::new(HashMap::new()),
            backend,
        }
    }

    fn slots(&self) -> Result<MutexGuard<'_, HashMap<SessionId, Slot>>> {
        self.slots
            .lock()
            .map_err(|e| OpsError::Persistence(format!("session table poisoned: {}", e)))
    }

    /// Acquire the per-session lane. At most one invocation runs per session.
    ///
    /// Lanes nobody holds or waits on are dropped here, so the map only
    /// grows with the number of concurrently active sessions.
    pub async fn lock(&self, id: &SessionId) -> SessionLane {
        let lane = {
            let mut lanes = match self.lanes.lock() {
                Ok(l) => l,
                Err(poisoned) => poisoned.into_inner(),
            };
            // Holders and waiters keep a clone; a count of one means idle
            lanes.retain(|key, lane| key == id || Arc::strong_count(lane) > 1);
            lanes
                .entry(id.clone())
                .or_insert_with(|| Arc::new(LaneMutex::new(())))
                .clone()
        };
        lane.lock_owned().await
    }

    #[cfg(test)]
    fn lane_count(&self) -> usize {
        self.lanes.lock().map(|l| l.len()).unwrap_or(0)
    }

    /// Create an empty session with the cursor at the supervisor.
    /// Returns the existing session if the id is already known.
    pub fn create(&self, id: &SessionId) -> Result<Session> {
        if let Ok(existing) = self.load(id) {
            return Ok(existing);
        }
        let session = Session::new(id.clone());
        self.slots()?.insert(
            id.clone(),
            Slot {
                working: session.clone(),
                durable: None,
            },
        );
        debug!(session_id = %id, "Session created");
        Ok(session)
    }

    /// Current working copy. Sessions unknown to this process are
    /// hydrated from the checkpoint backend.
    pub fn load(&self, id: &SessionId) -> Result<Session> {
        if let Some(slot) = self.slots()?.get(id) {
            return Ok(slot.working.clone());
        }

        let stored = self
            .backend
            .load(id)?
            .ok_or_else(|| OpsError::SessionNotFound(id.to_string()))?;

        let mut slots = self.slots()?;
        let slot = slots.entry(id.clone()).or_insert_with(|| Slot {
            working: stored.clone(),
            durable: Some(stored),
        });
        debug!(session_id = %id, revision = slot.working.revision, "Session hydrated from checkpoint");
        Ok(slot.working.clone())
    }

    fn with_working<T>(&self, id: &SessionId, f: impl FnOnce(&mut Session) -> T) -> Result<T> {
        // Make sure the slot exists before mutating
        self.load(id)?;
        let mut slots = self.slots()?;
        let slot = slots
            .get_mut(id)
            .ok_or_else(|| OpsError::SessionNotFound(id.to_string()))?;
        let out = f(&mut slot.working);
        slot.working.updated_at = now();
        Ok(out)
    }

    /// Append messages, assigning their sequence numbers. Returns the
    /// messages as stored.
    pub fn append(&self, id: &SessionId, messages: Vec<Message>) -> Result<Vec<Message>> {
        self.with_working(id, |session| {
            let mut stored = Vec::with_capacity(messages.len());
            for mut msg in messages {
                msg.seq = session.next_seq;
                session.next_seq += 1;
                session.messages.push(msg.clone());
                stored.push(msg);
            }
            stored
        })
    }

    pub fn set_cursor(&self, id: &SessionId, cursor: Cursor) -> Result<()> {
        self.with_working(id, |session| session.cursor = cursor)
    }

    pub fn record_decision(&self, id: &SessionId, decision: Decision) -> Result<()> {
        self.with_working(id, |session| session.last_decision = Some(decision))
    }

    /// Persist the working copy. Returns the new revision.
    pub fn checkpoint(&self, id: &SessionId) -> Result<u64> {
        let mut candidate = self.load(id)?;
        candidate.revision += 1;

        self.backend.save(&candidate)?;

        let mut slots = self.slots()?;
        let slot = slots
            .get_mut(id)
            .ok_or_else(|| OpsError::SessionNotFound(id.to_string()))?;
        slot.working.revision = candidate.revision;
        slot.durable = Some(candidate.clone());
        debug!(session_id = %id, revision = candidate.revision, cursor = %candidate.cursor, "Checkpoint saved");
        Ok(candidate.revision)
    }

    /// Discard un-checkpointed changes. Sequence numbers already handed
    /// out are never reused.
    pub fn rollback(&self, id: &SessionId) -> Result<Session> {
        let mut slots = self.slots()?;
        let slot = slots
            .get_mut(id)
            .ok_or_else(|| OpsError::SessionNotFound(id.to_string()))?;
        let high_water = slot.working.next_seq;
        let mut restored = match &slot.durable {
            Some(durable) => durable.clone(),
            None => Session::new(id.clone()),
        };
        restored.next_seq = restored.next_seq.max(high_water);
        warn!(
            session_id = %id,
            dropped = slot.working.messages.len().saturating_sub(restored.messages.len()),
            "Rolled back un-checkpointed state"
        );
        slot.working = restored.clone();
        Ok(restored)
    }

    /// Every known session id, persisted or in memory.
    pub fn list(&self) -> Result<Vec<SessionId>> {
        let mut ids = self.backend.list()?;
        ids.extend(self.slots()?.keys().cloned());
        ids.sort();
        ids.dedup();
        Ok(ids)
    }
}
