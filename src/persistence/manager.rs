//! PersistenceManager — owns one storage slot and the envelope written to it.
//!
//! Persistence is a convenience, not a correctness requirement: every storage
//! failure is logged and reported as `false`/`None`, never raised.
//!
//! While a session deadline is set, no envelope is written that outlives it.

use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::FlowConfig;
use crate::store::Storage;
use crate::workflow::{StatePatch, WorkflowState};

use super::envelope::{EnvelopeCodec, PersistedEnvelope, Rejection};

/// Save/load/clear for the single persisted envelope.
pub struct PersistenceManager {
    storage: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
    codec: EnvelopeCodec,
    key: String,
    ttl_minutes: i64,
    session_id: Uuid,
    /// Epoch milliseconds at which the authenticated session ends.
    session_deadline: Mutex<Option<i64>>,
}

impl PersistenceManager {
    pub fn new(storage: Arc<dyn Storage>, clock: Arc<dyn Clock>, config: &FlowConfig) -> Self {
        Self {
            storage,
            clock,
            codec: EnvelopeCodec::new(config.schema_version, config.obfuscate),
            key: config.storage_key.clone(),
            ttl_minutes: config.state_ttl_minutes(),
            session_id: Uuid::new_v4(),
            session_deadline: Mutex::new(None),
        }
    }

    /// Override the TTL used by subsequent saves.
    pub fn with_ttl_minutes(mut self, ttl_minutes: i64) -> Self {
        self.ttl_minutes = ttl_minutes;
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Cap the expiry of every later write at `deadline_ms`, or lift the cap.
    pub fn set_session_deadline(&self, deadline_ms: Option<i64>) {
        *self.session_deadline.lock().unwrap_or_else(|e| e.into_inner()) = deadline_ms;
    }

    pub fn session_deadline(&self) -> Option<i64> {
        *self.session_deadline.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn capped(&self, expires_at: i64) -> i64 {
        match self.session_deadline() {
            Some(deadline) => expires_at.min(deadline),
            None => expires_at,
        }
    }

    /// Persist the workflow state, minus step errors and transient values.
    pub async fn save(&self, state: &WorkflowState) -> bool {
        self.save_patch(&state.to_persistable()).await
    }

    /// Overwrite the stored envelope with `patch`.
    ///
    /// Any inline error map is dropped before writing.
    pub async fn save_patch(&self, patch: &StatePatch) -> bool {
        let mut patch = patch.clone();
        patch.errors_by_step = None;

        let now = self.clock.now_millis();
        let mut envelope = self.codec.wrap(patch, self.session_id, self.ttl_minutes, now);
        envelope.expires_at = self.capped(envelope.expires_at);
        let raw = match self.codec.encode_envelope(&envelope) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(key = %self.key, "Failed to encode workflow state: {}", e);
                return false;
            }
        };

        match self.storage.set(&self.key, &raw).await {
            Ok(()) => {
                debug!(key = %self.key, step = ?envelope.state.current_step, "Workflow state saved");
                true
            }
            Err(e) => {
                warn!(key = %self.key, "Failed to persist workflow state: {}", e);
                false
            }
        }
    }

    /// Load the stored state if it is present, current and unexpired.
    ///
    /// Any rejected envelope is removed from the slot.
    pub async fn load(&self) -> Option<StatePatch> {
        self.load_envelope().await.map(|e| e.state)
    }

    /// Load the full envelope, with the same rejection handling as `load`.
    pub async fn load_envelope(&self) -> Option<PersistedEnvelope> {
        let raw = match self.storage.get(&self.key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                warn!(key = %self.key, "Failed to read workflow state: {}", e);
                return None;
            }
        };

        match self.codec.decode(&raw, self.clock.now_millis()) {
            Ok(envelope) => Some(envelope),
            Err(rejection) => {
                match &rejection {
                    Rejection::Expired { .. } => {
                        info!(key = %self.key, "Discarding stored state: {}", rejection)
                    }
                    _ => warn!(key = %self.key, "Discarding stored state: {}", rejection),
                }
                self.clear().await;
                None
            }
        }
    }

    /// Remove the stored envelope.
    pub async fn clear(&self) -> bool {
        match self.storage.remove(&self.key).await {
            Ok(()) => {
                debug!(key = %self.key, "Workflow state cleared");
                true
            }
            Err(e) => {
                warn!(key = %self.key, "Failed to clear workflow state: {}", e);
                false
            }
        }
    }

    /// Push the expiry to `minutes` from now, never past the session
    /// deadline. No-op when nothing valid is stored.
    pub async fn extend_expiry(&self, minutes: i64) -> bool {
        let Some(mut envelope) = self.load_envelope().await else {
            return false;
        };
        let expires_at = self
            .clock
            .now_millis()
            .saturating_add(minutes.saturating_mul(60 * 1000));
        envelope.expires_at = self.capped(expires_at);

        let raw = match self.codec.encode_envelope(&envelope) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(key = %self.key, "Failed to encode extended envelope: {}", e);
                return false;
            }
        };
        match self.storage.set(&self.key, &raw).await {
            Ok(()) => {
                debug!(key = %self.key, minutes, "Workflow state expiry extended");
                true
            }
            Err(e) => {
                warn!(key = %self.key, "Failed to extend workflow state expiry: {}", e);
                false
            }
        }
    }

    /// Whole minutes since the stored envelope was created.
    pub async fn age_minutes(&self) -> Option<i64> {
        let envelope = self.load_envelope().await?;
        Some(envelope.age_minutes(self.clock.now_millis()))
    }
}
