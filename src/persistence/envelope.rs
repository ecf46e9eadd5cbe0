//! Envelope codec — wraps a partial state snapshot with timestamps, expiry,
//! schema version and session id.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StorageError;
use crate::workflow::StatePatch;

use super::obfuscate;

const MILLIS_PER_MINUTE: i64 = 60 * 1000;

/// The stored form of a state snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedEnvelope {
    /// Epoch milliseconds.
    pub created_at: i64,
    /// Epoch milliseconds. Never readable past this instant.
    pub expires_at: i64,
    pub schema_version: u32,
    pub session_id: Uuid,
    pub state: StatePatch,
}

impl PersistedEnvelope {
    pub fn is_expired(&self, now_ms: i64) -> bool {
        now_ms > self.expires_at
    }

    /// Whole minutes since the envelope was created.
    pub fn age_minutes(&self, now_ms: i64) -> i64 {
        (now_ms - self.created_at).max(0) / MILLIS_PER_MINUTE
    }
}

/// Why a stored envelope was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    Malformed(String),
    SchemaMismatch { found: u32, expected: u32 },
    Expired { expires_at: i64, now: i64 },
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Malformed(reason) => write!(f, "malformed envelope: {reason}"),
            Self::SchemaMismatch { found, expected } => {
                write!(f, "schema version {found}, expected {expected}")
            }
            Self::Expired { expires_at, now } => {
                write!(f, "expired at {expires_at}, now {now}")
            }
        }
    }
}

/// Encodes and decodes envelopes for one schema version.
#[derive(Debug, Clone, Copy)]
pub struct EnvelopeCodec {
    schema_version: u32,
    obfuscate: bool,
}

impl EnvelopeCodec {
    pub fn new(schema_version: u32, obfuscate: bool) -> Self {
        Self {
            schema_version,
            obfuscate,
        }
    }

    pub fn schema_version(&self) -> u32 {
        self.schema_version
    }

    /// Build a fresh envelope expiring `ttl_minutes` from `now_ms`.
    pub fn wrap(
        &self,
        state: StatePatch,
        session_id: Uuid,
        ttl_minutes: i64,
        now_ms: i64,
    ) -> PersistedEnvelope {
        PersistedEnvelope {
            created_at: now_ms,
            expires_at: now_ms.saturating_add(ttl_minutes.saturating_mul(MILLIS_PER_MINUTE)),
            schema_version: self.schema_version,
            session_id,
            state,
        }
    }

    /// Serialize `state` into a storable string.
    pub fn encode(
        &self,
        state: &StatePatch,
        session_id: Uuid,
        ttl_minutes: i64,
        now_ms: i64,
    ) -> Result<String, StorageError> {
        let envelope = self.wrap(state.clone(), session_id, ttl_minutes, now_ms);
        self.encode_envelope(&envelope)
    }

    /// Serialize an already-built envelope.
    pub fn encode_envelope(&self, envelope: &PersistedEnvelope) -> Result<String, StorageError> {
        let json = serde_json::to_string(envelope)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        if self.obfuscate {
            Ok(obfuscate::obfuscate(&json))
        } else {
            Ok(json)
        }
    }

    /// Parse and validate a stored string.
    ///
    /// Plain and obfuscated forms are both accepted regardless of the
    /// `obfuscate` setting, so toggling it does not strand stored state.
    pub fn decode(&self, raw: &str, now_ms: i64) -> Result<PersistedEnvelope, Rejection> {
        let json =
            obfuscate::deobfuscate(raw).map_err(|e| Rejection::Malformed(e.to_string()))?;
        let envelope: PersistedEnvelope =
            serde_json::from_str(&json).map_err(|e| Rejection::Malformed(e.to_string()))?;

        if envelope.schema_version != self.schema_version {
            return Err(Rejection::SchemaMismatch {
                found: envelope.schema_version,
                expected: self.schema_version,
            });
        }
        if envelope.is_expired(now_ms) {
            return Err(Rejection::Expired {
                expires_at: envelope.expires_at,
                now: now_ms,
            });
        }
        Ok(envelope)
    }

    /// Like [`EnvelopeCodec::decode`] but only yields the state.
    pub fn decode_state(&self, raw: &str, now_ms: i64) -> Option<StatePatch> {
        self.decode(raw, now_ms).ok().map(|e| e.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::Step;

    const NOW: i64 = 1_760_000_000_000;

    fn patch() -> StatePatch {
        StatePatch::new().step(Step::Pricing).authenticated(true)
    }

    #[test]
    fn decode_within_ttl() {
        let codec = EnvelopeCodec::new(1, false);
        let raw = codec.encode(&patch(), Uuid::new_v4(), 10, NOW).unwrap();
        let envelope = codec.decode(&raw, NOW + 9 * MILLIS_PER_MINUTE).unwrap();
        assert_eq!(envelope.state, patch());
        assert_eq!(envelope.expires_at - envelope.created_at, 10 * MILLIS_PER_MINUTE);
    }

    #[test]
    fn expiry_boundary_is_inclusive() {
        let codec = EnvelopeCodec::new(1, false);
        let raw = codec.encode(&patch(), Uuid::new_v4(), 10, NOW).unwrap();
        let expires_at = NOW + 10 * MILLIS_PER_MINUTE;
        assert!(codec.decode(&raw, expires_at).is_ok());
        assert!(matches!(
            codec.decode(&raw, expires_at + 1),
            Err(Rejection::Expired { .. })
        ));
    }

    #[test]
    fn schema_mismatch_rejected() {
        let old = EnvelopeCodec::new(1, false);
        let new = EnvelopeCodec::new(2, false);
        let raw = old.encode(&patch(), Uuid::new_v4(), 10, NOW).unwrap();
        assert_eq!(
            new.decode(&raw, NOW),
            Err(Rejection::SchemaMismatch {
                found: 1,
                expected: 2
            })
        );
    }

    #[test]
    fn garbage_is_malformed() {
        let codec = EnvelopeCodec::new(1, true);
        assert!(matches!(codec.decode("{not json", NOW), Err(Rejection::Malformed(_))));
        assert!(codec.decode_state("", NOW).is_none());
    }

    #[test]
    fn obfuscated_and_plain_both_decode() {
        let obfuscating = EnvelopeCodec::new(1, true);
        let plain = EnvelopeCodec::new(1, false);
        let raw = obfuscating.encode(&patch(), Uuid::new_v4(), 10, NOW).unwrap();
        assert!(raw.starts_with(obfuscate::PREFIX));
        assert_eq!(plain.decode_state(&raw, NOW), Some(patch()));
    }

    #[test]
    fn huge_ttl_saturates_instead_of_wrapping() {
        let codec = EnvelopeCodec::new(1, false);
        let envelope = codec.wrap(patch(), Uuid::new_v4(), i64::MAX, NOW);
        assert_eq!(envelope.expires_at, i64::MAX);
        assert!(!envelope.is_expired(NOW));
    }

    #[test]
    fn age_in_whole_minutes() {
        let codec = EnvelopeCodec::new(1, false);
        let envelope = codec.wrap(patch(), Uuid::new_v4(), 30, NOW);
        assert_eq!(envelope.age_minutes(NOW + 90 * 1000), 1);
        // A clock behind the creation time reads as age zero.
        assert_eq!(envelope.age_minutes(NOW - 5000), 0);
    }
}
