//! `Storage` trait — the single key-value slot interface the flow persists
//! through.
//!
//! The underlying store is string-valued and has no notion of TTL; expiry is
//! enforced by the envelope codec on top of it.

use async_trait::async_trait;

use crate::error::StorageError;

/// Backend-agnostic key-value storage.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Read the value under `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Overwrite the value under `key`.
    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Remove `key`. Removing a missing key is not an error.
    async fn remove(&self, key: &str) -> Result<(), StorageError>;
}
