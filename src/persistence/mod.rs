//! Workflow persistence — envelope codec, the storage-slot manager, and
//! debounced auto-save.

pub mod autosave;
pub mod envelope;
pub mod manager;
pub mod obfuscate;

pub use autosave::AutoSaver;
pub use envelope::{EnvelopeCodec, PersistedEnvelope, Rejection};
pub use manager::PersistenceManager;
