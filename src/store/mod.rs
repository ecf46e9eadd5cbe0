//! Storage slots — in-memory and file-backed key-value stores.

pub mod file;
pub mod memory;
pub mod traits;

pub use file::FileStorage;
pub use memory::MemoryStorage;
pub use traits::Storage;
