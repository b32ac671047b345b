pub mod memory;
pub mod model;
pub mod storage;

pub use memory::InMemoryStorage;
pub use model::{AdminSession, ApiKey, Channel, CooldownEntry, LogEntry, Token};
pub use storage::{Storage, StorageError, StorageResult};
