pub mod consolidator;
pub mod store;

pub use consolidator::Consolidator;
pub use store::{MemoryEntry, MemoryStore};
