//! # partflow-storage
//!
//! Storage backends and the chunked-upload data path: the local filesystem
//! provider (with atomic publish), the chunk store that persists individual
//! upload parts, and the assembler that concatenates, verifies, and
//! publishes finalized objects.

pub mod chunked;
pub mod providers;

pub use chunked::{Assembler, AssembledObject, ChunkStore};
pub use providers::LocalStorageProvider;
