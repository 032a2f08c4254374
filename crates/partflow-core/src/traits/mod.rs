//! Trait seams implemented by provider crates.

pub mod storage;

pub use storage::{ByteStream, StorageObjectMeta, StorageProvider};
