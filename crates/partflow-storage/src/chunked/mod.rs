//! Chunked upload data path.

pub mod assembler;
pub mod store;

pub use assembler::{AssembledObject, Assembler};
pub use store::ChunkStore;
