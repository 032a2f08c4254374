//! Concrete repository implementations.

pub mod file;
pub mod job;
pub mod upload;

pub use file::FileRepository;
pub use job::JobRepository;
pub use upload::UploadSessionRepository;
