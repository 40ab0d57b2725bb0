pub mod blob;
pub mod collection;
pub mod fallback;
pub mod primary;

pub use blob::{BlobStore, FileBlobStore, MemoryBlobStore};
pub use collection::Collection;
pub use fallback::FallbackBackend;
pub use primary::SqliteBackend;
