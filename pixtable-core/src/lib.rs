pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod error;
pub mod format;
pub mod ident;
pub mod paths;

pub mod table {
    pub mod chunk;
    pub mod entry;
    pub mod sidecar;
    pub mod slots;
    pub mod store;
}

pub mod cache {
    pub mod coordinator;
    pub mod queue;
}

pub mod bitmap;
pub mod entity;

pub use crate::error::{CacheError, IoKind, Result};

pub use bitmap::{BitmapContext, CachedImage};
pub use cache::coordinator::{Completion, ImageCache, RetrievalMode, SourceCompletion};
pub use cache::queue::WorkQueue;
pub use entity::{CacheDelegate, DrawingBlock, Entity, SourceImage};
pub use format::{ImageFormat, PixelStyle, ProtectionMode};
pub use ident::uuid_from_md5;
pub use paths::CacheConfig;
pub use table::entry::{EntryView, Trailer};
pub use table::store::ImageTable;

pub mod prelude {
    pub use crate::Result;
    pub use crate::bitmap::{BitmapContext, CachedImage};
    pub use crate::cache::coordinator::{ImageCache, RetrievalMode};
    pub use crate::entity::{CacheDelegate, DrawingBlock, Entity, SourceImage};
    pub use crate::format::{ImageFormat, PixelStyle};
    pub use crate::paths::CacheConfig;
}
