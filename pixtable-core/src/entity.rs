use std::any::Any;
use std::sync::Arc;

use uuid::Uuid;

use crate::bitmap::BitmapContext;
use crate::cache::coordinator::{ImageCache, SourceCompletion};
use crate::error::Result;
use crate::format::ImageFormat;

/// Opaque source bitmap payload handed from the delegate to drawing blocks.
/// The cache never looks inside it; drawing blocks downcast to whatever
/// concrete image type the application uses.
pub type SourceImage = Arc<dyn Any + Send + Sync>;

/// Renders one format's pixels into the mapped bitmap context. Runs on the
/// cache work queue and must not call back into the cache.
pub type DrawingBlock = Box<dyn FnOnce(&mut BitmapContext<'_>) -> Result<()> + Send>;

/// A logical item whose rendered variants the cache stores. Implementations
/// provide identity and drawing; the cache provides storage.
pub trait Entity: Send + Sync {
    /// Stable identity of the item; never changes for its lifetime.
    fn uuid(&self) -> Uuid;

    /// Identity of the source bitmap currently backing this entity. Changes
    /// whenever the source changes (a new profile photo, say); a mismatch
    /// against a stored entry invalidates it. `ident::uuid_from_md5` covers
    /// the derive-from-URL case.
    fn source_uuid(&self) -> Uuid;

    /// Keys external fetches; the cache never dereferences it.
    fn source_url(&self, format_name: &str) -> Option<String> {
        let _ = format_name;
        None
    }

    /// A block that renders `source` for `format_name`, or `None` to skip
    /// that format during family fan-out.
    fn drawing_block(&self, source: &SourceImage, format_name: &str) -> Option<DrawingBlock>;

    /// Synchronous source shortcut: when this returns `Some`, the delegate is
    /// never asked.
    fn image_for_format(&self, format: &ImageFormat) -> Option<SourceImage> {
        let _ = format;
        None
    }
}

/// The cache's outward-facing collaborator: produces source bitmaps and
/// hears about internal recoveries. Held weakly; once the holder drops it,
/// pending acquisitions complete empty.
pub trait CacheDelegate: Send + Sync {
    /// Produce the source bitmap for `entity`, asynchronously. Call
    /// `completion.complete(..)` from any thread exactly once; completing
    /// with `None` reports the source as unavailable.
    fn want_source(
        &self,
        cache: &ImageCache,
        entity: &Arc<dyn Entity>,
        format_name: &str,
        completion: SourceCompletion,
    );

    /// Advisory: a previously requested source is no longer wanted. The
    /// acquisition may still complete and be stored.
    fn cancel_source(&self, cache: &ImageCache, entity: &Arc<dyn Entity>, format_name: &str) {
        let _ = (cache, entity, format_name);
    }

    /// Whether one source delivery should fan out to every format in
    /// `family`. Defaults to fanning out.
    fn should_process_family(
        &self,
        cache: &ImageCache,
        family: &str,
        entity: &Arc<dyn Entity>,
    ) -> bool {
        let _ = (cache, family, entity);
        true
    }

    /// Human-readable reports of internal recoveries and failures.
    fn error(&self, cache: &ImageCache, message: &str) {
        let _ = (cache, message);
    }
}
