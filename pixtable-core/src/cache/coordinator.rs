use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tracing::{debug, warn};
use uuid::Uuid;

use crate::bitmap::CachedImage;
use crate::entity::{CacheDelegate, DrawingBlock, Entity, SourceImage};
use crate::error::{CacheError, Result};
use crate::format::ImageFormat;
use crate::paths::CacheConfig;
use crate::table::store::ImageTable;

use super::queue::WorkQueue;

/// How a hit may complete relative to the calling thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrievalMode {
    /// Complete on the calling thread when the entry is already cached.
    SyncIfHot,
    /// Always defer the completion to the work queue.
    AlwaysAsync,
}

pub type Completion = Box<dyn FnOnce(Option<CachedImage>) + Send + 'static>;

type PendingKey = (Uuid, String);

struct PendingRequest {
    waiters: Vec<Completion>,
    cancelled: bool,
}

#[derive(Default)]
struct CacheState {
    formats: HashMap<String, ImageFormat>,
    tables: HashMap<String, ImageTable>,
    /// Format names per family, in `set_formats` order; fan-out follows it.
    family_order: HashMap<String, Vec<String>>,
    pending: HashMap<PendingKey, PendingRequest>,
    formats_set: bool,
}

struct CacheShared {
    config: CacheConfig,
    state: Mutex<CacheState>,
    delegate: Mutex<Weak<dyn CacheDelegate>>,
}

/// One-shot handle a delegate uses to hand a requested source bitmap back to
/// the cache. May be completed from any thread; processing happens on the
/// work queue.
pub struct SourceCompletion {
    cache: ImageCache,
    entity: Arc<dyn Entity>,
    format_name: String,
}

impl SourceCompletion {
    /// Deliver the source, or `None` when it could not be produced.
    pub fn complete(self, source: Option<SourceImage>) {
        let SourceCompletion {
            cache,
            entity,
            format_name,
        } = self;
        WorkQueue::shared().run(move || cache.process_delivery(&entity, &format_name, source));
    }
}

/// The cache coordinator: a set of image tables keyed by format name, plus
/// the in-flight request map that coalesces concurrent retrievals for the
/// same `(entity, format)` pair and fans one source delivery out to every
/// format in the family.
#[derive(Clone)]
pub struct ImageCache {
    shared: Arc<CacheShared>,
}

impl ImageCache {
    pub fn new(config: CacheConfig) -> ImageCache {
        ImageCache {
            shared: Arc::new(CacheShared {
                config,
                state: Mutex::new(CacheState::default()),
                delegate: Mutex::new(Weak::<NoDelegate>::new() as Weak<dyn CacheDelegate>),
            }),
        }
    }

    pub fn with_namespace(namespace: &str) -> ImageCache {
        ImageCache::new(CacheConfig::new(namespace))
    }

    pub fn namespace(&self) -> &str {
        &self.shared.config.namespace
    }

    pub fn config(&self) -> &CacheConfig {
        &self.shared.config
    }

    /// The delegate is held weakly; once its holder drops it, pending
    /// acquisitions complete empty and reports go nowhere.
    pub fn set_delegate(&self, delegate: &Arc<dyn CacheDelegate>) {
        *self
            .shared
            .delegate
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Arc::downgrade(delegate);
    }

    /// Open one table per format. Only the first call does anything; the
    /// table set is frozen afterwards. A format that fails to open (or
    /// duplicates a name) is reported and omitted.
    pub fn set_formats(&self, formats: Vec<ImageFormat>) {
        let mut reports = Vec::new();
        {
            let mut st = self.state();
            if st.formats_set {
                debug!(namespace = self.namespace(), "formats already set; ignoring");
                return;
            }
            st.formats_set = true;
            for format in formats {
                let name = format.name().to_string();
                if st.formats.contains_key(&name) {
                    let err = CacheError::InvalidFormat(format!("duplicate format name {name:?}"));
                    reports.push(err.to_string());
                    continue;
                }
                match ImageTable::open(format.clone(), &self.shared.config) {
                    Ok(table) => {
                        if let Some(family) = format.family() {
                            st.family_order
                                .entry(family.to_string())
                                .or_default()
                                .push(name.clone());
                        }
                        st.formats.insert(name.clone(), format);
                        st.tables.insert(name, table);
                    }
                    Err(err) => reports.push(format!("opening table for {name:?} failed: {err}")),
                }
            }
        }
        for message in &reports {
            self.report_error(message);
        }
    }

    pub fn format_with_name(&self, name: &str) -> Option<ImageFormat> {
        self.state().formats.get(name).cloned()
    }

    /// Formats of `family`, in registration order.
    pub fn formats_with_family(&self, family: &str) -> Vec<ImageFormat> {
        let st = self.state();
        st.family_order
            .get(family)
            .map(|names| {
                names
                    .iter()
                    .filter_map(|name| st.formats.get(name).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Fetch the cached bitmap for `(entity, format_name)`. On a hit the
    /// completion fires with the mapped image (synchronously when `mode`
    /// allows it) and the call returns `true`. On a miss the request joins
    /// any in-flight acquisition for the same key, so the delegate is asked
    /// for a source at most once, and the call returns `false`.
    pub fn retrieve(
        &self,
        entity: &Arc<dyn Entity>,
        format_name: &str,
        mode: RetrievalMode,
        completion: impl FnOnce(Option<CachedImage>) + Send + 'static,
    ) -> bool {
        self.retrieve_boxed(entity, format_name, mode, Box::new(completion))
    }

    fn retrieve_boxed(
        &self,
        entity: &Arc<dyn Entity>,
        format_name: &str,
        mode: RetrievalMode,
        completion: Completion,
    ) -> bool {
        let entity_uuid = entity.uuid();
        let source_uuid = entity.source_uuid();
        let mut report = None;
        {
            let mut st = self.state();
            if !st.tables.contains_key(format_name) {
                drop(st);
                self.report_error(&format!("retrieve for unknown format {format_name:?}"));
                completion(None);
                return false;
            }
            if let Some(table) = st.tables.get_mut(format_name) {
                match table.get(entity_uuid, source_uuid, true) {
                    Ok(Some(view)) => {
                        let image = CachedImage::new(view, table.format());
                        drop(st);
                        match mode {
                            RetrievalMode::SyncIfHot => completion(Some(image)),
                            RetrievalMode::AlwaysAsync => {
                                WorkQueue::shared().run(move || completion(Some(image)));
                            }
                        }
                        return true;
                    }
                    Ok(None) => {}
                    Err(err) => {
                        // degraded table: report, then treat as a miss
                        report = Some(format!("lookup in {format_name:?} failed: {err}"));
                    }
                }
            }

            let key = (entity_uuid, format_name.to_string());
            if let Some(pending) = st.pending.get_mut(&key) {
                if !pending.cancelled {
                    pending.waiters.push(completion);
                    drop(st);
                    if let Some(message) = report {
                        self.report_error(&message);
                    }
                    return false;
                }
            }
            // no live request (a cancelled leftover is replaced wholesale)
            st.pending.insert(
                key,
                PendingRequest {
                    waiters: vec![completion],
                    cancelled: false,
                },
            );
        }
        if let Some(message) = report {
            self.report_error(&message);
        }
        self.dispatch_source_request(Arc::clone(entity), format_name.to_string());
        false
    }

    /// Equivalent of a retrieve hit check without producing pixels. Evicts a
    /// stale entry like `retrieve` would, but never promotes the LRU order.
    pub fn image_exists(&self, entity: &Arc<dyn Entity>, format_name: &str) -> bool {
        let mut st = self.state();
        match st.tables.get_mut(format_name) {
            Some(table) => table
                .exists(entity.uuid(), entity.source_uuid())
                .unwrap_or(false),
            None => false,
        }
    }

    /// Store `image` as if a source acquisition for `(entity, format_name)`
    /// had just produced it: same family fan-out, same waiter completion.
    pub fn set_image(
        &self,
        image: SourceImage,
        entity: &Arc<dyn Entity>,
        format_name: &str,
        completion: impl FnOnce(Option<CachedImage>) + Send + 'static,
    ) {
        let completion: Completion = Box::new(completion);
        {
            let mut st = self.state();
            if !st.tables.contains_key(format_name) {
                drop(st);
                self.report_error(&format!("set_image for unknown format {format_name:?}"));
                completion(None);
                return;
            }
            let key = (entity.uuid(), format_name.to_string());
            match st.pending.get_mut(&key) {
                Some(pending) if !pending.cancelled => pending.waiters.push(completion),
                _ => {
                    st.pending.insert(
                        key,
                        PendingRequest {
                            waiters: vec![completion],
                            cancelled: false,
                        },
                    );
                }
            }
        }
        let cache = self.clone();
        let entity = Arc::clone(entity);
        let format_name = format_name.to_string();
        WorkQueue::shared().run(move || cache.process_delivery(&entity, &format_name, Some(image)));
    }

    /// Advisory cancellation: the acquisition keeps running (and its result
    /// is still stored), but waiters registered so far are discarded and
    /// never called.
    pub fn cancel(&self, entity: &Arc<dyn Entity>, format_name: &str) {
        let key = (entity.uuid(), format_name.to_string());
        let cancelled = {
            let mut st = self.state();
            match st.pending.get_mut(&key) {
                Some(pending) if !pending.cancelled => {
                    pending.cancelled = true;
                    pending.waiters.clear();
                    true
                }
                _ => false,
            }
        };
        if cancelled {
            debug!(format = format_name, "retrieval cancelled");
            if let Some(delegate) = self.delegate() {
                delegate.cancel_source(self, entity, format_name);
            }
        }
    }

    pub fn delete_image(&self, entity: &Arc<dyn Entity>, format_name: &str) {
        let mut st = self.state();
        if let Some(table) = st.tables.get_mut(format_name) {
            table.delete(entity.uuid());
            if let Err(err) = table.save_metadata() {
                warn!(table = format_name, %err, "sidecar save failed");
            }
        }
    }

    /// Reset every table: all entries gone, files deleted.
    pub fn reset(&self) {
        let mut reports = Vec::new();
        {
            let mut st = self.state();
            for (name, table) in st.tables.iter_mut() {
                if let Err(err) = table.reset() {
                    reports.push(format!("resetting {name:?} failed: {err}"));
                }
            }
        }
        for message in &reports {
            self.report_error(message);
        }
    }

    fn dispatch_source_request(&self, entity: Arc<dyn Entity>, format_name: String) {
        let cache = self.clone();
        WorkQueue::shared().run(move || {
            // synchronous shortcut: the entity may hold the source already
            let format = cache.format_with_name(&format_name);
            if let Some(source) = format.as_ref().and_then(|f| entity.image_for_format(f)) {
                cache.process_delivery(&entity, &format_name, Some(source));
                return;
            }
            match cache.delegate() {
                Some(delegate) => {
                    let completion = SourceCompletion {
                        cache: cache.clone(),
                        entity: Arc::clone(&entity),
                        format_name: format_name.clone(),
                    };
                    delegate.want_source(&cache, &entity, &format_name, completion);
                }
                None => cache.process_delivery(&entity, &format_name, None),
            }
        });
    }

    /// Runs on the work queue once a source acquisition finishes (or a
    /// `set_image` bypass delivers directly).
    fn process_delivery(
        &self,
        entity: &Arc<dyn Entity>,
        format_name: &str,
        source: Option<SourceImage>,
    ) {
        if let Err(err) = self.try_process_delivery(entity, format_name, source) {
            match err {
                CacheError::Cancelled => {
                    debug!(format = format_name, "dropping source for cancelled request");
                }
                err => self.report_error(&format!(
                    "processing source for {format_name:?} failed: {err}"
                )),
            }
        }
    }

    fn try_process_delivery(
        &self,
        entity: &Arc<dyn Entity>,
        format_name: &str,
        source: Option<SourceImage>,
    ) -> Result<()> {
        let entity_uuid = entity.uuid();
        let source_uuid = entity.source_uuid();
        let key = (entity_uuid, format_name.to_string());

        let family = {
            let mut st = self.state();
            let cancelled = match st.pending.get(&key) {
                None => return Err(CacheError::Cancelled),
                Some(pending) => pending.cancelled,
            };
            if cancelled {
                st.pending.remove(&key);
                return Err(CacheError::Cancelled);
            }
            st.formats
                .get(format_name)
                .and_then(|f| f.family().map(str::to_string))
        };

        let Some(source) = source else {
            // no source: the waiters fail once, exactly
            for waiter in self.take_waiters(&key) {
                waiter(None);
            }
            return Ok(());
        };

        let targets: Vec<String> = match family.as_deref() {
            Some(family)
                if self
                    .delegate()
                    .is_none_or(|d| d.should_process_family(self, family, entity)) =>
            {
                self.state()
                    .family_order
                    .get(family)
                    .cloned()
                    .unwrap_or_default()
            }
            _ => vec![format_name.to_string()],
        };

        let mut reports = Vec::new();
        for target in &targets {
            let image = match entity.drawing_block(&source, target) {
                Some(block) => {
                    self.store_entry(target, entity_uuid, source_uuid, block, &mut reports)
                }
                None => None,
            };
            for waiter in self.take_waiters(&(entity_uuid, target.clone())) {
                waiter(image.clone());
            }
        }
        for message in &reports {
            self.report_error(message);
        }
        Ok(())
    }

    fn store_entry(
        &self,
        format_name: &str,
        entity_uuid: Uuid,
        source_uuid: Uuid,
        block: DrawingBlock,
        reports: &mut Vec<String>,
    ) -> Option<CachedImage> {
        let mut st = self.state();
        let table = st.tables.get_mut(format_name)?;
        if let Err(err) = table.put(entity_uuid, source_uuid, block) {
            reports.push(format!("storing entry in {format_name:?} failed: {err}"));
            return None;
        }
        if let Err(err) = table.save_metadata() {
            warn!(table = format_name, %err, "sidecar save failed");
        }
        match table.get(entity_uuid, source_uuid, false) {
            Ok(Some(view)) => Some(CachedImage::new(view, table.format())),
            Ok(None) => None,
            Err(err) => {
                reports.push(format!("reading back entry in {format_name:?} failed: {err}"));
                None
            }
        }
    }

    /// Detach the waiters for `key`; a cancelled request yields none.
    fn take_waiters(&self, key: &PendingKey) -> Vec<Completion> {
        let mut st = self.state();
        match st.pending.remove(key) {
            Some(pending) if !pending.cancelled => pending.waiters,
            _ => Vec::new(),
        }
    }

    fn state(&self) -> MutexGuard<'_, CacheState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn delegate(&self) -> Option<Arc<dyn CacheDelegate>> {
        self.shared
            .delegate
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .upgrade()
    }

    fn report_error(&self, message: &str) {
        warn!(namespace = self.namespace(), "{message}");
        if let Some(delegate) = self.delegate() {
            delegate.error(self, message);
        }
    }
}

/// Placeholder type so the delegate slot can start out empty.
struct NoDelegate;

impl CacheDelegate for NoDelegate {
    fn want_source(
        &self,
        _cache: &ImageCache,
        _entity: &Arc<dyn Entity>,
        _format_name: &str,
        completion: SourceCompletion,
    ) {
        completion.complete(None);
    }
}
