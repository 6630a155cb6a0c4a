//! Feature cache.
//!
//! Memoizes features of one layer by id in a bounded LRU store. Requests
//! whose attributes and geometry are covered by the cache are served from
//! resident features when the cache is full, when every requested id is
//! resident, or when a [`CacheIndex`] knows the result. Other covered
//! requests stream from the layer through a writer iterator that fills the
//! cache as it goes.
//!
//! The cache follows the layer through its events: schema and bulk data
//! changes clear it, single feature changes are patched in place. Every
//! event advances the cache generation; features read from the layer under
//! an older generation are never stored.

use std::num::NonZeroUsize;
use std::sync::{Arc, Weak};

use lru::LruCache;
use parking_lot::Mutex;
use vlayer_core::{Feature, FeatureId, Fields, Result};
use vlayer_layer::{LayerEvent, SubscriptionId, VectorLayer};
use vlayer_query::{FeatureIterator, FeatureRequest, Filter, SimplifyMethod};

use crate::index::CacheIndex;
use crate::iterators::{CachedFeatureIterator, CachedFeatureWriterIterator};
use crate::settings::{normalize, CacheSettings};

/// Headroom added to the capacity when every feature must fit.
const FULL_CACHE_HEADROOM: usize = 100;

/// Cache statistics.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub resident: usize,
    pub capacity: usize,
    pub full: bool,
}

impl CacheStats {
    /// Hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

pub(crate) struct CacheState {
    features: LruCache<FeatureId, Arc<Feature>>,
    full: bool,
    settings: CacheSettings,
    indices: Vec<Box<dyn CacheIndex>>,
    hits: u64,
    misses: u64,
    /// Advanced by every layer event and every invalidation.
    generation: u64,
}

fn capacity(n: usize) -> NonZeroUsize {
    NonZeroUsize::new(n).unwrap_or(NonZeroUsize::MIN)
}

impl CacheState {
    fn new(settings: CacheSettings) -> Self {
        Self {
            features: LruCache::new(capacity(settings.max_features)),
            full: false,
            settings,
            indices: Vec::new(),
            hits: 0,
            misses: 0,
            generation: 0,
        }
    }

    #[inline]
    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    /// Stores a feature. Evicting another feature ends full-cache mode.
    pub(crate) fn insert(&mut self, feature: Feature) {
        let id = feature.id();
        if let Some((evicted, _)) = self.features.push(id, Arc::new(feature)) {
            if evicted != id {
                tracing::trace!(evicted, "cached feature evicted");
                self.full = false;
            }
        }
    }

    /// Notifies indices of a completed request, and enters full-cache mode
    /// when the request covered the whole layer.
    pub(crate) fn request_completed(&mut self, request: &FeatureRequest, ids: &[FeatureId]) {
        // results that did not fit are not indexed
        if ids.len() > self.features.len() {
            return;
        }
        for index in &mut self.indices {
            index.on_request_completed(request, ids);
        }
        if matches!(request.filter(), Filter::None) && request.limit().is_none() {
            tracing::debug!(features = ids.len(), "feature cache full");
            self.full = true;
        }
    }

    fn invalidate(&mut self) {
        self.generation += 1;
        self.features.clear();
        self.full = false;
        for index in &mut self.indices {
            index.on_invalidated();
        }
        tracing::debug!("feature cache invalidated");
    }

    fn invalidate_indices(&mut self) {
        for index in &mut self.indices {
            index.on_invalidated();
        }
    }

    fn grow_to(&mut self, needed: usize) {
        if self.features.cap().get() < needed {
            self.features.resize(capacity(needed));
        }
    }

    /// Returns true if resident features hold everything `request` reads.
    fn covers(&self, request: &FeatureRequest, fields: &Fields) -> bool {
        let attributes_cached = match request.subset() {
            Some(subset) => subset.iter().all(|i| self.settings.caches_attribute(*i)),
            None => (0..fields.len()).all(|i| self.settings.caches_attribute(i)),
        };
        if !attributes_cached
            || !request
                .referenced_attributes(fields)
                .iter()
                .all(|i| self.settings.caches_attribute(*i))
        {
            return false;
        }
        let needs_geometry = !request.no_geometry()
            || request.filter_rect().is_some()
            || request.expressions_need_geometry();
        !needs_geometry || self.settings.cache_geometry
    }

    fn resident(&self, ids: &[FeatureId]) -> Option<Vec<Arc<Feature>>> {
        ids.iter()
            .map(|id| self.features.peek(id).cloned())
            .collect()
    }

    /// Resident features that answer `request`, if the cache can answer it.
    fn serve(&self, request: &FeatureRequest) -> Option<Vec<Arc<Feature>>> {
        if self.full {
            let mut features: Vec<Arc<Feature>> =
                self.features.iter().map(|(_, f)| f.clone()).collect();
            features.sort_by_key(|f| f.id());
            return Some(features);
        }
        for index in &self.indices {
            if let Some(features) = index.can_serve(request).and_then(|ids| self.resident(&ids)) {
                return Some(features);
            }
        }
        match request.filter() {
            Filter::Fid(id) => self.resident(&[*id]),
            Filter::Fids(ids) => {
                let mut ids: Vec<FeatureId> = ids.iter().copied().collect();
                ids.sort_unstable();
                self.resident(&ids)
            }
            _ => None,
        }
    }

    /// The request a writer iterator issues so that what it stores is complete.
    fn writer_request(&self, request: &FeatureRequest) -> FeatureRequest {
        let mut writer = request.clone().with_simplify(SimplifyMethod::None);
        if self.settings.cache_geometry {
            writer.set_no_geometry(false);
        }
        let subset = match (request.subset(), &self.settings.cached_attributes) {
            (Some(subset), Some(cached)) => Some(normalize(
                subset.iter().chain(cached.iter()).copied().collect(),
            )),
            _ => None,
        };
        writer.set_subset(subset);
        writer
    }

    /// Request for a single feature as the cache stores it.
    fn fid_request(&self, id: FeatureId) -> FeatureRequest {
        let request = FeatureRequest::new()
            .with_filter_fid(id)
            .with_no_geometry(!self.settings.cache_geometry);
        match &self.settings.cached_attributes {
            Some(cached) => request.with_subset_of_attributes(cached.iter().copied()),
            None => request,
        }
    }

    fn apply_attribute_added(&mut self, index: usize) {
        if let Some(cached) = &mut self.settings.cached_attributes {
            for i in cached.iter_mut() {
                if *i >= index {
                    *i += 1;
                }
            }
            cached.push(index);
            cached.sort_unstable();
        }
        self.invalidate();
    }

    fn apply_attribute_deleted(&mut self, index: usize) {
        if let Some(cached) = &mut self.settings.cached_attributes {
            *cached = cached
                .iter()
                .filter(|i| **i != index)
                .map(|i| if *i > index { i - 1 } else { *i })
                .collect();
        }
        self.invalidate();
    }
}

/// Cache of one layer's features.
pub struct FeatureCache {
    layer: Arc<VectorLayer>,
    state: Arc<Mutex<CacheState>>,
    subscription: SubscriptionId,
}

impl FeatureCache {
    pub fn new(layer: Arc<VectorLayer>, settings: CacheSettings) -> Self {
        let state = Arc::new(Mutex::new(CacheState::new(settings)));
        let weak_state = Arc::downgrade(&state);
        let weak_layer = Arc::downgrade(&layer);
        let subscription = layer.subscribe(move |event: &LayerEvent| {
            handle_event(&weak_state, &weak_layer, event);
        });
        Self {
            layer,
            state,
            subscription,
        }
    }

    pub fn layer(&self) -> &Arc<VectorLayer> {
        &self.layer
    }

    pub fn settings(&self) -> CacheSettings {
        self.state.lock().settings.clone()
    }

    pub fn cache_size(&self) -> usize {
        self.state.lock().features.cap().get()
    }

    /// Sets the capacity. Shrinking below the resident count evicts features.
    pub fn set_cache_size(&self, size: usize) {
        let mut state = self.state.lock();
        if size < state.features.len() {
            state.full = false;
        }
        state.features.resize(capacity(size));
        state.settings.max_features = size;
    }

    /// Turns geometry caching on or off. Turning it on clears the cache.
    pub fn set_cache_geometry(&self, cache_geometry: bool) {
        let mut state = self.state.lock();
        let must_invalidate = cache_geometry && !state.settings.cache_geometry;
        state.settings.cache_geometry = cache_geometry;
        if must_invalidate {
            state.invalidate();
        }
    }

    /// Sets which fields are cached. None caches every field.
    pub fn set_cache_subset_of_attributes(&self, attributes: Option<Vec<usize>>) {
        let mut state = self.state.lock();
        let attributes = attributes.map(normalize);
        if state.settings.cached_attributes != attributes {
            state.settings.cached_attributes = attributes;
            state.invalidate();
        }
    }

    pub fn add_cache_index(&self, index: Box<dyn CacheIndex>) {
        self.state.lock().indices.push(index);
    }

    pub fn is_fid_cached(&self, id: FeatureId) -> bool {
        self.state.lock().features.contains(&id)
    }

    /// Drops one feature from the cache. Returns true if it was resident.
    pub fn remove_cached_feature(&self, id: FeatureId) -> bool {
        let mut state = self.state.lock();
        let removed = state.features.pop(&id).is_some();
        if removed {
            state.full = false;
        }
        removed
    }

    pub fn invalidate(&self) {
        self.state.lock().invalidate();
    }

    pub fn is_full(&self) -> bool {
        self.state.lock().full
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        CacheStats {
            hits: state.hits,
            misses: state.misses,
            resident: state.features.len(),
            capacity: state.features.cap().get(),
            full: state.full,
        }
    }

    /// Returns a feature by id, from the cache unless `skip_cache`.
    ///
    /// A miss fetches the feature from the layer and stores it. A miss on a
    /// full cache means the feature does not exist.
    pub fn feature_at_id(&self, id: FeatureId, skip_cache: bool) -> Result<Option<Feature>> {
        let (request, generation) = {
            let mut state = self.state.lock();
            if !skip_cache {
                if let Some(feature) = state.features.get(&id).cloned() {
                    state.hits += 1;
                    return Ok(Some(Feature::clone(&feature)));
                }
                state.misses += 1;
                if state.full {
                    return Ok(None);
                }
            }
            (state.fid_request(id), state.generation)
        };

        let feature = self.layer.get_features(&request)?.next_feature()?;
        if let Some(feature) = &feature {
            let mut state = self.state.lock();
            if state.generation == generation {
                state.insert(feature.clone());
            }
        }
        Ok(feature)
    }

    /// Iterates features matching `request`, from the cache where possible.
    pub fn get_features(&self, request: &FeatureRequest) -> Result<FeatureIterator> {
        let fields = self.layer.fields();
        let (writer_request, generation) = {
            let mut state = self.state.lock();
            if !state.covers(request, &fields) {
                drop(state);
                tracing::trace!("request not covered by cache");
                return self.layer.get_features(request);
            }
            if let Some(features) = state.serve(request) {
                state.hits += 1;
                tracing::trace!(features = features.len(), "request served from cache");
                let iter = CachedFeatureIterator::new(features, request.clone(), fields);
                return Ok(FeatureIterator::new(iter, request.clone()));
            }
            state.misses += 1;
            (state.writer_request(request), state.generation)
        };

        let inner = self.layer.get_features(&writer_request)?;
        let writer = CachedFeatureWriterIterator::new(
            inner,
            self.state.clone(),
            request.clone(),
            generation,
        );
        Ok(FeatureIterator::new(writer, request.clone()))
    }

    /// Turns full-cache mode on, loading every feature, or off.
    pub fn set_full_cache(&self, full: bool) -> Result<()> {
        if full {
            self.populate_full_cache(|_| true)?;
        } else {
            self.state.lock().full = false;
        }
        Ok(())
    }

    /// Loads every feature of the layer into the cache.
    ///
    /// `progress` is called with the number of features loaded so far every
    /// `progress_interval` features; returning false cancels. Returns true if
    /// the cache ended up full. A canceled population leaves valid but
    /// partial contents, as does a layer edit made while loading.
    pub fn populate_full_cache(&self, mut progress: impl FnMut(usize) -> bool) -> Result<bool> {
        let total = self.layer.feature_count();
        let (request, interval, generation) = {
            let mut state = self.state.lock();
            state.grow_to(total + FULL_CACHE_HEADROOM);
            let base = FeatureRequest::new().with_no_geometry(!state.settings.cache_geometry);
            (
                state.writer_request(&base),
                state.settings.progress_interval.max(1),
                state.generation,
            )
        };

        let inner = self.layer.get_features(&request)?;
        let writer = CachedFeatureWriterIterator::new(
            inner,
            self.state.clone(),
            FeatureRequest::new(),
            generation,
        );
        let iter = FeatureIterator::new(writer, FeatureRequest::new());
        let mut loaded = 0;
        while iter.next_feature()?.is_some() {
            loaded += 1;
            if loaded % interval == 0 {
                tracing::debug!(loaded, total, "populating feature cache");
                if !progress(loaded) {
                    tracing::debug!(loaded, "feature cache population canceled");
                    return Ok(false);
                }
            }
        }
        let state = self.state.lock();
        if state.generation != generation {
            tracing::debug!(loaded, "layer changed while populating feature cache");
            return Ok(false);
        }
        Ok(state.full)
    }
}

impl Drop for FeatureCache {
    fn drop(&mut self) {
        self.layer.unsubscribe(self.subscription);
    }
}

/// Keeps a cache in step with its layer.
fn handle_event(state: &Weak<Mutex<CacheState>>, layer: &Weak<VectorLayer>, event: &LayerEvent) {
    let state = match state.upgrade() {
        Some(state) => state,
        None => return,
    };
    state.lock().generation += 1;
    match event {
        LayerEvent::FeatureAdded { id } => {
            let (request, generation) = {
                let mut state = state.lock();
                state.invalidate_indices();
                if !state.full {
                    return;
                }
                (state.fid_request(*id), state.generation)
            };
            let layer = match layer.upgrade() {
                Some(layer) => layer,
                None => return,
            };
            let total = layer.feature_count();
            match layer.get_features(&request).and_then(|it| it.next_feature()) {
                Ok(Some(feature)) => {
                    let mut state = state.lock();
                    if state.generation != generation {
                        state.full = false;
                        return;
                    }
                    if state.features.cap().get() <= total {
                        state.grow_to(total + FULL_CACHE_HEADROOM);
                    }
                    state.insert(feature);
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(id, %err, "added feature not cached");
                    state.lock().full = false;
                }
            }
        }
        LayerEvent::FeatureDeleted { id } => {
            let mut state = state.lock();
            state.features.pop(id);
            for index in &mut state.indices {
                index.on_feature_removed(*id);
            }
        }
        LayerEvent::GeometryChanged { id, geometry } => {
            let mut state = state.lock();
            state.invalidate_indices();
            if !state.settings.cache_geometry {
                return;
            }
            if let Some(feature) = state.features.get_mut(id) {
                Arc::make_mut(feature).set_geometry(geometry.clone());
            }
        }
        LayerEvent::AttributeValueChanged { id, index, value } => {
            let mut state = state.lock();
            state.invalidate_indices();
            if let Some(feature) = state.features.get_mut(id) {
                Arc::make_mut(feature).set_attribute(*index, value.clone());
            }
        }
        LayerEvent::AttributeAdded { index } => state.lock().apply_attribute_added(*index),
        LayerEvent::AttributeDeleted { index } => state.lock().apply_attribute_deleted(*index),
        LayerEvent::UpdatedFields | LayerEvent::DataChanged => state.lock().invalidate(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vlayer_core::{DataType, Value};
    use vlayer_query::MemoryProvider;

    fn cache(count: i64, settings: CacheSettings) -> (Arc<MemoryProvider>, FeatureCache) {
        let provider = Arc::new(MemoryProvider::with_columns(&[("x", DataType::Int64)]).unwrap());
        for i in 1..=count {
            provider.add_feature(vec![Value::Int64(i)], None);
        }
        let layer = VectorLayer::new("l", "L", provider.clone());
        (provider, FeatureCache::new(layer, settings))
    }

    #[test]
    fn test_feature_at_id_hits_after_miss() {
        let (provider, cache) = cache(3, CacheSettings::default());
        assert_eq!(cache.feature_at_id(2, false).unwrap().unwrap().id(), 2);
        provider.set_failure(Some("offline".into()));
        assert_eq!(cache.feature_at_id(2, false).unwrap().unwrap().id(), 2);
        assert!(cache.feature_at_id(2, true).is_err());

        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses), (1, 1));
        assert_eq!(stats.hit_rate(), 0.5);
    }

    #[test]
    fn test_lru_eviction_ends_full_mode() {
        let (_, cache) = cache(3, CacheSettings::default().with_max_features(2));
        cache.set_full_cache(true).unwrap();
        assert!(cache.is_full());
        assert!(cache.cache_size() >= 103);

        cache.set_cache_size(2);
        assert!(!cache.is_full());
        assert_eq!(cache.stats().resident, 2);
        assert!(!cache.is_fid_cached(1));
    }

    #[test]
    fn test_attribute_renumbering() {
        let mut state = CacheState::new(
            CacheSettings::default().with_cached_attributes(Some(vec![0, 2, 3])),
        );
        state.apply_attribute_deleted(2);
        assert_eq!(state.settings.cached_attributes, Some(vec![0, 2]));
        state.apply_attribute_added(1);
        assert_eq!(state.settings.cached_attributes, Some(vec![0, 1, 3]));
    }

    #[test]
    fn test_writer_request_covers_cached_attributes() {
        let state = CacheState::new(
            CacheSettings::default().with_cached_attributes(Some(vec![0, 2])),
        );
        let request = FeatureRequest::new()
            .with_subset_of_attributes([1])
            .with_no_geometry(true)
            .with_simplify(SimplifyMethod::Distance { tolerance: 1.0 });
        let writer = state.writer_request(&request);
        assert_eq!(writer.subset(), Some(&[0, 1, 2][..]));
        assert!(!writer.no_geometry());
        assert_eq!(writer.simplify(), SimplifyMethod::None);
    }

    #[test]
    fn test_uncovered_request_bypasses_cache() {
        let (_, cache) = cache(3, CacheSettings::default().with_cache_geometry(false));
        let iter = cache.get_features(&FeatureRequest::new()).unwrap();
        assert_eq!(iter.collect_features().unwrap().len(), 3);
        assert_eq!(cache.stats().resident, 0);

        let covered = FeatureRequest::new().with_no_geometry(true);
        cache.get_features(&covered).unwrap().collect_features().unwrap();
        assert_eq!(cache.stats().resident, 3);
        assert!(cache.is_full());
    }
}
