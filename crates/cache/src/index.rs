//! Cache indices.
//!
//! An index remembers which cached features answer a request, so that a
//! cache that is not full can still serve that request without the layer.

use hashbrown::HashMap;
use vlayer_core::FeatureId;
use vlayer_query::{request_fingerprint, FeatureRequest, Filter};

/// Acceleration structure over a feature cache.
pub trait CacheIndex: Send {
    /// Ids answering `request`, in result order, if this index knows them.
    ///
    /// The cache serves the request only if every id is resident.
    fn can_serve(&self, request: &FeatureRequest) -> Option<Vec<FeatureId>>;

    /// Called when a request completed and its whole result fits the cache.
    fn on_request_completed(&mut self, request: &FeatureRequest, ids: &[FeatureId]);

    /// Called when a feature is deleted from the layer.
    fn on_feature_removed(&mut self, id: FeatureId);

    /// Called when the cache is cleared or results may have changed.
    fn on_invalidated(&mut self);
}

/// Remembers the result ids of completed filtered requests.
#[derive(Debug)]
pub struct RequestResultIndex {
    results: HashMap<u64, Vec<FeatureId>>,
    max_entries: usize,
}

impl Default for RequestResultIndex {
    fn default() -> Self {
        Self::new(64)
    }
}

impl RequestResultIndex {
    pub fn new(max_entries: usize) -> Self {
        Self {
            results: HashMap::new(),
            max_entries,
        }
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

impl CacheIndex for RequestResultIndex {
    fn can_serve(&self, request: &FeatureRequest) -> Option<Vec<FeatureId>> {
        self.results.get(&request_fingerprint(request)).cloned()
    }

    fn on_request_completed(&mut self, request: &FeatureRequest, ids: &[FeatureId]) {
        // unfiltered requests are answered by the full cache flag
        if matches!(request.filter(), Filter::None) {
            return;
        }
        let key = request_fingerprint(request);
        if self.results.len() >= self.max_entries && !self.results.contains_key(&key) {
            return;
        }
        self.results.insert(key, ids.to_vec());
    }

    fn on_feature_removed(&mut self, id: FeatureId) {
        for ids in self.results.values_mut() {
            ids.retain(|x| *x != id);
        }
    }

    fn on_invalidated(&mut self) {
        self.results.clear();
    }
}
