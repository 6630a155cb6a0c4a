//! Iterators of the feature cache.

use std::sync::Arc;

use parking_lot::Mutex;
use vlayer_core::{Feature, FeatureId, Fields, Result};
use vlayer_query::{
    FeatureIterator, FeatureRequest, FetchFeatures, InterruptionChecker, OrderByClause,
    SimplifyMethod,
};

use crate::cache::CacheState;

/// Serves a request from resident features only.
pub struct CachedFeatureIterator {
    features: Vec<Arc<Feature>>,
    pos: usize,
    request: FeatureRequest,
    fields: Fields,
    closed: bool,
}

impl CachedFeatureIterator {
    pub(crate) fn new(features: Vec<Arc<Feature>>, request: FeatureRequest, fields: Fields) -> Self {
        Self {
            features,
            pos: 0,
            request,
            fields,
            closed: false,
        }
    }
}

impl FetchFeatures for CachedFeatureIterator {
    fn fetch_feature(&mut self) -> Result<Option<Feature>> {
        if self.closed {
            return Ok(None);
        }
        while let Some(cached) = self.features.get(self.pos) {
            self.pos += 1;
            if !self.request.accept_feature(cached, &self.fields) {
                continue;
            }
            let mut feature = Feature::clone(cached);
            if self.request.no_geometry() {
                feature.clear_geometry();
            }
            return Ok(Some(feature));
        }
        Ok(None)
    }

    fn rewind(&mut self) -> bool {
        if self.closed {
            return false;
        }
        self.pos = 0;
        true
    }

    fn close(&mut self) -> bool {
        if self.closed {
            return false;
        }
        self.closed = true;
        self.features.clear();
        true
    }

    fn fields(&self) -> &Fields {
        &self.fields
    }

    fn filters_natively(&self) -> bool {
        true
    }
}

/// Streams a request from the layer and stores every feature it returns.
///
/// When the layer iterator is exhausted the result ids are reported to the
/// cache, unless the iteration was interrupted. Once the layer changes, the
/// snapshot being read is stale: nothing more is stored and completion is
/// not reported.
pub struct CachedFeatureWriterIterator {
    inner: FeatureIterator,
    state: Arc<Mutex<CacheState>>,
    /// The request as issued by the caller.
    request: FeatureRequest,
    fields: Fields,
    ids: Vec<FeatureId>,
    /// Cache generation the layer snapshot was taken at.
    generation: u64,
    checker: Option<InterruptionChecker>,
    done: bool,
}

impl CachedFeatureWriterIterator {
    pub(crate) fn new(
        inner: FeatureIterator,
        state: Arc<Mutex<CacheState>>,
        request: FeatureRequest,
        generation: u64,
    ) -> Self {
        let fields = inner.fields();
        Self {
            inner,
            state,
            request,
            fields,
            ids: Vec::new(),
            generation,
            checker: None,
            done: false,
        }
    }

    fn interrupted(&self) -> bool {
        self.checker.as_ref().map_or(false, |c| c())
    }
}

impl FetchFeatures for CachedFeatureWriterIterator {
    fn fetch_feature(&mut self) -> Result<Option<Feature>> {
        if self.done {
            return Ok(None);
        }
        match self.inner.next_feature()? {
            Some(mut feature) => {
                self.ids.push(feature.id());
                let mut state = self.state.lock();
                if state.generation() == self.generation {
                    state.insert(feature.clone());
                }
                drop(state);
                if self.request.no_geometry() {
                    feature.clear_geometry();
                }
                Ok(Some(feature))
            }
            None => {
                self.done = true;
                if self.interrupted() {
                    tracing::debug!(fetched = self.ids.len(), "cache writer interrupted");
                    return Ok(None);
                }
                let mut state = self.state.lock();
                if state.generation() == self.generation {
                    state.request_completed(&self.request, &self.ids);
                } else {
                    tracing::debug!(fetched = self.ids.len(), "cache writer outdated by layer edits");
                }
                Ok(None)
            }
        }
    }

    fn rewind(&mut self) -> bool {
        self.ids.clear();
        self.done = false;
        self.inner.rewind()
    }

    fn close(&mut self) -> bool {
        self.done = true;
        self.inner.close()
    }

    fn fields(&self) -> &Fields {
        &self.fields
    }

    // Geometries are cached unsimplified; the handle simplifies its output.
    fn prepare_simplification(&mut self, _method: SimplifyMethod) -> bool {
        false
    }

    fn prepare_order_by(&mut self, _clauses: &[OrderByClause]) -> bool {
        true
    }

    fn filters_natively(&self) -> bool {
        true
    }

    fn set_interruption_checker(&mut self, checker: Option<InterruptionChecker>) {
        self.inner.set_interruption_checker(checker.clone());
        self.checker = checker;
    }
}
