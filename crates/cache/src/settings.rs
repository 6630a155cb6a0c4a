//! Feature cache configuration.

use serde::{Deserialize, Serialize};

/// Configuration of a [`FeatureCache`](crate::FeatureCache).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Maximum number of resident features.
    pub max_features: usize,
    /// Whether geometries are cached.
    pub cache_geometry: bool,
    /// Layer field indices to cache; None caches every field.
    pub cached_attributes: Option<Vec<usize>>,
    /// Features loaded between progress reports while populating a full cache.
    pub progress_interval: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            max_features: 1000,
            cache_geometry: true,
            cached_attributes: None,
            progress_interval: 1000,
        }
    }
}

impl CacheSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_features(mut self, max_features: usize) -> Self {
        self.max_features = max_features;
        self
    }

    pub fn with_cache_geometry(mut self, cache_geometry: bool) -> Self {
        self.cache_geometry = cache_geometry;
        self
    }

    pub fn with_cached_attributes(mut self, attributes: Option<Vec<usize>>) -> Self {
        self.cached_attributes = attributes.map(normalize);
        self
    }

    pub fn with_progress_interval(mut self, interval: usize) -> Self {
        self.progress_interval = interval;
        self
    }

    /// Returns true if the field at layer `index` is cached.
    #[inline]
    pub fn caches_attribute(&self, index: usize) -> bool {
        self.cached_attributes
            .as_ref()
            .map_or(true, |c| c.binary_search(&index).is_ok())
    }
}

pub(crate) fn normalize(mut indices: Vec<usize>) -> Vec<usize> {
    indices.sort_unstable();
    indices.dedup();
    indices
}
