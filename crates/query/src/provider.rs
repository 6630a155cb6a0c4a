//! Data provider interface.

use std::sync::Arc;

use vlayer_core::{Feature, FeatureId, Fields, Result};

use crate::iterator::FeatureIterator;
use crate::request::FeatureRequest;

/// A detached, thread-safe view of a provider's data.
///
/// Attribute subsets in requests are provider column indices.
pub trait FeatureSource: Send + Sync {
    fn get_features(&self, request: &FeatureRequest) -> Result<FeatureIterator>;

    /// Fetches a single feature by id.
    fn get_feature(&self, id: FeatureId) -> Result<Option<Feature>> {
        self.get_features(&FeatureRequest::new().with_filter_fid(id))?
            .next_feature()
    }
}

/// Backing store of a vector layer.
pub trait DataProvider: Send + Sync {
    /// Provider schema; every field has a `Provider` origin.
    fn fields(&self) -> Fields;

    fn feature_count(&self) -> usize;

    /// Creates a source that can outlive later provider changes.
    fn feature_source(&self) -> Arc<dyn FeatureSource>;

    /// Coordinate reference system identifier.
    fn crs(&self) -> String {
        String::new()
    }
}
