//! In-memory data provider.
//!
//! Features live in a copy-on-write map: a feature source shares the current
//! map, and the next provider mutation clones it, so sources keep the data
//! they were created with.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use vlayer_core::{
    DataType, Error, Feature, FeatureId, Field, FieldOrigin, Fields, Geometry, Result, Value,
};

use crate::iterator::{FeatureIterator, FetchFeatures};
use crate::provider::{DataProvider, FeatureSource};
use crate::request::{FeatureRequest, Filter, SimplifyMethod};

type FeatureMap = Arc<BTreeMap<FeatureId, Feature>>;

/// Provider backed by an in-memory feature map.
pub struct MemoryProvider {
    fields: Fields,
    crs: String,
    features: RwLock<FeatureMap>,
    next_id: RwLock<FeatureId>,
    failure: Arc<RwLock<Option<String>>>,
}

impl MemoryProvider {
    /// Creates an empty provider. Field origins are rewritten to provider columns.
    pub fn new(fields: impl IntoIterator<Item = Field>) -> Result<Self> {
        let fields = Fields::from_fields(
            fields
                .into_iter()
                .enumerate()
                .map(|(i, f)| f.with_origin(FieldOrigin::Provider { index: i })),
        )?;
        Ok(Self {
            fields,
            crs: String::new(),
            features: RwLock::new(Arc::new(BTreeMap::new())),
            next_id: RwLock::new(1),
            failure: Arc::new(RwLock::new(None)),
        })
    }

    /// Creates an empty provider from `(name, type)` pairs.
    pub fn with_columns(columns: &[(&str, DataType)]) -> Result<Self> {
        Self::new(
            columns
                .iter()
                .enumerate()
                .map(|(i, (name, dt))| Field::provider(*name, *dt, i)),
        )
    }

    pub fn with_crs(mut self, crs: impl Into<String>) -> Self {
        self.crs = crs.into();
        self
    }

    /// Adds a feature with the next free id and returns that id.
    pub fn add_feature(&self, attributes: Vec<Value>, geometry: Option<Geometry>) -> FeatureId {
        let id = {
            let mut next = self.next_id.write();
            let id = *next;
            *next += 1;
            id
        };
        let mut feature = Feature::new(id, attributes);
        feature.set_geometry(geometry);
        self.insert_feature(feature);
        id
    }

    /// Inserts or replaces a feature under its own id.
    pub fn insert_feature(&self, mut feature: Feature) {
        feature.resize_attributes(self.fields.len());
        let id = feature.id();
        {
            let mut next = self.next_id.write();
            if id >= *next {
                *next = id + 1;
            }
        }
        Arc::make_mut(&mut self.features.write()).insert(id, feature);
    }

    pub fn delete_feature(&self, id: FeatureId) -> bool {
        Arc::make_mut(&mut self.features.write()).remove(&id).is_some()
    }

    pub fn change_attribute_value(&self, id: FeatureId, index: usize, value: Value) -> bool {
        Arc::make_mut(&mut self.features.write())
            .get_mut(&id)
            .map_or(false, |f| f.set_attribute(index, value))
    }

    pub fn change_geometry(&self, id: FeatureId, geometry: Option<Geometry>) -> bool {
        match Arc::make_mut(&mut self.features.write()).get_mut(&id) {
            Some(f) => {
                f.set_geometry(geometry);
                true
            }
            None => false,
        }
    }

    pub fn feature(&self, id: FeatureId) -> Option<Feature> {
        self.features.read().get(&id).cloned()
    }

    /// Makes every request, including through existing sources, fail with `message`.
    pub fn set_failure(&self, message: Option<String>) {
        *self.failure.write() = message;
    }
}

impl DataProvider for MemoryProvider {
    fn fields(&self) -> Fields {
        self.fields.clone()
    }

    fn feature_count(&self) -> usize {
        self.features.read().len()
    }

    fn feature_source(&self) -> Arc<dyn FeatureSource> {
        Arc::new(MemoryFeatureSource {
            fields: self.fields.clone(),
            features: self.features.read().clone(),
            failure: self.failure.clone(),
        })
    }

    fn crs(&self) -> String {
        self.crs.clone()
    }
}

struct MemoryFeatureSource {
    fields: Fields,
    features: FeatureMap,
    failure: Arc<RwLock<Option<String>>>,
}

impl FeatureSource for MemoryFeatureSource {
    fn get_features(&self, request: &FeatureRequest) -> Result<FeatureIterator> {
        if let Some(message) = self.failure.read().as_ref() {
            return Err(Error::provider(message.clone()));
        }
        let ids: Vec<FeatureId> = match request.filter() {
            Filter::Fid(id) => self.features.get_key_value(id).map(|(k, _)| *k).into_iter().collect(),
            Filter::Fids(ids) => {
                let mut ids: Vec<FeatureId> = ids
                    .iter()
                    .copied()
                    .filter(|id| self.features.contains_key(id))
                    .collect();
                ids.sort_unstable();
                ids
            }
            _ => self.features.keys().copied().collect(),
        };
        let iter = MemoryFeatureIterator {
            fields: self.fields.clone(),
            features: self.features.clone(),
            ids,
            pos: 0,
            request: request.clone(),
            simplify: None,
            closed: false,
        };
        Ok(FeatureIterator::new(iter, request.clone()))
    }
}

struct MemoryFeatureIterator {
    fields: Fields,
    features: FeatureMap,
    ids: Vec<FeatureId>,
    pos: usize,
    request: FeatureRequest,
    simplify: Option<f64>,
    closed: bool,
}

impl MemoryFeatureIterator {
    fn matches(&self, feature: &Feature) -> bool {
        match self.request.filter() {
            Filter::Rect(_) | Filter::Expression(_) => {
                self.request.accept_feature(feature, &self.fields)
            }
            _ => true,
        }
    }

    fn shape(&self, feature: &Feature) -> Feature {
        let mut out = feature.clone();
        if self.request.subset().is_some() {
            for (i, slot) in out.attributes_mut().iter_mut().enumerate() {
                if !self.request.wants_attribute(i) {
                    *slot = Value::Null;
                }
            }
        }
        if self.request.no_geometry() {
            out.clear_geometry();
        } else if let Some(tolerance) = self.simplify {
            let simplified = out.geometry().map(|g| g.simplify(tolerance));
            out.set_geometry(simplified);
        }
        out
    }
}

impl FetchFeatures for MemoryFeatureIterator {
    fn fetch_feature(&mut self) -> Result<Option<Feature>> {
        if self.closed {
            return Ok(None);
        }
        while let Some(id) = self.ids.get(self.pos).copied() {
            self.pos += 1;
            if let Some(feature) = self.features.get(&id) {
                if self.matches(feature) {
                    return Ok(Some(self.shape(feature)));
                }
            }
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
        let was_open = !self.closed;
        self.closed = true;
        was_open
    }

    fn fields(&self) -> &Fields {
        &self.fields
    }

    fn prepare_simplification(&mut self, method: SimplifyMethod) -> bool {
        match method {
            SimplifyMethod::Distance { tolerance } => {
                self.simplify = Some(tolerance);
                true
            }
            SimplifyMethod::None => false,
        }
    }

    fn filters_natively(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Expr, OrderByClause};
    use vlayer_core::Rect;

    fn provider() -> MemoryProvider {
        let p = MemoryProvider::with_columns(&[("name", DataType::String), ("pop", DataType::Int64)])
            .unwrap();
        p.add_feature(
            vec![Value::from("a"), Value::Int64(10)],
            Some(Geometry::point(0.0, 0.0)),
        );
        p.add_feature(
            vec![Value::from("b"), Value::Int64(20)],
            Some(Geometry::point(5.0, 5.0)),
        );
        p.add_feature(
            vec![Value::from("c"), Value::Int64(30)],
            Some(Geometry::point(10.0, 10.0)),
        );
        p
    }

    fn ids(it: FeatureIterator) -> Vec<FeatureId> {
        it.map(|f| f.unwrap().id()).collect()
    }

    #[test]
    fn test_all_features() {
        let p = provider();
        assert_eq!(p.feature_count(), 3);
        let it = p.feature_source().get_features(&FeatureRequest::new()).unwrap();
        assert_eq!(ids(it), vec![1, 2, 3]);
    }

    #[test]
    fn test_filters() {
        let source = provider().feature_source();
        let by_id = source.get_features(&FeatureRequest::new().with_filter_fid(2)).unwrap();
        assert_eq!(ids(by_id), vec![2]);

        let missing = source.get_features(&FeatureRequest::new().with_filter_fid(9)).unwrap();
        assert_eq!(ids(missing), Vec::<FeatureId>::new());

        let by_set = source
            .get_features(&FeatureRequest::new().with_filter_fids([3, 1, 42]))
            .unwrap();
        assert_eq!(ids(by_set), vec![1, 3]);

        let by_rect = source
            .get_features(&FeatureRequest::new().with_filter_rect(Rect::new(4.0, 4.0, 11.0, 11.0)))
            .unwrap();
        assert_eq!(ids(by_rect), vec![2, 3]);

        let by_expr = source
            .get_features(
                &FeatureRequest::new()
                    .with_filter_expression(Expr::ge(Expr::column("pop"), Expr::literal(20))),
            )
            .unwrap();
        assert_eq!(ids(by_expr), vec![2, 3]);
    }

    #[test]
    fn test_subset_and_no_geometry() {
        let source = provider().feature_source();
        let request = FeatureRequest::new()
            .with_subset_of_attributes([1])
            .with_no_geometry(true);
        let f = source.get_features(&request).unwrap().next_feature().unwrap().unwrap();
        assert_eq!(f.attributes(), &[Value::Null, Value::Int64(10)]);
        assert!(!f.has_geometry());
    }

    #[test]
    fn test_limit_and_order() {
        let source = provider().feature_source();
        let request = FeatureRequest::new()
            .add_order_by(OrderByClause::desc(Expr::column("pop")))
            .with_limit(2);
        assert_eq!(ids(source.get_features(&request).unwrap()), vec![3, 2]);
    }

    #[test]
    fn test_source_is_snapshot() {
        let p = provider();
        let source = p.feature_source();
        p.delete_feature(1);
        p.change_attribute_value(2, 1, Value::Int64(99));
        assert_eq!(p.feature_count(), 2);
        assert_eq!(ids(source.get_features(&FeatureRequest::new()).unwrap()), vec![1, 2, 3]);
        let f = source.get_feature(2).unwrap().unwrap();
        assert_eq!(f.attribute(1), Some(&Value::Int64(20)));
        assert_eq!(p.feature(2).unwrap().attribute(1), Some(&Value::Int64(99)));
    }

    #[test]
    fn test_failure() {
        let p = provider();
        let source = p.feature_source();
        p.set_failure(Some("offline".into()));
        let err = source.get_features(&FeatureRequest::new()).unwrap_err();
        assert_eq!(err, Error::provider("offline"));
    }

    #[test]
    fn test_insert_pads_and_advances_ids() {
        let p = provider();
        p.insert_feature(Feature::new(10, vec![Value::from("z")]));
        assert_eq!(p.feature(10).unwrap().attribute_count(), 2);
        assert_eq!(p.add_feature(vec![], None), 11);
    }
}
