//! Layer joins.
//!
//! A join is a left-outer lookup from a field of this layer to a field of
//! another layer. Each resolved join contributes a block of prefixed virtual
//! fields to the layer schema. A join whose layer cannot be resolved
//! contributes no fields and is otherwise inert.
//!
//! Joins with `memory_cache` set load the joined layer once into a hash map
//! keyed by the stringified join value. The cache is rebuilt lazily, the
//! next time a feature source is created after it was invalidated.

use std::sync::{Arc, Weak};

use hashbrown::{HashMap, HashSet};
use serde::{Deserialize, Serialize};
use vlayer_core::{Error, Feature, Field, FieldOrigin, Fields, Result, Value};
use vlayer_query::{Expr, FeatureRequest};

use crate::events::SubscriptionId;
use crate::layer::VectorLayer;
use crate::registry::LayerRegistry;

/// Stringified join value -> joined layer attributes.
pub type JoinCache = HashMap<String, Vec<Value>>;

fn cache_dirty_default() -> bool {
    true
}

/// Configuration of one join.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JoinInfo {
    target_field: String,
    join_layer_id: String,
    join_field: String,
    #[serde(default)]
    prefix: Option<String>,
    #[serde(default)]
    memory_cache: bool,
    #[serde(default)]
    editable: bool,
    /// Join on the target feature id instead of `target_field`.
    #[serde(default)]
    use_target_feature_id: bool,
    #[serde(default)]
    subset: Option<Vec<String>>,
    #[serde(default)]
    blocklist: Vec<String>,

    #[serde(skip)]
    layer: Weak<VectorLayer>,
    #[serde(skip)]
    cache: Option<Arc<JoinCache>>,
    #[serde(skip, default = "cache_dirty_default")]
    cache_dirty: bool,
    #[serde(skip)]
    subscription: Option<SubscriptionId>,
}

impl JoinInfo {
    /// Creates an unresolved join to the layer with id `join_layer_id`.
    pub fn new(
        target_field: impl Into<String>,
        join_layer_id: impl Into<String>,
        join_field: impl Into<String>,
    ) -> Self {
        Self {
            target_field: target_field.into(),
            join_layer_id: join_layer_id.into(),
            join_field: join_field.into(),
            prefix: None,
            memory_cache: false,
            editable: false,
            use_target_feature_id: false,
            subset: None,
            blocklist: Vec::new(),
            layer: Weak::new(),
            cache: None,
            cache_dirty: true,
            subscription: None,
        }
    }

    /// Creates a join already resolved to `layer`.
    pub fn to_layer(
        target_field: impl Into<String>,
        layer: &Arc<VectorLayer>,
        join_field: impl Into<String>,
    ) -> Self {
        let mut info = Self::new(target_field, layer.id(), join_field);
        info.layer = Arc::downgrade(layer);
        info
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    pub fn with_memory_cache(mut self, enabled: bool) -> Self {
        self.memory_cache = enabled;
        self
    }

    pub fn with_editable(mut self, editable: bool) -> Self {
        self.editable = editable;
        self
    }

    pub fn with_target_feature_id(mut self, enabled: bool) -> Self {
        self.use_target_feature_id = enabled;
        self
    }

    /// Only join the named fields.
    pub fn with_subset<'a>(mut self, names: impl IntoIterator<Item = &'a str>) -> Self {
        self.subset = Some(names.into_iter().map(str::to_string).collect());
        self
    }

    /// Never join the named fields.
    pub fn with_blocklist<'a>(mut self, names: impl IntoIterator<Item = &'a str>) -> Self {
        self.blocklist = names.into_iter().map(str::to_string).collect();
        self
    }

    #[inline]
    pub fn target_field(&self) -> &str {
        &self.target_field
    }

    #[inline]
    pub fn join_layer_id(&self) -> &str {
        &self.join_layer_id
    }

    #[inline]
    pub fn join_field(&self) -> &str {
        &self.join_field
    }

    #[inline]
    pub fn memory_cache(&self) -> bool {
        self.memory_cache
    }

    #[inline]
    pub fn editable(&self) -> bool {
        self.editable
    }

    #[inline]
    pub fn use_target_feature_id(&self) -> bool {
        self.use_target_feature_id
    }

    /// The joined layer, if it is resolved and still alive.
    pub fn layer(&self) -> Option<Arc<VectorLayer>> {
        self.layer.upgrade()
    }

    pub fn is_resolved(&self) -> bool {
        self.layer.strong_count() > 0
    }

    pub fn is_cache_dirty(&self) -> bool {
        self.cache_dirty
    }

    pub fn cache(&self) -> Option<&Arc<JoinCache>> {
        self.cache.as_ref()
    }

    pub(crate) fn set_layer(&mut self, layer: Weak<VectorLayer>) {
        self.layer = layer;
        self.invalidate_cache();
    }

    pub(crate) fn subscription(&self) -> Option<SubscriptionId> {
        self.subscription
    }

    pub(crate) fn set_subscription(&mut self, id: Option<SubscriptionId>) {
        self.subscription = id;
    }

    pub(crate) fn invalidate_cache(&mut self) {
        self.cache = None;
        self.cache_dirty = true;
    }

    /// Field name prefix; defaults to the joined layer name and an underscore.
    pub fn prefix_for(&self, layer_name: &str) -> String {
        self.prefix
            .clone()
            .unwrap_or_else(|| format!("{}_", layer_name))
    }

    /// Joined layer field indices that make up this join's block.
    ///
    /// The join field itself is never part of the block.
    pub fn block_source_indices(&self, joined_fields: &Fields) -> Vec<usize> {
        let key = joined_fields.lookup(&self.join_field);
        let candidates = match &self.subset {
            Some(names) => join_subset_indices(joined_fields, names),
            None => (0..joined_fields.len()).collect(),
        };
        candidates
            .into_iter()
            .filter(|i| Some(*i) != key)
            .filter(|i| {
                joined_fields.field(*i).map_or(false, |f| {
                    !self
                        .blocklist
                        .iter()
                        .any(|b| b.eq_ignore_ascii_case(f.name()))
                })
            })
            .collect()
    }

    /// Value of this layer used to look up the joined feature.
    pub fn target_value(&self, fields: &Fields, feature: &Feature) -> Value {
        if self.use_target_feature_id {
            return Value::Int64(feature.id());
        }
        fields
            .lookup(&self.target_field)
            .and_then(|i| feature.attribute(i))
            .cloned()
            .unwrap_or(Value::Null)
    }

    fn lookup_request(&self, value: &Value, subset: Option<Vec<usize>>) -> FeatureRequest {
        let request = FeatureRequest::new()
            .with_filter_expression(Expr::field_equals(self.join_field.clone(), value.clone()))
            .with_limit(1)
            .with_no_geometry(true);
        match subset {
            Some(indices) => request.with_subset_of_attributes(indices),
            None => request,
        }
    }

    /// Attributes of the joined feature matching `value`, in joined layer order.
    ///
    /// Reads the memory cache when one is built, and queries the joined layer
    /// otherwise. Returns None when nothing matches or the layer is gone.
    pub fn joined_attributes(
        &self,
        value: &Value,
        source_indices: &[usize],
    ) -> Result<Option<Vec<Value>>> {
        if let Some(cache) = &self.cache {
            return Ok(cache.get(&value.to_key_string()).cloned());
        }
        let layer = match self.layer() {
            Some(layer) => layer,
            None => return Ok(None),
        };
        let request = self.lookup_request(value, Some(source_indices.to_vec()));
        let found = layer.get_features(&request)?.next_feature()?;
        Ok(found.map(|f| f.attributes().to_vec()))
    }

    /// Loads the joined layer into a memory cache.
    fn build_cache(&self, layer: &VectorLayer) -> Result<Option<JoinCache>> {
        let joined_fields = layer.fields();
        let key_index = match joined_fields.lookup(&self.join_field) {
            Some(i) => i,
            None => {
                tracing::warn!(
                    layer = %self.join_layer_id,
                    field = %self.join_field,
                    "join field not found, cache not built"
                );
                return Ok(None);
            }
        };
        let mut subset = self.block_source_indices(&joined_fields);
        subset.push(key_index);
        let request = FeatureRequest::new()
            .with_subset_of_attributes(subset)
            .with_no_geometry(true);

        let mut cache = JoinCache::new();
        let features = layer.get_features(&request)?;
        while let Some(feature) = features.next_feature()? {
            let key = feature
                .attribute(key_index)
                .map(Value::to_key_string)
                .unwrap_or_default();
            cache
                .entry(key)
                .or_insert_with(|| feature.attributes().to_vec());
        }
        Ok(Some(cache))
    }
}

/// Indices of the named fields in `joined_fields`, in schema order.
///
/// Unknown names are skipped.
pub fn join_subset_indices(joined_fields: &Fields, names: &[String]) -> Vec<usize> {
    let mut indices: Vec<usize> = names
        .iter()
        .filter_map(|n| joined_fields.lookup(n))
        .collect();
    indices.sort_unstable();
    indices.dedup();
    indices
}

/// All joins of one layer.
#[derive(Clone, Debug, Default)]
pub struct JoinBuffer {
    joins: Vec<JoinInfo>,
}

impl JoinBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn joins(&self) -> &[JoinInfo] {
        &self.joins
    }

    pub fn join(&self, index: usize) -> Option<&JoinInfo> {
        self.joins.get(index)
    }

    pub fn len(&self) -> usize {
        self.joins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.joins.is_empty()
    }

    /// Adds a join. Returns its index.
    ///
    /// A second join to the same layer on the same target field is rejected.
    pub fn add_join(&mut self, info: JoinInfo) -> Result<usize> {
        let duplicate = self.joins.iter().any(|j| {
            j.join_layer_id == info.join_layer_id && j.target_field == info.target_field
        });
        if duplicate {
            return Err(Error::invalid_operation(format!(
                "layer {} is already joined on {}",
                info.join_layer_id, info.target_field
            )));
        }
        self.joins.push(info);
        Ok(self.joins.len() - 1)
    }

    /// Removes the first join to `layer_id`.
    pub fn remove_join(&mut self, layer_id: &str) -> Option<JoinInfo> {
        let pos = self
            .joins
            .iter()
            .position(|j| j.join_layer_id == layer_id)?;
        Some(self.joins.remove(pos))
    }

    pub(crate) fn join_mut(&mut self, index: usize) -> Option<&mut JoinInfo> {
        self.joins.get_mut(index)
    }

    /// Appends one prefixed field block per resolved join.
    pub fn update_fields(&self, fields: &mut Fields) {
        for (join_index, join) in self.joins.iter().enumerate() {
            let layer = match join.layer() {
                Some(layer) => layer,
                None => continue,
            };
            let joined_fields = layer.fields();
            let prefix = join.prefix_for(layer.name());
            for source_index in join.block_source_indices(&joined_fields) {
                let source = match joined_fields.field(source_index) {
                    Some(f) => f,
                    None => continue,
                };
                let field = Field::new(
                    format!("{}{}", prefix, source.name()),
                    source.data_type(),
                    FieldOrigin::Join {
                        join_index,
                        source_index,
                    },
                );
                if let Err(err) = fields.append(field) {
                    tracing::warn!(layer = %join.join_layer_id, %err, "joined field skipped");
                }
            }
        }
    }

    /// Resolves unresolved joins through `registry`.
    ///
    /// Returns the indices of the joins resolved by this call.
    pub fn resolve_references(&mut self, registry: &LayerRegistry) -> Vec<usize> {
        let mut resolved = Vec::new();
        for (index, join) in self.joins.iter_mut().enumerate() {
            if join.is_resolved() {
                continue;
            }
            if let Some(weak) = registry.get_weak(&join.join_layer_id) {
                join.set_layer(weak);
                resolved.push(index);
            }
        }
        resolved
    }

    /// Builds the memory caches that are requested, dirty and resolvable.
    pub fn create_join_caches(&mut self) -> Result<()> {
        for join in self.joins.iter_mut() {
            if !join.memory_cache || !join.cache_dirty {
                continue;
            }
            let layer = match join.layer() {
                Some(layer) => layer,
                None => continue,
            };
            if let Some(cache) = join.build_cache(&layer)? {
                tracing::debug!(
                    layer = %join.join_layer_id,
                    entries = cache.len(),
                    "join cache built"
                );
                join.cache = Some(Arc::new(cache));
                join.cache_dirty = false;
            }
        }
        Ok(())
    }

    pub fn invalidate_caches(&mut self) {
        for join in self.joins.iter_mut() {
            join.invalidate_cache();
        }
    }

    /// Invalidates the caches of joins to `layer_id`.
    pub fn invalidate_cache_for(&mut self, layer_id: &str) {
        for join in self.joins.iter_mut().filter(|j| j.join_layer_id == layer_id) {
            join.invalidate_cache();
        }
    }

    /// The join providing the field at layer `index`, with its source index.
    pub fn join_for_field_index(&self, index: usize, fields: &Fields) -> Option<(&JoinInfo, usize)> {
        match fields.origin(index)? {
            FieldOrigin::Join {
                join_index,
                source_index,
            } => self.joins.get(join_index).map(|j| (j, source_index)),
            _ => None,
        }
    }

    /// Layer index of the first field of join `join_index`'s block.
    pub fn joined_fields_offset(&self, join_index: usize, fields: &Fields) -> Option<usize> {
        fields.iter().position(|f| {
            matches!(f.origin(), FieldOrigin::Join { join_index: j, .. } if j == join_index)
        })
    }

    /// The joined layer's feature matching `feature`.
    pub fn joined_feature_of(
        &self,
        join_index: usize,
        fields: &Fields,
        feature: &Feature,
    ) -> Result<Option<Feature>> {
        let join = match self.joins.get(join_index) {
            Some(j) => j,
            None => return Ok(None),
        };
        let layer = match join.layer() {
            Some(layer) => layer,
            None => return Ok(None),
        };
        let value = join.target_value(fields, feature);
        let request = join.lookup_request(&value, None);
        layer.get_features(&request)?.next_feature()
    }

    /// Returns true if following joins from these ones reaches `layer_id`.
    pub(crate) fn reaches(&self, layer_id: &str, visited: &mut HashSet<String>) -> bool {
        for join in &self.joins {
            if join.join_layer_id == layer_id {
                return true;
            }
            if !visited.insert(join.join_layer_id.clone()) {
                continue;
            }
            if let Some(layer) = join.layer() {
                if layer.join_reaches(layer_id, visited) {
                    return true;
                }
            }
        }
        false
    }
}
