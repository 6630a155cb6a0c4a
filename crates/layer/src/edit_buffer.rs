//! Edit buffer for tracking uncommitted layer changes.
//!
//! The buffer records added, changed and deleted features plus added and
//! deleted attributes. Its state lives behind an `Arc`: a feature source
//! snapshot shares it, and the next edit clones it (`Arc::make_mut`), so an
//! iteration in progress never observes later edits.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use vlayer_core::{Feature, FeatureId, Field, FieldOrigin, Geometry, Value};

/// Which column order an attribute vector is in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttributeLayout {
    /// One slot per provider column, as returned by the provider.
    Provider,
    /// Layer order: surviving provider columns, then added attributes.
    Stored,
}

/// Uncommitted changes of one editing session.
#[derive(Clone, Debug)]
pub struct EditState {
    provider_width: usize,
    /// Added features keyed by their (negative) id. Ascending key order is newest first.
    added_features: BTreeMap<FeatureId, Feature>,
    changed_geometries: BTreeMap<FeatureId, Option<Geometry>>,
    /// id -> {layer field index -> value}
    changed_attribute_values: BTreeMap<FeatureId, BTreeMap<usize, Value>>,
    deleted_feature_ids: BTreeSet<FeatureId>,
    added_attributes: Vec<Field>,
    /// Sorted provider column indices.
    deleted_attribute_ids: Vec<usize>,
    next_added_id: FeatureId,
}

impl EditState {
    /// Creates an empty state for a provider with `provider_width` columns.
    pub fn new(provider_width: usize) -> Self {
        Self {
            provider_width,
            added_features: BTreeMap::new(),
            changed_geometries: BTreeMap::new(),
            changed_attribute_values: BTreeMap::new(),
            deleted_feature_ids: BTreeSet::new(),
            added_attributes: Vec::new(),
            deleted_attribute_ids: Vec::new(),
            next_added_id: -1,
        }
    }

    #[inline]
    pub fn provider_width(&self) -> usize {
        self.provider_width
    }

    /// Width of the stored block of the layer schema.
    pub fn stored_width(&self) -> usize {
        self.provider_width - self.deleted_attribute_ids.len() + self.added_attributes.len()
    }

    pub fn added_features(&self) -> &BTreeMap<FeatureId, Feature> {
        &self.added_features
    }

    pub fn changed_geometries(&self) -> &BTreeMap<FeatureId, Option<Geometry>> {
        &self.changed_geometries
    }

    pub fn changed_attribute_values(&self) -> &BTreeMap<FeatureId, BTreeMap<usize, Value>> {
        &self.changed_attribute_values
    }

    pub fn deleted_feature_ids(&self) -> &BTreeSet<FeatureId> {
        &self.deleted_feature_ids
    }

    pub fn added_attributes(&self) -> &[Field] {
        &self.added_attributes
    }

    pub fn deleted_attribute_ids(&self) -> &[usize] {
        &self.deleted_attribute_ids
    }

    #[inline]
    pub fn is_deleted(&self, id: FeatureId) -> bool {
        self.deleted_feature_ids.contains(&id)
    }

    pub fn added_feature(&self, id: FeatureId) -> Option<&Feature> {
        self.added_features.get(&id)
    }

    pub fn changed_geometry(&self, id: FeatureId) -> Option<&Option<Geometry>> {
        self.changed_geometries.get(&id)
    }

    /// Returns true if nothing has been edited.
    pub fn is_empty(&self) -> bool {
        self.added_features.is_empty()
            && self.changed_geometries.is_empty()
            && self.changed_attribute_values.is_empty()
            && self.deleted_feature_ids.is_empty()
            && self.added_attributes.is_empty()
            && self.deleted_attribute_ids.is_empty()
    }

    /// Maps a provider row onto the layer's stored block and applies the
    /// changed values recorded for `id`.
    ///
    /// Returns the layout `attrs` is in afterwards. Calling again with that
    /// layout only re-applies the overlay.
    pub fn rederive_attributes(
        &self,
        id: FeatureId,
        attrs: &mut Vec<Value>,
        layout: AttributeLayout,
    ) -> AttributeLayout {
        if layout == AttributeLayout::Provider {
            attrs.resize(self.provider_width, Value::Null);
            // highest first so earlier removals don't shift later ones
            for &index in self.deleted_attribute_ids.iter().rev() {
                if index < attrs.len() {
                    attrs.remove(index);
                }
            }
            attrs.resize(self.stored_width(), Value::Null);
        } else if attrs.len() < self.stored_width() {
            attrs.resize(self.stored_width(), Value::Null);
        }
        self.overlay_changed_values(id, attrs);
        AttributeLayout::Stored
    }

    /// Writes the changed values recorded for `id` into `attrs`.
    pub fn overlay_changed_values(&self, id: FeatureId, attrs: &mut [Value]) {
        if let Some(changes) = self.changed_attribute_values.get(&id) {
            for (&index, value) in changes {
                if let Some(slot) = attrs.get_mut(index) {
                    *slot = value.clone();
                }
            }
        }
    }

    /// Adds a feature under a fresh negative id and returns that id.
    pub fn add_feature(&mut self, mut feature: Feature) -> FeatureId {
        let id = self.next_added_id;
        self.next_added_id -= 1;
        feature.set_id(id);
        feature.set_valid(true);
        feature.resize_attributes(self.stored_width());
        self.added_features.insert(id, feature);
        id
    }

    /// Records a deletion. Deleting an added feature drops it from the buffer.
    ///
    /// Returns false if the id was already deleted.
    pub fn delete_feature(&mut self, id: FeatureId) -> bool {
        if self.added_features.remove(&id).is_some() {
            return true;
        }
        if !self.deleted_feature_ids.insert(id) {
            return false;
        }
        self.changed_geometries.remove(&id);
        self.changed_attribute_values.remove(&id);
        true
    }

    pub fn change_geometry(&mut self, id: FeatureId, geometry: Option<Geometry>) {
        match self.added_features.get_mut(&id) {
            Some(feature) => feature.set_geometry(geometry),
            None => {
                self.changed_geometries.insert(id, geometry);
            }
        }
    }

    /// Records a value for the stored field at layer `index`.
    pub fn change_attribute_value(&mut self, id: FeatureId, index: usize, value: Value) {
        match self.added_features.get_mut(&id) {
            Some(feature) => {
                if index >= feature.attribute_count() {
                    feature.resize_attributes(index + 1);
                }
                feature.set_attribute(index, value);
            }
            None => {
                self.changed_attribute_values
                    .entry(id)
                    .or_default()
                    .insert(index, value);
            }
        }
    }

    /// Appends an attribute to the stored block and returns its layer index.
    pub fn add_attribute(&mut self, field: Field) -> usize {
        let edit_index = self.added_attributes.len();
        self.added_attributes
            .push(field.with_origin(FieldOrigin::Edit { index: edit_index }));
        for feature in self.added_features.values_mut() {
            feature.attributes_mut().push(Value::Null);
        }
        self.stored_width() - 1
    }

    /// Removes the stored field at layer `index` whose origin is `origin`.
    pub fn delete_attribute(&mut self, index: usize, origin: FieldOrigin) {
        match origin {
            FieldOrigin::Provider { index: column } => {
                if let Err(pos) = self.deleted_attribute_ids.binary_search(&column) {
                    self.deleted_attribute_ids.insert(pos, column);
                }
            }
            FieldOrigin::Edit { index: edit_index } => {
                if edit_index < self.added_attributes.len() {
                    self.added_attributes.remove(edit_index);
                }
                for (i, field) in self.added_attributes.iter_mut().enumerate() {
                    *field = field.clone().with_origin(FieldOrigin::Edit { index: i });
                }
            }
            FieldOrigin::Join { .. } | FieldOrigin::Expression { .. } => return,
        }

        for feature in self.added_features.values_mut() {
            if index < feature.attribute_count() {
                feature.attributes_mut().remove(index);
            }
        }
        for changes in self.changed_attribute_values.values_mut() {
            let renumbered: BTreeMap<usize, Value> = std::mem::take(changes)
                .into_iter()
                .filter(|(i, _)| *i != index)
                .map(|(i, v)| if i > index { (i - 1, v) } else { (i, v) })
                .collect();
            *changes = renumbered;
        }
        self.changed_attribute_values.retain(|_, changes| !changes.is_empty());
    }
}

/// Layer-owned handle to the edit state.
#[derive(Clone, Debug)]
pub struct EditBuffer {
    state: Arc<EditState>,
}

impl EditBuffer {
    pub fn new(provider_width: usize) -> Self {
        Self {
            state: Arc::new(EditState::new(provider_width)),
        }
    }

    /// Shares the current state. Later edits do not affect the returned snapshot.
    pub fn snapshot(&self) -> Arc<EditState> {
        self.state.clone()
    }

    pub fn state(&self) -> &EditState {
        &self.state
    }

    /// Mutable access, cloning the state first if a snapshot still shares it.
    pub fn edit(&mut self) -> &mut EditState {
        Arc::make_mut(&mut self.state)
    }

    /// Discards every change.
    pub fn rollback(&mut self) {
        self.state = Arc::new(EditState::new(self.state.provider_width));
    }
}
