//! Vector layer.
//!
//! A layer combines a data provider with an optional editing session, joins
//! to other layers and expression fields. Its schema is:
//!
//! ```text
//! [provider fields not deleted] [added fields] [join blocks...] [expression fields]
//! ```
//!
//! Lock order is feature-source guard, then joins, then state. Events are
//! dispatched only after every lock has been released.

use std::sync::{Arc, Weak};

use hashbrown::HashSet;
use parking_lot::{Mutex, RwLock};
use vlayer_core::{
    DataType, Error, Feature, FeatureId, Field, FieldOrigin, Fields, Geometry, Result, Value,
};
use vlayer_query::{DataProvider, Expr, FeatureIterator, FeatureRequest, FeatureSource};

use crate::edit_buffer::{EditBuffer, EditState};
use crate::events::{dispatch, LayerEvent, LayerListener, Listeners, SubscriptionId};
use crate::expression_fields::ExpressionField;
use crate::join::{JoinBuffer, JoinInfo};
use crate::registry::LayerRegistry;
use crate::source::LayerFeatureSource;

struct LayerState {
    edit_buffer: Option<EditBuffer>,
    expressions: Vec<ExpressionField>,
    fields: Fields,
}

pub struct VectorLayer {
    id: String,
    name: String,
    provider: Arc<dyn DataProvider>,
    this: Weak<VectorLayer>,
    state: RwLock<LayerState>,
    joins: Mutex<JoinBuffer>,
    /// Serializes feature source construction.
    source_guard: Mutex<()>,
    listeners: Mutex<Listeners>,
}

impl VectorLayer {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        provider: Arc<dyn DataProvider>,
    ) -> Arc<Self> {
        let fields = build_fields(&provider.fields(), None, &JoinBuffer::new(), &[]);
        Arc::new_cyclic(|this| Self {
            id: id.into(),
            name: name.into(),
            provider,
            this: this.clone(),
            state: RwLock::new(LayerState {
                edit_buffer: None,
                expressions: Vec::new(),
                fields,
            }),
            joins: Mutex::new(JoinBuffer::new()),
            source_guard: Mutex::new(()),
            listeners: Mutex::new(Listeners::default()),
        })
    }

    #[inline]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn provider(&self) -> &Arc<dyn DataProvider> {
        &self.provider
    }

    pub fn crs(&self) -> String {
        self.provider.crs()
    }

    /// Current layer schema.
    pub fn fields(&self) -> Fields {
        self.state.read().fields.clone()
    }

    /// Number of features, counting uncommitted additions and deletions.
    pub fn feature_count(&self) -> usize {
        let base = self.provider.feature_count();
        match &self.state.read().edit_buffer {
            Some(buffer) => {
                let edits = buffer.state();
                (base + edits.added_features().len())
                    .saturating_sub(edits.deleted_feature_ids().len())
            }
            None => base,
        }
    }

    /// Captures the layer for iteration. Builds pending join caches first.
    pub fn feature_source(&self) -> Result<LayerFeatureSource> {
        let _guard = self.source_guard.lock();
        let joins = {
            let mut joins = self.joins.lock();
            joins.create_join_caches()?;
            joins.clone()
        };
        let state = self.state.read();
        let edits = state.edit_buffer.as_ref().map(EditBuffer::snapshot);
        let provider_width = edits
            .as_ref()
            .map_or_else(|| self.provider.fields().len(), |e| e.provider_width());
        Ok(LayerFeatureSource::new(
            self.id.clone(),
            self.provider.feature_source(),
            provider_width,
            state.fields.clone(),
            joins,
            state.expressions.clone(),
            edits,
            self.provider.crs(),
        ))
    }

    pub fn get_features(&self, request: &FeatureRequest) -> Result<FeatureIterator> {
        self.feature_source()?.get_features(request)
    }

    pub fn get_feature(&self, id: FeatureId) -> Result<Option<Feature>> {
        self.get_features(&FeatureRequest::new().with_filter_fid(id))?
            .next_feature()
    }

    // Editing

    /// Starts an editing session. Returns false if one is already active.
    pub fn start_editing(&self) -> bool {
        let mut state = self.state.write();
        if state.edit_buffer.is_some() {
            return false;
        }
        state.edit_buffer = Some(EditBuffer::new(self.provider.fields().len()));
        tracing::debug!(layer = %self.id, "editing started");
        true
    }

    pub fn is_editable(&self) -> bool {
        self.state.read().edit_buffer.is_some()
    }

    fn with_edits<T>(&self, f: impl FnOnce(&mut EditState, &Fields) -> Result<T>) -> Result<T> {
        let mut state = self.state.write();
        let LayerState {
            edit_buffer,
            fields,
            ..
        } = &mut *state;
        let buffer = edit_buffer
            .as_mut()
            .ok_or_else(|| Error::not_editable(self.id.clone()))?;
        f(buffer.edit(), fields)
    }

    /// Adds a feature to the edit buffer and returns its temporary id.
    ///
    /// Values are coerced to the stored field types; virtual slots are dropped.
    pub fn add_feature(&self, mut feature: Feature) -> Result<FeatureId> {
        let id = self.with_edits(|edits, fields| {
            let stored = edits.stored_width();
            feature.resize_attributes(stored);
            for (index, slot) in feature.attributes_mut().iter_mut().enumerate() {
                if let Some(field) = fields.field(index) {
                    *slot = field.convert_compatible(std::mem::replace(slot, Value::Null));
                }
            }
            Ok(edits.add_feature(feature))
        })?;
        self.emit(&[LayerEvent::FeatureAdded { id }]);
        Ok(id)
    }

    /// Deletes a feature. Returns false if it was already deleted.
    pub fn delete_feature(&self, id: FeatureId) -> Result<bool> {
        let deleted = self.with_edits(|edits, _| Ok(edits.delete_feature(id)))?;
        if deleted {
            self.emit(&[LayerEvent::FeatureDeleted { id }]);
        }
        Ok(deleted)
    }

    /// Replaces a feature's geometry. Returns false for deleted features.
    pub fn change_geometry(&self, id: FeatureId, geometry: Option<Geometry>) -> Result<bool> {
        let changed = self.with_edits(|edits, _| {
            if edits.is_deleted(id) {
                return Ok(false);
            }
            edits.change_geometry(id, geometry.clone());
            Ok(true)
        })?;
        if changed {
            self.emit(&[LayerEvent::GeometryChanged { id, geometry }]);
        }
        Ok(changed)
    }

    /// Changes the value of the field at layer `index`.
    ///
    /// Values of editable joins are written to the joined layer. Other join
    /// fields and expression fields are read-only.
    pub fn change_attribute_value(&self, id: FeatureId, index: usize, value: Value) -> Result<bool> {
        let field = {
            let state = self.state.read();
            state
                .fields
                .field(index)
                .cloned()
                .ok_or_else(|| Error::field_index_out_of_range(index, state.fields.len()))?
        };
        match field.origin() {
            FieldOrigin::Join { join_index, .. } => {
                return self.change_joined_value(id, index, join_index, value)
            }
            FieldOrigin::Expression { .. } => return Err(Error::read_only_field(field.name())),
            FieldOrigin::Provider { .. } | FieldOrigin::Edit { .. } => {}
        }

        let value = field.convert_compatible(value);
        let changed = self.with_edits(|edits, _| {
            if edits.is_deleted(id) {
                return Ok(false);
            }
            edits.change_attribute_value(id, index, value.clone());
            Ok(true)
        })?;
        if changed {
            self.emit(&[LayerEvent::AttributeValueChanged { id, index, value }]);
        }
        Ok(changed)
    }

    fn change_joined_value(
        &self,
        id: FeatureId,
        index: usize,
        join_index: usize,
        value: Value,
    ) -> Result<bool> {
        let fields = self.fields();
        let joins = self.joins.lock().clone();
        let read_only = || {
            let name = fields.field(index).map_or("", |f| f.name());
            Error::read_only_field(name)
        };
        let (join, source_index) = joins
            .join_for_field_index(index, &fields)
            .ok_or_else(read_only)?;
        if !join.editable() {
            return Err(read_only());
        }
        let layer = match join.layer() {
            Some(layer) => layer,
            None => return Ok(false),
        };
        let feature = match self.get_feature(id)? {
            Some(f) => f,
            None => return Ok(false),
        };
        let joined = joins.joined_feature_of(join_index, &fields, &feature)?;
        match joined {
            Some(joined) => layer.change_attribute_value(joined.id(), source_index, value),
            None => Ok(false),
        }
    }

    /// Appends a field to the stored block. Returns its layer index.
    pub fn add_attribute(&self, field: Field) -> Result<usize> {
        let index = {
            let mut state = self.state.write();
            if state.fields.lookup(field.name()).is_some() {
                return Err(Error::duplicate_field(field.name()));
            }
            let buffer = state
                .edit_buffer
                .as_mut()
                .ok_or_else(|| Error::not_editable(self.id.clone()))?;
            buffer.edit().add_attribute(field)
        };
        self.update_fields();
        self.emit(&[LayerEvent::AttributeAdded { index }, LayerEvent::UpdatedFields]);
        Ok(index)
    }

    /// Deletes the stored field at layer `index`.
    pub fn delete_attribute(&self, index: usize) -> Result<()> {
        {
            let mut state = self.state.write();
            let field = state
                .fields
                .field(index)
                .cloned()
                .ok_or_else(|| Error::field_index_out_of_range(index, state.fields.len()))?;
            if index >= state.fields.stored_count() {
                return Err(Error::read_only_field(field.name()));
            }
            let buffer = state
                .edit_buffer
                .as_mut()
                .ok_or_else(|| Error::not_editable(self.id.clone()))?;
            buffer.edit().delete_attribute(index, field.origin());
        }
        self.update_fields();
        self.emit(&[LayerEvent::AttributeDeleted { index }, LayerEvent::UpdatedFields]);
        Ok(())
    }

    /// Discards all uncommitted edits and ends the editing session.
    pub fn rollback(&self) -> bool {
        let had_session = self.state.write().edit_buffer.take().is_some();
        if !had_session {
            return false;
        }
        tracing::debug!(layer = %self.id, "edits rolled back");
        let mut events = vec![LayerEvent::DataChanged];
        if self.update_fields() {
            events.push(LayerEvent::UpdatedFields);
        }
        self.emit(&events);
        true
    }

    /// Signals that provider data changed outside the layer.
    pub fn reload(&self) {
        self.joins.lock().invalidate_caches();
        self.emit(&[LayerEvent::DataChanged]);
    }

    // Joins

    /// Adds a join. Joins that would make a layer depend on itself are rejected.
    pub fn add_join(&self, info: JoinInfo) -> Result<()> {
        if let Some(layer) = info.layer() {
            self.check_join_cycle(&layer)?;
        } else if info.join_layer_id() == self.id {
            return Err(Error::join_cycle(self.id.clone()));
        }
        let layer = info.layer();
        let index = self.joins.lock().add_join(info)?;
        if let Some(layer) = layer {
            self.watch_joined_layer(index, &layer);
        }
        self.update_fields();
        self.emit(&[LayerEvent::UpdatedFields]);
        Ok(())
    }

    /// Removes the join to `layer_id`. Returns false if there is none.
    pub fn remove_join(&self, layer_id: &str) -> bool {
        let removed = self.joins.lock().remove_join(layer_id);
        let info = match removed {
            Some(info) => info,
            None => return false,
        };
        if let (Some(layer), Some(subscription)) = (info.layer(), info.subscription()) {
            layer.unsubscribe(subscription);
        }
        self.update_fields();
        self.emit(&[LayerEvent::UpdatedFields]);
        true
    }

    pub fn joins(&self) -> Vec<JoinInfo> {
        self.joins.lock().joins().to_vec()
    }

    /// Marks every join memory cache for rebuilding.
    pub fn invalidate_join_caches(&self) {
        self.joins.lock().invalidate_caches();
    }

    /// Resolves joins configured by layer id. Returns how many were resolved.
    ///
    /// Joins that would create a cycle stay unresolved and are reported as
    /// an error after the others have been resolved.
    pub fn resolve_joins(&self, registry: &LayerRegistry) -> Result<usize> {
        let newly = self.joins.lock().resolve_references(registry);
        let mut resolved = 0;
        let mut cycle = None;
        for index in newly {
            let layer = match self.joins.lock().join(index).and_then(JoinInfo::layer) {
                Some(layer) => layer,
                None => continue,
            };
            if self.check_join_cycle(&layer).is_err() {
                if let Some(join) = self.joins.lock().join_mut(index) {
                    join.set_layer(Weak::new());
                }
                cycle = Some(layer.id().to_string());
                continue;
            }
            self.watch_joined_layer(index, &layer);
            resolved += 1;
        }
        if resolved > 0 {
            self.update_fields();
            self.emit(&[LayerEvent::UpdatedFields]);
        }
        match cycle {
            Some(id) => Err(Error::join_cycle(id)),
            None => Ok(resolved),
        }
    }

    fn check_join_cycle(&self, joined: &VectorLayer) -> Result<()> {
        let mut visited = HashSet::new();
        if joined.id == self.id || joined.join_reaches(&self.id, &mut visited) {
            return Err(Error::join_cycle(joined.id.clone()));
        }
        Ok(())
    }

    /// Returns true if this layer's joins lead to `layer_id`.
    pub(crate) fn join_reaches(&self, layer_id: &str, visited: &mut HashSet<String>) -> bool {
        let joins = self.joins.lock().clone();
        joins.reaches(layer_id, visited)
    }

    /// Keeps join caches and fields in step with the joined layer.
    ///
    /// Joined values the owner reads may change with any non-geometry event,
    /// which the owner reports to its own listeners as `DataChanged`.
    fn watch_joined_layer(&self, index: usize, layer: &Arc<VectorLayer>) {
        let owner = self.this.clone();
        let joined_id = layer.id().to_string();
        let subscription = layer.subscribe(move |event: &LayerEvent| {
            let owner = match owner.upgrade() {
                Some(owner) => owner,
                None => return,
            };
            owner.joins.lock().invalidate_cache_for(&joined_id);
            let mut events = Vec::new();
            if *event == LayerEvent::UpdatedFields && owner.update_fields() {
                events.push(LayerEvent::UpdatedFields);
            }
            if !matches!(event, LayerEvent::GeometryChanged { .. }) {
                events.push(LayerEvent::DataChanged);
            }
            tracing::trace!(layer = %owner.id, joined = %joined_id, ?event, "joined layer changed");
            owner.emit(&events);
        });
        if let Some(join) = self.joins.lock().join_mut(index) {
            join.set_subscription(Some(subscription));
        }
    }

    // Expression fields

    /// Adds a computed field. Returns its layer index.
    pub fn add_expression_field(
        &self,
        name: impl Into<String>,
        data_type: DataType,
        expr: Expr,
    ) -> Result<usize> {
        let name = name.into();
        {
            let mut state = self.state.write();
            if state.fields.lookup(&name).is_some() {
                return Err(Error::duplicate_field(name));
            }
            state
                .expressions
                .push(ExpressionField::new(name.clone(), data_type, expr));
        }
        self.update_fields();
        self.emit(&[LayerEvent::UpdatedFields]);
        self.state.read().fields.require(&name)
    }

    /// Removes the expression field at layer `index`.
    pub fn remove_expression_field(&self, index: usize) -> Result<()> {
        {
            let mut state = self.state.write();
            let origin = state.fields.origin(index);
            match origin {
                Some(FieldOrigin::Expression { index: k }) if k < state.expressions.len() => {
                    state.expressions.remove(k);
                }
                Some(_) => {
                    return Err(Error::invalid_operation(format!(
                        "field {} is not an expression field",
                        index
                    )))
                }
                None => {
                    return Err(Error::field_index_out_of_range(index, state.fields.len()));
                }
            }
        }
        self.update_fields();
        self.emit(&[LayerEvent::UpdatedFields]);
        Ok(())
    }

    pub fn expression_fields(&self) -> Vec<ExpressionField> {
        self.state.read().expressions.clone()
    }

    // Events

    pub fn subscribe(
        &self,
        listener: impl Fn(&LayerEvent) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let listener: LayerListener = Arc::new(listener);
        self.listeners.lock().subscribe(listener)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.listeners.lock().unsubscribe(id)
    }

    fn emit(&self, events: &[LayerEvent]) {
        let listeners = self.listeners.lock().snapshot();
        dispatch(&listeners, events);
    }

    /// Recomputes the schema. Returns true if it changed.
    fn update_fields(&self) -> bool {
        let joins = self.joins.lock().clone();
        let (edits, expressions) = {
            let state = self.state.read();
            (
                state.edit_buffer.as_ref().map(EditBuffer::snapshot),
                state.expressions.clone(),
            )
        };
        let fields = build_fields(
            &self.provider.fields(),
            edits.as_deref(),
            &joins,
            &expressions,
        );
        let mut state = self.state.write();
        if state.fields == fields {
            return false;
        }
        tracing::debug!(layer = %self.id, fields = fields.len(), "fields updated");
        state.fields = fields;
        true
    }
}

fn build_fields(
    provider_fields: &Fields,
    edits: Option<&EditState>,
    joins: &JoinBuffer,
    expressions: &[ExpressionField],
) -> Fields {
    let deleted: &[usize] = edits.map_or(&[], |e| e.deleted_attribute_ids());
    let mut fields = Fields::new();
    let stored = provider_fields
        .iter()
        .enumerate()
        .filter(|(index, _)| deleted.binary_search(index).is_err())
        .map(|(index, f)| f.clone().with_origin(FieldOrigin::Provider { index }))
        .chain(edits.into_iter().flat_map(|e| e.added_attributes().iter().cloned()));
    for field in stored {
        if let Err(err) = fields.append(field) {
            tracing::warn!(%err, "stored field skipped");
        }
    }
    joins.update_fields(&mut fields);
    for (index, expression) in expressions.iter().enumerate() {
        if let Err(err) = fields.append(expression.field(index)) {
            tracing::warn!(%err, "expression field skipped");
        }
    }
    fields
}
