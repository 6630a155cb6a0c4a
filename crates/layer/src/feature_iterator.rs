//! Layer feature iterator.
//!
//! Merges provider rows with the edit state and computes virtual attributes.
//! Features are produced in a fixed order so that every id is emitted at
//! most once:
//!
//! 1. for rectangle filters, features whose geometry was changed;
//! 2. for expression filters, features whose attributes were changed,
//!    re-tested with the edited values;
//! 3. added features, newest first;
//! 4. provider rows, skipping deleted ids and ids handled above.
//!
//! A request filtered by a single id skips all of this and returns that
//! feature once.

use std::sync::Arc;

use hashbrown::HashSet;
use vlayer_core::{Feature, FeatureId, Fields, Result, Value};
use vlayer_query::{
    FeatureIterator, FeatureRequest, FetchFeatures, Filter, InterruptionChecker, OrderByClause,
    SimplifyMethod,
};

use crate::edit_buffer::{AttributeLayout, EditState};
use crate::source::{SourceData, VirtualStep};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Fid(FeatureId),
    ChangedGeometries,
    ChangedAttributes,
    Added,
    Provider,
    Exhausted,
}

/// Iterator over the features of a layer feature source.
pub struct LayerFeatureIterator {
    source: Arc<SourceData>,
    request: FeatureRequest,
    provider_request: FeatureRequest,
    provider: Option<FeatureIterator>,
    phase: Phase,
    queue: Vec<FeatureId>,
    pos: usize,
    /// Ids already handled by an edit phase.
    considered: HashSet<FeatureId>,
    /// The request filter must be re-applied to provider rows.
    filter_client_side: bool,
    fetch_geometry: bool,
    /// Virtual attribute steps this request needs.
    plan: Vec<VirtualStep>,
    /// Layer indices kept non-null in returned features, None for all.
    keep_attributes: Option<Vec<bool>>,
    checker: Option<InterruptionChecker>,
    closed: bool,
}

impl LayerFeatureIterator {
    pub(crate) fn new(source: Arc<SourceData>, request: FeatureRequest) -> Self {
        let fields = &source.fields;
        let edits = source.edits.as_deref();
        let referenced = request.referenced_attributes(fields);

        let needed: Option<Vec<usize>> = request.subset().map(|subset| {
            let mut needed: Vec<usize> = subset.iter().chain(&referenced).copied().collect();
            needed.sort_unstable();
            needed.dedup();
            needed
        });

        // steps producing a needed field, and the stored columns they read
        let (plan, provider_columns) = match &needed {
            None => (source.plan.clone(), None),
            Some(needed) => {
                let mut required = vec![false; fields.len()];
                for i in needed {
                    if let Some(slot) = required.get_mut(*i) {
                        *slot = true;
                    }
                }
                let plan = source.plan_for(&mut required);
                let columns: Vec<usize> = required
                    .iter()
                    .enumerate()
                    .filter(|(_, r)| **r)
                    .filter_map(|(i, _)| fields.provider_index(i))
                    .collect();
                (plan, Some(columns))
            }
        };

        let filter_disabled = request
            .filter_expression()
            .map_or(false, |expr| references_non_provider(fields, expr.referenced_columns()));
        let filter_client_side =
            request.filter_expression().is_some() && (filter_disabled || edits.is_some());

        let fetch_geometry = !request.no_geometry()
            || request.filter_rect().is_some()
            || request.expressions_need_geometry()
            || source.plan_needs_geometry(&plan);

        let mut provider_request = FeatureRequest::new()
            .with_no_geometry(!fetch_geometry)
            .with_filter(match request.filter() {
                Filter::Fid(_) => Filter::None,
                Filter::Expression(_) if filter_disabled => Filter::None,
                other => other.clone(),
            });

        if provider_columns.is_some() {
            provider_request.set_subset(provider_columns);
        }

        if request.order_by().is_empty() && !filter_disabled {
            let inflation = edits.map_or(0, |e| limit_inflation(e, request.filter()));
            provider_request.set_limit(request.limit().map(|l| l + inflation));
        }

        tracing::debug!(
            layer = %source.layer_id,
            filter_disabled,
            filter_client_side,
            virtual_steps = plan.len(),
            provider_limit = ?provider_request.limit(),
            "provider request prepared"
        );

        let keep_attributes = needed.map(|needed| {
            let mut keep = vec![false; fields.len()];
            for i in needed {
                if let Some(slot) = keep.get_mut(i) {
                    *slot = true;
                }
            }
            keep
        });

        let phase = match request.filter() {
            Filter::Fid(id) => Phase::Fid(*id),
            _ => Phase::ChangedGeometries,
        };

        let mut iter = Self {
            source,
            request,
            provider_request,
            provider: None,
            phase,
            queue: Vec::new(),
            pos: 0,
            considered: HashSet::new(),
            filter_client_side,
            fetch_geometry,
            plan,
            keep_attributes,
            checker: None,
            closed: false,
        };
        iter.enter(phase);
        iter
    }

    fn edits(&self) -> Option<&EditState> {
        self.source.edits.as_deref()
    }

    fn fields(&self) -> &Fields {
        &self.source.fields
    }

    /// Switches to `phase` and loads the ids it will visit.
    fn enter(&mut self, phase: Phase) {
        self.phase = phase;
        self.pos = 0;
        self.queue = match (phase, self.edits()) {
            (Phase::ChangedGeometries, Some(edits)) if self.request.filter_rect().is_some() => {
                edits.changed_geometries().keys().copied().collect()
            }
            (Phase::ChangedAttributes, Some(edits)) => match self.request.filter_expression() {
                Some(expr) => {
                    let mut ids: Vec<FeatureId> =
                        edits.changed_attribute_values().keys().copied().collect();
                    if expr.needs_geometry() {
                        ids.extend(edits.changed_geometries().keys().copied());
                        ids.sort_unstable();
                        ids.dedup();
                    }
                    ids
                }
                None => Vec::new(),
            },
            // ascending negative ids: newest first
            (Phase::Added, Some(edits)) => edits.added_features().keys().copied().collect(),
            _ => Vec::new(),
        };
    }

    fn next_queued(&mut self) -> Option<FeatureId> {
        let id = self.queue.get(self.pos).copied();
        if id.is_some() {
            self.pos += 1;
        }
        id
    }

    fn next_changed_geometry(&mut self) -> Result<Option<Feature>> {
        while let Some(id) = self.next_queued() {
            self.considered.insert(id);
            let geometry = match self.edits().and_then(|e| e.changed_geometry(id)) {
                Some(g) => g.clone(),
                None => continue,
            };
            let rect = match self.request.filter_rect() {
                Some(r) => *r,
                None => continue,
            };
            if !geometry.as_ref().map_or(false, |g| g.intersects_rect(&rect)) {
                continue;
            }
            let mut feature = match self.provider_row(id)? {
                Some(f) => f,
                None => continue,
            };
            self.rederive(&mut feature);
            feature.set_geometry(geometry);
            self.compute_virtual_attributes(&mut feature)?;
            return Ok(Some(self.finish(feature)));
        }
        Ok(None)
    }

    fn next_changed_attributes(&mut self) -> Result<Option<Feature>> {
        while let Some(id) = self.next_queued() {
            self.considered.insert(id);
            if self.edits().map_or(true, |e| e.is_deleted(id)) {
                continue;
            }
            let mut feature = match self.provider_row(id)? {
                Some(f) => f,
                None => continue,
            };
            self.rederive(&mut feature);
            self.overlay_geometry(&mut feature);
            self.compute_virtual_attributes(&mut feature)?;
            if !self.matches_expression(&feature) {
                continue;
            }
            return Ok(Some(self.finish(feature)));
        }
        Ok(None)
    }

    fn next_added(&mut self) -> Result<Option<Feature>> {
        while let Some(id) = self.next_queued() {
            if self.considered.contains(&id) {
                continue;
            }
            let mut feature = match self.edits().and_then(|e| e.added_feature(id)) {
                Some(f) => f.clone(),
                None => continue,
            };
            self.compute_virtual_attributes(&mut feature)?;
            if !self.request.accept_feature(&feature, self.fields()) {
                continue;
            }
            return Ok(Some(self.finish(feature)));
        }
        Ok(None)
    }

    fn next_provider(&mut self) -> Result<Option<Feature>> {
        if self.provider.is_none() {
            let iter = self.source.provider.get_features(&self.provider_request)?;
            iter.set_interruption_checker(self.checker.clone());
            self.provider = Some(iter);
        }
        loop {
            let next = match &self.provider {
                Some(iter) => iter.next_feature()?,
                None => None,
            };
            let mut feature = match next {
                Some(f) => f,
                None => return Ok(None),
            };
            let id = feature.id();
            if self.considered.contains(&id) || self.edits().map_or(false, |e| e.is_deleted(id)) {
                continue;
            }
            self.rederive(&mut feature);
            self.overlay_geometry(&mut feature);
            self.compute_virtual_attributes(&mut feature)?;
            if self.filter_client_side && !self.matches_expression(&feature) {
                continue;
            }
            return Ok(Some(self.finish(feature)));
        }
    }

    /// Single-id lookup: deleted, changed geometry, added, then provider.
    fn fetch_by_id(&mut self, id: FeatureId) -> Result<Option<Feature>> {
        if let Some(edits) = self.edits() {
            if edits.is_deleted(id) {
                return Ok(None);
            }
            if let Some(added) = edits.added_feature(id) {
                let mut feature = added.clone();
                self.compute_virtual_attributes(&mut feature)?;
                return Ok(Some(self.finish(feature)));
            }
        }
        let mut feature = match self.provider_row(id)? {
            Some(f) => f,
            None => return Ok(None),
        };
        self.rederive(&mut feature);
        if !self.request.no_geometry() {
            self.overlay_geometry(&mut feature);
        }
        self.compute_virtual_attributes(&mut feature)?;
        Ok(Some(self.finish(feature)))
    }

    fn provider_row(&self, id: FeatureId) -> Result<Option<Feature>> {
        let mut request = self.provider_request.clone().with_filter_fid(id);
        request.set_limit(None);
        request.set_order_by(Vec::new());
        self.source.provider.get_features(&request)?.next_feature()
    }

    /// Maps a provider row onto the layer schema.
    fn rederive(&self, feature: &mut Feature) {
        let mut attrs = std::mem::take(feature.attributes_mut());
        match self.edits() {
            Some(edits) => {
                edits.rederive_attributes(feature.id(), &mut attrs, AttributeLayout::Provider);
            }
            None => attrs.resize(self.source.provider_width, Value::Null),
        }
        feature.set_attributes(attrs);
    }

    fn overlay_geometry(&self, feature: &mut Feature) {
        if !self.fetch_geometry {
            return;
        }
        if let Some(geometry) = self.edits().and_then(|e| e.changed_geometry(feature.id())) {
            feature.set_geometry(geometry.clone());
        }
    }

    fn matches_expression(&self, feature: &Feature) -> bool {
        match self.request.filter_expression() {
            Some(expr) => expr.evaluate_predicate(self.fields(), feature),
            None => true,
        }
    }

    /// Pads to the layer schema and fills join and expression slots.
    fn compute_virtual_attributes(&self, feature: &mut Feature) -> Result<()> {
        let fields = &self.source.fields;
        feature.resize_attributes(fields.len());
        for step in &self.plan {
            match step {
                VirtualStep::Expression {
                    field_index,
                    expr_index,
                } => {
                    let value = match self.source.expressions.get(*expr_index) {
                        Some(expr) => expr.compute(fields, feature),
                        None => Value::Null,
                    };
                    feature.set_attribute(*field_index, value);
                }
                VirtualStep::Join {
                    join_index,
                    slots,
                    source_indices,
                } => {
                    let join = match self.source.joins.join(*join_index) {
                        Some(j) => j,
                        None => continue,
                    };
                    let value = join.target_value(fields, feature);
                    let joined = join.joined_attributes(&value, source_indices)?;
                    for &(layer_index, source_index) in slots {
                        let v = joined
                            .as_ref()
                            .and_then(|attrs| attrs.get(source_index))
                            .cloned()
                            .unwrap_or(Value::Null);
                        feature.set_attribute(layer_index, v);
                    }
                }
            }
        }
        Ok(())
    }

    /// Applies the geometry flag and attribute subset of the request.
    fn finish(&self, mut feature: Feature) -> Feature {
        if self.request.no_geometry() {
            feature.clear_geometry();
        }
        if let Some(keep) = &self.keep_attributes {
            for (slot, keep) in feature.attributes_mut().iter_mut().zip(keep) {
                if !*keep {
                    *slot = Value::Null;
                }
            }
        }
        feature.set_valid(true);
        feature
    }

    fn start_phase(&self) -> Phase {
        match self.request.filter() {
            Filter::Fid(id) => Phase::Fid(*id),
            _ => Phase::ChangedGeometries,
        }
    }
}

impl FetchFeatures for LayerFeatureIterator {
    fn fetch_feature(&mut self) -> Result<Option<Feature>> {
        if self.closed {
            return Ok(None);
        }
        loop {
            match self.phase {
                Phase::Fid(id) => {
                    self.enter(Phase::Exhausted);
                    return self.fetch_by_id(id);
                }
                Phase::ChangedGeometries => {
                    if let Some(f) = self.next_changed_geometry()? {
                        return Ok(Some(f));
                    }
                    self.enter(Phase::ChangedAttributes);
                }
                Phase::ChangedAttributes => {
                    if let Some(f) = self.next_changed_attributes()? {
                        return Ok(Some(f));
                    }
                    self.enter(Phase::Added);
                }
                Phase::Added => {
                    if let Some(f) = self.next_added()? {
                        return Ok(Some(f));
                    }
                    self.enter(Phase::Provider);
                }
                Phase::Provider => {
                    if let Some(f) = self.next_provider()? {
                        return Ok(Some(f));
                    }
                    self.enter(Phase::Exhausted);
                }
                Phase::Exhausted => {
                    self.close();
                    return Ok(None);
                }
            }
        }
    }

    fn rewind(&mut self) -> bool {
        if self.closed {
            return false;
        }
        self.considered.clear();
        if let Some(provider) = &self.provider {
            if !provider.rewind() {
                self.provider = None;
            }
        }
        let phase = self.start_phase();
        self.enter(phase);
        true
    }

    fn close(&mut self) -> bool {
        if self.closed {
            return false;
        }
        self.closed = true;
        if let Some(provider) = self.provider.take() {
            provider.close();
        }
        true
    }

    fn fields(&self) -> &Fields {
        &self.source.fields
    }

    /// Simplification is pushed to the provider only when no edited
    /// geometry can reach the output.
    fn prepare_simplification(&mut self, method: SimplifyMethod) -> bool {
        if self.edits().is_some() || method == SimplifyMethod::None {
            return false;
        }
        self.provider_request = self.provider_request.clone().with_simplify(method);
        true
    }

    fn prepare_order_by(&mut self, clauses: &[OrderByClause]) -> bool {
        let provider_only = clauses.iter().all(|c| {
            !references_non_provider(self.fields(), c.expr().referenced_columns())
        });
        let pushable = self.edits().is_none()
            && provider_only
            && !self.filter_client_side
            && self.provider.is_none()
            && !matches!(self.phase, Phase::Fid(_));
        if !pushable {
            return false;
        }
        self.provider_request.set_order_by(clauses.to_vec());
        self.provider_request.set_limit(self.request.limit());
        true
    }

    fn filters_natively(&self) -> bool {
        true
    }

    fn set_interruption_checker(&mut self, checker: Option<InterruptionChecker>) {
        if let Some(provider) = &self.provider {
            provider.set_interruption_checker(checker.clone());
        }
        self.checker = checker;
    }
}

/// True if a name does not resolve to a provider column of the layer.
fn references_non_provider(fields: &Fields, names: Vec<&str>) -> bool {
    let mut indices = Vec::with_capacity(names.len());
    for name in names {
        match fields.lookup(name) {
            Some(i) => indices.push(i),
            None => return true,
        }
    }
    fields.any_non_provider(indices)
}

/// Extra provider rows needed to fill a limit after edited rows are dropped.
fn limit_inflation(edits: &EditState, filter: &Filter) -> usize {
    let mut extra = edits.deleted_feature_ids().len();
    if matches!(filter, Filter::Expression(_)) {
        extra += edits.changed_attribute_values().len();
    }
    if matches!(filter, Filter::Expression(_) | Filter::Rect(_)) {
        extra += edits.changed_geometries().len();
    }
    extra
}
