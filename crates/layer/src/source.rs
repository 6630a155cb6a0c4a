//! Point-in-time feature sources of a layer.
//!
//! A [`LayerFeatureSource`] captures everything an iteration needs: the
//! provider's source, the layer schema, joins with their memory caches,
//! expression fields and the shared edit state. It never changes after
//! construction, so iterators created from it ignore later layer edits.

use std::collections::VecDeque;
use std::sync::Arc;

use vlayer_core::{FieldOrigin, Fields, Result};
use vlayer_query::{FeatureIterator, FeatureRequest, FeatureSource};

use crate::edit_buffer::EditState;
use crate::expression_fields::ExpressionField;
use crate::feature_iterator::LayerFeatureIterator;
use crate::join::JoinBuffer;

/// One step of virtual attribute computation.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum VirtualStep {
    Expression {
        field_index: usize,
        expr_index: usize,
    },
    Join {
        join_index: usize,
        /// (layer field index, joined layer field index)
        slots: Vec<(usize, usize)>,
        source_indices: Vec<usize>,
    },
}

pub(crate) struct SourceData {
    pub(crate) layer_id: String,
    pub(crate) provider: Arc<dyn FeatureSource>,
    pub(crate) provider_width: usize,
    pub(crate) fields: Fields,
    pub(crate) joins: JoinBuffer,
    pub(crate) expressions: Vec<ExpressionField>,
    pub(crate) edits: Option<Arc<EditState>>,
    pub(crate) crs: String,
    pub(crate) plan: Vec<VirtualStep>,
}

impl SourceData {
    /// Steps of the full plan producing a field marked in `required`, with
    /// the steps they depend on. The fields read by kept steps are marked in
    /// `required` as well.
    pub(crate) fn plan_for(&self, required: &mut [bool]) -> Vec<VirtualStep> {
        let mut keep = vec![false; self.plan.len()];
        // dependencies always precede their dependents in the plan
        for (k, step) in self.plan.iter().enumerate().rev() {
            let produces = match step {
                VirtualStep::Expression { field_index, .. } => {
                    required.get(*field_index).copied().unwrap_or(false)
                }
                VirtualStep::Join { slots, .. } => slots
                    .iter()
                    .any(|(i, _)| required.get(*i).copied().unwrap_or(false)),
            };
            if !produces {
                continue;
            }
            keep[k] = true;
            for i in self.step_inputs(step) {
                if let Some(slot) = required.get_mut(i) {
                    *slot = true;
                }
            }
        }
        self.plan
            .iter()
            .zip(keep)
            .filter(|(_, keep)| *keep)
            .map(|(step, _)| step.clone())
            .collect()
    }

    /// Layer fields read by a step.
    fn step_inputs(&self, step: &VirtualStep) -> Vec<usize> {
        match step {
            VirtualStep::Expression { expr_index, .. } => self
                .expressions
                .get(*expr_index)
                .map(|e| {
                    e.expr()
                        .referenced_columns()
                        .into_iter()
                        .filter_map(|name| self.fields.lookup(name))
                        .collect()
                })
                .unwrap_or_default(),
            VirtualStep::Join { join_index, .. } => self
                .joins
                .join(*join_index)
                .filter(|j| !j.use_target_feature_id())
                .and_then(|j| self.fields.lookup(j.target_field()))
                .into_iter()
                .collect(),
        }
    }

    /// Returns true if an expression step of `plan` evaluates geometry.
    pub(crate) fn plan_needs_geometry(&self, plan: &[VirtualStep]) -> bool {
        plan.iter().any(|step| match step {
            VirtualStep::Expression { expr_index, .. } => self
                .expressions
                .get(*expr_index)
                .map_or(false, |e| e.expr().needs_geometry()),
            VirtualStep::Join { .. } => false,
        })
    }
}

/// Immutable view of a layer for one or more requests.
#[derive(Clone)]
pub struct LayerFeatureSource {
    pub(crate) inner: Arc<SourceData>,
}

impl LayerFeatureSource {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        layer_id: String,
        provider: Arc<dyn FeatureSource>,
        provider_width: usize,
        fields: Fields,
        joins: JoinBuffer,
        expressions: Vec<ExpressionField>,
        edits: Option<Arc<EditState>>,
        crs: String,
    ) -> Self {
        let plan = plan_virtual_fields(&fields, &joins, &expressions);
        tracing::debug!(
            layer = %layer_id,
            fields = fields.len(),
            joins = joins.len(),
            expressions = expressions.len(),
            editing = edits.is_some(),
            "feature source created"
        );
        Self {
            inner: Arc::new(SourceData {
                layer_id,
                provider,
                provider_width,
                fields,
                joins,
                expressions,
                edits,
                crs,
                plan,
            }),
        }
    }

    pub fn fields(&self) -> &Fields {
        &self.inner.fields
    }

    pub fn crs(&self) -> &str {
        &self.inner.crs
    }

    /// The edit state captured by this source, if the layer was being edited.
    pub fn edits(&self) -> Option<&EditState> {
        self.inner.edits.as_deref()
    }
}

impl FeatureSource for LayerFeatureSource {
    fn get_features(&self, request: &FeatureRequest) -> Result<FeatureIterator> {
        let iter = LayerFeatureIterator::new(self.inner.clone(), request.clone());
        Ok(FeatureIterator::new(iter, request.clone()))
    }
}

/// Orders virtual attribute computation.
///
/// Expression fields used as a join target run first, then joins in
/// dependency order, then the remaining expression fields.
pub(crate) fn plan_virtual_fields(
    fields: &Fields,
    joins: &JoinBuffer,
    expressions: &[ExpressionField],
) -> Vec<VirtualStep> {
    let expression_slots: Vec<Option<usize>> = (0..expressions.len())
        .map(|k| {
            fields
                .iter()
                .position(|f| f.origin() == FieldOrigin::Expression { index: k })
        })
        .collect();

    let mut join_steps: Vec<Option<VirtualStep>> = Vec::with_capacity(joins.len());
    for join_index in 0..joins.len() {
        let offset = match joins.joined_fields_offset(join_index, fields) {
            Some(offset) => offset,
            None => {
                // unresolved
                join_steps.push(None);
                continue;
            }
        };
        let slots: Vec<(usize, usize)> = fields
            .iter()
            .enumerate()
            .skip(offset)
            .map_while(|(i, f)| match f.origin() {
                FieldOrigin::Join {
                    join_index: j,
                    source_index,
                } if j == join_index => Some((i, source_index)),
                _ => None,
            })
            .collect();
        let source_indices = slots.iter().map(|(_, s)| *s).collect();
        join_steps.push(Some(VirtualStep::Join {
            join_index,
            slots,
            source_indices,
        }));
    }

    let target_of = |join_index: usize| -> Option<usize> {
        let join = joins.join(join_index)?;
        if join.use_target_feature_id() {
            return None;
        }
        fields.lookup(join.target_field())
    };

    let mut early = vec![false; expressions.len()];
    for (join_index, step) in join_steps.iter().enumerate() {
        if step.is_none() {
            continue;
        }
        if let Some(target) = target_of(join_index) {
            if let Some(FieldOrigin::Expression { index }) = fields.origin(target) {
                early[index] = true;
            }
        }
    }

    let active: Vec<usize> = (0..join_steps.len())
        .filter(|j| join_steps[*j].is_some())
        .collect();
    let order = order_joins(&active, |j| match target_of(j).and_then(|t| fields.origin(t)) {
        Some(FieldOrigin::Join { join_index, .. }) if join_index != j => Some(join_index),
        _ => None,
    });

    let mut plan = Vec::new();
    let push_expression = |plan: &mut Vec<VirtualStep>, expr_index: usize| {
        if let Some(field_index) = expression_slots[expr_index] {
            plan.push(VirtualStep::Expression {
                field_index,
                expr_index,
            });
        }
    };
    for (expr_index, is_early) in early.iter().enumerate() {
        if *is_early {
            push_expression(&mut plan, expr_index);
        }
    }
    for join_index in order {
        if let Some(step) = join_steps[join_index].take() {
            plan.push(step);
        }
    }
    for (expr_index, is_early) in early.iter().enumerate() {
        if !*is_early {
            push_expression(&mut plan, expr_index);
        }
    }
    plan
}

/// Orders joins so that a join runs after the join producing its target field.
///
/// Bounded fixed-point pass: at most n(n+1)/2 attempts. Joins still waiting
/// when the cap is hit keep their configured order at the end.
pub(crate) fn order_joins(
    joins: &[usize],
    depends_on: impl Fn(usize) -> Option<usize>,
) -> Vec<usize> {
    let n = joins.len();
    let cap = n * (n + 1) / 2;
    let mut pending: VecDeque<usize> = joins.iter().copied().collect();
    let mut ordered: Vec<usize> = Vec::with_capacity(n);
    let mut attempts = 0;

    while let Some(join) = pending.pop_front() {
        if attempts >= cap {
            pending.push_front(join);
            break;
        }
        attempts += 1;
        let ready = match depends_on(join) {
            Some(dep) => ordered.contains(&dep) || !joins.contains(&dep),
            None => true,
        };
        if ready {
            ordered.push(join);
        } else {
            pending.push_back(join);
        }
    }

    if !pending.is_empty() {
        tracing::warn!(
            unresolved = pending.len(),
            "join dependencies not satisfiable, keeping configured order"
        );
        let mut rest: Vec<usize> = pending.into_iter().collect();
        rest.sort_by_key(|j| joins.iter().position(|x| x == j));
        ordered.extend(rest);
    }
    ordered
}
