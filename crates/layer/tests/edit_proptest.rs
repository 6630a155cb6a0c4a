//! Property-based tests for the edit overlay.
//!
//! Random edit sequences are applied both to a layer and to a plain map of
//! id to value; iteration over the layer must agree with the map.

use std::collections::BTreeMap;
use std::sync::Arc;

use proptest::prelude::*;
use vlayer_core::{DataType, Feature, Value};
use vlayer_layer::{AttributeLayout, EditState, VectorLayer};
use vlayer_query::{Expr, FeatureRequest, MemoryProvider};

#[derive(Clone, Debug)]
enum EditOp {
    Add(i64),
    /// Deletes the n-th live feature.
    Delete(usize),
    /// Sets the value of the n-th live feature.
    Change(usize, i64),
}

fn op_strategy() -> impl Strategy<Value = EditOp> {
    prop_oneof![
        (-20i64..20).prop_map(EditOp::Add),
        any::<usize>().prop_map(EditOp::Delete),
        (any::<usize>(), -20i64..20).prop_map(|(n, v)| EditOp::Change(n, v)),
    ]
}

fn build(values: &[i64], ops: &[EditOp]) -> (Arc<VectorLayer>, BTreeMap<i64, i64>) {
    let provider = MemoryProvider::with_columns(&[("v", DataType::Int64)]).unwrap();
    let mut model = BTreeMap::new();
    for v in values {
        let id = provider.add_feature(vec![Value::Int64(*v)], None);
        model.insert(id, *v);
    }
    let layer = VectorLayer::new("l", "L", Arc::new(provider));
    layer.start_editing();

    for op in ops {
        match op {
            EditOp::Add(v) => {
                let id = layer
                    .add_feature(Feature::new(0, vec![Value::Int64(*v)]))
                    .unwrap();
                model.insert(id, *v);
            }
            EditOp::Delete(n) if !model.is_empty() => {
                let id = *model.keys().nth(n % model.len()).unwrap();
                assert!(layer.delete_feature(id).unwrap());
                model.remove(&id);
            }
            EditOp::Change(n, v) if !model.is_empty() => {
                let id = *model.keys().nth(n % model.len()).unwrap();
                layer.change_attribute_value(id, 0, Value::Int64(*v)).unwrap();
                model.insert(id, *v);
            }
            _ => {}
        }
    }
    (layer, model)
}

fn fetch(layer: &VectorLayer, request: &FeatureRequest) -> BTreeMap<i64, i64> {
    let mut out = BTreeMap::new();
    for f in layer.get_features(request).unwrap() {
        let f = f.unwrap();
        let v = match f.attribute(0) {
            Some(Value::Int64(v)) => *v,
            other => panic!("unexpected value {:?}", other),
        };
        assert!(out.insert(f.id(), v).is_none(), "feature {} emitted twice", f.id());
    }
    out
}

proptest! {
    /// Property: iteration returns exactly the live features with their latest values.
    #[test]
    fn iteration_matches_model(
        values in prop::collection::vec(-20i64..20, 0..20),
        ops in prop::collection::vec(op_strategy(), 0..30),
    ) {
        let (layer, model) = build(&values, &ops);
        prop_assert_eq!(fetch(&layer, &FeatureRequest::new()), model.clone());
        prop_assert_eq!(layer.feature_count(), model.len());
    }

    /// Property: expression filters evaluate edited values, never provider values.
    #[test]
    fn filter_matches_model(
        values in prop::collection::vec(-20i64..20, 0..20),
        ops in prop::collection::vec(op_strategy(), 0..30),
        threshold in -20i64..20,
    ) {
        let (layer, model) = build(&values, &ops);
        let request = FeatureRequest::new()
            .with_filter_expression(Expr::gt(Expr::column("v"), Expr::literal(threshold)));
        let expected: BTreeMap<i64, i64> =
            model.into_iter().filter(|(_, v)| *v > threshold).collect();
        prop_assert_eq!(fetch(&layer, &request), expected);
    }

    /// Property: a limit caps the count without emitting deleted features.
    #[test]
    fn limit_never_exceeded(
        values in prop::collection::vec(-20i64..20, 0..20),
        ops in prop::collection::vec(op_strategy(), 0..30),
        limit in 0usize..25,
    ) {
        let (layer, model) = build(&values, &ops);
        let got = fetch(&layer, &FeatureRequest::new().with_limit(limit));
        prop_assert_eq!(got.len(), limit.min(model.len()));
        for (id, v) in &got {
            prop_assert_eq!(model.get(id), Some(v));
        }
    }

    /// Property: re-deriving a vector already in layer order changes nothing.
    #[test]
    fn rederive_is_idempotent(
        width in 1usize..6,
        deleted in prop::collection::btree_set(0usize..6, 0..3),
        added in 0usize..3,
    ) {
        let mut state = EditState::new(width);
        for index in deleted.iter().rev().filter(|i| **i < width) {
            state.delete_attribute(
                *index,
                vlayer_core::FieldOrigin::Provider { index: *index },
            );
        }
        for k in 0..added {
            state.add_attribute(vlayer_core::Field::new(
                format!("extra{}", k),
                DataType::Int64,
                vlayer_core::FieldOrigin::Edit { index: 0 },
            ));
        }

        let mut attrs: Vec<Value> = (0..width as i64).map(Value::Int64).collect();
        let layout = state.rederive_attributes(1, &mut attrs, AttributeLayout::Provider);
        prop_assert_eq!(layout, AttributeLayout::Stored);
        prop_assert_eq!(attrs.len(), state.stored_width());

        let once = attrs.clone();
        state.rederive_attributes(1, &mut attrs, AttributeLayout::Stored);
        prop_assert_eq!(attrs, once);
    }
}
