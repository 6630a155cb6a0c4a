//! Property-based tests for the order-by fallback of the iterator protocol.
//!
//! The in-memory provider cannot sort, so every ordered request goes through
//! materialization in the iterator handle.

use proptest::prelude::*;
use vlayer_core::{DataType, Value};
use vlayer_query::{DataProvider, Expr, FeatureRequest, MemoryProvider, OrderByClause};

/// Strategy for nullable attribute values.
fn values_strategy(max: usize) -> impl Strategy<Value = Vec<Option<i64>>> {
    prop::collection::vec(prop::option::weighted(0.8, -50i64..50i64), 0..max)
}

fn build_provider(values: &[Option<i64>]) -> MemoryProvider {
    let provider = MemoryProvider::with_columns(&[("v", DataType::Int64)]).unwrap();
    for v in values {
        provider.add_feature(vec![Value::from(*v)], None);
    }
    provider
}

fn fetch(provider: &MemoryProvider, request: &FeatureRequest) -> Vec<(i64, Value)> {
    provider
        .feature_source()
        .get_features(request)
        .unwrap()
        .map(|f| {
            let f = f.unwrap();
            (f.id(), f.attribute(0).cloned().unwrap())
        })
        .collect()
}

proptest! {
    /// Property: ordered output is sorted and is a prefix of the full ordering, whatever the limit.
    #[test]
    fn ordered_prefix_regardless_of_limit(
        values in values_strategy(40),
        limit in 0usize..50,
        ascending in any::<bool>(),
    ) {
        let provider = build_provider(&values);
        let clause = OrderByClause::new(Expr::column("v"), ascending);

        let full = fetch(&provider, &FeatureRequest::new().add_order_by(clause.clone()));
        let limited = fetch(
            &provider,
            &FeatureRequest::new().add_order_by(clause).with_limit(limit),
        );

        prop_assert_eq!(full.len(), values.len());
        prop_assert_eq!(limited.len(), limit.min(values.len()));
        prop_assert_eq!(&full[..limited.len()], &limited[..]);

        // nulls last when ascending, first when descending
        for pair in full.windows(2) {
            let (a, b) = (&pair[0].1, &pair[1].1);
            match (a.is_null(), b.is_null()) {
                (true, false) => prop_assert!(!ascending),
                (false, true) => prop_assert!(ascending),
                (false, false) if ascending => prop_assert!(a <= b),
                (false, false) => prop_assert!(a >= b),
                (true, true) => {}
            }
        }
    }

    /// Property: equal keys keep provider order.
    #[test]
    fn ordering_is_stable(values in prop::collection::vec(0i64..3, 0..30)) {
        let wrapped: Vec<Option<i64>> = values.iter().copied().map(Some).collect();
        let provider = build_provider(&wrapped);
        let out = fetch(
            &provider,
            &FeatureRequest::new().add_order_by(OrderByClause::asc(Expr::column("v"))),
        );
        for pair in out.windows(2) {
            if pair[0].1 == pair[1].1 {
                prop_assert!(pair[0].0 < pair[1].0);
            }
        }
    }
}
