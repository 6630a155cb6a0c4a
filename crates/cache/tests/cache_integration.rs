//! Integration tests for the feature cache.
//!
//! A failing provider proves a request was answered from the cache.

use std::sync::Arc;

use vlayer_cache::{CacheSettings, FeatureCache, RequestResultIndex};
use vlayer_core::{DataType, Feature, Geometry, Value};
use vlayer_layer::{JoinInfo, VectorLayer};
use vlayer_query::{Expr, FeatureRequest, MemoryProvider};

fn layer(count: i64) -> (Arc<MemoryProvider>, Arc<VectorLayer>) {
    let provider = Arc::new(MemoryProvider::with_columns(&[("x", DataType::Int64)]).unwrap());
    for i in 1..=count {
        provider.add_feature(vec![Value::Int64(i)], Some(Geometry::point(i as f64, 0.0)));
    }
    let layer = VectorLayer::new("l", "L", provider.clone());
    (provider, layer)
}

fn ids(cache: &FeatureCache, request: &FeatureRequest) -> Vec<i64> {
    cache
        .get_features(request)
        .unwrap()
        .map(|f| f.unwrap().id())
        .collect()
}

#[test]
fn test_full_cache_follows_deletions() {
    let (provider, layer) = layer(100);
    let cache = FeatureCache::new(layer.clone(), CacheSettings::default());
    cache.set_full_cache(true).unwrap();
    assert!(cache.is_full());
    assert_eq!(cache.stats().resident, 100);

    layer.start_editing();
    layer.delete_feature(7).unwrap();
    provider.set_failure(Some("offline".to_string()));

    let found = ids(&cache, &FeatureRequest::new());
    assert_eq!(found.len(), 99);
    assert!(!found.contains(&7));
    assert!(cache.feature_at_id(7, false).unwrap().is_none());
}

#[test]
fn test_full_cache_patches_edits() {
    let (provider, layer) = layer(10);
    let cache = FeatureCache::new(layer.clone(), CacheSettings::default());
    cache.set_full_cache(true).unwrap();

    layer.start_editing();
    layer.change_attribute_value(3, 0, Value::Int64(300)).unwrap();
    layer
        .change_geometry(4, Some(Geometry::point(40.0, 40.0)))
        .unwrap();
    let added = layer
        .add_feature(Feature::new(0, vec![Value::Int64(11)]))
        .unwrap();
    assert!(cache.is_fid_cached(added));

    provider.set_failure(Some("offline".to_string()));
    let three = cache.feature_at_id(3, false).unwrap().unwrap();
    assert_eq!(three.attribute(0), Some(&Value::Int64(300)));
    let four = cache.feature_at_id(4, false).unwrap().unwrap();
    assert_eq!(four.geometry(), Some(&Geometry::point(40.0, 40.0)));

    let request = FeatureRequest::new()
        .with_filter_expression(Expr::gt(Expr::column("x"), Expr::literal(9i64)));
    assert_eq!(ids(&cache, &request), vec![added, 3, 10]);
}

#[test]
fn test_schema_change_invalidates() {
    let (_, layer) = layer(5);
    let cache = FeatureCache::new(layer.clone(), CacheSettings::default());
    cache.set_full_cache(true).unwrap();

    layer
        .add_expression_field(
            "double",
            DataType::Int64,
            Expr::mul(Expr::column("x"), Expr::literal(2i64)),
        )
        .unwrap();
    assert!(!cache.is_full());
    assert_eq!(cache.stats().resident, 0);

    let feature = cache.feature_at_id(2, false).unwrap().unwrap();
    assert_eq!(feature.attribute(1), Some(&Value::Int64(4)));
}

#[test]
fn test_fid_requests_served_when_resident() {
    let (provider, layer) = layer(5);
    let cache = FeatureCache::new(layer, CacheSettings::default());
    assert_eq!(ids(&cache, &FeatureRequest::new().with_filter_fids([2, 4])), vec![2, 4]);

    provider.set_failure(Some("offline".to_string()));
    assert_eq!(ids(&cache, &FeatureRequest::new().with_filter_fid(4)), vec![4]);
    assert_eq!(ids(&cache, &FeatureRequest::new().with_filter_fids([4, 2])), vec![2, 4]);
    assert!(cache
        .get_features(&FeatureRequest::new().with_filter_fid(5))
        .and_then(|it| it.collect_features())
        .is_err());
}

#[test]
fn test_index_serves_repeated_request() {
    let (provider, layer) = layer(20);
    let cache = FeatureCache::new(layer, CacheSettings::default());
    cache.add_cache_index(Box::new(RequestResultIndex::default()));

    let request = FeatureRequest::new()
        .with_filter_expression(Expr::gt(Expr::column("x"), Expr::literal(17i64)));
    assert_eq!(ids(&cache, &request), vec![18, 19, 20]);
    assert!(!cache.is_full());

    provider.set_failure(Some("offline".to_string()));
    assert_eq!(ids(&cache, &request), vec![18, 19, 20]);
    assert_eq!(cache.stats().hits, 1);
}

#[test]
fn test_canceled_population_is_partial() {
    let (_, layer) = layer(50);
    let settings = CacheSettings::default().with_progress_interval(10);
    let cache = FeatureCache::new(layer, settings);

    let mut reports = Vec::new();
    let complete = cache
        .populate_full_cache(|loaded| {
            reports.push(loaded);
            loaded < 20
        })
        .unwrap();
    assert!(!complete);
    assert_eq!(reports, vec![10, 20]);
    assert!(!cache.is_full());
    assert_eq!(cache.stats().resident, 20);

    assert!(cache.populate_full_cache(|_| true).unwrap());
    assert_eq!(cache.stats().resident, 50);
}

#[test]
fn test_dropped_cache_unsubscribes() {
    let (_, layer) = layer(3);
    let cache = FeatureCache::new(layer.clone(), CacheSettings::default());
    cache.set_full_cache(true).unwrap();
    drop(cache);

    layer.start_editing();
    assert!(layer.delete_feature(1).unwrap());
    assert_eq!(layer.feature_count(), 2);
}

#[test]
fn test_edit_during_fill_is_not_cached() {
    let (provider, layer) = layer(10);
    let cache = FeatureCache::new(
        layer.clone(),
        CacheSettings::default().with_cache_geometry(false),
    );
    layer.start_editing();

    let request = FeatureRequest::new().with_no_geometry(true);
    let iter = cache.get_features(&request).unwrap();
    assert_eq!(iter.next_feature().unwrap().unwrap().id(), 1);
    assert!(layer.delete_feature(7).unwrap());
    // the open iterator keeps reading its snapshot
    let rest: Vec<i64> = iter.map(|f| f.unwrap().id()).collect();
    assert!(rest.contains(&7));

    assert!(!cache.is_full());
    assert!(!cache.is_fid_cached(7));
    assert!(cache.feature_at_id(7, false).unwrap().is_none());

    let fresh = ids(&cache, &request);
    assert_eq!(fresh.len(), 9);
    assert!(cache.is_full());

    provider.set_failure(Some("offline".to_string()));
    let served = ids(&cache, &request);
    assert_eq!(served.len(), 9);
    assert!(!served.contains(&7));
    assert!(cache.feature_at_id(7, false).unwrap().is_none());
}

#[test]
fn test_edit_during_population_leaves_cache_partial() {
    let (_, layer) = layer(10);
    let cache = FeatureCache::new(
        layer.clone(),
        CacheSettings::default().with_progress_interval(2),
    );
    layer.start_editing();

    let editor = layer.clone();
    let complete = cache
        .populate_full_cache(|loaded| {
            if loaded == 2 {
                editor.delete_feature(7).unwrap();
            }
            true
        })
        .unwrap();
    assert!(!complete);
    assert!(!cache.is_full());
    assert!(!cache.is_fid_cached(7));

    assert!(cache.populate_full_cache(|_| true).unwrap());
    assert_eq!(cache.stats().resident, 9);
    assert!(!cache.is_fid_cached(7));
}

#[test]
fn test_joined_layer_edits_reach_full_cache() {
    let zone_provider = Arc::new(
        MemoryProvider::with_columns(&[("zone", DataType::Int64), ("label", DataType::String)])
            .unwrap(),
    );
    zone_provider.add_feature(vec![Value::Int64(1), Value::from("north")], None);
    let zones = VectorLayer::new("zones", "Zones", zone_provider);

    let road_provider = Arc::new(
        MemoryProvider::with_columns(&[("name", DataType::String), ("zone", DataType::Int64)])
            .unwrap(),
    );
    road_provider.add_feature(vec![Value::from("a"), Value::Int64(1)], None);
    let roads = VectorLayer::new("roads", "Roads", road_provider);
    roads
        .add_join(JoinInfo::to_layer("zone", &zones, "zone").with_prefix("z_"))
        .unwrap();

    let cache = FeatureCache::new(roads.clone(), CacheSettings::default());
    cache.set_full_cache(true).unwrap();
    let label = |f: Feature| f.attribute(2).cloned();
    assert_eq!(
        label(cache.feature_at_id(1, false).unwrap().unwrap()),
        Some(Value::from("north"))
    );

    zones.start_editing();
    zones
        .change_attribute_value(1, 1, Value::from("arctic"))
        .unwrap();
    assert!(!cache.is_full());

    let served: Vec<Option<Value>> = cache
        .get_features(&FeatureRequest::new())
        .unwrap()
        .map(|f| label(f.unwrap()))
        .collect();
    assert_eq!(served, vec![Some(Value::from("arctic"))]);
    assert_eq!(
        label(cache.feature_at_id(1, false).unwrap().unwrap()),
        Some(Value::from("arctic"))
    );
}
