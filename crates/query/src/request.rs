//! Feature request: what a caller wants back from a feature iterator.

use hashbrown::HashSet;
use serde::{Deserialize, Serialize};
use vlayer_core::{Feature, FeatureId, Fields, Rect};

use crate::ast::{Expr, OrderByClause};

/// Which features a request selects.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum Filter {
    #[default]
    None,
    /// A single feature by id.
    Fid(FeatureId),
    /// A set of feature ids.
    Fids(HashSet<FeatureId>),
    /// Features for which the expression evaluates to true.
    Expression(Expr),
    /// Features whose geometry intersects the rectangle.
    Rect(Rect),
}

/// Geometry simplification applied while fetching.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum SimplifyMethod {
    #[default]
    None,
    /// Douglas-Peucker with the given tolerance in layer units.
    Distance { tolerance: f64 },
}

/// A request for features.
///
/// Attribute subsets are expressed as schema indices of whoever serves the
/// request: layer field indices for a layer, provider column indices for a
/// provider. Attributes outside the subset are left null.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FeatureRequest {
    filter: Filter,
    subset: Option<Vec<usize>>,
    order_by: Vec<OrderByClause>,
    limit: Option<usize>,
    no_geometry: bool,
    simplify: SimplifyMethod,
}

impl FeatureRequest {
    /// Creates a request for all features with all attributes and geometry.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_filter_fid(self, id: FeatureId) -> Self {
        self.with_filter(Filter::Fid(id))
    }

    pub fn with_filter_fids(self, ids: impl IntoIterator<Item = FeatureId>) -> Self {
        self.with_filter(Filter::Fids(ids.into_iter().collect()))
    }

    pub fn with_filter_expression(self, expr: Expr) -> Self {
        self.with_filter(Filter::Expression(expr))
    }

    pub fn with_filter_rect(self, rect: Rect) -> Self {
        self.with_filter(Filter::Rect(rect))
    }

    /// Limits fetched attributes to the given schema indices.
    pub fn with_subset_of_attributes(mut self, indices: impl IntoIterator<Item = usize>) -> Self {
        let mut subset: Vec<usize> = indices.into_iter().collect();
        subset.sort_unstable();
        subset.dedup();
        self.subset = Some(subset);
        self
    }

    /// Limits fetched attributes to the named fields. Unknown names are ignored.
    pub fn with_subset_of_names<'n>(
        self,
        names: impl IntoIterator<Item = &'n str>,
        fields: &Fields,
    ) -> Self {
        let indices: Vec<usize> = names.into_iter().filter_map(|n| fields.lookup(n)).collect();
        self.with_subset_of_attributes(indices)
    }

    pub fn with_all_attributes(mut self) -> Self {
        self.subset = None;
        self
    }

    pub fn with_order_by(mut self, clauses: Vec<OrderByClause>) -> Self {
        self.order_by = clauses;
        self
    }

    pub fn add_order_by(mut self, clause: OrderByClause) -> Self {
        self.order_by.push(clause);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_no_limit(mut self) -> Self {
        self.limit = None;
        self
    }

    pub fn with_no_geometry(mut self, no_geometry: bool) -> Self {
        self.no_geometry = no_geometry;
        self
    }

    pub fn with_simplify(mut self, method: SimplifyMethod) -> Self {
        self.simplify = method;
        self
    }

    #[inline]
    pub fn filter(&self) -> &Filter {
        &self.filter
    }

    #[inline]
    pub fn subset(&self) -> Option<&[usize]> {
        self.subset.as_deref()
    }

    #[inline]
    pub fn order_by(&self) -> &[OrderByClause] {
        &self.order_by
    }

    #[inline]
    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    #[inline]
    pub fn no_geometry(&self) -> bool {
        self.no_geometry
    }

    #[inline]
    pub fn simplify(&self) -> SimplifyMethod {
        self.simplify
    }

    pub fn filter_expression(&self) -> Option<&Expr> {
        match &self.filter {
            Filter::Expression(e) => Some(e),
            _ => None,
        }
    }

    pub fn filter_rect(&self) -> Option<&Rect> {
        match &self.filter {
            Filter::Rect(r) => Some(r),
            _ => None,
        }
    }

    /// Returns true if the attribute at `index` is requested.
    pub fn wants_attribute(&self, index: usize) -> bool {
        self.subset
            .as_ref()
            .map_or(true, |s| s.binary_search(&index).is_ok())
    }

    /// Tests a feature against this request's filter.
    pub fn accept_feature(&self, feature: &Feature, fields: &Fields) -> bool {
        match &self.filter {
            Filter::None => true,
            Filter::Fid(id) => feature.id() == *id,
            Filter::Fids(ids) => ids.contains(&feature.id()),
            Filter::Expression(expr) => expr.evaluate_predicate(fields, feature),
            Filter::Rect(rect) => feature
                .geometry()
                .map_or(false, |g| g.intersects_rect(rect)),
        }
    }

    /// Schema indices read by the filter expression and order-by clauses.
    ///
    /// Sorted and without duplicates. Names that do not resolve are skipped.
    pub fn referenced_attributes(&self, fields: &Fields) -> Vec<usize> {
        let mut indices: Vec<usize> = Vec::new();
        let mut add_expr = |expr: &Expr| {
            for name in expr.referenced_columns() {
                if let Some(i) = fields.lookup(name) {
                    indices.push(i);
                }
            }
        };
        if let Some(expr) = self.filter_expression() {
            add_expr(expr);
        }
        for clause in &self.order_by {
            add_expr(clause.expr());
        }
        indices.sort_unstable();
        indices.dedup();
        indices
    }

    /// Returns true if the filter or ordering evaluates geometry functions.
    pub fn expressions_need_geometry(&self) -> bool {
        self.filter_expression().map_or(false, Expr::needs_geometry)
            || self.order_by.iter().any(|c| c.expr().needs_geometry())
    }

    // In-place setters used when rewriting a request

    pub fn set_filter(&mut self, filter: Filter) {
        self.filter = filter;
    }

    pub fn set_subset(&mut self, subset: Option<Vec<usize>>) {
        self.subset = subset.map(|mut s| {
            s.sort_unstable();
            s.dedup();
            s
        });
    }

    pub fn set_limit(&mut self, limit: Option<usize>) {
        self.limit = limit;
    }

    pub fn set_order_by(&mut self, clauses: Vec<OrderByClause>) {
        self.order_by = clauses;
    }

    pub fn set_no_geometry(&mut self, no_geometry: bool) {
        self.no_geometry = no_geometry;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vlayer_core::{DataType, Field, Geometry, Value};

    fn fields() -> Fields {
        Fields::from_fields(vec![
            Field::provider("a", DataType::Int32, 0),
            Field::provider("b", DataType::String, 1),
            Field::provider("c", DataType::Int32, 2),
        ])
        .unwrap()
    }

    #[test]
    fn test_builder_defaults() {
        let req = FeatureRequest::new();
        assert_eq!(req.filter(), &Filter::None);
        assert_eq!(req.subset(), None);
        assert_eq!(req.limit(), None);
        assert!(!req.no_geometry());
        assert_eq!(req.simplify(), SimplifyMethod::None);
        assert!(req.wants_attribute(5));
    }

    #[test]
    fn test_subset_sorted() {
        let req = FeatureRequest::new().with_subset_of_attributes([2, 0, 2]);
        assert_eq!(req.subset(), Some(&[0, 2][..]));
        assert!(req.wants_attribute(2));
        assert!(!req.wants_attribute(1));

        let req = FeatureRequest::new().with_subset_of_names(["C", "nope"], &fields());
        assert_eq!(req.subset(), Some(&[2][..]));
    }

    #[test]
    fn test_accept_feature() {
        let fields = fields();
        let feature = Feature::with_geometry(
            4,
            vec![Value::Int32(10), Value::String("x".into()), Value::Null],
            Geometry::point(1.0, 1.0),
        );

        assert!(FeatureRequest::new().accept_feature(&feature, &fields));
        assert!(FeatureRequest::new().with_filter_fid(4).accept_feature(&feature, &fields));
        assert!(!FeatureRequest::new().with_filter_fid(5).accept_feature(&feature, &fields));
        assert!(FeatureRequest::new()
            .with_filter_fids([1, 4])
            .accept_feature(&feature, &fields));
        assert!(FeatureRequest::new()
            .with_filter_expression(Expr::gt(Expr::column("a"), Expr::literal(5)))
            .accept_feature(&feature, &fields));
        assert!(!FeatureRequest::new()
            .with_filter_expression(Expr::gt(Expr::column("c"), Expr::literal(5)))
            .accept_feature(&feature, &fields));
        assert!(FeatureRequest::new()
            .with_filter_rect(Rect::new(0.0, 0.0, 2.0, 2.0))
            .accept_feature(&feature, &fields));

        let no_geom = Feature::new(4, vec![]);
        assert!(!FeatureRequest::new()
            .with_filter_rect(Rect::new(0.0, 0.0, 2.0, 2.0))
            .accept_feature(&no_geom, &fields));
    }

    #[test]
    fn test_referenced_attributes() {
        let req = FeatureRequest::new()
            .with_filter_expression(Expr::eq(Expr::column("c"), Expr::column("missing")))
            .add_order_by(OrderByClause::asc(Expr::column("a")))
            .add_order_by(OrderByClause::desc(Expr::column("c")));
        assert_eq!(req.referenced_attributes(&fields()), vec![0, 2]);
    }

    #[test]
    fn test_simplify_method_serde() {
        let json = serde_json::to_string(&SimplifyMethod::Distance { tolerance: 0.5 }).unwrap();
        assert_eq!(json, r#"{"method":"distance","tolerance":0.5}"#);
        let back: SimplifyMethod = serde_json::from_str(r#"{"method":"none"}"#).unwrap();
        assert_eq!(back, SimplifyMethod::None);
    }
}
