//! Abstract feature iterator protocol.
//!
//! Concrete iterators implement [`FetchFeatures`]. They are wrapped in a
//! [`FeatureIterator`], a shared handle that owns the generic part of the
//! protocol:
//!
//! - the request limit,
//! - filters the concrete iterator does not apply itself (id sets, and
//!   expressions unless [`FetchFeatures::filters_natively`]),
//! - local geometry simplification when the concrete iterator cannot simplify,
//! - order-by materialization when the concrete iterator cannot sort.
//!
//! Dropping the last handle closes the concrete iterator.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use vlayer_core::{Feature, Fields, Result, Value};

use crate::ast::{compare_sort_keys, OrderByClause};
use crate::request::{FeatureRequest, Filter, SimplifyMethod};

/// Callback polled during long-running drains; returns true to stop.
pub type InterruptionChecker = Arc<dyn Fn() -> bool + Send + Sync>;

/// A concrete source of features for one request.
pub trait FetchFeatures {
    /// Returns the next candidate feature, or None when exhausted.
    ///
    /// Requests filtered by a single id or by a rectangle must be honored here.
    /// Id sets and expressions may return a superset.
    fn fetch_feature(&mut self) -> Result<Option<Feature>>;

    /// Restarts from the first feature. Returns false if not possible.
    fn rewind(&mut self) -> bool;

    /// Releases resources. Returns false if already closed.
    fn close(&mut self) -> bool;

    /// Schema of the features this iterator returns.
    fn fields(&self) -> &Fields;

    /// Asks the iterator to simplify geometries itself.
    fn prepare_simplification(&mut self, _method: SimplifyMethod) -> bool {
        false
    }

    /// Asks the iterator to return features in the given order.
    fn prepare_order_by(&mut self, _clauses: &[OrderByClause]) -> bool {
        false
    }

    /// Returns true if expression filters are already applied by `fetch_feature`.
    fn filters_natively(&self) -> bool {
        false
    }

    fn set_interruption_checker(&mut self, _checker: Option<InterruptionChecker>) {}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum IteratorState {
    /// Nothing fetched yet.
    Ready,
    Fetching,
    /// Serving from the order-by buffer.
    Replaying,
    Closed,
}

struct IteratorCore {
    source: Box<dyn FetchFeatures>,
    request: FeatureRequest,
    state: IteratorState,
    fetched: usize,
    local_simplify: Option<f64>,
    buffer: Vec<Feature>,
    replay_pos: usize,
    checker: Option<InterruptionChecker>,
}

impl IteratorCore {
    fn next_feature(&mut self) -> Result<Option<Feature>> {
        if self.state == IteratorState::Closed {
            return Ok(None);
        }
        if self.state == IteratorState::Ready {
            self.setup()?;
        }
        if let Some(limit) = self.request.limit() {
            if self.fetched >= limit {
                return Ok(None);
            }
        }

        let next = if self.state == IteratorState::Replaying {
            let f = self.buffer.get(self.replay_pos).cloned();
            if f.is_some() {
                self.replay_pos += 1;
            }
            f
        } else {
            self.fetch_filtered()?
        };

        if next.is_some() {
            self.fetched += 1;
        }
        Ok(next)
    }

    fn setup(&mut self) -> Result<()> {
        self.state = IteratorState::Fetching;

        if let SimplifyMethod::Distance { tolerance } = self.request.simplify() {
            if !self.request.no_geometry()
                && !self.source.prepare_simplification(self.request.simplify())
            {
                self.local_simplify = Some(tolerance);
            }
        }

        if !self.request.order_by().is_empty()
            && !self.source.prepare_order_by(self.request.order_by())
        {
            self.materialize_order_by()?;
        }
        Ok(())
    }

    /// Drains the source ignoring the limit, sorts, and switches to replay.
    fn materialize_order_by(&mut self) -> Result<()> {
        let clauses = self.request.order_by().to_vec();
        let mut keyed: Vec<(Vec<Value>, Feature)> = Vec::new();
        let mut canceled = false;

        loop {
            if self.checker.as_ref().map_or(false, |c| c()) {
                canceled = true;
                break;
            }
            let feature = match self.fetch_filtered()? {
                Some(f) => f,
                None => break,
            };
            let fields = self.source.fields();
            let keys = clauses
                .iter()
                .map(|c| c.sort_key(fields, &feature))
                .collect();
            keyed.push((keys, feature));
        }

        // sort_by is stable: equal keys keep fetch order
        keyed.sort_by(|a, b| compare_sort_keys(&clauses, &a.0, &b.0));

        tracing::debug!(
            buffered = keyed.len(),
            canceled,
            clauses = clauses.len(),
            "materialized order by"
        );

        self.buffer = keyed.into_iter().map(|(_, f)| f).collect();
        self.replay_pos = 0;
        self.fetched = 0;
        self.state = IteratorState::Replaying;
        Ok(())
    }

    fn fetch_filtered(&mut self) -> Result<Option<Feature>> {
        loop {
            let mut feature = match self.source.fetch_feature()? {
                Some(f) => f,
                None => return Ok(None),
            };
            let keep = match self.request.filter() {
                Filter::Fids(ids) => ids.contains(&feature.id()),
                Filter::Expression(expr) if !self.source.filters_natively() => {
                    expr.evaluate_predicate(self.source.fields(), &feature)
                }
                _ => true,
            };
            if !keep {
                continue;
            }
            if let Some(tolerance) = self.local_simplify {
                let simplified = feature.geometry().map(|g| g.simplify(tolerance));
                if simplified.is_some() {
                    feature.set_geometry(simplified);
                }
            }
            return Ok(Some(feature));
        }
    }

    fn rewind(&mut self) -> bool {
        match self.state {
            IteratorState::Closed => false,
            IteratorState::Replaying => {
                self.replay_pos = 0;
                self.fetched = 0;
                true
            }
            IteratorState::Ready | IteratorState::Fetching => {
                self.fetched = 0;
                self.source.rewind()
            }
        }
    }

    fn close(&mut self) -> bool {
        if self.state == IteratorState::Closed {
            return false;
        }
        self.state = IteratorState::Closed;
        self.buffer.clear();
        self.source.close();
        true
    }
}

impl Drop for IteratorCore {
    fn drop(&mut self) {
        self.close();
    }
}

/// Shared handle to a feature iterator.
///
/// Cloning the handle shares the underlying iterator; both handles advance the
/// same cursor.
#[derive(Clone)]
pub struct FeatureIterator {
    core: Rc<RefCell<IteratorCore>>,
}

impl FeatureIterator {
    /// Wraps a concrete iterator serving `request`.
    pub fn new(source: impl FetchFeatures + 'static, request: FeatureRequest) -> Self {
        Self::from_boxed(Box::new(source), request)
    }

    pub fn from_boxed(source: Box<dyn FetchFeatures>, request: FeatureRequest) -> Self {
        Self {
            core: Rc::new(RefCell::new(IteratorCore {
                source,
                request,
                state: IteratorState::Ready,
                fetched: 0,
                local_simplify: None,
                buffer: Vec::new(),
                replay_pos: 0,
                checker: None,
            })),
        }
    }

    /// An iterator that returns nothing.
    pub fn empty(fields: Fields) -> Self {
        Self::new(EmptyIterator { fields }, FeatureRequest::new())
    }

    /// Returns the next feature; None when exhausted or the limit is reached.
    pub fn next_feature(&self) -> Result<Option<Feature>> {
        self.core.borrow_mut().next_feature()
    }

    pub fn rewind(&self) -> bool {
        self.core.borrow_mut().rewind()
    }

    pub fn close(&self) -> bool {
        self.core.borrow_mut().close()
    }

    pub fn is_closed(&self) -> bool {
        self.core.borrow().state == IteratorState::Closed
    }

    /// Installs a cancellation callback, also forwarded to the concrete iterator.
    pub fn set_interruption_checker(&self, checker: Option<InterruptionChecker>) {
        let mut core = self.core.borrow_mut();
        core.source.set_interruption_checker(checker.clone());
        core.checker = checker;
    }

    pub fn fields(&self) -> Fields {
        self.core.borrow().source.fields().clone()
    }

    pub fn request(&self) -> FeatureRequest {
        self.core.borrow().request.clone()
    }

    /// Collects every remaining feature.
    pub fn collect_features(&self) -> Result<Vec<Feature>> {
        let mut out = Vec::new();
        while let Some(f) = self.next_feature()? {
            out.push(f);
        }
        Ok(out)
    }
}

impl Iterator for FeatureIterator {
    type Item = Result<Feature>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_feature().transpose()
    }
}

impl fmt::Debug for FeatureIterator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = self.core.borrow();
        f.debug_struct("FeatureIterator")
            .field("state", &core.state)
            .field("fetched", &core.fetched)
            .finish()
    }
}

struct EmptyIterator {
    fields: Fields,
}

impl FetchFeatures for EmptyIterator {
    fn fetch_feature(&mut self) -> Result<Option<Feature>> {
        Ok(None)
    }

    fn rewind(&mut self) -> bool {
        true
    }

    fn close(&mut self) -> bool {
        true
    }

    fn fields(&self) -> &Fields {
        &self.fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Expr;
    use std::cell::Cell;
    use vlayer_core::{DataType, Field, Geometry};

    struct VecIterator {
        fields: Fields,
        features: Vec<Feature>,
        pos: usize,
        closed: Rc<Cell<bool>>,
    }

    impl FetchFeatures for VecIterator {
        fn fetch_feature(&mut self) -> Result<Option<Feature>> {
            let f = self.features.get(self.pos).cloned();
            self.pos += 1;
            Ok(f)
        }

        fn rewind(&mut self) -> bool {
            self.pos = 0;
            true
        }

        fn close(&mut self) -> bool {
            self.closed.set(true);
            true
        }

        fn fields(&self) -> &Fields {
            &self.fields
        }
    }

    fn make(values: &[i32], request: FeatureRequest) -> (FeatureIterator, Rc<Cell<bool>>) {
        let closed = Rc::new(Cell::new(false));
        let fields = Fields::from_fields(vec![Field::provider("v", DataType::Int32, 0)]).unwrap();
        let features = values
            .iter()
            .enumerate()
            .map(|(i, v)| {
                Feature::with_geometry(
                    i as i64,
                    vec![Value::Int32(*v)],
                    Geometry::line_string([(0.0, 0.0), (1.0, 0.01), (2.0, 0.0)]),
                )
            })
            .collect();
        let source = VecIterator {
            fields,
            features,
            pos: 0,
            closed: closed.clone(),
        };
        (FeatureIterator::new(source, request), closed)
    }

    fn values(it: &FeatureIterator) -> Vec<i32> {
        it.collect_features()
            .unwrap()
            .iter()
            .map(|f| f.attribute(0).and_then(Value::as_i32).unwrap())
            .collect()
    }

    #[test]
    fn test_limit() {
        let (it, _) = make(&[1, 2, 3, 4], FeatureRequest::new().with_limit(2));
        assert_eq!(values(&it), vec![1, 2]);
        assert_eq!(it.next_feature().unwrap(), None);
    }

    #[test]
    fn test_expression_filter_applied() {
        let request = FeatureRequest::new()
            .with_filter_expression(Expr::gt(Expr::column("v"), Expr::literal(2)));
        let (it, _) = make(&[1, 5, 2, 3], request);
        assert_eq!(values(&it), vec![5, 3]);
    }

    #[test]
    fn test_fid_set_filter_applied() {
        let (it, _) = make(&[10, 20, 30], FeatureRequest::new().with_filter_fids([0, 2]));
        assert_eq!(values(&it), vec![10, 30]);
    }

    #[test]
    fn test_order_by_fallback() {
        let request = FeatureRequest::new()
            .add_order_by(OrderByClause::desc(Expr::column("v")))
            .with_limit(3);
        let (it, _) = make(&[3, 9, 1, 7, 5], request);
        assert_eq!(values(&it), vec![9, 7, 5]);

        // rewinding replays from the start of the sorted buffer
        assert!(it.rewind());
        assert_eq!(values(&it), vec![9, 7, 5]);
    }

    #[test]
    fn test_order_by_canceled_keeps_buffer() {
        let request = FeatureRequest::new().add_order_by(OrderByClause::asc(Expr::column("v")));
        let (it, _) = make(&[3, 1, 2], request);
        it.set_interruption_checker(Some(Arc::new(|| true)));
        assert_eq!(values(&it), Vec::<i32>::new());
    }

    #[test]
    fn test_local_simplification() {
        let request =
            FeatureRequest::new().with_simplify(SimplifyMethod::Distance { tolerance: 1.0 });
        let (it, _) = make(&[1], request);
        let f = it.next_feature().unwrap().unwrap();
        assert_eq!(f.geometry().unwrap().vertex_count(), 2);
    }

    #[test]
    fn test_rewind_and_close() {
        let (it, closed) = make(&[1, 2], FeatureRequest::new().with_limit(1));
        assert_eq!(values(&it), vec![1]);
        assert!(it.rewind());
        assert_eq!(values(&it), vec![1]);
        assert!(it.close());
        assert!(closed.get());
        assert!(!it.close());
        assert!(!it.rewind());
        assert_eq!(it.next_feature().unwrap(), None);
    }

    #[test]
    fn test_drop_last_handle_closes() {
        let (it, closed) = make(&[1], FeatureRequest::new());
        let second = it.clone();
        drop(it);
        assert!(!closed.get());
        assert_eq!(second.next_feature().unwrap().map(|f| f.id()), Some(0));
        drop(second);
        assert!(closed.get());
    }

    #[test]
    fn test_std_iterator() {
        let (it, _) = make(&[4, 5], FeatureRequest::new());
        let ids: Vec<i64> = it.map(|f| f.unwrap().id()).collect();
        assert_eq!(ids, vec![0, 1]);
    }

    #[test]
    fn test_empty() {
        let it = FeatureIterator::empty(Fields::new());
        assert_eq!(it.next_feature().unwrap(), None);
    }
}
