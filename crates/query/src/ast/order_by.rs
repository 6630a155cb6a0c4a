//! Order-by clauses.

use std::cmp::Ordering;
use std::fmt;

use vlayer_core::{Feature, Fields, Value};

use super::Expr;

/// One ordering key of a request.
#[derive(Clone, Debug, PartialEq)]
pub struct OrderByClause {
    expr: Expr,
    ascending: bool,
    nulls_first: bool,
}

impl OrderByClause {
    /// Creates a clause. Nulls go last when ascending and first when descending.
    pub fn new(expr: Expr, ascending: bool) -> Self {
        Self {
            expr,
            ascending,
            nulls_first: !ascending,
        }
    }

    pub fn asc(expr: Expr) -> Self {
        Self::new(expr, true)
    }

    pub fn desc(expr: Expr) -> Self {
        Self::new(expr, false)
    }

    pub fn with_nulls_first(mut self, nulls_first: bool) -> Self {
        self.nulls_first = nulls_first;
        self
    }

    #[inline]
    pub fn expr(&self) -> &Expr {
        &self.expr
    }

    #[inline]
    pub fn ascending(&self) -> bool {
        self.ascending
    }

    #[inline]
    pub fn nulls_first(&self) -> bool {
        self.nulls_first
    }

    /// Evaluates this clause's key for a feature.
    pub fn sort_key(&self, fields: &Fields, feature: &Feature) -> Value {
        self.expr.evaluate(fields, feature)
    }

    fn compare(&self, a: &Value, b: &Value) -> Ordering {
        match (a.is_null(), b.is_null()) {
            (true, true) => Ordering::Equal,
            (true, false) if self.nulls_first => Ordering::Less,
            (true, false) => Ordering::Greater,
            (false, true) if self.nulls_first => Ordering::Greater,
            (false, true) => Ordering::Less,
            (false, false) => {
                let cmp = a.cmp(b);
                if self.ascending {
                    cmp
                } else {
                    cmp.reverse()
                }
            }
        }
    }
}

/// Compares two key tuples clause by clause.
///
/// Missing keys compare equal, so tuples built from the same clause list are
/// always fully compared.
pub fn compare_sort_keys(clauses: &[OrderByClause], a: &[Value], b: &[Value]) -> Ordering {
    for (i, clause) in clauses.iter().enumerate() {
        let cmp = match (a.get(i), b.get(i)) {
            (Some(av), Some(bv)) => clause.compare(av, bv),
            _ => Ordering::Equal,
        };
        if cmp != Ordering::Equal {
            return cmp;
        }
    }
    Ordering::Equal
}

impl fmt::Display for OrderByClause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} NULLS {}",
            self.expr,
            if self.ascending { "ASC" } else { "DESC" },
            if self.nulls_first { "FIRST" } else { "LAST" }
        )
    }
}
