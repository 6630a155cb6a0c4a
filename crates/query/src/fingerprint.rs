//! Request fingerprints.
//!
//! Two requests with the same fingerprint select the same features in the
//! same order. Attribute subsets, geometry flags and simplification do not
//! change which features are returned, so they do not participate.

use std::hash::Hasher;

use crate::request::{FeatureRequest, Filter};

/// FNV-1a, stable across runs and platforms.
struct FnvHasher {
    state: u64,
}

impl FnvHasher {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;

    fn new() -> Self {
        Self {
            state: Self::FNV_OFFSET,
        }
    }
}

impl Hasher for FnvHasher {
    fn finish(&self) -> u64 {
        self.state
    }

    fn write(&mut self, bytes: &[u8]) {
        for byte in bytes {
            self.state ^= *byte as u64;
            self.state = self.state.wrapping_mul(Self::FNV_PRIME);
        }
    }
}

/// Computes the result-set fingerprint of a request.
pub fn request_fingerprint(request: &FeatureRequest) -> u64 {
    let mut hasher = FnvHasher::new();
    match request.filter() {
        Filter::None => hasher.write(b"none"),
        Filter::Fid(id) => {
            hasher.write(b"fid");
            hasher.write_i64(*id);
        }
        Filter::Fids(ids) => {
            hasher.write(b"fids");
            let mut sorted: Vec<i64> = ids.iter().copied().collect();
            sorted.sort_unstable();
            for id in sorted {
                hasher.write_i64(id);
            }
        }
        Filter::Expression(expr) => {
            hasher.write(b"expr");
            hasher.write(expr.to_string().as_bytes());
        }
        Filter::Rect(rect) => {
            hasher.write(b"rect");
            for v in [rect.xmin, rect.ymin, rect.xmax, rect.ymax] {
                hasher.write_u64(v.to_bits());
            }
        }
    }
    for clause in request.order_by() {
        hasher.write(b"order");
        hasher.write(clause.to_string().as_bytes());
    }
    match request.limit() {
        Some(limit) => {
            hasher.write(b"limit");
            hasher.write_usize(limit);
        }
        None => hasher.write(b"unlimited"),
    }
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Expr, OrderByClause};
    use vlayer_core::Rect;

    #[test]
    fn test_same_request_same_fingerprint() {
        let a = FeatureRequest::new()
            .with_filter_expression(Expr::gt(Expr::column("x"), Expr::literal(5)))
            .with_limit(10);
        let b = a.clone().with_subset_of_attributes([0]).with_no_geometry(true);
        assert_eq!(request_fingerprint(&a), request_fingerprint(&b));
    }

    #[test]
    fn test_fid_set_order_irrelevant() {
        let a = FeatureRequest::new().with_filter_fids([3, 1, 2]);
        let b = FeatureRequest::new().with_filter_fids([1, 2, 3]);
        assert_eq!(request_fingerprint(&a), request_fingerprint(&b));
    }

    #[test]
    fn test_different_requests() {
        let base = FeatureRequest::new();
        let fingerprints = [
            request_fingerprint(&base),
            request_fingerprint(&base.clone().with_filter_fid(1)),
            request_fingerprint(&base.clone().with_filter_fid(2)),
            request_fingerprint(&base.clone().with_limit(5)),
            request_fingerprint(&base.clone().with_filter_rect(Rect::new(0.0, 0.0, 1.0, 1.0))),
            request_fingerprint(&base.clone().add_order_by(OrderByClause::asc(Expr::column("x")))),
            request_fingerprint(&base.clone().add_order_by(OrderByClause::desc(Expr::column("x")))),
        ];
        for i in 0..fingerprints.len() {
            for j in i + 1..fingerprints.len() {
                assert_ne!(fingerprints[i], fingerprints[j], "{} vs {}", i, j);
            }
        }
    }
}
