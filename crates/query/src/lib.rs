//! vlayer Query - Requests, expressions and the feature iterator protocol.
//!
//! This crate provides:
//!
//! - `ast`: Expression AST and order-by clauses
//! - `eval`: SQL-style expression evaluation against a feature
//! - `request`: Feature requests (filter, attribute subset, ordering, limit)
//! - `iterator`: The abstract feature iterator protocol and shared iterator handle
//! - `provider`: Data provider interface
//! - `memory`: In-memory data provider
//! - `fingerprint`: Stable request fingerprints

pub mod ast;
pub mod eval;
pub mod fingerprint;
pub mod iterator;
pub mod memory;
pub mod provider;
pub mod request;

pub use ast::{BinaryOp, Expr, OrderByClause, UnaryOp};
pub use fingerprint::request_fingerprint;
pub use iterator::{FeatureIterator, FetchFeatures, InterruptionChecker};
pub use memory::MemoryProvider;
pub use provider::{DataProvider, FeatureSource};
pub use request::{FeatureRequest, Filter, SimplifyMethod};
