//! AST module for filter, order-by and computed-field expressions.

mod expr;
mod order_by;

pub use expr::{BinaryOp, Expr, UnaryOp};
pub use order_by::{compare_sort_keys, OrderByClause};
