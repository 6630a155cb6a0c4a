//! Expression evaluation against a feature.
//!
//! Evaluation follows SQL three-valued logic: comparisons and arithmetic with
//! a NULL operand yield NULL, `AND`/`OR` short-circuit on a decided operand,
//! and a predicate whose value is NULL does not match.

use std::cmp::Ordering;

use vlayer_core::{Feature, Fields, Value};

use crate::ast::{BinaryOp, Expr, UnaryOp};

impl Expr {
    /// Evaluates this expression for `feature`, resolving field names in `fields`.
    pub fn evaluate(&self, fields: &Fields, feature: &Feature) -> Value {
        Evaluator::new(fields, feature).eval_expr(self)
    }

    /// Evaluates this expression as a filter. NULL does not match.
    pub fn evaluate_predicate(&self, fields: &Fields, feature: &Feature) -> bool {
        Evaluator::new(fields, feature).eval_predicate(self)
    }
}

/// Evaluation context binding a schema to one feature.
pub struct Evaluator<'a> {
    fields: &'a Fields,
    feature: &'a Feature,
}

impl<'a> Evaluator<'a> {
    pub fn new(fields: &'a Fields, feature: &'a Feature) -> Self {
        Self { fields, feature }
    }

    pub fn eval_expr(&self, expr: &Expr) -> Value {
        match expr {
            Expr::Column(name) => self
                .fields
                .lookup(name)
                .and_then(|i| self.feature.attribute(i))
                .cloned()
                .unwrap_or(Value::Null),

            Expr::Literal(value) => value.clone(),

            Expr::FeatureId => Value::Int64(self.feature.id()),

            Expr::BinaryOp { left, op, right } => {
                let left_val = self.eval_expr(left);
                // AND/OR are decided by a single operand
                match (op, truth_value(&left_val)) {
                    (BinaryOp::And, Some(false)) => return Value::Boolean(false),
                    (BinaryOp::Or, Some(true)) => return Value::Boolean(true),
                    _ => {}
                }
                let right_val = self.eval_expr(right);
                eval_binary_op(*op, &left_val, &right_val)
            }

            Expr::UnaryOp { op, expr } => eval_unary_op(*op, &self.eval_expr(expr)),

            Expr::Function { name, args } => {
                let arg_values: Vec<Value> = args.iter().map(|a| self.eval_expr(a)).collect();
                self.eval_function(name, &arg_values)
            }

            Expr::Between { expr, low, high } => self.eval_between(expr, low, high),

            Expr::NotBetween { expr, low, high } => {
                eval_unary_op(UnaryOp::Not, &self.eval_between(expr, low, high))
            }

            Expr::In { expr, list } => self.eval_in(expr, list),

            Expr::NotIn { expr, list } => eval_unary_op(UnaryOp::Not, &self.eval_in(expr, list)),

            Expr::Like {
                expr,
                pattern,
                case_insensitive,
            } => self.eval_like(expr, pattern, *case_insensitive),

            Expr::NotLike {
                expr,
                pattern,
                case_insensitive,
            } => eval_unary_op(
                UnaryOp::Not,
                &self.eval_like(expr, pattern, *case_insensitive),
            ),
        }
    }

    #[inline]
    pub fn eval_predicate(&self, expr: &Expr) -> bool {
        truth_value(&self.eval_expr(expr)).unwrap_or(false)
    }

    fn eval_between(&self, expr: &Expr, low: &Expr, high: &Expr) -> Value {
        let val = self.eval_expr(expr);
        let low_val = self.eval_expr(low);
        let high_val = self.eval_expr(high);
        match (compare_values(&val, &low_val), compare_values(&val, &high_val)) {
            (Some(lo), Some(hi)) => Value::Boolean(lo != Ordering::Less && hi != Ordering::Greater),
            _ => Value::Null,
        }
    }

    fn eval_in(&self, expr: &Expr, list: &[Expr]) -> Value {
        let val = self.eval_expr(expr);
        if val.is_null() {
            return Value::Null;
        }
        let mut saw_null = false;
        for item in list {
            match compare_values(&val, &self.eval_expr(item)) {
                Some(Ordering::Equal) => return Value::Boolean(true),
                None => saw_null = true,
                Some(_) => {}
            }
        }
        if saw_null {
            Value::Null
        } else {
            Value::Boolean(false)
        }
    }

    fn eval_like(&self, expr: &Expr, pattern: &str, case_insensitive: bool) -> Value {
        let val = self.eval_expr(expr);
        let text = match &val {
            Value::Null => return Value::Null,
            Value::String(s) => s.clone(),
            other => other.to_key_string(),
        };
        if case_insensitive {
            Value::Boolean(match_like(&text.to_lowercase(), &pattern.to_lowercase()))
        } else {
            Value::Boolean(match_like(&text, pattern))
        }
    }

    fn eval_function(&self, name: &str, args: &[Value]) -> Value {
        let geometry = self.feature.geometry();
        match name.to_lowercase().as_str() {
            "abs" => match args.first() {
                Some(Value::Int32(i)) => i.checked_abs().map(Value::Int32).unwrap_or(Value::Null),
                Some(Value::Int64(i)) => i.checked_abs().map(Value::Int64).unwrap_or(Value::Null),
                Some(Value::Float64(f)) => Value::Float64(f.abs()),
                _ => Value::Null,
            },
            "upper" => match args.first() {
                Some(Value::String(s)) => Value::String(s.to_uppercase()),
                _ => Value::Null,
            },
            "lower" => match args.first() {
                Some(Value::String(s)) => Value::String(s.to_lowercase()),
                _ => Value::Null,
            },
            "length" => match args.first() {
                Some(Value::String(s)) => Value::Int64(s.chars().count() as i64),
                _ => Value::Null,
            },
            "coalesce" => args
                .iter()
                .find(|a| !a.is_null())
                .cloned()
                .unwrap_or(Value::Null),
            "concat" => Value::String(
                args.iter()
                    .filter(|a| !a.is_null())
                    .map(text_of)
                    .collect(),
            ),
            "round" => {
                let x = match args.first().and_then(numeric) {
                    Some(x) => x,
                    None => return Value::Null,
                };
                match args.get(1) {
                    None => Value::Int64(libm::round(x) as i64),
                    Some(places) => match places.to_i64() {
                        Some(p) => {
                            let scale = libm::pow(10.0, p as f64);
                            Value::Float64(libm::round(x * scale) / scale)
                        }
                        None => Value::Null,
                    },
                }
            }
            "$area" => geometry.map_or(Value::Null, |g| Value::Float64(g.area())),
            "$length" => geometry.map_or(Value::Null, |g| Value::Float64(g.length())),
            "$perimeter" => geometry.map_or(Value::Null, |g| Value::Float64(g.perimeter())),
            "$x" => geometry
                .and_then(|g| g.as_point())
                .map_or(Value::Null, |c| Value::Float64(c.x)),
            "$y" => geometry
                .and_then(|g| g.as_point())
                .map_or(Value::Null, |c| Value::Float64(c.y)),
            _ => Value::Null,
        }
    }
}

/// Boolean reading of a value: NULL and non-numeric values are unknown.
pub fn truth_value(value: &Value) -> Option<bool> {
    match value {
        Value::Boolean(b) => Some(*b),
        Value::Int32(_) | Value::Int64(_) | Value::Float64(_) => value.to_f64().map(|v| v != 0.0),
        _ => None,
    }
}

fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::String(s) => s.trim().parse::<f64>().ok(),
        other => other.to_f64(),
    }
}

fn text_of(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_key_string(),
    }
}

/// Compares two values with SQL semantics. None if either side is NULL.
///
/// A string compared with a number is compared numerically when it parses as
/// one, and textually otherwise.
pub fn compare_values(left: &Value, right: &Value) -> Option<Ordering> {
    if left.is_null() || right.is_null() {
        return None;
    }
    let mixed = matches!(
        (left, right),
        (Value::String(_), Value::Int32(_) | Value::Int64(_) | Value::Float64(_))
            | (Value::Int32(_) | Value::Int64(_) | Value::Float64(_), Value::String(_))
    );
    if mixed {
        return Some(match (numeric(left), numeric(right)) {
            (Some(l), Some(r)) => Value::Float64(l).cmp(&Value::Float64(r)),
            _ => text_of(left).cmp(&text_of(right)),
        });
    }
    Some(left.cmp(right))
}

fn eval_binary_op(op: BinaryOp, left: &Value, right: &Value) -> Value {
    match op {
        BinaryOp::And => {
            return match (truth_value(left), truth_value(right)) {
                (Some(false), _) | (_, Some(false)) => Value::Boolean(false),
                (Some(true), Some(true)) => Value::Boolean(true),
                _ => Value::Null,
            }
        }
        BinaryOp::Or => {
            return match (truth_value(left), truth_value(right)) {
                (Some(true), _) | (_, Some(true)) => Value::Boolean(true),
                (Some(false), Some(false)) => Value::Boolean(false),
                _ => Value::Null,
            }
        }
        _ => {}
    }

    if left.is_null() || right.is_null() {
        return Value::Null;
    }

    match op {
        BinaryOp::Eq => compare_values(left, right)
            .map_or(Value::Null, |o| Value::Boolean(o == Ordering::Equal)),
        BinaryOp::Ne => compare_values(left, right)
            .map_or(Value::Null, |o| Value::Boolean(o != Ordering::Equal)),
        BinaryOp::Lt => compare_values(left, right)
            .map_or(Value::Null, |o| Value::Boolean(o == Ordering::Less)),
        BinaryOp::Le => compare_values(left, right)
            .map_or(Value::Null, |o| Value::Boolean(o != Ordering::Greater)),
        BinaryOp::Gt => compare_values(left, right)
            .map_or(Value::Null, |o| Value::Boolean(o == Ordering::Greater)),
        BinaryOp::Ge => compare_values(left, right)
            .map_or(Value::Null, |o| Value::Boolean(o != Ordering::Less)),
        BinaryOp::Add => eval_arithmetic(left, right, i64::checked_add, |a, b| a + b),
        BinaryOp::Sub => eval_arithmetic(left, right, i64::checked_sub, |a, b| a - b),
        BinaryOp::Mul => eval_arithmetic(left, right, i64::checked_mul, |a, b| a * b),
        BinaryOp::Div => match numeric(right) {
            Some(r) if r != 0.0 => numeric(left).map_or(Value::Null, |l| Value::Float64(l / r)),
            _ => Value::Null,
        },
        BinaryOp::Mod => match numeric(right) {
            Some(r) if r != 0.0 => eval_arithmetic(left, right, i64::checked_rem, |a, b| a % b),
            _ => Value::Null,
        },
        BinaryOp::Concat => {
            let mut s = text_of(left);
            s.push_str(&text_of(right));
            Value::String(s)
        }
        // decided above
        BinaryOp::And | BinaryOp::Or => Value::Null,
    }
}

/// Integer operands keep an integer result (Int32 when both are Int32 and it
/// fits); anything else, or integer overflow, falls back to Float64.
fn eval_arithmetic<I, F>(left: &Value, right: &Value, int_op: I, float_op: F) -> Value
where
    I: Fn(i64, i64) -> Option<i64>,
    F: Fn(f64, f64) -> f64,
{
    let is_int = |v: &Value| matches!(v, Value::Int32(_) | Value::Int64(_));
    if is_int(left) && is_int(right) {
        if let (Some(l), Some(r)) = (left.to_i64(), right.to_i64()) {
            if let Some(result) = int_op(l, r) {
                let both_i32 = matches!((left, right), (Value::Int32(_), Value::Int32(_)));
                return match i32::try_from(result) {
                    Ok(small) if both_i32 => Value::Int32(small),
                    _ => Value::Int64(result),
                };
            }
        }
    }
    match (numeric(left), numeric(right)) {
        (Some(l), Some(r)) => Value::Float64(float_op(l, r)),
        _ => Value::Null,
    }
}

fn eval_unary_op(op: UnaryOp, value: &Value) -> Value {
    match op {
        UnaryOp::Not => truth_value(value).map_or(Value::Null, |b| Value::Boolean(!b)),
        UnaryOp::Neg => match value {
            Value::Int32(i) => i.checked_neg().map_or(Value::Null, Value::Int32),
            Value::Int64(i) => i.checked_neg().map_or(Value::Null, Value::Int64),
            Value::Float64(f) => Value::Float64(-f),
            _ => Value::Null,
        },
        UnaryOp::IsNull => Value::Boolean(value.is_null()),
        UnaryOp::IsNotNull => Value::Boolean(!value.is_null()),
    }
}

/// SQL LIKE matching: `%` matches any run of characters, `_` exactly one.
pub fn match_like(value: &str, pattern: &str) -> bool {
    let v: Vec<char> = value.chars().collect();
    let p: Vec<char> = pattern.chars().collect();
    let (mut vi, mut pi) = (0usize, 0usize);
    // Position of the last `%` and the value index it is currently absorbing up to
    let mut backtrack: Option<(usize, usize)> = None;

    while vi < v.len() {
        if pi < p.len() && p[pi] == '%' {
            backtrack = Some((pi, vi));
            pi += 1;
        } else if pi < p.len() && (p[pi] == '_' || p[pi] == v[vi]) {
            vi += 1;
            pi += 1;
        } else if let Some((star_p, star_v)) = backtrack {
            pi = star_p + 1;
            vi = star_v + 1;
            backtrack = Some((star_p, star_v + 1));
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '%' {
        pi += 1;
    }
    pi == p.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use vlayer_core::{DataType, Field, Geometry};

    fn fields() -> Fields {
        Fields::from_fields(vec![
            Field::provider("x", DataType::Int32, 0),
            Field::provider("name", DataType::String, 1),
            Field::provider("score", DataType::Float64, 2),
        ])
        .unwrap()
    }

    fn feature() -> Feature {
        Feature::with_geometry(
            7,
            vec![Value::Int32(6), Value::String("Alice".into()), Value::Null],
            Geometry::point(3.0, 4.0),
        )
    }

    fn eval(expr: &Expr) -> Value {
        expr.evaluate(&fields(), &feature())
    }

    #[test]
    fn test_column_and_id() {
        assert_eq!(eval(&Expr::column("x")), Value::Int32(6));
        assert_eq!(eval(&Expr::column("NAME")), Value::String("Alice".into()));
        assert_eq!(eval(&Expr::column("missing")), Value::Null);
        assert_eq!(eval(&Expr::feature_id()), Value::Int64(7));
    }

    #[test]
    fn test_comparison() {
        assert_eq!(eval(&Expr::gt(Expr::column("x"), Expr::literal(5))), Value::Boolean(true));
        assert_eq!(eval(&Expr::eq(Expr::column("x"), Expr::literal(6.0))), Value::Boolean(true));
        assert_eq!(eval(&Expr::eq(Expr::column("x"), Expr::literal("6"))), Value::Boolean(true));
        assert_eq!(eval(&Expr::gt(Expr::column("score"), Expr::literal(1))), Value::Null);
    }

    #[test]
    fn test_three_valued_logic() {
        let null_cmp = Expr::gt(Expr::column("score"), Expr::literal(1));
        let t = Expr::literal(true);
        let f = Expr::literal(false);
        assert_eq!(eval(&Expr::and(null_cmp.clone(), f.clone())), Value::Boolean(false));
        assert_eq!(eval(&Expr::and(null_cmp.clone(), t.clone())), Value::Null);
        assert_eq!(eval(&Expr::or(null_cmp.clone(), t)), Value::Boolean(true));
        assert_eq!(eval(&Expr::or(null_cmp.clone(), f)), Value::Null);
        assert_eq!(eval(&Expr::not(null_cmp.clone())), Value::Null);
        assert!(!null_cmp.evaluate_predicate(&fields(), &feature()));
    }

    #[test]
    fn test_arithmetic() {
        let x = || Expr::column("x");
        assert_eq!(eval(&Expr::add(x(), Expr::literal(1))), Value::Int32(7));
        assert_eq!(eval(&Expr::add(x(), Expr::literal(1i64))), Value::Int64(7));
        assert_eq!(eval(&Expr::mul(x(), Expr::literal(0.5))), Value::Float64(3.0));
        assert_eq!(eval(&Expr::div(x(), Expr::literal(4))), Value::Float64(1.5));
        assert_eq!(eval(&Expr::div(x(), Expr::literal(0))), Value::Null);
        assert_eq!(
            eval(&Expr::binary(x(), BinaryOp::Mod, Expr::literal(4))),
            Value::Int32(2)
        );
        assert_eq!(
            eval(&Expr::add(Expr::literal(i64::MAX), Expr::literal(1i64))),
            Value::Float64(i64::MAX as f64 + 1.0)
        );
        assert_eq!(eval(&Expr::neg(x())), Value::Int32(-6));
    }

    #[test]
    fn test_between_in_like() {
        assert_eq!(
            eval(&Expr::between(Expr::column("x"), Expr::literal(1), Expr::literal(6))),
            Value::Boolean(true)
        );
        assert_eq!(
            eval(&Expr::not_between(Expr::column("x"), Expr::literal(1), Expr::literal(6))),
            Value::Boolean(false)
        );
        assert_eq!(
            eval(&Expr::in_list(Expr::column("x"), vec![Value::Int64(1), Value::Int64(6)])),
            Value::Boolean(true)
        );
        assert_eq!(
            eval(&Expr::not_in_list(Expr::column("x"), vec![Value::Int64(1), Value::Null])),
            Value::Null
        );
        assert_eq!(eval(&Expr::like(Expr::column("name"), "A%e")), Value::Boolean(true));
        assert_eq!(eval(&Expr::like(Expr::column("name"), "a%")), Value::Boolean(false));
        assert_eq!(eval(&Expr::ilike(Expr::column("name"), "a_ice")), Value::Boolean(true));
        assert_eq!(eval(&Expr::like(Expr::column("score"), "%")), Value::Null);
    }

    #[test]
    fn test_functions() {
        let f = |name: &str, args: Vec<Expr>| eval(&Expr::function(name, args));
        assert_eq!(f("abs", vec![Expr::literal(-3)]), Value::Int32(3));
        assert_eq!(f("UPPER", vec![Expr::column("name")]), Value::String("ALICE".into()));
        assert_eq!(f("length", vec![Expr::column("name")]), Value::Int64(5));
        assert_eq!(
            f("coalesce", vec![Expr::column("score"), Expr::literal(2)]),
            Value::Int32(2)
        );
        assert_eq!(
            f("concat", vec![Expr::column("name"), Expr::null(), Expr::column("x")]),
            Value::String("Alice6".into())
        );
        assert_eq!(f("round", vec![Expr::literal(2.567), Expr::literal(2)]), Value::Float64(2.57));
        assert_eq!(f("round", vec![Expr::literal(2.5)]), Value::Int64(3));
        assert_eq!(f("$x", vec![]), Value::Float64(3.0));
        assert_eq!(f("$y", vec![]), Value::Float64(4.0));
        assert_eq!(f("$area", vec![]), Value::Float64(0.0));
        assert_eq!(f("nope", vec![]), Value::Null);
    }

    #[test]
    fn test_concat_operator() {
        assert_eq!(
            eval(&Expr::concat(Expr::column("name"), Expr::literal("!"))),
            Value::String("Alice!".into())
        );
        assert_eq!(eval(&Expr::concat(Expr::column("name"), Expr::null())), Value::Null);
    }

    #[test]
    fn test_match_like() {
        assert!(match_like("hello", "h%o"));
        assert!(match_like("hello", "_ello"));
        assert!(match_like("hello", "%"));
        assert!(match_like("", "%"));
        assert!(match_like("abcbc", "%bc"));
        assert!(!match_like("hello", "world"));
        assert!(!match_like("hello", "h_o"));
        assert!(!match_like("", "_"));
    }
}
