//! Computed attributes.

use vlayer_core::{DataType, Feature, Field, FieldOrigin, Fields, Value};
use vlayer_query::Expr;

/// A virtual field whose value is computed per feature.
#[derive(Clone, Debug, PartialEq)]
pub struct ExpressionField {
    name: String,
    data_type: DataType,
    expr: Expr,
}

impl ExpressionField {
    pub fn new(name: impl Into<String>, data_type: DataType, expr: Expr) -> Self {
        Self {
            name: name.into(),
            data_type,
            expr,
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    #[inline]
    pub fn expr(&self) -> &Expr {
        &self.expr
    }

    /// Schema entry for the `index`-th expression field of a layer.
    pub fn field(&self, index: usize) -> Field {
        Field::new(
            self.name.clone(),
            self.data_type,
            FieldOrigin::Expression { index },
        )
    }

    /// Evaluates the expression and coerces the result to the field type.
    pub fn compute(&self, fields: &Fields, feature: &Feature) -> Value {
        let field = Field::new(self.name.clone(), self.data_type, FieldOrigin::Expression { index: 0 });
        field.convert_compatible(self.expr.evaluate(fields, feature))
    }

    /// Returns true if the expression reads the field called `name`.
    pub fn references(&self, name: &str) -> bool {
        self.expr
            .referenced_columns()
            .iter()
            .any(|c| c.eq_ignore_ascii_case(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_coerces() {
        let fields = Fields::from_fields(vec![Field::provider("x", DataType::Int32, 0)]).unwrap();
        let feature = Feature::new(1, vec![Value::Int32(7)]);
        let half = ExpressionField::new(
            "half",
            DataType::Int64,
            Expr::div(Expr::column("x"), Expr::literal(2)),
        );
        // division yields 3.5, rounded into the integer field
        assert_eq!(half.compute(&fields, &feature), Value::Int64(4));

        let label = ExpressionField::new(
            "label",
            DataType::String,
            Expr::concat(Expr::literal("#"), Expr::column("x")),
        );
        assert_eq!(label.compute(&fields, &feature), Value::from("#7"));
    }

    #[test]
    fn test_references() {
        let f = ExpressionField::new("d", DataType::Int32, Expr::add(Expr::column("A"), Expr::literal(1)));
        assert!(f.references("a"));
        assert!(!f.references("b"));
        assert_eq!(f.field(2).origin(), FieldOrigin::Expression { index: 2 });
    }
}
