//! Expression AST definitions.

use std::fmt;

use vlayer_core::Value;

/// Binary operators.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    // Comparison
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    // Logical
    And,
    Or,
    // Arithmetic
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    // String
    Concat,
}

impl BinaryOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            BinaryOp::Eq => "=",
            BinaryOp::Ne => "<>",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::And => "AND",
            BinaryOp::Or => "OR",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
            BinaryOp::Concat => "||",
        }
    }
}

/// Unary operators.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Not,
    Neg,
    IsNull,
    IsNotNull,
}

/// Expression AST node.
///
/// Columns are referenced by field name and resolved against the schema at
/// evaluation time, so the same expression can run against a provider schema
/// and a layer schema.
#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    /// Field reference by name.
    Column(String),
    /// Literal value.
    Literal(Value),
    /// The id of the feature being evaluated (`$id`).
    FeatureId,
    BinaryOp {
        left: Box<Expr>,
        op: BinaryOp,
        right: Box<Expr>,
    },
    UnaryOp { op: UnaryOp, expr: Box<Expr> },
    /// Function call. Names starting with `$` read the feature geometry.
    Function { name: String, args: Vec<Expr> },
    Between {
        expr: Box<Expr>,
        low: Box<Expr>,
        high: Box<Expr>,
    },
    NotBetween {
        expr: Box<Expr>,
        low: Box<Expr>,
        high: Box<Expr>,
    },
    In { expr: Box<Expr>, list: Vec<Expr> },
    NotIn { expr: Box<Expr>, list: Vec<Expr> },
    Like {
        expr: Box<Expr>,
        pattern: String,
        case_insensitive: bool,
    },
    NotLike {
        expr: Box<Expr>,
        pattern: String,
        case_insensitive: bool,
    },
}

impl Expr {
    /// Creates a field reference expression.
    pub fn column(name: impl Into<String>) -> Self {
        Expr::Column(name.into())
    }

    /// Creates a literal expression.
    pub fn literal(value: impl Into<Value>) -> Self {
        Expr::Literal(value.into())
    }

    pub fn null() -> Self {
        Expr::Literal(Value::Null)
    }

    pub fn feature_id() -> Self {
        Expr::FeatureId
    }

    pub fn binary(left: Expr, op: BinaryOp, right: Expr) -> Self {
        Expr::BinaryOp {
            left: Box::new(left),
            op,
            right: Box::new(right),
        }
    }

    pub fn eq(left: Expr, right: Expr) -> Self {
        Self::binary(left, BinaryOp::Eq, right)
    }

    pub fn ne(left: Expr, right: Expr) -> Self {
        Self::binary(left, BinaryOp::Ne, right)
    }

    pub fn lt(left: Expr, right: Expr) -> Self {
        Self::binary(left, BinaryOp::Lt, right)
    }

    pub fn le(left: Expr, right: Expr) -> Self {
        Self::binary(left, BinaryOp::Le, right)
    }

    pub fn gt(left: Expr, right: Expr) -> Self {
        Self::binary(left, BinaryOp::Gt, right)
    }

    pub fn ge(left: Expr, right: Expr) -> Self {
        Self::binary(left, BinaryOp::Ge, right)
    }

    pub fn and(left: Expr, right: Expr) -> Self {
        Self::binary(left, BinaryOp::And, right)
    }

    pub fn or(left: Expr, right: Expr) -> Self {
        Self::binary(left, BinaryOp::Or, right)
    }

    pub fn add(left: Expr, right: Expr) -> Self {
        Self::binary(left, BinaryOp::Add, right)
    }

    pub fn sub(left: Expr, right: Expr) -> Self {
        Self::binary(left, BinaryOp::Sub, right)
    }

    pub fn mul(left: Expr, right: Expr) -> Self {
        Self::binary(left, BinaryOp::Mul, right)
    }

    pub fn div(left: Expr, right: Expr) -> Self {
        Self::binary(left, BinaryOp::Div, right)
    }

    pub fn concat(left: Expr, right: Expr) -> Self {
        Self::binary(left, BinaryOp::Concat, right)
    }

    pub fn not(expr: Expr) -> Self {
        Expr::UnaryOp {
            op: UnaryOp::Not,
            expr: Box::new(expr),
        }
    }

    pub fn neg(expr: Expr) -> Self {
        Expr::UnaryOp {
            op: UnaryOp::Neg,
            expr: Box::new(expr),
        }
    }

    /// Creates an IS NULL expression.
    pub fn is_null(expr: Expr) -> Self {
        Expr::UnaryOp {
            op: UnaryOp::IsNull,
            expr: Box::new(expr),
        }
    }

    /// Creates an IS NOT NULL expression.
    pub fn is_not_null(expr: Expr) -> Self {
        Expr::UnaryOp {
            op: UnaryOp::IsNotNull,
            expr: Box::new(expr),
        }
    }

    pub fn function(name: impl Into<String>, args: Vec<Expr>) -> Self {
        Expr::Function {
            name: name.into(),
            args,
        }
    }

    /// Creates a BETWEEN expression.
    pub fn between(expr: Expr, low: Expr, high: Expr) -> Self {
        Expr::Between {
            expr: Box::new(expr),
            low: Box::new(low),
            high: Box::new(high),
        }
    }

    /// Creates a NOT BETWEEN expression.
    pub fn not_between(expr: Expr, low: Expr, high: Expr) -> Self {
        Expr::NotBetween {
            expr: Box::new(expr),
            low: Box::new(low),
            high: Box::new(high),
        }
    }

    /// Creates an IN expression.
    pub fn in_list(expr: Expr, values: Vec<Value>) -> Self {
        Expr::In {
            expr: Box::new(expr),
            list: values.into_iter().map(Expr::Literal).collect(),
        }
    }

    /// Creates a NOT IN expression.
    pub fn not_in_list(expr: Expr, values: Vec<Value>) -> Self {
        Expr::NotIn {
            expr: Box::new(expr),
            list: values.into_iter().map(Expr::Literal).collect(),
        }
    }

    /// Creates a LIKE expression.
    pub fn like(expr: Expr, pattern: &str) -> Self {
        Expr::Like {
            expr: Box::new(expr),
            pattern: pattern.into(),
            case_insensitive: false,
        }
    }

    /// Creates a case-insensitive LIKE expression.
    pub fn ilike(expr: Expr, pattern: &str) -> Self {
        Expr::Like {
            expr: Box::new(expr),
            pattern: pattern.into(),
            case_insensitive: true,
        }
    }

    /// Creates a NOT LIKE expression.
    pub fn not_like(expr: Expr, pattern: &str) -> Self {
        Expr::NotLike {
            expr: Box::new(expr),
            pattern: pattern.into(),
            case_insensitive: false,
        }
    }

    /// Builds `"field" = value`, or `"field" IS NULL` when the value is null.
    pub fn field_equals(name: impl Into<String>, value: Value) -> Self {
        let column = Expr::column(name);
        if value.is_null() {
            Expr::is_null(column)
        } else {
            Expr::eq(column, Expr::Literal(value))
        }
    }

    /// Visits this node and every descendant, parents first.
    pub fn walk<'a>(&'a self, visit: &mut impl FnMut(&'a Expr)) {
        visit(self);
        match self {
            Expr::Column(_) | Expr::Literal(_) | Expr::FeatureId => {}
            Expr::BinaryOp { left, right, .. } => {
                left.walk(visit);
                right.walk(visit);
            }
            Expr::UnaryOp { expr, .. } | Expr::Like { expr, .. } | Expr::NotLike { expr, .. } => {
                expr.walk(visit)
            }
            Expr::Function { args, .. } => args.iter().for_each(|a| a.walk(visit)),
            Expr::Between { expr, low, high } | Expr::NotBetween { expr, low, high } => {
                expr.walk(visit);
                low.walk(visit);
                high.walk(visit);
            }
            Expr::In { expr, list } | Expr::NotIn { expr, list } => {
                expr.walk(visit);
                list.iter().for_each(|a| a.walk(visit));
            }
        }
    }

    /// Field names referenced by this expression, in order of first use.
    pub fn referenced_columns(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        self.walk(&mut |e| {
            if let Expr::Column(name) = e {
                if !names.contains(&name.as_str()) {
                    names.push(name.as_str());
                }
            }
        });
        names
    }

    /// Returns true if evaluating this expression reads the feature geometry.
    pub fn needs_geometry(&self) -> bool {
        let mut needed = false;
        self.walk(&mut |e| {
            if let Expr::Function { name, .. } = e {
                needed |= name.starts_with('$');
            }
        });
        needed
    }
}

fn write_child(f: &mut fmt::Formatter<'_>, expr: &Expr) -> fmt::Result {
    match expr {
        Expr::BinaryOp { .. } | Expr::Between { .. } | Expr::NotBetween { .. } => {
            write!(f, "({})", expr)
        }
        _ => write!(f, "{}", expr),
    }
}

fn write_list(f: &mut fmt::Formatter<'_>, list: &[Expr]) -> fmt::Result {
    for (i, item) in list.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{}", item)?;
    }
    Ok(())
}

fn write_like(
    f: &mut fmt::Formatter<'_>,
    expr: &Expr,
    negated: bool,
    case_insensitive: bool,
    pattern: &str,
) -> fmt::Result {
    write_child(f, expr)?;
    let not = if negated { " NOT" } else { "" };
    let op = if case_insensitive { "ILIKE" } else { "LIKE" };
    write!(f, "{} {} {}", not, op, Value::String(pattern.to_string()))
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Column(name) => write!(f, "\"{}\"", name.replace('"', "\"\"")),
            Expr::Literal(value) => write!(f, "{}", value),
            Expr::FeatureId => write!(f, "$id"),
            Expr::BinaryOp { left, op, right } => {
                write_child(f, left)?;
                write!(f, " {} ", op.symbol())?;
                write_child(f, right)
            }
            Expr::UnaryOp { op, expr } => match op {
                UnaryOp::Not => {
                    write!(f, "NOT ")?;
                    write_child(f, expr)
                }
                UnaryOp::Neg => {
                    write!(f, "-")?;
                    write_child(f, expr)
                }
                UnaryOp::IsNull => {
                    write_child(f, expr)?;
                    write!(f, " IS NULL")
                }
                UnaryOp::IsNotNull => {
                    write_child(f, expr)?;
                    write!(f, " IS NOT NULL")
                }
            },
            Expr::Function { name, args } => {
                if name.starts_with('$') && args.is_empty() {
                    return write!(f, "{}", name);
                }
                write!(f, "{}(", name)?;
                write_list(f, args)?;
                write!(f, ")")
            }
            Expr::Between { expr, low, high } => {
                write_child(f, expr)?;
                write!(f, " BETWEEN {} AND {}", low, high)
            }
            Expr::NotBetween { expr, low, high } => {
                write_child(f, expr)?;
                write!(f, " NOT BETWEEN {} AND {}", low, high)
            }
            Expr::In { expr, list } => {
                write_child(f, expr)?;
                write!(f, " IN (")?;
                write_list(f, list)?;
                write!(f, ")")
            }
            Expr::NotIn { expr, list } => {
                write_child(f, expr)?;
                write!(f, " NOT IN (")?;
                write_list(f, list)?;
                write!(f, ")")
            }
            Expr::Like {
                expr,
                pattern,
                case_insensitive,
            } => write_like(f, expr, false, *case_insensitive, pattern),
            Expr::NotLike {
                expr,
                pattern,
                case_insensitive,
            } => write_like(f, expr, true, *case_insensitive, pattern),
        }
    }
}
