//! Expression trees and the expression → SQL compiler.
//!
//! A query condition is an immutable tree of [`Expr`] nodes. Combinators
//! always build a new node; sharing a subtree between two queries is safe.
//! Compilation walks the tree left-to-right, depth-first, appending every
//! literal to the positional parameter list and emitting its `$N`
//! placeholder, so parameter order is exactly visitation order.

use crate::error::{Error, Result};
use crate::value::Value;

/// Binary operators understood by the compiler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Add,
    Sub,
    Mul,
    Div,
    Like,
    ILike,
}

impl BinOp {
    fn as_str(&self) -> &'static str {
        match self {
            BinOp::Eq => "=",
            BinOp::Ne => "<>",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
            BinOp::And => "and",
            BinOp::Or => "or",
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Like => "like",
            BinOp::ILike => "ilike",
        }
    }

    /// Operators whose rendered text is ambiguous when nested without
    /// parentheses. AND/OR and the comparisons are excluded on purpose: the
    /// tree shape for those is unambiguous in the emitted text.
    fn is_binary_like(&self) -> bool {
        matches!(
            self,
            BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Like | BinOp::ILike
        )
    }
}

/// A node in a query expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// A literal; compiles to a `$N` placeholder.
    Value(Value),
    /// A column reference; compiles to a quoted identifier.
    Field(String),
    /// A raw SQL fragment emitted verbatim. The caller vouches for it.
    Safe(String),
    /// Arithmetic negation.
    Neg(Box<Expr>),
    /// Logical negation; renders as `not (...)`.
    Not(Box<Expr>),
    /// Membership test against a literal list.
    In {
        lhs: Box<Expr>,
        list: Vec<Value>,
        negated: bool,
    },
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
}

/// Reference a column. Dotted paths are quoted per segment.
pub fn field(name: impl Into<String>) -> Expr {
    Expr::Field(name.into())
}

/// Embed a raw SQL fragment, unescaped.
pub fn safe(sql: impl Into<String>) -> Expr {
    Expr::Safe(sql.into())
}

/// Quote an identifier for inclusion in SQL text.
///
/// Each dot-separated segment that is non-empty and identifier-shaped
/// (word characters only) is double-quoted; anything else passes through
/// verbatim, which leaves already-qualified or computed segments alone.
pub fn quote_ident(name: &str) -> String {
    name.split('.')
        .map(|term| {
            if !term.is_empty() && term.chars().all(|c| c.is_alphanumeric() || c == '_') {
                format!("\"{}\"", term)
            } else {
                term.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join(".")
}

impl Expr {
    fn binary(op: BinOp, lhs: Expr, rhs: Expr) -> Expr {
        Expr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    pub fn eq(self, other: impl Into<Expr>) -> Expr {
        Expr::binary(BinOp::Eq, self, other.into())
    }

    pub fn ne(self, other: impl Into<Expr>) -> Expr {
        Expr::binary(BinOp::Ne, self, other.into())
    }

    pub fn lt(self, other: impl Into<Expr>) -> Expr {
        Expr::binary(BinOp::Lt, self, other.into())
    }

    pub fn le(self, other: impl Into<Expr>) -> Expr {
        Expr::binary(BinOp::Le, self, other.into())
    }

    pub fn gt(self, other: impl Into<Expr>) -> Expr {
        Expr::binary(BinOp::Gt, self, other.into())
    }

    pub fn ge(self, other: impl Into<Expr>) -> Expr {
        Expr::binary(BinOp::Ge, self, other.into())
    }

    pub fn and(self, other: impl Into<Expr>) -> Expr {
        Expr::binary(BinOp::And, self, other.into())
    }

    pub fn or(self, other: impl Into<Expr>) -> Expr {
        Expr::binary(BinOp::Or, self, other.into())
    }

    pub fn like(self, pattern: impl Into<String>) -> Expr {
        Expr::binary(BinOp::Like, self, Expr::Value(Value::Text(pattern.into())))
    }

    pub fn ilike(self, pattern: impl Into<String>) -> Expr {
        Expr::binary(BinOp::ILike, self, Expr::Value(Value::Text(pattern.into())))
    }

    pub fn starts_with(self, prefix: impl Into<String>) -> Expr {
        self.like(format!("{}%", prefix.into()))
    }

    pub fn is_null(self) -> Expr {
        self.eq(Value::Null)
    }

    pub fn is_not_null(self) -> Expr {
        self.ne(Value::Null)
    }

    pub fn in_list<V: Into<Value>>(self, items: impl IntoIterator<Item = V>) -> Expr {
        Expr::In {
            lhs: Box::new(self),
            list: items.into_iter().map(Into::into).collect(),
            negated: false,
        }
    }

    pub fn not_in<V: Into<Value>>(self, items: impl IntoIterator<Item = V>) -> Expr {
        Expr::In {
            lhs: Box::new(self),
            list: items.into_iter().map(Into::into).collect(),
            negated: true,
        }
    }

    /// Whether the node's top-level operator is in the binary-like set.
    /// Drives the parenthesization rule in [`Expr::to_sql`].
    fn is_binary_like(&self) -> bool {
        matches!(self, Expr::Binary { op, .. } if op.is_binary_like())
    }

    /// Compile the tree to SQL text, appending literals to `params`.
    ///
    /// Placeholders are numbered `$len` immediately after the append, so
    /// numbering is strictly increasing in left-to-right depth-first order.
    /// Recompiling the same tree with a fresh list yields identical text.
    pub fn to_sql(&self, params: &mut Vec<Value>) -> Result<String> {
        match self {
            Expr::Value(v) => {
                params.push(v.clone());
                Ok(format!("${}", params.len()))
            }
            Expr::Field(name) => Ok(quote_ident(name)),
            Expr::Safe(raw) => Ok(raw.clone()),
            Expr::Neg(inner) => Ok(format!("-{}", inner.to_sql(params)?)),
            Expr::Not(inner) => Ok(format!("not ({})", inner.to_sql(params)?)),
            Expr::In { lhs, list, negated } => {
                if list.is_empty() {
                    return Err(Error::builder("IN list must not be empty"));
                }
                let lhs_sql = lhs.to_sql(params)?;
                let mut places = Vec::with_capacity(list.len());
                for v in list {
                    params.push(v.clone());
                    places.push(format!("${}", params.len()));
                }
                let kw = if *negated { "not in" } else { "in" };
                Ok(format!("{} {} ({})", lhs_sql, kw, places.join(",")))
            }
            Expr::Binary { op, lhs, rhs } => {
                // Comparing against a literal NULL is rewritten to IS [NOT]
                // NULL; the left side keeps its parentheses when it is
                // itself binary-like.
                if matches!(op, BinOp::Eq | BinOp::Ne)
                    && matches!(rhs.as_ref(), Expr::Value(Value::Null))
                {
                    let mut lhs_sql = lhs.to_sql(params)?;
                    if lhs.is_binary_like() {
                        lhs_sql = format!("({})", lhs_sql);
                    }
                    let kw = if *op == BinOp::Eq {
                        "is null"
                    } else {
                        "is not null"
                    };
                    return Ok(format!("{} {}", lhs_sql, kw));
                }

                let mut lhs_sql = lhs.to_sql(params)?;
                let mut rhs_sql = rhs.to_sql(params)?;
                if op.is_binary_like() {
                    if lhs.is_binary_like() {
                        lhs_sql = format!("({})", lhs_sql);
                    }
                    if rhs.is_binary_like() {
                        rhs_sql = format!("({})", rhs_sql);
                    }
                }
                Ok(format!("{} {} {}", lhs_sql, op.as_str(), rhs_sql))
            }
        }
    }
}

impl From<Value> for Expr {
    fn from(v: Value) -> Self {
        Expr::Value(v)
    }
}

macro_rules! expr_from_scalar {
    ($($t:ty),* $(,)?) => {
        $(
            impl From<$t> for Expr {
                fn from(v: $t) -> Self {
                    Expr::Value(v.into())
                }
            }
        )*
    };
}

expr_from_scalar!(
    bool,
    i16,
    i32,
    i64,
    f32,
    f64,
    &str,
    String,
    chrono::NaiveDate,
    chrono::NaiveTime,
    chrono::NaiveDateTime,
    chrono::DateTime<chrono::Utc>,
    serde_json::Value,
);

impl<T: Into<Value>> From<Option<T>> for Expr {
    fn from(v: Option<T>) -> Self {
        Expr::Value(v.into())
    }
}

impl std::ops::Add for Expr {
    type Output = Expr;
    fn add(self, rhs: Expr) -> Expr {
        Expr::binary(BinOp::Add, self, rhs)
    }
}

impl std::ops::Sub for Expr {
    type Output = Expr;
    fn sub(self, rhs: Expr) -> Expr {
        Expr::binary(BinOp::Sub, self, rhs)
    }
}

impl std::ops::Mul for Expr {
    type Output = Expr;
    fn mul(self, rhs: Expr) -> Expr {
        Expr::binary(BinOp::Mul, self, rhs)
    }
}

impl std::ops::Div for Expr {
    type Output = Expr;
    fn div(self, rhs: Expr) -> Expr {
        Expr::binary(BinOp::Div, self, rhs)
    }
}

impl std::ops::BitAnd for Expr {
    type Output = Expr;
    fn bitand(self, rhs: Expr) -> Expr {
        Expr::binary(BinOp::And, self, rhs)
    }
}

impl std::ops::BitOr for Expr {
    type Output = Expr;
    fn bitor(self, rhs: Expr) -> Expr {
        Expr::binary(BinOp::Or, self, rhs)
    }
}

impl std::ops::Neg for Expr {
    type Output = Expr;
    fn neg(self) -> Expr {
        Expr::Neg(Box::new(self))
    }
}

impl std::ops::Not for Expr {
    type Output = Expr;
    fn not(self) -> Expr {
        Expr::Not(Box::new(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile(e: &Expr) -> (String, Vec<Value>) {
        let mut params = Vec::new();
        let sql = e.to_sql(&mut params).unwrap();
        (sql, params)
    }

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("name"), "\"name\"");
        assert_eq!(quote_ident("users.name"), "\"users\".\"name\"");
        assert_eq!(quote_ident("*"), "*");
        assert_eq!(quote_ident("count(*)"), "count(*)");
        // empty segment passes through
        assert_eq!(quote_ident("a..b"), "\"a\"..\"b\"");
    }

    #[test]
    fn test_value_placeholder() {
        let (sql, params) = compile(&Expr::from(42i64));
        assert_eq!(sql, "$1");
        assert_eq!(params, vec![Value::Int8(42)]);
    }

    #[test]
    fn test_field_and_safe() {
        let (sql, params) = compile(&field("users.age"));
        assert_eq!(sql, "\"users\".\"age\"");
        assert!(params.is_empty());

        let (sql, _) = compile(&safe("now()"));
        assert_eq!(sql, "now()");
    }

    #[test]
    fn test_comparison() {
        let (sql, params) = compile(&field("name").eq("mike"));
        assert_eq!(sql, "\"name\" = $1");
        assert_eq!(params, vec![Value::Text("mike".into())]);

        let (sql, _) = compile(&field("age").ge(18));
        assert_eq!(sql, "\"age\" >= $1");
    }

    #[test]
    fn test_placeholders_number_in_visitation_order() {
        let e = field("a").eq(1) & field("b").eq(2) & field("c").eq(3);
        let (sql, params) = compile(&e);
        assert_eq!(sql, "\"a\" = $1 and \"b\" = $2 and \"c\" = $3");
        assert_eq!(
            params,
            vec![Value::Int4(1), Value::Int4(2), Value::Int4(3)]
        );
    }

    #[test]
    fn test_recompile_is_deterministic() {
        let e = (field("x") + field("y")).eq(10) | field("z").is_null();
        let (sql1, params1) = compile(&e);
        let (sql2, params2) = compile(&e);
        assert_eq!(sql1, sql2);
        assert_eq!(params1, params2);
    }

    #[test]
    fn test_neg_and_not() {
        let (sql, _) = compile(&-field("balance"));
        assert_eq!(sql, "-\"balance\"");

        let (sql, params) = compile(&!field("active").eq(true));
        assert_eq!(sql, "not (\"active\" = $1)");
        assert_eq!(params, vec![Value::Bool(true)]);
    }

    #[test]
    fn test_in_list() {
        let (sql, params) = compile(&field("id").in_list([1, 2, 3]));
        assert_eq!(sql, "\"id\" in ($1,$2,$3)");
        assert_eq!(
            params,
            vec![Value::Int4(1), Value::Int4(2), Value::Int4(3)]
        );

        let (sql, _) = compile(&field("id").not_in([7, 8]));
        assert_eq!(sql, "\"id\" not in ($1,$2)");
    }

    #[test]
    fn test_empty_in_list_fails() {
        let e = field("id").in_list(Vec::<i32>::new());
        let mut params = Vec::new();
        assert!(matches!(e.to_sql(&mut params), Err(Error::Builder(_))));
    }

    #[test]
    fn test_null_comparison_renders_is_null() {
        let (sql, params) = compile(&field("deleted_at").is_null());
        assert_eq!(sql, "\"deleted_at\" is null");
        assert!(params.is_empty());

        let (sql, _) = compile(&field("deleted_at").is_not_null());
        assert_eq!(sql, "\"deleted_at\" is not null");

        // eq against an explicit Null value takes the same path
        let (sql, _) = compile(&field("x").eq(Value::Null));
        assert_eq!(sql, "\"x\" is null");
    }

    #[test]
    fn test_null_comparison_parenthesizes_binary_like_lhs() {
        let e = (field("a") + field("b")).is_null();
        let (sql, _) = compile(&e);
        assert_eq!(sql, "(\"a\" + \"b\") is null");

        // a plain field lhs stays bare
        let (sql, _) = compile(&field("a").is_null());
        assert_eq!(sql, "\"a\" is null");
    }

    #[test]
    fn test_like_and_ilike() {
        let (sql, params) = compile(&field("name").like("mi%"));
        assert_eq!(sql, "\"name\" like $1");
        assert_eq!(params, vec![Value::Text("mi%".into())]);

        let (sql, _) = compile(&field("name").ilike("MI%"));
        assert_eq!(sql, "\"name\" ilike $1");

        let (sql, params) = compile(&field("name").starts_with("mi"));
        assert_eq!(sql, "\"name\" like $1");
        assert_eq!(params, vec![Value::Text("mi%".into())]);
    }

    // Parenthesization, operand by operand: a side is wrapped exactly when
    // both the parent operator and that side's own operator are binary-like.

    #[test]
    fn test_binary_like_rhs_is_parenthesized() {
        let e = field("a") + field("b") * field("c");
        let (sql, _) = compile(&e);
        assert_eq!(sql, "\"a\" + (\"b\" * \"c\")");
    }

    #[test]
    fn test_binary_like_lhs_is_parenthesized() {
        let e = field("a") * field("b") + field("c");
        let (sql, _) = compile(&e);
        assert_eq!(sql, "(\"a\" * \"b\") + \"c\"");
    }

    #[test]
    fn test_both_sides_parenthesized() {
        let e = (field("a") + field("b")) / (field("c") - field("d"));
        let (sql, _) = compile(&e);
        assert_eq!(sql, "(\"a\" + \"b\") / (\"c\" - \"d\")");
    }

    #[test]
    fn test_comparison_parent_adds_no_parens() {
        // comparison operators are not binary-like, so an arithmetic side
        // stays bare under them
        let e = (field("a") + field("b")).eq(field("c") * field("d"));
        let (sql, _) = compile(&e);
        assert_eq!(sql, "\"a\" + \"b\" = \"c\" * \"d\"");
    }

    #[test]
    fn test_and_or_add_no_parens() {
        let e = field("a").eq(1) | field("b").eq(2) & field("c").eq(3);
        let (sql, _) = compile(&e);
        // tree shape comes from Rust precedence (& binds tighter than |)
        assert_eq!(sql, "\"a\" = $1 or \"b\" = $2 and \"c\" = $3");
    }

    #[test]
    fn test_like_counts_as_binary_like_operand() {
        // like under an arithmetic parent is wrapped, same as arithmetic
        let e = field("a") + field("b").like("x%");
        let (sql, _) = compile(&e);
        assert_eq!(sql, "\"a\" + (\"b\" like $1)");
    }

    #[test]
    fn test_scalar_rhs_coerces_to_value_node() {
        let e = field("score") + Expr::from(5);
        let (sql, params) = compile(&e);
        assert_eq!(sql, "\"score\" + $1");
        assert_eq!(params, vec![Value::Int4(5)]);
    }
}
