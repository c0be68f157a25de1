//! Tables, joins, and the immutable query descriptor.
//!
//! Every mutator clones and returns a new value; a `Table` or `Query` can be
//! held in one place and refined at many call sites without aliasing
//! surprises. Execution lives in [`crate::stmt`].

use crate::db::SharedConn;
use crate::error::{Error, Result};
use crate::expr::{field, quote_ident, Expr};
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Inner,
    Left,
    Right,
}

impl JoinKind {
    fn as_str(&self) -> &'static str {
        match self {
            JoinKind::Inner => "INNER",
            JoinKind::Left => "LEFT",
            JoinKind::Right => "RIGHT",
        }
    }
}

/// An equi-join onto another table, created by [`Table::join`] and friends.
#[derive(Debug, Clone)]
pub struct Join {
    pub table: String,
    pub left_field: String,
    pub right_field: String,
    pub kind: JoinKind,
}

impl Join {
    pub(crate) fn statement(&self) -> String {
        format!(
            "{} JOIN {} ON {} = {}",
            self.kind.as_str(),
            quote_ident(&self.table),
            quote_ident(&self.left_field),
            quote_ident(&self.right_field)
        )
    }
}

/// A named table, optionally joined and optionally pinned to a specific
/// connection or pool.
///
/// Pinning decides where statements run: a pinned connection wins over
/// everything, a pinned pool name overrides the `"default"` registry entry.
#[derive(Clone)]
pub struct Table {
    pub(crate) name: String,
    pub(crate) joins: Vec<Join>,
    pub(crate) conn: Option<SharedConn>,
    pub(crate) pool: Option<String>,
}

/// Shorthand for [`Table::new`].
pub fn table(name: impl Into<String>) -> Table {
    Table::new(name)
}

impl Table {
    pub fn new(name: impl Into<String>) -> Table {
        Table {
            name: name.into(),
            joins: Vec::new(),
            conn: None,
            pool: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Pin all statements built from this table to one shared connection.
    pub fn using_conn(&self, conn: SharedConn) -> Table {
        let mut t = self.clone();
        t.conn = Some(conn);
        t.pool = None;
        t
    }

    /// Route statements built from this table through a named registry pool.
    pub fn using_pool(&self, pool: impl Into<String>) -> Table {
        let mut t = self.clone();
        t.conn = None;
        t.pool = Some(pool.into());
        t
    }

    /// Drop any pinned connection or pool, back to the default routing.
    pub fn using_default(&self) -> Table {
        let mut t = self.clone();
        t.conn = None;
        t.pool = None;
        t
    }

    pub(crate) fn pool_name(&self) -> &str {
        self.pool.as_deref().unwrap_or(crate::db::DEFAULT_POOL)
    }

    fn with_join(&self, join: Join) -> Table {
        let mut t = self.clone();
        t.joins.push(join);
        t
    }

    pub fn join(
        &self,
        other: impl Into<String>,
        left_field: impl Into<String>,
        right_field: impl Into<String>,
    ) -> Table {
        self.with_join(Join {
            table: other.into(),
            left_field: left_field.into(),
            right_field: right_field.into(),
            kind: JoinKind::Inner,
        })
    }

    pub fn left_join(
        &self,
        other: impl Into<String>,
        left_field: impl Into<String>,
        right_field: impl Into<String>,
    ) -> Table {
        self.with_join(Join {
            table: other.into(),
            left_field: left_field.into(),
            right_field: right_field.into(),
            kind: JoinKind::Left,
        })
    }

    pub fn right_join(
        &self,
        other: impl Into<String>,
        left_field: impl Into<String>,
        right_field: impl Into<String>,
    ) -> Table {
        self.with_join(Join {
            table: other.into(),
            left_field: left_field.into(),
            right_field: right_field.into(),
            kind: JoinKind::Right,
        })
    }

    /// Start a query with one predicate ANDed in.
    pub fn filter(&self, pred: impl Into<Expr>) -> Query {
        Query::new(self.clone()).filter(pred)
    }

    /// Start a query excluding rows matching all given predicates.
    pub fn exclude(&self, preds: impl IntoIterator<Item = Expr>) -> Result<Query> {
        Query::new(self.clone()).exclude(preds)
    }

    /// The unconstrained query over this table.
    pub fn query(&self) -> Query {
        Query::new(self.clone())
    }
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("name", &self.name)
            .field("joins", &self.joins)
            .field("pinned_conn", &self.conn.is_some())
            .field("pool", &self.pool)
            .finish()
    }
}

/// Immutable snapshot of a query: table, filter, ordering, grouping,
/// limit/offset. Copy-on-write throughout.
#[derive(Clone)]
pub struct Query {
    pub(crate) table: Table,
    pub(crate) filter: Option<Expr>,
    pub(crate) offset: Option<u64>,
    pub(crate) limit: Option<u64>,
    pub(crate) ordering: Option<Vec<String>>,
    pub(crate) grouping: Option<Vec<String>>,
}

fn conjoin(preds: impl IntoIterator<Item = Expr>) -> Option<Expr> {
    preds.into_iter().fold(None, |acc, p| match acc {
        Some(acc) => Some(acc.and(p)),
        None => Some(p),
    })
}

impl Query {
    pub fn new(table: Table) -> Query {
        Query {
            table,
            filter: None,
            offset: None,
            limit: None,
            ordering: None,
            grouping: None,
        }
    }

    pub fn table(&self) -> &Table {
        &self.table
    }

    /// AND one predicate onto the existing filter. New predicates always
    /// land on the right of the chain.
    pub fn filter(&self, pred: impl Into<Expr>) -> Query {
        let mut q = self.clone();
        let pred = pred.into();
        q.filter = Some(match q.filter.take() {
            Some(existing) => existing.and(pred),
            None => pred,
        });
        q
    }

    /// AND several predicates onto the existing filter.
    pub fn filter_all(&self, preds: impl IntoIterator<Item = Expr>) -> Query {
        preds.into_iter().fold(self.clone(), |q, p| q.filter(p))
    }

    /// OR the conjunction of the given predicates with the existing filter.
    /// Without an existing filter the conjunction is absorbed as a plain
    /// AND step. An empty predicate set is a no-op.
    pub fn or_filter(&self, preds: impl IntoIterator<Item = Expr>) -> Query {
        let Some(conj) = conjoin(preds) else {
            return self.clone();
        };
        let mut q = self.clone();
        q.filter = Some(match q.filter.take() {
            Some(existing) => existing.or(conj),
            None => conj,
        });
        q
    }

    /// AND the negation of the given predicates' conjunction onto the
    /// existing filter. At least one predicate is required.
    pub fn exclude(&self, preds: impl IntoIterator<Item = Expr>) -> Result<Query> {
        let conj = conjoin(preds)
            .ok_or_else(|| Error::builder("exclude requires at least one predicate"))?;
        let mut q = self.clone();
        q.filter = Some(match q.filter.take() {
            Some(existing) => existing.and(!conj),
            None => !conj,
        });
        Ok(q)
    }

    pub fn offset(&self, offset: u64) -> Query {
        let mut q = self.clone();
        q.offset = Some(offset);
        q
    }

    pub fn limit(&self, limit: u64) -> Query {
        let mut q = self.clone();
        q.limit = Some(limit);
        q
    }

    /// Order by the given columns; a leading `-` means descending.
    pub fn order_by<S: Into<String>>(&self, cols: impl IntoIterator<Item = S>) -> Result<Query> {
        let cols: Vec<String> = cols.into_iter().map(Into::into).collect();
        if cols.is_empty() {
            return Err(Error::builder("order_by requires at least one column"));
        }
        let mut q = self.clone();
        q.ordering = Some(cols);
        Ok(q)
    }

    pub fn group_by<S: Into<String>>(&self, cols: impl IntoIterator<Item = S>) -> Result<Query> {
        let cols: Vec<String> = cols.into_iter().map(Into::into).collect();
        if cols.is_empty() {
            return Err(Error::builder("group_by requires at least one column"));
        }
        let mut q = self.clone();
        q.grouping = Some(cols);
        Ok(q)
    }

    pub(crate) fn order_sql(&self) -> Option<String> {
        let ordering = self.ordering.as_ref()?;
        let cols: Vec<String> = ordering
            .iter()
            .map(|col| match col.strip_prefix('-') {
                Some(name) => format!("{} DESC", quote_ident(name)),
                None => quote_ident(col),
            })
            .collect();
        Some(format!("ORDER BY {}", cols.join(",")))
    }

    pub(crate) fn group_sql(&self) -> Option<String> {
        let grouping = self.grouping.as_ref()?;
        let cols: Vec<String> = grouping.iter().map(|g| quote_ident(g)).collect();
        Some(format!("GROUP BY {}", cols.join(",")))
    }

    /// Render the WHERE condition. An absent filter renders as a literal
    /// `true` parameter so the clause is always present and parameterized.
    pub(crate) fn condition_sql(&self, params: &mut Vec<Value>) -> Result<String> {
        match &self.filter {
            Some(expr) => expr.to_sql(params),
            None => Expr::from(true).to_sql(params),
        }
    }
}

impl std::fmt::Debug for Query {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Query")
            .field("table", &self.table)
            .field("has_filter", &self.filter.is_some())
            .field("offset", &self.offset)
            .field("limit", &self.limit)
            .field("ordering", &self.ordering)
            .field("grouping", &self.grouping)
            .finish()
    }
}

/// Build an equality conjunction from `(column, value)` pairs. Convenience
/// for key-based lookups (`upsert`, `get_or_insert`).
pub(crate) fn eq_conjunction<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Option<Expr>
where
    K: Into<String>,
    V: Into<Expr>,
{
    conjoin(pairs.into_iter().map(|(k, v)| {
        let name: String = k.into();
        let value: Expr = v.into();
        field(name).eq(value)
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::field;

    fn cond(q: &Query) -> (String, Vec<Value>) {
        let mut params = Vec::new();
        let sql = q.condition_sql(&mut params).unwrap();
        (sql, params)
    }

    #[test]
    fn test_filter_chains_to_the_right() {
        let q = table("t")
            .filter(field("a").eq(1))
            .filter(field("b").eq(2));
        let (sql, params) = cond(&q);
        assert_eq!(sql, "\"a\" = $1 and \"b\" = $2");
        assert_eq!(params, vec![Value::Int4(1), Value::Int4(2)]);
    }

    #[test]
    fn test_no_filter_renders_true_param() {
        let q = table("t").query();
        let (sql, params) = cond(&q);
        assert_eq!(sql, "$1");
        assert_eq!(params, vec![Value::Bool(true)]);
    }

    #[test]
    fn test_or_filter_with_existing() {
        let q = table("t")
            .filter(field("a").eq(1))
            .or_filter([field("b").eq(2), field("c").eq(3)]);
        let (sql, _) = cond(&q);
        assert_eq!(sql, "\"a\" = $1 or \"b\" = $2 and \"c\" = $3");
    }

    #[test]
    fn test_or_filter_without_existing_is_plain_and() {
        let q = table("t").query().or_filter([field("a").eq(1)]);
        let (sql, _) = cond(&q);
        assert_eq!(sql, "\"a\" = $1");
    }

    #[test]
    fn test_or_filter_empty_is_noop() {
        let q = table("t").filter(field("a").eq(1));
        let q2 = q.or_filter(Vec::<Expr>::new());
        assert_eq!(cond(&q), cond(&q2));
    }

    #[test]
    fn test_exclude() {
        let q = table("t")
            .filter(field("a").eq(1))
            .exclude([field("b").eq(2)])
            .unwrap();
        let (sql, _) = cond(&q);
        assert_eq!(sql, "\"a\" = $1 and not (\"b\" = $2)");
    }

    #[test]
    fn test_exclude_without_existing_filter() {
        let q = table("t").exclude([field("b").eq(2)]).unwrap();
        let (sql, _) = cond(&q);
        assert_eq!(sql, "not (\"b\" = $1)");
    }

    #[test]
    fn test_exclude_empty_is_misuse() {
        let r = table("t").exclude(Vec::<Expr>::new());
        assert!(matches!(r, Err(Error::Builder(_))));
    }

    #[test]
    fn test_order_and_group_sql() {
        let q = table("t")
            .query()
            .order_by(["-created_at", "name"])
            .unwrap()
            .group_by(["name"])
            .unwrap();
        assert_eq!(
            q.order_sql().unwrap(),
            "ORDER BY \"created_at\" DESC,\"name\""
        );
        assert_eq!(q.group_sql().unwrap(), "GROUP BY \"name\"");
    }

    #[test]
    fn test_order_by_empty_is_misuse() {
        let r = table("t").query().order_by(Vec::<String>::new());
        assert!(matches!(r, Err(Error::Builder(_))));
        let r = table("t").query().group_by(Vec::<String>::new());
        assert!(matches!(r, Err(Error::Builder(_))));
    }

    #[test]
    fn test_mutators_leave_original_untouched() {
        let q = table("t").filter(field("a").eq(1));
        let _q2 = q.limit(5).offset(10);
        assert!(q.limit.is_none());
        assert!(q.offset.is_none());

        let t = table("t");
        let t2 = t.join("u", "t.id", "u.t_id");
        assert!(t.joins.is_empty());
        assert_eq!(t2.joins.len(), 1);
    }

    #[test]
    fn test_join_statement() {
        let j = Join {
            table: "orders".into(),
            left_field: "users.id".into(),
            right_field: "orders.user_id".into(),
            kind: JoinKind::Left,
        };
        assert_eq!(
            j.statement(),
            "LEFT JOIN \"orders\" ON \"users\".\"id\" = \"orders\".\"user_id\""
        );
    }
}
