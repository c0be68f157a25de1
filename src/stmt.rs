//! Statement actions: Select / Insert / Update / Delete.
//!
//! An action owns a query descriptor (or table, for Insert) and renders
//! final SQL text plus a positional parameter list. Rendering is pure;
//! execution resolves a connection through the router and hands the text
//! and parameters to the driver.
//!
//! Connection routing, in priority order: a connection pinned on the
//! table, the current task's transaction-scope connection for the
//! resolved pool, a fresh lease released when the statement completes.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio_postgres::types::ToSql;
use tokio_postgres::Row;
use tracing::debug;

use crate::db::tx::{current_conn, drain_pending};
use crate::db::{PoolRegistry, SharedConn};
use crate::error::{Error, Result};
use crate::expr::{quote_ident, Expr};
use crate::query::{eq_conjunction, Query, Table};
use crate::row::{DbRow, FromRow};
use crate::value::Value;

pub(crate) enum ConnHandle {
    Shared(SharedConn),
    Leased(deadpool_postgres::Object),
}

impl ConnHandle {
    fn client(&self) -> &tokio_postgres::Client {
        match self {
            ConnHandle::Shared(conn) => conn,
            ConnHandle::Leased(obj) => obj,
        }
    }
}

async fn resolve_conn(table: &Table, db: &PoolRegistry) -> Result<ConnHandle> {
    if let Some(conn) = &table.conn {
        return Ok(ConnHandle::Shared(conn.clone()));
    }
    let name = table.pool_name();
    let pool = db.get(name)?;
    drain_pending(name).await?;
    if let Some(conn) = current_conn(name) {
        return Ok(ConnHandle::Shared(conn));
    }
    Ok(ConnHandle::Leased(pool.get().await?))
}

fn param_refs(params: &[Value]) -> Vec<&(dyn ToSql + Sync)> {
    params.iter().map(|v| v as &(dyn ToSql + Sync)).collect()
}

/// Row-locking mode for a SELECT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RowLock {
    #[default]
    None,
    ForUpdate,
    ForUpdateSkipLocked,
}

/// A SELECT over a query descriptor. The field list defaults to `*`.
#[derive(Clone)]
pub struct Select {
    query: Query,
    fields: Vec<String>,
    lock: RowLock,
}

impl Select {
    pub fn new<S: Into<String>>(query: Query, fields: impl IntoIterator<Item = S>) -> Select {
        Select {
            query,
            fields: fields.into_iter().map(Into::into).collect(),
            lock: RowLock::None,
        }
    }

    pub fn for_update(&self) -> Select {
        let mut s = self.clone();
        s.lock = RowLock::ForUpdate;
        s
    }

    pub fn for_update_skip_locked(&self) -> Select {
        let mut s = self.clone();
        s.lock = RowLock::ForUpdateSkipLocked;
        s
    }

    pub fn to_sql(&self) -> Result<(String, Vec<Value>)> {
        let mut lines = Vec::new();

        let fields_sql = if self.fields.is_empty() {
            "*".to_string()
        } else {
            self.fields
                .iter()
                .map(|f| quote_ident(f))
                .collect::<Vec<_>>()
                .join(",")
        };
        lines.push(format!("SELECT {}", fields_sql));
        lines.push(format!("FROM {}", quote_ident(&self.query.table.name)));

        for join in &self.query.table.joins {
            lines.push(join.statement());
        }

        let mut params = Vec::new();
        lines.push(format!("WHERE {}", self.query.condition_sql(&mut params)?));

        if let Some(group) = self.query.group_sql() {
            lines.push(group);
        }
        if let Some(order) = self.query.order_sql() {
            lines.push(order);
        }
        if let Some(limit) = self.query.limit {
            lines.push(format!("LIMIT {}", limit));
        }
        if let Some(offset) = self.query.offset {
            lines.push(format!("OFFSET {}", offset));
        }
        match self.lock {
            RowLock::None => {}
            RowLock::ForUpdate => lines.push("FOR UPDATE".to_string()),
            RowLock::ForUpdateSkipLocked => lines.push("FOR UPDATE SKIP LOCKED".to_string()),
        }

        Ok((lines.join(" "), params))
    }

    /// The statement actually run by [`get_one`](Select::get_one): without
    /// an explicit limit the query is re-derived with `limit(1)` so the
    /// scan stops at the first match.
    fn single(&self) -> Select {
        if self.query.limit.is_some() {
            self.clone()
        } else {
            Select {
                query: self.query.limit(1),
                fields: self.fields.clone(),
                lock: self.lock,
            }
        }
    }

    pub async fn get_one(&self, db: &PoolRegistry) -> Result<Option<DbRow>> {
        let derived = self.single();
        let (sql, params) = derived.to_sql()?;
        debug!(sql = %sql, "select one");
        let conn = resolve_conn(&derived.query.table, db).await?;
        let rows = conn.client().query(sql.as_str(), &param_refs(&params)).await?;
        Ok(rows.into_iter().next().map(DbRow::new))
    }

    pub async fn get_one_as<T: FromRow>(&self, db: &PoolRegistry) -> Result<Option<T>> {
        match self.get_one(db).await? {
            Some(row) => Ok(Some(row.decode()?)),
            None => Ok(None),
        }
    }

    pub async fn get_all(&self, db: &PoolRegistry) -> Result<Vec<DbRow>> {
        let (sql, params) = self.to_sql()?;
        debug!(sql = %sql, "select all");
        let conn = resolve_conn(&self.query.table, db).await?;
        let rows = conn.client().query(sql.as_str(), &param_refs(&params)).await?;
        Ok(rows.into_iter().map(DbRow::new).collect())
    }

    pub async fn get_all_as<T: FromRow>(&self, db: &PoolRegistry) -> Result<Vec<T>> {
        self.get_all(db)
            .await?
            .iter()
            .map(|row| row.decode::<T>())
            .collect()
    }

    /// Stream rows through a server-side cursor instead of buffering the
    /// full result set. Requires an active transaction scope (or a pinned
    /// connection already inside one); the cursor dies with that
    /// transaction.
    pub async fn stream(&self, db: &PoolRegistry) -> Result<RowCursor> {
        let (sql, params) = self.to_sql()?;
        let table = &self.query.table;
        let conn = if let Some(conn) = &table.conn {
            conn.clone()
        } else {
            let name = table.pool_name();
            db.get(name)?;
            drain_pending(name).await?;
            current_conn(name).ok_or_else(|| {
                Error::builder("streaming select requires an active transaction scope")
            })?
        };

        static CURSOR_SEQ: AtomicU64 = AtomicU64::new(0);
        let name = format!("pgfluent_c{}", CURSOR_SEQ.fetch_add(1, Ordering::Relaxed));
        let declare = format!(
            "DECLARE \"{}\" NO SCROLL CURSOR WITHOUT HOLD FOR {}",
            name, sql
        );
        debug!(sql = %declare, "declare cursor");
        conn.execute(declare.as_str(), &param_refs(&params)).await?;

        Ok(RowCursor {
            conn,
            name,
            batch: VecDeque::new(),
            done: false,
        })
    }
}

/// A lazy, finite, non-restartable sequence of rows behind a server-side
/// cursor. Rows arrive in fetch batches; call [`next`](RowCursor::next)
/// until it yields `None`.
pub struct RowCursor {
    conn: SharedConn,
    name: String,
    batch: VecDeque<Row>,
    done: bool,
}

impl std::fmt::Debug for RowCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowCursor")
            .field("name", &self.name)
            .field("batch_len", &self.batch.len())
            .field("done", &self.done)
            .finish()
    }
}

impl RowCursor {
    const FETCH_SIZE: usize = 50;

    pub async fn next(&mut self) -> Result<Option<DbRow>> {
        if self.batch.is_empty() && !self.done {
            let fetch = format!("FETCH {} FROM \"{}\"", Self::FETCH_SIZE, self.name);
            let rows = self.conn.query(fetch.as_str(), &[]).await?;
            if rows.len() < Self::FETCH_SIZE {
                self.done = true;
            }
            self.batch.extend(rows);
        }
        Ok(self.batch.pop_front().map(DbRow::new))
    }

    /// Close the cursor early. Otherwise it is reclaimed when its
    /// transaction ends.
    pub async fn close(self) -> Result<()> {
        self.conn
            .batch_execute(&format!("CLOSE \"{}\"", self.name))
            .await?;
        Ok(())
    }
}

/// An INSERT of literal values into a table. Every supplied value must be
/// a literal; expressions referencing columns are rejected.
pub struct Insert {
    table: Table,
    assignments: Vec<(String, Expr)>,
}

impl Insert {
    pub fn new<K, V>(table: Table, values: impl IntoIterator<Item = (K, V)>) -> Insert
    where
        K: Into<String>,
        V: Into<Expr>,
    {
        Insert {
            table,
            assignments: values
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn to_sql(&self) -> Result<(String, Vec<Value>)> {
        if self.assignments.is_empty() {
            return Err(Error::builder("insert requires at least one field"));
        }
        let mut params = Vec::new();
        let mut places = Vec::with_capacity(self.assignments.len());
        for (name, expr) in &self.assignments {
            match expr {
                Expr::Value(_) => places.push(expr.to_sql(&mut params)?),
                _ => {
                    return Err(Error::builder(format!(
                        "insert value for {:?} must be a literal",
                        name
                    )))
                }
            }
        }
        let columns = self
            .assignments
            .iter()
            .map(|(name, _)| quote_ident(name))
            .collect::<Vec<_>>()
            .join(",");
        let sql = format!(
            "INSERT INTO {}({}) VALUES ({}) RETURNING *",
            quote_ident(&self.table.name),
            columns,
            places.join(",")
        );
        Ok((sql, params))
    }

    pub async fn run(&self, db: &PoolRegistry) -> Result<DbRow> {
        let (sql, params) = self.to_sql()?;
        debug!(sql = %sql, "insert");
        let conn = resolve_conn(&self.table, db).await?;
        let row = conn.client().query_one(sql.as_str(), &param_refs(&params)).await?;
        Ok(DbRow::new(row))
    }
}

/// An UPDATE over a query descriptor. Demands an explicit filter (a
/// full-table update is spelled `filter(true)`, not omission) and refuses
/// joined tables.
pub struct Update {
    query: Query,
    assignments: Vec<(String, Expr)>,
    returning: bool,
}

impl Update {
    pub fn new<K, V>(query: Query, assignments: impl IntoIterator<Item = (K, V)>) -> Update
    where
        K: Into<String>,
        V: Into<Expr>,
    {
        Update {
            query,
            assignments: assignments
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            returning: true,
        }
    }

    pub fn returning(&self, returning: bool) -> Update {
        Update {
            query: self.query.clone(),
            assignments: self.assignments.clone(),
            returning,
        }
    }

    pub fn to_sql(&self) -> Result<(String, Vec<Value>)> {
        if !self.query.table.joins.is_empty() {
            return Err(Error::builder("update does not support joined tables"));
        }
        if self.assignments.is_empty() {
            return Err(Error::builder("update requires at least one assignment"));
        }
        let Some(filter) = &self.query.filter else {
            return Err(Error::builder(
                "update requires a filter; use filter(true) to update every row",
            ));
        };

        let mut params = Vec::new();
        let mut sets = Vec::with_capacity(self.assignments.len());
        for (name, expr) in &self.assignments {
            sets.push(format!("{} = {}", quote_ident(name), expr.to_sql(&mut params)?));
        }
        let cond = filter.to_sql(&mut params)?;

        let mut sql = format!(
            "UPDATE {} SET {} WHERE {}",
            quote_ident(&self.query.table.name),
            sets.join(","),
            cond
        );
        if self.returning {
            sql.push_str(" RETURNING *");
        }
        Ok((sql, params))
    }

    /// Run the update; with `RETURNING *` (the default) yields the first
    /// updated row, or `None` when nothing matched.
    pub async fn run(&self, db: &PoolRegistry) -> Result<Option<DbRow>> {
        let (sql, params) = self.to_sql()?;
        debug!(sql = %sql, "update");
        let conn = resolve_conn(&self.query.table, db).await?;
        if self.returning {
            let rows = conn.client().query(sql.as_str(), &param_refs(&params)).await?;
            Ok(rows.into_iter().next().map(DbRow::new))
        } else {
            conn.client().execute(sql.as_str(), &param_refs(&params)).await?;
            Ok(None)
        }
    }
}

/// A DELETE over a query descriptor. Refuses joined tables; a missing
/// filter deletes every row (the condition renders as a literal `true`).
pub struct Delete {
    query: Query,
}

impl Delete {
    pub fn new(query: Query) -> Delete {
        Delete { query }
    }

    pub fn to_sql(&self) -> Result<(String, Vec<Value>)> {
        if !self.query.table.joins.is_empty() {
            return Err(Error::builder("delete does not support joined tables"));
        }
        let mut params = Vec::new();
        let cond = self.query.condition_sql(&mut params)?;
        let sql = format!(
            "DELETE FROM {} WHERE {}",
            quote_ident(&self.query.table.name),
            cond
        );
        Ok((sql, params))
    }

    /// Run the delete; returns the number of rows removed.
    pub async fn run(&self, db: &PoolRegistry) -> Result<u64> {
        let (sql, params) = self.to_sql()?;
        debug!(sql = %sql, "delete");
        let conn = resolve_conn(&self.query.table, db).await?;
        Ok(conn.client().execute(sql.as_str(), &param_refs(&params)).await?)
    }
}

impl Query {
    /// Wrap this query in a SELECT with an explicit field list.
    pub fn select<S: Into<String>>(&self, fields: impl IntoIterator<Item = S>) -> Select {
        Select::new(self.clone(), fields)
    }

    fn select_all_fields(&self) -> Select {
        Select::new(self.clone(), Vec::<String>::new())
    }

    pub async fn get_one(&self, db: &PoolRegistry) -> Result<Option<DbRow>> {
        self.select_all_fields().get_one(db).await
    }

    pub async fn get_one_as<T: FromRow>(&self, db: &PoolRegistry) -> Result<Option<T>> {
        self.select_all_fields().get_one_as(db).await
    }

    pub async fn get_all(&self, db: &PoolRegistry) -> Result<Vec<DbRow>> {
        self.select_all_fields().get_all(db).await
    }

    pub async fn get_all_as<T: FromRow>(&self, db: &PoolRegistry) -> Result<Vec<T>> {
        self.select_all_fields().get_all_as(db).await
    }

    pub async fn stream(&self, db: &PoolRegistry) -> Result<RowCursor> {
        self.select_all_fields().stream(db).await
    }

    pub async fn update<K, V>(
        &self,
        assignments: impl IntoIterator<Item = (K, V)>,
        db: &PoolRegistry,
    ) -> Result<Option<DbRow>>
    where
        K: Into<String>,
        V: Into<Expr>,
    {
        Update::new(self.clone(), assignments).run(db).await
    }

    pub async fn delete(&self, db: &PoolRegistry) -> Result<u64> {
        Delete::new(self.clone()).run(db).await
    }
}

impl Table {
    /// Insert a row of literal values; yields the inserted row.
    pub async fn insert<K, V>(
        &self,
        values: impl IntoIterator<Item = (K, V)>,
        db: &PoolRegistry,
    ) -> Result<DbRow>
    where
        K: Into<String>,
        V: Into<Expr>,
    {
        Insert::new(self.clone(), values).run(db).await
    }

    pub async fn get_one(&self, db: &PoolRegistry) -> Result<Option<DbRow>> {
        self.query().get_one(db).await
    }

    pub async fn get_all(&self, db: &PoolRegistry) -> Result<Vec<DbRow>> {
        self.query().get_all(db).await
    }

    pub async fn delete(&self, db: &PoolRegistry) -> Result<u64> {
        self.query().delete(db).await
    }

    /// Fetch the row matching `keys`; update it with `defaults` when it
    /// exists, insert `defaults` merged with `keys` when it does not.
    /// Returns the row and whether it was inserted.
    pub async fn upsert<KD, KK>(
        &self,
        defaults: impl IntoIterator<Item = (KD, Value)>,
        keys: impl IntoIterator<Item = (KK, Value)>,
        db: &PoolRegistry,
    ) -> Result<(DbRow, bool)>
    where
        KD: Into<String>,
        KK: Into<String>,
    {
        let defaults: Vec<(String, Value)> =
            defaults.into_iter().map(|(k, v)| (k.into(), v)).collect();
        let keys: Vec<(String, Value)> = keys.into_iter().map(|(k, v)| (k.into(), v)).collect();
        let query = self.key_query(&keys)?;

        match query.get_one(db).await? {
            None => {
                let values = merge_values(defaults, &keys);
                let row = self.insert(values, db).await?;
                Ok((row, true))
            }
            Some(existing) => {
                if defaults.is_empty() {
                    return Ok((existing, false));
                }
                let row = query.update(defaults, db).await?.unwrap_or(existing);
                Ok((row, false))
            }
        }
    }

    /// Fetch the row matching `keys`, inserting `defaults` merged with
    /// `keys` when absent. Returns the row and whether it was inserted.
    pub async fn get_or_insert<KD, KK>(
        &self,
        defaults: impl IntoIterator<Item = (KD, Value)>,
        keys: impl IntoIterator<Item = (KK, Value)>,
        db: &PoolRegistry,
    ) -> Result<(DbRow, bool)>
    where
        KD: Into<String>,
        KK: Into<String>,
    {
        let defaults: Vec<(String, Value)> =
            defaults.into_iter().map(|(k, v)| (k.into(), v)).collect();
        let keys: Vec<(String, Value)> = keys.into_iter().map(|(k, v)| (k.into(), v)).collect();
        let query = self.key_query(&keys)?;

        match query.get_one(db).await? {
            Some(row) => Ok((row, false)),
            None => {
                let values = merge_values(defaults, &keys);
                let row = self.insert(values, db).await?;
                Ok((row, true))
            }
        }
    }

    fn key_query(&self, keys: &[(String, Value)]) -> Result<Query> {
        let conj = eq_conjunction(keys.iter().map(|(k, v)| (k.clone(), v.clone())))
            .ok_or_else(|| Error::builder("at least one key is required"))?;
        Ok(self.filter(conj))
    }
}

/// Merge `keys` over `defaults`: same-named keys replace the default.
fn merge_values(
    mut defaults: Vec<(String, Value)>,
    keys: &[(String, Value)],
) -> Vec<(String, Value)> {
    for (k, v) in keys {
        match defaults.iter_mut().find(|(name, _)| name == k) {
            Some(slot) => slot.1 = v.clone(),
            None => defaults.push((k.clone(), v.clone())),
        }
    }
    defaults
}
