//! Fluent query builder and task-scoped transactions for PostgreSQL.
//!
//! Queries are immutable expression trees compiled to parameterized SQL
//! (`$N` placeholders); execution routes through a named pool registry and
//! a per-task transaction manager, so nested scopes in one task share one
//! connection while spawned tasks lease their own.
//!
//! ```no_run
//! use pgfluent::{field, table, open_pool, PoolOptions, PoolRegistry, TxOptions};
//!
//! # async fn demo() -> pgfluent::Result<()> {
//! let mut db = PoolRegistry::new();
//! db.set_default(open_pool("postgres://app@localhost/app", &PoolOptions::default())?);
//!
//! let users = table("users");
//! users.insert([("name", "mike"), ("gender", "male")], &db).await?;
//!
//! let tx = db.begin(TxOptions::default()).await?;
//! users.filter(field("name").eq("mike"))
//!     .update([("gender", "female")], &db)
//!     .await?;
//! tx.commit().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod db;
pub mod error;
pub mod expr;
pub mod query;
pub mod row;
pub mod stmt;
pub mod value;

pub use db::{
    open_pool, with_transaction, IsolationLevel, PoolOptions, PoolRegistry, Scope, SharedConn,
    TxOptions, DEFAULT_POOL,
};
pub use error::{Error, Result};
pub use expr::{field, safe, BinOp, Expr};
pub use query::{table, Join, JoinKind, Query, Table};
pub use row::{DbRow, FromRow};
pub use stmt::{Delete, Insert, RowCursor, RowLock, Select, Update};
pub use value::Value;
