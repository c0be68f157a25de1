mod pool;
pub(crate) mod tx;

pub use pool::*;
pub use tx::{with_transaction, IsolationLevel, Scope, TxOptions};

/// A pooled connection shared between the transaction frame and any
/// statement or cursor currently using it. The lease returns to the pool
/// when the last clone is dropped.
pub type SharedConn = std::sync::Arc<deadpool_postgres::Object>;
