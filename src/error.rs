use thiserror::Error;

/// Errors surfaced by the query builder and execution layer.
///
/// `Builder` and `Config` fail fast, before any SQL reaches the server.
/// `Db` and `Pool` are propagated verbatim from the driver and the pool.
#[derive(Debug, Error)]
pub enum Error {
    /// The builder was asked to produce a statement it refuses to produce:
    /// an empty insert, an empty exclude/order/group argument list, an
    /// update or delete against a joined table, an empty IN list.
    #[error("query builder misuse: {0}")]
    Builder(String),

    /// A pool lookup failed: unknown pool name, or no default pool
    /// registered when one was required.
    #[error("configuration error: {0}")]
    Config(String),

    /// Error reported by PostgreSQL or the driver, unchanged.
    #[error(transparent)]
    Db(#[from] tokio_postgres::Error),

    /// Error leasing a connection from the pool, unchanged.
    #[error(transparent)]
    Pool(#[from] deadpool_postgres::PoolError),

    /// Pool construction failed (bad DSN, TLS setup).
    #[error("pool setup error: {0}")]
    PoolSetup(String),

    /// Config file could not be read.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Config file could not be parsed.
    #[error("config parse error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn builder(msg: impl Into<String>) -> Self {
        Error::Builder(msg.into())
    }

    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
