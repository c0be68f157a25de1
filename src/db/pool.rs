//! Pool construction and the named pool registry.
//!
//! The registry is an explicit object owned by the hosting application and
//! passed by reference wherever statements execute; there is no ambient
//! global. The registry name is a pool's stable identity: it keys both the
//! lookup here and the per-task transaction frames in [`super::tx`].

use std::collections::HashMap;

use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use postgres_native_tls::MakeTlsConnector;
use tokio_postgres::config::SslMode;
use tokio_postgres::NoTls;

use crate::config::Settings;
use crate::error::{Error, Result};

/// Name under which [`PoolRegistry::set_default`] registers its pool.
pub const DEFAULT_POOL: &str = "default";

/// Options for building a pool from a DSN.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub max_size: usize,
    /// Skip certificate verification for TLS connections. Use with caution.
    pub accept_invalid_certs: bool,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            max_size: 16,
            accept_invalid_certs: false,
        }
    }
}

/// Build a lazy connection pool from a PostgreSQL DSN.
///
/// No connection is opened until the first lease. TLS is chosen from the
/// DSN's `sslmode`: `disable` connects plain, anything else goes through a
/// native-tls connector with system roots.
pub fn open_pool(dsn: &str, opts: &PoolOptions) -> Result<Pool> {
    let pg_config: tokio_postgres::Config = dsn
        .parse()
        .map_err(|e: tokio_postgres::Error| Error::PoolSetup(format!("invalid dsn: {}", e)))?;

    let mgr_config = ManagerConfig {
        recycling_method: RecyclingMethod::Fast,
    };

    let manager = match pg_config.get_ssl_mode() {
        SslMode::Disable => Manager::from_config(pg_config, NoTls, mgr_config),
        _ => {
            let tls = build_tls_connector(opts.accept_invalid_certs)?;
            Manager::from_config(pg_config, tls, mgr_config)
        }
    };

    Pool::builder(manager)
        .max_size(opts.max_size)
        .build()
        .map_err(|e| Error::PoolSetup(e.to_string()))
}

fn build_tls_connector(accept_invalid_certs: bool) -> Result<MakeTlsConnector> {
    let mut builder = native_tls::TlsConnector::builder();
    if accept_invalid_certs {
        builder.danger_accept_invalid_certs(true);
        builder.danger_accept_invalid_hostnames(true);
    }
    let connector = builder
        .build()
        .map_err(|e| Error::PoolSetup(format!("failed to build TLS connector: {}", e)))?;
    Ok(MakeTlsConnector::new(connector))
}

/// Process-wide mapping from logical pool name to pool handle.
///
/// Lifecycle: create with [`PoolRegistry::new`] (or
/// [`PoolRegistry::from_settings`]), [`register`](PoolRegistry::register)
/// pools during startup, pass `&PoolRegistry` to everything that executes
/// statements, and [`close`](PoolRegistry::close) at shutdown.
#[derive(Default)]
pub struct PoolRegistry {
    pools: HashMap<String, Pool>,
}

impl PoolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from discovered settings, one pool per database
    /// entry, keyed by the entry name.
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let mut registry = Self::new();
        for (name, db) in &settings.databases {
            let opts = PoolOptions {
                max_size: db.max_size.unwrap_or(16),
                accept_invalid_certs: db.accept_invalid_certs,
            };
            registry.register(name.clone(), open_pool(&db.dsn, &opts)?);
        }
        Ok(registry)
    }

    pub fn register(&mut self, name: impl Into<String>, pool: Pool) {
        self.pools.insert(name.into(), pool);
    }

    /// Register `pool` as the `"default"` pool.
    pub fn set_default(&mut self, pool: Pool) {
        self.register(DEFAULT_POOL, pool);
    }

    pub fn get(&self, name: &str) -> Result<&Pool> {
        self.pools.get(name).ok_or_else(|| {
            if name == DEFAULT_POOL {
                Error::config("no default pool registered, call set_default() first")
            } else {
                Error::config(format!("no pool registered under {:?}", name))
            }
        })
    }

    pub fn default_pool(&self) -> Result<&Pool> {
        self.get(DEFAULT_POOL)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.pools.keys().map(String::as_str)
    }

    /// Close every pool. Outstanding leases stay usable until dropped; new
    /// leases fail.
    pub fn close(&self) {
        for pool in self.pools.values() {
            pool.close();
        }
    }
}

impl std::fmt::Debug for PoolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolRegistry")
            .field("pools", &self.pools.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_default_pool_is_config_error() {
        let registry = PoolRegistry::new();
        let err = registry.default_pool().unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.to_string().contains("set_default"));
    }

    #[test]
    fn test_missing_named_pool_is_config_error() {
        let registry = PoolRegistry::new();
        assert!(matches!(
            registry.get("analytics"),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = PoolRegistry::new();
        let pool = open_pool(
            "postgres://user@localhost:5432/app?sslmode=disable",
            &PoolOptions::default(),
        )
        .unwrap();
        registry.set_default(pool.clone());
        registry.register("analytics", pool);
        assert!(registry.default_pool().is_ok());
        assert!(registry.get("analytics").is_ok());
        let mut names: Vec<&str> = registry.names().collect();
        names.sort_unstable();
        assert_eq!(names, vec!["analytics", "default"]);
    }

    #[test]
    fn test_open_pool_rejects_bad_dsn() {
        let err = open_pool("not a dsn", &PoolOptions::default()).unwrap_err();
        assert!(matches!(err, Error::PoolSetup(_)));
    }
}
