//! Task-scoped transaction frames.
//!
//! Each logical tokio task owns, per pool, a frame holding one leased
//! connection and a stack of open transaction scopes. Entering a scope on a
//! pool where the task already holds one reuses the same connection and
//! opens a savepoint, so helper code can open a scope "just in case" and
//! still see the caller's uncommitted changes. Frames are looked up by the
//! current task's identity: a spawned task can never observe its parent's
//! frame and always starts empty, so a child opening its own scope leases
//! an independent connection.
//!
//! The global map below is bookkeeping only; its lock is never held across
//! an await. The pool itself is the only resource genuinely shared between
//! tasks, and all sharing goes through `Pool::get`.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, OnceLock};

use deadpool_postgres::Pool;
use tokio::task;
use tracing::{debug, error, warn};

use super::pool::{PoolRegistry, DEFAULT_POOL};
use super::SharedConn;
use crate::error::{Error, Result};

/// Identity of the current logical task. `None` means the root context
/// driving the runtime directly (e.g. inside `block_on` outside any task),
/// which is a single logical context of its own.
type TaskKey = Option<task::Id>;

struct TxScopeRecord {
    /// `None` for the outermost scope (a real BEGIN), `Some` for nested
    /// scopes backed by a savepoint.
    savepoint: Option<String>,
}

#[derive(Default)]
struct TxFrame {
    conn: Option<SharedConn>,
    stack: Vec<TxScopeRecord>,
    /// Rollback left behind by a scope guard dropped mid-flight (task
    /// cancellation). Drained before the connection is next used.
    pending_rollback: Option<String>,
}

struct FrameMap {
    /// Recorded owner; always equals the registry key it is stored under.
    /// Lookups only ever go through the current task's identity, which is
    /// what keeps a parent's in-progress scopes invisible to spawned tasks.
    owner: TaskKey,
    frames: HashMap<String, TxFrame>,
}

fn registry() -> &'static Mutex<HashMap<TaskKey, FrameMap>> {
    static FRAMES: OnceLock<Mutex<HashMap<TaskKey, FrameMap>>> = OnceLock::new();
    FRAMES.get_or_init(Default::default)
}

fn lock_registry() -> std::sync::MutexGuard<'static, HashMap<TaskKey, FrameMap>> {
    registry().lock().unwrap_or_else(|e| e.into_inner())
}

/// Run `f` against the current task's frame for `pool_key`, creating the
/// frame map and frame as needed.
fn with_frame_mut<R>(pool_key: &str, f: impl FnOnce(&mut TxFrame) -> R) -> R {
    let key = task::try_id();
    let mut map = lock_registry();
    let frame_map = map.entry(key).or_insert_with(|| FrameMap {
        owner: key,
        frames: HashMap::new(),
    });
    debug_assert_eq!(frame_map.owner, key);
    f(frame_map.frames.entry(pool_key.to_string()).or_default())
}

/// Run `f` against the current task's frame for `pool_key` without creating
/// anything.
fn read_frame<R>(pool_key: &str, f: impl FnOnce(&TxFrame) -> R) -> Option<R> {
    let key = task::try_id();
    let map = lock_registry();
    let frame_map = map.get(&key)?;
    Some(f(frame_map.frames.get(pool_key)?))
}

/// Drop the frame when its stack is empty and the map when it has no
/// frames left, so recycled task ids never meet stale state.
fn cleanup_frame(pool_key: &str) {
    let key = task::try_id();
    let mut map = lock_registry();
    if let Some(frame_map) = map.get_mut(&key) {
        if let Some(frame) = frame_map.frames.get(pool_key) {
            if frame.stack.is_empty() && frame.conn.is_none() && frame.pending_rollback.is_none() {
                frame_map.frames.remove(pool_key);
            }
        }
        if frame_map.frames.is_empty() {
            map.remove(&key);
        }
    }
}

/// The connection the current task's active scope holds on `pool_key`, if
/// any. Statements route through this before leasing fresh.
pub(crate) fn current_conn(pool_key: &str) -> Option<SharedConn> {
    read_frame(pool_key, |frame| frame.conn.clone()).flatten()
}

fn take_pending(pool_key: &str) -> Option<(SharedConn, String)> {
    let key = task::try_id();
    let mut map = lock_registry();
    let frame = map.get_mut(&key)?.frames.get_mut(pool_key)?;
    let sql = frame.pending_rollback.take()?;
    let conn = frame.conn.clone()?;
    Some((conn, sql))
}

/// Apply a rollback left behind by a cancelled inner scope, if one is
/// waiting. Must run before the frame's connection is used again.
pub(crate) async fn drain_pending(pool_key: &str) -> Result<()> {
    let Some((conn, sql)) = take_pending(pool_key) else {
        return Ok(());
    };
    debug!(pool = pool_key, "draining pending rollback");
    conn.batch_execute(&sql).await?;
    Ok(())
}

fn pop_scope(pool_key: &str) -> Option<(SharedConn, TxScopeRecord, bool)> {
    let key = task::try_id();
    let mut map = lock_registry();
    let frame = map.get_mut(&key)?.frames.get_mut(pool_key)?;
    let record = frame.stack.pop()?;
    let Some(conn) = frame.conn.clone() else {
        error!(pool = pool_key, "transaction frame has scopes but no connection");
        return None;
    };
    Some((conn, record, frame.stack.is_empty()))
}

fn release_conn(pool_key: &str) {
    let key = task::try_id();
    {
        let mut map = lock_registry();
        if let Some(frame_map) = map.get_mut(&key) {
            if let Some(frame) = frame_map.frames.get_mut(pool_key) {
                frame.conn = None;
            }
        }
    }
    cleanup_frame(pool_key);
}

/// Transaction isolation levels understood by PostgreSQL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    fn as_str(&self) -> &'static str {
        match self {
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

/// Options for a transaction scope's own BEGIN. They apply only to the
/// scope being entered: a nested scope is a savepoint and takes none of
/// them retroactively onto the outer transaction.
#[derive(Debug, Clone, Default)]
pub struct TxOptions {
    pub isolation: Option<IsolationLevel>,
    pub read_only: bool,
    pub deferrable: bool,
}

impl TxOptions {
    pub fn isolation(level: IsolationLevel) -> Self {
        Self {
            isolation: Some(level),
            ..Self::default()
        }
    }

    fn begin_sql(&self) -> String {
        let mut sql = String::from("BEGIN");
        if let Some(level) = &self.isolation {
            sql.push_str(" ISOLATION LEVEL ");
            sql.push_str(level.as_str());
        }
        if self.read_only {
            sql.push_str(" READ ONLY");
        }
        if self.deferrable {
            sql.push_str(" DEFERRABLE");
        }
        sql
    }
}

/// An open transaction scope in the current task.
///
/// Finish it explicitly with [`commit`](Scope::commit) or
/// [`rollback`](Scope::rollback). Dropping an unfinished scope (the
/// cancellation and early-`?` path) rolls back: the outermost scope's
/// connection is pulled from the frame and rolled back on a background
/// task before the lease returns to the pool; a nested scope records a
/// savepoint rollback that is drained before the connection is next used.
#[must_use = "a transaction scope rolls back unless committed"]
pub struct Scope {
    pool_key: String,
    done: bool,
}

impl Scope {
    pub async fn commit(mut self) -> Result<()> {
        self.finish(true).await
    }

    pub async fn rollback(mut self) -> Result<()> {
        self.finish(false).await
    }

    async fn finish(&mut self, commit: bool) -> Result<()> {
        self.done = true;
        drain_pending(&self.pool_key).await?;
        let Some((conn, record, last)) = pop_scope(&self.pool_key) else {
            // Scope-exit ordering bug, not a data-correctness risk.
            error!(pool = %self.pool_key, "transaction scope exited with empty stack");
            return Ok(());
        };
        let sql = match (&record.savepoint, commit) {
            (None, true) => "COMMIT".to_string(),
            (None, false) => "ROLLBACK".to_string(),
            (Some(sp), true) => format!("RELEASE SAVEPOINT \"{}\"", sp),
            (Some(sp), false) => format!("ROLLBACK TO SAVEPOINT \"{}\"", sp),
        };
        debug!(pool = %self.pool_key, sql = %sql, "exiting transaction scope");
        let res = conn.batch_execute(&sql).await;
        drop(conn);
        if last {
            release_conn(&self.pool_key);
        }
        res.map_err(Into::into)
    }
}

impl Drop for Scope {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let Some((conn, record, last)) = pop_scope(&self.pool_key) else {
            error!(pool = %self.pool_key, "transaction scope dropped with empty stack");
            return;
        };
        if last {
            release_conn(&self.pool_key);
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    let pool_key = self.pool_key.clone();
                    handle.spawn(async move {
                        if let Err(e) = conn.batch_execute("ROLLBACK").await {
                            warn!(pool = %pool_key, error = %e, "rollback of dropped scope failed");
                        }
                        drop(conn);
                    });
                }
                Err(_) => {
                    warn!(
                        pool = %self.pool_key,
                        "scope dropped outside a runtime; connection released without rollback"
                    );
                }
            }
        } else {
            let sql = match &record.savepoint {
                Some(sp) => format!("ROLLBACK TO SAVEPOINT \"{}\"", sp),
                None => "ROLLBACK".to_string(),
            };
            with_frame_mut(&self.pool_key, |frame| {
                frame.pending_rollback = Some(sql);
            });
        }
    }
}

async fn begin_scope(pool: &Pool, pool_key: &str, opts: &TxOptions) -> Result<Scope> {
    drain_pending(pool_key).await?;

    let existing =
        read_frame(pool_key, |frame| frame.conn.clone().map(|c| (c, frame.stack.len())))
            .flatten();

    match existing {
        Some((conn, depth)) => {
            let savepoint = format!("s{}", depth);
            conn.batch_execute(&format!("SAVEPOINT \"{}\"", savepoint))
                .await?;
            with_frame_mut(pool_key, |frame| {
                frame.stack.push(TxScopeRecord {
                    savepoint: Some(savepoint),
                });
            });
            debug!(pool = pool_key, depth = depth + 1, "entered nested transaction scope");
        }
        None => {
            // Backpressure: waits here until the pool has a free connection.
            let conn: SharedConn = Arc::new(pool.get().await?);
            conn.batch_execute(&opts.begin_sql()).await?;
            with_frame_mut(pool_key, |frame| {
                frame.conn = Some(conn);
                frame.stack.push(TxScopeRecord { savepoint: None });
            });
            debug!(pool = pool_key, "entered transaction scope");
        }
    }

    Ok(Scope {
        pool_key: pool_key.to_string(),
        done: false,
    })
}

impl PoolRegistry {
    /// Open a transaction scope on the default pool.
    pub async fn begin(&self, opts: TxOptions) -> Result<Scope> {
        self.begin_on(DEFAULT_POOL, opts).await
    }

    /// Open a transaction scope on a named pool. Nested calls within one
    /// task reuse the scope's connection; independent pools get
    /// independent frames and leases.
    pub async fn begin_on(&self, pool_name: &str, opts: TxOptions) -> Result<Scope> {
        let pool = self.get(pool_name)?;
        begin_scope(pool, pool_name, &opts).await
    }
}

/// Run `f` inside a transaction scope: begin, invoke, commit on `Ok`,
/// rollback on `Err`, the error propagating unchanged.
pub async fn with_transaction<T, E, F, Fut>(
    db: &PoolRegistry,
    pool_name: &str,
    opts: TxOptions,
    f: F,
) -> std::result::Result<T, E>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: From<Error>,
{
    let scope = db.begin_on(pool_name, opts).await.map_err(E::from)?;
    match f().await {
        Ok(v) => {
            scope.commit().await.map_err(E::from)?;
            Ok(v)
        }
        Err(e) => {
            if let Err(re) = scope.rollback().await {
                error!(error = %re, "rollback after failed transaction body also failed");
            }
            Err(e)
        }
    }
}
