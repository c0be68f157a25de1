//! Integration tests against a live PostgreSQL.
//!
//! Ignored by default; run with a reachable database:
//!
//! ```text
//! PGFLUENT_TEST_DSN=postgres://postgres@127.0.0.1:5432/pgfluent_test \
//!     cargo test -- --ignored
//! ```

use pgfluent::{
    field, open_pool, table, with_transaction, Error, IsolationLevel, PoolOptions, PoolRegistry,
    TxOptions, Value,
};

async fn setup() -> PoolRegistry {
    let dsn = std::env::var("PGFLUENT_TEST_DSN")
        .unwrap_or_else(|_| "postgres://postgres@127.0.0.1:5432/pgfluent_test".to_string());
    let mut db = PoolRegistry::new();
    db.set_default(open_pool(&dsn, &PoolOptions::default()).unwrap());

    let conn = db.default_pool().unwrap().get().await.unwrap();
    conn.batch_execute(
        "CREATE TABLE IF NOT EXISTS testuser (name text, gender text, info text)",
    )
    .await
    .unwrap();
    db
}

async fn clear(db: &PoolRegistry, names: &[&str]) {
    table("testuser")
        .filter(field("name").in_list(names.to_vec()))
        .delete(db)
        .await
        .unwrap();
}

#[tokio::test]
#[ignore = "requires a running PostgreSQL"]
async fn test_insert_and_get_one() {
    let db = setup().await;
    let tbl = table("testuser");
    clear(&db, &["mike"]).await;

    tbl.insert([("name", "mike"), ("gender", "male")], &db)
        .await
        .unwrap();

    let row = tbl
        .filter(field("name").eq("mike"))
        .get_one(&db)
        .await
        .unwrap()
        .expect("row should exist");
    assert_eq!(row.get::<_, String>("gender"), "male");

    clear(&db, &["mike"]).await;
}

#[tokio::test]
#[ignore = "requires a running PostgreSQL"]
async fn test_rollback_restores_previous_state() {
    let db = setup().await;
    let tbl = table("testuser");
    clear(&db, &["mike"]).await;

    tbl.insert([("name", "mike"), ("gender", "male")], &db)
        .await
        .unwrap();

    let res: Result<(), Error> = with_transaction(&db, "default", TxOptions::default(), || async {
        let row = tbl
            .filter(field("name").eq("mike"))
            .update([("gender", "female")], &db)
            .await?
            .expect("update should match");
        assert_eq!(row.get::<_, String>("gender"), "female");
        // abort the transaction, rolling the change back
        Err(Error::Builder("abort".into()))
    })
    .await;
    assert!(res.is_err());

    let row = tbl
        .filter(field("name").eq("mike"))
        .get_one(&db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.get::<_, String>("gender"), "male");

    clear(&db, &["mike"]).await;
}

#[tokio::test]
#[ignore = "requires a running PostgreSQL"]
async fn test_nested_scopes_share_one_connection() {
    let db = setup().await;
    let tbl = table("testuser");
    clear(&db, &["nest_mike", "nest_marry"]).await;

    tbl.insert([("name", "nest_mike"), ("info", "info 01")], &db)
        .await
        .unwrap();
    tbl.insert([("name", "nest_marry"), ("info", "info 11")], &db)
        .await
        .unwrap();

    let outer = db
        .begin(TxOptions::isolation(IsolationLevel::RepeatableRead))
        .await
        .unwrap();

    tbl.filter(field("name").eq("nest_mike"))
        .update([("info", "info 02")], &db)
        .await
        .unwrap();

    {
        let inner = db
            .begin(TxOptions::default())
            .await
            .unwrap();
        tbl.filter(field("name").eq("nest_marry"))
            .update([("info", "info 12")], &db)
            .await
            .unwrap();
        inner.commit().await.unwrap();
    }

    // same connection, same transaction: the inner change is visible to
    // the outer scope before anything commits
    let row = tbl
        .filter(field("name").eq("nest_marry"))
        .get_one(&db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.get::<_, String>("info"), "info 12");

    outer.rollback().await.unwrap();

    // the rollback takes the nested scope's change with it
    let row = tbl
        .filter(field("name").eq("nest_marry"))
        .get_one(&db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.get::<_, String>("info"), "info 11");
    let row = tbl
        .filter(field("name").eq("nest_mike"))
        .get_one(&db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.get::<_, String>("info"), "info 01");

    clear(&db, &["nest_mike", "nest_marry"]).await;
}

#[tokio::test]
#[ignore = "requires a running PostgreSQL"]
async fn test_spawned_task_gets_independent_scope() {
    let db = std::sync::Arc::new(setup().await);
    let tbl = table("testuser");
    clear(&db, &["cor_marry"]).await;

    tbl.insert([("name", "cor_marry"), ("info", "info 11")], &db)
        .await
        .unwrap();

    let outer = db
        .begin(TxOptions::isolation(IsolationLevel::RepeatableRead))
        .await
        .unwrap();

    // pin the repeatable-read snapshot with a first read
    let row = tbl
        .filter(field("name").eq("cor_marry"))
        .get_one(&db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.get::<_, String>("info"), "info 11");

    // the spawned task must not inherit this scope: it opens its own,
    // on its own lease, and commits independently
    let child_db = db.clone();
    tokio::spawn(async move {
        let tbl = table("testuser");
        with_transaction::<_, Error, _, _>(
            &child_db,
            "default",
            TxOptions::default(),
            || async {
                tbl.filter(field("name").eq("cor_marry"))
                    .update([("info", "info 12")], &child_db)
                    .await?;
                Ok(())
            },
        )
        .await
        .unwrap();
    })
    .await
    .unwrap();

    // repeatable read: the parent still sees its snapshot
    let row = tbl
        .filter(field("name").eq("cor_marry"))
        .get_one(&db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.get::<_, String>("info"), "info 11");

    outer.rollback().await.unwrap();

    // the child's commit survives the parent's rollback
    let row = tbl
        .filter(field("name").eq("cor_marry"))
        .get_one(&db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.get::<_, String>("info"), "info 12");

    clear(&db, &["cor_marry"]).await;
}

#[tokio::test]
#[ignore = "requires a running PostgreSQL"]
async fn test_streaming_cursor() {
    let db = setup().await;
    let tbl = table("testuser");
    clear(&db, &["stream_user"]).await;

    for i in 0..120 {
        let info = format!("row {}", i);
        tbl.insert([("name", "stream_user".to_string()), ("info", info)], &db)
            .await
            .unwrap();
    }

    // streaming outside a scope is refused
    let err = tbl
        .filter(field("name").eq("stream_user"))
        .stream(&db)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Builder(_)));

    let tx = db.begin(TxOptions::default()).await.unwrap();
    let mut cursor = tbl
        .filter(field("name").eq("stream_user"))
        .stream(&db)
        .await
        .unwrap();
    let mut count = 0;
    while let Some(row) = cursor.next().await.unwrap() {
        assert_eq!(row.get::<_, String>("name"), "stream_user");
        count += 1;
    }
    assert_eq!(count, 120);
    tx.commit().await.unwrap();

    clear(&db, &["stream_user"]).await;
}

#[tokio::test]
#[ignore = "requires a running PostgreSQL"]
async fn test_upsert_and_get_or_insert() {
    let db = setup().await;
    let tbl = table("testuser");
    clear(&db, &["ups_jane"]).await;

    let (row, inserted) = tbl
        .upsert(
            [("info", Value::from("first"))],
            [("name", Value::from("ups_jane"))],
            &db,
        )
        .await
        .unwrap();
    assert!(inserted);
    assert_eq!(row.get::<_, String>("info"), "first");

    let (row, inserted) = tbl
        .upsert(
            [("info", Value::from("second"))],
            [("name", Value::from("ups_jane"))],
            &db,
        )
        .await
        .unwrap();
    assert!(!inserted);
    assert_eq!(row.get::<_, String>("info"), "second");

    let (row, inserted) = tbl
        .get_or_insert(
            [("info", Value::from("third"))],
            [("name", Value::from("ups_jane"))],
            &db,
        )
        .await
        .unwrap();
    assert!(!inserted);
    assert_eq!(row.get::<_, String>("info"), "second");

    clear(&db, &["ups_jane"]).await;
}

#[tokio::test]
#[ignore = "requires a running PostgreSQL"]
async fn test_pinned_connection_routing() {
    let db = setup().await;
    let tbl = table("testuser");
    clear(&db, &["pin_user"]).await;

    let conn: pgfluent::SharedConn =
        std::sync::Arc::new(db.default_pool().unwrap().get().await.unwrap());
    let pinned = tbl.using_conn(conn);
    pinned
        .insert([("name", "pin_user"), ("gender", "x")], &db)
        .await
        .unwrap();
    let row = pinned
        .filter(field("name").eq("pin_user"))
        .get_one(&db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.get::<_, String>("gender"), "x");

    clear(&db, &["pin_user"]).await;
}
