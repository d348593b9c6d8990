#![cfg(feature = "sqlite")]

//! Integration tests for the SQLite driver through the registry
use arkiv_drivers::{ConnectionConfig, DriverRegistry, Value};

#[tokio::test]
async fn test_registry_connects_to_file_database() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("site.db");
    let config = ConnectionConfig::new_sqlite(path.to_str().expect("utf-8 path"));

    let registry = DriverRegistry::with_defaults();
    assert_eq!(registry.driver_names(), vec!["sqlite"]);

    let conn = registry.connect(&config).await.expect("connect");
    conn.execute(
        "CREATE TABLE quiz (id INTEGER PRIMARY KEY AUTOINCREMENT, name TEXT NOT NULL)",
        &[],
    )
    .await
    .expect("create table");
    conn.execute("INSERT INTO quiz (name) VALUES ($1)", &[Value::from("Week 1")])
        .await
        .expect("insert");

    let result = conn
        .query("SELECT id, name FROM quiz WHERE name = $1", &[Value::from("Week 1")])
        .await
        .expect("query");
    assert_eq!(result.row_count(), 1);
    assert_eq!(result.rows[0].get_by_name("id"), Some(&Value::Integer(1)));
}

#[tokio::test]
async fn test_unknown_driver_is_rejected() {
    let registry = DriverRegistry::with_defaults();
    let config = ConnectionConfig::new("postgres");
    assert!(registry.connect(&config).await.is_err());
}
