//! File-backed database initialization tests.

use tempfile::TempDir;

use factweave::config::Config;
use factweave::{db, migrate, threads};

fn test_config(root: &std::path::Path) -> Config {
    let toml_str = format!(
        r#"
[db]
path = "{}/data/factweave.sqlite"

[server]
bind = "127.0.0.1:7332"

[auth]
token_secret = "test-secret"
"#,
        root.display()
    );
    toml::from_str(&toml_str).unwrap()
}

#[tokio::test]
async fn test_connect_creates_parent_directories() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path());

    let pool = db::connect(&config).await.unwrap();
    migrate::run_migrations(&pool).await.unwrap();

    assert!(tmp.path().join("data/factweave.sqlite").exists());
    pool.close().await;
}

#[tokio::test]
async fn test_migrations_are_idempotent() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path());

    let pool = db::connect(&config).await.unwrap();
    migrate::run_migrations(&pool).await.unwrap();
    migrate::run_migrations(&pool).await.unwrap();

    // Schema is usable after the second run
    let thread = threads::create_thread(&pool, "alice").await.unwrap();
    assert!(threads::get_thread(&pool, "alice", &thread.id)
        .await
        .unwrap()
        .is_some());
    pool.close().await;
}

#[tokio::test]
async fn test_state_survives_reconnect() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path());

    let pool = db::connect(&config).await.unwrap();
    migrate::run_migrations(&pool).await.unwrap();
    let thread = threads::create_thread(&pool, "alice").await.unwrap();
    pool.close().await;

    let pool = db::connect(&config).await.unwrap();
    let fetched = threads::get_thread(&pool, "alice", &thread.id).await.unwrap();
    assert_eq!(fetched.unwrap().title, threads::DEFAULT_THREAD_TITLE);
    pool.close().await;
}
