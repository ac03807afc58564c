#![allow(dead_code)] // each test binary uses a different slice of this

use std::path::PathBuf;

use tempfile::TempDir;
use turnstile::config::SemaphoreConfig;
use turnstile::db::{Db, SemaphoreTables};
use turnstile::process::ProcessId;
use turnstile::semaphore::Semaphore;

/// Isolated database per test so tests can run in parallel safely.
pub struct TestContext {
    pub temp_dir: TempDir,
    pub db: Db,
    pub tables: SemaphoreTables,
}

impl TestContext {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let tables = SemaphoreTables::default();
        let db = Db::open(temp_dir.path().join("turnstile.db")).expect("open db");
        db.ensure_schema(&tables).expect("create schema");
        Self {
            temp_dir,
            db,
            tables,
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.temp_dir.path().join("turnstile.db")
    }

    /// Short intervals so deadness and polling resolve in test time.
    pub fn config(total_permits: u32) -> SemaphoreConfig {
        SemaphoreConfig {
            total_permits,
            acquire_poll_millis: 50,
            heartbeat_interval_ms: 100,
            query_timeout_secs: 5,
            ..Default::default()
        }
    }

    /// Open a semaphore as a distinctly-identified participant. Each owner
    /// name models one process.
    pub fn open_as(&self, name: &str, owner: &str, total_permits: u32) -> Semaphore {
        Semaphore::open(
            &self.db,
            &self.tables,
            name,
            ProcessId::from_name(owner),
            &Self::config(total_permits),
        )
        .expect("open semaphore")
    }

    pub fn raw_conn(&self) -> rusqlite::Connection {
        rusqlite::Connection::open(self.db_path()).expect("open raw connection")
    }

    pub fn available(&self, name: &str) -> i64 {
        self.raw_conn()
            .query_row(
                "SELECT available_permits FROM SEMAPHORES WHERE name = ?1",
                rusqlite::params![name],
                |r| r.get(0),
            )
            .expect("semaphore row")
    }

    pub fn total(&self, name: &str) -> i64 {
        self.raw_conn()
            .query_row(
                "SELECT total_permits FROM SEMAPHORES WHERE name = ?1",
                rusqlite::params![name],
                |r| r.get(0),
            )
            .expect("semaphore row")
    }

    pub fn owner_permits(&self, name: &str, owner: &str) -> Option<i64> {
        self.raw_conn()
            .query_row(
                "SELECT owned_permits FROM PERMITS_BY_OWNER WHERE name = ?1 AND owner = ?2",
                rusqlite::params![name, owner],
                |r| r.get(0),
            )
            .ok()
    }

    /// Plant a permit-holding owner whose liveness row is long expired.
    pub fn seed_dead_owner(&self, name: &str, owner: &str, permits: i64) {
        let conn = self.raw_conn();
        conn.execute(
            "UPDATE SEMAPHORES SET available_permits = available_permits - ?1 WHERE name = ?2",
            rusqlite::params![permits, name],
        )
        .expect("debit pool");
        conn.execute(
            "INSERT INTO PERMITS_BY_OWNER (name, owner, owned_permits, last_modified_at) \
             VALUES (?1, ?2, ?3, 0)",
            rusqlite::params![name, owner, permits],
        )
        .expect("owner row");
        conn.execute(
            "INSERT INTO HEARTBEATS (owner, interval_ms, last_heartbeat) VALUES (?1, 100, 1)",
            rusqlite::params![owner],
        )
        .expect("stale heartbeat row");
    }
}
