//! Dead-owner permit reclamation.
//!
//! Both operations run inside a caller-supplied transaction, so the
//! observation "this owner has no liveness row" and the recovery of its
//! permits commit or roll back together. Two live peers may race to reclaim
//! the same dead owner; the exact-match DELETE means at most one of them
//! succeeds, so a permit is returned to the pool at most once.

use rusqlite::{params, Transaction};

use crate::db::{Deadline, SemaphoreSql};
use crate::error::Result;
use crate::process::ProcessId;

/// Permits held by one dead owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerPermits {
    pub owner: String,
    pub permits: i64,
}

/// Permit-holding owners with no liveness row, in (owner, permits) order,
/// cut off once the accumulated permit count reaches `wish`.
pub fn dead_owner_permits(
    tx: &Transaction<'_>,
    deadline: &Deadline,
    sql: &SemaphoreSql,
    name: &str,
    wish: u32,
) -> Result<Vec<OwnerPermits>> {
    deadline.check()?;
    let mut stmt = tx.prepare(&sql.select_dead_owner_permits)?;
    let mut rows = stmt.query(params![name])?;
    let mut result = Vec::new();
    let mut accumulated: i64 = 0;
    while let Some(row) = rows.next()? {
        let entry = OwnerPermits {
            owner: row.get(0)?,
            permits: row.get(1)?,
        };
        accumulated += entry.permits;
        result.push(entry);
        if accumulated >= i64::from(wish) {
            break;
        }
    }
    Ok(result)
}

/// Return up to `wish` permits held by dead owners to the available pool.
/// Returns the number of permits actually recovered.
pub fn release_dead_owner_permits(
    tx: &Transaction<'_>,
    deadline: &Deadline,
    sql: &SemaphoreSql,
    name: &str,
    process_id: &ProcessId,
    wish: u32,
) -> Result<i64> {
    let dead = dead_owner_permits(tx, deadline, sql, name, wish)?;
    let mut released: i64 = 0;
    for entry in dead {
        deadline.check()?;
        // The exact owned-permits match is the reclaim guard: if a peer got
        // here first the count no longer matches and zero rows are deleted.
        let deleted = tx.execute(
            &sql.delete_dead_owner_record,
            params![entry.owner, name, entry.permits],
        )?;
        if deleted == 1 {
            tx.execute(
                &sql.release,
                params![entry.permits, process_id.as_str(), name],
            )?;
            released += entry.permits;
            tracing::warn!(
                "released {} permit(s) from dead owner {}",
                entry.permits,
                entry.owner
            );
        }
    }
    Ok(released)
}

/// Drop zero-permit rows whose owner has no liveness row. Only worth doing
/// after at least one heartbeat row was reaped, which is the caller's check.
pub fn remove_dead_unowned_rows(
    tx: &Transaction<'_>,
    deadline: &Deadline,
    sql: &SemaphoreSql,
    name: &str,
) -> Result<usize> {
    deadline.check()?;
    Ok(tx.execute(&sql.delete_dead_unowned_records, params![name])?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Db, SemaphoreTables};
    use std::time::Duration;
    use tempfile::TempDir;

    fn seeded_db(temp: &TempDir) -> (Db, SemaphoreSql) {
        let tables = SemaphoreTables::default();
        let db = Db::open(temp.path().join("test.db")).unwrap();
        db.ensure_schema(&tables).unwrap();

        let conn = rusqlite::Connection::open(db.path()).unwrap();
        conn.execute_batch(
            "INSERT INTO SEMAPHORES VALUES ('s', 0, 4, 'seed', 0);
             INSERT INTO PERMITS_BY_OWNER VALUES ('s', 'ghost-a', 1, 0);
             INSERT INTO PERMITS_BY_OWNER VALUES ('s', 'ghost-b', 3, 0);
             INSERT INTO PERMITS_BY_OWNER VALUES ('s', 'alive', 0, 0);
             INSERT INTO HEARTBEATS VALUES ('alive', 10000, 9999999999999);",
        )
        .unwrap();
        (db, tables.sql())
    }

    #[test]
    fn test_dead_owner_scan_stops_at_wish() {
        let temp = TempDir::new().unwrap();
        let (db, sql) = seeded_db(&temp);

        let dead = db
            .transact(Duration::from_secs(5), |tx, deadline| {
                dead_owner_permits(tx, deadline, &sql, "s", 1)
            })
            .unwrap();
        assert_eq!(
            dead,
            vec![OwnerPermits {
                owner: "ghost-a".into(),
                permits: 1
            }]
        );
    }

    #[test]
    fn test_dead_owner_scan_skips_live_owners() {
        let temp = TempDir::new().unwrap();
        let (db, sql) = seeded_db(&temp);

        let dead = db
            .transact(Duration::from_secs(5), |tx, deadline| {
                dead_owner_permits(tx, deadline, &sql, "s", 100)
            })
            .unwrap();
        let owners: Vec<&str> = dead.iter().map(|d| d.owner.as_str()).collect();
        assert_eq!(owners, vec!["ghost-a", "ghost-b"]);
    }

    #[test]
    fn test_release_returns_permits_to_pool() {
        let temp = TempDir::new().unwrap();
        let (db, sql) = seeded_db(&temp);
        let me = ProcessId::from_name("reclaimer");

        let released = db
            .transact(Duration::from_secs(5), |tx, deadline| {
                release_dead_owner_permits(tx, deadline, &sql, "s", &me, 4)
            })
            .unwrap();
        assert_eq!(released, 4);

        let conn = rusqlite::Connection::open(db.path()).unwrap();
        let available: i64 = conn
            .query_row(
                "SELECT available_permits FROM SEMAPHORES WHERE name = 's'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(available, 4);
        let ghost_rows: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM PERMITS_BY_OWNER WHERE owner LIKE 'ghost%'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(ghost_rows, 0);
    }

    #[test]
    fn test_second_reclaim_finds_nothing() {
        let temp = TempDir::new().unwrap();
        let (db, sql) = seeded_db(&temp);
        let me = ProcessId::from_name("reclaimer");

        let first = db
            .transact(Duration::from_secs(5), |tx, deadline| {
                release_dead_owner_permits(tx, deadline, &sql, "s", &me, 100)
            })
            .unwrap();
        let second = db
            .transact(Duration::from_secs(5), |tx, deadline| {
                release_dead_owner_permits(tx, deadline, &sql, "s", &me, 100)
            })
            .unwrap();
        assert_eq!(first, 4);
        assert_eq!(second, 0);
    }

    #[test]
    fn test_remove_dead_unowned_rows_spares_live_owner() {
        let temp = TempDir::new().unwrap();
        let (db, sql) = seeded_db(&temp);

        let conn = rusqlite::Connection::open(db.path()).unwrap();
        conn.execute(
            "INSERT INTO PERMITS_BY_OWNER VALUES ('s', 'ghost-idle', 0, 0)",
            [],
        )
        .unwrap();

        let removed = db
            .transact(Duration::from_secs(5), |tx, deadline| {
                remove_dead_unowned_rows(tx, deadline, &sql, "s")
            })
            .unwrap();
        // ghost-idle goes; 'alive' has a liveness row and stays.
        assert_eq!(removed, 1);
        let alive_rows: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM PERMITS_BY_OWNER WHERE owner = 'alive'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(alive_rows, 1);
    }
}
