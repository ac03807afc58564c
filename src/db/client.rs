use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use rusqlite::{Connection, Transaction, TransactionBehavior};

use crate::db::schema;
use crate::db::tables::SemaphoreTables;
use crate::error::{Error, Result};

/// Absolute transaction budget. Statement timeouts are derived from the
/// remaining budget, rounded down to whole seconds and clamped to >= 1.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    pub fn after(budget: Duration) -> Self {
        Self {
            at: Instant::now() + budget,
        }
    }

    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    pub fn expired(&self) -> bool {
        self.remaining() == Duration::ZERO
    }

    /// Err(Timeout) once the budget is spent. Call before issuing a statement.
    pub fn check(&self) -> Result<()> {
        if self.expired() {
            return Err(Error::Timeout);
        }
        Ok(())
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.remaining().as_secs().max(1))
    }
}

/// Handle to the shared database file.
///
/// Every transaction runs on a fresh connection: the unit of work receives
/// the open transaction and the remaining budget, commits on `Ok` and rolls
/// back on `Err`. Cancellation is cooperative; the deadline is the sole
/// mechanism.
#[derive(Debug, Clone)]
pub struct Db {
    path: Arc<PathBuf>,
}

impl Db {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = Self {
            path: Arc::new(path.as_ref().to_path_buf()),
        };
        // Fail fast on an unopenable path and pin WAL mode for cross-process
        // readers-do-not-block-writers behavior.
        let conn = db.connect(&Deadline::after(Duration::from_secs(1)))?;
        drop(conn);
        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn connect(&self, deadline: &Deadline) -> Result<Connection> {
        let conn = Connection::open(self.path.as_ref())?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.busy_timeout(deadline.query_timeout())?;
        Ok(conn)
    }

    /// Create the semaphore tables if they do not exist yet.
    pub fn ensure_schema(&self, tables: &SemaphoreTables) -> Result<()> {
        let conn = self.connect(&Deadline::after(Duration::from_secs(10)))?;
        conn.execute_batch(&schema::ddl(tables))?;
        Ok(())
    }

    /// Run `f` inside a fresh IMMEDIATE transaction bounded by `budget`.
    pub fn transact<T>(
        &self,
        budget: Duration,
        f: impl FnOnce(&Transaction<'_>, &Deadline) -> Result<T>,
    ) -> Result<T> {
        let deadline = Deadline::after(budget);
        let mut conn = self.connect(&deadline)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        match f(&tx, &deadline) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(e) => {
                // Dropping the transaction rolls it back.
                drop(tx);
                Err(e)
            }
        }
    }

    /// Variant for release paths: must not be abandoned on a transient
    /// failure, or permits leak. Retries lock contention with capped backoff
    /// until ten times the base budget, then surfaces the error.
    pub fn transact_uncancellable<T>(
        &self,
        budget: Duration,
        mut f: impl FnMut(&Transaction<'_>, &Deadline) -> Result<T>,
    ) -> Result<T> {
        let give_up = Instant::now() + budget * 10;
        let mut backoff = Duration::from_millis(10);
        loop {
            match self.transact(budget, &mut f) {
                Err(e) if e.is_transient() && Instant::now() < give_up => {
                    tracing::warn!("retrying non-cancellable transaction: {e}");
                    thread::sleep(backoff);
                    backoff = (backoff * 2).min(Duration::from_secs(1));
                }
                other => return other,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_db(temp: &TempDir) -> Db {
        let db = Db::open(temp.path().join("test.db")).unwrap();
        db.ensure_schema(&SemaphoreTables::default()).unwrap();
        db
    }

    #[test]
    fn test_commit_on_ok() {
        let temp = TempDir::new().unwrap();
        let db = test_db(&temp);

        db.transact(Duration::from_secs(5), |tx, _| {
            tx.execute(
                "INSERT INTO SEMAPHORES (name, available_permits, total_permits, \
                 last_modified_by, last_modified_at) VALUES ('s', 1, 1, 'me', 0)",
                [],
            )?;
            Ok(())
        })
        .unwrap();

        let count: i64 = db
            .transact(Duration::from_secs(5), |tx, _| {
                Ok(tx.query_row("SELECT COUNT(*) FROM SEMAPHORES", [], |r| r.get(0))?)
            })
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_rollback_on_err() {
        let temp = TempDir::new().unwrap();
        let db = test_db(&temp);

        let result: Result<()> = db.transact(Duration::from_secs(5), |tx, _| {
            tx.execute(
                "INSERT INTO SEMAPHORES (name, available_permits, total_permits, \
                 last_modified_by, last_modified_at) VALUES ('s', 1, 1, 'me', 0)",
                [],
            )?;
            Err(Error::Invariant("abort".into()))
        });
        assert!(result.is_err());

        let count: i64 = db
            .transact(Duration::from_secs(5), |tx, _| {
                Ok(tx.query_row("SELECT COUNT(*) FROM SEMAPHORES", [], |r| r.get(0))?)
            })
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_deadline_query_timeout_clamps_to_one_second() {
        let deadline = Deadline::after(Duration::from_millis(200));
        assert_eq!(deadline.query_timeout(), Duration::from_secs(1));

        let deadline = Deadline::after(Duration::from_secs(7));
        assert!(deadline.query_timeout() >= Duration::from_secs(6));
    }

    #[test]
    fn test_deadline_check_expires() {
        let deadline = Deadline::after(Duration::ZERO);
        assert!(deadline.expired());
        assert!(matches!(deadline.check(), Err(Error::Timeout)));
    }
}
