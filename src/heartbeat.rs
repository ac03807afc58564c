//! Process-wide liveness service.
//!
//! One `Heartbeat` instance per (database, heartbeat table, process id) is
//! shared by every semaphore in the process. A background beater refreshes
//! this process's liveness row once per interval; peers treat a row older
//! than `interval * timeout_multiplier` as a dead owner and reclaim its
//! permits. If a peer reaps our row while we are alive, the next beat
//! updates zero rows and the whole process's semaphores are poisoned: that
//! is fatal and unrecoverable, because our permits may already have been
//! handed out again.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, LazyLock, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use rusqlite::{params, Transaction};

use crate::config::SemaphoreConfig;
use crate::db::{Db, Deadline, HeartbeatTable};
use crate::error::{Error, Result};
use crate::process::ProcessId;

/// Callbacks a semaphore registers for heartbeat lifecycle events.
pub struct LifecycleHooks {
    /// Invoked once if the process is declared dead by a peer.
    pub on_error: Box<dyn Fn(&Error) + Send + Sync>,
    /// Invoked on clean shutdown of the heartbeat service.
    pub on_close: Box<dyn Fn() + Send + Sync>,
}

#[derive(PartialEq, Eq, Hash, Clone)]
struct RegistryKey {
    path: PathBuf,
    table: String,
    owner: String,
}

static REGISTRY: LazyLock<Mutex<HashMap<RegistryKey, Arc<Heartbeat>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// Close every heartbeat registered in this process: notify subscribers,
/// delete the liveness rows, stop the beaters. For orderly shutdown.
pub fn shutdown_all() {
    let heartbeats: Vec<Arc<Heartbeat>> = REGISTRY
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .values()
        .cloned()
        .collect();
    for hb in heartbeats {
        hb.close();
    }
}

pub struct Heartbeat {
    db: Db,
    table: HeartbeatTable,
    process_id: ProcessId,
    interval: Duration,
    timeout_multiplier: u32,
    query_timeout: Duration,
    /// Measured duration of the initial row write; budget floor for
    /// piggybacked beats.
    beat_duration: Duration,
    beat_sql: String,
    key: RegistryKey,
    last_run: Mutex<Instant>,
    subscribers: Mutex<HashMap<u64, Arc<LifecycleHooks>>>,
    next_subscriber: AtomicU64,
    failed: AtomicBool,
    closed: AtomicBool,
    shutdown: Mutex<bool>,
    wake: Condvar,
}

impl Heartbeat {
    /// Get or create the process-wide heartbeat for `db` + `table` +
    /// `process_id`. The first attach creates the liveness row, fixes the
    /// beat interval, and spawns the beater; later attaches share it.
    pub fn attach(
        db: &Db,
        table: &HeartbeatTable,
        process_id: &ProcessId,
        config: &SemaphoreConfig,
    ) -> Result<Arc<Heartbeat>> {
        let key = RegistryKey {
            path: db.path().to_path_buf(),
            table: table.table.clone(),
            owner: process_id.as_str().to_string(),
        };
        let mut registry = REGISTRY.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = registry.get(&key) {
            return Ok(existing.clone());
        }

        let interval = config.heartbeat_interval();
        let query_timeout = config.query_timeout();
        let started = Instant::now();
        create_own_row(db, table, process_id, interval, query_timeout)?;
        let beat_duration = started.elapsed().max(Duration::from_millis(1));

        let hb = Arc::new(Heartbeat {
            db: db.clone(),
            table: table.clone(),
            process_id: process_id.clone(),
            interval,
            timeout_multiplier: config.heartbeat_timeout_multiplier,
            query_timeout,
            beat_duration,
            beat_sql: table.beat_sql(),
            key: key.clone(),
            last_run: Mutex::new(Instant::now()),
            subscribers: Mutex::new(HashMap::new()),
            next_subscriber: AtomicU64::new(1),
            failed: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            shutdown: Mutex::new(false),
            wake: Condvar::new(),
        });

        let beater = hb.clone();
        thread::Builder::new()
            .name(format!("turnstile-beat-{process_id}"))
            .spawn(move || beater.run_beater())?;

        registry.insert(key, hb.clone());
        Ok(hb)
    }

    pub fn subscribe(&self, hooks: LifecycleHooks) -> u64 {
        let id = self.next_subscriber.fetch_add(1, Ordering::SeqCst);
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, Arc::new(hooks));
        id
    }

    pub fn unsubscribe(&self, id: u64) {
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn beat_duration(&self) -> Duration {
        self.beat_duration
    }

    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    /// Piggyback a beat inside a caller's transaction. Performs the UPDATE
    /// only when the remaining budget covers a beat and the last beat is at
    /// least half an interval old. The caller must invoke [`record_beat`]
    /// after its transaction commits.
    ///
    /// [`record_beat`]: Heartbeat::record_beat
    pub fn try_beat(&self, tx: &Transaction<'_>, deadline: &Deadline) -> Result<bool> {
        if self.is_failed() {
            return Err(Error::HeartbeatLost);
        }
        if deadline.remaining() <= self.beat_duration {
            return Ok(false);
        }
        let stale = self
            .last_run
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .elapsed();
        if stale < self.interval / 2 {
            return Ok(false);
        }
        self.beat_tx(tx, deadline)?;
        Ok(true)
    }

    /// Record a successful piggybacked beat, after the enclosing
    /// transaction committed.
    pub fn record_beat(&self) {
        *self.last_run.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    /// Reap liveness rows older than their declared interval times the
    /// timeout multiplier. Runs inside the caller's transaction.
    pub fn remove_dead_heartbeat_rows(
        &self,
        tx: &Transaction<'_>,
        deadline: &Deadline,
    ) -> Result<usize> {
        deadline.check()?;
        let reaped = tx.execute(
            &self.table.delete_dead_sql(),
            params![i64::from(self.timeout_multiplier)],
        )?;
        if reaped > 0 {
            tracing::warn!("reaped {reaped} dead heartbeat row(s)");
        }
        Ok(reaped)
    }

    /// Clean shutdown: notify subscribers, delete the liveness row, stop
    /// the beater. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let hooks: Vec<Arc<LifecycleHooks>> = {
            let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
            subscribers.drain().map(|(_, h)| h).collect()
        };
        for hook in hooks {
            (hook.on_close)();
        }
        let delete = self.table.delete_own_sql();
        let owner = self.process_id.as_str().to_string();
        let result = self
            .db
            .transact_uncancellable(self.query_timeout, move |tx, deadline| {
                deadline.check()?;
                tx.execute(&delete, params![owner])?;
                Ok(())
            });
        if let Err(e) = result {
            tracing::warn!("failed to delete own heartbeat row: {e}");
        }
        {
            let mut stop = self.shutdown.lock().unwrap_or_else(|e| e.into_inner());
            *stop = true;
        }
        self.wake.notify_all();
        REGISTRY
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.key);
    }

    fn run_beater(self: Arc<Self>) {
        let mut next = Instant::now() + self.interval;
        loop {
            let mut stop = self.shutdown.lock().unwrap_or_else(|e| e.into_inner());
            loop {
                if *stop {
                    return;
                }
                let now = Instant::now();
                if now >= next {
                    break;
                }
                let (guard, _) = self
                    .wake
                    .wait_timeout(stop, next - now)
                    .unwrap_or_else(|e| e.into_inner());
                stop = guard;
            }
            drop(stop);

            match self.beat() {
                Ok(()) => {}
                Err(Error::HeartbeatLost) => {
                    self.poison(Error::HeartbeatLost);
                    return;
                }
                Err(e) => {
                    tracing::warn!("heartbeat update failed, will retry: {e}");
                }
            }
            // An overrunning beat schedules the next one immediately; there
            // is no catch-up burst.
            next += self.interval;
            let now = Instant::now();
            if next < now {
                next = now;
            }
        }
    }

    fn beat(&self) -> Result<()> {
        self.db
            .transact(self.query_timeout, |tx, deadline| self.beat_tx(tx, deadline))?;
        self.record_beat();
        Ok(())
    }

    fn beat_tx(&self, tx: &Transaction<'_>, deadline: &Deadline) -> Result<()> {
        deadline.check()?;
        let rows = tx.execute(
            &self.beat_sql,
            params![self.interval.as_millis() as i64, self.process_id.as_str()],
        )?;
        match rows {
            1 => Ok(()),
            0 => Err(Error::HeartbeatLost),
            n => Err(Error::CorruptState(format!(
                "{n} heartbeat rows for owner {}",
                self.process_id
            ))),
        }
    }

    fn poison(&self, error: Error) {
        if self.failed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::error!("{error}; poisoning all semaphores in this process");
        let hooks: Vec<Arc<LifecycleHooks>> = self
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        for hook in hooks {
            (hook.on_error)(&error);
        }
    }
}

/// Schema-tolerant row creation: INSERT, and on a unique-constraint clash
/// (a row left behind by a previous incarnation of this identity) refresh
/// the existing row instead.
fn create_own_row(
    db: &Db,
    table: &HeartbeatTable,
    process_id: &ProcessId,
    interval: Duration,
    query_timeout: Duration,
) -> Result<()> {
    let insert = table.insert_sql();
    let beat = table.beat_sql();
    let interval_ms = interval.as_millis() as i64;
    db.transact(query_timeout, |tx, deadline| {
        deadline.check()?;
        match tx.execute(&insert, params![process_id.as_str(), interval_ms]) {
            Ok(_) => Ok(()),
            Err(e) if crate::error::is_constraint_violation(&e) => {
                let rows = tx.execute(&beat, params![interval_ms, process_id.as_str()])?;
                if rows != 1 {
                    return Err(Error::CorruptState(format!(
                        "{rows} heartbeat rows for owner {process_id}"
                    )));
                }
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SemaphoreTables;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    fn fast_config() -> SemaphoreConfig {
        SemaphoreConfig {
            heartbeat_interval_ms: 50,
            query_timeout_secs: 5,
            ..Default::default()
        }
    }

    fn test_db(temp: &TempDir) -> Db {
        let db = Db::open(temp.path().join("test.db")).unwrap();
        db.ensure_schema(&SemaphoreTables::default()).unwrap();
        db
    }

    fn last_heartbeat(db: &Db, owner: &ProcessId) -> Option<i64> {
        let conn = rusqlite::Connection::open(db.path()).unwrap();
        conn.query_row(
            "SELECT last_heartbeat FROM HEARTBEATS WHERE owner = ?1",
            params![owner.as_str()],
            |row| row.get(0),
        )
        .map(Some)
        .unwrap_or(None)
    }

    #[test]
    fn test_attach_creates_row_and_is_shared() {
        let temp = TempDir::new().unwrap();
        let db = test_db(&temp);
        let pid = ProcessId::generate();
        let table = HeartbeatTable::default();

        let a = Heartbeat::attach(&db, &table, &pid, &fast_config()).unwrap();
        let b = Heartbeat::attach(&db, &table, &pid, &fast_config()).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(last_heartbeat(&db, &pid).is_some());
        a.close();
    }

    #[test]
    fn test_beater_refreshes_row() {
        let temp = TempDir::new().unwrap();
        let db = test_db(&temp);
        let pid = ProcessId::generate();
        let hb = Heartbeat::attach(&db, &HeartbeatTable::default(), &pid, &fast_config()).unwrap();

        let before = last_heartbeat(&db, &pid).unwrap();
        thread::sleep(Duration::from_millis(300));
        let after = last_heartbeat(&db, &pid).unwrap();
        assert!(after > before, "beat did not advance: {before} -> {after}");
        hb.close();
    }

    #[test]
    fn test_reap_removes_stale_rows_only() {
        let temp = TempDir::new().unwrap();
        let db = test_db(&temp);
        let pid = ProcessId::generate();
        let hb = Heartbeat::attach(&db, &HeartbeatTable::default(), &pid, &fast_config()).unwrap();

        let conn = rusqlite::Connection::open(db.path()).unwrap();
        conn.execute(
            "INSERT INTO HEARTBEATS (owner, interval_ms, last_heartbeat) VALUES ('ghost', 50, 0)",
            [],
        )
        .unwrap();

        let reaped = db
            .transact(Duration::from_secs(5), |tx, deadline| {
                hb.remove_dead_heartbeat_rows(tx, deadline)
            })
            .unwrap();
        assert_eq!(reaped, 1);
        assert!(last_heartbeat(&db, &pid).is_some());
        hb.close();
    }

    #[test]
    fn test_reaped_row_poisons_process() {
        let temp = TempDir::new().unwrap();
        let db = test_db(&temp);
        let pid = ProcessId::generate();
        let hb = Heartbeat::attach(&db, &HeartbeatTable::default(), &pid, &fast_config()).unwrap();

        let errors = Arc::new(AtomicUsize::new(0));
        let seen = errors.clone();
        hb.subscribe(LifecycleHooks {
            on_error: Box::new(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            }),
            on_close: Box::new(|| {}),
        });

        // A peer reaps our row while we are alive.
        let conn = rusqlite::Connection::open(db.path()).unwrap();
        conn.execute(
            "DELETE FROM HEARTBEATS WHERE owner = ?1",
            params![pid.as_str()],
        )
        .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while !hb.is_failed() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        assert!(hb.is_failed());
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_close_removes_row_and_notifies() {
        let temp = TempDir::new().unwrap();
        let db = test_db(&temp);
        let pid = ProcessId::generate();
        let hb = Heartbeat::attach(&db, &HeartbeatTable::default(), &pid, &fast_config()).unwrap();

        let closed = Arc::new(AtomicUsize::new(0));
        let seen = closed.clone();
        hb.subscribe(LifecycleHooks {
            on_error: Box::new(|_| {}),
            on_close: Box::new(move || {
                seen.fetch_add(1, Ordering::SeqCst);
            }),
        });

        hb.close();
        hb.close();
        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert!(last_heartbeat(&db, &pid).is_none());
    }
}
