//! The semaphore instance.
//!
//! Permit accounting lives in the database; this module wraps it in the
//! acquire/release protocol. Within one process, all instances of one
//! semaphore name serialize on an interned mutex and share its condition
//! variable, so an in-process release wakes in-process waiters without a
//! database roundtrip. Across processes the only coordination is the
//! conditional UPDATE gate `available_permits >= k`.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use rand::Rng;
use rusqlite::{params, Transaction};
use serde::Serialize;

use crate::config::SemaphoreConfig;
use crate::db::{Db, Deadline, SemaphoreSql, SemaphoreTables};
use crate::error::{Error, Result};
use crate::heartbeat::{Heartbeat, LifecycleHooks};
use crate::intern::{self, NameLock};
use crate::process::ProcessId;
use crate::reclaim;
use crate::worker;

/// Read-only diagnostic snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct SemaphoreStatus {
    pub name: String,
    pub total: i64,
    pub available: i64,
    pub owned_by_me: i64,
    pub healthy: bool,
    pub query_timeout_secs: u64,
}

/// A database-backed distributed counting semaphore.
///
/// One instance per (process, semaphore name). Dropping the instance
/// releases its permits and detaches it from the heartbeat service.
pub struct Semaphore {
    inner: Arc<Inner>,
}

struct Inner {
    db: Db,
    sql: SemaphoreSql,
    name: String,
    process_id: ProcessId,
    query_timeout: Duration,
    acquire_poll: Duration,
    heartbeat: Arc<Heartbeat>,
    lock: Arc<NameLock>,
    /// Permits this instance holds. Mutated only under `lock.mutex`.
    owned: AtomicU32,
    healthy: AtomicBool,
    closed: AtomicBool,
    failure: Mutex<Option<String>>,
    subscription: Mutex<Option<u64>>,
}

impl Semaphore {
    /// Open (and create if needed) the semaphore `name` with
    /// `config.total_permits` initial permits.
    ///
    /// With `config.strict`, an existing row with a different total
    /// capacity fails construction instead of being silently reused.
    pub fn open(
        db: &Db,
        tables: &SemaphoreTables,
        name: &str,
        process_id: ProcessId,
        config: &SemaphoreConfig,
    ) -> Result<Semaphore> {
        config.validate()?;
        let sql = tables.sql();
        let query_timeout = config.query_timeout();

        // The liveness row must exist before the owner row, or a peer's
        // cleanup could reap the fresh zero-permit row mid-construction.
        let heartbeat = Heartbeat::attach(db, &tables.heartbeat, &process_id, config)?;

        // Lost creation races show up as unique-constraint violations; one
        // retry revalidates against the row the winner inserted.
        match create_semaphore_row(db, &sql, name, &process_id, config, query_timeout) {
            Err(e) if e.is_constraint_violation() => {
                create_semaphore_row(db, &sql, name, &process_id, config, query_timeout)?;
            }
            other => other?,
        }
        create_owner_row(db, &sql, name, &process_id, query_timeout)?;

        let inner = Arc::new(Inner {
            db: db.clone(),
            sql,
            name: name.to_string(),
            process_id,
            query_timeout,
            acquire_poll: config.acquire_poll(),
            heartbeat: heartbeat.clone(),
            lock: intern::lock_for(name),
            owned: AtomicU32::new(0),
            healthy: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            failure: Mutex::new(None),
            subscription: Mutex::new(None),
        });

        let on_error = Arc::downgrade(&inner);
        let on_close = Arc::downgrade(&inner);
        let subscription = heartbeat.subscribe(LifecycleHooks {
            on_error: Box::new(move |e: &Error| {
                if let Some(inner) = Weak::upgrade(&on_error) {
                    inner.poison(e);
                }
            }),
            on_close: Box::new(move || {
                if let Some(inner) = Weak::upgrade(&on_close) {
                    inner.close();
                }
            }),
        });
        *inner
            .subscription
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(subscription);

        Ok(Semaphore { inner })
    }

    /// Try to reserve `permits` permits before `timeout` elapses. Returns
    /// whether they were reserved; never reserves partially.
    pub fn try_acquire(&self, permits: u32, timeout: Duration) -> Result<bool> {
        Inner::try_acquire(&self.inner, permits, timeout)
    }

    /// Like [`try_acquire`], but a missed deadline is an error.
    ///
    /// [`try_acquire`]: Semaphore::try_acquire
    pub fn acquire(&self, permits: u32, timeout: Duration) -> Result<()> {
        if Inner::try_acquire(&self.inner, permits, timeout)? {
            Ok(())
        } else {
            Err(Error::Timeout)
        }
    }

    /// Release `permits` of this process's held permits. Not cancellable:
    /// once entered, the transaction retries transient failures to
    /// completion rather than leak permits.
    pub fn release(&self, permits: u32) -> Result<()> {
        let _guard = self.inner.lock_name();
        self.inner.release_locked(permits)
    }

    /// Release every permit this instance holds.
    pub fn release_all(&self) -> Result<()> {
        let _guard = self.inner.lock_name();
        let owned = self.inner.owned.load(Ordering::Relaxed);
        if owned == 0 {
            return Ok(());
        }
        self.inner.release_locked(owned)
    }

    /// Set total capacity to `total`, adjusting the available count by the
    /// same delta.
    pub fn update_permits(&self, total: u32) -> Result<()> {
        let inner = &self.inner;
        inner.db.transact(inner.query_timeout, |tx, deadline| {
            deadline.check()?;
            let rows = tx.execute(
                &inner.sql.update_permits,
                params![total, inner.process_id.as_str(), inner.name],
            )?;
            inner.expect_one_semaphore_row(rows, "update permits")
        })
    }

    /// Decrease both totals by `permits`, failing if fewer than `permits`
    /// total exist.
    pub fn reduce_permits(&self, permits: u32) -> Result<()> {
        let inner = &self.inner;
        inner.db.transact(inner.query_timeout, |tx, deadline| {
            deadline.check()?;
            let rows = tx.execute(
                &inner.sql.reduce_permits,
                params![permits, inner.process_id.as_str(), inner.name],
            )?;
            match rows {
                1 => Ok(()),
                0 => Err(Error::Invariant(format!(
                    "cannot reduce '{}' total permits by {permits}",
                    inner.name
                ))),
                n => Err(Error::CorruptState(format!(
                    "{n} rows for semaphore '{}'",
                    inner.name
                ))),
            }
        })
    }

    /// Increase both totals by `permits`.
    pub fn increase_permits(&self, permits: u32) -> Result<()> {
        let inner = &self.inner;
        inner.db.transact(inner.query_timeout, |tx, deadline| {
            deadline.check()?;
            let rows = tx.execute(
                &inner.sql.increase_permits,
                params![permits, inner.process_id.as_str(), inner.name],
            )?;
            inner.expect_one_semaphore_row(rows, "increase permits")
        })
    }

    pub fn available_permits(&self) -> Result<i64> {
        self.inner.select_permits().map(|(available, _)| available)
    }

    pub fn total_permits(&self) -> Result<i64> {
        let inner = &self.inner;
        inner.db.transact(inner.query_timeout, |tx, deadline| {
            deadline.check()?;
            inner.single_i64(tx, &inner.sql.select_total, params![inner.name])
        })
    }

    /// Permits recorded for this process in the database.
    pub fn permits_owned(&self) -> Result<i64> {
        let inner = &self.inner;
        inner.db.transact(inner.query_timeout, |tx, deadline| {
            deadline.check()?;
            inner.single_i64(
                tx,
                &inner.sql.select_owned,
                params![inner.process_id.as_str(), inner.name],
            )
        })
    }

    /// Return up to `wish` permits held by dead owners to the pool.
    /// Returns the number actually recovered.
    pub fn release_dead_owner_permits(&self, wish: u32) -> Result<i64> {
        let inner = &self.inner;
        inner.db.transact(inner.query_timeout, |tx, deadline| {
            reclaim::release_dead_owner_permits(
                tx,
                deadline,
                &inner.sql,
                &inner.name,
                &inner.process_id,
                wish,
            )
        })
    }

    /// Reap expired liveness rows and, only if any were reaped, drop
    /// zero-permit owner rows that no longer have one. Returns the number
    /// of owner rows dropped.
    pub fn remove_dead_heartbeat_and_not_owner_rows(&self, budget: Duration) -> Result<usize> {
        self.inner.cleanup_dead_rows(budget)
    }

    pub fn status(&self) -> Result<SemaphoreStatus> {
        let inner = &self.inner;
        let (available, total) = inner.select_permits()?;
        Ok(SemaphoreStatus {
            name: inner.name.clone(),
            total,
            available,
            owned_by_me: i64::from(inner.owned.load(Ordering::Relaxed)),
            healthy: inner.is_healthy(),
            query_timeout_secs: inner.query_timeout.as_secs(),
        })
    }

    pub fn is_healthy(&self) -> bool {
        self.inner.is_healthy()
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn process_id(&self) -> &ProcessId {
        &self.inner.process_id
    }

    /// Release all held permits, detach from the heartbeat service, and
    /// mark the instance unusable. Best-effort and idempotent.
    pub fn close(&self) {
        self.inner.close();
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        self.inner.close();
    }
}

impl Inner {
    fn lock_name(&self) -> std::sync::MutexGuard<'_, ()> {
        self.lock.mutex.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
            && !self.closed.load(Ordering::SeqCst)
            && !self.heartbeat.is_failed()
    }

    fn check_health(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        if !self.healthy.load(Ordering::SeqCst) || self.heartbeat.is_failed() {
            let failure = self.failure.lock().unwrap_or_else(|e| e.into_inner());
            tracing::error!(
                "semaphore '{}' unusable: {}",
                self.name,
                failure.as_deref().unwrap_or("heartbeat failed")
            );
            return Err(Error::HeartbeatLost);
        }
        Ok(())
    }

    fn poison(&self, error: &Error) {
        self.healthy.store(false, Ordering::SeqCst);
        *self.failure.lock().unwrap_or_else(|e| e.into_inner()) = Some(error.to_string());
        // Wake waiters so they observe the failure now, not at poll expiry.
        self.lock.waiters.notify_all();
    }

    fn try_acquire(inner: &Arc<Self>, permits: u32, timeout: Duration) -> Result<bool> {
        let this = &**inner;
        if permits == 0 {
            return Err(Error::Invariant(
                "must request at least one permit".to_string(),
            ));
        }
        let deadline = Instant::now() + timeout;
        let mut rng = rand::rng();
        let mut guard = this.lock_name();

        loop {
            this.check_health()?;

            let remaining = deadline.saturating_duration_since(Instant::now());
            let mut beat_done = false;
            let attempt = this.db.transact(
                remaining.max(Duration::from_secs(1)),
                |tx, tx_deadline| {
                    let acquired = this.acquire_tx(tx, tx_deadline, permits)?;
                    beat_done = this.heartbeat.try_beat(tx, tx_deadline)?;
                    Ok(acquired)
                },
            );

            let blocked = match attempt {
                Ok(acquired) => {
                    if beat_done {
                        this.heartbeat.record_beat();
                    }
                    if acquired {
                        this.owned.fetch_add(permits, Ordering::Relaxed);
                        return Ok(true);
                    }
                    true
                }
                Err(
                    e @ (Error::Invariant(_)
                    | Error::CorruptState(_)
                    | Error::HeartbeatLost
                    | Error::Closed),
                ) => return Err(e),
                Err(e) => {
                    // Transport blip: the transaction rolled back; retry
                    // within the deadline without running reclamation.
                    tracing::warn!("acquire attempt on '{}' failed: {e}", this.name);
                    false
                }
            };

            if blocked {
                let cleanup = {
                    let job = inner.clone();
                    worker::submit(move || job.cleanup_dead_rows(Duration::from_secs(60)))
                };
                match cleanup.wait(deadline.saturating_duration_since(Instant::now())) {
                    // Cleanup still running in the background; give up now.
                    None => return Ok(false),
                    Some(Err(e)) => return Err(e),
                    Some(Ok(_)) => {}
                }

                let reclaimed = this.db.transact(this.query_timeout, |tx, tx_deadline| {
                    reclaim::release_dead_owner_permits(
                        tx,
                        tx_deadline,
                        &this.sql,
                        &this.name,
                        &this.process_id,
                        permits,
                    )
                })?;
                if reclaimed > 0 {
                    continue;
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(false);
            }
            let poll_ms = this.acquire_poll.as_millis() as u64;
            let wait = remaining.min(Duration::from_millis(rng.random_range(0..poll_ms).max(1)));
            guard = this
                .lock
                .waiters
                .wait_timeout(guard, wait)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
    }

    fn acquire_tx(
        &self,
        tx: &Transaction<'_>,
        deadline: &Deadline,
        permits: u32,
    ) -> Result<bool> {
        deadline.check()?;
        let rows = tx.execute(
            &self.sql.acquire,
            params![permits, self.process_id.as_str(), self.name],
        )?;
        match rows {
            0 => Ok(false),
            1 => {
                let owner_rows = tx.execute(
                    &self.sql.acquire_by_owner,
                    params![permits, self.process_id.as_str(), self.name],
                )?;
                if owner_rows != 1 {
                    return Err(Error::Invariant(format!(
                        "updated {owner_rows} owner rows for '{}' owner {}",
                        self.name, self.process_id
                    )));
                }
                Ok(true)
            }
            n => Err(Error::CorruptState(format!(
                "{n} semaphore rows updated for '{}'",
                self.name
            ))),
        }
    }

    /// Caller must hold the name mutex.
    fn release_locked(&self, permits: u32) -> Result<()> {
        self.db
            .transact_uncancellable(self.query_timeout, |tx, deadline| {
                deadline.check()?;
                tx.execute(
                    &self.sql.release,
                    params![permits, self.process_id.as_str(), self.name],
                )?;
                let rows = tx.execute(
                    &self.sql.release_by_owner,
                    params![permits, self.process_id.as_str(), self.name],
                )?;
                if rows != 1 {
                    return Err(Error::Invariant(format!(
                        "releasing {permits} permit(s) of '{}' exceeds those owned by {}",
                        self.name, self.process_id
                    )));
                }
                Ok(())
            })?;
        let owned = self.owned.load(Ordering::Relaxed);
        self.owned
            .store(owned.saturating_sub(permits), Ordering::Relaxed);
        self.lock.waiters.notify_all();
        Ok(())
    }

    fn cleanup_dead_rows(&self, budget: Duration) -> Result<usize> {
        self.db.transact(budget, |tx, deadline| {
            let reaped = self.heartbeat.remove_dead_heartbeat_rows(tx, deadline)?;
            if reaped > 0 {
                reclaim::remove_dead_unowned_rows(tx, deadline, &self.sql, &self.name)
            } else {
                Ok(0)
            }
        })
    }

    fn select_permits(&self) -> Result<(i64, i64)> {
        self.db.transact(self.query_timeout, |tx, deadline| {
            deadline.check()?;
            let mut stmt = tx.prepare(&self.sql.select_permits)?;
            let mut rows = stmt.query(params![self.name])?;
            let row = rows.next()?.ok_or_else(|| {
                Error::Invariant(format!("no semaphore named '{}'", self.name))
            })?;
            let result = (row.get(0)?, row.get(1)?);
            if rows.next()?.is_some() {
                return Err(Error::CorruptState(format!(
                    "multiple semaphore rows named '{}'",
                    self.name
                )));
            }
            Ok(result)
        })
    }

    fn single_i64<P: rusqlite::Params>(
        &self,
        tx: &Transaction<'_>,
        sql: &str,
        params: P,
    ) -> Result<i64> {
        let mut stmt = tx.prepare(sql)?;
        let mut rows = stmt.query(params)?;
        let row = rows
            .next()?
            .ok_or_else(|| Error::Invariant(format!("no row for semaphore '{}'", self.name)))?;
        let value: i64 = row.get(0)?;
        if rows.next()?.is_some() {
            return Err(Error::CorruptState(format!(
                "multiple rows for semaphore '{}'",
                self.name
            )));
        }
        Ok(value)
    }

    fn expect_one_semaphore_row(&self, rows: usize, op: &str) -> Result<()> {
        match rows {
            1 => Ok(()),
            0 => Err(Error::Invariant(format!(
                "no semaphore named '{}' to {op}",
                self.name
            ))),
            n => Err(Error::CorruptState(format!(
                "{n} rows for semaphore '{}'",
                self.name
            ))),
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let owned = self.owned.load(Ordering::Relaxed);
        if owned > 0 {
            let released = {
                let _guard = self.lock_name();
                self.release_locked(owned)
            };
            if let Err(e) = released {
                tracing::warn!("failed to release permits closing '{}': {e}", self.name);
            }
        }
        if let Some(id) = self
            .subscription
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            self.heartbeat.unsubscribe(id);
        }
        self.healthy.store(false, Ordering::SeqCst);
    }
}

fn create_semaphore_row(
    db: &Db,
    sql: &SemaphoreSql,
    name: &str,
    process_id: &ProcessId,
    config: &SemaphoreConfig,
    query_timeout: Duration,
) -> Result<()> {
    db.transact(query_timeout, |tx, deadline| {
        deadline.check()?;
        let mut stmt = tx.prepare(&sql.select_permits)?;
        let mut rows = stmt.query(params![name])?;
        match rows.next()? {
            None => {
                tx.execute(
                    &sql.insert_semaphore,
                    params![
                        name,
                        config.total_permits,
                        config.total_permits,
                        process_id.as_str()
                    ],
                )?;
            }
            Some(row) => {
                let existing: i64 = row.get(1)?;
                if config.strict && existing != i64::from(config.total_permits) {
                    return Err(Error::StrictMismatch {
                        name: name.to_string(),
                        existing,
                        requested: i64::from(config.total_permits),
                    });
                }
                if rows.next()?.is_some() {
                    return Err(Error::CorruptState(format!(
                        "multiple semaphore rows named '{name}'"
                    )));
                }
            }
        }
        Ok(())
    })
}

fn create_owner_row(
    db: &Db,
    sql: &SemaphoreSql,
    name: &str,
    process_id: &ProcessId,
    query_timeout: Duration,
) -> Result<()> {
    db.transact(query_timeout, |tx, deadline| {
        deadline.check()?;
        match tx.execute(&sql.insert_owner, params![name, process_id.as_str()]) {
            Ok(_) => Ok(()),
            // Another instance of this process already created the pair.
            Err(e) if crate::error::is_constraint_violation(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    })
}
