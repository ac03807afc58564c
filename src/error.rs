use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("deadline expired")]
    Timeout,

    #[error("invariant violation: {0}")]
    Invariant(String),

    #[error("semaphore '{name}' total permits different: {existing} != {requested}")]
    StrictMismatch {
        name: String,
        existing: i64,
        requested: i64,
    },

    #[error("corrupt state: {0}")]
    CorruptState(String),

    #[error("heartbeat lost: this process was declared dead by a peer")]
    HeartbeatLost,

    #[error("semaphore is closed")]
    Closed,

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// True for unique/primary-key violations, which the construction
    /// protocol treats as a lost creation race rather than a failure.
    pub fn is_constraint_violation(&self) -> bool {
        matches!(self, Error::Database(e) if is_constraint_violation(e))
    }

    /// True for lock contention errors that a bounded retry can absorb.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Database(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::DatabaseBusy
                    || e.code == rusqlite::ErrorCode::DatabaseLocked
        )
    }
}

pub(crate) fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(f, _)
            if f.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

pub type Result<T> = std::result::Result<T, Error>;
