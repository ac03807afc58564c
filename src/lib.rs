//! # Turnstile
//!
//! A distributed counting semaphore backed by three tables in a shared
//! relational database, with heartbeat-based detection of dead participants
//! and transactional recovery of their permits. No external coordination
//! service: if your processes already share a database, they can share
//! semaphores.
//!
//! ## Library Usage
//!
//! ```rust,ignore
//! use std::time::Duration;
//! use turnstile::config::SemaphoreConfig;
//! use turnstile::db::{Db, SemaphoreTables};
//! use turnstile::process::ProcessId;
//! use turnstile::semaphore::Semaphore;
//!
//! let tables = SemaphoreTables::default();
//! let db = Db::open("./shared.db")?;
//! db.ensure_schema(&tables)?;
//!
//! let sem = Semaphore::open(
//!     &db,
//!     &tables,
//!     "batch-slots",
//!     ProcessId::generate(),
//!     &SemaphoreConfig { total_permits: 4, ..Default::default() },
//! )?;
//! if sem.try_acquire(1, Duration::from_secs(30))? {
//!     // ... bounded work ...
//!     sem.release(1)?;
//! }
//! ```
//!
//! ## Feature Flags
//!
//! - `cli` (default): Includes the `turnstile` diagnostic binary.

pub mod config;
pub mod db;
pub mod error;
pub mod heartbeat;
pub mod process;
pub mod reclaim;
pub mod semaphore;

mod intern;
mod worker;
