pub mod client;
pub mod schema;
pub mod tables;

pub use client::{Db, Deadline};
pub use tables::{HeartbeatTable, SemaphoreSql, SemaphoreTables};
