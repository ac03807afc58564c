use std::path::PathBuf;
use std::time::Duration;

use anyhow::bail;
use chrono::{TimeZone, Utc};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use turnstile::config::SemaphoreConfig;
use turnstile::db::{Db, SemaphoreTables};
use turnstile::process::ProcessId;
use turnstile::semaphore::Semaphore;

#[derive(Parser)]
#[command(name = "turnstile")]
#[command(about = "Database-backed distributed semaphore diagnostics", long_about = None)]
struct Cli {
    /// Path to the shared database file
    #[arg(long, global = true, default_value = "./turnstile.db")]
    db: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the semaphore tables
    Init,

    /// Show semaphore rows
    Status {
        /// Limit to one semaphore name
        #[arg(long)]
        name: Option<String>,

        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Show liveness rows with their age
    Heartbeats {
        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Reap dead liveness rows and orphaned owner rows once
    Reap {
        /// Semaphore name to clean owner rows for
        #[arg(long)]
        name: String,
    },

    /// Acquire permits and hold them until killed (or for --hold-ms)
    Hold {
        #[arg(long)]
        name: String,

        /// Permits to acquire
        #[arg(long, default_value = "1")]
        permits: u32,

        /// Initial total capacity if this process creates the semaphore
        #[arg(long, default_value = "1")]
        total: u32,

        /// Acquire timeout in milliseconds
        #[arg(long, default_value = "10000")]
        timeout_ms: u64,

        /// Beat interval in milliseconds
        #[arg(long, default_value = "10000")]
        heartbeat_interval_ms: u64,

        /// Release and exit after this long; absent means hold forever
        #[arg(long)]
        hold_ms: Option<u64>,
    },

    /// One-shot acquire-then-release probe; exits 2 on timeout
    Acquire {
        #[arg(long)]
        name: String,

        #[arg(long, default_value = "1")]
        permits: u32,

        #[arg(long, default_value = "1")]
        total: u32,

        #[arg(long, default_value = "5000")]
        timeout_ms: u64,

        #[arg(long, default_value = "10000")]
        heartbeat_interval_ms: u64,
    },
}

fn run_status(db: &Db, name: Option<String>, json: bool) -> anyhow::Result<()> {
    let tables = SemaphoreTables::default();
    let conn = rusqlite::Connection::open(db.path())?;
    let mut stmt = conn.prepare(&tables.sql().select_all_semaphores)?;
    let rows: Vec<(String, i64, i64, String, i64)> = stmt
        .query_map([], |row| {
            Ok((
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
            ))
        })?
        .collect::<std::result::Result<_, _>>()?;

    let rows: Vec<_> = rows
        .into_iter()
        .filter(|(n, ..)| name.as_deref().map_or(true, |want| want == n))
        .collect();

    if json {
        let entries: Vec<serde_json::Value> = rows
            .iter()
            .map(|(name, available, total, by, at)| {
                serde_json::json!({
                    "name": name,
                    "available_permits": available,
                    "total_permits": total,
                    "last_modified_by": by,
                    "last_modified_at": at,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    if rows.is_empty() {
        println!("no semaphores");
        return Ok(());
    }
    for (name, available, total, by, at) in rows {
        let modified = Utc
            .timestamp_millis_opt(at)
            .single()
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| at.to_string());
        println!("{name}: {available}/{total} available (last modified by {by} at {modified})");
    }
    Ok(())
}

fn run_heartbeats(db: &Db, json: bool) -> anyhow::Result<()> {
    let tables = SemaphoreTables::default();
    let conn = rusqlite::Connection::open(db.path())?;
    let mut stmt = conn.prepare(&tables.heartbeat.select_all_sql())?;
    let rows: Vec<(String, i64, i64, i64)> = stmt
        .query_map([], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
        })?
        .collect::<std::result::Result<_, _>>()?;

    if json {
        let entries: Vec<serde_json::Value> = rows
            .iter()
            .map(|(owner, interval, beat, age)| {
                serde_json::json!({
                    "owner": owner,
                    "interval_ms": interval,
                    "last_heartbeat": beat,
                    "age_ms": age,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    if rows.is_empty() {
        println!("no live owners");
        return Ok(());
    }
    for (owner, interval, _, age) in rows {
        println!("{owner}: beating every {interval} ms, last beat {age} ms ago");
    }
    Ok(())
}

fn run_reap(db: &Db, name: String) -> anyhow::Result<()> {
    let config = SemaphoreConfig::default();
    let sem = Semaphore::open(
        db,
        &SemaphoreTables::default(),
        &name,
        ProcessId::generate(),
        &config,
    )?;
    let removed = sem.remove_dead_heartbeat_and_not_owner_rows(Duration::from_secs(60))?;
    let reclaimed = sem.release_dead_owner_permits(u32::MAX)?;
    println!("removed {removed} orphaned owner row(s), reclaimed {reclaimed} permit(s)");
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn run_hold(
    db: &Db,
    name: String,
    permits: u32,
    total: u32,
    timeout_ms: u64,
    heartbeat_interval_ms: u64,
    hold_ms: Option<u64>,
) -> anyhow::Result<()> {
    let config = SemaphoreConfig {
        total_permits: total,
        heartbeat_interval_ms,
        ..Default::default()
    };
    let sem = Semaphore::open(
        db,
        &SemaphoreTables::default(),
        &name,
        ProcessId::generate(),
        &config,
    )?;

    if !sem.try_acquire(permits, Duration::from_millis(timeout_ms))? {
        bail!("could not acquire {permits} permit(s) of '{name}' in {timeout_ms} ms");
    }
    println!("acquired");

    match hold_ms {
        Some(ms) => std::thread::sleep(Duration::from_millis(ms)),
        None => loop {
            std::thread::sleep(Duration::from_secs(3600));
        },
    }

    sem.release(permits)?;
    println!("released");
    Ok(())
}

fn run_acquire(
    db: &Db,
    name: String,
    permits: u32,
    total: u32,
    timeout_ms: u64,
    heartbeat_interval_ms: u64,
) -> anyhow::Result<()> {
    let config = SemaphoreConfig {
        total_permits: total,
        heartbeat_interval_ms,
        ..Default::default()
    };
    let sem = Semaphore::open(
        db,
        &SemaphoreTables::default(),
        &name,
        ProcessId::generate(),
        &config,
    )?;

    if sem.try_acquire(permits, Duration::from_millis(timeout_ms))? {
        sem.release(permits)?;
        println!("acquired");
        Ok(())
    } else {
        eprintln!("timed out");
        turnstile::heartbeat::shutdown_all();
        std::process::exit(2);
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("turnstile=info".parse()?))
        .init();

    let cli = Cli::parse();
    let db = Db::open(&cli.db)?;

    let result = match cli.command {
        Commands::Init => {
            db.ensure_schema(&SemaphoreTables::default())?;
            println!("initialized {}", cli.db.display());
            Ok(())
        }
        Commands::Status { name, json } => run_status(&db, name, json),
        Commands::Heartbeats { json } => run_heartbeats(&db, json),
        Commands::Reap { name } => run_reap(&db, name),
        Commands::Hold {
            name,
            permits,
            total,
            timeout_ms,
            heartbeat_interval_ms,
            hold_ms,
        } => run_hold(
            &db,
            name,
            permits,
            total,
            timeout_ms,
            heartbeat_interval_ms,
            hold_ms,
        ),
        Commands::Acquire {
            name,
            permits,
            total,
            timeout_ms,
            heartbeat_interval_ms,
        } => run_acquire(&db, name, permits, total, timeout_ms, heartbeat_interval_ms),
    };

    // Orderly exit: delete this process's liveness row so peers need not
    // wait out the deadness threshold.
    turnstile::heartbeat::shutdown_all();
    result
}
