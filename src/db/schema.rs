use crate::db::tables::SemaphoreTables;

/// Render the default DDL for the three tables described by `tables`.
///
/// The unique constraints are load-bearing: one row per semaphore name, one
/// row per (name, owner) pair, one row per live process. Permit arithmetic
/// is enforced by the guarded UPDATEs, not by CHECK constraints, so that
/// capacity reductions below the currently-available count stay possible.
pub fn ddl(tables: &SemaphoreTables) -> String {
    let hb = &tables.heartbeat;
    format!(
        r#"
-- One row per distinct semaphore name.
CREATE TABLE IF NOT EXISTS {sem} (
    {name} TEXT PRIMARY KEY,
    {available} INTEGER NOT NULL,
    {total} INTEGER NOT NULL,
    {by} TEXT NOT NULL,
    {at} INTEGER NOT NULL
);

-- One row per (semaphore, owner) pair.
CREATE TABLE IF NOT EXISTS {permits} (
    {name} TEXT NOT NULL,
    {owner} TEXT NOT NULL,
    {owned} INTEGER NOT NULL,
    {at} INTEGER NOT NULL,
    UNIQUE ({name}, {owner})
);

-- One row per live process participating in any semaphore.
CREATE TABLE IF NOT EXISTS {hb} (
    {hb_owner} TEXT PRIMARY KEY,
    {interval} INTEGER NOT NULL,
    {beat} INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_{permits}_{name} ON {permits}({name});
"#,
        sem = tables.semaphore_table,
        name = tables.name_col,
        available = tables.available_col,
        total = tables.total_col,
        by = tables.last_modified_by_col,
        at = tables.last_modified_at_col,
        permits = tables.permits_table,
        owner = tables.owner_col,
        owned = tables.owned_col,
        hb = hb.table,
        hb_owner = hb.owner_col,
        interval = hb.interval_col,
        beat = hb.last_heartbeat_col,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::client::Db;
    use tempfile::TempDir;

    #[test]
    fn test_ddl_creates_tables() {
        let temp = TempDir::new().unwrap();
        let db = Db::open(temp.path().join("test.db")).unwrap();
        db.ensure_schema(&SemaphoreTables::default()).unwrap();

        let conn = rusqlite::Connection::open(temp.path().join("test.db")).unwrap();
        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap();

        assert!(tables.contains(&"SEMAPHORES".to_string()));
        assert!(tables.contains(&"PERMITS_BY_OWNER".to_string()));
        assert!(tables.contains(&"HEARTBEATS".to_string()));
    }

    #[test]
    fn test_ddl_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let db = Db::open(temp.path().join("test.db")).unwrap();
        let tables = SemaphoreTables::default();
        db.ensure_schema(&tables).unwrap();
        db.ensure_schema(&tables).unwrap();
    }

    #[test]
    fn test_owner_rows_unique_per_name_and_owner() {
        let temp = TempDir::new().unwrap();
        let db = Db::open(temp.path().join("test.db")).unwrap();
        db.ensure_schema(&SemaphoreTables::default()).unwrap();

        let conn = rusqlite::Connection::open(temp.path().join("test.db")).unwrap();
        conn.execute(
            "INSERT INTO PERMITS_BY_OWNER (name, owner, owned_permits, last_modified_at) \
             VALUES ('s', 'p1', 0, 0)",
            [],
        )
        .unwrap();
        let dup = conn.execute(
            "INSERT INTO PERMITS_BY_OWNER (name, owner, owned_permits, last_modified_at) \
             VALUES ('s', 'p1', 0, 0)",
            [],
        );
        assert!(dup.is_err());
    }
}
