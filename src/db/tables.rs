//! Table and column descriptors.
//!
//! Every table name, column name, and the dialect's current-time expression
//! is parameterized so the semaphore can sit on top of an existing schema
//! naming convention. The descriptors render the full SQL statement set
//! once, at semaphore construction; names bind as parameters at execution.

/// SQLite expression yielding milliseconds since the Unix epoch as an integer.
pub const SQLITE_NOW_MILLIS: &str =
    "CAST((julianday('now') - 2440587.5) * 86400000.0 AS INTEGER)";

/// Describes the liveness table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HeartbeatTable {
    pub table: String,
    pub owner_col: String,
    pub interval_col: String,
    pub last_heartbeat_col: String,
    /// Dialect-specific current-time expression, milliseconds since epoch.
    pub now_expr: String,
}

impl Default for HeartbeatTable {
    fn default() -> Self {
        Self {
            table: "HEARTBEATS".into(),
            owner_col: "owner".into(),
            interval_col: "interval_ms".into(),
            last_heartbeat_col: "last_heartbeat".into(),
            now_expr: SQLITE_NOW_MILLIS.into(),
        }
    }
}

impl HeartbeatTable {
    /// INSERT of this process's liveness row. Binds: owner, interval_ms.
    pub fn insert_sql(&self) -> String {
        format!(
            "INSERT INTO {t} ({owner}, {interval}, {beat}) VALUES (?1, ?2, {now})",
            t = self.table,
            owner = self.owner_col,
            interval = self.interval_col,
            beat = self.last_heartbeat_col,
            now = self.now_expr,
        )
    }

    /// The beat. Binds: interval_ms, owner.
    pub fn beat_sql(&self) -> String {
        format!(
            "UPDATE {t} SET {beat} = {now}, {interval} = ?1 WHERE {owner} = ?2",
            t = self.table,
            beat = self.last_heartbeat_col,
            now = self.now_expr,
            interval = self.interval_col,
            owner = self.owner_col,
        )
    }

    /// Removes this process's own row on clean shutdown. Binds: owner.
    pub fn delete_own_sql(&self) -> String {
        format!(
            "DELETE FROM {t} WHERE {owner} = ?1",
            t = self.table,
            owner = self.owner_col,
        )
    }

    /// Reaps rows whose beat is older than the row's declared interval times
    /// the timeout multiplier. Binds: multiplier.
    pub fn delete_dead_sql(&self) -> String {
        format!(
            "DELETE FROM {t} WHERE {beat} < {now} - ({interval} * ?1)",
            t = self.table,
            beat = self.last_heartbeat_col,
            now = self.now_expr,
            interval = self.interval_col,
        )
    }

    /// All rows with their age in milliseconds. Diagnostic surface.
    pub fn select_all_sql(&self) -> String {
        format!(
            "SELECT {owner}, {interval}, {beat}, {now} - {beat} FROM {t} ORDER BY {owner}",
            owner = self.owner_col,
            interval = self.interval_col,
            beat = self.last_heartbeat_col,
            now = self.now_expr,
            t = self.table,
        )
    }
}

/// Describes the semaphore and per-owner permit tables.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SemaphoreTables {
    pub semaphore_table: String,
    pub name_col: String,
    pub available_col: String,
    pub total_col: String,
    pub last_modified_by_col: String,
    pub last_modified_at_col: String,
    pub permits_table: String,
    pub owner_col: String,
    pub owned_col: String,
    pub heartbeat: HeartbeatTable,
}

impl Default for SemaphoreTables {
    fn default() -> Self {
        Self {
            semaphore_table: "SEMAPHORES".into(),
            name_col: "name".into(),
            available_col: "available_permits".into(),
            total_col: "total_permits".into(),
            last_modified_by_col: "last_modified_by".into(),
            last_modified_at_col: "last_modified_at".into(),
            permits_table: "PERMITS_BY_OWNER".into(),
            owner_col: "owner".into(),
            owned_col: "owned_permits".into(),
            heartbeat: HeartbeatTable::default(),
        }
    }
}

impl SemaphoreTables {
    /// Render the full statement set used by one semaphore instance.
    pub fn sql(&self) -> SemaphoreSql {
        let now = &self.heartbeat.now_expr;
        SemaphoreSql {
            select_permits: format!(
                "SELECT {available}, {total} FROM {t} WHERE {name} = ?1",
                available = self.available_col,
                total = self.total_col,
                t = self.semaphore_table,
                name = self.name_col,
            ),
            select_total: format!(
                "SELECT {total} FROM {t} WHERE {name} = ?1",
                total = self.total_col,
                t = self.semaphore_table,
                name = self.name_col,
            ),
            select_owned: format!(
                "SELECT {owned} FROM {t} WHERE {owner} = ?1 AND {name} = ?2",
                owned = self.owned_col,
                t = self.permits_table,
                owner = self.owner_col,
                name = self.name_col,
            ),
            insert_semaphore: format!(
                "INSERT INTO {t} ({name}, {available}, {total}, {by}, {at}) \
                 VALUES (?1, ?2, ?3, ?4, {now})",
                t = self.semaphore_table,
                name = self.name_col,
                available = self.available_col,
                total = self.total_col,
                by = self.last_modified_by_col,
                at = self.last_modified_at_col,
            ),
            insert_owner: format!(
                "INSERT INTO {t} ({name}, {owner}, {owned}, {at}) VALUES (?1, ?2, 0, {now})",
                t = self.permits_table,
                name = self.name_col,
                owner = self.owner_col,
                owned = self.owned_col,
                at = self.last_modified_at_col,
            ),
            acquire: format!(
                "UPDATE {t} SET {available} = {available} - ?1, {by} = ?2, {at} = {now} \
                 WHERE {name} = ?3 AND {available} >= ?1",
                t = self.semaphore_table,
                available = self.available_col,
                by = self.last_modified_by_col,
                at = self.last_modified_at_col,
                name = self.name_col,
            ),
            acquire_by_owner: format!(
                "UPDATE {t} SET {owned} = {owned} + ?1, {at} = {now} \
                 WHERE {owner} = ?2 AND {name} = ?3",
                t = self.permits_table,
                owned = self.owned_col,
                at = self.last_modified_at_col,
                owner = self.owner_col,
                name = self.name_col,
            ),
            release: format!(
                "UPDATE {t} SET {available} = CASE WHEN {available} + ?1 > {total} \
                 THEN {total} ELSE {available} + ?1 END, {by} = ?2, {at} = {now} \
                 WHERE {name} = ?3",
                t = self.semaphore_table,
                available = self.available_col,
                total = self.total_col,
                by = self.last_modified_by_col,
                at = self.last_modified_at_col,
                name = self.name_col,
            ),
            release_by_owner: format!(
                "UPDATE {t} SET {owned} = {owned} - ?1, {at} = {now} \
                 WHERE {owner} = ?2 AND {name} = ?3 AND {owned} >= ?1",
                t = self.permits_table,
                owned = self.owned_col,
                at = self.last_modified_at_col,
                owner = self.owner_col,
                name = self.name_col,
            ),
            update_permits: format!(
                "UPDATE {t} SET {total} = ?1, {available} = {available} + ?1 - {total}, \
                 {by} = ?2, {at} = {now} WHERE {name} = ?3",
                t = self.semaphore_table,
                total = self.total_col,
                available = self.available_col,
                by = self.last_modified_by_col,
                at = self.last_modified_at_col,
                name = self.name_col,
            ),
            reduce_permits: format!(
                "UPDATE {t} SET {total} = {total} - ?1, {available} = {available} - ?1, \
                 {by} = ?2, {at} = {now} WHERE {name} = ?3 AND {total} >= ?1",
                t = self.semaphore_table,
                total = self.total_col,
                available = self.available_col,
                by = self.last_modified_by_col,
                at = self.last_modified_at_col,
                name = self.name_col,
            ),
            increase_permits: format!(
                "UPDATE {t} SET {total} = {total} + ?1, {available} = {available} + ?1, \
                 {by} = ?2, {at} = {now} WHERE {name} = ?3",
                t = self.semaphore_table,
                total = self.total_col,
                available = self.available_col,
                by = self.last_modified_by_col,
                at = self.last_modified_at_col,
                name = self.name_col,
            ),
            select_dead_owner_permits: format!(
                "SELECT {owner}, {owned} FROM {pt} p \
                 WHERE p.{name} = ?1 AND {owned} > 0 AND NOT EXISTS \
                 (SELECT h.{hb_owner} FROM {hb} h WHERE h.{hb_owner} = p.{owner}) \
                 ORDER BY {owner}, {owned}",
                owner = self.owner_col,
                owned = self.owned_col,
                pt = self.permits_table,
                name = self.name_col,
                hb = self.heartbeat.table,
                hb_owner = self.heartbeat.owner_col,
            ),
            delete_dead_owner_record: format!(
                "DELETE FROM {t} WHERE {owner} = ?1 AND {name} = ?2 AND {owned} = ?3",
                t = self.permits_table,
                owner = self.owner_col,
                name = self.name_col,
                owned = self.owned_col,
            ),
            delete_dead_unowned_records: format!(
                "DELETE FROM {pt} WHERE {name} = ?1 AND {owned} = 0 AND NOT EXISTS \
                 (SELECT h.{hb_owner} FROM {hb} h WHERE h.{hb_owner} = {pt}.{owner})",
                pt = self.permits_table,
                name = self.name_col,
                owned = self.owned_col,
                hb = self.heartbeat.table,
                hb_owner = self.heartbeat.owner_col,
                owner = self.owner_col,
            ),
            select_all_semaphores: format!(
                "SELECT {name}, {available}, {total}, {by}, {at} FROM {t} ORDER BY {name}",
                name = self.name_col,
                available = self.available_col,
                total = self.total_col,
                by = self.last_modified_by_col,
                at = self.last_modified_at_col,
                t = self.semaphore_table,
            ),
        }
    }
}

/// The rendered statement set for one semaphore. All statements bind the
/// semaphore name and owner as parameters.
#[derive(Debug, Clone)]
pub struct SemaphoreSql {
    pub select_permits: String,
    pub select_total: String,
    pub select_owned: String,
    pub insert_semaphore: String,
    pub insert_owner: String,
    pub acquire: String,
    pub acquire_by_owner: String,
    pub release: String,
    pub release_by_owner: String,
    pub update_permits: String,
    pub reduce_permits: String,
    pub increase_permits: String,
    pub select_dead_owner_permits: String,
    pub delete_dead_owner_record: String,
    pub delete_dead_unowned_records: String,
    pub select_all_semaphores: String,
}
