//! Local SQLite database layer for the cashbox core.
//!
//! Uses rusqlite in WAL mode with versioned migrations recorded in a
//! `schema_version` table. Holds the single connection behind a mutex so the
//! workflow modules can share it across request handlers.

use rusqlite::{params, Connection};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{error, info, warn};

use crate::errors::{DrawerError, Result};

/// Shared state holding the database connection.
pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

impl DbState {
    /// Lock the connection, converting a poisoned mutex into a crate error.
    pub fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| DrawerError::Lock(e.to_string()))
    }
}

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 2;

/// Initialize the database at `{data_dir}/cashbox.db`.
///
/// Creates the directory if needed, opens the connection, sets pragmas,
/// and runs any pending migrations. On corruption or open failure,
/// deletes the file and retries once.
pub fn init(data_dir: &Path) -> Result<DbState> {
    fs::create_dir_all(data_dir)?;

    let db_path = data_dir.join("cashbox.db");
    info!("Opening database at {}", db_path.display());

    let conn = match open_and_configure(&db_path) {
        Ok(c) => c,
        Err(first_err) => {
            warn!(
                "Database open failed ({}), deleting and retrying once",
                first_err
            );
            if db_path.exists() {
                let _ = fs::remove_file(&db_path);
                // Also remove WAL/SHM files if present
                let wal = db_path.with_extension("db-wal");
                let shm = db_path.with_extension("db-shm");
                let _ = fs::remove_file(&wal);
                let _ = fs::remove_file(&shm);
            }
            open_and_configure(&db_path)?
        }
    };

    run_migrations(&conn)?;

    info!("Database initialized (schema v{CURRENT_SCHEMA_VERSION})");

    Ok(DbState {
        conn: Mutex::new(conn),
        db_path,
    })
}

/// Open the database file and apply pragmas.
fn open_and_configure(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;

    Ok(conn)
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> Result<()> {
    // Ensure schema_version table exists first
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )?;

    let current: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current >= CURRENT_SCHEMA_VERSION {
        info!("Database schema up to date (v{current})");
        return Ok(());
    }

    info!("Migrating database from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate_v1(conn)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
    }

    Ok(())
}

/// Migration v1: catalog, openings, closings, movement ledger, settings.
fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        -- local_settings (category/key/value store)
        CREATE TABLE IF NOT EXISTS local_settings (
            id TEXT PRIMARY KEY DEFAULT (lower(hex(randomblob(16)))),
            setting_category TEXT NOT NULL,
            setting_key TEXT NOT NULL,
            setting_value TEXT NOT NULL,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now')),
            UNIQUE(setting_category, setting_key)
        );

        -- cash_registers (catalog, managed elsewhere; read-only to the workflow)
        CREATE TABLE IF NOT EXISTS cash_registers (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            location TEXT,
            active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now'))
        );

        -- operation_types (code lookup for ledger movements)
        CREATE TABLE IF NOT EXISTS operation_types (
            id TEXT PRIMARY KEY,
            code TEXT UNIQUE NOT NULL,
            name TEXT NOT NULL,
            active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT DEFAULT (datetime('now'))
        );

        -- register_openings (one per user per calendar day; never mutated)
        CREATE TABLE IF NOT EXISTS register_openings (
            id TEXT PRIMARY KEY,
            register_id TEXT NOT NULL REFERENCES cash_registers(id),
            user_id TEXT NOT NULL,
            user_name TEXT,
            opened_on TEXT NOT NULL,
            opening_amount REAL NOT NULL DEFAULT 0,
            notes TEXT,
            created_at TEXT DEFAULT (datetime('now'))
        );

        -- register_closings (at most one per opening; immutable)
        CREATE TABLE IF NOT EXISTS register_closings (
            id TEXT PRIMARY KEY,
            register_id TEXT NOT NULL REFERENCES cash_registers(id),
            user_id TEXT NOT NULL,
            opening_id TEXT NOT NULL REFERENCES register_openings(id),
            closed_on TEXT NOT NULL,
            expected_amount REAL NOT NULL,
            actual_amount REAL NOT NULL,
            difference_amount REAL NOT NULL,
            notes TEXT,
            created_at TEXT DEFAULT (datetime('now'))
        );

        -- register_movements (append-only signed ledger)
        CREATE TABLE IF NOT EXISTS register_movements (
            id TEXT PRIMARY KEY,
            register_id TEXT NOT NULL REFERENCES cash_registers(id),
            operation_type_id TEXT NOT NULL REFERENCES operation_types(id),
            document_number TEXT NOT NULL,
            description TEXT NOT NULL,
            amount REAL NOT NULL,
            entry_date TEXT NOT NULL,
            user_id TEXT NOT NULL,
            created_at TEXT DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_openings_user_day
            ON register_openings(user_id, opened_on);
        CREATE INDEX IF NOT EXISTS idx_movements_register_user_day
            ON register_movements(register_id, user_id, entry_date);

        -- Seed operation types. VENTA/COMPRA are posted by the sales and
        -- purchase workflows, which share this ledger.
        INSERT OR IGNORE INTO operation_types (id, code, name) VALUES
            (lower(hex(randomblob(16))), 'APERTURA', 'Apertura de caja'),
            (lower(hex(randomblob(16))), 'AJUSTE', 'Ajuste de caja'),
            (lower(hex(randomblob(16))), 'VENTA', 'Venta'),
            (lower(hex(randomblob(16))), 'COMPRA', 'Compra');

        -- Record migration
        INSERT INTO schema_version (version) VALUES (1);
        ",
    )
    .map_err(|e| {
        error!("Migration v1 failed: {e}");
        DrawerError::from(e)
    })?;

    info!("Applied migration v1 (core tables)");
    Ok(())
}

/// Migration v2: uniqueness pushed into the database so two racing requests
/// cannot both pass the existence checks. The workflow translates violations
/// of these indexes into the same user-facing conflict errors.
fn migrate_v2(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE UNIQUE INDEX IF NOT EXISTS idx_openings_register_user_day_unique
            ON register_openings(register_id, user_id, opened_on);
        CREATE UNIQUE INDEX IF NOT EXISTS idx_closings_opening_unique
            ON register_closings(opening_id);

        INSERT INTO schema_version (version) VALUES (2);
        ",
    )
    .map_err(|e| {
        error!("Migration v2 failed: {e}");
        DrawerError::from(e)
    })?;

    info!("Applied migration v2 (uniqueness constraints)");
    Ok(())
}

// ---------------------------------------------------------------------------
// Settings helpers
// ---------------------------------------------------------------------------

/// Get a single setting value.
pub fn get_setting(conn: &Connection, category: &str, key: &str) -> Option<String> {
    conn.query_row(
        "SELECT setting_value FROM local_settings WHERE setting_category = ?1 AND setting_key = ?2",
        params![category, key],
        |row| row.get(0),
    )
    .ok()
}

/// Insert or update a setting.
pub fn set_setting(conn: &Connection, category: &str, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO local_settings (setting_category, setting_key, setting_value, updated_at)
         VALUES (?1, ?2, ?3, datetime('now'))
         ON CONFLICT(setting_category, setting_key) DO UPDATE SET
            setting_value = excluded.setting_value,
            updated_at = excluded.updated_at",
        params![category, key, value],
    )?;
    Ok(())
}

/// Run all migrations on the given connection (test helper, not public API).
#[cfg(test)]
pub fn run_migrations_for_test(conn: &Connection) {
    run_migrations(conn).expect("run_migrations should succeed in test");
}

// ===========================================================================
// Tests
// ===========================================================================
