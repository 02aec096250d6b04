//! Read-side catalog: cash registers and operation types.
//!
//! Both catalogs are administered by other surfaces; the reconciliation
//! workflow only reads them. The insert helpers exist for provisioning and
//! test setup, not for the daily workflow.

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use uuid::Uuid;

use crate::errors::Result;

/// A physical cash register.
#[derive(Debug, Clone, Serialize)]
pub struct Register {
    pub id: String,
    pub name: String,
    pub location: Option<String>,
    pub active: bool,
}

/// A ledger operation type, keyed by string code (`APERTURA`, `AJUSTE`, ...).
#[derive(Debug, Clone, Serialize)]
pub struct OperationType {
    pub id: String,
    pub code: String,
    pub name: String,
}

fn register_from_row(row: &rusqlite::Row) -> rusqlite::Result<Register> {
    Ok(Register {
        id: row.get(0)?,
        name: row.get(1)?,
        location: row.get(2)?,
        active: row.get::<_, i64>(3)? != 0,
    })
}

/// All registers currently marked active, ordered by name.
pub fn list_active_registers(conn: &Connection) -> Result<Vec<Register>> {
    let mut stmt = conn.prepare(
        "SELECT id, name, location, active FROM cash_registers
         WHERE active = 1 ORDER BY name",
    )?;
    let registers = stmt
        .query_map([], register_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(registers)
}

/// Look up a register by id, active or not.
pub fn get_register(conn: &Connection, register_id: &str) -> Result<Option<Register>> {
    let register = conn
        .query_row(
            "SELECT id, name, location, active FROM cash_registers WHERE id = ?1",
            params![register_id],
            register_from_row,
        )
        .optional()?;
    Ok(register)
}

/// Resolve an operation type by its string code.
///
/// Returns `None` when the code is not provisioned; callers decide whether
/// that degrades (auto-generated movements are skipped) or fails.
pub fn operation_type_by_code(conn: &Connection, code: &str) -> Result<Option<OperationType>> {
    let op = conn
        .query_row(
            "SELECT id, code, name FROM operation_types WHERE code = ?1 AND active = 1",
            params![code],
            |row| {
                Ok(OperationType {
                    id: row.get(0)?,
                    code: row.get(1)?,
                    name: row.get(2)?,
                })
            },
        )
        .optional()?;
    Ok(op)
}

/// Provisioning helper: create a register and return its id.
pub fn create_register(conn: &Connection, name: &str, location: Option<&str>) -> Result<String> {
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO cash_registers (id, name, location, active) VALUES (?1, ?2, ?3, 1)",
        params![id, name, location],
    )?;
    Ok(id)
}

/// Provisioning helper: deactivate a register so new openings are refused.
pub fn deactivate_register(conn: &Connection, register_id: &str) -> Result<()> {
    conn.execute(
        "UPDATE cash_registers SET active = 0, updated_at = datetime('now') WHERE id = ?1",
        params![register_id],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        conn.execute_batch("PRAGMA foreign_keys = ON;").expect("pragma");
        db::run_migrations_for_test(&conn);
        conn
    }

    #[test]
    fn list_active_skips_deactivated() {
        let conn = test_conn();
        let a = create_register(&conn, "Caja Principal", Some("Planta baja")).unwrap();
        let b = create_register(&conn, "Caja Secundaria", None).unwrap();
        deactivate_register(&conn, &b).unwrap();

        let active = list_active_registers(&conn).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, a);
        assert_eq!(active[0].location.as_deref(), Some("Planta baja"));

        // Deactivated register is still addressable directly
        let reg = get_register(&conn, &b).unwrap().expect("register exists");
        assert!(!reg.active);
    }

    #[test]
    fn operation_type_lookup_by_code() {
        let conn = test_conn();
        let apertura = operation_type_by_code(&conn, "APERTURA")
            .unwrap()
            .expect("seeded");
        assert_eq!(apertura.code, "APERTURA");
        assert_eq!(apertura.name, "Apertura de caja");

        assert!(operation_type_by_code(&conn, "NO_EXISTE").unwrap().is_none());
    }

    #[test]
    fn missing_register_is_none() {
        let conn = test_conn();
        assert!(get_register(&conn, "nope").unwrap().is_none());
    }
}
