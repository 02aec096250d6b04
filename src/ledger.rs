//! Append-only signed movement ledger.
//!
//! Every cash-affecting workflow posts here: the open/close workflow writes
//! `APERTURA` and `AJUSTE` entries, sales and purchases post `VENTA`/`COMPRA`
//! against the same register using the same document-number convention.
//! Entries are never updated or deleted.

use chrono::{NaiveDate, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;
use uuid::Uuid;

use crate::errors::Result;

/// A single ledger entry. Amounts are signed: adjustments and refund-style
/// operations post negatives.
#[derive(Debug, Clone, Serialize)]
pub struct Movement {
    pub id: String,
    pub register_id: String,
    pub operation_type_id: String,
    pub operation_code: String,
    pub document_number: String,
    pub description: String,
    pub amount: f64,
    pub entry_date: String,
    pub user_id: String,
    pub created_at: String,
}

/// Input for posting a new ledger entry. The operation type must already be
/// resolved (see `registers::operation_type_by_code`).
#[derive(Debug)]
pub struct NewMovement<'a> {
    pub register_id: &'a str,
    pub operation_type_id: &'a str,
    pub document_number: &'a str,
    pub description: &'a str,
    pub amount: f64,
    pub entry_date: NaiveDate,
    pub user_id: &'a str,
}

/// Document number convention shared by all posting workflows:
/// `<CODE>-<YYYYMMDD>-<userId>`.
pub fn document_number(code: &str, as_of: NaiveDate, user_id: &str) -> String {
    format!("{code}-{}-{user_id}", as_of.format("%Y%m%d"))
}

/// Append a movement and return its id.
///
/// Takes a raw connection so callers already inside a transaction post within
/// that transaction.
pub fn post_movement(conn: &Connection, movement: &NewMovement) -> Result<String> {
    let id = Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();

    conn.execute(
        "INSERT INTO register_movements (
            id, register_id, operation_type_id, document_number,
            description, amount, entry_date, user_id, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            id,
            movement.register_id,
            movement.operation_type_id,
            movement.document_number,
            movement.description,
            movement.amount,
            movement.entry_date.format("%Y-%m-%d").to_string(),
            movement.user_id,
            now,
        ],
    )?;

    Ok(id)
}

/// Movements for a (register, user, day), newest first.
pub fn movements_for_day(
    conn: &Connection,
    register_id: &str,
    user_id: &str,
    date: NaiveDate,
) -> Result<Vec<Movement>> {
    let mut stmt = conn.prepare(
        "SELECT m.id, m.register_id, m.operation_type_id, t.code, m.document_number,
                m.description, m.amount, m.entry_date, m.user_id, m.created_at
         FROM register_movements m
         JOIN operation_types t ON t.id = m.operation_type_id
         WHERE m.register_id = ?1 AND m.user_id = ?2 AND m.entry_date = ?3
         ORDER BY m.created_at DESC, m.rowid DESC",
    )?;

    let movements = stmt
        .query_map(
            params![register_id, user_id, date.format("%Y-%m-%d").to_string()],
            |row| {
                Ok(Movement {
                    id: row.get(0)?,
                    register_id: row.get(1)?,
                    operation_type_id: row.get(2)?,
                    operation_code: row.get(3)?,
                    document_number: row.get(4)?,
                    description: row.get(5)?,
                    amount: row.get(6)?,
                    entry_date: row.get(7)?,
                    user_id: row.get(8)?,
                    created_at: row.get(9)?,
                })
            },
        )?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(movements)
}

/// Signed sum of a (register, user, day)'s movements. Zero when there are none.
pub fn sum_for_day(
    conn: &Connection,
    register_id: &str,
    user_id: &str,
    date: NaiveDate,
) -> Result<f64> {
    let total: f64 = conn.query_row(
        "SELECT COALESCE(SUM(amount), 0)
         FROM register_movements
         WHERE register_id = ?1 AND user_id = ?2 AND entry_date = ?3",
        params![register_id, user_id, date.format("%Y-%m-%d").to_string()],
        |row| row.get(0),
    )?;
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db, registers};

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        conn.execute_batch("PRAGMA foreign_keys = ON;").expect("pragma");
        db::run_migrations_for_test(&conn);
        conn
    }

    fn day(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").expect("valid date")
    }

    #[test]
    fn document_number_convention() {
        assert_eq!(
            document_number("APERTURA", day("2025-03-10"), "u-9"),
            "APERTURA-20250310-u-9"
        );
        assert_eq!(
            document_number("AJUSTE", day("2025-12-01"), "7"),
            "AJUSTE-20251201-7"
        );
    }

    #[test]
    fn post_list_and_sum_are_signed() {
        let conn = test_conn();
        let reg = registers::create_register(&conn, "Caja Principal", None).unwrap();
        let venta = registers::operation_type_by_code(&conn, "VENTA")
            .unwrap()
            .unwrap();
        let ajuste = registers::operation_type_by_code(&conn, "AJUSTE")
            .unwrap()
            .unwrap();
        let d = day("2025-03-10");

        post_movement(
            &conn,
            &NewMovement {
                register_id: &reg,
                operation_type_id: &venta.id,
                document_number: &document_number("VENTA", d, "u1"),
                description: "Venta al contado",
                amount: 50.0,
                entry_date: d,
                user_id: "u1",
            },
        )
        .unwrap();
        post_movement(
            &conn,
            &NewMovement {
                register_id: &reg,
                operation_type_id: &ajuste.id,
                document_number: &document_number("AJUSTE", d, "u1"),
                description: "Ajuste manual",
                amount: -20.0,
                entry_date: d,
                user_id: "u1",
            },
        )
        .unwrap();

        let movements = movements_for_day(&conn, &reg, "u1", d).unwrap();
        assert_eq!(movements.len(), 2);
        // Newest first
        assert_eq!(movements[0].operation_code, "AJUSTE");
        assert_eq!(movements[0].amount, -20.0);
        assert_eq!(movements[1].operation_code, "VENTA");

        assert_eq!(sum_for_day(&conn, &reg, "u1", d).unwrap(), 30.0);
    }

    #[test]
    fn sum_is_zero_without_movements() {
        let conn = test_conn();
        let reg = registers::create_register(&conn, "Caja Principal", None).unwrap();
        assert_eq!(sum_for_day(&conn, &reg, "u1", day("2025-03-10")).unwrap(), 0.0);
        assert!(movements_for_day(&conn, &reg, "u1", day("2025-03-10"))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn days_and_users_are_isolated() {
        let conn = test_conn();
        let reg = registers::create_register(&conn, "Caja Principal", None).unwrap();
        let venta = registers::operation_type_by_code(&conn, "VENTA")
            .unwrap()
            .unwrap();

        for (user, date, amount) in [
            ("u1", "2025-03-10", 10.0),
            ("u1", "2025-03-11", 20.0),
            ("u2", "2025-03-10", 40.0),
        ] {
            let d = day(date);
            post_movement(
                &conn,
                &NewMovement {
                    register_id: &reg,
                    operation_type_id: &venta.id,
                    document_number: &document_number("VENTA", d, user),
                    description: "Venta",
                    amount,
                    entry_date: d,
                    user_id: user,
                },
            )
            .unwrap();
        }

        assert_eq!(sum_for_day(&conn, &reg, "u1", day("2025-03-10")).unwrap(), 10.0);
        assert_eq!(sum_for_day(&conn, &reg, "u1", day("2025-03-11")).unwrap(), 20.0);
        assert_eq!(sum_for_day(&conn, &reg, "u2", day("2025-03-10")).unwrap(), 40.0);
    }
}
