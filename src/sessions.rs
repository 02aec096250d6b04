//! Daily register open/close workflow with balance reconciliation.
//!
//! A user opens a register once per calendar day, movements accumulate in the
//! ledger during the shift, and at close the expected balance
//! (opening amount plus the day's signed movements) is compared against the
//! physically counted amount. Any difference is recorded on the closing and
//! posted back into the ledger as an `AJUSTE` movement.
//!
//! Every operation takes the business day (`as_of`) explicitly so callers and
//! tests control the calendar instead of the server clock.

use chrono::{NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::db::DbState;
use crate::errors::{is_constraint_violation, DrawerError, Result};
use crate::ledger::{self, Movement, NewMovement};
use crate::registers::{self, Register};

/// Identity of the authenticated user performing the operation.
#[derive(Debug, Clone)]
pub struct UserContext {
    pub id: String,
    pub name: String,
}

/// Inputs for opening a register.
#[derive(Debug)]
pub struct OpenRegisterRequest {
    pub register_id: String,
    pub opening_amount: f64,
    pub notes: Option<String>,
}

/// Inputs for closing the day's register.
#[derive(Debug)]
pub struct CloseRegisterRequest {
    pub actual_amount: f64,
    pub notes: Option<String>,
}

/// The record marking the start of a user's shift on a register.
#[derive(Debug, Clone, Serialize)]
pub struct Opening {
    pub id: String,
    pub register_id: String,
    pub user_id: String,
    pub user_name: Option<String>,
    pub opened_on: String,
    pub opening_amount: f64,
    pub notes: Option<String>,
    pub created_at: String,
}

/// The record marking the end of a shift, with reconciliation figures.
/// `difference_amount` is actual minus expected: positive is a surplus,
/// negative a shortage.
#[derive(Debug, Clone, Serialize)]
pub struct Closing {
    pub id: String,
    pub register_id: String,
    pub user_id: String,
    pub opening_id: String,
    pub closed_on: String,
    pub expected_amount: f64,
    pub actual_amount: f64,
    pub difference_amount: f64,
    pub notes: Option<String>,
    pub created_at: String,
}

/// An opening joined with its register and closing, as the dashboard shows it.
#[derive(Debug, Clone, Serialize)]
pub struct OpeningView {
    #[serde(flatten)]
    pub opening: Opening,
    pub register: Option<Register>,
    pub closing: Option<Closing>,
}

/// Dashboard payload: active registers, the user's opening for the day (if
/// any), and that day's movements with their signed sum.
#[derive(Debug, Serialize)]
pub struct RegisterStatus {
    pub registers: Vec<Register>,
    pub opening: Option<OpeningView>,
    pub movements: Vec<Movement>,
    pub movements_total: f64,
}

/// Result of a close: the reconciliation figures just persisted.
#[derive(Debug, Clone, Serialize)]
pub struct Reconciliation {
    pub closing_id: String,
    pub expected: f64,
    pub actual: f64,
    pub difference: f64,
}

/// Per-register snapshot for the all-registers monitor view.
#[derive(Debug, Serialize)]
pub struct RegisterState {
    pub id: String,
    pub name: String,
    pub location: Option<String>,
    pub is_open: bool,
    pub current_user: Option<String>,
    pub opening_amount: Option<f64>,
    pub opened_at: Option<String>,
    pub closed_at: Option<String>,
}

/// A day's movement listing for the user: opening (if any), entries, sum.
#[derive(Debug, Serialize)]
pub struct DayMovements {
    pub opening: Option<Opening>,
    pub movements: Vec<Movement>,
    pub total: f64,
}

const MSG_ALREADY_OPEN: &str = "Ya tienes una caja abierta para el día de hoy.";
const MSG_REGISTER_MISSING: &str = "La caja seleccionada no existe.";
const MSG_REGISTER_INACTIVE: &str = "La caja seleccionada no está activa.";
const MSG_NOTHING_TO_CLOSE: &str = "No tienes una caja abierta para cerrar hoy.";

// ---------------------------------------------------------------------------
// Open register
// ---------------------------------------------------------------------------

/// Open a register for (user, `as_of`).
///
/// Creates the opening and, when the opening amount is positive, posts a
/// matching `APERTURA` ledger movement in the same transaction. A missing
/// `APERTURA` operation type skips the movement but keeps the opening
/// (observed legacy behavior; see DESIGN.md).
pub fn open_register(
    db: &DbState,
    user: &UserContext,
    req: &OpenRegisterRequest,
    as_of: NaiveDate,
) -> Result<Opening> {
    validate_amount(req.opening_amount, "monto de apertura")?;
    validate_notes(req.notes.as_deref())?;
    if req.register_id.trim().is_empty() {
        return Err(DrawerError::Validation(
            "Selecciona una caja válida.".into(),
        ));
    }

    let conn = db.lock()?;

    // State checks before any write. The unique index on
    // (register, user, opened_on) backstops this check under races.
    if opening_for_day(&conn, &user.id, as_of)?.is_some() {
        return Err(DrawerError::Conflict(MSG_ALREADY_OPEN.into()));
    }
    let register = registers::get_register(&conn, &req.register_id)?
        .ok_or_else(|| DrawerError::Conflict(MSG_REGISTER_MISSING.into()))?;
    if !register.active {
        return Err(DrawerError::Conflict(MSG_REGISTER_INACTIVE.into()));
    }

    let opening_id = Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();
    let opened_on = as_of.format("%Y-%m-%d").to_string();

    conn.execute_batch("BEGIN IMMEDIATE")?;

    let result = (|| -> Result<()> {
        conn.execute(
            "INSERT INTO register_openings (
                id, register_id, user_id, user_name, opened_on,
                opening_amount, notes, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                opening_id,
                register.id,
                user.id,
                user.name,
                opened_on,
                req.opening_amount,
                req.notes,
                now,
            ],
        )
        .map_err(|e| {
            if is_constraint_violation(&e) {
                DrawerError::Conflict(MSG_ALREADY_OPEN.into())
            } else {
                DrawerError::from(e)
            }
        })?;

        if req.opening_amount > 0.0 {
            match registers::operation_type_by_code(&conn, "APERTURA")? {
                Some(op) => {
                    ledger::post_movement(
                        &conn,
                        &NewMovement {
                            register_id: &register.id,
                            operation_type_id: &op.id,
                            document_number: &ledger::document_number(
                                "APERTURA", as_of, &user.id,
                            ),
                            description: &format!("Apertura de caja - {}", register.name),
                            amount: req.opening_amount,
                            entry_date: as_of,
                            user_id: &user.id,
                        },
                    )?;
                }
                None => {
                    warn!(
                        user_id = %user.id,
                        register_id = %register.id,
                        "APERTURA operation type not provisioned; opening movement skipped"
                    );
                }
            }
        }

        Ok(())
    })();

    match result {
        Ok(()) => conn.execute_batch("COMMIT")?,
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            if !e.is_user_facing() {
                error!(user_id = %user.id, register_id = %register.id, "Open register failed: {e}");
            }
            return Err(e);
        }
    }

    info!(
        user_id = %user.id,
        register_id = %register.id,
        opening_amount = %req.opening_amount,
        "Register opened"
    );

    Ok(Opening {
        id: opening_id,
        register_id: register.id,
        user_id: user.id.clone(),
        user_name: Some(user.name.clone()),
        opened_on,
        opening_amount: req.opening_amount,
        notes: req.notes.clone(),
        created_at: now,
    })
}

// ---------------------------------------------------------------------------
// Close register
// ---------------------------------------------------------------------------

/// Close the user's register for `as_of` and reconcile the balance.
///
/// Expected is the opening amount plus the signed sum of the day's movements,
/// read inside the same transaction that writes the closing so a concurrent
/// ledger post cannot slip between the sum and the commit. A non-zero
/// difference posts an `AJUSTE` movement carrying the signed difference.
pub fn close_register(
    db: &DbState,
    user: &UserContext,
    req: &CloseRegisterRequest,
    as_of: NaiveDate,
) -> Result<Reconciliation> {
    validate_amount(req.actual_amount, "monto real")?;
    validate_notes(req.notes.as_deref())?;

    let conn = db.lock()?;

    let opening = opening_for_day(&conn, &user.id, as_of)?
        .ok_or_else(|| DrawerError::Conflict(MSG_NOTHING_TO_CLOSE.into()))?;
    if closing_for_opening(&conn, &opening.id)?.is_some() {
        return Err(DrawerError::Conflict(MSG_NOTHING_TO_CLOSE.into()));
    }

    let closing_id = Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();

    conn.execute_batch("BEGIN IMMEDIATE")?;

    let result = (|| -> Result<Reconciliation> {
        let moved = ledger::sum_for_day(&conn, &opening.register_id, &user.id, as_of)?;
        let expected = round_to_cents(opening.opening_amount + moved);
        let difference = round_to_cents(req.actual_amount - expected);

        conn.execute(
            "INSERT INTO register_closings (
                id, register_id, user_id, opening_id, closed_on,
                expected_amount, actual_amount, difference_amount, notes, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                closing_id,
                opening.register_id,
                user.id,
                opening.id,
                as_of.format("%Y-%m-%d").to_string(),
                expected,
                req.actual_amount,
                difference,
                req.notes,
                now,
            ],
        )
        .map_err(|e| {
            if is_constraint_violation(&e) {
                DrawerError::Conflict(MSG_NOTHING_TO_CLOSE.into())
            } else {
                DrawerError::from(e)
            }
        })?;

        if difference != 0.0 {
            match registers::operation_type_by_code(&conn, "AJUSTE")? {
                Some(op) => {
                    let kind = if difference > 0.0 { "Sobrante" } else { "Faltante" };
                    ledger::post_movement(
                        &conn,
                        &NewMovement {
                            register_id: &opening.register_id,
                            operation_type_id: &op.id,
                            document_number: &ledger::document_number(
                                "AJUSTE", as_of, &user.id,
                            ),
                            description: &format!(
                                "Ajuste por diferencia en cierre - {kind}"
                            ),
                            amount: difference,
                            entry_date: as_of,
                            user_id: &user.id,
                        },
                    )?;
                }
                None => {
                    warn!(
                        user_id = %user.id,
                        register_id = %opening.register_id,
                        difference = %difference,
                        "AJUSTE operation type not provisioned; adjustment movement skipped"
                    );
                }
            }
        }

        Ok(Reconciliation {
            closing_id: closing_id.clone(),
            expected,
            actual: req.actual_amount,
            difference,
        })
    })();

    match result {
        Ok(reconciliation) => {
            conn.execute_batch("COMMIT")?;
            info!(
                user_id = %user.id,
                register_id = %opening.register_id,
                expected = %reconciliation.expected,
                actual = %reconciliation.actual,
                difference = %reconciliation.difference,
                "Register closed"
            );
            Ok(reconciliation)
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            if !e.is_user_facing() {
                error!(user_id = %user.id, register_id = %opening.register_id, "Close register failed: {e}");
            }
            Err(e)
        }
    }
}

// ---------------------------------------------------------------------------
// Read-side views
// ---------------------------------------------------------------------------

/// Dashboard query: active registers, the user's opening for `as_of` (with
/// register and closing attached), and the day's movements with their sum.
/// No opening means empty movements and a zero sum, not an error.
pub fn register_status(db: &DbState, user: &UserContext, as_of: NaiveDate) -> Result<RegisterStatus> {
    let conn = db.lock()?;

    let registers = registers::list_active_registers(&conn)?;

    let Some(opening) = opening_for_day(&conn, &user.id, as_of)? else {
        return Ok(RegisterStatus {
            registers,
            opening: None,
            movements: Vec::new(),
            movements_total: 0.0,
        });
    };

    let closing = closing_for_opening(&conn, &opening.id)?;
    let register = registers::get_register(&conn, &opening.register_id)?;
    let movements = ledger::movements_for_day(&conn, &opening.register_id, &user.id, as_of)?;
    let movements_total = round_to_cents(movements.iter().map(|m| m.amount).sum());

    Ok(RegisterStatus {
        registers,
        opening: Some(OpeningView {
            opening,
            register,
            closing,
        }),
        movements,
        movements_total,
    })
}

/// Monitor view: one state row per active register for `as_of`, across users.
pub fn register_states(db: &DbState, as_of: NaiveDate) -> Result<Vec<RegisterState>> {
    let conn = db.lock()?;

    let mut states = Vec::new();
    for register in registers::list_active_registers(&conn)? {
        let opening = first_opening_for_register(&conn, &register.id, as_of)?;
        let state = match opening {
            Some(opening) => {
                let closing = closing_for_opening(&conn, &opening.id)?;
                RegisterState {
                    id: register.id,
                    name: register.name,
                    location: register.location,
                    is_open: closing.is_none(),
                    current_user: Some(
                        opening
                            .user_name
                            .clone()
                            .unwrap_or_else(|| opening.user_id.clone()),
                    ),
                    opening_amount: Some(opening.opening_amount),
                    opened_at: clock_time(&opening.created_at),
                    closed_at: closing.as_ref().and_then(|c| clock_time(&c.created_at)),
                }
            }
            None => RegisterState {
                id: register.id,
                name: register.name,
                location: register.location,
                is_open: false,
                current_user: None,
                opening_amount: None,
                opened_at: None,
                closed_at: None,
            },
        };
        states.push(state);
    }

    Ok(states)
}

/// The user's movements for an arbitrary date. Without an opening for that
/// date the listing is empty with a zero total.
pub fn day_movements(db: &DbState, user: &UserContext, date: NaiveDate) -> Result<DayMovements> {
    let conn = db.lock()?;

    let Some(opening) = opening_for_day(&conn, &user.id, date)? else {
        return Ok(DayMovements {
            opening: None,
            movements: Vec::new(),
            total: 0.0,
        });
    };

    let movements = ledger::movements_for_day(&conn, &opening.register_id, &user.id, date)?;
    let total = round_to_cents(movements.iter().map(|m| m.amount).sum());

    Ok(DayMovements {
        opening: Some(opening),
        movements,
        total,
    })
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

fn validate_amount(value: f64, field: &str) -> Result<()> {
    if !value.is_finite() || value < 0.0 {
        return Err(DrawerError::Validation(format!(
            "El {field} debe ser un número mayor o igual a cero."
        )));
    }
    Ok(())
}

fn validate_notes(notes: Option<&str>) -> Result<()> {
    if notes.is_some_and(|n| n.chars().count() > 500) {
        return Err(DrawerError::Validation(
            "Las observaciones no pueden exceder los 500 caracteres.".into(),
        ));
    }
    Ok(())
}

/// Monetary rounding to cents; keeps float sums comparable with `== 0.0`.
fn round_to_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Wall-clock `HH:MM` from an RFC 3339 timestamp.
fn clock_time(timestamp: &str) -> Option<String> {
    timestamp.get(11..16).map(String::from)
}

fn opening_from_row(row: &rusqlite::Row) -> rusqlite::Result<Opening> {
    Ok(Opening {
        id: row.get(0)?,
        register_id: row.get(1)?,
        user_id: row.get(2)?,
        user_name: row.get(3)?,
        opened_on: row.get(4)?,
        opening_amount: row.get(5)?,
        notes: row.get(6)?,
        created_at: row.get(7)?,
    })
}

fn opening_for_day(conn: &Connection, user_id: &str, date: NaiveDate) -> Result<Option<Opening>> {
    let opening = conn
        .query_row(
            "SELECT id, register_id, user_id, user_name, opened_on,
                    opening_amount, notes, created_at
             FROM register_openings
             WHERE user_id = ?1 AND opened_on = ?2
             LIMIT 1",
            params![user_id, date.format("%Y-%m-%d").to_string()],
            opening_from_row,
        )
        .optional()?;
    Ok(opening)
}

fn first_opening_for_register(
    conn: &Connection,
    register_id: &str,
    date: NaiveDate,
) -> Result<Option<Opening>> {
    let opening = conn
        .query_row(
            "SELECT id, register_id, user_id, user_name, opened_on,
                    opening_amount, notes, created_at
             FROM register_openings
             WHERE register_id = ?1 AND opened_on = ?2
             ORDER BY created_at ASC, rowid ASC
             LIMIT 1",
            params![register_id, date.format("%Y-%m-%d").to_string()],
            opening_from_row,
        )
        .optional()?;
    Ok(opening)
}

fn closing_for_opening(conn: &Connection, opening_id: &str) -> Result<Option<Closing>> {
    let closing = conn
        .query_row(
            "SELECT id, register_id, user_id, opening_id, closed_on,
                    expected_amount, actual_amount, difference_amount, notes, created_at
             FROM register_closings
             WHERE opening_id = ?1",
            params![opening_id],
            |row| {
                Ok(Closing {
                    id: row.get(0)?,
                    register_id: row.get(1)?,
                    user_id: row.get(2)?,
                    opening_id: row.get(3)?,
                    closed_on: row.get(4)?,
                    expected_amount: row.get(5)?,
                    actual_amount: row.get(6)?,
                    difference_amount: row.get(7)?,
                    notes: row.get(8)?,
                    created_at: row.get(9)?,
                })
            },
        )
        .optional()?;
    Ok(closing)
}

// ===========================================================================
// Tests
// ===========================================================================
