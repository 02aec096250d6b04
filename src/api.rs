//! Request-facing wrappers around the session workflow.
//!
//! Mirrors the legacy controller surface: loosely-typed JSON payloads in
//! (camelCase, snake_case, and the original Spanish field names all accepted),
//! flash-style messages out. State conflicts and validation problems surface
//! their user-facing text; anything unexpected is logged in full and replaced
//! with a generic retry message.

use chrono::{Local, NaiveDate};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::error;

use crate::db::{self, DbState};
use crate::errors::DrawerError;
use crate::sessions::{self, CloseRegisterRequest, OpenRegisterRequest, UserContext};

const GENERIC_OPEN_ERROR: &str = "Error al abrir la caja. Intenta nuevamente.";
const GENERIC_CLOSE_ERROR: &str = "Error al cerrar la caja. Intenta nuevamente.";
const GENERIC_QUERY_ERROR: &str = "Error al consultar las cajas. Intenta nuevamente.";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OpenRegisterPayload {
    #[serde(alias = "register_id", alias = "caja_id", alias = "cajaId")]
    register_id: String,
    #[serde(alias = "opening_amount", alias = "monto_apertura", alias = "montoApertura")]
    opening_amount: f64,
    #[serde(default, alias = "observaciones")]
    notes: Option<String>,
    #[serde(default)]
    fecha: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CloseRegisterPayload {
    #[serde(alias = "actual_amount", alias = "monto_real", alias = "montoReal")]
    actual_amount: f64,
    #[serde(default, alias = "observaciones")]
    notes: Option<String>,
    #[serde(default)]
    fecha: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct DatePayload {
    #[serde(default)]
    fecha: Option<String>,
}

fn parse_payload<T: serde::de::DeserializeOwned>(arg0: Option<Value>) -> Result<T, String> {
    let payload = arg0.unwrap_or_else(|| json!({}));
    serde_json::from_value(payload).map_err(|e| format!("Solicitud inválida: {e}"))
}

/// Resolve the business day: explicit `fecha` if given, the local calendar
/// date otherwise. The core never reads the clock itself.
fn parse_date(fecha: Option<&str>) -> Result<NaiveDate, String> {
    match fecha {
        Some(s) => NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
            .map_err(|_| "Fecha inválida. Usa el formato YYYY-MM-DD.".to_string()),
        None => Ok(Local::now().date_naive()),
    }
}

fn flash_error(err: DrawerError, fallback: &str) -> String {
    if err.is_user_facing() {
        err.to_string()
    } else {
        error!("{err}");
        fallback.to_string()
    }
}

/// Dashboard: active registers, today's opening (with closing), today's
/// movements and their sum. Response keys match the legacy frontend.
pub fn dashboard(db: &DbState, user: &UserContext, arg0: Option<Value>) -> Result<Value, String> {
    let payload: DatePayload = parse_payload(arg0)?;
    let as_of = parse_date(payload.fecha.as_deref())?;

    let status = sessions::register_status(db, user, as_of)
        .map_err(|e| flash_error(e, GENERIC_QUERY_ERROR))?;

    Ok(json!({
        "cajas": status.registers,
        "cajaAbiertaHoy": status.opening,
        "movimientosHoy": status.movements,
        "totalMovimientos": status.movements_total,
    }))
}

/// Open a register for the day.
pub fn open_register(
    db: &DbState,
    user: &UserContext,
    arg0: Option<Value>,
) -> Result<Value, String> {
    let payload: OpenRegisterPayload = parse_payload(arg0)?;
    let as_of = parse_date(payload.fecha.as_deref())?;

    let request = OpenRegisterRequest {
        register_id: payload.register_id,
        opening_amount: payload.opening_amount,
        notes: payload.notes,
    };

    let opening = sessions::open_register(db, user, &request, as_of)
        .map_err(|e| flash_error(e, GENERIC_OPEN_ERROR))?;

    Ok(json!({
        "success": true,
        "message": "Caja abierta exitosamente.",
        "apertura": opening,
    }))
}

/// Close the day's register and report the reconciliation difference.
pub fn close_register(
    db: &DbState,
    user: &UserContext,
    arg0: Option<Value>,
) -> Result<Value, String> {
    let payload: CloseRegisterPayload = parse_payload(arg0)?;
    let as_of = parse_date(payload.fecha.as_deref())?;

    let request = CloseRegisterRequest {
        actual_amount: payload.actual_amount,
        notes: payload.notes,
    };

    let reconciliation = sessions::close_register(db, user, &request, as_of)
        .map_err(|e| flash_error(e, GENERIC_CLOSE_ERROR))?;

    let currency = currency_suffix(db);
    Ok(json!({
        "success": true,
        "message": format!(
            "Caja cerrada exitosamente. Diferencia: {:.2} {currency}",
            reconciliation.difference
        ),
        "cierre": reconciliation,
    }))
}

/// Per-register open/closed snapshot, shaped as the legacy monitor endpoint.
pub fn register_states(db: &DbState, arg0: Option<Value>) -> Result<Value, String> {
    let payload: DatePayload = parse_payload(arg0)?;
    let as_of = parse_date(payload.fecha.as_deref())?;

    let states = sessions::register_states(db, as_of)
        .map_err(|e| flash_error(e, GENERIC_QUERY_ERROR))?;

    let rows: Vec<Value> = states
        .into_iter()
        .map(|s| {
            json!({
                "id": s.id,
                "nombre": s.name,
                "ubicacion": s.location,
                "esta_abierta": s.is_open,
                "usuario_actual": s.current_user,
                "monto_apertura": s.opening_amount,
                "hora_apertura": s.opened_at,
                "hora_cierre": s.closed_at,
            })
        })
        .collect();

    Ok(Value::Array(rows))
}

/// The user's movements for a date (defaults to today).
pub fn day_movements(
    db: &DbState,
    user: &UserContext,
    arg0: Option<Value>,
) -> Result<Value, String> {
    let payload: DatePayload = parse_payload(arg0)?;
    let date = parse_date(payload.fecha.as_deref())?;

    let listing = sessions::day_movements(db, user, date)
        .map_err(|e| flash_error(e, GENERIC_QUERY_ERROR))?;

    Ok(json!({
        "movimientos": listing.movements,
        "total": listing.total,
        "apertura": listing.opening,
    }))
}

/// Currency suffix for flash messages, configurable per installation.
fn currency_suffix(db: &DbState) -> String {
    db.lock()
        .ok()
        .and_then(|conn| db::get_setting(&conn, "general", "currency_suffix"))
        .unwrap_or_else(|| "Bs.".to_string())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db, registers};
    use rusqlite::Connection;
    use std::sync::Mutex;

    fn test_db() -> DbState {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;
             PRAGMA synchronous = NORMAL;",
        )
        .expect("pragma setup");
        db::run_migrations_for_test(&conn);
        DbState {
            conn: Mutex::new(conn),
            db_path: std::path::PathBuf::from(":memory:"),
        }
    }

    fn seed_register(db: &DbState) -> String {
        let conn = db.lock().unwrap();
        registers::create_register(&conn, "Caja Principal", None).unwrap()
    }

    fn maria() -> UserContext {
        UserContext {
            id: "u1".into(),
            name: "María Fernández".into(),
        }
    }

    #[test]
    fn open_accepts_legacy_spanish_field_names() {
        let db = test_db();
        let reg = seed_register(&db);

        let result = open_register(
            &db,
            &maria(),
            Some(json!({
                "caja_id": reg,
                "monto_apertura": 100.0,
                "observaciones": "turno mañana",
                "fecha": "2025-03-10",
            })),
        )
        .unwrap();

        assert_eq!(result["success"], true);
        assert_eq!(result["message"], "Caja abierta exitosamente.");
        assert_eq!(result["apertura"]["opening_amount"], 100.0);
        assert_eq!(result["apertura"]["notes"], "turno mañana");
    }

    #[test]
    fn open_accepts_camel_case_field_names() {
        let db = test_db();
        let reg = seed_register(&db);

        let result = open_register(
            &db,
            &maria(),
            Some(json!({
                "registerId": reg,
                "openingAmount": 50.0,
                "fecha": "2025-03-10",
            })),
        )
        .unwrap();
        assert_eq!(result["success"], true);
    }

    #[test]
    fn open_conflict_surfaces_original_message() {
        let db = test_db();
        let reg = seed_register(&db);
        let payload = json!({ "caja_id": reg, "monto_apertura": 10.0, "fecha": "2025-03-10" });

        open_register(&db, &maria(), Some(payload.clone())).unwrap();
        let err = open_register(&db, &maria(), Some(payload)).unwrap_err();
        assert_eq!(err, "Ya tienes una caja abierta para el día de hoy.");
    }

    #[test]
    fn close_message_formats_difference_with_currency() {
        let db = test_db();
        let reg = seed_register(&db);

        open_register(
            &db,
            &maria(),
            Some(json!({ "caja_id": reg, "monto_apertura": 100.0, "fecha": "2025-03-10" })),
        )
        .unwrap();

        let result = close_register(
            &db,
            &maria(),
            Some(json!({ "monto_real": 95.0, "fecha": "2025-03-10" })),
        )
        .unwrap();
        assert_eq!(
            result["message"],
            "Caja cerrada exitosamente. Diferencia: -5.00 Bs."
        );
        assert_eq!(result["cierre"]["difference"], -5.0);
    }

    #[test]
    fn close_message_honors_configured_currency() {
        let db = test_db();
        let reg = seed_register(&db);
        {
            let conn = db.lock().unwrap();
            db::set_setting(&conn, "general", "currency_suffix", "USD").unwrap();
        }

        open_register(
            &db,
            &maria(),
            Some(json!({ "caja_id": reg, "monto_apertura": 100.0, "fecha": "2025-03-10" })),
        )
        .unwrap();
        let result = close_register(
            &db,
            &maria(),
            Some(json!({ "monto_real": 100.0, "fecha": "2025-03-10" })),
        )
        .unwrap();
        assert_eq!(
            result["message"],
            "Caja cerrada exitosamente. Diferencia: 0.00 USD"
        );
    }

    #[test]
    fn close_without_opening_surfaces_conflict() {
        let db = test_db();
        seed_register(&db);

        let err = close_register(
            &db,
            &maria(),
            Some(json!({ "monto_real": 100.0, "fecha": "2025-03-10" })),
        )
        .unwrap_err();
        assert_eq!(err, "No tienes una caja abierta para cerrar hoy.");
    }

    #[test]
    fn dashboard_uses_legacy_response_keys() {
        let db = test_db();
        let reg = seed_register(&db);

        open_register(
            &db,
            &maria(),
            Some(json!({ "caja_id": reg, "monto_apertura": 100.0, "fecha": "2025-03-10" })),
        )
        .unwrap();

        let result = dashboard(&db, &maria(), Some(json!({ "fecha": "2025-03-10" }))).unwrap();
        assert_eq!(result["cajas"].as_array().unwrap().len(), 1);
        assert!(result["cajaAbiertaHoy"].is_object());
        assert_eq!(result["movimientosHoy"].as_array().unwrap().len(), 1);
        assert_eq!(result["totalMovimientos"], 100.0);

        // A day with nothing open: empty, not an error.
        let result = dashboard(&db, &maria(), Some(json!({ "fecha": "2025-03-11" }))).unwrap();
        assert!(result["cajaAbiertaHoy"].is_null());
        assert_eq!(result["totalMovimientos"], 0.0);
    }

    #[test]
    fn register_states_uses_legacy_shape() {
        let db = test_db();
        let reg = seed_register(&db);

        open_register(
            &db,
            &maria(),
            Some(json!({ "caja_id": reg, "monto_apertura": 100.0, "fecha": "2025-03-10" })),
        )
        .unwrap();

        let states = register_states(&db, Some(json!({ "fecha": "2025-03-10" }))).unwrap();
        let rows = states.as_array().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["nombre"], "Caja Principal");
        assert_eq!(rows[0]["esta_abierta"], true);
        assert_eq!(rows[0]["usuario_actual"], "María Fernández");
        assert_eq!(rows[0]["monto_apertura"], 100.0);
        assert!(rows[0]["hora_cierre"].is_null());
    }

    #[test]
    fn day_movements_defaults_and_rejects_bad_dates() {
        let db = test_db();
        seed_register(&db);

        // Defaults to the local date when fecha is omitted.
        let result = day_movements(&db, &maria(), None).unwrap();
        assert!(result["apertura"].is_null());
        assert_eq!(result["total"], 0.0);

        let err = day_movements(&db, &maria(), Some(json!({ "fecha": "10/03/2025" }))).unwrap_err();
        assert_eq!(err, "Fecha inválida. Usa el formato YYYY-MM-DD.");
    }

    #[test]
    fn validation_errors_surface_their_message() {
        let db = test_db();
        let reg = seed_register(&db);

        let err = open_register(
            &db,
            &maria(),
            Some(json!({ "caja_id": reg, "monto_apertura": -5.0, "fecha": "2025-03-10" })),
        )
        .unwrap_err();
        assert_eq!(
            err,
            "El monto de apertura debe ser un número mayor o igual a cero."
        );
    }
}
