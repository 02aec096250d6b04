//! Error taxonomy for the register workflow.
//!
//! `Validation` and `Conflict` carry user-facing messages and are surfaced
//! verbatim by the api layer. Everything else is logged in full and replaced
//! by a generic retry message before it reaches a user.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DrawerError {
    /// Malformed or out-of-range input. Rejected before any transaction starts.
    #[error("{0}")]
    Validation(String),

    /// Valid input against the wrong state: register already open today,
    /// nothing open to close, inactive register. No writes performed.
    #[error("{0}")]
    Conflict(String),

    /// Underlying SQLite failure. The surrounding transaction is rolled back.
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Filesystem failure while preparing the database location.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection mutex was poisoned by a panicking holder.
    #[error("database unavailable: {0}")]
    Lock(String),
}

impl DrawerError {
    /// Whether the message is safe to show to an end user as-is.
    pub fn is_user_facing(&self) -> bool {
        matches!(self, DrawerError::Validation(_) | DrawerError::Conflict(_))
    }
}

pub type Result<T> = std::result::Result<T, DrawerError>;

/// A SQLite UNIQUE/constraint failure, used to translate races on the
/// openings/closings unique indexes into `Conflict` instead of an opaque error.
pub fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_and_validation_are_user_facing() {
        assert!(DrawerError::Conflict("ocupada".into()).is_user_facing());
        assert!(DrawerError::Validation("monto inválido".into()).is_user_facing());
        assert!(!DrawerError::Lock("poisoned".into()).is_user_facing());
    }

    #[test]
    fn detects_constraint_violations() {
        let conn = rusqlite::Connection::open_in_memory().expect("open in-memory db");
        conn.execute_batch("CREATE TABLE t (id TEXT PRIMARY KEY)")
            .expect("create table");
        conn.execute("INSERT INTO t (id) VALUES ('a')", []).unwrap();
        let err = conn
            .execute("INSERT INTO t (id) VALUES ('a')", [])
            .unwrap_err();
        assert!(is_constraint_violation(&err));
        assert!(!is_constraint_violation(&rusqlite::Error::QueryReturnedNoRows));
    }
}
