//! Cashbox — daily cash register reconciliation core.
//!
//! Tracks the open/close lifecycle of physical cash registers: one opening
//! per user per calendar day, a shared append-only movement ledger, and a
//! closing that reconciles the expected balance (opening amount plus signed
//! movements) against the physically counted cash. Hosting applications mount
//! the `api` module behind their transport of choice and feed it the
//! authenticated user.

use std::path::Path;

use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod api;
pub mod db;
pub mod errors;
pub mod ledger;
pub mod registers;
pub mod sessions;

pub use db::DbState;
pub use errors::{DrawerError, Result};
pub use sessions::{CloseRegisterRequest, OpenRegisterRequest, UserContext};

/// Initialize structured logging (console + daily rolling file).
///
/// Call once at process start, before touching the database.
pub fn init_logging(log_dir: &Path) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,cashbox=debug"));

    std::fs::create_dir_all(log_dir).ok();

    let file_appender = tracing_appender::rolling::daily(log_dir, "cashbox");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true);
    let console_layer = fmt::layer().with_target(true);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    // Keep the guard alive for the lifetime of the process — dropping it
    // flushes and stops the background writer.
    std::mem::forget(guard);

    info!("cashbox v{} logging initialized", env!("CARGO_PKG_VERSION"));
}
