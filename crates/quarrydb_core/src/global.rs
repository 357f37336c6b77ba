//! Process-wide engine wiring.
//!
//! Runs once, on the first connection constructed in the process. The
//! engine's global log is forwarded into `tracing` until a caller
//! installs their own sink.

use std::path::Path;
use std::sync::Once;

static INIT: Once = Once::new();

pub(crate) fn initialize() {
    INIT.call_once(|| {
        quarrydb_engine::set_global_log(Box::new(|code, message| {
            tracing::debug!(code, message, "engine log");
        }));
        tracing::debug!("connection core initialized");
    });
}

/// Replaces the process-wide engine log sink.
///
/// Lives for the process lifetime; there is no teardown.
pub fn set_notification_for_global_log(log: Box<dyn Fn(i32, &str) + Send + Sync>) {
    initialize();
    quarrydb_engine::set_global_log(log);
}

/// Installs the process-wide notification fired when an engine opens a
/// store file.
pub fn set_notification_when_file_opened(notify: Box<dyn Fn(&Path) + Send + Sync>) {
    initialize();
    quarrydb_engine::set_vfs_open_notification(notify);
}
