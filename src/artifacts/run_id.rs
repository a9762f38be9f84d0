use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;

static SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Timestamp-derived run identifier, unique within the process.
///
/// Uniqueness across processes sharing a runs directory is enforced by the
/// store, which allocates the namespace with an exclusive directory create.
pub fn generate_run_id() -> String {
    let timestamp = Utc::now().format("%Y%m%dT%H%M%S%3f");
    let pid = std::process::id();
    let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed);
    format!("run-{timestamp}-{pid}-{seq}")
}

/// Run ids name a single directory under the runs root.
pub fn is_valid_run_id(run_id: &str) -> bool {
    !run_id.trim().is_empty()
        && run_id != "."
        && run_id != ".."
        && run_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}
