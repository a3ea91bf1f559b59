//! The storage side of emergency recovery.
//!
//! [`wipe_all`] removes every key under [`ROOT`] in one atomic batch, then
//! scans again to prove nothing is left. Callers must not restart into the
//! wiped store unless it returns `Ok`.

use crate::error::{CoreError, CoreResult};
use crate::keys::ROOT;
use docket_storage::{KvBackend, WriteBatch};
use tracing::{error, warn};

/// Outcome of a successful wipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WipeReport {
    /// Keys that existed before the wipe.
    pub keys_removed: usize,
}

/// Deletes every key Docket owns in `backend`.
///
/// Keys outside [`ROOT`] are left alone.
///
/// # Errors
///
/// Storage errors from the delete or the flush, or `WipeIncomplete` if
/// keys are still present afterwards.
pub fn wipe_all(backend: &dyn KvBackend) -> CoreResult<WipeReport> {
    let keys_removed = backend.scan_prefix(ROOT)?.len();
    warn!(keys = keys_removed, "wiping all local state");

    let mut batch = WriteBatch::new();
    batch.delete_prefix(ROOT);
    backend.commit(batch)?;
    backend.flush()?;

    let remaining = backend.scan_prefix(ROOT)?.len();
    if remaining > 0 {
        error!(remaining, "wipe left keys behind");
        return Err(CoreError::WipeIncomplete { remaining });
    }
    Ok(WipeReport { keys_removed })
}
