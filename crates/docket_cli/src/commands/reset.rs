//! Emergency reset of an offline store.

use super::CliError;
use docket_core::recovery::wipe_all;
use docket_storage::{LogBackend, LogConfig, LOG_FILE};
use std::path::Path;
use tracing::warn;

/// What a reset did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetOutcome {
    /// The log opened and every owned key was deleted.
    Wiped {
        /// Keys that existed before the wipe.
        keys_removed: usize,
    },
    /// The log was too damaged to open and was deleted.
    Destroyed,
    /// There was nothing to reset.
    Empty,
}

/// Runs the reset command.
pub fn run(path: &Path, yes: bool) -> Result<(), Box<dyn std::error::Error>> {
    if !yes {
        return Err(CliError::Refused(
            "reset deletes every tenant's local data, including unsynced changes; pass --yes to confirm".to_string(),
        )
        .into());
    }

    match reset(path)? {
        ResetOutcome::Wiped { keys_removed } => println!("Store wiped ({keys_removed} keys removed)."),
        ResetOutcome::Destroyed => println!("Store log was unreadable and has been deleted."),
        ResetOutcome::Empty => println!("Nothing to reset."),
    }
    Ok(())
}

/// Wipes the store in `path`, deleting the log outright if it is corrupt.
pub fn reset(path: &Path) -> Result<ResetOutcome, Box<dyn std::error::Error>> {
    if !path.join(LOG_FILE).exists() {
        return Ok(ResetOutcome::Empty);
    }

    match LogBackend::open(path, LogConfig::default()) {
        Ok(backend) => {
            let report = wipe_all(&backend)?;
            backend.compact()?;
            Ok(ResetOutcome::Wiped {
                keys_removed: report.keys_removed,
            })
        }
        Err(e) if e.is_corruption() => {
            warn!(error = %e, "store is corrupt; deleting its log");
            LogBackend::destroy(path)?;
            Ok(ResetOutcome::Destroyed)
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::seed;
    use super::*;
    use docket_storage::KvBackend;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn seeded() -> TempDir {
        let dir = TempDir::new().unwrap();
        let backend: Arc<dyn KvBackend> = Arc::new(LogBackend::open(dir.path(), LogConfig::default()).unwrap());
        seed(backend, "acme", 3);
        dir
    }

    #[test]
    fn needs_confirmation() {
        let dir = seeded();
        assert!(run(dir.path(), false).is_err());
        let backend = LogBackend::open(dir.path(), LogConfig::default()).unwrap();
        assert!(backend.key_count().unwrap() > 0);
    }

    #[test]
    fn wipes_a_healthy_store() {
        let dir = seeded();
        let outcome = reset(dir.path()).unwrap();
        assert!(matches!(outcome, ResetOutcome::Wiped { keys_removed } if keys_removed >= 9));

        let backend = LogBackend::open(dir.path(), LogConfig::default()).unwrap();
        assert_eq!(backend.key_count().unwrap(), 0);
    }

    #[test]
    fn destroys_a_corrupt_log() {
        let dir = seeded();
        let mut data = std::fs::read(dir.path().join(LOG_FILE)).unwrap();
        data[docket_codec::FRAME_HEADER_SIZE + 1] ^= 0xff;
        std::fs::write(dir.path().join(LOG_FILE), data).unwrap();

        assert_eq!(reset(dir.path()).unwrap(), ResetOutcome::Destroyed);
        assert!(LogBackend::open(dir.path(), LogConfig::default()).is_ok());
    }

    #[test]
    fn missing_store_is_a_no_op() {
        let dir = TempDir::new().unwrap();
        assert_eq!(reset(dir.path()).unwrap(), ResetOutcome::Empty);
    }
}
