//! Scanner state that outlives the process.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

#[cfg(target_family = "unix")]
use std::os::unix::fs::DirBuilderExt;

use serde::{Deserialize, Serialize};
use tor_relaylist::SavedHistory;

use crate::{Error, Result};

/// Everything the scanner remembers across restarts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScannerState {
    /// When the scanner first started, in seconds since the epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scanner_started: Option<u64>,
    /// How many rounds have finished.
    #[serde(default)]
    pub rounds: u64,
    /// Recent consensus appearances and measurement attempts.
    #[serde(default)]
    pub history: SavedHistory,
}

impl ScannerState {
    /// Return a fresh state for a scanner starting now.
    pub fn starting_now() -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        ScannerState {
            scanner_started: Some(now),
            ..ScannerState::default()
        }
    }
}

/// Something that can load and store a [`ScannerState`].
pub trait StateStore: Send + Sync {
    /// Load the stored state, or return None if there is none yet.
    fn load(&self) -> Result<Option<ScannerState>>;
    /// Replace the stored state with `state`.
    fn store(&self, state: &ScannerState) -> Result<()>;
}

/// A [`StateStore`] that keeps state in a TOML file.
///
/// A lock file keeps two scanners from writing the same state.  A store
/// starts out read-only; use [`FsStateStore::try_lock`] to make it
/// writable.
#[derive(Debug)]
pub struct FsStateStore {
    /// The state file.
    path: PathBuf,
    /// Lock file giving exclusive write access to `path`.
    lockfile: Mutex<fslock::LockFile>,
}

impl FsStateStore {
    /// Construct a store keeping its files in the directory `dir`,
    /// creating it if needed.
    pub fn from_path<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        {
            let mut builder = std::fs::DirBuilder::new();
            #[cfg(target_family = "unix")]
            builder.mode(0o700);
            builder.recursive(true).create(dir)?;
        }
        let lockfile = Mutex::new(fslock::LockFile::open_excl(&dir.join("state.lock"))?);
        Ok(FsStateStore {
            path: dir.join("state.toml"),
            lockfile,
        })
    }

    /// Try to get exclusive write access, without blocking.
    ///
    /// Return `Ok(false)` if another process holds the lock.
    pub fn try_lock(&self) -> Result<bool> {
        let mut lockfile = self.lockfile.lock().map_err(|_| Error::NoLock)?;
        if lockfile.owns_lock() {
            Ok(true)
        } else {
            Ok(lockfile.try_lock()?)
        }
    }

    /// Return true if we may write.
    fn can_store(&self) -> bool {
        match self.lockfile.lock() {
            Ok(lockfile) => lockfile.owns_lock(),
            Err(_) => false,
        }
    }
}

impl StateStore for FsStateStore {
    fn load(&self) -> Result<Option<ScannerState>> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(toml::from_str(&text)?))
    }

    fn store(&self, state: &ScannerState) -> Result<()> {
        if !self.can_store() {
            return Err(Error::NoLock);
        }
        let output = toml::ser::to_string(state)?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, output.as_bytes())?;
        std::fs::rename(tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use tor_relaylist::SavedRelayHistory;

    #[test]
    fn store_and_load() -> Result<()> {
        let dir = tempfile::TempDir::new().unwrap();
        let store = FsStateStore::from_path(dir.path())?;
        assert!(store.load()?.is_none());

        let mut state = ScannerState::starting_now();
        state.rounds = 4;
        state.history.recent_consensus = vec![1_600_000_000, 1_600_003_600];
        state.history.relays.insert(
            "AA00000000000000000000000000000000000001".into(),
            SavedRelayHistory {
                in_consensus: vec![1_600_000_000],
                priority: vec![],
                attempts: vec![1_600_000_100],
            },
        );

        assert!(matches!(store.store(&state), Err(Error::NoLock)));
        assert!(store.try_lock()?);
        store.store(&state)?;
        assert_eq!(store.load()?, Some(state.clone()));

        // Release the lock; a new store can read, but not write.
        drop(store);
        let store = FsStateStore::from_path(dir.path())?;
        assert_eq!(store.load()?, Some(state.clone()));
        assert!(store.try_lock()?);
        state.rounds = 5;
        store.store(&state)?;
        assert_eq!(store.load()?.unwrap().rounds, 5);
        Ok(())
    }

    #[test]
    fn unreadable() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("state.toml"), "rounds = \"many\"").unwrap();
        let store = FsStateStore::from_path(dir.path()).unwrap();
        assert!(matches!(store.load(), Err(Error::TomlRead(_))));
    }
}
