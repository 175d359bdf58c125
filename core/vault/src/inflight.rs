//! Per-folder guard against overlapping transitions.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tracing::debug;

use phantomvault_common::{Error, ProfileId, Result};

type Key = (ProfileId, String);

/// Set of folders that currently have a transition running.
///
/// Keys are (profile, folder id) for registered folders and (profile,
/// canonical path) for folders being locked for the first time.
#[derive(Debug, Clone, Default)]
pub struct InFlightRegistry {
    active: Arc<Mutex<HashSet<Key>>>,
}

impl InFlightRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `key` for the lifetime of the returned guard.
    ///
    /// # Errors
    /// - `Error::OperationInProgress` if the key is already claimed
    pub fn acquire(&self, profile: &ProfileId, key: impl Into<String>) -> Result<InFlightGuard> {
        let key = (profile.clone(), key.into());
        let mut active = self
            .active
            .lock()
            .map_err(|_| Error::Transaction("in-flight registry poisoned".to_string()))?;
        if !active.insert(key.clone()) {
            return Err(Error::OperationInProgress(key.1));
        }
        debug!(profile = %key.0, folder = %key.1, "transition started");
        Ok(InFlightGuard {
            active: Arc::clone(&self.active),
            key,
        })
    }

    /// Whether `key` is currently claimed.
    pub fn is_active(&self, profile: &ProfileId, key: &str) -> bool {
        self.active
            .lock()
            .map(|active| active.contains(&(profile.clone(), key.to_string())))
            .unwrap_or(false)
    }
}

/// Releases its key on drop.
#[derive(Debug)]
pub struct InFlightGuard {
    active: Arc<Mutex<HashSet<Key>>>,
    key: Key,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        // A poisoned set still has to let go of the key.
        let mut active = match self.active.lock() {
            Ok(active) => active,
            Err(poisoned) => poisoned.into_inner(),
        };
        active.remove(&self.key);
        debug!(profile = %self.key.0, folder = %self.key.1, "transition finished");
    }
}
