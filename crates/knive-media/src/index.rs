//! Segment index shared by all variants of a stream.
//!
//! Every variant reports the indices it publishes; the shared value is the
//! maximum ever reported. A variant that (re)starts resumes numbering above
//! that maximum, so the same moment maps to comparable indices across
//! qualities and nothing is ever renumbered backwards. The value is
//! persisted next to the stream so a knive restart continues above it too.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use knive_core::{Error, Result};

use crate::publish::write_atomic;

/// File name of the persisted index inside a stream directory.
pub const STATE_FILE: &str = "last_index.json";

#[derive(Debug, Serialize, Deserialize)]
struct IndexState {
    last_index: u64,
    updated_at: DateTime<Utc>,
}

/// Max-only counter, cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct SharedIndex {
    value: Arc<AtomicU64>,
    state_file: Option<PathBuf>,
}

impl SharedIndex {
    /// An in-memory index starting at `initial`.
    pub fn new(initial: u64) -> Self {
        Self {
            value: Arc::new(AtomicU64::new(initial)),
            state_file: None,
        }
    }

    /// Load the index persisted in `dir`, or start at zero if there is none.
    pub async fn load(dir: &Path) -> Result<Self> {
        let state_file = dir.join(STATE_FILE);
        let initial = match tokio::fs::read(&state_file).await {
            Ok(raw) => {
                let state: IndexState = serde_json::from_slice(&raw).map_err(|e| {
                    Error::Validation(format!("corrupt {}: {e}", state_file.display()))
                })?;
                tracing::info!(
                    "Resuming segment index {} from {}",
                    state.last_index,
                    state_file.display()
                );
                state.last_index
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            value: Arc::new(AtomicU64::new(initial)),
            state_file: Some(state_file),
        })
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::SeqCst)
    }

    /// Report a published index. Returns the maximum after the update.
    pub fn report(&self, index: u64) -> u64 {
        self.value.fetch_max(index, Ordering::SeqCst).max(index)
    }

    pub fn state_file(&self) -> Option<&Path> {
        self.state_file.as_deref()
    }

    /// Write the current value to the state file, if the index has one.
    pub async fn persist(&self) -> Result<()> {
        let Some(path) = &self.state_file else {
            return Ok(());
        };
        let state = IndexState {
            last_index: self.get(),
            updated_at: Utc::now(),
        };
        let json = serde_json::to_vec_pretty(&state)
            .map_err(|e| Error::Internal(format!("serialize index state: {e}")))?;
        write_atomic(path, json).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn report_is_max_only() {
        let index = SharedIndex::new(5);
        assert_eq!(index.report(9), 9);
        assert_eq!(index.report(3), 9);
        assert_eq!(index.get(), 9);
    }

    #[test]
    fn clones_share_the_value() {
        let high = SharedIndex::new(0);
        let low = high.clone();
        high.report(12);
        low.report(7);
        assert_eq!(low.get(), 12);
    }

    #[tokio::test]
    async fn survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let index = SharedIndex::load(dir.path()).await.unwrap();
        assert_eq!(index.get(), 0);
        index.report(41);
        index.persist().await.unwrap();

        let reloaded = SharedIndex::load(dir.path()).await.unwrap();
        assert_eq!(reloaded.get(), 41);
    }

    #[tokio::test]
    async fn corrupt_state_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(STATE_FILE), b"{not json").unwrap();
        assert_matches!(SharedIndex::load(dir.path()).await, Err(Error::Validation(_)));
    }

    #[tokio::test]
    async fn in_memory_persist_is_noop() {
        SharedIndex::new(3).persist().await.unwrap();
    }
}
