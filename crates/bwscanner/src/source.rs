//! Read the consensus from a file that something else keeps fresh.

use std::path::PathBuf;

use async_trait::async_trait;
use tor_relaylist::{Consensus, ConsensusSource, Error, Result};
use tracing::debug;

/// A [`ConsensusSource`] reading a cached consensus document from disk.
#[derive(Debug, Clone)]
pub(crate) struct CachedConsensus {
    /// The file to read.
    path: PathBuf,
}

impl CachedConsensus {
    /// Read the consensus from `path`.
    pub(crate) fn new(path: PathBuf) -> Self {
        CachedConsensus { path }
    }
}

#[async_trait]
impl ConsensusSource for CachedConsensus {
    async fn fetch(&self) -> Result<Consensus> {
        debug!("Reading consensus from {}", self.path.display());
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| Error::SourceFailed(format!("{}: {}", self.path.display(), e)))?;
        Consensus::parse(&text)
    }
}
