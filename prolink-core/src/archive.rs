//! `MediaArchive`: the seam between this core and whatever actually knows
//! how to read a player's media (rekordbox export parsing, an NFS mount, a
//! cached dump). The core never touches a filesystem or a PDB file itself;
//! it only asks a registered archive for artifacts by key.

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{Artifact, ArtifactKind, TrackKey};

/// A source of track artifacts for one or more slots. Implementations are
/// free to be backed by a real rekordbox export parser, a network mount,
/// or (in tests) a fixed map.
#[async_trait]
pub trait MediaArchive: Send + Sync {
    /// Fetches one artifact, or `Ok(None)` if this archive has nothing for
    /// that key (the loader then falls through to the next candidate
    /// source). An `Err` means the archive itself is unavailable right now
    /// (e.g. a stale NFS handle), which the loader treats the same as "no
    /// provider had it" after logging.
    async fn fetch(&self, key: &TrackKey, kind: &ArtifactKind) -> Result<Option<Artifact>>;
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use dashmap::DashMap;

    #[derive(Default)]
    pub struct FakeArchive {
        pub artifacts: DashMap<(TrackKey, ArtifactKind), Artifact>,
    }

    #[async_trait]
    impl MediaArchive for FakeArchive {
        async fn fetch(&self, key: &TrackKey, kind: &ArtifactKind) -> Result<Option<Artifact>> {
            Ok(self.artifacts.get(&(*key, *kind)).map(|e| e.value().clone()))
        }
    }
}
