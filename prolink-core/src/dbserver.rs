//! `DbServerSession`: the seam standing in for the dbserver wire protocol
//! (the NFS/PDB path's remote-query counterpart for rekordbox-analyzed USB
//! and SD media). The core treats a session purely as a serialized
//! menu-operation channel: one player allows only one outstanding
//! `request_menu` at a time, which `tasks::loader` enforces with a
//! per-player lock.

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{Artifact, ArtifactKind, TrackKey};

#[async_trait]
pub trait DbServerSession: Send + Sync {
    /// Runs one menu operation against the player's dbserver and returns
    /// the artifact it resolves to, or `Ok(None)` for "not on this player".
    /// Callers are expected to wrap this in a timeout; a session that
    /// hangs forever is a caller bug, not something this trait guards
    /// against itself.
    async fn request_menu(
        &self,
        key: &TrackKey,
        kind: &ArtifactKind,
    ) -> Result<Option<Artifact>>;
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Simulates a slow dbserver: `request_menu` sleeps before resolving,
    /// used to exercise the loader's single-flight and timeout behavior.
    pub struct SlowSession {
        pub delay: Duration,
        pub calls: AtomicUsize,
        pub artifact: Option<Artifact>,
    }

    #[async_trait]
    impl DbServerSession for SlowSession {
        async fn request_menu(
            &self,
            _key: &TrackKey,
            _kind: &ArtifactKind,
        ) -> Result<Option<Artifact>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(self.artifact.clone())
        }
    }
}
