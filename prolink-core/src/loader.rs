//! Artifact Loader: resolves an `Artifact` for a `TrackKey`, trying
//! progressively more expensive sources in order:
//!
//!   1. a local hot cache of previously-resolved artifacts (and the Beat
//!      Grid & Metadata Store, for the kinds it covers),
//!   2. every registered `MediaArchive`, in registration order,
//!   3. a live `DbServerSession` query against the owning player.
//!
//! Concurrent requests for the same `(TrackKey, ArtifactKind)` are
//! single-flighted: the first caller does the work, later callers wait on
//! it and then re-read whatever landed in the cache rather than duplicating
//! the fetch. Per-player dbserver access is further serialized through a
//! mutex, since a player's menu-operation protocol only tolerates one
//! outstanding request at a time.
//!
//! An `Unanalyzed` track (rekordbox still crunching waveforms/beat grids in
//! the background) is retried on an interval rather than failed outright,
//! up to a bounded total wait; MediaArchive implementations that read from
//! a filesystem path are responsible for any path-encoding quirks of their
//! own storage (e.g. HFS+ volumes prefixing hidden companion files with
//! `.`), since this core only ever sees resolved artifacts or `None`.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use log::debug;
use tokio::sync::{Mutex, Notify};
use tokio::time::timeout;

use crate::archive::MediaArchive;
use crate::dbserver::DbServerSession;
use crate::error::{ProlinkError, Result};
use crate::model::{Artifact, ArtifactKind, PlayerId, TrackKey, TrackType};
use crate::store::Store;

pub struct LoaderConfig {
    pub menu_op_timeout: Duration,
    pub analysis_wait_total: Duration,
    pub analysis_retry_interval: Duration,
}

pub struct Loader {
    store: Arc<Store>,
    archives: std::sync::RwLock<Vec<Arc<dyn MediaArchive>>>,
    sessions: DashMap<PlayerId, Arc<dyn DbServerSession>>,
    menu_locks: DashMap<PlayerId, Arc<Mutex<()>>>,
    hot_cache: DashMap<(TrackKey, ArtifactKind), Artifact>,
    inflight: DashMap<(TrackKey, ArtifactKind), Arc<Notify>>,
    config: LoaderConfig,
}

impl Loader {
    pub fn new(store: Arc<Store>, config: LoaderConfig) -> Loader {
        Loader {
            store,
            archives: std::sync::RwLock::new(Vec::new()),
            sessions: DashMap::new(),
            menu_locks: DashMap::new(),
            hot_cache: DashMap::new(),
            inflight: DashMap::new(),
            config,
        }
    }

    /// Registers an artifact source, consulted in registration order
    /// before any dbserver query. Safe to call at any time; a load already
    /// in flight sees whatever list existed when it started consulting.
    pub fn attach_archive(&self, archive: Arc<dyn MediaArchive>) {
        self.archives
            .write()
            .expect("archive list lock poisoned")
            .push(archive);
    }

    pub fn attach_session(&self, player: PlayerId, session: Arc<dyn DbServerSession>) {
        self.sessions.insert(player, session);
    }

    pub fn detach_session(&self, player: PlayerId) {
        self.sessions.remove(&player);
        self.menu_locks.remove(&player);
    }

    pub async fn load(&self, key: TrackKey, kind: ArtifactKind) -> Result<Artifact> {
        if let Some(artifact) = self.from_cache(&key, &kind) {
            return Ok(artifact);
        }

        loop {
            let notify = self.inflight.get(&(key, kind)).map(|e| e.value().clone());
            match notify {
                Some(notify) => {
                    notify.notified().await;
                    if let Some(artifact) = self.from_cache(&key, &kind) {
                        return Ok(artifact);
                    }
                    // The leader's attempt didn't produce a cache hit (it
                    // failed or the kind isn't cacheable); race to lead
                    // the next attempt ourselves.
                    continue;
                }
                None => {
                    let notify = Arc::new(Notify::new());
                    let entry = self
                        .inflight
                        .entry((key, kind))
                        .or_insert_with(|| notify.clone());
                    let is_leader = Arc::ptr_eq(entry.value(), &notify);
                    drop(entry);
                    if !is_leader {
                        continue;
                    }

                    let result = self.resolve(key, kind).await;
                    self.inflight.remove(&(key, kind));
                    notify.notify_waiters();
                    return result;
                }
            }
        }
    }

    fn from_cache(&self, key: &TrackKey, kind: &ArtifactKind) -> Option<Artifact> {
        if let Some(artifact) = self.hot_cache.get(&(*key, *kind)) {
            return Some(artifact.value().clone());
        }
        match kind {
            ArtifactKind::BeatGrid => self.store.grid(key).map(Artifact::BeatGrid),
            ArtifactKind::CueList => self.store.cues(key).map(Artifact::CueList),
            ArtifactKind::Metadata => self.store.metadata(key).map(Artifact::Metadata),
            _ => None,
        }
    }

    fn cache(&self, key: TrackKey, kind: ArtifactKind, artifact: &Artifact) {
        match artifact {
            Artifact::BeatGrid(grid) => self.store.put_grid_if_absent(key, grid.clone()),
            Artifact::CueList(cues) => self.store.put_cues_if_absent(key, cues.clone()),
            Artifact::Metadata(metadata) => self.store.put_metadata_if_absent(key, metadata.clone()),
            _ => {
                self.hot_cache.insert((key, kind), artifact.clone());
            }
        }
    }

    async fn resolve(&self, key: TrackKey, kind: ArtifactKind) -> Result<Artifact> {
        if key.track_type == TrackType::Unanalyzed {
            return self.resolve_unanalyzed(key, kind).await;
        }

        if let Some(artifact) = self.consult_archives(&key, &kind).await? {
            self.cache(key, kind, &artifact);
            return Ok(artifact);
        }

        if let Some(artifact) = self.query_dbserver(key, kind).await? {
            self.cache(key, kind, &artifact);
            return Ok(artifact);
        }

        if let ArtifactKind::AlbumArt { high_res: true } = kind {
            return self.resolve(key, ArtifactKind::AlbumArt { high_res: false }).await;
        }

        Err(ProlinkError::NotAvailable {
            player: key.player,
            kind,
        })
    }

    async fn resolve_unanalyzed(&self, key: TrackKey, kind: ArtifactKind) -> Result<Artifact> {
        let deadline = tokio::time::Instant::now() + self.config.analysis_wait_total;
        loop {
            if let Some(artifact) = self.consult_archives(&key, &kind).await? {
                self.cache(key, kind, &artifact);
                return Ok(artifact);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ProlinkError::StillAnalyzing { player: key.player });
            }
            tokio::time::sleep(self.config.analysis_retry_interval).await;
        }
    }

    async fn consult_archives(
        &self,
        key: &TrackKey,
        kind: &ArtifactKind,
    ) -> Result<Option<Artifact>> {
        let archives = self.archives.read().expect("archive list lock poisoned").clone();
        for archive in &archives {
            if let Some(artifact) = archive.fetch(key, kind).await? {
                return Ok(Some(artifact));
            }
        }
        Ok(None)
    }

    async fn query_dbserver(&self, key: TrackKey, kind: ArtifactKind) -> Result<Option<Artifact>> {
        let session = match self.sessions.get(&key.player) {
            Some(s) => s.value().clone(),
            None => return Ok(None),
        };
        let lock = self
            .menu_locks
            .entry(key.player)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone();
        let _guard = lock.lock().await;

        debug!(target: "prolink", "querying dbserver on player {} for {:?}", key.player, kind);
        match timeout(self.config.menu_op_timeout, session.request_menu(&key, &kind)).await {
            Ok(result) => result,
            Err(_) => Err(ProlinkError::Timeout(format!(
                "dbserver menu operation on player {}",
                key.player
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::test_support::FakeArchive;
    use crate::dbserver::test_support::SlowSession;
    use crate::model::{SlotKind, TrackMetadata};
    use std::sync::atomic::Ordering;

    fn key() -> TrackKey {
        TrackKey {
            player: 2,
            slot: SlotKind::Usb,
            rekordbox_id: 7,
            track_type: TrackType::Rekordbox,
        }
    }

    fn config() -> LoaderConfig {
        LoaderConfig {
            menu_op_timeout: Duration::from_millis(200),
            analysis_wait_total: Duration::from_millis(100),
            analysis_retry_interval: Duration::from_millis(20),
        }
    }

    #[tokio::test]
    async fn resolves_from_archive_and_caches_in_store() {
        let store = Arc::new(Store::new());
        let loader = Loader::new(store.clone(), config());
        let archive = Arc::new(FakeArchive::default());
        let metadata = TrackMetadata {
            title: Some("Rej".into()),
            artist: Some("Plastikman".into()),
            duration_secs: Some(400),
        };
        archive
            .artifacts
            .insert((key(), ArtifactKind::Metadata), Artifact::Metadata(metadata.clone()));
        loader.attach_archive(archive);

        let artifact = loader.load(key(), ArtifactKind::Metadata).await.unwrap();
        match artifact {
            Artifact::Metadata(m) => assert_eq!(m.title, metadata.title),
            _ => panic!("wrong artifact"),
        }
        assert!(store.metadata(&key()).is_some());
    }

    #[tokio::test]
    async fn falls_through_to_dbserver_when_no_archive_has_it() {
        let store = Arc::new(Store::new());
        let loader = Loader::new(store, config());
        let session = Arc::new(SlowSession {
            delay: Duration::from_millis(1),
            calls: std::sync::atomic::AtomicUsize::new(0),
            artifact: Some(Artifact::Metadata(TrackMetadata::default())),
        });
        loader.attach_session(2, session.clone());

        let artifact = loader.load(key(), ArtifactKind::Metadata).await.unwrap();
        assert!(matches!(artifact, Artifact::Metadata(_)));
        assert_eq!(session.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dbserver_timeout_surfaces_as_timeout_error() {
        let store = Arc::new(Store::new());
        let mut cfg = config();
        cfg.menu_op_timeout = Duration::from_millis(10);
        let loader = Loader::new(store, cfg);
        let session = Arc::new(SlowSession {
            delay: Duration::from_millis(100),
            calls: std::sync::atomic::AtomicUsize::new(0),
            artifact: Some(Artifact::Metadata(TrackMetadata::default())),
        });
        loader.attach_session(2, session);

        let err = loader.load(key(), ArtifactKind::Metadata).await.unwrap_err();
        assert!(matches!(err, ProlinkError::Timeout(_)));
    }

    #[tokio::test]
    async fn unanalyzed_track_gives_up_after_the_wait_budget() {
        let store = Arc::new(Store::new());
        let loader = Loader::new(store, config());
        let mut unanalyzed_key = key();
        unanalyzed_key.track_type = TrackType::Unanalyzed;

        let err = loader
            .load(unanalyzed_key, ArtifactKind::BeatGrid)
            .await
            .unwrap_err();
        assert!(matches!(err, ProlinkError::StillAnalyzing { .. }));
    }

    #[tokio::test]
    async fn high_res_album_art_falls_back_to_low_res() {
        let store = Arc::new(Store::new());
        let loader = Loader::new(store, config());
        let archive = Arc::new(FakeArchive::default());
        archive.artifacts.insert(
            (key(), ArtifactKind::AlbumArt { high_res: false }),
            Artifact::AlbumArt(vec![1, 2, 3]),
        );
        loader.attach_archive(archive);

        let artifact = loader
            .load(key(), ArtifactKind::AlbumArt { high_res: true })
            .await
            .unwrap();
        assert!(matches!(artifact, Artifact::AlbumArt(bytes) if bytes == vec![1, 2, 3]));
    }
}
