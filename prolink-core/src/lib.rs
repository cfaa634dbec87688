//! Position & Identity Core: joins a Pro DJ Link network, tracks who's on
//! it, and reconstructs each player's playhead position from the sparse,
//! inconsistent evidence the hardware actually broadcasts.
//!
//! [`Engine::join`] does the three-phase handshake, then spawns one task
//! per packet family (membership/keep-alive on port 50000, beat and
//! precise-position on port 50001, player status on port 50002) plus the
//! identity-fingerprint worker. [`Engine::subscribe`] is the main way
//! callers consume it; [`Engine::latest_snapshot`] and
//! [`Engine::time_for`] are for polling instead.

pub mod archive;
pub mod attribution;
pub mod clock;
pub mod config;
pub mod dbserver;
pub mod error;
pub mod fanout;
pub mod identity;
pub mod loader;
pub mod model;
pub mod position;
pub mod proto;
pub mod registry;
pub mod store;
mod tasks;

use std::sync::Arc;
use std::time::Duration;

use log::error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

pub use config::Config;
pub use error::{ProlinkError, Result};
pub use model::{
    Artifact, ArtifactKind, DeviceClass, PlayerId, PositionSnapshot, SlotKind, SubscriptionKind,
    TrackKey, TrackType,
};
pub use registry::{Peer, PeerEvent};

use archive::MediaArchive;
use attribution::AttributionResolver;
use dbserver::DbServerSession;
use fanout::Fanout;
use identity::IdentityWorker;
use loader::{Loader, LoaderConfig};
use position::Engine as PositionEngine;
use registry::Registry;
use store::Store;
use tasks::{beat::BeatTask, membership::MembershipTask, status::StatusTask};

/// Top-level events a caller can subscribe to.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    PeerJoined(Peer),
    PeerLeft(Peer),
    Moved {
        player: PlayerId,
        /// `None` once the player is lost or its status reports no track;
        /// delivered exactly once per transition into "no information".
        snapshot: Option<PositionSnapshot>,
    },
    Signature {
        player: PlayerId,
        signature: Option<model::Signature>,
    },
}

/// A running Position & Identity Core. Dropping it stops every background
/// task; prefer [`Engine::terminate`] to wait for clean shutdown first.
pub struct Engine {
    registry: Arc<Registry>,
    store: Arc<Store>,
    position: Arc<PositionEngine>,
    fanout: Arc<Fanout>,
    loader: Arc<Loader>,
    attribution: Arc<AttributionResolver>,
    identity: IdentityWorker,
    child_tasks: Vec<JoinHandle<()>>,
    peers_tx: broadcast::Sender<PeerEvent>,
}

impl Engine {
    /// Joins the network described by `config` and starts every background
    /// task. Resolves once the device-number-claim handshake completes.
    pub async fn join(config: Config) -> Result<Engine> {
        let registry = Arc::new(Registry::new());
        let store = Arc::new(Store::new());
        let fanout = Arc::new(Fanout::new());
        let attribution = Arc::new(AttributionResolver::new());

        let fanout_for_identity = fanout.clone();
        let identity = IdentityWorker::spawn_with_listener(Some(Box::new(move |player, signature| {
            fanout_for_identity.on_signature(player, signature);
        })));

        let loader = Arc::new(Loader::new(
            store.clone(),
            LoaderConfig {
                menu_op_timeout: config.menu_op_timeout,
                analysis_wait_total: config.analysis_wait_total,
                analysis_retry_interval: config.analysis_retry_interval,
            },
        ));

        let clock: Arc<dyn clock::Clock> = Arc::new(clock::SystemClock);

        let mut position = PositionEngine::new(clock.clone());
        let fanout_for_listener = fanout.clone();
        position.set_listener(Box::new(move |player, snapshot| {
            fanout_for_listener.on_snapshot(player, snapshot.cloned());
        }));
        let position = Arc::new(position);

        let (joined_tx, mut joined_rx) = watch::channel(false);
        let (peers_tx, peers_rx) = broadcast::channel(64);

        let mut membership =
            MembershipTask::new(&config, registry.clone(), joined_tx, peers_tx.clone()).await?;
        let status = StatusTask::new(
            peers_tx.subscribe(),
            registry.clone(),
            store.clone(),
            position.clone(),
            loader.clone(),
            attribution.clone(),
            clock.clone(),
        )
        .await?;
        let beat = BeatTask::new(&config, position.clone(), clock.clone()).await?;

        let status_handle = tokio::spawn(async move {
            if let Err(e) = status.run().await {
                error!(target: "prolink", "status task error: {}", e);
            }
        });
        let beat_handle = tokio::spawn(async move {
            if let Err(e) = beat.run().await {
                error!(target: "prolink", "beat task error: {}", e);
            }
        });
        // Membership runs last so the other tasks' subscriptions to
        // `peers_tx` are already in place before any PeerEvent fires.
        let membership_handle = tokio::spawn(async move {
            if let Err(e) = membership.run().await {
                error!(target: "prolink", "membership task error: {}", e);
            }
        });

        while !*joined_rx.borrow() {
            joined_rx.changed().await?;
        }

        Ok(Engine {
            registry,
            store,
            position,
            fanout,
            loader,
            attribution,
            identity,
            child_tasks: vec![membership_handle, status_handle, beat_handle],
            peers_tx,
        })
    }

    /// Every peer currently believed to be on the network.
    pub fn peers(&self) -> Vec<Peer> {
        self.registry.peers()
    }

    /// The most recent raw snapshot for a player, if its beat grid has
    /// loaded and at least one status/beat/precise update has arrived.
    pub fn latest_snapshot(&self, player: PlayerId) -> Option<PositionSnapshot> {
        self.position.latest_snapshot(player)
    }

    /// Dead-reckoned position-in-track, in milliseconds, as of right now.
    pub fn time_for(&self, player: PlayerId) -> Option<u32> {
        self.position.interpolated_time(player)
    }

    /// Subscribes to movement events. `player` narrows delivery to one
    /// player; `None` subscribes to every player. `slack` overrides the
    /// configured default dead-reckoning tolerance for this subscription.
    pub fn subscribe(
        &self,
        kind: SubscriptionKind,
        player: Option<PlayerId>,
        slack: Duration,
    ) -> mpsc::Receiver<EngineEvent> {
        let (tx, rx) = mpsc::channel(64);
        self.fanout.subscribe(kind, player, slack, tx);
        rx
    }

    /// A broadcast stream of peer join/leave events, independent of the
    /// `subscribe` fanout.
    pub fn peer_events(&self) -> broadcast::Receiver<PeerEvent> {
        self.peers_tx.subscribe()
    }

    /// Resolves one artifact for a track, trying the hot cache, every
    /// attached `MediaArchive`, then a live dbserver query, in that order.
    pub async fn load_artifact(&self, key: TrackKey, kind: ArtifactKind) -> Result<Artifact> {
        self.loader.load(key, kind).await
    }

    /// Registers a general-purpose artifact source, consulted in
    /// registration order before any dbserver query is attempted.
    pub fn attach_archive(&self, archive: Arc<dyn MediaArchive>) {
        self.loader.attach_archive(archive);
    }

    /// Registers a `MediaArchive` to one of the three logical slots an
    /// "Opus"-class player can report media from, the way `attach_archive`
    /// registers a general-purpose source. `slot` must be 1, 2, or 3.
    pub fn attach_archive_for_opus(&self, slot: u8, archive: Arc<dyn MediaArchive>) -> Result<()> {
        self.attribution.attach(slot, archive)
    }

    /// Resolves which attached Opus-slot archive owns the track currently
    /// reported under `key`, matching `live_pssi` (the player's announced
    /// song-structure tag) against each archive's own PSSI section.
    pub async fn resolve_opus_attribution(
        &self,
        player: PlayerId,
        key: TrackKey,
        live_pssi: &[u8],
    ) -> Option<TrackKey> {
        self.attribution.resolve(player, key, live_pssi).await
    }

    pub fn attach_dbserver_session(&self, player: PlayerId, session: Arc<dyn DbServerSession>) {
        self.loader.attach_session(player, session);
    }

    /// The most recently computed content fingerprint for a player,
    /// without waiting on a fresh computation.
    pub fn cached_signature(&self, player: PlayerId) -> Option<model::Signature> {
        self.identity.cached(player)
    }

    /// Requests this track's content fingerprint, computing it on the
    /// background identity worker.
    pub async fn signature_for(&self, player: PlayerId, input: identity::SignatureInput) -> Option<model::Signature> {
        self.identity.request(player, input).await
    }

    /// Stops every background task and waits for them to exit.
    pub async fn terminate(self) {
        drop(self.peers_tx);
        for t in self.child_tasks {
            let _ = t.await;
        }
    }
}
