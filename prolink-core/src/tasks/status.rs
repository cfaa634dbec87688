//! Player status task: reads port 50002, keeps the Position Engine current
//! for every status broadcast, and kicks off a background beat-grid fetch
//! the first time a player's current track changes.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, warn};
use tokio::{net::UdpSocket, sync::broadcast};

use crate::attribution::AttributionResolver;
use crate::clock::Clock;
use crate::error::Result;
use crate::loader::Loader;
use crate::model::{Artifact, ArtifactKind, SlotKind, TrackKey, TrackType};
use crate::position::{Engine as PositionEngine, StatusObservation};
use crate::proto::{self, PlayerStatusPacket};
use crate::registry::{PeerEvent, Registry};
use crate::store::Store;

pub struct StatusTask {
    socket: UdpSocket,
    peers_rx: broadcast::Receiver<PeerEvent>,
    registry: Arc<Registry>,
    store: Arc<Store>,
    position: Arc<PositionEngine>,
    loader: Arc<Loader>,
    attribution: Arc<AttributionResolver>,
    clock: Arc<dyn Clock>,
    current_keys: HashMap<u8, TrackKey>,
}

impl StatusTask {
    pub async fn new(
        peers_rx: broadcast::Receiver<PeerEvent>,
        registry: Arc<Registry>,
        store: Arc<Store>,
        position: Arc<PositionEngine>,
        loader: Arc<Loader>,
        attribution: Arc<AttributionResolver>,
        clock: Arc<dyn Clock>,
    ) -> Result<StatusTask> {
        let socket = UdpSocket::bind("0.0.0.0:50002").await?;
        Ok(StatusTask {
            socket,
            peers_rx,
            registry,
            store,
            position,
            loader,
            attribution,
            clock,
            current_keys: HashMap::new(),
        })
    }

    pub async fn run(mut self) -> Result<()> {
        let mut buf = [0u8; 4096];
        loop {
            tokio::select! {
                res = self.peers_rx.recv() => {
                    if let Ok(PeerEvent::Left(peer)) = res {
                        self.current_keys.remove(&peer.device_num);
                        self.position.forget(peer.device_num);
                        self.store.invalidate_for_player(peer.device_num);
                        self.loader.detach_session(peer.device_num);
                        self.attribution.forget(peer.device_num);
                    }
                }
                res = self.socket.recv_from(&mut buf) => {
                    if let Ok((len, _src)) = res {
                        match proto::Packet::parse(&buf[..len]) {
                            Ok(proto::Packet::PlayerStatus(status)) => self.handle(&status),
                            Ok(_) => (),
                            Err(e) => debug!(target: "prolink", "status parse error: {}", e),
                        }
                    }
                }
            }
        }
    }

    fn handle(&mut self, pkt: &PlayerStatusPacket) {
        if !self.registry.contains(pkt.device_num) {
            warn!(target: "prolink", "status packet from unknown player {}", pkt.device_num);
            return;
        }

        let slot = match SlotKind::from_wire(pkt.track_slot) {
            Some(s) => s,
            None => return,
        };
        let key = TrackKey {
            player: pkt.track_device,
            slot,
            rekordbox_id: pkt.rekordbox_id,
            track_type: TrackType::from_wire(pkt.track_type),
        };

        let is_new_track = self.current_keys.get(&pkt.device_num) != Some(&key);
        if is_new_track {
            self.current_keys.insert(pkt.device_num, key);
            self.store.invalidate(&key);
            if key.rekordbox_id != 0 {
                let loader = self.loader.clone();
                tokio::spawn(async move {
                    if let Err(e) = loader.load(key, ArtifactKind::BeatGrid).await {
                        debug!(target: "prolink", "beat grid load failed for {:?}: {}", key, e);
                    }
                });
            }
        }

        if let Some(Artifact::BeatGrid(grid)) = self.store_grid(&key) {
            self.position.on_status(
                pkt.device_num,
                self.clock.now_ns(),
                grid,
                StatusObservation {
                    playing: pkt.playing(),
                    reverse: pkt.reverse(),
                    pitch: pkt.pitch_multiplier(),
                    beat_number: pkt.beat_number(),
                    cues: self.store.cues(&key),
                },
            );
        }
    }

    fn store_grid(&self, key: &TrackKey) -> Option<Artifact> {
        self.store.grid(key).map(Artifact::BeatGrid)
    }
}
