//! Participant Registry: who's on the network right now. Backed by a
//! `DashMap` so readers (Position Engine, Artifact Loader) can look up a
//! peer's class or address without contending with the membership task's
//! periodic keep-alive bookkeeping.

use std::time::Instant;

use dashmap::DashMap;

use crate::model::{DeviceClass, PlayerId, GATEWAY_DEVICE_NUM};

#[derive(Clone, Debug, PartialEq)]
pub struct Peer {
    pub name: String,
    pub device_num: PlayerId,
    pub device_class: DeviceClass,
    pub mac_addr: [u8; 6],
    pub ip_addr: [u8; 4],
    pub proto_ver: u8,
    #[doc(hidden)]
    pub last_seen: Instant,
}

impl Peer {
    /// Same identity, ignoring the liveness timestamp; used to detect a
    /// peer rebooting with a different address without also firing a
    /// spurious Joined/Left pair for an untouched keep-alive.
    pub fn is_same(&self, other: &Peer) -> bool {
        self.name == other.name
            && self.device_num == other.device_num
            && self.mac_addr == other.mac_addr
            && self.ip_addr == other.ip_addr
    }
}

/// Broadcast to every interested subsystem whenever registry membership
/// changes. Lagging receivers miss events rather than block the registry;
/// callers that need a consistent view should also poll `Registry::peers`.
#[derive(Clone, Debug, PartialEq)]
pub enum PeerEvent {
    Joined(Peer),
    Left(Peer),
}

/// Shared, concurrently-readable view of who's currently on the network.
#[derive(Default)]
pub struct Registry {
    peers: DashMap<PlayerId, Peer>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry::default()
    }

    pub fn contains(&self, device_num: PlayerId) -> bool {
        self.peers.contains_key(&device_num)
    }

    pub fn get(&self, device_num: PlayerId) -> Option<Peer> {
        self.peers.get(&device_num).map(|p| p.value().clone())
    }

    pub fn peers(&self) -> Vec<Peer> {
        self.peers.iter().map(|p| p.value().clone()).collect()
    }

    /// Inserts/refreshes a peer observed via keep-alive. Returns the
    /// `PeerEvent` to publish, if any: `None` means an unremarkable
    /// keep-alive refresh of an already-known peer.
    pub fn observe(&self, peer: Peer) -> Option<PeerEvent> {
        if peer.device_num == GATEWAY_DEVICE_NUM && peer.device_class == DeviceClass::Gateway {
            return None;
        }
        match self.peers.insert(peer.device_num, peer.clone()) {
            Some(prev) if prev.is_same(&peer) => None,
            Some(prev) => {
                // A different peer claimed this device number: the old one
                // is implicitly gone.
                Some(PeerEvent::Left(prev))
            }
            None => Some(PeerEvent::Joined(peer)),
        }
    }

    /// Removes every peer whose `last_seen` is older than `timeout`,
    /// returning the `Left` events for them.
    pub fn expire(&self, now: Instant, timeout: std::time::Duration) -> Vec<PeerEvent> {
        let stale: Vec<PlayerId> = self
            .peers
            .iter()
            .filter(|p| now.duration_since(p.last_seen) > timeout)
            .map(|p| *p.key())
            .collect();

        stale
            .into_iter()
            .filter_map(|id| self.peers.remove(&id))
            .map(|(_, peer)| PeerEvent::Left(peer))
            .collect()
    }
}
