//! Join handshake and steady-state keep-alive broadcast. Three announce
//! broadcasts, then three rounds of each device-number-claim phase, then a
//! keep-alive every 1500ms for as long as the engine runs. Peers are
//! tracked in the shared `Registry`; `PeerEvent`s are published on a
//! broadcast channel so other tasks can react without polling it.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use log::info;
use mac_address::mac_address_by_name;
use network_interface::{Addr, NetworkInterface, NetworkInterfaceConfig, V4IfAddr};
use tokio::{
    net::UdpSocket,
    sync::{broadcast, watch},
    time::{self, Instant},
};

use crate::config::Config;
use crate::error::{ProlinkError, Result};
use crate::model::DeviceClass;
use crate::proto::{self, KeepAlivePacket};
use crate::registry::{Peer, PeerEvent, Registry};

pub struct MembershipTask {
    config: Config,
    joined_tx: watch::Sender<bool>,
    peers_tx: broadcast::Sender<PeerEvent>,
    registry: Arc<Registry>,
    socket: UdpSocket,
    my_addr: SocketAddr,
    broadcast_addr: SocketAddr,
    mac_addr: [u8; 6],
    ip_addr: [u8; 4],
}

fn ipv4_iface(iface: &NetworkInterface) -> Option<(String, V4IfAddr)> {
    match iface.addr {
        Some(Addr::V4(a)) => Some((iface.name.clone(), a)),
        _ => None,
    }
}

impl MembershipTask {
    pub async fn new(
        config: &Config,
        registry: Arc<Registry>,
        joined_tx: watch::Sender<bool>,
        peers_tx: broadcast::Sender<PeerEvent>,
    ) -> Result<MembershipTask> {
        let all_interfaces =
            NetworkInterface::show().map_err(|e| anyhow!("can't get network interfaces: {}", e))?;

        let mut network_interfaces = all_interfaces.iter().filter_map(ipv4_iface);

        let (name, addr) = if let Some(iface_name) = &config.interface_name {
            network_interfaces
                .find(|(name, _)| name == iface_name)
                .ok_or_else(|| anyhow!("can't find interface \"{}\"", iface_name))?
        } else {
            network_interfaces
                .next()
                .ok_or_else(|| anyhow!("can't find a default interface"))?
        };

        let mac = mac_address_by_name(&name)
            .map_err(|e| anyhow!("failed to look up mac address: {}", e))?
            .ok_or_else(|| anyhow!("failed to look up mac address"))?;
        let ip = IpAddr::V4(addr.ip);
        let my_addr = SocketAddr::new(ip, 50000);
        let ip_addr = addr.ip.octets();
        let mac_addr = mac.bytes();

        let broadcast_addr = SocketAddr::new(
            IpAddr::V4(addr.broadcast.ok_or_else(|| anyhow!("can't get broadcast addr"))?),
            50000,
        );

        let socket = UdpSocket::bind("0.0.0.0:50000").await?;
        socket.set_broadcast(true)?;

        Ok(MembershipTask {
            config: config.clone(),
            joined_tx,
            peers_tx,
            registry,
            socket,
            my_addr,
            broadcast_addr,
            mac_addr,
            ip_addr,
        })
    }

    fn publish(&self, event: PeerEvent) -> Result<()> {
        match event {
            PeerEvent::Joined(ref p) => info!(target: "prolink", "peer joined: {:?}", p),
            PeerEvent::Left(ref p) => info!(target: "prolink", "peer left: {:?}", p),
        }
        // No subscribers is routine (e.g. before the engine has wired up
        // its own consumers) and is not an error worth propagating.
        let _ = self.peers_tx.send(event);
        Ok(())
    }

    pub async fn run(&mut self) -> Result<()> {
        match self.run_impl().await {
            Err(ProlinkError::Terminating) => Ok(()),
            other => other,
        }
    }

    async fn run_impl(&mut self) -> Result<()> {
        self.join().await?;

        let mut keep_alive = KeepAlivePacket {
            name: self.config.name.clone(),
            proto_ver: 2,
            device_num: self.config.device_num,
            device_type: 2,
            mac_addr: self.mac_addr,
            ip_addr: self.ip_addr,
            peers_seen: 1,
            unknown_35: 1,
        };

        let mut buf = Vec::new();
        loop {
            for event in self.registry.expire(
                std::time::Instant::now(),
                self.config.peer_timeout,
            ) {
                self.publish(event)?;
            }

            keep_alive.peers_seen = self.registry.peers().len() as u8 + 1;
            buf.clear();
            keep_alive.write(&mut buf)?;
            self.socket.send_to(&buf, self.broadcast_addr).await?;
            self.wait(Duration::from_millis(1500)).await?;
        }
    }

    async fn join(&mut self) -> Result<()> {
        let announce = proto::AnnouncePacket {
            name: self.config.name.clone(),
            proto_ver: 2,
        };
        let mut data = Vec::new();
        for _ in 0..3 {
            announce.write(&mut data)?;
            self.socket.send_to(&data, self.broadcast_addr).await?;
            data.clear();
            self.wait(Duration::from_millis(300)).await?;
        }

        let mut claim1 = proto::DeviceNumClaim1Packet {
            name: self.config.name.clone(),
            proto_ver: 2,
            pkt_num: 0,
            mac_addr: self.mac_addr,
        };
        for i in 1..4 {
            claim1.pkt_num = i;
            claim1.write(&mut data)?;
            self.socket.send_to(&data, self.broadcast_addr).await?;
            data.clear();
            self.wait(Duration::from_millis(300)).await?;
        }

        let mut claim2 = proto::DeviceNumClaim2Packet {
            name: self.config.name.clone(),
            proto_ver: 2,
            ip_addr: self.ip_addr,
            mac_addr: self.mac_addr,
            device_num: self.config.device_num,
            pkt_num: 0,
            auto_assign: false,
        };
        for i in 1..4 {
            claim2.pkt_num = i;
            claim2.write(&mut data)?;
            self.socket.send_to(&data, self.broadcast_addr).await?;
            data.clear();
            self.wait(Duration::from_millis(300)).await?;
        }

        let claim3 = proto::DeviceNumClaim3Packet {
            name: self.config.name.clone(),
            proto_ver: 2,
            device_num: self.config.device_num,
            pkt_num: 1,
        };
        claim3.write(&mut data)?;
        self.socket.send_to(&data, self.broadcast_addr).await?;
        self.wait(Duration::from_millis(300)).await?;

        self.joined_tx
            .send(true)
            .map_err(|_| anyhow!("no one is listening for the joined signal"))?;
        Ok(())
    }

    async fn wait(&mut self, dur: Duration) -> Result<()> {
        self.wait_until(Instant::now() + dur).await
    }

    async fn wait_until(&mut self, when: Instant) -> Result<()> {
        let sleep = time::sleep_until(when);
        tokio::pin!(sleep);

        let mut buf = [0u8; 4096];
        loop {
            tokio::select! {
                _ = &mut sleep => return Ok(()),
                _ = self.joined_tx.closed() => return Err(ProlinkError::Terminating),
                res = self.socket.recv_from(&mut buf) => {
                    if let Ok((len, src)) = res {
                        if src != self.my_addr {
                            if let Ok(proto::Packet::KeepAlive(ka)) = proto::Packet::parse(&buf[..len]) {
                                self.handle_keep_alive(&ka)?;
                            }
                        }
                    }
                }
            }
        }
    }

    fn handle_keep_alive(&mut self, ka: &KeepAlivePacket) -> Result<()> {
        let peer = Peer {
            name: ka.name.clone(),
            device_num: ka.device_num,
            device_class: DeviceClass::classify(ka.device_num, &ka.name),
            mac_addr: ka.mac_addr,
            ip_addr: ka.ip_addr,
            proto_ver: ka.proto_ver,
            last_seen: std::time::Instant::now(),
        };
        if let Some(event) = self.registry.observe(peer) {
            self.publish(event)?;
        }
        Ok(())
    }
}
