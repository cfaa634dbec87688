//! Beat and precise-position task: reads port 50001. Both packet families
//! land here since real hardware broadcasts them on the same port.

use std::sync::Arc;

use log::debug;
use tokio::net::UdpSocket;

use crate::clock::Clock;
use crate::config::Config;
use crate::error::Result;
use crate::position::Engine as PositionEngine;
use crate::proto;

pub struct BeatTask {
    socket: UdpSocket,
    position: Arc<PositionEngine>,
    clock: Arc<dyn Clock>,
    use_precise_packets: bool,
}

impl BeatTask {
    pub async fn new(config: &Config, position: Arc<PositionEngine>, clock: Arc<dyn Clock>) -> Result<BeatTask> {
        let socket = UdpSocket::bind("0.0.0.0:50001").await?;
        Ok(BeatTask {
            socket,
            position,
            clock,
            use_precise_packets: config.use_precise_packets,
        })
    }

    pub async fn run(mut self) -> Result<()> {
        let mut buf = [0u8; 4096];
        loop {
            let (len, _src) = self.socket.recv_from(&mut buf).await?;
            match proto::Packet::parse(&buf[..len]) {
                Ok(proto::Packet::Beat(beat)) => {
                    self.position.on_beat(
                        beat.device_num,
                        self.clock.now_ns(),
                        beat.bpm as f64,
                        beat.pitch_multiplier(),
                    );
                }
                Ok(proto::Packet::PrecisePosition(pp)) if self.use_precise_packets => {
                    self.position.on_precise_position(
                        pp.device_num,
                        self.clock.now_ns(),
                        pp.position_ms,
                        pp.pitch_multiplier(),
                    );
                }
                Ok(_) => (),
                Err(e) => debug!(target: "prolink", "beat parse error: {}", e),
            }
        }
    }
}
