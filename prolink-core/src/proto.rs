//! Wire-level parsing for the three inbound UDP packet families: device
//! announcements / negotiation (port 50000), beat and precise-position
//! notifications (port 50001), and player status (port 50002).
//!
//! Every packet shares a fixed 10-byte magic header followed by a one-byte
//! packet-type discriminant. Device number lives at a fixed offset for
//! status/beat packets; the device-number-claim negotiation packets carry
//! it at a different offset inside their own layout because they are
//! exchanged before a device number has been assigned. Lengths are fixed
//! per family: a short or malformed packet is a hard parse error and the
//! packet is dropped by the caller, never a panic.

use std::{convert::TryInto, io::Write};

use byteorder::{BigEndian, WriteBytesExt};
use nom::{
    bytes::complete::{tag, take},
    error::context,
    number::complete::{be_u16, be_u32, be_u8},
    IResult,
};
use nom_locate::LocatedSpan;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use pretty_hex::pretty_hex;

use crate::error::ProlinkError;
use crate::model::PlayerId;

type Span<'a> = LocatedSpan<&'a [u8]>;
type Result<T> = crate::error::Result<T>;

#[derive(FromPrimitive)]
#[repr(u8)]
enum PacketType {
    DeviceNumClaim1 = 0x00,
    DeviceNumClaim2 = 0x02,
    DeviceNumClaim3 = 0x04,
    KeepAlive = 0x06,
    AnnounceStatus = 0x0a, // Both announce and status packets share this type.
    PrecisePosition = 0x0b,
    Beat = 0x28,
}

const HEADER: &[u8] = &[0x51, 0x73, 0x70, 0x74, 0x31, 0x57, 0x6d, 0x4a, 0x4f, 0x4c];

/// Sentinel beat number meaning "unknown"; the engine maps this to `None`.
pub const BEAT_UNKNOWN: u32 = 0xffff_ffff;

/// Wire-level 1.0x pitch center point; `BeatPacket::pitch`/`PlayerStatusPacket::pitch`
/// are fixed-point fractions around this value.
pub const PITCH_CENTER: u32 = 0x10_0000;

fn header(i: Span) -> IResult<Span, ()> {
    let (i, _) = tag(HEADER)(i)?;
    Ok((i, ()))
}

fn device_name(i: Span) -> IResult<Span, String> {
    let (i, raw_name) = take(20usize)(i)?;
    let name = String::from_utf8_lossy(&raw_name);
    let name = name.trim_end_matches('\0');
    Ok((i, name.into()))
}

fn write_device_name(w: &mut dyn Write, name: &str) -> std::io::Result<()> {
    let mut name_buf = [0u8; 20];
    let bytes = name.as_bytes();
    let n = bytes.len().min(20);
    name_buf[..n].copy_from_slice(&bytes[..n]);
    w.write_all(&name_buf)
}

struct NegotiationHeader {
    name: String,
    proto_ver: u8,
}

fn negotiation_header(pkt_type: u8) -> impl Fn(Span) -> IResult<Span, NegotiationHeader> {
    move |i: Span| -> IResult<Span, NegotiationHeader> {
        let (i, _) = header(i)?;
        let (i, _) = tag(&[pkt_type, 0x00])(i)?;
        let (i, name) = device_name(i)?;
        let (i, _) = tag(&[0x01])(i)?;
        let (i, proto_ver) = be_u8(i)?;
        let (i, _len) = be_u16(i)?;
        Ok((i, NegotiationHeader { name, proto_ver }))
    }
}

fn write_header(
    w: &mut dyn Write,
    pkt_type: u8,
    name: &str,
    proto_ver: u8,
    pkt_len: u16,
) -> std::io::Result<()> {
    w.write_all(HEADER)?;
    w.write_u8(pkt_type)?;
    w.write_u8(0x0)?;
    write_device_name(w, name)?;
    w.write_u8(0x01)?;
    w.write_u8(proto_ver)?;
    w.write_u16::<BigEndian>(pkt_len)?;
    Ok(())
}

fn mac_addr(i: Span) -> IResult<Span, [u8; 6]> {
    let (i, mac_addr) = take(6usize)(i)?;
    Ok((i, (*mac_addr.fragment()).try_into().unwrap()))
}

fn ip_addr(i: Span) -> IResult<Span, [u8; 4]> {
    let (i, ip_addr) = take(4usize)(i)?;
    Ok((i, (*ip_addr.fragment()).try_into().unwrap()))
}

#[derive(Debug, PartialEq)]
pub struct AnnouncePacket {
    pub name: String,
    pub proto_ver: u8,
}

impl AnnouncePacket {
    pub fn write(&self, w: &mut dyn Write) -> std::io::Result<()> {
        let len = if self.proto_ver == 3 { 0x26 } else { 0x25 };
        write_header(w, PacketType::AnnounceStatus as u8, &self.name, self.proto_ver, len)?;
        w.write_u8(0x01)?;
        if self.proto_ver == 3 {
            w.write_u8(0x00)?;
        }
        Ok(())
    }

    fn parse(i: Span) -> IResult<Span, Packet> {
        let (i, hdr) = negotiation_header(PacketType::AnnounceStatus as u8)(i)?;
        let (i, _) = tag(&[0x01])(i)?;
        Ok((
            i,
            Packet::Announce(AnnouncePacket {
                name: hdr.name,
                proto_ver: hdr.proto_ver,
            }),
        ))
    }
}

#[derive(Debug, PartialEq)]
pub struct DeviceNumClaim1Packet {
    pub name: String,
    pub proto_ver: u8,
    pub pkt_num: u8,
    pub mac_addr: [u8; 6],
}

impl DeviceNumClaim1Packet {
    pub fn write(&self, w: &mut dyn Write) -> std::io::Result<()> {
        write_header(w, PacketType::DeviceNumClaim1 as u8, &self.name, self.proto_ver, 0x2c)?;
        w.write_u8(self.pkt_num)?;
        w.write_u8(0x01)?;
        w.write_all(&self.mac_addr)?;
        Ok(())
    }

    fn parse(i: Span) -> IResult<Span, Packet> {
        let (i, hdr) = negotiation_header(PacketType::DeviceNumClaim1 as u8)(i)?;
        let (i, pkt_num) = be_u8(i)?;
        let (i, _) = tag(&[0x01])(i)?;
        let (i, mac_addr) = mac_addr(i)?;
        Ok((
            i,
            Packet::DeviceNumClaim1(DeviceNumClaim1Packet {
                name: hdr.name,
                proto_ver: hdr.proto_ver,
                pkt_num,
                mac_addr,
            }),
        ))
    }
}

#[derive(Debug, PartialEq)]
pub struct DeviceNumClaim2Packet {
    pub name: String,
    pub proto_ver: u8,
    pub ip_addr: [u8; 4],
    pub mac_addr: [u8; 6],
    pub device_num: u8,
    pub pkt_num: u8,
    pub auto_assign: bool,
}

impl DeviceNumClaim2Packet {
    pub fn write(&self, w: &mut dyn Write) -> std::io::Result<()> {
        write_header(w, PacketType::DeviceNumClaim2 as u8, &self.name, self.proto_ver, 0x32)?;
        w.write_all(&self.ip_addr)?;
        w.write_all(&self.mac_addr)?;
        w.write_u8(self.device_num)?;
        w.write_u8(self.pkt_num)?;
        w.write_u8(0x01)?;
        w.write_u8(if self.auto_assign { 0x01 } else { 0x02 })?;
        Ok(())
    }

    fn parse(i: Span) -> IResult<Span, Packet> {
        let (i, hdr) = negotiation_header(PacketType::DeviceNumClaim2 as u8)(i)?;
        let (i, ip_addr) = ip_addr(i)?;
        let (i, mac_addr) = mac_addr(i)?;
        let (i, device_num) = be_u8(i)?;
        let (i, pkt_num) = be_u8(i)?;
        let (i, _) = tag(&[0x01])(i)?;
        let (i, auto) = be_u8(i)?;
        Ok((
            i,
            Packet::DeviceNumClaim2(DeviceNumClaim2Packet {
                name: hdr.name,
                proto_ver: hdr.proto_ver,
                ip_addr,
                mac_addr,
                device_num,
                pkt_num,
                auto_assign: auto == 0x01,
            }),
        ))
    }
}

#[derive(Debug, PartialEq)]
pub struct DeviceNumClaim3Packet {
    pub name: String,
    pub proto_ver: u8,
    pub device_num: u8,
    pub pkt_num: u8,
}

impl DeviceNumClaim3Packet {
    pub fn write(&self, w: &mut dyn Write) -> std::io::Result<()> {
        write_header(w, PacketType::DeviceNumClaim3 as u8, &self.name, self.proto_ver, 0x26)?;
        w.write_u8(self.device_num)?;
        w.write_u8(self.pkt_num)?;
        Ok(())
    }

    fn parse(i: Span) -> IResult<Span, Packet> {
        let (i, hdr) = negotiation_header(PacketType::DeviceNumClaim3 as u8)(i)?;
        let (i, device_num) = be_u8(i)?;
        let (i, pkt_num) = be_u8(i)?;
        Ok((
            i,
            Packet::DeviceNumClaim3(DeviceNumClaim3Packet {
                name: hdr.name,
                proto_ver: hdr.proto_ver,
                device_num,
                pkt_num,
            }),
        ))
    }
}

#[derive(Debug, PartialEq)]
pub struct KeepAlivePacket {
    pub name: String,
    pub proto_ver: u8,
    pub device_num: u8,
    pub device_type: u8,
    pub mac_addr: [u8; 6],
    pub ip_addr: [u8; 4],
    pub peers_seen: u8,
    pub unknown_35: u8,
}

impl KeepAlivePacket {
    pub fn write(&self, w: &mut dyn Write) -> std::io::Result<()> {
        write_header(w, PacketType::KeepAlive as u8, &self.name, self.proto_ver, 0x36)?;
        w.write_u8(self.device_num)?;
        w.write_u8(self.device_type)?;
        w.write_all(&self.mac_addr)?;
        w.write_all(&self.ip_addr)?;
        w.write_all(&[self.peers_seen, 0x00, 0x00, 0x00, 0x01, self.unknown_35])?;
        Ok(())
    }

    fn parse(i: Span) -> IResult<Span, Packet> {
        let (i, hdr) = negotiation_header(PacketType::KeepAlive as u8)(i)?;
        let (i, device_num) = be_u8(i)?;
        let (i, device_type) = be_u8(i)?;
        let (i, mac_addr) = mac_addr(i)?;
        let (i, ip_addr) = ip_addr(i)?;
        let (i, peers_seen) = be_u8(i)?;
        let (i, _) = tag(&[0x00, 0x00, 0x00, 0x01])(i)?;
        let (i, unknown_35) = be_u8(i)?;
        Ok((
            i,
            Packet::KeepAlive(KeepAlivePacket {
                name: hdr.name,
                proto_ver: hdr.proto_ver,
                device_num,
                device_type,
                mac_addr,
                ip_addr,
                peers_seen,
                unknown_35,
            }),
        ))
    }
}

/// Status-flags bit meaning "this player is currently playing" within
/// `PlayerStatusPacket::status_flags`.
pub const STATUS_FLAG_PLAYING: u8 = 0x40;
/// Status-flags bit meaning playback direction is reverse.
pub const STATUS_FLAG_REVERSE: u8 = 0x02;

/// Player status, broadcast a few times a second by every CDJ-style player
/// and mixer. Carries enough of the packet to reconstruct a `StatusUpdate`
/// for the Position Engine; bytes this core has no use for are consumed
/// as opaque, unparsed spans so the parser still validates total length.
#[derive(Debug, PartialEq)]
pub struct PlayerStatusPacket {
    pub name: String,
    pub device_num: u8,
    pub track_device: u8,
    pub track_slot: u8,
    pub track_type: u8,
    pub rekordbox_id: u32,
    pub status_flags: u8,
    pub play_state: u8,
    pub pitch: u32,
    pub bpm_raw: u16,
    pub beat: u32,
    pub player_type: u8,
}

impl PlayerStatusPacket {
    fn parse(i: Span) -> IResult<Span, Packet> {
        let (i, _) = header(i)?;
        let (i, _) = context("packet type", tag(&[PacketType::AnnounceStatus as u8]))(i)?;
        let (i, name) = device_name(i)?;
        let (i, _) = tag(&[0x01])(i)?;
        let (i, _unknown_10) = be_u8(i)?;
        let (i, device_num) = be_u8(i)?;
        let (i, _pkt_len) = be_u16(i)?;
        let (i, _device_num2) = be_u8(i)?;
        let (i, _) = context("tag1", tag(&[0x00]))(i)?;
        let (i, _unknown_16) = be_u8(i)?;

        let (i, _active) = be_u8(i)?;
        let (i, track_device) = be_u8(i)?;
        let (i, track_slot) = be_u8(i)?;
        let (i, track_type) = be_u8(i)?;

        let (i, _) = context("tag2", tag(&[0x00]))(i)?;
        let (i, rekordbox_id) = be_u32(i)?;
        let (i, _) = take(68usize)(i)?; // track_num, d_l, unknowns, d_n, unknown_48, activity bytes.

        let (i, _) = tag(&[0x00; 2])(i)?;
        let (i, _unknown_78) = be_u8(i)?;
        let (i, _) = tag(&[0x00; 2])(i)?;
        let (i, _play_mode) = be_u8(i)?;
        let (i, _firmware) = take(4usize)(i)?;

        let (i, _) = tag(&[0x00; 4])(i)?;
        let (i, _sync_n) = be_u32(i)?;
        let (i, _) = tag(&[0x00])(i)?;
        let (i, status_flags) = be_u8(i)?;
        let (i, _unknown_8b) = be_u8(i)?;
        let (i, play_state) = be_u8(i)?;
        let (i, pitch) = be_u32(i)?;

        let (i, _m_v) = be_u16(i)?;
        let (i, bpm_raw) = be_u16(i)?;
        let (i, _unknown_94) = be_u32(i)?;
        let (i, _pitch_2) = be_u32(i)?;
        let (i, _) = tag(&[0x00])(i)?;
        let (i, _p_3) = be_u8(i)?;
        let (i, _m_m) = be_u8(i)?;
        let (i, _m_h) = be_u8(i)?;

        let (i, beat) = be_u32(i)?;
        let (i, _cue) = be_u16(i)?;
        let (i, _bar_beat) = be_u8(i)?;
        let (i, _) = tag(&[0x00; 9])(i)?;

        let (i, _) = tag(&[0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01])(i)?;
        let (i, _media_presence) = be_u8(i)?;
        let (i, _u_e) = be_u8(i)?;
        let (i, _s_e) = be_u8(i)?;
        let (i, _emergency_loop_active) = be_u8(i)?;
        let (i, _) = tag(&[0x00; 5])(i)?;

        let (i, _pitch_3) = be_u32(i)?;
        let (i, _pitch_4) = be_u32(i)?;
        let (i, _seq_num) = be_u32(i)?;
        let (i, player_type) = be_u8(i)?;
        let (i, _unknown_cd) = take(3usize)(i)?;

        // Extended data block present for nexus-class hardware (player_type
        // 0x1f), absent for pre-nexus hardware (0x05). Its contents are
        // waveform colors/key/buffer telemetry this core does not consume.
        let (i, _) = if player_type == 0x1f {
            take(0x334usize)(i)?
        } else {
            (i, Span::new(&[]))
        };

        Ok((
            i,
            Packet::PlayerStatus(PlayerStatusPacket {
                name: name.to_string(),
                device_num,
                track_device,
                track_slot,
                track_type,
                rekordbox_id,
                status_flags,
                play_state,
                pitch,
                bpm_raw,
                beat,
                player_type,
            }),
        ))
    }

    pub fn playing(&self) -> bool {
        self.status_flags & STATUS_FLAG_PLAYING != 0
    }

    pub fn reverse(&self) -> bool {
        self.status_flags & STATUS_FLAG_REVERSE != 0
    }

    pub fn pitch_multiplier(&self) -> f64 {
        self.pitch as f64 / PITCH_CENTER as f64
    }

    pub fn bpm(&self) -> f32 {
        self.bpm_raw as f32 / 100.0
    }

    pub fn beat_number(&self) -> Option<u32> {
        if self.beat == BEAT_UNKNOWN {
            None
        } else {
            Some(self.beat)
        }
    }
}

#[derive(Debug, PartialEq)]
pub struct BeatPacket {
    pub name: String,
    pub device_num: u8,
    pub pitch: f32,
    pub bpm: f32,
    pub beat: u8,
}

impl BeatPacket {
    fn parse(i: Span) -> IResult<Span, Packet> {
        let (i, _) = header(i)?;
        let (i, _) = tag(&[PacketType::Beat as u8])(i)?;
        let (i, name) = device_name(i)?;
        let (i, _) = tag(&[0x01, 0x00])(i)?;
        let (i, device_num) = be_u8(i)?;
        let (i, _) = be_u16(i)?; // length, should be 0x003c.
        let (i, _next_beat) = be_u32(i)?;
        let (i, _second_beat) = be_u32(i)?;
        let (i, _next_bar) = be_u32(i)?;
        let (i, _fourth_beat) = be_u32(i)?;
        let (i, _second_bar) = be_u32(i)?;
        let (i, _eighth_beat) = be_u32(i)?;
        let (i, _) = take(24usize)(i)?; // padding, should be 0xff.
        let (i, pitch_raw) = be_u32(i)?;
        let pitch = (pitch_raw as f32 - PITCH_CENTER as f32) / PITCH_CENTER as f32 * 100.0;
        let (i, _) = take(2usize)(i)?; // padding, should be 0x00.
        let (i, bpm_raw) = be_u16(i)?;
        let bpm = bpm_raw as f32 / 100.0;
        let (i, beat) = be_u8(i)?;
        let (i, _) = take(2usize)(i)?; // padding, should be 0x00.
        let (i, _) = be_u8(i)?; // repeated device id.

        Ok((
            i,
            Packet::Beat(BeatPacket {
                name,
                device_num,
                pitch,
                bpm,
                beat,
            }),
        ))
    }

    /// Pitch expressed as a multiplier around 1.0x rather than a +/-100%
    /// signed percentage, matching `PlayerStatusPacket::pitch_multiplier`.
    pub fn pitch_multiplier(&self) -> f64 {
        1.0 + self.pitch as f64 / 100.0
    }
}

/// CDJ-3000-only sub-beat timing packet, broadcast on the same port as
/// `BeatPacket` alongside it. Gives an absolute playback position in
/// milliseconds rather than a beat number; carries no play/reverse flags.
#[derive(Debug, PartialEq)]
pub struct PrecisePositionPacket {
    pub name: String,
    pub device_num: u8,
    pub position_ms: u32,
    pub pitch: u32,
}

impl PrecisePositionPacket {
    fn parse(i: Span) -> IResult<Span, Packet> {
        let (i, _) = header(i)?;
        let (i, _) = tag(&[PacketType::PrecisePosition as u8])(i)?;
        let (i, name) = device_name(i)?;
        let (i, _) = tag(&[0x01, 0x00])(i)?;
        let (i, device_num) = be_u8(i)?;
        let (i, _) = be_u16(i)?; // length.
        let (i, position_ms) = be_u32(i)?;
        let (i, pitch) = be_u32(i)?;
        let (i, _) = take(4usize)(i)?; // reserved.

        Ok((
            i,
            Packet::PrecisePosition(PrecisePositionPacket {
                name,
                device_num,
                position_ms,
                pitch,
            }),
        ))
    }

    pub fn pitch_multiplier(&self) -> f64 {
        self.pitch as f64 / PITCH_CENTER as f64
    }
}

#[derive(Debug, PartialEq)]
pub enum Packet {
    Announce(AnnouncePacket),
    DeviceNumClaim1(DeviceNumClaim1Packet),
    DeviceNumClaim2(DeviceNumClaim2Packet),
    DeviceNumClaim3(DeviceNumClaim3Packet),
    KeepAlive(KeepAlivePacket),
    PlayerStatus(PlayerStatusPacket),
    Beat(BeatPacket),
    PrecisePosition(PrecisePositionPacket),
}

impl Packet {
    fn parse_impl(data: Span) -> IResult<Span, Packet> {
        let (i, _) = header(data)?;
        let (i, packet_type) = be_u8(i)?;

        match FromPrimitive::from_u8(packet_type) {
            Some(PacketType::DeviceNumClaim1) => DeviceNumClaim1Packet::parse(data),
            Some(PacketType::DeviceNumClaim2) => DeviceNumClaim2Packet::parse(data),
            Some(PacketType::DeviceNumClaim3) => DeviceNumClaim3Packet::parse(data),
            Some(PacketType::KeepAlive) => KeepAlivePacket::parse(data),
            Some(PacketType::AnnounceStatus) => {
                // Announce and status packets share a packet type; the byte
                // following the name-and-version preamble is zero only for
                // the (much shorter) announce framing.
                if data.len() > 0xb && data[0xb] == 0x0 {
                    AnnouncePacket::parse(data)
                } else {
                    PlayerStatusPacket::parse(data)
                }
            }
            Some(PacketType::Beat) => BeatPacket::parse(data),
            Some(PacketType::PrecisePosition) => PrecisePositionPacket::parse(data),
            _ => Err(nom::Err::Error(nom::error::Error::new(
                i,
                nom::error::ErrorKind::Tag,
            ))),
        }
    }

    pub fn parse(data: &[u8]) -> Result<Packet> {
        let (i, pkt) = match Self::parse_impl(Span::new(data)) {
            Ok((i, pkt)) => (i, pkt),
            Err(e) => {
                let timestamp = std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)?
                    .as_millis();
                let err = match e {
                    nom::Err::Error(e) | nom::Err::Failure(e) => ProlinkError::ParseError {
                        error_kind: format!("{:?}", e.code),
                        pos: e.input.location_offset(),
                        timestamp,
                        dump: pretty_hex(&data),
                    },
                    nom::Err::Incomplete(_) => ProlinkError::ParseError {
                        error_kind: "Incomplete".to_string(),
                        pos: data.len(),
                        timestamp,
                        dump: pretty_hex(&data),
                    },
                };
                #[cfg(feature = "log_bad_packets")]
                log::warn!(target: "prolink", "{}", err);
                return Err(err);
            }
        };
        if !i.is_empty() {
            return Err(anyhow::anyhow!("packet has {} extra trailing bytes", i.len()).into());
        }
        Ok(pkt)
    }

    /// Device number for packets that carry it at the common offset
    /// (status/beat/precise/keep-alive). Negotiation packets either don't
    /// carry one yet or carry it at a different offset within their own
    /// fixed layout and are not returned here.
    pub fn device_num(&self) -> Option<PlayerId> {
        match self {
            Packet::PlayerStatus(p) => Some(p.device_num),
            Packet::Beat(p) => Some(p.device_num),
            Packet::PrecisePosition(p) => Some(p.device_num),
            Packet::KeepAlive(p) => Some(p.device_num),
            Packet::DeviceNumClaim2(p) => Some(p.device_num),
            Packet::DeviceNumClaim3(p) => Some(p.device_num),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_announce() {
        let test_cases = [
            (
                &[
                    0x51, 0x73, 0x70, 0x74, 0x31, 0x57, 0x6d, 0x4a, 0x4f, 0x4c, 0x0a, 0x00, 0x43,
                    0x44, 0x4a, 0x2d, 0x39, 0x30, 0x30, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
                    0x00, 0x00, 0x00, 0x00, 0x01, 0x02, 0x00, 0x25, 0x01,
                ][..],
                AnnouncePacket {
                    name: "CDJ-900".to_string(),
                    proto_ver: 2,
                },
            ),
            (
                &[
                    0x51, 0x73, 0x70, 0x74, 0x31, 0x57, 0x6d, 0x4a, 0x4f, 0x4c, 0x0a, 0x00, 0x43,
                    0x44, 0x4a, 0x2d, 0x33, 0x30, 0x30, 0x30, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
                    0x00, 0x00, 0x00, 0x00, 0x01, 0x03, 0x00, 0x26, 0x01, 0x00,
                ],
                AnnouncePacket {
                    name: "CDJ-3000".to_string(),
                    proto_ver: 3,
                },
            ),
        ];

        for (data, pkt) in test_cases {
            let mut c = std::io::Cursor::new(Vec::new());
            pkt.write(&mut c).unwrap();
            let v = c.into_inner();
            assert_eq!(v.as_slice(), data);

            let (_, parsed) = AnnouncePacket::parse(Span::new(data)).unwrap();
            assert_eq!(parsed, Packet::Announce(pkt));
        }
    }

    #[test]
    fn test_claim3() {
        let data: &[u8] = &[
            0x51, 0x73, 0x70, 0x74, 0x31, 0x57, 0x6d, 0x4a, 0x4f, 0x4c, 0x04, 0x00, 0x43, 0x44,
            0x4a, 0x2d, 0x39, 0x30, 0x30, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x00, 0x00, 0x01, 0x02, 0x00, 0x26, 0x03, 0x02,
        ];
        let pkt = DeviceNumClaim3Packet {
            name: "CDJ-900".to_string(),
            proto_ver: 2,
            device_num: 3,
            pkt_num: 2,
        };
        let mut c = std::io::Cursor::new(Vec::new());
        pkt.write(&mut c).unwrap();
        assert_eq!(c.into_inner().as_slice(), data);

        let (_, parsed) = DeviceNumClaim3Packet::parse(Span::new(data)).unwrap();
        assert_eq!(parsed, Packet::DeviceNumClaim3(pkt));
    }

    #[test]
    fn test_keep_alive() {
        let data: &[u8] = &[
            0x51, 0x73, 0x70, 0x74, 0x31, 0x57, 0x6d, 0x4a, 0x4f, 0x4c, 0x06, 0x00, 0x43, 0x44,
            0x4a, 0x2d, 0x33, 0x30, 0x30, 0x30, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x00, 0x00, 0x01, 0x03, 0x00, 0x36, 0x02, 0x01, 0xc8, 0x3d, 0xfc, 0x0b, 0xf5, 0x1f,
            0xc0, 0xa8, 0x01, 0xf3, 0x01, 0x00, 0x00, 0x00, 0x01, 0x24,
        ];
        let pkt = KeepAlivePacket {
            name: "CDJ-3000".to_string(),
            proto_ver: 3,
            device_num: 2,
            device_type: 1,
            mac_addr: [0xc8, 0x3d, 0xfc, 0x0b, 0xf5, 0x1f],
            ip_addr: [192, 168, 1, 243],
            peers_seen: 1,
            unknown_35: 0x24,
        };
        let mut c = std::io::Cursor::new(Vec::new());
        pkt.write(&mut c).unwrap();
        assert_eq!(c.into_inner().as_slice(), data);

        let (_, parsed) = KeepAlivePacket::parse(Span::new(data)).unwrap();
        assert_eq!(parsed, Packet::KeepAlive(pkt));
    }

    fn build_status(player_type: u8, beat: u32, bpm_raw: u16, pitch: u32, flags: u8) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(HEADER);
        buf.push(0x0a);
        buf.extend_from_slice(b"CDJ-3000\0\0\0\0\0\0\0\0\0\0\0\0");
        buf.push(0x01);
        buf.push(0x06); // unknown_10
        buf.push(0x02); // device_num
        buf.extend_from_slice(&0u16.to_be_bytes()); // pkt_len (unused by parser)
        buf.push(0x02); // device_num2
        buf.push(0x00);
        buf.push(0x00); // unknown_16
        buf.push(0x00); // active
        buf.push(0x02); // track_device
        buf.push(0x03); // track_slot
        buf.push(0x01); // track_type
        buf.push(0x00);
        buf.extend_from_slice(&0x73u32.to_be_bytes()); // rekordbox_id
        buf.extend_from_slice(&[0u8; 68]);
        buf.extend_from_slice(&[0u8; 2]);
        buf.push(0x00); // unknown_78
        buf.extend_from_slice(&[0u8; 2]);
        buf.push(0x05); // play_mode
        buf.extend_from_slice(b"1.20");
        buf.extend_from_slice(&[0u8; 4]);
        buf.extend_from_slice(&1u32.to_be_bytes()); // sync_n
        buf.push(0x00);
        buf.push(flags); // status_flags
        buf.push(0xff); // unknown_8b
        buf.push(0xfe); // play_state
        buf.extend_from_slice(&pitch.to_be_bytes());
        buf.extend_from_slice(&0x8000u16.to_be_bytes());
        buf.extend_from_slice(&bpm_raw.to_be_bytes());
        buf.extend_from_slice(&0u32.to_be_bytes());
        buf.extend_from_slice(&0u32.to_be_bytes());
        buf.push(0x00);
        buf.push(0x01);
        buf.push(0x01);
        buf.push(0xff);
        buf.extend_from_slice(&beat.to_be_bytes());
        buf.extend_from_slice(&0u16.to_be_bytes());
        buf.push(0x03);
        buf.extend_from_slice(&[0u8; 9]);
        buf.extend_from_slice(&[0, 0, 0, 0, 0, 0, 1]);
        buf.extend_from_slice(&[0u8; 4]);
        buf.extend_from_slice(&[0u8; 8]);
        buf.extend_from_slice(&0u32.to_be_bytes());
        buf.extend_from_slice(&0u32.to_be_bytes());
        buf.extend_from_slice(&0u32.to_be_bytes());
        buf.push(player_type);
        buf.extend_from_slice(&[0u8; 3]);
        if player_type == 0x1f {
            buf.extend_from_slice(&[0u8; 0x334]);
        }
        buf
    }

    #[test]
    fn test_player_status_nexus() {
        let data = build_status(0x1f, 0x3f, 0x3070, PITCH_CENTER, STATUS_FLAG_PLAYING);
        let (_, parsed) = PlayerStatusPacket::parse(Span::new(&data)).unwrap();
        match parsed {
            Packet::PlayerStatus(p) => {
                assert_eq!(p.device_num, 2);
                assert_eq!(p.rekordbox_id, 0x73);
                assert_eq!(p.beat_number(), Some(0x3f));
                assert!(p.playing());
                assert!(!p.reverse());
                assert_eq!(p.pitch_multiplier(), 1.0);
                assert_eq!(p.bpm(), 123.12);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn test_player_status_pre_nexus_unknown_beat() {
        let data = build_status(0x05, BEAT_UNKNOWN, 0x3070, PITCH_CENTER, 0);
        let (_, parsed) = PlayerStatusPacket::parse(Span::new(&data)).unwrap();
        match parsed {
            Packet::PlayerStatus(p) => {
                assert_eq!(p.beat_number(), None);
                assert!(!p.playing());
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn test_short_packet_is_parse_error() {
        let data = [0x51, 0x73, 0x70];
        match Packet::parse(&data) {
            Err(ProlinkError::ParseError { .. }) => (),
            other => panic!("expected parse error, got {:?}", other),
        }
    }
}
