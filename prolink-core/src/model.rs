//! Core data types shared across every component: player/track identity,
//! beat grids, cue lists, waveform bytes, and the position snapshot the
//! Position Engine maintains per player.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Logical device index. Players occupy 1..6, the mixer is 33, and the
/// discovery gateway some networks advertise at 25 is filtered out by the
/// registry before it ever reaches a `PlayerId`.
pub type PlayerId = u8;

pub const MIXER_DEVICE_NUM: PlayerId = 33;
pub const GATEWAY_DEVICE_NUM: PlayerId = 25;

/// Coarse hardware classification derived once from a device's announced
/// name, used to decide whether it can report beat numbers or precise
/// position packets at all.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceClass {
    /// CDJ-900/900nxs or CDJ-2000/2000nxs: no beat numbers in status.
    PreNexusCdj,
    /// CDJ-3000: the only hardware that emits precise position packets.
    Nexus3000,
    /// "Opus"-class hardware: reports all media as a single USB slot.
    Opus,
    Mixer,
    /// Reserved discovery gateway device number; never surfaced to users.
    Gateway,
    Other,
}

impl DeviceClass {
    pub fn classify(device_num: PlayerId, name: &str) -> DeviceClass {
        if device_num == GATEWAY_DEVICE_NUM && name == "NXS-GW" {
            return DeviceClass::Gateway;
        }
        if device_num == MIXER_DEVICE_NUM {
            return DeviceClass::Mixer;
        }
        if name == "CDJ-3000" {
            return DeviceClass::Nexus3000;
        }
        if name.starts_with("CDJ") && (name.ends_with("900") || name.ends_with("2000")) {
            return DeviceClass::PreNexusCdj;
        }
        if name.to_ascii_uppercase().contains("OPUS") {
            return DeviceClass::Opus;
        }
        DeviceClass::Other
    }

    /// Pre-nexus CDJs do not provide beat numbers; the engine refuses to
    /// synthesize positions for them.
    pub fn provides_beat_numbers(&self) -> bool {
        !matches!(self, DeviceClass::PreNexusCdj)
    }

    pub fn emits_precise_position(&self) -> bool {
        matches!(self, DeviceClass::Nexus3000)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SlotKind {
    Sd,
    Usb,
    Cd,
    Collection,
}

impl SlotKind {
    pub fn from_wire(byte: u8) -> Option<SlotKind> {
        match byte {
            0x01 => Some(SlotKind::Cd),
            0x02 => Some(SlotKind::Sd),
            0x03 => Some(SlotKind::Usb),
            0x04 => Some(SlotKind::Collection),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SlotRef {
    pub player: PlayerId,
    pub slot: SlotKind,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrackType {
    Rekordbox,
    Unanalyzed,
    CdTrack,
    NoTrack,
}

impl TrackType {
    pub fn from_wire(byte: u8) -> TrackType {
        match byte {
            0x00 => TrackType::NoTrack,
            0x01 => TrackType::Rekordbox,
            0x02 => TrackType::Unanalyzed,
            0x05 => TrackType::CdTrack,
            _ => TrackType::Unanalyzed,
        }
    }
}

/// Uniquely names a loadable artifact: which player reported it, which slot
/// it lives on, and its rekordbox id within that slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TrackKey {
    pub player: PlayerId,
    pub slot: SlotKind,
    pub rekordbox_id: u32,
    pub track_type: TrackType,
}

/// One beat of a beat grid: its 1-indexed position within the bar and the
/// time, in milliseconds from the start of the track, that it falls at.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GridBeat {
    pub beat_within_bar: u8,
    pub time_within_track_ms: u32,
    pub tempo_bpm: f32,
}

/// Ordered, 1-indexed sequence of beats for a track. `beats[0]` is beat 1.
#[derive(Clone, Debug, PartialEq)]
pub struct BeatGrid {
    beats: Vec<GridBeat>,
}

impl BeatGrid {
    pub fn new(beats: Vec<GridBeat>) -> Option<BeatGrid> {
        if beats.is_empty() {
            return None;
        }
        Some(BeatGrid { beats })
    }

    pub fn count(&self) -> u32 {
        self.beats.len() as u32
    }

    pub fn beats(&self) -> &[GridBeat] {
        &self.beats
    }

    /// `time_of_beat(grid, n)`: for `n <= count` return the stored beat
    /// time; for `n > count` extrapolate using the last interval (loop
    /// overshoot). A single-beat grid always returns that beat's time.
    pub fn time_of_beat(&self, n: u32) -> u32 {
        let count = self.count();
        if n == 0 {
            return self.beats[0].time_within_track_ms;
        }
        if n <= count {
            return self.beats[(n - 1) as usize].time_within_track_ms;
        }
        if count < 2 {
            return self.beats[0].time_within_track_ms;
        }
        let last = self.beats[(count - 1) as usize].time_within_track_ms;
        let second_to_last = self.beats[(count - 2) as usize].time_within_track_ms;
        let interval = last as i64 - second_to_last as i64;
        let overshoot = (n - count) as i64;
        (last as i64 + interval * overshoot).max(0) as u32
    }

    /// Beat-within-bar at 1-indexed beat `n`, clamped to the grid's range.
    pub fn beat_within_bar(&self, n: u32) -> u8 {
        let count = self.count();
        let idx = if n == 0 {
            0
        } else if n <= count {
            n - 1
        } else {
            count - 1
        };
        self.beats[idx as usize].beat_within_bar
    }

    /// Finds the beat number whose stored time is nearest `time_ms`,
    /// biased towards the beat at or before that time. Used by the fanout
    /// significance check (`grid.beat_at(interpolated)`).
    pub fn beat_at(&self, time_ms: u32) -> u32 {
        match self
            .beats
            .binary_search_by_key(&time_ms, |b| b.time_within_track_ms)
        {
            Ok(idx) => (idx + 1) as u32,
            Err(0) => 1,
            Err(idx) => idx as u32,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CueEntry {
    pub time_in_track_ms: u32,
    pub hot_cue_slot: Option<u8>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CueList {
    pub entries: Vec<CueEntry>,
}

impl CueList {
    /// Finds a cue whose beat (per `grid`) is within +/-1 of `beat`, used by
    /// the "load + jump to hot cue" heuristic.
    pub fn cue_near_beat(&self, grid: &BeatGrid, beat: u32) -> Option<&CueEntry> {
        self.entries.iter().find(|cue| {
            let cue_beat = grid.beat_at(cue.time_in_track_ms);
            cue_beat.abs_diff(beat) <= 1
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WaveformStyle {
    Blue,
    Rgb,
    ThreeBand,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WaveformDetail {
    pub style: WaveformStyle,
    pub bytes: Vec<u8>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TrackMetadata {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub duration_secs: Option<u32>,
}

/// Where a `PositionSnapshot`'s time came from, in increasing order of
/// trust: a periodic status broadcast, a definitive beat packet, or a
/// CDJ-3000 sub-beat precise position packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PositionSource {
    Status,
    Beat,
    Precise,
}

/// What the engine currently believes about one player's playhead.
#[derive(Clone, Debug, PartialEq)]
pub struct PositionSnapshot {
    pub timestamp_ns: u128,
    pub time_in_track_ms: u32,
    pub beat_number: u32,
    pub playing: bool,
    pub reverse: bool,
    pub pitch: f64,
    pub grid: BeatGrid,
    pub source: PositionSource,
    pub definitive: bool,
}

impl PositionSnapshot {
    /// Dead-reckons this snapshot forward (or backward) to `now_ns`.
    ///
    /// A stopped snapshot with beat number 0 (the "unknown beat" sentinel)
    /// reports position as unknown rather than its stored time, even
    /// though a grid may be present.
    pub fn interpolate(&self, now_ns: u128) -> Option<u32> {
        if !self.playing {
            if self.beat_number == 0 {
                return None;
            }
            return Some(self.time_in_track_ms);
        }
        let elapsed_ms = now_ns.saturating_sub(self.timestamp_ns) / 1_000_000;
        let moved = (self.pitch * elapsed_ms as f64).round() as i64;
        if self.reverse {
            Some((self.time_in_track_ms as i64 - moved).max(0) as u32)
        } else {
            Some((self.time_in_track_ms as i64 + moved) as u32)
        }
    }
}

/// The most recent observation of any kind for a player, kept even when no
/// beat grid is known (so non-timing consumers can still see "last heard").
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LastEvent {
    pub timestamp_ns: u128,
}

/// 160-bit content fingerprint for a loaded track, lowercase-hex-encoded.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Signature([u8; 20]);

impl Signature {
    pub fn from_bytes(bytes: [u8; 20]) -> Signature {
        Signature(bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Display for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    Metadata,
    BeatGrid,
    CueList,
    WaveformPreview,
    WaveformDetail(WaveformStyle),
    AlbumArt { high_res: bool },
    TaggedAnalysisSection([u8; 4]),
}

#[derive(Clone, Debug)]
pub enum Artifact {
    Metadata(TrackMetadata),
    BeatGrid(BeatGrid),
    CueList(CueList),
    Waveform(WaveformDetail),
    AlbumArt(Vec<u8>),
    TaggedSection(Vec<u8>),
}

/// Subscription interest kinds for the Event Fanout.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SubscriptionKind {
    Movement,
    MovementAndBeats,
    Signature,
    Metadata,
    Waveform,
}

/// Default dead-reckoning tolerance before a subscriber is notified of a
/// jump; also the default timeout for dbserver menu operations.
pub const DEFAULT_SLACK: Duration = Duration::from_millis(50);
