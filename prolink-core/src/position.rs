//! Position Engine: reconstructs, per player, what a beat-synced observer
//! standing at the booth would see on that player's jog wheel display.
//!
//! Each player owns one lock-free snapshot slot (`ArcSwap<Option<..>>`
//! behind a `DashMap`) so a writer publishing a fresh observation never
//! blocks a reader mid-interpolation and vice versa. A snapshot only comes
//! into existence once a beat grid for the player's current track is
//! known; status/beat/precise observations that arrive before the grid is
//! loaded are dropped rather than buffered, matching how CDJs themselves
//! treat position as meaningless before analysis completes.
//!
//! Every event carries its own receive timestamp rather than being stamped
//! at processing time, so a reordered or re-delivered packet with a
//! timestamp at or before the current snapshot's is dropped outright
//! (`apply` below). Publishing goes through `ArcSwap::rcu`, which retries
//! the caller-supplied computation against whatever the current value
//! turns out to be on contention, satisfying the "CAS with retry" update
//! discipline without an explicit loop here.

use std::cell::Cell;
use std::sync::Arc;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use log::trace;

use crate::clock::Clock;
use crate::model::{BeatGrid, CueList, PlayerId, PositionSnapshot, PositionSource};

/// Caller-supplied view of one status broadcast, already decoded from the
/// wire and stripped of fields the engine doesn't need.
pub struct StatusObservation {
    pub playing: bool,
    pub reverse: bool,
    pub pitch: f64,
    /// `None` means the packet's beat number was the wire "unknown"
    /// sentinel (pre-nexus hardware never fills it in).
    pub beat_number: Option<u32>,
    /// The current track's cue points, if known, consulted for the
    /// "load + jump to hot cue" heuristic when this status starts a new
    /// track's snapshot.
    pub cues: Option<CueList>,
}

/// Called with every freshly-published snapshot, including `None` when a
/// player's snapshot is cleared or forgotten.
type Listener = Box<dyn Fn(PlayerId, Option<&PositionSnapshot>) + Send + Sync>;

/// What a single proposed update resolves to once evaluated against the
/// current snapshot.
enum Applied {
    /// Replace (or clear, for `None`) the snapshot and notify the listener.
    Write(Option<PositionSnapshot>),
    /// Leave the snapshot untouched; no listener call.
    Drop,
}

pub struct Engine {
    slots: DashMap<PlayerId, ArcSwap<Option<PositionSnapshot>>>,
    clock: Arc<dyn Clock>,
    listener: Option<Listener>,
}

impl Engine {
    pub fn new(clock: Arc<dyn Clock>) -> Engine {
        Engine {
            slots: DashMap::new(),
            clock,
            listener: None,
        }
    }

    /// Registers a callback invoked with every freshly-published snapshot,
    /// used to wire the engine into the Event Fanout without this module
    /// depending on it directly.
    pub fn set_listener(&mut self, listener: Listener) {
        self.listener = Some(listener);
    }

    pub fn latest_snapshot(&self, player: PlayerId) -> Option<PositionSnapshot> {
        self.slots.get(&player).and_then(|slot| (**slot.load()).clone())
    }

    /// Dead-reckons the stored snapshot, if any, forward to now.
    pub fn interpolated_time(&self, player: PlayerId) -> Option<u32> {
        self.latest_snapshot(player)
            .and_then(|snap| snap.interpolate(self.clock.now_ns()))
    }

    /// Gates `compute` on the event timestamp ("drop if not newer than the
    /// current snapshot"), applies it via `ArcSwap::rcu` (retrying against
    /// whatever `current` turns out to be on contention), and notifies the
    /// listener exactly once with whatever actually got written.
    fn apply<F>(&self, player: PlayerId, timestamp_ns: u128, compute: F)
    where
        F: Fn(Option<&PositionSnapshot>) -> Applied,
    {
        let slot = self
            .slots
            .entry(player)
            .or_insert_with(|| ArcSwap::from_pointee(None));

        let outcome: Cell<Option<Option<PositionSnapshot>>> = Cell::new(None);
        slot.rcu(|current: &Arc<Option<PositionSnapshot>>| {
            if let Some(cur) = current.as_ref() {
                if timestamp_ns <= cur.timestamp_ns {
                    outcome.set(None);
                    return Arc::clone(current);
                }
            }
            match compute(current.as_ref().as_ref()) {
                Applied::Drop => {
                    outcome.set(None);
                    Arc::clone(current)
                }
                Applied::Write(next) => {
                    outcome.set(Some(next.clone()));
                    Arc::new(next)
                }
            }
        });
        drop(slot);

        if let Some(next) = outcome.into_inner() {
            if let Some(listener) = &self.listener {
                listener(player, next.as_ref());
            }
        }
    }

    /// Applies a status broadcast. Requires the player's current beat grid;
    /// callers look this up from the metadata store and simply skip the
    /// call when no grid is cached yet.
    ///
    /// Skipped entirely once a `PRECISE` snapshot exists for this player
    /// (we trust the richer source over a coarser one). Otherwise: a
    /// missing beat number clears the snapshot; a new track seeds a fresh
    /// one (preferring a nearby cue's time over the raw grid time); an
    /// already-tracked grid is dead-reckoned forward and only corrected if
    /// the reported beat has diverged from the prediction by 2 or more.
    pub fn on_status(&self, player: PlayerId, timestamp_ns: u128, grid: BeatGrid, obs: StatusObservation) {
        self.apply(player, timestamp_ns, |current| {
            if let Some(cur) = current {
                if cur.source == PositionSource::Precise {
                    return Applied::Drop;
                }
            }

            let beat = match obs.beat_number {
                None => return Applied::Write(None),
                Some(b) => b,
            };

            let new_track = match current {
                None => true,
                Some(cur) => cur.grid != grid,
            };

            if new_track {
                let time_in_track_ms = obs
                    .cues
                    .as_ref()
                    .and_then(|cues| cues.cue_near_beat(&grid, beat))
                    .map(|cue| cue.time_in_track_ms)
                    .unwrap_or_else(|| grid.time_of_beat(beat));
                trace!(target: "prolink", "new-track status snapshot for player {}: beat {}", player, beat);
                return Applied::Write(Some(PositionSnapshot {
                    timestamp_ns,
                    time_in_track_ms,
                    beat_number: beat,
                    playing: obs.playing,
                    reverse: obs.reverse,
                    pitch: obs.pitch,
                    grid: grid.clone(),
                    source: PositionSource::Status,
                    definitive: false,
                }));
            }

            let cur = current.expect("new_track is false only when a current snapshot exists");
            let interpolated = cur.interpolate(timestamp_ns);
            let (time_in_track_ms, playing, reverse) = match interpolated {
                Some(predicted) if grid.beat_at(predicted).abs_diff(beat) < 2 => {
                    (predicted, obs.playing, obs.reverse)
                }
                Some(0) if obs.reverse => (0, false, false),
                _ if obs.reverse => (grid.time_of_beat(beat + 1), obs.playing, obs.reverse),
                _ => (grid.time_of_beat(beat), obs.playing, obs.reverse),
            };

            Applied::Write(Some(PositionSnapshot {
                timestamp_ns,
                time_in_track_ms,
                beat_number: beat,
                playing,
                reverse,
                pitch: obs.pitch,
                grid: grid.clone(),
                source: PositionSource::Status,
                definitive: false,
            }))
        });
    }

    /// Applies a beat packet: a definitive "beat N just occurred" event.
    /// Beat packets carry no play-state flags, so playing/reverse carry
    /// forward from the previous snapshot (always playing, never reverse:
    /// reverse playback does not emit beats); without a prior snapshot
    /// there's nothing to carry forward and the update is dropped.
    ///
    /// The new beat number is derived, not taken off the wire: if the time
    /// elapsed within the current beat (by dead reckoning from the prior
    /// snapshot) is at least a fifth of the beat's duration at `bpm`, this
    /// packet begins the next beat; otherwise it's a reordered packet for
    /// the same beat and the number stays put. Capped at the grid's beat
    /// count via `time_of_beat`'s own loop-overshoot extrapolation.
    pub fn on_beat(&self, player: PlayerId, timestamp_ns: u128, bpm: f64, pitch: f64) {
        self.apply(player, timestamp_ns, |current| {
            let prev = match current {
                Some(p) => p,
                None => return Applied::Drop,
            };

            let beat_duration_ms = 60_000.0 / bpm;
            let elapsed_in_beat_ms = match prev.interpolate(timestamp_ns) {
                Some(predicted) => {
                    let beat_start = prev.grid.time_of_beat(prev.beat_number);
                    (predicted as i64 - beat_start as i64).max(0) as f64
                }
                None => 0.0,
            };

            let beat_number = if elapsed_in_beat_ms >= beat_duration_ms / 5.0 {
                (prev.beat_number + 1).min(prev.grid.count())
            } else {
                prev.beat_number
            };

            Applied::Write(Some(PositionSnapshot {
                timestamp_ns,
                time_in_track_ms: prev.grid.time_of_beat(beat_number),
                beat_number,
                playing: true,
                reverse: false,
                pitch,
                grid: prev.grid.clone(),
                source: PositionSource::Beat,
                definitive: true,
            }))
        });
    }

    /// Applies a CDJ-3000 precise-position packet: an absolute
    /// position-in-track in milliseconds, also lacking play-state flags
    /// (pulled forward from the previous snapshot instead).
    pub fn on_precise_position(&self, player: PlayerId, timestamp_ns: u128, position_ms: u32, pitch: f64) {
        self.apply(player, timestamp_ns, |current| {
            let prev = match current {
                Some(p) => p,
                None => return Applied::Drop,
            };
            let beat_number = prev.grid.beat_at(position_ms);
            Applied::Write(Some(PositionSnapshot {
                timestamp_ns,
                time_in_track_ms: position_ms,
                beat_number,
                playing: prev.playing,
                reverse: prev.reverse,
                pitch,
                grid: prev.grid.clone(),
                source: PositionSource::Precise,
                definitive: true,
            }))
        });
    }

    pub fn forget(&self, player: PlayerId) {
        self.slots.remove(&player);
        if let Some(listener) = &self.listener {
            listener(player, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use crate::model::{CueEntry, GridBeat};
    use std::sync::Mutex;

    fn grid() -> BeatGrid {
        BeatGrid::new(vec![
            GridBeat {
                beat_within_bar: 1,
                time_within_track_ms: 0,
                tempo_bpm: 120.0,
            },
            GridBeat {
                beat_within_bar: 2,
                time_within_track_ms: 500,
                tempo_bpm: 120.0,
            },
            GridBeat {
                beat_within_bar: 3,
                time_within_track_ms: 1000,
                tempo_bpm: 120.0,
            },
        ])
        .unwrap()
    }

    fn status(playing: bool, reverse: bool, pitch: f64, beat_number: Option<u32>) -> StatusObservation {
        StatusObservation {
            playing,
            reverse,
            pitch,
            beat_number,
            cues: None,
        }
    }

    #[test]
    fn status_without_grid_is_never_published_until_one_arrives() {
        let clock = Arc::new(FakeClock::new(0));
        let engine = Engine::new(clock.clone());
        assert!(engine.latest_snapshot(2).is_none());
        engine.on_status(2, clock.now_ns(), grid(), status(true, false, 1.0, Some(2)));
        let snap = engine.latest_snapshot(2).unwrap();
        assert_eq!(snap.time_in_track_ms, 500);
    }

    #[test]
    fn beat_packet_without_prior_status_is_dropped() {
        let clock = Arc::new(FakeClock::new(0));
        let engine = Engine::new(clock.clone());
        engine.on_beat(2, clock.now_ns(), 120.0, 1.0);
        assert!(engine.latest_snapshot(2).is_none());
    }

    #[test]
    fn beat_packet_carries_forward_play_state_and_advances_past_threshold() {
        let clock = Arc::new(FakeClock::new(0));
        let engine = Engine::new(clock.clone());
        engine.on_status(2, clock.now_ns(), grid(), status(true, false, 1.0, Some(1)));
        // Beat duration at 120bpm is 500ms; the 1/5 threshold is 100ms.
        clock.advance_ms(300);
        engine.on_beat(2, clock.now_ns(), 120.0, 1.0);
        let snap = engine.latest_snapshot(2).unwrap();
        assert!(snap.playing);
        assert_eq!(snap.beat_number, 2);
        assert_eq!(snap.time_in_track_ms, 500);
        assert_eq!(snap.source, PositionSource::Beat);
    }

    #[test]
    fn beat_packet_early_in_the_window_is_treated_as_reordered() {
        let clock = Arc::new(FakeClock::new(0));
        let engine = Engine::new(clock.clone());
        engine.on_status(2, clock.now_ns(), grid(), status(true, false, 1.0, Some(1)));
        clock.advance_ms(50); // under the 100ms threshold
        engine.on_beat(2, clock.now_ns(), 120.0, 1.0);
        let snap = engine.latest_snapshot(2).unwrap();
        assert_eq!(snap.beat_number, 1);
    }

    #[test]
    fn interpolated_time_advances_with_clock() {
        let clock = Arc::new(FakeClock::new(0));
        let engine = Engine::new(clock.clone());
        engine.on_status(2, clock.now_ns(), grid(), status(true, false, 1.0, Some(1)));
        clock.advance_ms(250);
        assert_eq!(engine.interpolated_time(2), Some(750));
    }

    #[test]
    fn status_unknown_beat_clears_the_snapshot() {
        let clock = Arc::new(FakeClock::new(0));
        let engine = Engine::new(clock.clone());
        engine.on_status(2, clock.now_ns(), grid(), status(false, false, 0.0, None));
        assert!(engine.latest_snapshot(2).is_none());
        assert_eq!(engine.interpolated_time(2), None);
    }

    #[test]
    fn reapplying_the_same_timestamp_is_a_noop() {
        let clock = Arc::new(FakeClock::new(0));
        let engine = Engine::new(clock.clone());
        let ts = clock.now_ns();
        engine.on_status(2, ts, grid(), status(true, false, 1.0, Some(1)));
        let first = engine.latest_snapshot(2).unwrap();
        engine.on_status(2, ts, grid(), status(true, false, 1.0, Some(2)));
        let second = engine.latest_snapshot(2).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn precise_snapshot_outranks_a_later_status_update() {
        let clock = Arc::new(FakeClock::new(0));
        let engine = Engine::new(clock.clone());
        engine.on_status(2, clock.now_ns(), grid(), status(true, false, 1.0, Some(1)));
        clock.advance_ms(10);
        engine.on_precise_position(2, clock.now_ns(), 42, 1.0);
        clock.advance_ms(10);
        engine.on_status(2, clock.now_ns(), grid(), status(true, false, 1.0, Some(3)));
        let snap = engine.latest_snapshot(2).unwrap();
        assert_eq!(snap.source, PositionSource::Precise);
        assert_eq!(snap.time_in_track_ms, 42);
    }

    #[test]
    fn hot_cue_within_one_beat_seeds_the_initial_position() {
        let clock = Arc::new(FakeClock::new(0));
        let engine = Engine::new(clock.clone());
        let cues = CueList {
            entries: vec![CueEntry {
                time_in_track_ms: 1000,
                hot_cue_slot: Some(0),
            }],
        };
        let mut obs = status(true, false, 1.0, Some(4));
        obs.cues = Some(cues);
        engine.on_status(2, clock.now_ns(), grid(), obs);
        let snap = engine.latest_snapshot(2).unwrap();
        // grid.time_of_beat(4) would extrapolate to 1500; the cue at beat 3
        // (within +/-1 of the reported beat 4) wins instead.
        assert_eq!(snap.time_in_track_ms, 1000);
    }

    #[test]
    fn reverse_playback_past_the_start_is_reported_as_stopped() {
        let clock = Arc::new(FakeClock::new(0));
        let engine = Engine::new(clock.clone());
        engine.on_status(2, clock.now_ns(), grid(), status(true, true, 1.0, Some(3)));
        clock.advance_ms(2000);
        engine.on_status(2, clock.now_ns(), grid(), status(true, true, 1.0, Some(3)));
        let snap = engine.latest_snapshot(2).unwrap();
        assert!(!snap.playing);
        assert_eq!(snap.time_in_track_ms, 0);
    }

    #[test]
    fn forget_notifies_the_listener_with_no_information() {
        let clock = Arc::new(FakeClock::new(0));
        let mut engine = Engine::new(clock.clone());
        let seen: Arc<Mutex<Vec<Option<PositionSnapshot>>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_for_listener = seen.clone();
        engine.set_listener(Box::new(move |_player, snapshot| {
            seen_for_listener.lock().unwrap().push(snapshot.cloned());
        }));
        engine.on_status(2, clock.now_ns(), grid(), status(true, false, 1.0, Some(1)));
        engine.forget(2);
        assert_eq!(seen.lock().unwrap().last().unwrap(), &None);
        assert!(engine.latest_snapshot(2).is_none());
    }
}
