//! Beat Grid & Metadata Store: a read-mostly cache keyed by `TrackKey`, kept
//! separate from the Artifact Loader so the Position Engine can consult a
//! beat grid without waiting on a dbserver round trip.

use dashmap::DashMap;

use crate::model::{BeatGrid, CueList, PlayerId, SlotKind, SlotRef, TrackKey, TrackMetadata};

#[derive(Default)]
pub struct Store {
    grids: DashMap<TrackKey, BeatGrid>,
    cues: DashMap<TrackKey, CueList>,
    metadata: DashMap<TrackKey, TrackMetadata>,
}

impl Store {
    pub fn new() -> Store {
        Store::default()
    }

    pub fn put_grid_if_absent(&self, key: TrackKey, grid: BeatGrid) {
        self.grids.entry(key).or_insert(grid);
    }

    pub fn grid(&self, key: &TrackKey) -> Option<BeatGrid> {
        self.grids.get(key).map(|g| g.value().clone())
    }

    pub fn put_cues_if_absent(&self, key: TrackKey, cues: CueList) {
        self.cues.entry(key).or_insert(cues);
    }

    pub fn cues(&self, key: &TrackKey) -> Option<CueList> {
        self.cues.get(key).map(|c| c.value().clone())
    }

    pub fn put_metadata_if_absent(&self, key: TrackKey, metadata: TrackMetadata) {
        self.metadata.entry(key).or_insert(metadata);
    }

    pub fn metadata(&self, key: &TrackKey) -> Option<TrackMetadata> {
        self.metadata.get(key).map(|m| m.value().clone())
    }

    /// Drops every cached artifact for one track, e.g. on ejection.
    pub fn invalidate(&self, key: &TrackKey) {
        self.grids.remove(key);
        self.cues.remove(key);
        self.metadata.remove(key);
    }

    /// Drops every cached artifact sourced from a given slot, e.g. a USB
    /// stick being pulled.
    pub fn invalidate_for_slot(&self, slot: SlotRef) {
        self.grids
            .retain(|k, _| !(k.player == slot.player && k.slot == slot.slot));
        self.cues
            .retain(|k, _| !(k.player == slot.player && k.slot == slot.slot));
        self.metadata
            .retain(|k, _| !(k.player == slot.player && k.slot == slot.slot));
    }

    /// Drops every cached artifact attributed to a player, e.g. on a clean
    /// peer-left event.
    pub fn invalidate_for_player(&self, player: PlayerId) {
        self.grids.retain(|k, _| k.player != player);
        self.cues.retain(|k, _| k.player != player);
        self.metadata.retain(|k, _| k.player != player);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{GridBeat, TrackType};

    fn key(player: PlayerId) -> TrackKey {
        TrackKey {
            player,
            slot: SlotKind::Usb,
            rekordbox_id: 42,
            track_type: TrackType::Rekordbox,
        }
    }

    fn grid() -> BeatGrid {
        BeatGrid::new(vec![GridBeat {
            beat_within_bar: 1,
            time_within_track_ms: 0,
            tempo_bpm: 120.0,
        }])
        .unwrap()
    }

    #[test]
    fn put_if_absent_keeps_first_write() {
        let store = Store::new();
        store.put_grid_if_absent(key(2), grid());
        let mut other = grid();
        other = BeatGrid::new(vec![GridBeat {
            beat_within_bar: 1,
            time_within_track_ms: 999,
            tempo_bpm: 140.0,
        }])
        .unwrap();
        store.put_grid_if_absent(key(2), other);
        assert_eq!(store.grid(&key(2)).unwrap().beats()[0].time_within_track_ms, 0);
    }

    #[test]
    fn invalidate_for_player_clears_only_that_players_tracks() {
        let store = Store::new();
        store.put_grid_if_absent(key(2), grid());
        store.put_grid_if_absent(key(3), grid());
        store.invalidate_for_player(2);
        assert!(store.grid(&key(2)).is_none());
        assert!(store.grid(&key(3)).is_some());
    }

    #[test]
    fn invalidate_for_slot_clears_matching_slot() {
        let store = Store::new();
        store.put_grid_if_absent(key(2), grid());
        store.invalidate_for_slot(SlotRef {
            player: 2,
            slot: SlotKind::Usb,
        });
        assert!(store.grid(&key(2)).is_none());
    }
}
