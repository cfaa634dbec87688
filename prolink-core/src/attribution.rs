//! Device Attribution Resolver: "Opus"-class hardware (`DeviceClass::Opus`)
//! reports every slot it has media in as a single USB slot, so a naive
//! `TrackKey` lookup can't tell which of up to three attached archives a
//! player is actually pointing at. The user attaches a `MediaArchive` to
//! each of the logical slots 1..3; the resolver disambiguates by fetching
//! each attached archive's own song-structure (`PSSI`) analysis section
//! for the reported track and matching it against the live PSSI bytes the
//! player announced over its side-channel broadcast: the right archive's
//! bytes appear as a contiguous sub-slice of the live bytes (or vice
//! versa, depending which side was re-analyzed more recently).
//!
//! The match is cached per player and held until that player's track
//! changes, since re-scanning every archive on every status broadcast
//! would be wasted work for data that cannot change mid-track.

use dashmap::DashMap;

use crate::archive::MediaArchive;
use crate::error::{ProlinkError, Result};
use crate::model::{Artifact, ArtifactKind, PlayerId, TrackKey};
use std::sync::Arc;

const PSSI: [u8; 4] = *b"PSSI";

#[derive(Default)]
pub struct AttributionResolver {
    slots: DashMap<u8, Arc<dyn MediaArchive>>,
    resolved: DashMap<PlayerId, TrackKey>,
}

impl AttributionResolver {
    pub fn new() -> AttributionResolver {
        AttributionResolver::default()
    }

    /// Registers `archive` as the handler for logical slot `slot`
    /// (1, 2, or 3), replacing whatever was there before.
    pub fn attach(&self, slot: u8, archive: Arc<dyn MediaArchive>) -> Result<()> {
        if !(1..=3).contains(&slot) {
            return Err(ProlinkError::InvalidInput(format!(
                "opus archive slot must be 1, 2, or 3, got {}",
                slot
            )));
        }
        self.slots.insert(slot, archive);
        Ok(())
    }

    /// Returns the cached resolution for `player`, if its track hasn't
    /// changed since the last successful match.
    pub fn cached(&self, player: PlayerId) -> Option<TrackKey> {
        self.resolved.get(&player).map(|r| *r)
    }

    /// Fetches each attached archive's PSSI section for `key`, in slot
    /// order (1, 2, 3), and returns (and caches) the first one whose bytes
    /// form a sub-slice relationship with `live_pssi`.
    pub async fn resolve(&self, player: PlayerId, key: TrackKey, live_pssi: &[u8]) -> Option<TrackKey> {
        let archives: Vec<Arc<dyn MediaArchive>> = {
            let mut slots: Vec<(u8, Arc<dyn MediaArchive>)> =
                self.slots.iter().map(|e| (*e.key(), e.value().clone())).collect();
            slots.sort_by_key(|(slot, _)| *slot);
            slots.into_iter().map(|(_, archive)| archive).collect()
        };

        for archive in archives {
            let fetched = archive.fetch(&key, &ArtifactKind::TaggedAnalysisSection(PSSI)).await;
            let pssi = match fetched {
                Ok(Some(Artifact::TaggedSection(bytes))) => bytes,
                _ => continue,
            };
            if contains_subslice(live_pssi, &pssi) || contains_subslice(&pssi, live_pssi) {
                self.resolved.insert(player, key);
                return Some(key);
            }
        }
        None
    }

    pub fn forget(&self, player: PlayerId) {
        self.resolved.remove(&player);
    }
}

fn contains_subslice(haystack: &[u8], needle: &[u8]) -> bool {
    if needle.is_empty() || needle.len() > haystack.len() {
        return false;
    }
    haystack.windows(needle.len()).any(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::test_support::FakeArchive;
    use crate::model::{SlotKind, TrackType};

    fn key(id: u32) -> TrackKey {
        TrackKey {
            player: 2,
            slot: SlotKind::Usb,
            rekordbox_id: id,
            track_type: TrackType::Rekordbox,
        }
    }

    fn pssi_artifact(bytes: &[u8]) -> Artifact {
        Artifact::TaggedSection(bytes.to_vec())
    }

    #[tokio::test]
    async fn attach_rejects_slots_outside_one_to_three() {
        let resolver = AttributionResolver::new();
        let archive = Arc::new(FakeArchive::default());
        assert!(resolver.attach(0, archive.clone()).is_err());
        assert!(resolver.attach(4, archive).is_err());
    }

    #[tokio::test]
    async fn resolves_against_first_matching_attached_slot() {
        let resolver = AttributionResolver::new();

        let slot1 = Arc::new(FakeArchive::default());
        slot1.artifacts.insert(
            (key(1), ArtifactKind::TaggedAnalysisSection(PSSI)),
            pssi_artifact(b"unrelated"),
        );
        let slot2 = Arc::new(FakeArchive::default());
        slot2.artifacts.insert(
            (key(1), ArtifactKind::TaggedAnalysisSection(PSSI)),
            pssi_artifact(b"PSSI\x00\x00\x00\x10rest-of-structure-and-more"),
        );

        resolver.attach(1, slot1).unwrap();
        resolver.attach(2, slot2).unwrap();

        let live = b"PSSI\x00\x00\x00\x10rest-of-structure".to_vec();
        let resolved = resolver.resolve(2, key(1), &live).await;
        assert_eq!(resolved, Some(key(1)));
        assert_eq!(resolver.cached(2), Some(key(1)));
    }

    #[tokio::test]
    async fn no_match_returns_none() {
        let resolver = AttributionResolver::new();
        let archive = Arc::new(FakeArchive::default());
        archive.artifacts.insert(
            (key(1), ArtifactKind::TaggedAnalysisSection(PSSI)),
            pssi_artifact(b"totally-different"),
        );
        resolver.attach(1, archive).unwrap();
        assert_eq!(resolver.resolve(2, key(1), b"also-different").await, None);
    }

    #[tokio::test]
    async fn forget_clears_cache() {
        let resolver = AttributionResolver::new();
        let archive = Arc::new(FakeArchive::default());
        archive
            .artifacts
            .insert((key(1), ArtifactKind::TaggedAnalysisSection(PSSI)), pssi_artifact(b"same"));
        resolver.attach(1, archive).unwrap();
        resolver.resolve(2, key(1), b"same").await;
        resolver.forget(2);
        assert_eq!(resolver.cached(2), None);
    }
}
