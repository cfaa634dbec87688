//! Track Identity & Fingerprint: a content-derived signature for a loaded
//! track, used to recognize "the same track" across players/sessions
//! without relying on a rekordbox id (which is only stable within one
//! library export).
//!
//! Hashing runs on a bounded background worker so a burst of track loads
//! never stalls the metadata path that feeds it; a full queue drops the
//! request and logs rather than applying backpressure to callers. The
//! worker also keeps a per-player cache of the last signature it computed
//! and, if given a listener, notifies it of every change (including a
//! clear, when an input goes missing).

use std::sync::Arc;

use dashmap::DashMap;
use log::warn;
use sha1::{Digest, Sha1};
use tokio::sync::{mpsc, oneshot};

use crate::model::{BeatGrid, PlayerId, Signature};

const QUEUE_DEPTH: usize = 20;

/// Everything `signature_bytes` needs. Each field maps to one numbered
/// item in the fingerprint framing; any missing field means no signature
/// can be produced at all (tempo is deliberately not part of this input:
/// it is read from `grid` but never hashed).
#[derive(Clone, Debug, Default)]
pub struct SignatureInput {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub duration_secs: Option<u32>,
    pub waveform_rgb: Option<Vec<u8>>,
    pub grid: Option<BeatGrid>,
}

/// Bytes fingerprinted for a track: title, artist (or the literal
/// `[no artist]`), duration, raw RGB waveform-detail bytes, then every
/// beat's `(beat_within_bar, time_within_track_ms)` pair in order. Tempo
/// is never part of this framing, matching the stable signature format
/// compatibility requires. Returns `None` if any required input is
/// missing.
pub fn signature_bytes(input: &SignatureInput) -> Option<Vec<u8>> {
    let duration_secs = input.duration_secs?;
    let waveform_rgb = input.waveform_rgb.as_ref()?;
    let grid = input.grid.as_ref()?;

    let mut buf = Vec::new();
    buf.extend_from_slice(input.title.as_deref().unwrap_or("").as_bytes());
    buf.push(0);
    buf.extend_from_slice(input.artist.as_deref().unwrap_or("[no artist]").as_bytes());
    buf.push(0);
    buf.extend_from_slice(&duration_secs.to_be_bytes());
    buf.extend_from_slice(waveform_rgb);
    for beat in grid.beats() {
        buf.extend_from_slice(&(beat.beat_within_bar as u32).to_be_bytes());
        buf.extend_from_slice(&beat.time_within_track_ms.to_be_bytes());
    }
    Some(buf)
}

pub fn compute(input: &SignatureInput) -> Option<Signature> {
    let bytes = signature_bytes(input)?;
    let mut hasher = Sha1::new();
    hasher.update(bytes);
    let digest: [u8; 20] = hasher.finalize().into();
    Some(Signature::from_bytes(digest))
}

/// Notified with every signature the worker computes, including `None`
/// when a player's track no longer has enough information for one.
pub type SignatureListener = Box<dyn Fn(PlayerId, Option<Signature>) + Send + Sync>;

struct Request {
    player: PlayerId,
    input: SignatureInput,
    reply: oneshot::Sender<Option<Signature>>,
}

#[derive(Clone)]
pub struct IdentityWorker {
    tx: mpsc::Sender<Request>,
    cache: Arc<DashMap<PlayerId, Signature>>,
}

impl IdentityWorker {
    pub fn spawn() -> IdentityWorker {
        IdentityWorker::spawn_with_listener(None)
    }

    /// Spawns the worker with an optional change listener, used to wire it
    /// into the Event Fanout without this module depending on it directly.
    pub fn spawn_with_listener(listener: Option<SignatureListener>) -> IdentityWorker {
        let (tx, mut rx) = mpsc::channel::<Request>(QUEUE_DEPTH);
        let cache = Arc::new(DashMap::new());
        let cache_for_worker = cache.clone();
        tokio::spawn(async move {
            while let Some(req) = rx.recv().await {
                let sig = compute(&req.input);
                match sig {
                    Some(sig) => {
                        cache_for_worker.insert(req.player, sig);
                    }
                    None => {
                        cache_for_worker.remove(&req.player);
                    }
                }
                if let Some(listener) = &listener {
                    listener(req.player, sig);
                }
                let _ = req.reply.send(sig);
            }
        });
        IdentityWorker { tx, cache }
    }

    /// The last signature computed for `player`, without waiting on a
    /// fresh computation.
    pub fn cached(&self, player: PlayerId) -> Option<Signature> {
        self.cache.get(&player).map(|e| *e.value())
    }

    /// Requests a signature, dropping the request (and logging) if the
    /// worker's queue is already full rather than waiting for room.
    pub async fn request(&self, player: PlayerId, input: SignatureInput) -> Option<Signature> {
        let (reply_tx, reply_rx) = oneshot::channel();
        match self.tx.try_send(Request {
            player,
            input,
            reply: reply_tx,
        }) {
            Ok(()) => reply_rx.await.ok().flatten(),
            Err(_) => {
                warn!(target: "prolink", "identity worker queue full, dropping fingerprint request");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::GridBeat;

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
        ])
        .unwrap()
    }

    fn worked_example() -> SignatureInput {
        SignatureInput {
            title: Some("A".into()),
            artist: Some("B".into()),
            duration_secs: Some(123),
            waveform_rgb: Some(vec![1, 2, 3]),
            grid: Some(grid()),
        }
    }

    #[test]
    fn matches_worked_example_vector() {
        let bytes = signature_bytes(&worked_example()).unwrap();
        assert_eq!(
            bytes,
            vec![
                0x41, 0x00, 0x42, 0x00, 0x00, 0x00, 0x00, 0x7B, 0x01, 0x02, 0x03, 0x00, 0x00, 0x00,
                0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x01, 0xF4,
            ]
        );
        assert_eq!(compute(&worked_example()), compute(&worked_example()));
    }

    #[test]
    fn missing_artist_uses_the_literal_placeholder() {
        let mut input = worked_example();
        input.artist = None;
        let bytes = signature_bytes(&input).unwrap();
        assert_eq!(&bytes[2..13], b"[no artist]\0");
    }

    #[test]
    fn tempo_does_not_affect_the_signature() {
        let mut changed_tempo = worked_example();
        changed_tempo.grid = Some(
            BeatGrid::new(vec![
                GridBeat {
                    beat_within_bar: 1,
                    time_within_track_ms: 0,
                    tempo_bpm: 140.0,
                },
                GridBeat {
                    beat_within_bar: 2,
                    time_within_track_ms: 500,
                    tempo_bpm: 140.0,
                },
            ])
            .unwrap(),
        );
        assert_eq!(compute(&worked_example()), compute(&changed_tempo));
    }

    #[test]
    fn different_titles_hash_differently() {
        let mut other = worked_example();
        other.title = Some("C".into());
        assert_ne!(compute(&worked_example()), compute(&other));
    }

    #[test]
    fn missing_duration_yields_no_signature() {
        let mut input = worked_example();
        input.duration_secs = None;
        assert!(compute(&input).is_none());
    }

    #[test]
    fn missing_waveform_yields_no_signature() {
        let mut input = worked_example();
        input.waveform_rgb = None;
        assert!(compute(&input).is_none());
    }

    #[tokio::test]
    async fn worker_computes_and_caches_signature_async() {
        let worker = IdentityWorker::spawn();
        let sig = worker.request(2, worked_example()).await.unwrap();
        assert_eq!(sig, compute(&worked_example()).unwrap());
        assert_eq!(worker.cached(2), Some(sig));
    }

    #[tokio::test]
    async fn worker_clears_cache_and_notifies_on_missing_input() {
        use std::sync::Mutex;

        let seen: Arc<Mutex<Vec<(PlayerId, Option<Signature>)>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_for_listener = seen.clone();
        let worker = IdentityWorker::spawn_with_listener(Some(Box::new(move |player, sig| {
            seen_for_listener.lock().unwrap().push((player, sig));
        })));

        worker.request(2, worked_example()).await.unwrap();
        assert!(worker.cached(2).is_some());

        let mut incomplete = worked_example();
        incomplete.duration_secs = None;
        let result = worker.request(2, incomplete).await;
        assert!(result.is_none());
        assert!(worker.cached(2).is_none());

        let events = seen.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1], (2, None));
    }
}
