//! Event Fanout: turns every fresh `PositionSnapshot` into at most one
//! `EngineEvent::Moved` per subscriber, only when the movement is
//! significant enough to be worth waking a consumer for. "Significant"
//! means: play state flipped, pitch moved more than a hair, or the actual
//! position diverged from what pure dead reckoning would have predicted by
//! more than the subscriber's slack (i.e. something jumped: a seek, a
//! loop, a new track).
//!
//! Subscribers are isolated from each other: a channel send is always
//! non-blocking (`try_send`), so one slow consumer backs up only its own
//! queue. A subscriber whose channel has been dropped is pruned lazily the
//! next time fanout touches it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use log::warn;
use tokio::sync::mpsc;

use crate::model::{PlayerId, PositionSnapshot, PositionSource, Signature, SubscriptionKind, DEFAULT_SLACK};
use crate::EngineEvent;

/// Pitch divergence under normal operation (same-class sources).
const PITCH_EPSILON: f64 = 1e-6;
/// Pitch divergence when comparing a `PRECISE`-sourced snapshot against a
/// `BEAT`-sourced one; beat packets carry coarser pitch encoding.
const PITCH_EPSILON_CROSS_SOURCE: f64 = 1e-3;

pub type SubscriptionId = u64;

struct Subscription {
    kind: SubscriptionKind,
    player: Option<PlayerId>,
    slack: Duration,
    tx: mpsc::Sender<EngineEvent>,
    last_delivered: DashMap<PlayerId, PositionSnapshot>,
}

#[derive(Default)]
pub struct Fanout {
    subscriptions: DashMap<SubscriptionId, Subscription>,
    next_id: AtomicU64,
}

impl Fanout {
    pub fn new() -> Fanout {
        Fanout::default()
    }

    /// Registers a subscriber. `player` narrows delivery to one player;
    /// `None` means "every player". Returns an id usable with `unsubscribe`.
    pub fn subscribe(
        &self,
        kind: SubscriptionKind,
        player: Option<PlayerId>,
        slack: Duration,
        tx: mpsc::Sender<EngineEvent>,
    ) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.subscriptions.insert(
            id,
            Subscription {
                kind,
                player,
                slack,
                tx,
                last_delivered: DashMap::new(),
            },
        );
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.subscriptions.remove(&id);
    }

    /// Called once per fresh (or cleared) snapshot from the Position
    /// Engine. `None` delivers one terminal "no information" event to
    /// every subscriber that had previously seen something for this
    /// player; subscribers that never saw anything for it stay quiet.
    /// Otherwise delivers `EngineEvent::Moved` to every subscriber this
    /// snapshot is significant for, plus unconditionally to
    /// `MovementAndBeats` subscribers whenever the snapshot is
    /// beat-sourced.
    pub fn on_snapshot(&self, player: PlayerId, snapshot: Option<PositionSnapshot>) {
        let mut dead = Vec::new();
        for entry in self.subscriptions.iter() {
            let id = *entry.key();
            let sub = entry.value();
            if !matches!(sub.kind, SubscriptionKind::Movement | SubscriptionKind::MovementAndBeats) {
                continue;
            }
            if let Some(only) = sub.player {
                if only != player {
                    continue;
                }
            }

            let deliver = match &snapshot {
                None => sub.last_delivered.remove(&player).is_some(),
                Some(new) => {
                    let significant = match sub.last_delivered.get(&player) {
                        None => true,
                        Some(prev) => is_significant(&prev, new, sub.slack),
                    };
                    let always_on_beat =
                        sub.kind == SubscriptionKind::MovementAndBeats && new.source == PositionSource::Beat;
                    significant || always_on_beat
                }
            };
            if !deliver {
                continue;
            }

            match sub.tx.try_send(EngineEvent::Moved {
                player,
                snapshot: snapshot.clone(),
            }) {
                Ok(()) => {
                    if let Some(new) = &snapshot {
                        sub.last_delivered.insert(player, new.clone());
                    }
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(target: "prolink", "subscriber {} lagging, dropping movement event", id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    dead.push(id);
                }
            }
        }

        for id in dead {
            self.subscriptions.remove(&id);
        }
    }

    /// Called once per freshly computed (or cleared) signature from the
    /// identity worker. Delivered only to `Signature` subscribers.
    pub fn on_signature(&self, player: PlayerId, signature: Option<Signature>) {
        let mut dead = Vec::new();
        for entry in self.subscriptions.iter() {
            let id = *entry.key();
            let sub = entry.value();
            if sub.kind != SubscriptionKind::Signature {
                continue;
            }
            if let Some(only) = sub.player {
                if only != player {
                    continue;
                }
            }

            match sub.tx.try_send(EngineEvent::Signature { player, signature }) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(target: "prolink", "subscriber {} lagging, dropping signature event", id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    dead.push(id);
                }
            }
        }

        for id in dead {
            self.subscriptions.remove(&id);
        }
    }
}

fn pitch_epsilon(prev: &PositionSnapshot, new: &PositionSnapshot) -> f64 {
    match (prev.source, new.source) {
        (PositionSource::Precise, PositionSource::Beat) | (PositionSource::Beat, PositionSource::Precise) => {
            PITCH_EPSILON_CROSS_SOURCE
        }
        _ => PITCH_EPSILON,
    }
}

fn is_significant(prev: &PositionSnapshot, new: &PositionSnapshot, slack: Duration) -> bool {
    if prev.playing != new.playing || prev.reverse != new.reverse {
        return true;
    }
    if (prev.pitch - new.pitch).abs() > pitch_epsilon(prev, new) {
        return true;
    }
    // Any divergence counts while stopped; dead reckoning only applies
    // while playing.
    let slack = if new.playing { slack } else { Duration::from_millis(0) };
    match prev.interpolate(new.timestamp_ns) {
        None => true,
        Some(predicted) => {
            let drift_ms = (predicted as i64 - new.time_in_track_ms as i64).unsigned_abs();
            drift_ms > slack.as_millis() as u64
        }
    }
}

pub fn default_slack() -> Duration {
    DEFAULT_SLACK
}
