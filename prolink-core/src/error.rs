use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};

use crate::model::{ArtifactKind, PlayerId};

/// Error taxonomy for the Position & Identity Core. Most variants are
/// recoverable and reported straight back to the caller; a handful of
/// routine conditions elsewhere (a lagging subscriber, a late status
/// packet) are handled inline instead of being surfaced as errors at all.
#[derive(Error, Debug)]
pub enum ProlinkError {
    #[error("terminating")]
    Terminating,

    #[error("no source offered artifact {kind:?} for player {player}")]
    NotAvailable { player: PlayerId, kind: ArtifactKind },

    #[error("track on player {player} is still analyzing")]
    StillAnalyzing { player: PlayerId },

    #[error("dbserver transport failure for player {player}: {reason}")]
    TransportFailure { player: PlayerId, reason: String },

    #[error("timed out waiting on {0}")]
    Timeout(String),

    #[error("engine is not running")]
    NotRunning,

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("{error_kind} error at 0x{pos:x} parsing @{timestamp}: \n{dump}")]
    ParseError {
        error_kind: String,
        pos: usize,
        timestamp: u128,
        dump: String,
    },

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    SystemTime(#[from] std::time::SystemTimeError),

    #[error(transparent)]
    WatchRecvError(#[from] watch::error::RecvError),

    #[error(transparent)]
    WatchSendError(#[from] watch::error::SendError<bool>),

    #[error(transparent)]
    MessageSendError(#[from] mpsc::error::SendError<crate::EngineEvent>),

    #[error(transparent)]
    PeerSendError(#[from] broadcast::error::SendError<crate::registry::PeerEvent>),
}

pub type Result<T> = std::result::Result<T, ProlinkError>;
