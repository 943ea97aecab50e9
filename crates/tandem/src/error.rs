use std::io;

use tandem_sync::MetaError;
use thiserror::Error;

/// Submission-time failures surfaced to the upper layer synchronously.
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("device {0} is not configured")]
    Unconfigured(u32),
    #[error("writes require the Primary role")]
    NotPrimary,
    #[error("request exceeds the device capacity")]
    OutOfRange,
    #[error("request larger than the negotiated maximum")]
    TooLarge,
    #[error("request arena exhausted")]
    NoResources,
    #[error("metadata: {0}")]
    Meta(#[from] MetaError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Completion-time failures delivered through the upper layer's callback.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoError {
    #[error("no replica could serve the request")]
    ReplicasFailed,
    #[error("local backing device failed")]
    LocalDisk,
    #[error("connection to the peer was lost")]
    PeerLost,
    #[error("request aborted")]
    Aborted,
}
