use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("port {0} is out of range, it should be > 0 and < 65536")]
    InvalidPort(u32),
    #[error("gossip rate must be at least one gossip per minute")]
    InvalidGossipRate,
    #[error("node is already listening")]
    AlreadyListening,
    #[error("node must listen before it can join a cluster")]
    NotListening,
    #[error("transport error: {0}")]
    Transport(#[from] anyhow::Error),
    #[error("join failed after {attempts} attempt(s): {last_error}")]
    JoinFailed {
        attempts: usize,
        last_error: JoinAttemptError,
    },
}

/// why a single join attempt did not succeed
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum JoinAttemptError {
    #[error("no join announcement within {0:?}")]
    TimedOut(Duration),
    #[error("node event channel closed")]
    ChannelClosed,
}
