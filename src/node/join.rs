use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::time;
use tracing::{debug, info, warn};

use crate::node::gossip::{gossip_round, GossipTarget};
use crate::node::node::NodeInner;
use crate::node::node_error::{JoinAttemptError, NodeError};
use crate::node::node_events::NodeEvent;

/// A validated host / port pair for a node that is not known by id yet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEndpoint {
    pub host: String,
    pub port: u16,
}

impl PeerEndpoint {
    pub fn new(host: impl Into<String>, port: u32) -> Result<PeerEndpoint, NodeError> {
        Ok(PeerEndpoint {
            host: host.into(),
            port: validate_port(port)?,
        })
    }
}

pub fn validate_port(port: u32) -> Result<u16, NodeError> {
    match u16::try_from(port) {
        Ok(port) if port > 0 => Ok(port),
        _ => Err(NodeError::InvalidPort(port)),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinState {
    Ready,
    Attempting {
        attempt: usize,
    },
    Succeeded {
        attempts: usize,
    },
    Failed {
        attempts: usize,
        last_error: JoinAttemptError,
    },
}

/// Book keeping for a join with a bounded number of attempts
#[derive(Debug, Clone)]
pub struct JoinAttempts {
    max_attempts: usize,
    attempts_made: usize,
    last_error: Option<JoinAttemptError>,
    state: JoinState,
}

impl JoinAttempts {
    pub fn new(max_attempts: usize) -> JoinAttempts {
        JoinAttempts {
            max_attempts: max_attempts.max(1),
            attempts_made: 0,
            last_error: None,
            state: JoinState::Ready,
        }
    }

    /// Starts the next attempt and returns its number (starting at 1), or `None` if the join
    ///  is finished, successfully or not.
    pub fn start_attempt(&mut self) -> Option<usize> {
        match self.state {
            JoinState::Ready | JoinState::Attempting { .. } => {}
            JoinState::Succeeded { .. } | JoinState::Failed { .. } => return None,
        }

        if self.attempts_made >= self.max_attempts {
            self.state = JoinState::Failed {
                attempts: self.attempts_made,
                last_error: self.last_error.clone().unwrap_or(JoinAttemptError::ChannelClosed),
            };
            return None;
        }

        self.attempts_made += 1;
        self.state = JoinState::Attempting { attempt: self.attempts_made };
        Some(self.attempts_made)
    }

    pub fn on_joined(&mut self) {
        self.state = JoinState::Succeeded { attempts: self.attempts_made };
    }

    pub fn on_attempt_failed(&mut self, error: JoinAttemptError) {
        self.last_error = Some(error);
    }

    pub fn state(&self) -> &JoinState {
        &self.state
    }

    pub fn attempts_made(&self) -> usize {
        self.attempts_made
    }

    pub fn last_error(&self) -> Option<&JoinAttemptError> {
        self.last_error.as_ref()
    }

    pub fn into_result(self) -> Result<usize, NodeError> {
        match self.state {
            JoinState::Succeeded { attempts } => Ok(attempts),
            JoinState::Failed { attempts, last_error } => Err(NodeError::JoinFailed { attempts, last_error }),
            JoinState::Ready | JoinState::Attempting { .. } => Err(NodeError::JoinFailed {
                attempts: self.attempts_made,
                last_error: self.last_error.unwrap_or(JoinAttemptError::ChannelClosed),
            }),
        }
    }
}

/// Joins a cluster through a node at a known address: every attempt is a gossip round with
///  that address, and it succeeds when a join announcement from any node comes in through
///  gossip before the attempt times out.
///
/// Failing to send is not retried, it is returned as a transport error right away.
pub(crate) async fn run_join(inner: &Arc<NodeInner>, endpoint: PeerEndpoint) -> Result<usize, NodeError> {
    let attempt_timeout = inner.config.join_attempt_timeout;
    let mut attempts = JoinAttempts::new(inner.config.join_attempts);

    while let Some(attempt) = attempts.start_attempt() {
        info!("joining cluster through {}:{} - attempt #{}", endpoint.host, endpoint.port, attempt);

        // subscribe before gossiping so a quick answer is not missed
        let mut events = inner.event_notifier.subscribe();
        gossip_round(inner, Some(GossipTarget::address(endpoint.host.clone(), endpoint.port)), false).await?;

        match time::timeout(attempt_timeout, await_join_event(&mut events)).await {
            Ok(Ok(())) => attempts.on_joined(),
            Ok(Err(e)) => {
                warn!("join attempt #{} failed: {}", attempt, e);
                attempts.on_attempt_failed(e);
            }
            Err(_) => {
                debug!("join attempt #{} timed out after {:?}", attempt, attempt_timeout);
                attempts.on_attempt_failed(JoinAttemptError::TimedOut(attempt_timeout));
            }
        }
    }

    let result = attempts.into_result();
    match &result {
        Ok(attempts) => info!("joined cluster through {}:{} after {} attempt(s)", endpoint.host, endpoint.port, attempts),
        Err(e) => warn!("giving up on joining through {}:{}: {}", endpoint.host, endpoint.port, e),
    }
    result
}

async fn await_join_event(events: &mut broadcast::Receiver<NodeEvent>) -> Result<(), JoinAttemptError> {
    loop {
        match events.recv().await {
            Ok(NodeEvent::Join(peer)) => {
                debug!(peer = ?peer.id, "received join announcement");
                return Ok(());
            }
            Ok(_) => {}
            Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => return Err(JoinAttemptError::ChannelClosed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::time::Duration;

    #[rstest]
    #[case::zero(0, false)]
    #[case::min(1, true)]
    #[case::typical(7000, true)]
    #[case::max(65535, true)]
    #[case::too_big(65536, false)]
    #[case::way_too_big(70000, false)]
    fn test_validate_port(#[case] port: u32, #[case] valid: bool) {
        match validate_port(port) {
            Ok(p) => {
                assert!(valid);
                assert_eq!(p as u32, port);
            }
            Err(NodeError::InvalidPort(p)) => {
                assert!(!valid);
                assert_eq!(p, port);
            }
            Err(e) => panic!("unexpected error {}", e),
        }
    }

    #[test]
    fn test_attempts_exhausted() {
        let timed_out = JoinAttemptError::TimedOut(Duration::from_secs(10));
        let mut attempts = JoinAttempts::new(3);
        assert_eq!(attempts.state(), &JoinState::Ready);

        for i in 1..=3 {
            assert_eq!(attempts.start_attempt(), Some(i));
            assert_eq!(attempts.state(), &JoinState::Attempting { attempt: i });
            attempts.on_attempt_failed(timed_out.clone());
            assert_eq!(attempts.attempts_made(), i);
            assert_eq!(attempts.last_error(), Some(&timed_out));
        }
        assert_eq!(attempts.start_attempt(), None);
        assert_eq!(attempts.state(), &JoinState::Failed { attempts: 3, last_error: timed_out.clone() });

        match attempts.into_result() {
            Err(NodeError::JoinFailed { attempts, last_error }) => {
                assert_eq!(attempts, 3);
                assert_eq!(last_error, timed_out);
            }
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn test_success_stops_attempts() {
        let mut attempts = JoinAttempts::new(3);
        attempts.start_attempt();
        attempts.on_attempt_failed(JoinAttemptError::TimedOut(Duration::from_secs(1)));
        attempts.start_attempt();
        attempts.on_joined();

        assert_eq!(attempts.start_attempt(), None);
        assert_eq!(attempts.state(), &JoinState::Succeeded { attempts: 2 });
        assert_eq!(attempts.into_result().unwrap(), 2);
    }

    #[test]
    fn test_at_least_one_attempt() {
        let mut attempts = JoinAttempts::new(0);
        assert_eq!(attempts.start_attempt(), Some(1));
    }
}
