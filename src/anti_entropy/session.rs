use tracing::trace;

use crate::anti_entropy::messages::{Digest, GossipMessage};
use crate::anti_entropy::AntiEntropy;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SessionRole {
    /// the side that opens a round by sending its digest
    Initiator,
    /// the side that answers an incoming round
    Responder,
}

/// One side of a single gossip exchange. A session is cheap, it holds no state beyond its
///  role: everything it needs to know is either in the replica or in the messages it is given.
///
/// A full round looks like this:
/// * initiator: digest
/// * responder: its own digest, followed by the updates the initiator lacks
/// * initiator: the updates the responder lacks
///
/// Either digest may be partial if the replica knows too many origins to list them all in a
///  datagram.
pub struct ExchangeSession {
    engine: AntiEntropy,
    role: SessionRole,
}

impl ExchangeSession {
    pub(crate) fn new(engine: AntiEntropy, role: SessionRole) -> ExchangeSession {
        ExchangeSession { engine, role }
    }

    /// the messages this side sends before having received anything
    pub async fn opening(&self) -> Vec<GossipMessage> {
        match self.role {
            SessionRole::Initiator => vec![self.engine.digest_message().await],
            SessionRole::Responder => vec![],
        }
    }

    /// Processes a received message, returning what should be sent in response
    pub async fn on_message(&self, message: GossipMessage) -> Vec<GossipMessage> {
        match message {
            GossipMessage::Digest(digest) => self.on_digest(&digest, true).await,
            GossipMessage::PartialDigest(digest) => self.on_digest(&digest, false).await,
            GossipMessage::Update(update) => {
                self.engine.apply(update).await;
                vec![]
            }
        }
    }

    async fn on_digest(&self, digest: &Digest, complete: bool) -> Vec<GossipMessage> {
        trace!(role = ?self.role, complete, "received digest {:?}", digest);
        let missing = self.engine.on_digest(digest, complete).await
            .into_iter()
            .map(GossipMessage::Update);

        match self.role {
            SessionRole::Initiator => missing.collect(),
            SessionRole::Responder => {
                let mut result = vec![self.engine.digest_message().await];
                result.extend(missing);
                result
            }
        }
    }
}
