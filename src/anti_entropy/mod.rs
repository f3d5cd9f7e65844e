//! Scuttlebutt style reconciliation of replicated key / value state.
//!
//! Every node owns the keys it writes, and versions them with a strictly increasing counter. Two
//!  nodes reconcile by exchanging digests (the highest version they know for every origin) and
//!  then sending each other the updates the other side is missing. Updates from a remote origin
//!  that change the local replica are published to subscribers, local writes are not.
//!
//! A digest has to fit into a datagram together with a handshake. Replicas that know too many
//!  origins for that send a partial digest instead, rotating through their origins from round
//!  to round.

pub mod messages;
pub mod replica_store;
pub mod session;

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, trace};

use crate::anti_entropy::messages::{Digest, GossipMessage, UpdateRecord};
use crate::anti_entropy::replica_store::ReplicaStore;
use crate::anti_entropy::session::{ExchangeSession, SessionRole};
use crate::messaging::codec::MAX_DATAGRAM_SIZE;
use crate::messaging::node_id::NodeId;

const UPDATE_CHANNEL_CAPACITY: usize = 1024;

/// Upper bound for a serialized digest record, leaving the rest of a datagram for a handshake
///  or for updates.
pub const MAX_DIGEST_RECORD_SIZE: usize = MAX_DATAGRAM_SIZE / 2;

/// Handle to a node's replica. Clones share the same state.
#[derive(Clone)]
pub struct AntiEntropy {
    store: Arc<RwLock<ReplicaStore>>,
    update_sender: broadcast::Sender<UpdateRecord>,
}

impl AntiEntropy {
    pub fn new(myself: NodeId) -> AntiEntropy {
        let (update_sender, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        AntiEntropy {
            store: Arc::new(RwLock::new(ReplicaStore::new(myself))),
            update_sender,
        }
    }

    /// Publishes a local value. Returns `false` and changes nothing if the key already has this
    ///  value.
    pub async fn set(&self, key: &str, value: Value) -> bool {
        let version = self.store.write().await
            .set_local(key, value, false);
        trace!("set {} -> version {:?}", key, version);
        version.is_some()
    }

    /// Publishes a local value with a new version even if it is unchanged, so it is
    ///  disseminated as a fresh update.
    pub async fn event(&self, key: &str, value: Value) {
        let version = self.store.write().await
            .set_local(key, value, true);
        trace!("event {} -> version {:?}", key, version);
    }

    pub async fn get(&self, origin: &NodeId, key: &str) -> Option<Value> {
        self.store.read().await
            .get(origin, key)
            .cloned()
    }

    pub async fn digest(&self) -> Digest {
        self.store.read().await.digest()
    }

    /// a session for a round this node initiates
    pub fn create_stream(&self) -> ExchangeSession {
        ExchangeSession::new(self.clone(), SessionRole::Initiator)
    }

    /// a session for answering a round another node initiated
    pub fn exchange(&self) -> ExchangeSession {
        ExchangeSession::new(self.clone(), SessionRole::Responder)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UpdateRecord> {
        self.update_sender.subscribe()
    }

    /// the digest record for the next message, full or partial
    pub(crate) async fn digest_message(&self) -> GossipMessage {
        self.store.write().await
            .bounded_digest(MAX_DIGEST_RECORD_SIZE)
    }

    /// Takes note of a peer's digest, returning the updates the peer is missing
    pub(crate) async fn on_digest(&self, digest: &Digest, complete: bool) -> Vec<UpdateRecord> {
        let mut store = self.store.write().await;
        store.learn_origins(digest);
        store.updates_missing_from(digest, complete)
    }

    pub(crate) async fn apply(&self, update: UpdateRecord) {
        let changed = self.store.write().await
            .apply(&update);
        if changed {
            debug!("received {} = {} (for {})", update.k, update.v, update.r);
            // no subscribers is fine
            let _ = self.update_sender.send(update);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anti_entropy::session::ExchangeSession;
    use crate::messaging::codec::{decode, encode, InboundRecord, Stamped};
    use crate::messaging::wire::{Handshake, WireRecord};
    use crate::node::peer::PeerInfo;
    use serde_json::json;
    use std::net::SocketAddr;
    use std::str::FromStr;
    use tokio::sync::broadcast::error::TryRecvError;

    async fn process(session: &ExchangeSession, messages: Vec<GossipMessage>) -> Vec<GossipMessage> {
        let mut result = Vec::new();
        for message in messages {
            result.append(&mut session.on_message(message).await);
        }
        result
    }

    /// one complete round between two replicas, returning the messages that went back and forth
    async fn round(initiator: &AntiEntropy, responder: &AntiEntropy) -> (Vec<GossipMessage>, Vec<GossipMessage>, Vec<GossipMessage>) {
        let init = initiator.create_stream();
        let resp = responder.exchange();

        let opening = init.opening().await;
        assert!(resp.opening().await.is_empty());

        let reply = process(&resp, opening.clone()).await;
        let follow_up = process(&init, reply.clone()).await;
        assert!(process(&resp, follow_up.clone()).await.is_empty());

        (opening, reply, follow_up)
    }

    fn received(rx: &mut broadcast::Receiver<UpdateRecord>) -> Vec<(String, Value, NodeId)> {
        let mut result = Vec::new();
        loop {
            match rx.try_recv() {
                Ok(u) => result.push((u.k, u.v, u.r)),
                Err(TryRecvError::Empty) => return result,
                Err(e) => panic!("{:?}", e),
            }
        }
    }

    #[tokio::test]
    async fn test_round_reconciles_both_sides() {
        let a = AntiEntropy::new(NodeId::from("a"));
        let b = AntiEntropy::new(NodeId::from("b"));
        let mut a_updates = a.subscribe();
        let mut b_updates = b.subscribe();

        a.set("x", json!("from a")).await;
        b.set("y", json!("from b")).await;

        let (opening, reply, follow_up) = round(&a, &b).await;
        assert_eq!(opening.len(), 1);
        assert_eq!(reply.len(), 2);
        assert_eq!(follow_up.len(), 1);

        assert_eq!(a.get(&NodeId::from("b"), "y").await, Some(json!("from b")));
        assert_eq!(b.get(&NodeId::from("a"), "x").await, Some(json!("from a")));
        assert_eq!(a.digest().await, b.digest().await);

        assert_eq!(received(&mut a_updates), vec![("y".to_string(), json!("from b"), NodeId::from("b"))]);
        assert_eq!(received(&mut b_updates), vec![("x".to_string(), json!("from a"), NodeId::from("a"))]);

        // converged: another round only exchanges digests
        let (_, reply, follow_up) = round(&b, &a).await;
        assert_eq!(reply.len(), 1);
        assert!(follow_up.is_empty());
        assert!(received(&mut a_updates).is_empty());
        assert!(received(&mut b_updates).is_empty());
    }

    #[tokio::test]
    async fn test_unchanged_set_is_not_disseminated() {
        let a = AntiEntropy::new(NodeId::from("a"));
        let b = AntiEntropy::new(NodeId::from("b"));
        let mut b_updates = b.subscribe();

        assert!(a.set("x", json!(1)).await);
        round(&a, &b).await;
        assert_eq!(received(&mut b_updates).len(), 1);

        assert!(!a.set("x", json!(1)).await);
        round(&a, &b).await;
        assert!(received(&mut b_updates).is_empty());
    }

    #[tokio::test]
    async fn test_event_is_disseminated_even_if_unchanged() {
        let a = AntiEntropy::new(NodeId::from("a"));
        let b = AntiEntropy::new(NodeId::from("b"));
        let mut b_updates = b.subscribe();

        a.event("beat", json!(1)).await;
        round(&a, &b).await;
        a.event("beat", json!(1)).await;
        round(&b, &a).await;

        assert_eq!(received(&mut b_updates).len(), 2);
    }

    #[tokio::test]
    async fn test_local_writes_are_not_published() {
        let a = AntiEntropy::new(NodeId::from("a"));
        let mut a_updates = a.subscribe();
        a.set("x", json!(1)).await;
        a.event("y", json!(2)).await;
        assert!(received(&mut a_updates).is_empty());
    }

    #[tokio::test]
    async fn test_relayed_updates_keep_their_origin() {
        let a = AntiEntropy::new(NodeId::from("a"));
        let b = AntiEntropy::new(NodeId::from("b"));
        let c = AntiEntropy::new(NodeId::from("c"));
        let mut c_updates = c.subscribe();

        a.set("x", json!(1)).await;
        round(&a, &b).await;
        round(&c, &b).await;

        assert_eq!(received(&mut c_updates), vec![("x".to_string(), json!(1), NodeId::from("a"))]);
    }

    fn messages_of(records: Vec<InboundRecord>) -> Vec<GossipMessage> {
        records.into_iter()
            .filter_map(|r| match r {
                InboundRecord::Message(Stamped { message, .. }) => Some(message),
                InboundRecord::Handshake(_) => None,
            })
            .collect()
    }

    /// one round where every step goes through the datagram codec, returning the initiator's
    ///  opening as it arrived at the responder
    async fn round_over_wire(initiator: &AntiEntropy, responder: &AntiEntropy) -> Vec<InboundRecord> {
        let to = SocketAddr::from_str("127.0.0.1:7000").unwrap();
        let handshake = WireRecord::Handshake(Handshake { from: PeerInfo {
            id: NodeId::generate(),
            host: "127.0.0.1".to_string(),
            port: 7001,
        }});

        let init = initiator.create_stream();
        let resp = responder.exchange();

        let mut opening = vec![handshake];
        opening.extend(init.opening().await.into_iter().map(WireRecord::Message));
        let received_opening = decode(&encode(&opening, to).payload, None);

        let reply = process(&resp, messages_of(received_opening.clone())).await;
        let reply = encode(&reply.into_iter().map(WireRecord::Message).collect::<Vec<_>>(), to);
        assert!(!reply.payload.is_empty());

        let follow_up = process(&init, messages_of(decode(&reply.payload, None))).await;
        let follow_up = encode(&follow_up.into_iter().map(WireRecord::Message).collect::<Vec<_>>(), to);
        process(&resp, messages_of(decode(&follow_up.payload, None))).await;

        received_opening
    }

    async fn with_generated_origins(engine: &AntiEntropy, num_origins: usize) {
        for i in 0..num_origins {
            engine.apply(UpdateRecord {
                k: format!("key-{}", i),
                v: json!(i),
                r: NodeId::generate(),
                ts: 1_700_000_000_000 + i as u64,
            }).await;
        }
    }

    #[tokio::test]
    async fn test_many_origins_still_reconcile_through_datagrams() {
        let a = AntiEntropy::new(NodeId::generate());
        let b = AntiEntropy::new(NodeId::generate());
        a.set("x", json!("from a")).await;
        b.set("y", json!("from b")).await;
        with_generated_origins(&a, 12).await;
        with_generated_origins(&b, 12).await;

        let opening = round_over_wire(&a, &b).await;
        assert!(opening.iter().any(|r| matches!(r, InboundRecord::Message(Stamped { message: GossipMessage::PartialDigest(d), .. }) if !d.is_empty())));

        for i in 0..200 {
            if a.digest().await == b.digest().await {
                break;
            }
            if i % 2 == 0 {
                round_over_wire(&b, &a).await;
            }
            else {
                round_over_wire(&a, &b).await;
            }
        }

        let digest = a.digest().await;
        assert_eq!(digest, b.digest().await);
        assert_eq!(digest.len(), 26);
        assert!(digest.values().all(|v| *v > 0));
    }
}
