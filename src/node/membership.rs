use std::marker::PhantomData;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use tracing::{debug, info, trace};

use crate::failure_detector::FailureDetector;
use crate::messaging::node_id::NodeId;
use crate::node::node_events::{NodeEvent, NodeEventNotifier};
use crate::node::peer::{Peer, PeerInfo};
use crate::util::random::{Random, RngRandom};

/// A peer whose suspicion score, rounded to two decimals, exceeds this when it is picked as a
///  gossip target is considered down.
pub const PHI_DOWN_THRESHOLD: f64 = 8.0;

pub type FailureDetectorFactory = Arc<dyn Fn() -> Box<dyn FailureDetector> + Send + Sync>;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ReportOutcome {
    Reported,
    /// the peer was down and is now back
    Revived,
    Unknown,
}

/// This node's view of the other cluster members. Every known peer is either healthy (and a
///  candidate for gossip rounds) or down, never both.
///
/// Peers are added through join announcements only. Once known, a peer is never forgotten: a
///  downed peer returns as soon as there is traffic from it.
pub struct Membership<R: Random = RngRandom> {
    myself: NodeId,
    peers: FxHashMap<NodeId, Peer>,
    downed: FxHashMap<NodeId, Peer>,
    failure_detector_factory: FailureDetectorFactory,
    event_notifier: Arc<NodeEventNotifier>,
    pd: PhantomData<fn() -> R>,
}

impl Membership<RngRandom> {
    pub fn new(myself: NodeId, failure_detector_factory: FailureDetectorFactory, event_notifier: Arc<NodeEventNotifier>) -> Membership<RngRandom> {
        Membership::new_with_random(myself, failure_detector_factory, event_notifier)
    }
}

impl<R: Random> Membership<R> {
    pub fn new_with_random(myself: NodeId, failure_detector_factory: FailureDetectorFactory, event_notifier: Arc<NodeEventNotifier>) -> Membership<R> {
        Membership {
            myself,
            peers: Default::default(),
            downed: Default::default(),
            failure_detector_factory,
            event_notifier,
            pd: PhantomData,
        }
    }

    /// Traffic that is provably from `id` was received
    pub fn report(&mut self, id: &NodeId) -> ReportOutcome {
        if let Some(peer) = self.peers.get_mut(id) {
            peer.report();
            return ReportOutcome::Reported;
        }

        if let Some(mut peer) = self.downed.remove(id) {
            info!(peer = ?id, "peer is alive again");
            peer.report();
            let peer_info = peer.info().clone();
            self.peers.insert(id.clone(), peer);
            self.event_notifier.send_event(NodeEvent::Alive(peer_info));
            return ReportOutcome::Revived;
        }

        trace!(peer = ?id, "traffic from unknown node - ignoring");
        ReportOutcome::Unknown
    }

    /// Picks a random healthy peer for a scheduled gossip round. This is where failures are
    ///  detected: if the picked peer's phi exceeds the threshold, it is moved to the downed
    ///  set. It is returned nonetheless, and the round goes ahead.
    pub fn select_gossip_target(&mut self) -> Option<PeerInfo> {
        if self.peers.is_empty() {
            return None;
        }

        // sorted so the pick depends on nothing but the random number
        let mut candidates = self.peers.keys().cloned().collect::<Vec<_>>();
        candidates.sort();
        let id = candidates.swap_remove(R::gen_usize_range(0..candidates.len()));

        let peer = self.peers.get(&id)?;
        let phi = peer.phi();
        let peer_info = peer.info().clone();

        if round_to_hundredths(phi) > PHI_DOWN_THRESHOLD {
            info!(peer = ?id, phi, "peer is down");
            if let Some(peer) = self.peers.remove(&id) {
                self.downed.insert(id, peer);
            }
            self.event_notifier.send_event(NodeEvent::Down(peer_info.clone()));
        }
        else {
            trace!(peer = ?id, phi, "selected gossip target");
        }

        Some(peer_info)
    }

    /// Handles a node's announcement of itself. A known peer keeps its record (and failure
    ///  detector history) if its address is unchanged, otherwise it gets a fresh one. Either
    ///  way it is considered healthy afterwards.
    pub fn on_join_announcement(&mut self, announced: PeerInfo) {
        if announced.id == self.myself {
            trace!("ignoring own join announcement");
            return;
        }

        let existing = self.peers.remove(&announced.id)
            .or_else(|| self.downed.remove(&announced.id));

        let peer = match existing {
            Some(peer) if peer.info().same_address(&announced) => {
                debug!(peer = ?announced.id, "repeated join announcement");
                peer
            }
            existing => {
                if existing.is_some() {
                    debug!(peer = ?announced.id, "peer re-joined with a new address {}:{}", announced.host, announced.port);
                }
                else {
                    info!(peer = ?announced.id, "new peer at {}:{}", announced.host, announced.port);
                }
                // the announcement is the first contact, so it seeds the detector
                let mut peer = Peer::new(announced.clone(), (self.failure_detector_factory)());
                peer.report();
                peer
            }
        };

        self.peers.insert(announced.id.clone(), peer);
        self.event_notifier.send_event(NodeEvent::Join(announced));
    }

    pub fn peer_infos(&self) -> Vec<PeerInfo> {
        Self::sorted_infos(&self.peers)
    }

    pub fn downed_infos(&self) -> Vec<PeerInfo> {
        Self::sorted_infos(&self.downed)
    }

    fn sorted_infos(peers: &FxHashMap<NodeId, Peer>) -> Vec<PeerInfo> {
        let mut result = peers.values()
            .map(|p| p.info().clone())
            .collect::<Vec<_>>();
        result.sort_by(|a, b| a.id.cmp(&b.id));
        result
    }

    pub fn is_active(&self, id: &NodeId) -> bool {
        self.peers.contains_key(id)
    }

    pub fn is_down(&self, id: &NodeId) -> bool {
        self.downed.contains_key(id)
    }

    pub fn phi(&self, id: &NodeId) -> Option<f64> {
        self.peers.get(id)
            .or_else(|| self.downed.get(id))
            .map(|p| p.phi())
    }
}

fn round_to_hundredths(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
