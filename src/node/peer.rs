use serde::{Deserialize, Serialize};

use crate::failure_detector::FailureDetector;
use crate::messaging::node_id::NodeId;

/// The identifying data of a node as it is announced through gossip
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: NodeId,
    pub host: String,
    pub port: u16,
}

impl PeerInfo {
    pub fn same_address(&self, other: &PeerInfo) -> bool {
        self.host == other.host && self.port == other.port
    }
}

/// A remote node as this node knows it. Every peer has its own failure detector that is never
///  shared, and that stays with the record when the peer is moved between healthy and down.
pub struct Peer {
    info: PeerInfo,
    failure_detector: Box<dyn FailureDetector>,
}

impl Peer {
    pub fn new(info: PeerInfo, failure_detector: Box<dyn FailureDetector>) -> Peer {
        Peer { info, failure_detector }
    }

    pub fn info(&self) -> &PeerInfo {
        &self.info
    }

    pub fn id(&self) -> &NodeId {
        &self.info.id
    }

    /// traffic from this peer was observed
    pub fn report(&mut self) {
        self.failure_detector.report();
    }

    pub fn phi(&self) -> f64 {
        self.failure_detector.phi()
    }
}
