use rustc_hash::FxHashSet;

use crate::messaging::node_id::NodeId;

/// Decides whether this node may run a gossip round with a given peer. This is a hook for
///  simulating partial network failures, e.g. two nodes that can only learn about each other
///  through a third one.
pub trait LinkPolicy: Send + Sync {
    fn should_gossip(&self, myself: &NodeId, peer: &NodeId) -> bool;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAllLinks {}

impl LinkPolicy for AllowAllLinks {
    fn should_gossip(&self, _myself: &NodeId, _peer: &NodeId) -> bool {
        true
    }
}

/// Blocks gossip between specific pairs of nodes, in both directions
#[derive(Debug, Default, Clone)]
pub struct BlockedLinks {
    blocked: FxHashSet<(NodeId, NodeId)>,
}

impl BlockedLinks {
    pub fn new() -> BlockedLinks {
        Default::default()
    }

    pub fn block(mut self, a: impl Into<NodeId>, b: impl Into<NodeId>) -> BlockedLinks {
        let (a, b) = (a.into(), b.into());
        self.blocked.insert(Self::normalized(a, b));
        self
    }

    fn normalized(a: NodeId, b: NodeId) -> (NodeId, NodeId) {
        if a <= b { (a, b) } else { (b, a) }
    }
}

impl LinkPolicy for BlockedLinks {
    fn should_gossip(&self, myself: &NodeId, peer: &NodeId) -> bool {
        !self.blocked.contains(&Self::normalized(myself.clone(), peer.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocked_links_are_symmetric() {
        let policy = BlockedLinks::new().block("1", "3");

        assert!(!policy.should_gossip(&NodeId::from("1"), &NodeId::from("3")));
        assert!(!policy.should_gossip(&NodeId::from("3"), &NodeId::from("1")));
        assert!(policy.should_gossip(&NodeId::from("1"), &NodeId::from("2")));
        assert!(policy.should_gossip(&NodeId::from("2"), &NodeId::from("3")));
    }

    #[test]
    fn test_allow_all() {
        assert!(AllowAllLinks::default().should_gossip(&NodeId::from("1"), &NodeId::from("3")));
    }
}
