//! Cluster membership and failure detection through gossip over UDP.
//!
//! Nodes periodically reconcile a small replicated key / value store with a random peer. The
//!  same traffic feeds a phi accrual failure detector per peer, so there are no separate
//!  heartbeat messages: a node that is not heard from in gossip for long enough is considered
//!  down, and it is considered alive again as soon as there is traffic from it.

pub mod anti_entropy;
pub mod failure_detector;
pub mod messaging;
pub mod node;
pub mod test_util;
pub mod util;

pub use messaging::node_id::NodeId;
pub use node::node::Node;
pub use node::node_config::NodeConfig;
pub use node::node_error::{JoinAttemptError, NodeError};
pub use node::node_events::NodeEvent;
pub use node::peer::PeerInfo;
