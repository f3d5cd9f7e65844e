//! The cluster member: membership bookkeeping, the gossip driver and the join protocol.

pub mod gossip;
pub mod join;
pub mod keys;
pub mod link_policy;
pub mod membership;
#[allow(clippy::module_inception)]
pub mod node;
pub mod node_config;
pub mod node_error;
pub mod node_events;
pub mod peer;
