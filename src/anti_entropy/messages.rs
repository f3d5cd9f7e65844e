use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::messaging::node_id::NodeId;

/// For every origin node, the highest version of its data that a replica has seen.
pub type Digest = BTreeMap<NodeId, u64>;

/// The body of a gossip exchange. On the wire these are externally tagged, i.e.
///  `{"digest":{...}}`, `{"partial_digest":{...}}` and `{"update":{...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GossipMessage {
    /// all origins the sender knows
    Digest(Digest),
    /// a subset of the origins the sender knows, for replicas whose full digest does not fit
    ///  into a datagram
    PartialDigest(Digest),
    Update(UpdateRecord),
}

/// A single reconciled key. `r` is the node the value originates from, `ts` its version in the
///  origin's sequence of writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateRecord {
    pub k: String,
    pub v: Value,
    pub r: NodeId,
    pub ts: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_shape() {
        let update = GossipMessage::Update(UpdateRecord {
            k: "watercooler:join".to_string(),
            v: json!({"id": "a"}),
            r: NodeId::from("a"),
            ts: 7,
        });
        assert_eq!(
            serde_json::to_string(&update).unwrap(),
            r#"{"update":{"k":"watercooler:join","v":{"id":"a"},"r":"a","ts":7}}"#
        );

        let digest = GossipMessage::Digest([(NodeId::from("a"), 7)].into_iter().collect());
        assert_eq!(serde_json::to_string(&digest).unwrap(), r#"{"digest":{"a":7}}"#);

        let partial = GossipMessage::PartialDigest([(NodeId::from("a"), 7)].into_iter().collect());
        assert_eq!(serde_json::to_string(&partial).unwrap(), r#"{"partial_digest":{"a":7}}"#);
    }
}
