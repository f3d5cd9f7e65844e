use serde::{Deserialize, Serialize};

use crate::anti_entropy::messages::GossipMessage;
use crate::node::peer::PeerInfo;

/// The handshake is pushed ahead of the exchange body by a node that initiates a round. It
///  tells the receiver who to send a reply round to. Reply rounds never carry one, which is
///  what keeps two nodes from answering each other forever.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    pub from: PeerInfo,
}

/// One newline-delimited JSON record in a datagram. Anything carrying a `from` field is a
///  handshake, everything else must be part of the exchange body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireRecord {
    Handshake(Handshake),
    Message(GossipMessage),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::node_id::NodeId;

    #[test]
    fn test_handshake_wire_shape() {
        let record = WireRecord::Handshake(Handshake {
            from: PeerInfo { id: NodeId::from("a"), host: "10.0.0.1".to_string(), port: 7000 },
        });
        assert_eq!(
            serde_json::to_string(&record).unwrap(),
            r#"{"from":{"id":"a","host":"10.0.0.1","port":7000}}"#
        );
    }

    #[test]
    fn test_any_record_with_from_is_a_handshake() {
        let record: WireRecord = serde_json::from_str(r#"{"digest":{},"from":{"id":1,"host":"h","port":1}}"#).unwrap();
        assert!(matches!(record, WireRecord::Handshake(_)));
    }
}
