//! Framing of gossip records into datagrams.
//!
//! A datagram is a sequence of JSON records, each terminated by a newline. Its size is capped at
//!  [MAX_DATAGRAM_SIZE] to stay below any realistic path MTU. Records that do not fit are
//!  dropped for the round rather than split or deferred: gossip rounds repeat periodically, and
//!  the next round picks up where this one was cut off.

use std::net::SocketAddr;

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{error, trace, warn};

use crate::anti_entropy::messages::GossipMessage;
use crate::messaging::node_id::NodeId;
use crate::messaging::wire::WireRecord;
use crate::node::peer::PeerInfo;

pub const MAX_DATAGRAM_SIZE: usize = 576;
pub const RECORD_SEPARATOR: u8 = b'\n';

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub to: SocketAddr,
    pub payload: Bytes,
}

/// A decoded message together with the node it is provably from, if that is known
#[derive(Debug, Clone, PartialEq)]
pub struct Stamped<T> {
    pub sender: Option<NodeId>,
    pub message: T,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundRecord {
    Handshake(PeerInfo),
    Message(Stamped<GossipMessage>),
}

pub fn encode(records: &[WireRecord], to: SocketAddr) -> Datagram {
    let serialized = records.iter()
        .filter_map(serialize_record);
    let fitting = take_within_limit(serialized, MAX_DATAGRAM_SIZE);

    Datagram {
        to,
        payload: concat(fitting),
    }
}

fn serialize_record(record: &WireRecord) -> Option<Vec<u8>> {
    match serde_json::to_vec(record) {
        Ok(mut buf) => {
            buf.push(RECORD_SEPARATOR);
            Some(buf)
        }
        Err(e) => {
            error!("error serializing gossip record {:?} - skipping: {}", record, e);
            None
        }
    }
}

/// the longest prefix of `records` that fits into `limit` bytes
fn take_within_limit(records: impl Iterator<Item=Vec<u8>>, limit: usize) -> Vec<Vec<u8>> {
    let mut size = 0;
    let mut result = Vec::new();
    for record in records {
        size += record.len();
        if size > limit {
            trace!("datagram size limit of {} bytes reached - dropping remaining records", limit);
            break;
        }
        result.push(record);
    }
    result
}

fn concat(records: Vec<Vec<u8>>) -> Bytes {
    let mut buf = BytesMut::with_capacity(records.iter().map(|r| r.len()).sum());
    for record in records {
        buf.put_slice(&record);
    }
    buf.freeze()
}

/// Decodes a datagram's records. Handshakes are passed on as they are, all other records are
///  stamped with `sender`. A record that fails to parse is skipped without affecting the others.
pub fn decode(payload: &[u8], sender: Option<&NodeId>) -> Vec<InboundRecord> {
    payload.split(|&b| b == RECORD_SEPARATOR)
        .filter(|line| !line.is_empty())
        .filter_map(|line| match serde_json::from_slice::<WireRecord>(line) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!("received a malformed gossip record - skipping: {}", e);
                None
            }
        })
        .map(|record| match record {
            WireRecord::Handshake(handshake) => InboundRecord::Handshake(handshake.from),
            WireRecord::Message(message) => InboundRecord::Message(Stamped {
                sender: sender.cloned(),
                message,
            }),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anti_entropy::messages::UpdateRecord;
    use crate::messaging::wire::Handshake;
    use serde_json::json;
    use std::str::FromStr;

    fn to() -> SocketAddr {
        SocketAddr::from_str("10.0.0.2:7000").unwrap()
    }

    fn update(key: &str, value_len: usize) -> WireRecord {
        WireRecord::Message(GossipMessage::Update(UpdateRecord {
            k: key.to_string(),
            v: json!("x".repeat(value_len)),
            r: NodeId::from("a"),
            ts: 1,
        }))
    }

    fn serialized_len(record: &WireRecord) -> usize {
        serde_json::to_vec(record).unwrap().len() + 1
    }

    fn handshake() -> WireRecord {
        WireRecord::Handshake(Handshake {
            from: PeerInfo { id: NodeId::from("a"), host: "10.0.0.1".to_string(), port: 7000 },
        })
    }

    #[test]
    fn test_encode_concatenates_records() {
        let records = vec![handshake(), WireRecord::Message(GossipMessage::Digest(Default::default()))];
        let datagram = encode(&records, to());

        assert_eq!(datagram.to, to());
        assert_eq!(
            std::str::from_utf8(&datagram.payload).unwrap(),
            "{\"from\":{\"id\":\"a\",\"host\":\"10.0.0.1\",\"port\":7000}}\n{\"digest\":{}}\n"
        );
    }

    #[test]
    fn test_encode_keeps_only_leading_records_within_limit() {
        let records = vec![update("a", 200), update("b", 200), update("c", 200), update("d", 1)];
        let first_two = serialized_len(&records[0]) + serialized_len(&records[1]);
        assert!(first_two <= MAX_DATAGRAM_SIZE);
        assert!(first_two + serialized_len(&records[2]) > MAX_DATAGRAM_SIZE);

        let datagram = encode(&records, to());

        assert_eq!(datagram.payload.len(), first_two);
        let decoded = decode(&datagram.payload, None);
        let keys = decoded.iter()
            .map(|r| match r {
                InboundRecord::Message(Stamped { message: GossipMessage::Update(u), .. }) => u.k.clone(),
                other => panic!("unexpected record {:?}", other),
            })
            .collect::<Vec<_>>();
        // 'd' would fit on its own, but everything after the first overflow is dropped
        assert_eq!(keys, vec!["a", "b"]);
    }

    #[test]
    fn test_encode_record_filling_limit_exactly() {
        let probe = update("a", 0);
        let record = update("a", MAX_DATAGRAM_SIZE - serialized_len(&probe));
        assert_eq!(serialized_len(&record), MAX_DATAGRAM_SIZE);

        let datagram = encode(&[record], to());
        assert_eq!(datagram.payload.len(), MAX_DATAGRAM_SIZE);
    }

    #[test]
    fn test_encode_oversized_first_record_yields_empty_payload() {
        let datagram = encode(&[update("a", 1000), update("b", 1)], to());
        assert!(datagram.payload.is_empty());
    }

    #[test]
    fn test_decode_stamps_every_record() {
        let payload = b"{\"digest\":{\"a\":1}}\n{\"update\":{\"k\":\"x\",\"v\":1,\"r\":\"a\",\"ts\":1}}\n{\"update\":{\"k\":\"y\",\"v\":2,\"r\":\"c\",\"ts\":4}}\n";
        let sender = NodeId::from("b");

        let decoded = decode(payload, Some(&sender));

        assert_eq!(decoded.len(), 3);
        for record in decoded {
            match record {
                InboundRecord::Message(stamped) => assert_eq!(stamped.sender, Some(sender.clone())),
                other => panic!("unexpected record {:?}", other),
            }
        }
    }

    #[test]
    fn test_decode_does_not_stamp_handshakes() {
        let payload = b"{\"from\":{\"id\":\"a\",\"host\":\"10.0.0.1\",\"port\":7000}}\n{\"digest\":{}}\n";
        let decoded = decode(payload, Some(&NodeId::from("b")));

        assert_eq!(decoded, vec![
            InboundRecord::Handshake(PeerInfo { id: NodeId::from("a"), host: "10.0.0.1".to_string(), port: 7000 }),
            InboundRecord::Message(Stamped { sender: Some(NodeId::from("b")), message: GossipMessage::Digest(Default::default()) }),
        ]);
    }

    #[test]
    fn test_decode_isolates_malformed_records() {
        let payload = b"{\"digest\":{}}\nthis is not json\n\n{\"unknown\":1}\n{\"digest\":{\"a\":2}}";
        let decoded = decode(payload, None);

        assert_eq!(decoded.len(), 2);
        assert!(decoded.iter().all(|r| matches!(r, InboundRecord::Message(Stamped { sender: None, .. }))));
    }
}
