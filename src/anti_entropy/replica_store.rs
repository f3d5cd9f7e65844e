use std::collections::BTreeMap;
use std::ops::Bound::{Excluded, Unbounded};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;
use tracing::trace;

use crate::anti_entropy::messages::{Digest, GossipMessage, UpdateRecord};
use crate::messaging::node_id::NodeId;

#[derive(Debug, Clone, PartialEq)]
struct VersionedValue {
    value: Value,
    version: u64,
}

/// A node's replica of the cluster's key / value state, partitioned by the node each value
///  originates from. Only the local node writes to its own partition, everything else arrives
///  through gossip.
///
/// Versions are per origin and strictly increasing. A local write gets a version of at least
///  the current wall clock time in millis, so a node that restarted with empty state still
///  supersedes whatever its previous incarnation left in other nodes' replicas.
pub struct ReplicaStore {
    myself: NodeId,
    partitions: BTreeMap<NodeId, BTreeMap<String, VersionedValue>>,
    max_versions: Digest,
    /// last origin that went into a partial digest, the next one continues after it
    digest_cursor: Option<NodeId>,
}

impl ReplicaStore {
    pub fn new(myself: NodeId) -> ReplicaStore {
        ReplicaStore {
            myself,
            partitions: Default::default(),
            max_versions: Default::default(),
            digest_cursor: None,
        }
    }

    /// Writes a value to the local partition and returns the new version. Unless `force` is
    ///  set, writing the value that is already stored is a no-op and returns `None`.
    pub fn set_local(&mut self, key: &str, value: Value, force: bool) -> Option<u64> {
        let partition = self.partitions.entry(self.myself.clone()).or_default();
        if !force {
            if let Some(existing) = partition.get(key) {
                if existing.value == value {
                    trace!("local value for {} is unchanged - skipping", key);
                    return None;
                }
            }
        }

        let last = self.max_versions.get(&self.myself).copied().unwrap_or(0);
        let version = (last + 1).max(unix_millis());

        partition.insert(key.to_string(), VersionedValue { value, version });
        self.max_versions.insert(self.myself.clone(), version);
        Some(version)
    }

    pub fn get(&self, origin: &NodeId, key: &str) -> Option<&Value> {
        self.partitions.get(origin)?
            .get(key)
            .map(|v| &v.value)
    }

    pub fn digest(&self) -> Digest {
        self.max_versions.clone()
    }

    /// The digest to send in a round, as a record of at most `max_record_size` serialized bytes.
    ///
    /// If the full digest fits, it is sent as is. Otherwise this is a partial digest with as
    ///  many origins as fit, continuing round robin after the origins of the previous partial
    ///  digest so that every origin is compared eventually.
    pub fn bounded_digest(&mut self, max_record_size: usize) -> GossipMessage {
        let full = GossipMessage::Digest(self.max_versions.clone());
        match serde_json::to_string(&full) {
            Ok(s) if s.len() <= max_record_size => return full,
            _ => {}
        }

        let rotation = match &self.digest_cursor {
            Some(cursor) => self.max_versions.range::<NodeId, _>((Excluded(cursor), Unbounded))
                .chain(self.max_versions.range::<NodeId, _>(..=cursor))
                .collect::<Vec<_>>(),
            None => self.max_versions.iter().collect(),
        };

        let mut partial = Digest::new();
        let mut size = PARTIAL_DIGEST_OVERHEAD;
        let mut cursor = None;
        for (origin, version) in rotation {
            let entry_size = match serde_json::to_string(origin) {
                Ok(s) => s.len() + 1 + version.to_string().len(),
                Err(_) => continue,
            };
            let separator = if partial.is_empty() { 0 } else { 1 };
            if size + separator + entry_size > max_record_size {
                if partial.is_empty() {
                    // an origin that never fits must not block the rotation
                    trace!("digest entry for {:?} exceeds {} bytes - skipping", origin, max_record_size);
                    cursor = Some(origin.clone());
                    continue;
                }
                break;
            }
            size += separator + entry_size;
            partial.insert(origin.clone(), *version);
            cursor = Some(origin.clone());
        }

        if cursor.is_some() {
            self.digest_cursor = cursor;
        }
        trace!("digest does not fit into {} bytes - sending {} of {} origins", max_record_size, partial.len(), self.max_versions.len());
        GossipMessage::PartialDigest(partial)
    }

    /// Registers origins a peer mentioned that this replica has no data for, so they show up in
    ///  this replica's own digests with version 0 and peers send their data.
    pub fn learn_origins(&mut self, digest: &Digest) {
        for origin in digest.keys() {
            if origin != &self.myself && !self.max_versions.contains_key(origin) {
                trace!("learned about origin {:?}", origin);
                self.max_versions.insert(origin.clone(), 0);
            }
        }
    }

    /// All updates the owner of `digest` has not seen yet, in ascending (origin, version) order.
    ///
    /// For a `complete` digest, origins missing from it are treated as completely unknown. For a
    ///  partial digest they were just not compared this time, and nothing is sent for them.
    pub fn updates_missing_from(&self, digest: &Digest, complete: bool) -> Vec<UpdateRecord> {
        let mut result = Vec::new();
        for (origin, partition) in &self.partitions {
            let known = match digest.get(origin) {
                Some(version) => *version,
                None if complete => 0,
                None => continue,
            };

            let mut missing = partition.iter()
                .filter(|(_, v)| v.version > known)
                .map(|(k, v)| UpdateRecord {
                    k: k.clone(),
                    v: v.value.clone(),
                    r: origin.clone(),
                    ts: v.version,
                })
                .collect::<Vec<_>>();
            missing.sort_by_key(|u| u.ts);
            result.append(&mut missing);
        }
        result
    }

    /// Merges an update received through gossip, returning `true` if it changed anything.
    ///  Updates to the local partition are never accepted from the outside.
    pub fn apply(&mut self, update: &UpdateRecord) -> bool {
        if update.r == self.myself {
            trace!("ignoring update {:?} for own partition", update);
            return false;
        }

        let partition = self.partitions.entry(update.r.clone()).or_default();
        if let Some(existing) = partition.get(&update.k) {
            if existing.version >= update.ts {
                trace!("ignoring stale update {:?}", update);
                return false;
            }
        }

        partition.insert(update.k.clone(), VersionedValue { value: update.v.clone(), version: update.ts });

        let max_version = self.max_versions.entry(update.r.clone()).or_insert(0);
        *max_version = (*max_version).max(update.ts);
        true
    }
}

/// `{"partial_digest":{}}`
const PARTIAL_DIGEST_OVERHEAD: usize = 21;

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn update(origin: &str, key: &str, value: Value, ts: u64) -> UpdateRecord {
        UpdateRecord { k: key.to_string(), v: value, r: NodeId::from(origin), ts }
    }

    #[test]
    fn test_set_local_unchanged_is_noop() {
        let mut store = ReplicaStore::new(NodeId::from("a"));
        let first = store.set_local("x", json!(1), false).unwrap();
        assert_eq!(store.set_local("x", json!(1), false), None);
        assert_eq!(store.digest().get(&NodeId::from("a")), Some(&first));
    }

    #[test]
    fn test_set_local_forced_bumps_version() {
        let mut store = ReplicaStore::new(NodeId::from("a"));
        let first = store.set_local("x", json!(1), false).unwrap();
        let second = store.set_local("x", json!(1), true).unwrap();
        assert!(second > first);
        assert_eq!(store.get(&NodeId::from("a"), "x"), Some(&json!(1)));
    }

    #[test]
    fn test_local_versions_start_at_wall_clock() {
        let mut store = ReplicaStore::new(NodeId::from("a"));
        let before = unix_millis();
        assert!(store.set_local("x", json!(1), false).unwrap() >= before);
    }

    #[test]
    fn test_apply_ignores_stale_and_own_updates() {
        let mut store = ReplicaStore::new(NodeId::from("a"));

        assert!(store.apply(&update("b", "x", json!(2), 5)));
        assert!(!store.apply(&update("b", "x", json!(1), 4)));
        assert!(!store.apply(&update("b", "x", json!(1), 5)));
        assert!(!store.apply(&update("a", "x", json!(1), 100)));

        assert_eq!(store.get(&NodeId::from("b"), "x"), Some(&json!(2)));
        assert_eq!(store.get(&NodeId::from("a"), "x"), None);
        assert_eq!(store.digest(), [(NodeId::from("b"), 5)].into_iter().collect());
    }

    #[test]
    fn test_updates_missing_from_digest() {
        let mut store = ReplicaStore::new(NodeId::from("a"));
        store.apply(&update("c", "z", json!("c"), 7));
        store.apply(&update("b", "y", json!("y"), 9));
        store.apply(&update("b", "x", json!("x"), 3));
        store.apply(&update("b", "w", json!("w"), 5));

        let digest = [(NodeId::from("b"), 4)].into_iter().collect();
        assert_eq!(store.updates_missing_from(&digest, true), vec![
            update("b", "w", json!("w"), 5),
            update("b", "y", json!("y"), 9),
            update("c", "z", json!("c"), 7),
        ]);

        // origins absent from a partial digest were not compared
        assert_eq!(store.updates_missing_from(&digest, false), vec![
            update("b", "w", json!("w"), 5),
            update("b", "y", json!("y"), 9),
        ]);

        assert!(store.updates_missing_from(&store.digest(), true).is_empty());
    }

    #[test]
    fn test_small_digest_is_sent_in_full() {
        let mut store = ReplicaStore::new(NodeId::from("a"));
        store.apply(&update("b", "x", json!(1), 3));
        assert_eq!(store.bounded_digest(100), GossipMessage::Digest(store.digest()));
    }

    #[test]
    fn test_oversized_digest_rotates_through_origins() {
        let mut store = ReplicaStore::new(NodeId::from("a"));
        for origin in ["b", "c", "d", "e", "f"] {
            store.apply(&update(origin, "x", json!(1), 10));
        }

        // `{"partial_digest":{}}` plus two entries of `"b":10`
        let max_size = 21 + 6 + 1 + 6;

        let mut seen = Vec::new();
        for _ in 0..3 {
            match store.bounded_digest(max_size) {
                GossipMessage::PartialDigest(partial) => {
                    let record = serde_json::to_string(&GossipMessage::PartialDigest(partial.clone())).unwrap();
                    assert!(record.len() <= max_size);
                    assert!(!partial.is_empty());
                    seen.extend(partial.into_keys());
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(seen, vec![
            NodeId::from("b"), NodeId::from("c"),
            NodeId::from("d"), NodeId::from("e"),
            NodeId::from("f"), NodeId::from("b"),
        ]);
    }

    #[test]
    fn test_learned_origins_are_requested_with_version_zero() {
        let mut store = ReplicaStore::new(NodeId::from("a"));
        store.learn_origins(&[(NodeId::from("a"), 5), (NodeId::from("b"), 7)].into_iter().collect());
        assert_eq!(store.digest(), [(NodeId::from("b"), 0)].into_iter().collect());

        assert!(store.apply(&update("b", "x", json!(1), 7)));
        store.learn_origins(&[(NodeId::from("b"), 9)].into_iter().collect());
        assert_eq!(store.digest(), [(NodeId::from("b"), 7)].into_iter().collect());
    }
}
