//! Conflict resolution for incoming record sets.
//!
//! The merge is a pure function over maps; callers own logging,
//! counters and flooding of the returned delta.

use crate::value::Value;
use std::collections::HashMap;

/// What a merge changed.
///
/// `updates` holds exactly the incoming entries that altered the local
/// map (including delete records, so deletions flood onward).
/// `expired` lists keys removed by delete records. `hash_conflicts`
/// lists keys rejected because the incoming record claimed an existing
/// (version, originator) with a different hash.
#[derive(Debug, Default, Clone)]
pub struct MergeDelta {
    pub updates: HashMap<String, Value>,
    pub expired: Vec<String>,
    pub hash_conflicts: Vec<String>,
}

impl MergeDelta {
    pub fn is_empty(&self) -> bool {
        self.updates.is_empty() && self.expired.is_empty()
    }
}

/// Reconcile `incoming` into `local`, mutating `local` in place.
///
/// Per-key rules, in order:
/// 1. A delete record (finite `ttl_ms <= 0`) removes the key when its
///    (version, originator_id) is at least the local one.
/// 2. An unknown key is inserted, unless the record is a TTL-only
///    refresh (no payload to install).
/// 3. A known key is replaced when the incoming
///    (version, originator_id) is greater; on a tie, an incoming
///    record with a differing hash is rejected as a protocol
///    violation, and one with an equal hash but newer `ttl_version`
///    refreshes the TTL fields only.
///
/// Applying the same delta twice yields an empty delta the second
/// time.
pub fn merge_key_values(
    local: &mut HashMap<String, Value>,
    incoming: HashMap<String, Value>,
) -> MergeDelta {
    let mut delta = MergeDelta::default();

    for (key, inc) in incoming {
        if inc.is_delete() {
            let outranked = match local.get(&key) {
                Some(cur) => {
                    (inc.version, inc.originator_id.as_str())
                        >= (cur.version, cur.originator_id.as_str())
                }
                None => false,
            };
            if outranked {
                local.remove(&key);
                delta.expired.push(key.clone());
                delta.updates.insert(key, inc);
            }
            continue;
        }

        match local.get_mut(&key) {
            None => {
                // A TTL refresh for a key we never had carries nothing
                // to install.
                if inc.value.is_some() {
                    local.insert(key.clone(), inc.clone());
                    delta.updates.insert(key, inc);
                }
            }
            Some(cur) => {
                let inc_rank = (inc.version, inc.originator_id.as_str());
                let cur_rank = (cur.version, cur.originator_id.as_str());
                if inc_rank > cur_rank {
                    *cur = inc.clone();
                    delta.updates.insert(key, inc);
                } else if inc_rank == cur_rank {
                    if inc.hash != cur.hash {
                        delta.hash_conflicts.push(key);
                    } else if inc.ttl_version > cur.ttl_version {
                        cur.ttl_ms = inc.ttl_ms;
                        cur.ttl_version = inc.ttl_version;
                        delta.updates.insert(key, cur.hash_summary());
                    }
                }
            }
        }
    }

    delta
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::TTL_INFINITE;

    fn store(entries: &[(&str, Value)]) -> HashMap<String, Value> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn inserts_unknown_keys() {
        let mut local = HashMap::new();
        let v = Value::new(1, "alice", Some(b"a".to_vec()), TTL_INFINITE, 0);
        let delta = merge_key_values(&mut local, store(&[("k", v.clone())]));
        assert_eq!(delta.updates.len(), 1);
        assert_eq!(local.get("k"), Some(&v));
    }

    #[test]
    fn higher_version_wins() {
        let old = Value::new(1, "alice", Some(b"a".to_vec()), TTL_INFINITE, 0);
        let new = Value::new(2, "alice", Some(b"b".to_vec()), TTL_INFINITE, 0);
        let mut local = store(&[("k", old.clone())]);

        let delta = merge_key_values(&mut local, store(&[("k", new.clone())]));
        assert_eq!(local.get("k"), Some(&new));
        assert!(!delta.is_empty());

        // The stale record bounces off.
        let delta = merge_key_values(&mut local, store(&[("k", old)]));
        assert!(delta.is_empty());
        assert_eq!(local.get("k"), Some(&new));
    }

    #[test]
    fn originator_breaks_version_ties() {
        // Same version from two originators: the lexicographically
        // greater originator wins on every replica regardless of
        // arrival order.
        let from_x = Value::new(1, "x", Some(b"a".to_vec()), TTL_INFINITE, 0);
        let from_y = Value::new(1, "y", Some(b"b".to_vec()), TTL_INFINITE, 0);

        let mut a = store(&[("k", from_x.clone())]);
        let delta = merge_key_values(&mut a, store(&[("k", from_y.clone())]));
        assert_eq!(a.get("k"), Some(&from_y));
        assert!(!delta.is_empty());

        let mut b = store(&[("k", from_y.clone())]);
        let delta = merge_key_values(&mut b, store(&[("k", from_x)]));
        assert!(delta.is_empty());
        assert_eq!(b.get("k"), Some(&from_y));
    }

    #[test]
    fn merge_is_idempotent() {
        let mut local = HashMap::new();
        let incoming = store(&[
            ("a", Value::new(3, "n1", Some(b"x".to_vec()), TTL_INFINITE, 0)),
            ("b", Value::new(1, "n2", Some(b"y".to_vec()), 60_000, 2)),
        ]);

        let first = merge_key_values(&mut local, incoming.clone());
        assert_eq!(first.updates.len(), 2);

        let second = merge_key_values(&mut local, incoming);
        assert!(second.is_empty());
    }

    #[test]
    fn ttl_refresh_updates_ttl_fields_only() {
        let v = Value::new(1, "alice", Some(b"a".to_vec()), 500, 0);
        let mut local = store(&[("k", v.clone())]);

        let mut refresh = v.hash_summary();
        refresh.ttl_ms = 500;
        refresh.ttl_version = 1;

        let delta = merge_key_values(&mut local, store(&[("k", refresh)]));
        let merged = local.get("k").unwrap();
        assert_eq!(merged.ttl_version, 1);
        assert_eq!(merged.value.as_deref(), Some(b"a".as_slice()));

        // The emitted delta is TTL-only.
        assert_eq!(delta.updates["k"].value, None);
        assert_eq!(delta.updates["k"].ttl_version, 1);
    }

    #[test]
    fn stale_ttl_refresh_is_dropped() {
        let v = Value::new(1, "alice", Some(b"a".to_vec()), 500, 3);
        let mut local = store(&[("k", v)]);

        let mut refresh = local["k"].hash_summary();
        refresh.ttl_version = 2;
        let delta = merge_key_values(&mut local, store(&[("k", refresh)]));
        assert!(delta.is_empty());
        assert_eq!(local["k"].ttl_version, 3);
    }

    #[test]
    fn ttl_refresh_for_unknown_key_is_dropped() {
        let mut local = HashMap::new();
        let refresh = Value::new(1, "alice", None, 500, 1);
        let delta = merge_key_values(&mut local, store(&[("k", refresh)]));
        assert!(delta.is_empty());
        assert!(local.is_empty());
    }

    #[test]
    fn hash_conflict_is_rejected() {
        let honest = Value::new(1, "alice", Some(b"a".to_vec()), TTL_INFINITE, 0);
        let mut local = store(&[("k", honest.clone())]);

        // Same (version, originator), different content.
        let forged = Value::new(1, "alice", Some(b"evil".to_vec()), TTL_INFINITE, 0);
        assert_ne!(forged.hash, honest.hash);

        let delta = merge_key_values(&mut local, store(&[("k", forged)]));
        assert!(delta.updates.is_empty());
        assert_eq!(delta.hash_conflicts, vec!["k".to_string()]);
        assert_eq!(local.get("k"), Some(&honest));
    }

    #[test]
    fn delete_removes_and_floods() {
        let v = Value::new(1, "alice", Some(b"a".to_vec()), TTL_INFINITE, 0);
        let mut local = store(&[("k", v)]);

        let tombstone = Value::new(2, "alice", None, 0, 0);
        let delta = merge_key_values(&mut local, store(&[("k", tombstone.clone())]));
        assert!(local.is_empty());
        assert_eq!(delta.expired, vec!["k".to_string()]);
        assert_eq!(delta.updates.get("k"), Some(&tombstone));

        // Replaying the delete is a no-op.
        let delta = merge_key_values(&mut local, store(&[("k", tombstone)]));
        assert!(delta.is_empty());
    }

    #[test]
    fn stale_delete_is_dropped() {
        let v = Value::new(5, "alice", Some(b"a".to_vec()), TTL_INFINITE, 0);
        let mut local = store(&[("k", v.clone())]);

        let tombstone = Value::new(4, "alice", None, 0, 0);
        let delta = merge_key_values(&mut local, store(&[("k", tombstone)]));
        assert!(delta.is_empty());
        assert_eq!(local.get("k"), Some(&v));
    }

    #[test]
    fn identity_tuple_is_monotonic_over_merges() {
        let mut local = HashMap::new();
        let updates = [
            Value::new(1, "a", Some(b"1".to_vec()), TTL_INFINITE, 0),
            Value::new(1, "b", Some(b"2".to_vec()), TTL_INFINITE, 0),
            Value::new(1, "a", Some(b"3".to_vec()), TTL_INFINITE, 0),
            Value::new(3, "a", Some(b"4".to_vec()), TTL_INFINITE, 0),
            Value::new(2, "z", Some(b"5".to_vec()), TTL_INFINITE, 0),
        ];

        let mut last_rank = (0u64, String::new());
        for upd in updates {
            merge_key_values(&mut local, store(&[("k", upd)]));
            let cur = local.get("k").unwrap();
            let rank = (cur.version, cur.originator_id.clone());
            assert!(rank >= last_rank, "identity went backwards: {rank:?}");
            last_rank = rank;
        }
        assert_eq!(local["k"].value.as_deref(), Some(b"4".as_slice()));
    }
}
