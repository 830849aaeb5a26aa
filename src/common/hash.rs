//! Hashing utilities for clustermon
//!
//! - BLAKE3 for service config checksums
//! - HRW (Highest Random Weight) for the `spread` placement policy

/// Compute BLAKE3 hash of data, return hex string
pub fn blake3_hash(data: &[u8]) -> String {
    let hash = blake3::hash(data);
    format!("{}", hash)
}

/// HRW weight of `node` for `key`
pub fn hrw_weight(key: &str, node: &str) -> u64 {
    let combined = format!("{}{}", key, node);
    let hash = blake3::hash(combined.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&hash.as_bytes()[0..8]);
    u64::from_le_bytes(bytes)
}

/// HRW (Highest Random Weight) hashing
///
/// Given a key and a set of nodes, returns nodes sorted by their weight
/// (deterministic based on key). Equal weights fall back to the node name.
pub fn hrw_hash(key: &str, nodes: &[String]) -> Vec<String> {
    let mut weights: Vec<(String, u64)> = nodes
        .iter()
        .map(|node| (node.clone(), hrw_weight(key, node)))
        .collect();

    weights.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

    weights.into_iter().map(|(node, _)| node).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blake3_hash() {
        let hash = blake3_hash(b"hello world");
        assert_eq!(hash.len(), 64);
        assert_eq!(hash, blake3_hash(b"hello world"));
    }

    #[test]
    fn test_hrw_hash_consistent() {
        let nodes = vec!["node1".to_string(), "node2".to_string(), "node3".to_string()];
        let mut reversed = nodes.clone();
        reversed.reverse();

        let sorted1 = hrw_hash("ns/svc/web", &nodes);
        let sorted2 = hrw_hash("ns/svc/web", &reversed);

        assert_eq!(sorted1, sorted2);
        assert_eq!(sorted1.len(), 3);
    }
}
