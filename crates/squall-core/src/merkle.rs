//! Merkle prefix tree for anti-entropy.
//!
//! Each CRDT map maintains a tree of record hashes bucketed by the leading
//! hex digits of the key's FNV-1a hash. Two replicas compare root hashes;
//! on mismatch they descend level by level (16 children per node) until the
//! differing leaf buckets are found, then exchange only the keys in those
//! buckets. Bucket hashes are XOR accumulators, so they are independent of
//! insertion order: replicas holding the same records always agree.

use std::collections::{BTreeMap, HashMap};

use crate::hash::{fnv1a, mix};

/// Default trie depth: 3 hex digits, up to 4096 leaf buckets.
pub const DEFAULT_DEPTH: usize = 3;

const HEX: &[u8; 16] = b"0123456789abcdef";

/// Order-independent Merkle prefix tree over `(key, record_hash)` pairs.
#[derive(Debug, Clone)]
pub struct MerkleTree {
    depth: usize,
    /// Leaf bucket path (exactly `depth` hex digits) -> key -> mixed record hash.
    buckets: HashMap<String, HashMap<String, u32>>,
}

impl MerkleTree {
    /// Creates an empty tree with the given trie depth (1..=8).
    ///
    /// # Panics
    ///
    /// Panics if `depth` is zero or exceeds the 8 hex digits of a 32-bit hash.
    #[must_use]
    pub fn new(depth: usize) -> Self {
        assert!((1..=8).contains(&depth), "merkle depth must be in 1..=8");
        Self { depth, buckets: HashMap::new() }
    }

    /// Creates an empty tree with [`DEFAULT_DEPTH`].
    #[must_use]
    pub fn default_depth() -> Self {
        Self::new(DEFAULT_DEPTH)
    }

    /// The trie depth in hex digits.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// The leaf bucket path for a key: the first `depth` hex digits of its hash.
    #[must_use]
    pub fn bucket_path(&self, key: &str) -> String {
        let hash = fnv1a(key);
        let mut path = String::with_capacity(self.depth);
        for i in 0..self.depth {
            let nibble = (hash >> (28 - 4 * i)) & 0xF;
            path.push(HEX[nibble as usize] as char);
        }
        path
    }

    /// Inserts or replaces the hash tracked for `key`.
    pub fn update(&mut self, key: &str, record_hash: u32) {
        let path = self.bucket_path(key);
        self.buckets
            .entry(path)
            .or_default()
            .insert(key.to_string(), record_hash);
    }

    /// Stops tracking `key`. No-op when the key is absent.
    pub fn remove(&mut self, key: &str) {
        let path = self.bucket_path(key);
        if let Some(bucket) = self.buckets.get_mut(&path) {
            bucket.remove(key);
            if bucket.is_empty() {
                self.buckets.remove(&path);
            }
        }
    }

    /// Number of tracked keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buckets.values().map(HashMap::len).sum()
    }

    /// Whether no keys are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Root hash over the whole tree; `0` for an empty tree.
    ///
    /// Replicas holding identical `(key, record_hash)` sets produce identical
    /// root hashes regardless of mutation order.
    #[must_use]
    pub fn root_hash(&self) -> u32 {
        self.buckets
            .values()
            .fold(0, |acc, bucket| acc ^ Self::bucket_hash(bucket))
    }

    /// Hashes of the 16 children under `prefix`, keyed by the next hex digit.
    ///
    /// Children with no content are omitted. An empty prefix yields the top
    /// level of the tree. Returns `None` when `prefix` is already leaf-deep
    /// or contains non-hex characters.
    #[must_use]
    pub fn child_hashes(&self, prefix: &str) -> Option<BTreeMap<String, u32>> {
        if prefix.len() >= self.depth || !is_hex(prefix) {
            return None;
        }
        let mut children: BTreeMap<String, u32> = BTreeMap::new();
        for (path, bucket) in &self.buckets {
            if let Some(rest) = path.strip_prefix(prefix) {
                let digit = &rest[..1];
                let entry = children.entry(digit.to_string()).or_insert(0);
                *entry ^= Self::bucket_hash(bucket);
            }
        }
        Some(children)
    }

    /// All tracked keys whose bucket path starts with `prefix`.
    ///
    /// With a full-depth prefix this is exactly the contents of one leaf
    /// bucket, which is what a sync responder ships when the descent reaches
    /// leaf level.
    #[must_use]
    pub fn keys_under(&self, prefix: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .buckets
            .iter()
            .filter(|(path, _)| path.starts_with(prefix))
            .flat_map(|(_, bucket)| bucket.keys().cloned())
            .collect();
        keys.sort_unstable();
        keys
    }

    fn bucket_hash(bucket: &HashMap<String, u32>) -> u32 {
        bucket
            .iter()
            .fold(0, |acc, (key, hash)| acc ^ mix(fnv1a(key) ^ mix(*hash)))
    }
}

impl Default for MerkleTree {
    fn default() -> Self {
        Self::default_depth()
    }
}

fn is_hex(s: &str) -> bool {
    s.bytes().all(|b| b.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(pairs: &[(&str, u32)]) -> MerkleTree {
        let mut tree = MerkleTree::default_depth();
        for (key, hash) in pairs {
            tree.update(key, *hash);
        }
        tree
    }

    #[test]
    fn empty_tree_has_zero_root() {
        assert_eq!(MerkleTree::default_depth().root_hash(), 0);
        assert!(MerkleTree::default_depth().is_empty());
    }

    #[test]
    fn update_changes_root() {
        let mut tree = MerkleTree::default_depth();
        tree.update("alpha", 1);
        let first = tree.root_hash();
        assert_ne!(first, 0);
        tree.update("alpha", 2);
        assert_ne!(tree.root_hash(), first);
    }

    #[test]
    fn remove_restores_previous_root() {
        let mut tree = filled(&[("alpha", 1), ("beta", 2)]);
        let with_both = tree.root_hash();
        tree.update("gamma", 3);
        assert_ne!(tree.root_hash(), with_both);
        tree.remove("gamma");
        assert_eq!(tree.root_hash(), with_both);
    }

    #[test]
    fn root_is_order_independent() {
        let forward = filled(&[("a", 10), ("b", 20), ("c", 30)]);
        let reverse = filled(&[("c", 30), ("b", 20), ("a", 10)]);
        assert_eq!(forward.root_hash(), reverse.root_hash());
    }

    #[test]
    fn identical_contents_identical_roots() {
        let pairs: Vec<(String, u32)> =
            (0..200).map(|i| (format!("key-{i}"), i * 7 + 1)).collect();
        let mut one = MerkleTree::default_depth();
        let mut two = MerkleTree::default_depth();
        for (key, hash) in &pairs {
            one.update(key, *hash);
        }
        for (key, hash) in pairs.iter().rev() {
            two.update(key, *hash);
        }
        assert_eq!(one.root_hash(), two.root_hash());
        assert_eq!(one.len(), two.len());
    }

    #[test]
    fn bucket_path_is_hash_prefix() {
        let tree = MerkleTree::default_depth();
        let path = tree.bucket_path("hello");
        assert_eq!(path.len(), 3);
        let expected = format!("{:08x}", fnv1a("hello"));
        assert_eq!(path, expected[..3]);
    }

    #[test]
    fn child_hashes_partition_the_root() {
        let tree = filled(&[("a", 1), ("b", 2), ("c", 3), ("d", 4), ("e", 5)]);
        let children = tree.child_hashes("").unwrap();
        let folded = children.values().fold(0, |acc, h| acc ^ h);
        assert_eq!(folded, tree.root_hash());
    }

    #[test]
    fn child_hashes_rejects_leaf_depth_and_junk() {
        let tree = filled(&[("a", 1)]);
        assert!(tree.child_hashes("abc").is_none());
        assert!(tree.child_hashes("zz").is_none());
    }

    #[test]
    fn descent_locates_a_divergent_key() {
        let mut ours = filled(&[("a", 1), ("b", 2), ("c", 3)]);
        let theirs = ours.clone();
        ours.update("c", 99);
        assert_ne!(ours.root_hash(), theirs.root_hash());

        // Walk down one level at a time following hash mismatches.
        let mut prefix = String::new();
        while prefix.len() < ours.depth() {
            let mine = ours.child_hashes(&prefix).unwrap();
            let other = theirs.child_hashes(&prefix).unwrap();
            let divergent = mine
                .iter()
                .find(|(digit, hash)| other.get(*digit) != Some(hash))
                .map(|(digit, _)| digit.clone())
                .expect("some child must diverge");
            prefix.push_str(&divergent);
        }
        assert_eq!(ours.keys_under(&prefix), vec!["c".to_string()]);
    }

    #[test]
    fn keys_under_empty_prefix_lists_everything() {
        let tree = filled(&[("x", 1), ("y", 2)]);
        assert_eq!(tree.keys_under(""), vec!["x".to_string(), "y".to_string()]);
    }

    #[test]
    #[should_panic(expected = "merkle depth")]
    fn zero_depth_panics() {
        let _ = MerkleTree::new(0);
    }
}
