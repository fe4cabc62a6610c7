//! Ternary Merkle tree over HLC physical time.
//!
//! Keys are the base-3 digits of "minutes since epoch" derived from an HLC's
//! millisecond timestamp. Every node aggregates a rolling XOR of the hashes
//! of every HLC inserted into its subtree, which makes insertion order
//! irrelevant (XOR is commutative and associative) and lets two trees be
//! compared level-by-level to find the earliest point of divergence without
//! walking either tree in full.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::hlc::Hlc;

/// One minute, in milliseconds; the unit of the base-3 path.
pub const MINUTE_MS: i64 = 60_000;
/// Longest legal path: covers minutes-since-epoch through the year 2215.
pub const MAX_PATH_LEN: usize = 17;

/// A child digit: `'0'`, `'1'`, or `'2'`.
pub type Digit = char;

const DIGITS: [Digit; 3] = ['0', '1', '2'];

/// A node in the tree: its aggregate hash and up to three children.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleNode {
    pub hash: u32,
    #[serde(flatten)]
    pub children: BTreeMap<Digit, MerkleNode>,
}

impl MerkleNode {
    fn child(&self, d: Digit) -> MerkleNode {
        self.children.get(&d).cloned().unwrap_or_default()
    }

    /// Rejects any child keyed outside `{'0', '1', '2'}` (§6: "no keys other
    /// than `hash`, `"0"`, `"1"`, `"2"` are permitted"), recursively.
    fn validate(&self) -> Result<()> {
        for (digit, child) in &self.children {
            if !DIGITS.contains(digit) {
                return Err(Error::InvalidMerkle(format!(
                    "merkle node has non-ternary child key '{digit}'"
                )));
            }
            child.validate()?;
        }
        Ok(())
    }
}

/// The tree itself. Wraps a root [`MerkleNode`] and the insertion logic; the
/// wire form is exactly the root node's serialization.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleTree {
    #[serde(flatten)]
    pub root: MerkleNode,
}

/// Computes the base-3 path for the minute containing `millis`.
///
/// Fails with [`Error::InvalidMerkle`] if the minute count does not fit in
/// [`MAX_PATH_LEN`] base-3 digits (i.e. beyond the year 2215) or is negative.
pub fn path_for_millis(millis: i64) -> Result<String> {
    if millis < 0 {
        return Err(Error::InvalidMerkle(format!(
            "negative millis cannot be converted to a merkle path: {millis}"
        )));
    }
    let minutes = millis / MINUTE_MS;
    path_for_minutes(minutes)
}

fn path_for_minutes(minutes: i64) -> Result<String> {
    if minutes < 0 || minutes >= 3i64.pow(MAX_PATH_LEN as u32) {
        return Err(Error::InvalidMerkle(format!(
            "minutes-since-epoch out of representable range: {minutes}"
        )));
    }
    if minutes == 0 {
        return Ok(String::new());
    }
    let mut digits = Vec::new();
    let mut n = minutes;
    while n > 0 {
        digits.push(DIGITS[(n % 3) as usize]);
        n /= 3;
    }
    digits.reverse();
    Ok(digits.into_iter().collect())
}

/// Converts a tree path back to milliseconds by right-padding to
/// [`MAX_PATH_LEN`] digits with `'0'`, parsing as base 3, and scaling to
/// milliseconds.
pub fn path_to_millis(path: &str) -> Result<i64> {
    if path.len() > MAX_PATH_LEN {
        return Err(Error::InvalidMerkle(format!(
            "merkle path longer than {MAX_PATH_LEN} digits: '{path}'"
        )));
    }
    let mut padded = path.to_string();
    padded.extend(std::iter::repeat('0').take(MAX_PATH_LEN - path.len()));

    let mut minutes: i64 = 0;
    for c in padded.chars() {
        let d = c.to_digit(3).ok_or_else(|| {
            Error::InvalidMerkle(format!("merkle path contains non-ternary digit: '{path}'"))
        })? as i64;
        minutes = minutes * 3 + d;
    }
    Ok(minutes * MINUTE_MS)
}

impl MerkleTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates the full tree shape against §6: every node's children must
    /// be keyed only by `'0'`, `'1'`, `'2'`.
    pub fn validate(&self) -> Result<()> {
        self.root.validate()
    }

    /// Inserts an HLC's hash at the path derived from its physical time.
    /// Callers must not insert the same `(time, hash)` twice: doing so XORs
    /// the hash back out and silently loses the entry.
    pub fn insert(&mut self, hlc: &Hlc, hash: u32) -> Result<()> {
        let path = path_for_millis(hlc.millis)?;
        self.root.hash ^= hash;
        let mut node = &mut self.root;
        for d in path.chars() {
            node = node.children.entry(d).or_default();
            node.hash ^= hash;
        }
        Ok(())
    }

    /// Structural diff: the path at which `self` and `other` first disagree,
    /// or `None` if their full hash sets agree.
    pub fn find_diff(&self, other: &MerkleTree) -> Option<String> {
        if self.root.hash == other.root.hash {
            return None;
        }
        find_diff_owned(self.root.clone(), other.root.clone(), String::new())
    }

    /// Approximate upper-bound time on everything summarized by this tree:
    /// the path obtained by always choosing the greatest present child key.
    pub fn path_to_newest_leaf(&self) -> String {
        let mut path = String::new();
        let mut node = &self.root;
        loop {
            match node.children.keys().max() {
                None => return path,
                Some(&k) => {
                    path.push(k);
                    node = &node.children[&k];
                }
            }
        }
    }

    pub fn newest_leaf_millis(&self) -> Result<i64> {
        path_to_millis(&self.path_to_newest_leaf())
    }
}

fn find_diff_owned(mut a: MerkleNode, mut b: MerkleNode, mut path: String) -> Option<String> {
    loop {
        let mut keys: Vec<Digit> = a.children.keys().chain(b.children.keys()).copied().collect();
        keys.sort_unstable();
        keys.dedup();

        let mut next: Option<(Digit, MerkleNode, MerkleNode)> = None;
        for k in keys {
            let ac = a.child(k);
            let bc = b.child(k);
            if ac.hash != bc.hash {
                next = Some((k, ac, bc));
                break;
            }
        }
        match next {
            None => return Some(path),
            Some((k, ac, bc)) => {
                path.push(k);
                if ac.children.is_empty() && bc.children.is_empty() {
                    return Some(path);
                }
                a = ac;
                b = bc;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hlc_at_minute(minute: i64, node: &str) -> Hlc {
        Hlc::new(minute * MINUTE_MS, 0, node)
    }

    #[test]
    fn insert_is_commutative() {
        let node = "n".repeat(16);
        let entries: Vec<(Hlc, u32)> = (0..20)
            .map(|m| (hlc_at_minute(m, &node), (m as u32) * 7919 + 1))
            .collect();

        let mut forward = MerkleTree::new();
        for (hlc, h) in &entries {
            forward.insert(hlc, *h).unwrap();
        }

        let mut reversed = MerkleTree::new();
        for (hlc, h) in entries.iter().rev() {
            reversed.insert(hlc, *h).unwrap();
        }

        assert_eq!(forward.root.hash, reversed.root.hash);
        assert_eq!(forward, reversed);
    }

    #[test]
    fn identical_trees_have_no_diff() {
        let node = "n".repeat(16);
        let mut a = MerkleTree::new();
        let mut b = MerkleTree::new();
        for m in 0..=10 {
            let hlc = hlc_at_minute(m, &node);
            let h = hlc.hash();
            a.insert(&hlc, h).unwrap();
            b.insert(&hlc, h).unwrap();
        }
        assert_eq!(a.find_diff(&b), None);
    }

    #[test]
    fn s6_merkle_diff_at_minute_twelve() {
        let node = "n".repeat(16);
        let mut a = MerkleTree::new();
        let mut b = MerkleTree::new();
        for m in 0..=10 {
            let hlc = hlc_at_minute(m, &node);
            let h = hlc.hash();
            a.insert(&hlc, h).unwrap();
            b.insert(&hlc, h).unwrap();
        }

        let a_only = hlc_at_minute(12, &"aaaaaaaaaaaaaaaa".to_string());
        a.insert(&a_only, a_only.hash()).unwrap();

        let b_only_12 = hlc_at_minute(12, &"bbbbbbbbbbbbbbbb".to_string());
        b.insert(&b_only_12, b_only_12.hash()).unwrap();
        let b_only_15 = hlc_at_minute(15, &"bbbbbbbbbbbbbbbb".to_string());
        b.insert(&b_only_15, b_only_15.hash()).unwrap();

        let diff_path = a.find_diff(&b).expect("trees differ");
        let millis = path_to_millis(&diff_path).unwrap();
        assert_eq!(millis, 12 * MINUTE_MS);
    }

    #[test]
    fn path_round_trips_through_millis() {
        for minute in [0i64, 1, 2, 3, 26, 1_234_567] {
            let millis = minute * MINUTE_MS;
            let path = path_for_millis(millis).unwrap();
            let back = path_to_millis(&path).unwrap();
            assert_eq!(back, millis);
        }
    }

    #[test]
    fn newest_leaf_is_greatest_digit_at_each_level() {
        let node = "n".repeat(16);
        let mut tree = MerkleTree::new();
        for m in [1i64, 5, 2, 26] {
            let hlc = hlc_at_minute(m, &node);
            tree.insert(&hlc, hlc.hash()).unwrap();
        }
        let leaf_millis = tree.newest_leaf_millis().unwrap();
        assert!(leaf_millis >= 26 * MINUTE_MS);
    }
}
