//! Suffix tree over symbol and section names.
//!
//! Backs two features of the ELF model: linker-style suffix matching in
//! `find_symbol` (a short exported name may match the tail of a longer
//! mangled one, but only unambiguously), and string-table emission with
//! suffix sharing (".bss" stored inside ".rel.bss" rather than twice).
//!
//! Strings are stored reversed in a character trie, so "is `a` a suffix
//! of `b`" becomes the prefix question the trie answers directly.

use std::collections::HashMap;

#[derive(Debug)]
struct Node {
    children: HashMap<u8, usize>,
    terminal: bool,
}

impl Node {
    fn new() -> Self {
        Node { children: HashMap::new(), terminal: false }
    }
}

/// Result of a suffix lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SuffixMatch {
    None,
    /// Exactly one inserted string has this suffix.
    Unique(String),
    /// More than one inserted string shares this suffix.
    Ambiguous,
}

#[derive(Debug)]
pub struct SuffixTree {
    nodes: Vec<Node>,
    count: usize,
}

impl Default for SuffixTree {
    fn default() -> Self {
        Self::new()
    }
}

impl SuffixTree {
    pub fn new() -> Self {
        SuffixTree { nodes: vec![Node::new()], count: 0 }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Insert a string. Returns false if it was already present.
    pub fn insert(&mut self, s: &str) -> bool {
        let mut node = 0;
        for &b in s.as_bytes().iter().rev() {
            node = match self.nodes[node].children.get(&b) {
                Some(&next) => next,
                None => {
                    let next = self.nodes.len();
                    self.nodes.push(Node::new());
                    self.nodes[node].children.insert(b, next);
                    next
                }
            };
        }
        if self.nodes[node].terminal {
            return false;
        }
        self.nodes[node].terminal = true;
        self.count += 1;
        true
    }

    /// Remove a string. Returns false if it was not present.
    pub fn remove(&mut self, s: &str) -> bool {
        let mut path = vec![0usize];
        let mut node = 0;
        for &b in s.as_bytes().iter().rev() {
            match self.nodes[node].children.get(&b) {
                Some(&next) => {
                    node = next;
                    path.push(next);
                }
                None => return false,
            }
        }
        if !self.nodes[node].terminal {
            return false;
        }
        self.nodes[node].terminal = false;
        self.count -= 1;
        // Trim now-dead tail nodes so leaf enumeration stays accurate.
        let bytes = s.as_bytes();
        for i in (1..path.len()).rev() {
            let id = path[i];
            if self.nodes[id].terminal || !self.nodes[id].children.is_empty() {
                break;
            }
            let parent = path[i - 1];
            let b = bytes[bytes.len() - i];
            self.nodes[parent].children.remove(&b);
        }
        true
    }

    pub fn contains(&self, s: &str) -> bool {
        match self.walk(s) {
            Some(node) => self.nodes[node].terminal,
            None => false,
        }
    }

    /// Look up all inserted strings ending in `suffix`.
    pub fn find_suffix(&self, suffix: &str) -> SuffixMatch {
        let node = match self.walk(suffix) {
            Some(n) => n,
            None => return SuffixMatch::None,
        };
        let mut matches = Vec::new();
        let mut rev_prefix: Vec<u8> = suffix.bytes().rev().collect();
        self.collect(node, &mut rev_prefix, &mut matches, 2);
        match matches.len() {
            0 => SuffixMatch::None,
            1 => SuffixMatch::Unique(matches.pop().unwrap()),
            _ => SuffixMatch::Ambiguous,
        }
    }

    /// All inserted strings, in unspecified order.
    pub fn strings(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect(0, &mut Vec::new(), &mut out, usize::MAX);
        out
    }

    /// Emit a NUL-terminated string table with suffix sharing: a string that
    /// is a suffix of another occupies the tail of the longer string's bytes.
    /// Offset 0 holds the conventional leading NUL / empty string.
    pub fn to_string_table(&self) -> (Vec<u8>, HashMap<String, u32>) {
        let mut table = vec![0u8];
        let mut leaves: Vec<String> = Vec::new();
        self.collect_leaves(0, &mut Vec::new(), &mut leaves);

        let mut leaf_offsets: Vec<(String, u32)> = Vec::new();
        for leaf in &leaves {
            let offset = table.len() as u32;
            table.extend_from_slice(leaf.as_bytes());
            table.push(0);
            leaf_offsets.push((leaf.clone(), offset));
        }

        let mut offsets = HashMap::new();
        for s in self.strings() {
            if s.is_empty() {
                offsets.insert(s, 0);
                continue;
            }
            for (leaf, leaf_off) in &leaf_offsets {
                if leaf.ends_with(&s) {
                    offsets.insert(s.clone(), leaf_off + (leaf.len() - s.len()) as u32);
                    break;
                }
            }
        }
        (table, offsets)
    }

    fn walk(&self, s: &str) -> Option<usize> {
        let mut node = 0;
        for &b in s.as_bytes().iter().rev() {
            node = *self.nodes[node].children.get(&b)?;
        }
        Some(node)
    }

    /// Collect up to `limit` terminal strings in the subtree rooted at `node`,
    /// whose reversed path so far is `rev_prefix`.
    fn collect(&self, node: usize, rev_prefix: &mut Vec<u8>, out: &mut Vec<String>, limit: usize) {
        if out.len() >= limit {
            return;
        }
        if self.nodes[node].terminal {
            let s: Vec<u8> = rev_prefix.iter().rev().copied().collect();
            out.push(String::from_utf8_lossy(&s).into_owned());
        }
        let mut keys: Vec<u8> = self.nodes[node].children.keys().copied().collect();
        keys.sort_unstable();
        for b in keys {
            let child = self.nodes[node].children[&b];
            rev_prefix.push(b);
            self.collect(child, rev_prefix, out, limit);
            rev_prefix.pop();
        }
    }

    /// Leaves of the trie are exactly the strings not a suffix of any other.
    fn collect_leaves(&self, node: usize, rev_prefix: &mut Vec<u8>, out: &mut Vec<String>) {
        if self.nodes[node].children.is_empty() {
            if self.nodes[node].terminal {
                let s: Vec<u8> = rev_prefix.iter().rev().copied().collect();
                out.push(String::from_utf8_lossy(&s).into_owned());
            }
            return;
        }
        let mut keys: Vec<u8> = self.nodes[node].children.keys().copied().collect();
        keys.sort_unstable();
        for b in keys {
            let child = self.nodes[node].children[&b];
            rev_prefix.push(b);
            self.collect_leaves(child, rev_prefix, out);
            rev_prefix.pop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_contains_remove() {
        let mut t = SuffixTree::new();
        assert!(t.insert(".text"));
        assert!(!t.insert(".text"));
        assert!(t.insert(".data"));
        assert!(t.contains(".text"));
        assert!(!t.contains(".tex"));
        assert!(t.remove(".text"));
        assert!(!t.remove(".text"));
        assert!(!t.contains(".text"));
        assert!(t.contains(".data"));
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn suffix_lookup_unique_and_ambiguous() {
        let mut t = SuffixTree::new();
        t.insert("_ZN4kernel5startEv");
        t.insert("main");
        assert_eq!(
            t.find_suffix("startEv"),
            SuffixMatch::Unique("_ZN4kernel5startEv".into())
        );
        assert_eq!(t.find_suffix("missing"), SuffixMatch::None);
        t.insert("restartEv");
        assert_eq!(t.find_suffix("startEv"), SuffixMatch::Ambiguous);
        // Exact strings still resolve through contains()
        assert!(t.contains("restartEv"));
    }

    #[test]
    fn string_table_shares_suffixes() {
        let mut t = SuffixTree::new();
        t.insert(".bss");
        t.insert(".rel.bss");
        t.insert(".text");
        let (table, offsets) = t.to_string_table();
        // ".bss" must live inside ".rel.bss"
        let rel = offsets[".rel.bss"] as usize;
        let bss = offsets[".bss"] as usize;
        assert_eq!(bss, rel + 4);
        assert_eq!(table[0], 0);
        for (s, &off) in [".bss", ".rel.bss", ".text"].iter().zip(
            [&offsets[".bss"], &offsets[".rel.bss"], &offsets[".text"]].iter(),
        ) {
            let off = *off as usize;
            assert_eq!(&table[off..off + s.len()], s.as_bytes());
            assert_eq!(table[off + s.len()], 0);
        }
    }
}
