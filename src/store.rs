//! Backing storage contract for trie nodes.
//!
//! Storage is an opaque content-addressed map: 32-byte Keccak digest to
//! encoded node. The engine only ever inserts; nodes reachable from an old
//! root therefore stay readable after later writes, which is what makes
//! reopening a trie at a prior root cheap.

use std::collections::HashMap;

use ethers::types::H256;

/// A content-addressed blob store holding encoded trie nodes.
///
/// Writing the same digest twice is harmless (the value is identical by
/// construction). No removal and no iteration are required.
pub trait TrieStorage {
    /// Returns the encoded node stored under `digest`, if any.
    fn get(&self, digest: &H256) -> Option<Vec<u8>>;

    /// Stores an encoded node under its digest.
    fn set(&mut self, digest: H256, encoded: Vec<u8>);
}

/// In-memory node store.
pub type MemoryStorage = HashMap<H256, Vec<u8>>;

impl TrieStorage for HashMap<H256, Vec<u8>> {
    fn get(&self, digest: &H256) -> Option<Vec<u8>> {
        HashMap::get(self, digest).cloned()
    }

    fn set(&mut self, digest: H256, encoded: Vec<u8>) {
        self.insert(digest, encoded);
    }
}
