//! The trie engine: authenticated key-value reads and writes over a
//! content-addressed node store.
//!
//! Every edit rebuilds the nodes along the touched path, so each persisted
//! node is immutable once referenced and the root reference commits to the
//! entire contents. Edits keep the structure canonical: no extension with a
//! redundant child, no branch with fewer than two useful members (a branch's
//! own value counts as one). Canonical form is what makes the root hash a
//! pure function of the key-value set, independent of insertion order.

use ethers::{types::H256, utils::keccak256};
use log::debug;
use thiserror::Error;

use crate::{
    node::{Node, NodeError, NodeRef},
    path::{NibblePath, PathError},
    store::TrieStorage,
    utils::hex_encode,
};

/// Root hash of the empty trie: `keccak256(rlp(""))`.
pub const EMPTY_TRIE_ROOT: H256 = H256([
    0x56, 0xe8, 0x1f, 0x17, 0x1b, 0xcc, 0x55, 0xa6, 0xff, 0x83, 0x45, 0xe6, 0x92, 0xc0, 0xf8,
    0x6e, 0x5b, 0x48, 0xe0, 0x1b, 0x99, 0x6c, 0xad, 0xc0, 0x01, 0x62, 0x2f, 0xb5, 0xe3, 0x63,
    0xb4, 0x21,
]);

#[derive(Debug, Error, Eq, PartialEq)]
pub enum TrieError {
    #[error("Key is not present in the trie")]
    KeyNotFound,
    #[error("Value must not be empty, remove keys with delete")]
    EmptyValue,
    #[error("Node {0} is referenced but missing from storage")]
    MissingNode(String),
    #[error("Node error {0}")]
    NodeError(#[from] NodeError),
    #[error("Trie path error {0}")]
    PathError(#[from] PathError),
}

/// What became of a subtree after deleting inside it, reported upward.
enum DeleteOutcome {
    /// The subtree is gone; the parent drops its reference to it.
    Deleted,
    /// The subtree kept its shape under a new reference.
    Updated(NodeRef),
    /// The subtree was a branch that collapsed into a single successor.
    /// `node_ref` is a complete node whose leading nibbles are `path`; a
    /// branch parent splices the reference straight into a slot, an
    /// extension parent merges paths first.
    UselessBranch { path: NibblePath, node_ref: NodeRef },
}

/// A Merkle Patricia Trie bound to a backing node store.
///
/// The trie owns its root reference and borrows the store for its own
/// lifetime. Opening a second trie at a previously captured root over the
/// same store reads a consistent historical snapshot, because edits never
/// remove nodes.
pub struct MerklePatriciaTrie<'db, S: TrieStorage> {
    storage: &'db mut S,
    root: NodeRef,
    secure: bool,
}

impl<'db, S: TrieStorage> MerklePatriciaTrie<'db, S> {
    /// An empty trie over the given store.
    pub fn new(storage: &'db mut S) -> Self {
        MerklePatriciaTrie {
            storage,
            root: NodeRef::empty(),
            secure: false,
        }
    }

    /// Opens a trie at a previously captured root reference.
    pub fn open(storage: &'db mut S, root: NodeRef) -> Self {
        MerklePatriciaTrie {
            storage,
            root,
            secure: false,
        }
    }

    /// Switches the trie to secure mode: every key is replaced by its
    /// Keccak-256 digest before any traversal. Key length becomes uniform
    /// and unbounded-key attacks on trie depth are off the table, at the
    /// cost of a root hash that differs from the plain-keyed trie.
    pub fn secured(mut self) -> Self {
        self.secure = true;
        self
    }

    /// The current root reference. Inline (shorter than 32 bytes) for very
    /// small tries, a digest otherwise, empty for the empty trie.
    pub fn root(&self) -> &NodeRef {
        &self.root
    }

    /// The 32-byte commitment to the trie contents.
    pub fn root_hash(&self) -> H256 {
        if self.root.is_empty() {
            EMPTY_TRIE_ROOT
        } else if self.root.is_hash() {
            self.root.to_digest()
        } else {
            H256::from(keccak256(self.root.as_bytes()))
        }
    }

    /// Returns the value stored under `key`.
    pub fn get(&self, key: &[u8]) -> Result<Vec<u8>, TrieError> {
        if self.root.is_empty() {
            return Err(TrieError::KeyNotFound);
        }
        let root = self.root.clone();
        self.get_at(&root, self.path_for_key(key))
    }

    /// Inserts or replaces the value under `key`.
    ///
    /// Empty values are rejected; a key is removed with [`Self::delete`].
    pub fn update(&mut self, key: &[u8], value: &[u8]) -> Result<(), TrieError> {
        if value.is_empty() {
            return Err(TrieError::EmptyValue);
        }
        let path = self.path_for_key(key);
        let root = self.root.clone();
        let new_root = self.insert_at(&root, path, value.to_vec())?;
        self.root = new_root;
        Ok(())
    }

    /// Removes `key` from the trie.
    ///
    /// Deleting from an empty trie is a no-op; deleting a key the trie does
    /// not hold is [`TrieError::KeyNotFound`]. Either way the trie is
    /// unchanged on error.
    pub fn delete(&mut self, key: &[u8]) -> Result<(), TrieError> {
        if self.root.is_empty() {
            return Ok(());
        }
        let path = self.path_for_key(key);
        let root = self.root.clone();
        self.root = match self.delete_at(&root, path)? {
            DeleteOutcome::Deleted => NodeRef::empty(),
            DeleteOutcome::Updated(node_ref) => node_ref,
            DeleteOutcome::UselessBranch { node_ref, .. } => node_ref,
        };
        Ok(())
    }

    fn path_for_key(&self, key: &[u8]) -> NibblePath {
        if self.secure {
            NibblePath::from_bytes(&keccak256(key))
        } else {
            NibblePath::from_bytes(key)
        }
    }

    /// Reads the node behind a reference: a storage lookup for digests, a
    /// direct decode for inline references. A digest absent from storage
    /// means the store lost data that some reachable root still points at.
    fn resolve_node(&self, reference: &NodeRef) -> Result<Node, TrieError> {
        if reference.is_hash() {
            let digest = reference.to_digest();
            let encoded = self
                .storage
                .get(&digest)
                .ok_or_else(|| TrieError::MissingNode(hex_encode(digest)))?;
            Ok(Node::decode(&encoded)?)
        } else {
            Ok(Node::decode(reference.as_bytes())?)
        }
    }

    /// Encodes a node and returns its reference, writing to storage only
    /// when the reference is a digest. Inline-referenced nodes live inside
    /// their parent's encoding and are never written.
    fn persist_node(&mut self, node: &Node) -> NodeRef {
        let encoded = node.encode();
        let reference = NodeRef::from_encoding(&encoded);
        if reference.is_hash() {
            self.storage.set(reference.to_digest(), encoded);
        }
        reference
    }

    fn get_at(&self, reference: &NodeRef, path: NibblePath) -> Result<Vec<u8>, TrieError> {
        match self.resolve_node(reference)? {
            Node::Leaf {
                path: leaf_path,
                value,
            } => {
                if leaf_path == path {
                    Ok(value)
                } else {
                    Err(TrieError::KeyNotFound)
                }
            }
            Node::Extension {
                path: ext_path,
                next,
            } => {
                if path.starts_with(&ext_path) {
                    self.get_at(&next, path.consume(ext_path.len()))
                } else {
                    Err(TrieError::KeyNotFound)
                }
            }
            Node::Branch { children, value } => {
                if path.is_empty() {
                    if value.is_empty() {
                        Err(TrieError::KeyNotFound)
                    } else {
                        Ok(value)
                    }
                } else {
                    let child = &children[path.at(0)? as usize];
                    if child.is_empty() {
                        Err(TrieError::KeyNotFound)
                    } else {
                        self.get_at(child, path.consume(1))
                    }
                }
            }
        }
    }

    /// Recursive insert. Returns the reference of the rebuilt subtree for
    /// the caller to adopt.
    fn insert_at(
        &mut self,
        reference: &NodeRef,
        path: NibblePath,
        value: Vec<u8>,
    ) -> Result<NodeRef, TrieError> {
        if reference.is_empty() {
            return Ok(self.persist_node(&Node::Leaf { path, value }));
        }
        match self.resolve_node(reference)? {
            Node::Leaf {
                path: leaf_path,
                value: leaf_value,
            } => self.insert_into_leaf(path, value, leaf_path, leaf_value),
            Node::Extension {
                path: ext_path,
                next,
            } => self.insert_into_extension(path, value, ext_path, next),
            Node::Branch {
                mut children,
                value: branch_value,
            } => {
                if path.is_empty() {
                    // The key ends exactly here.
                    Ok(self.persist_node(&Node::Branch { children, value }))
                } else {
                    let slot = path.at(0)? as usize;
                    let child = children[slot].clone();
                    children[slot] = self.insert_at(&child, path.consume(1), value)?;
                    Ok(self.persist_node(&Node::Branch {
                        children,
                        value: branch_value,
                    }))
                }
            }
        }
    }

    /// Replaces an equal-path leaf, otherwise splits it: both remainders
    /// hang off a fresh branch (the one that ran out of nibbles becomes the
    /// branch value), under an extension when a prefix was shared.
    fn insert_into_leaf(
        &mut self,
        path: NibblePath,
        value: Vec<u8>,
        leaf_path: NibblePath,
        leaf_value: Vec<u8>,
    ) -> Result<NodeRef, TrieError> {
        if leaf_path == path {
            return Ok(self.persist_node(&Node::Leaf { path, value }));
        }

        let common = path.common_prefix(&leaf_path);
        debug!("splitting leaf, {} shared nibbles", common.len());
        let path = path.consume(common.len());
        let leaf_path = leaf_path.consume(common.len());

        let mut children: [NodeRef; 16] = Default::default();
        let mut branch_value = Vec::new();
        if path.is_empty() {
            branch_value = value;
        } else {
            let slot = path.at(0)? as usize;
            let leaf = Node::Leaf {
                path: path.consume(1),
                value,
            };
            children[slot] = self.persist_node(&leaf);
        }
        if leaf_path.is_empty() {
            branch_value = leaf_value;
        } else {
            let slot = leaf_path.at(0)? as usize;
            let leaf = Node::Leaf {
                path: leaf_path.consume(1),
                value: leaf_value,
            };
            children[slot] = self.persist_node(&leaf);
        }

        let branch_ref = self.persist_node(&Node::Branch {
            children,
            value: branch_value,
        });
        if common.is_empty() {
            Ok(branch_ref)
        } else {
            Ok(self.persist_node(&Node::Extension {
                path: common,
                next: branch_ref,
            }))
        }
    }

    /// Descends through the extension on a prefix match, otherwise splits it
    /// at the divergence point. The unshared tail of the extension path
    /// keeps pointing at the old child: directly when a single nibble
    /// remains (the branch slot covers it), through a shortened extension
    /// otherwise.
    fn insert_into_extension(
        &mut self,
        path: NibblePath,
        value: Vec<u8>,
        ext_path: NibblePath,
        next: NodeRef,
    ) -> Result<NodeRef, TrieError> {
        if path.starts_with(&ext_path) {
            let new_next = self.insert_at(&next, path.consume(ext_path.len()), value)?;
            return Ok(self.persist_node(&Node::Extension {
                path: ext_path,
                next: new_next,
            }));
        }

        let common = path.common_prefix(&ext_path);
        debug!("splitting extension, {} shared nibbles", common.len());
        let path = path.consume(common.len());
        let remaining = ext_path.consume(common.len());

        let mut children: [NodeRef; 16] = Default::default();
        let mut branch_value = Vec::new();
        if path.is_empty() {
            branch_value = value;
        } else {
            let slot = path.at(0)? as usize;
            let leaf = Node::Leaf {
                path: path.consume(1),
                value,
            };
            children[slot] = self.persist_node(&leaf);
        }

        let slot = remaining.at(0)? as usize;
        children[slot] = if remaining.len() == 1 {
            next
        } else {
            self.persist_node(&Node::Extension {
                path: remaining.consume(1),
                next,
            })
        };

        let branch_ref = self.persist_node(&Node::Branch {
            children,
            value: branch_value,
        });
        if common.is_empty() {
            Ok(branch_ref)
        } else {
            Ok(self.persist_node(&Node::Extension {
                path: common,
                next: branch_ref,
            }))
        }
    }

    /// Recursive delete. Reports how the subtree changed so the caller can
    /// drop, relink or merge it.
    fn delete_at(
        &mut self,
        reference: &NodeRef,
        path: NibblePath,
    ) -> Result<DeleteOutcome, TrieError> {
        match self.resolve_node(reference)? {
            Node::Leaf {
                path: leaf_path, ..
            } => {
                if leaf_path == path {
                    Ok(DeleteOutcome::Deleted)
                } else {
                    Err(TrieError::KeyNotFound)
                }
            }
            Node::Extension {
                path: ext_path,
                next,
            } => self.delete_below_extension(path, ext_path, next),
            Node::Branch { children, value } => self.delete_below_branch(path, children, value),
        }
    }

    fn delete_below_extension(
        &mut self,
        path: NibblePath,
        ext_path: NibblePath,
        next: NodeRef,
    ) -> Result<DeleteOutcome, TrieError> {
        if !path.starts_with(&ext_path) {
            return Err(TrieError::KeyNotFound);
        }
        match self.delete_at(&next, path.consume(ext_path.len()))? {
            DeleteOutcome::Deleted => Ok(DeleteOutcome::Deleted),
            DeleteOutcome::Updated(child) => Ok(DeleteOutcome::Updated(self.persist_node(
                &Node::Extension {
                    path: ext_path,
                    next: child,
                },
            ))),
            DeleteOutcome::UselessBranch {
                path: child_path,
                node_ref,
            } => {
                // The collapsed successor absorbs this extension's path.
                // Merging into one node here is what keeps extensions off
                // other extensions.
                let merged = match self.resolve_node(&node_ref)? {
                    Node::Leaf {
                        path: leaf_path,
                        value,
                    } => Node::Leaf {
                        path: ext_path.combine(&leaf_path),
                        value,
                    },
                    Node::Extension {
                        path: sub_path,
                        next: sub_next,
                    } => Node::Extension {
                        path: ext_path.combine(&sub_path),
                        next: sub_next,
                    },
                    Node::Branch { .. } => Node::Extension {
                        path: ext_path.combine(&child_path),
                        next: node_ref,
                    },
                };
                Ok(DeleteOutcome::Updated(self.persist_node(&merged)))
            }
        }
    }

    fn delete_below_branch(
        &mut self,
        path: NibblePath,
        mut children: [NodeRef; 16],
        value: Vec<u8>,
    ) -> Result<DeleteOutcome, TrieError> {
        if path.is_empty() {
            if value.is_empty() {
                // No key ends at this branch.
                return Err(TrieError::KeyNotFound);
            }
            return self.collapse_branch(children, Vec::new());
        }

        let slot = path.at(0)? as usize;
        if children[slot].is_empty() {
            return Err(TrieError::KeyNotFound);
        }
        let child = children[slot].clone();
        match self.delete_at(&child, path.consume(1))? {
            DeleteOutcome::Deleted => {
                children[slot] = NodeRef::empty();
                self.collapse_branch(children, value)
            }
            DeleteOutcome::Updated(node_ref) | DeleteOutcome::UselessBranch { node_ref, .. } => {
                children[slot] = node_ref;
                Ok(DeleteOutcome::Updated(
                    self.persist_node(&Node::Branch { children, value }),
                ))
            }
        }
    }

    /// Decides what remains of a branch that just lost its value or one of
    /// its children. Branches keep at least two useful members (the value
    /// counts as one); anything less folds into a smaller node that the
    /// parent merges in.
    fn collapse_branch(
        &mut self,
        children: [NodeRef; 16],
        value: Vec<u8>,
    ) -> Result<DeleteOutcome, TrieError> {
        let occupied: Vec<usize> = children
            .iter()
            .enumerate()
            .filter(|(_, child)| !child.is_empty())
            .map(|(slot, _)| slot)
            .collect();

        match (occupied.len(), value.is_empty()) {
            (0, true) => Ok(DeleteOutcome::Deleted),
            (0, false) => {
                // Only the value survives: the branch becomes a leaf with an
                // empty path, to be merged by the parent.
                let path = NibblePath::default();
                let node_ref = self.persist_node(&Node::Leaf {
                    path: path.clone(),
                    value,
                });
                Ok(DeleteOutcome::UselessBranch { path, node_ref })
            }
            (1, true) => self.merge_into_sole_child(occupied[0] as u8, children[occupied[0]].clone()),
            _ => Ok(DeleteOutcome::Updated(
                self.persist_node(&Node::Branch { children, value }),
            )),
        }
    }

    /// Absorbs the nibble of a branch's only remaining slot into the child:
    /// leaves and extensions prepend it to their path, a branch child gets
    /// a one-nibble extension on top.
    fn merge_into_sole_child(
        &mut self,
        nibble: u8,
        child_ref: NodeRef,
    ) -> Result<DeleteOutcome, TrieError> {
        debug!("collapsing branch into slot {:x}", nibble);
        let prefix = NibblePath::from_nibbles(&[nibble]);
        let (path, node) = match self.resolve_node(&child_ref)? {
            Node::Leaf { path, value } => {
                let merged = prefix.combine(&path);
                (
                    merged.clone(),
                    Node::Leaf {
                        path: merged,
                        value,
                    },
                )
            }
            Node::Extension { path, next } => {
                let merged = prefix.combine(&path);
                (
                    merged.clone(),
                    Node::Extension { path: merged, next },
                )
            }
            Node::Branch { .. } => (
                prefix.clone(),
                Node::Extension {
                    path: prefix,
                    next: child_ref,
                },
            ),
        };
        let node_ref = self.persist_node(&node);
        Ok(DeleteOutcome::UselessBranch { path, node_ref })
    }
}
