//! Node model and codec for a Merkle PATRICIA Trie.
//!
//! Three node shapes exist: a leaf carries the remaining key suffix and a
//! value; an extension carries a shared key segment and exactly one child; a
//! branch fans out over 16 slots, one per nibble, and may carry a value for
//! a key ending at its position.
//!
//! Nodes point at each other through references. A node whose RLP encoding
//! is shorter than 32 bytes is referenced by that encoding itself (inline);
//! longer nodes are referenced by the Keccak-256 digest of the encoding. On
//! the wire an inline reference is embedded as a nested list while a hashed
//! reference is a 32-byte string; inside the engine both are plain byte
//! strings. That conversion lives entirely in this module.

use std::fmt;

use ethers::{types::H256, utils::keccak256};
use rlp::{Rlp, RlpStream};
use thiserror::Error;

use crate::path::{NibblePath, PathError};

/// Length of a hashed node reference in bytes.
pub const HASH_LENGTH: usize = 32;

#[derive(Debug, Error, Eq, PartialEq)]
pub enum NodeError {
    #[error("RLP decode error {0}")]
    DecodeError(#[from] rlp::DecoderError),
    #[error("Merkle Patricia node must have 2 or 17 items, got {0}")]
    InvalidItemCount(usize),
    #[error("Trie path error {0}")]
    PathError(#[from] PathError),
}

/// A reference to a node: the node's own encoding when shorter than 32
/// bytes, the 32-byte Keccak-256 digest of the encoding otherwise. The
/// empty byte string means "no node" (an empty branch slot or empty trie).
#[derive(Clone, Default, Eq, PartialEq)]
pub struct NodeRef(Vec<u8>);

impl NodeRef {
    /// The absent reference.
    pub fn empty() -> Self {
        NodeRef(Vec::new())
    }

    /// Wraps reference bytes already in engine form (empty, inline encoding
    /// or 32-byte digest).
    pub fn new(bytes: Vec<u8>) -> Self {
        NodeRef(bytes)
    }

    /// Builds the reference for an encoded node, applying the 32-byte
    /// threshold rule.
    pub fn from_encoding(encoded: &[u8]) -> Self {
        if encoded.len() < HASH_LENGTH {
            NodeRef(encoded.to_vec())
        } else {
            NodeRef(keccak256(encoded).to_vec())
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True when the reference is a storage digest rather than an inline
    /// encoding.
    pub fn is_hash(&self) -> bool {
        self.0.len() == HASH_LENGTH
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// The digest form of a hashed reference. Callers check `is_hash` first.
    pub fn to_digest(&self) -> H256 {
        H256::from_slice(&self.0)
    }
}

impl From<H256> for NodeRef {
    fn from(digest: H256) -> Self {
        NodeRef(digest.as_bytes().to_vec())
    }
}

impl fmt::Debug for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeRef(0x{})", hex::encode(&self.0))
    }
}

/// A node of the trie.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Node {
    Leaf {
        path: NibblePath,
        value: Vec<u8>,
    },
    Extension {
        path: NibblePath,
        next: NodeRef,
    },
    Branch {
        children: [NodeRef; 16],
        /// Value for a key ending at this branch; empty when none does.
        value: Vec<u8>,
    },
}

impl Node {
    /// Serializes the node to its canonical RLP form.
    ///
    /// Leaf and extension are 2-item lists, a branch is a 17-item list of
    /// 16 slots followed by the value.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Node::Leaf { path, value } => {
                let mut stream = RlpStream::new_list(2);
                stream.append(&path.encode(true));
                stream.append(value);
                stream.out().to_vec()
            }
            Node::Extension { path, next } => {
                let mut stream = RlpStream::new_list(2);
                stream.append(&path.encode(false));
                append_reference(&mut stream, next);
                stream.out().to_vec()
            }
            Node::Branch { children, value } => {
                let mut stream = RlpStream::new_list(17);
                for child in children {
                    append_reference(&mut stream, child);
                }
                stream.append(value);
                stream.out().to_vec()
            }
        }
    }

    /// Deserializes a node from its canonical RLP form.
    ///
    /// A 2-item list is a leaf or an extension, told apart by the leaf flag
    /// in the path prefix byte; a 17-item list is a branch. Anything else
    /// is malformed.
    pub fn decode(encoded: &[u8]) -> Result<Node, NodeError> {
        let rlp = Rlp::new(encoded);
        match rlp.item_count()? {
            2 => {
                let (path, is_leaf) = NibblePath::decode_with_type(rlp.at(0)?.data()?)?;
                if is_leaf {
                    Ok(Node::Leaf {
                        path,
                        value: rlp.at(1)?.data()?.to_vec(),
                    })
                } else {
                    Ok(Node::Extension {
                        path,
                        next: decode_reference(&rlp.at(1)?)?,
                    })
                }
            }
            17 => {
                let mut children: [NodeRef; 16] = Default::default();
                for (index, child) in children.iter_mut().enumerate() {
                    *child = decode_reference(&rlp.at(index)?)?;
                }
                Ok(Node::Branch {
                    children,
                    value: rlp.at(16)?.data()?.to_vec(),
                })
            }
            count => Err(NodeError::InvalidItemCount(count)),
        }
    }
}

/// Emits a reference into a node encoding. Inline references are spliced in
/// raw so they re-parse as nested lists; hashed references are 32-byte
/// strings; empty slots are empty strings.
fn append_reference(stream: &mut RlpStream, reference: &NodeRef) {
    if reference.is_empty() {
        stream.append_empty_data();
    } else if reference.is_hash() {
        stream.append(&reference.as_bytes());
    } else {
        stream.append_raw(reference.as_bytes(), 1);
    }
}

/// Reads a reference out of a node encoding. A nested list is an inline
/// node and its raw bytes become the reference; a string is a digest (or an
/// empty slot).
fn decode_reference(item: &Rlp) -> Result<NodeRef, NodeError> {
    if item.is_list() {
        Ok(NodeRef::new(item.as_raw().to_vec()))
    } else {
        Ok(NodeRef::new(item.data()?.to_vec()))
    }
}
