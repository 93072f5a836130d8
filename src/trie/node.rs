//! Trie node algebra and wire format
//!
//! A node is either materialized (full in-memory structure) or a backing
//! placeholder carrying just its path and digest, standing in for a subtree
//! that still lives in the backing store. Every node serializes to a
//! self-describing record: a one-byte kind tag, then a fixed layout per
//! kind. A node's database key is the serialization of its nibble path.
//!
//! Wire layout per kind (all digests 32 bytes, zero digest means absent):
//!
//! | tag | kind                      | payload                                |
//! |-----|---------------------------|----------------------------------------|
//! | 0   | root pointer              | child digest                           |
//! | 1   | extension, odd shared key | child digest, packed shared key        |
//! | 2   | extension, even           | child digest, packed shared key        |
//! | 3   | leaf, odd key end         | value digest, packed key end           |
//! | 4   | leaf, even                | value digest, packed key end           |
//! | 5   | branch                    | 16 child digests, value digest         |

use crate::model::Digest;
use crate::{nibbles, Error, Result};

/// Fan-out of a branch node
pub const BRANCH_WIDTH: usize = 16;

const TAG_ROOT: u8 = 0;
const TAG_EXTENSION_ODD: u8 = 1;
const TAG_EXTENSION_EVEN: u8 = 2;
const TAG_LEAF_ODD: u8 = 3;
const TAG_LEAF_EVEN: u8 = 4;
const TAG_BRANCH: u8 = 5;

const BRANCH_LEN: usize = 1 + (BRANCH_WIDTH + 1) * Digest::LEN;

/// A node in the trie
#[derive(Clone, Debug, PartialEq)]
pub enum Node {
    /// A root pointer record: a single child digest. Kept for wire
    /// compatibility with databases that persist one; the mutation engine
    /// never creates it.
    Root(RootNode),
    Leaf(LeafNode),
    Extension(ExtensionNode),
    Branch(BranchNode),
    /// An unmaterialized subtree: path plus digest, awaiting load
    Backing(BackingNode),
}

#[derive(Clone, Debug, PartialEq)]
pub struct RootNode {
    pub(crate) child: Digest,
}

#[derive(Clone, Debug, PartialEq)]
pub struct LeafNode {
    /// Full path from the root to this node's position
    pub(crate) key: Vec<u8>,
    /// The portion of the stored key below this node's position
    pub(crate) key_end: Vec<u8>,
    /// Digest of the value bytes
    pub(crate) value_hash: Digest,
    pub(crate) hash: Option<Digest>,
    pub(crate) stored: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ExtensionNode {
    pub(crate) key: Vec<u8>,
    /// Compressed path segment, never empty; the child is always a branch
    pub(crate) shared_key: Vec<u8>,
    pub(crate) child: Box<Node>,
    pub(crate) hash: Option<Digest>,
    pub(crate) stored: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct BranchNode {
    pub(crate) key: Vec<u8>,
    pub(crate) children: [Option<Box<Node>>; BRANCH_WIDTH],
    /// Value stored at this branch, for the key terminating here
    pub(crate) value_hash: Option<Digest>,
    pub(crate) hash: Option<Digest>,
    pub(crate) stored: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct BackingNode {
    pub(crate) key: Vec<u8>,
    pub(crate) hash: Digest,
}

impl RootNode {
    pub fn new(child: Digest) -> Self {
        RootNode { child }
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(1 + Digest::LEN);
        out.push(TAG_ROOT);
        out.extend_from_slice(self.child.as_bytes());
        Ok(out)
    }
}

impl LeafNode {
    pub fn new(key: Vec<u8>, key_end: Vec<u8>, value_hash: Digest) -> Self {
        LeafNode { key, key_end, value_hash, hash: None, stored: false }
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        let (packed, half) = nibbles::pack(&self.key_end)?;
        let mut out = Vec::with_capacity(1 + Digest::LEN + packed.len());
        out.push(if half { TAG_LEAF_ODD } else { TAG_LEAF_EVEN });
        out.extend_from_slice(self.value_hash.as_bytes());
        out.extend_from_slice(&packed);
        Ok(out)
    }
}

impl ExtensionNode {
    pub fn new(key: Vec<u8>, shared_key: Vec<u8>, child: Box<Node>) -> Self {
        ExtensionNode { key, shared_key, child, hash: None, stored: false }
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        let (packed, half) = nibbles::pack(&self.shared_key)?;
        let mut out = Vec::with_capacity(1 + Digest::LEN + packed.len());
        out.push(if half { TAG_EXTENSION_ODD } else { TAG_EXTENSION_EVEN });
        out.extend_from_slice(self.child.child_digest().as_bytes());
        out.extend_from_slice(&packed);
        Ok(out)
    }
}

impl BranchNode {
    pub fn new(key: Vec<u8>) -> Self {
        BranchNode {
            key,
            children: Default::default(),
            value_hash: None,
            hash: None,
            stored: false,
        }
    }

    /// Populated child slots plus the branch value, if any
    pub fn occupants(&self) -> usize {
        self.children.iter().filter(|c| c.is_some()).count()
            + usize::from(self.value_hash.is_some())
    }

    /// Remove and return the only child; the caller has checked that no
    /// branch value remains
    pub(crate) fn take_single_child(&mut self) -> Option<(u8, Box<Node>)> {
        let idx = self.single_child()?;
        self.children[idx].take().map(|child| (idx as u8, child))
    }

    /// Index of the only populated child slot, when there is exactly one
    pub fn single_child(&self) -> Option<usize> {
        let mut only = None;
        for (i, c) in self.children.iter().enumerate() {
            if c.is_some() {
                if only.is_some() {
                    return None;
                }
                only = Some(i);
            }
        }
        only
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(BRANCH_LEN);
        out.push(TAG_BRANCH);
        for child in &self.children {
            let digest = match child {
                Some(c) => c.child_digest(),
                None => Digest::ZERO,
            };
            out.extend_from_slice(digest.as_bytes());
        }
        out.extend_from_slice(self.value_hash.unwrap_or(Digest::ZERO).as_bytes());
        Ok(out)
    }
}

impl BackingNode {
    pub fn new(key: Vec<u8>, hash: Digest) -> Self {
        BackingNode { key, hash }
    }
}

impl Node {
    /// Full path from the root to this node's position
    pub fn key(&self) -> &[u8] {
        match self {
            Node::Root(_) => &[],
            Node::Leaf(n) => &n.key,
            Node::Extension(n) => &n.key,
            Node::Branch(n) => &n.key,
            Node::Backing(n) => &n.key,
        }
    }

    /// The node's digest, if already known. Placeholders always carry one;
    /// materialized nodes only after hashing.
    pub fn cached_hash(&self) -> Option<Digest> {
        match self {
            Node::Root(_) => None,
            Node::Leaf(n) => n.hash,
            Node::Extension(n) => n.hash,
            Node::Branch(n) => n.hash,
            Node::Backing(n) => Some(n.hash),
        }
    }

    pub(crate) fn set_cached_hash(&mut self, digest: Digest) {
        match self {
            Node::Leaf(n) => n.hash = Some(digest),
            Node::Extension(n) => n.hash = Some(digest),
            Node::Branch(n) => n.hash = Some(digest),
            Node::Root(_) | Node::Backing(_) => {}
        }
    }

    /// Whether the node's current bytes are known to be in the backing store
    pub(crate) fn is_stored(&self) -> bool {
        match self {
            Node::Root(_) => false,
            Node::Leaf(n) => n.stored,
            Node::Extension(n) => n.stored,
            Node::Branch(n) => n.stored,
            Node::Backing(_) => true,
        }
    }

    pub(crate) fn set_stored(&mut self, stored: bool) {
        match self {
            Node::Leaf(n) => n.stored = stored,
            Node::Extension(n) => n.stored = stored,
            Node::Branch(n) => n.stored = stored,
            Node::Root(_) | Node::Backing(_) => {}
        }
    }

    /// Invalidate the hash cache after a content change
    pub(crate) fn mark_dirty(&mut self) {
        match self {
            Node::Leaf(n) => {
                n.hash = None;
                n.stored = false;
            }
            Node::Extension(n) => {
                n.hash = None;
                n.stored = false;
            }
            Node::Branch(n) => {
                n.hash = None;
                n.stored = false;
            }
            Node::Root(_) | Node::Backing(_) => {}
        }
    }

    /// Digest used when this node appears as a child reference. Callers
    /// hash children before serializing the parent, so a materialized child
    /// without a cached hash is a logic error.
    fn child_digest(&self) -> Digest {
        self.cached_hash()
            .expect("child digest not computed before serialization")
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        match self {
            Node::Root(n) => n.serialize(),
            Node::Leaf(n) => n.serialize(),
            Node::Extension(n) => n.serialize(),
            Node::Branch(n) => n.serialize(),
            Node::Backing(_) => Err(Error::Corruption(
                "backing placeholder cannot be serialized".into(),
            )),
        }
    }
}

fn digest_at(bytes: &[u8], offset: usize) -> Digest {
    let mut arr = [0u8; Digest::LEN];
    arr.copy_from_slice(&bytes[offset..offset + Digest::LEN]);
    Digest::from_bytes(arr)
}

/// Decode any node record. `key` is the node's path, used to position the
/// child placeholders of branches and extensions.
pub fn deserialize_node(bytes: &[u8], key: &[u8]) -> Result<Node> {
    match bytes.first() {
        Some(&TAG_ROOT) => Ok(Node::Root(deserialize_root(bytes)?)),
        Some(&(TAG_EXTENSION_ODD | TAG_EXTENSION_EVEN)) => {
            Ok(Node::Extension(deserialize_extension(bytes, key)?))
        }
        Some(&(TAG_LEAF_ODD | TAG_LEAF_EVEN)) => {
            Ok(Node::Leaf(deserialize_leaf(bytes, key)?))
        }
        Some(&TAG_BRANCH) => Ok(Node::Branch(deserialize_branch(bytes, key)?)),
        Some(&tag) => Err(Error::BadEncoding(format!("unknown node tag: {tag:#04x}"))),
        None => Err(Error::BadEncoding("empty node record".into())),
    }
}

pub fn deserialize_root(bytes: &[u8]) -> Result<RootNode> {
    if bytes.first() != Some(&TAG_ROOT) {
        return Err(Error::BadEncoding("not a root pointer record".into()));
    }
    if bytes.len() != 1 + Digest::LEN {
        return Err(Error::BadEncoding(format!(
            "root pointer record of {} bytes",
            bytes.len()
        )));
    }
    Ok(RootNode::new(digest_at(bytes, 1)))
}

pub fn deserialize_leaf(bytes: &[u8], key: &[u8]) -> Result<LeafNode> {
    let half = match bytes.first() {
        Some(&TAG_LEAF_ODD) => true,
        Some(&TAG_LEAF_EVEN) => false,
        _ => return Err(Error::BadEncoding("not a leaf record".into())),
    };
    if bytes.len() < 1 + Digest::LEN {
        return Err(Error::BadEncoding(format!(
            "truncated leaf record of {} bytes",
            bytes.len()
        )));
    }
    let key_end = nibbles::unpack(&bytes[1 + Digest::LEN..], half)?;
    Ok(LeafNode::new(key.to_vec(), key_end, digest_at(bytes, 1)))
}

pub fn deserialize_extension(bytes: &[u8], key: &[u8]) -> Result<ExtensionNode> {
    let half = match bytes.first() {
        Some(&TAG_EXTENSION_ODD) => true,
        Some(&TAG_EXTENSION_EVEN) => false,
        _ => return Err(Error::BadEncoding("not an extension record".into())),
    };
    if bytes.len() < 1 + Digest::LEN {
        return Err(Error::BadEncoding(format!(
            "truncated extension record of {} bytes",
            bytes.len()
        )));
    }
    let shared_key = nibbles::unpack(&bytes[1 + Digest::LEN..], half)?;
    if shared_key.is_empty() {
        return Err(Error::BadEncoding("extension with empty shared key".into()));
    }
    let mut child_key = key.to_vec();
    child_key.extend_from_slice(&shared_key);
    let child = Box::new(Node::Backing(BackingNode::new(child_key, digest_at(bytes, 1))));
    Ok(ExtensionNode::new(key.to_vec(), shared_key, child))
}

pub fn deserialize_branch(bytes: &[u8], key: &[u8]) -> Result<BranchNode> {
    if bytes.first() != Some(&TAG_BRANCH) {
        return Err(Error::BadEncoding("not a branch record".into()));
    }
    if bytes.len() != BRANCH_LEN {
        return Err(Error::BadEncoding(format!(
            "branch record of {} bytes",
            bytes.len()
        )));
    }
    let mut branch = BranchNode::new(key.to_vec());
    for i in 0..BRANCH_WIDTH {
        let digest = digest_at(bytes, 1 + i * Digest::LEN);
        if !digest.is_zero() {
            let mut child_key = key.to_vec();
            child_key.push(i as u8);
            branch.children[i] =
                Some(Box::new(Node::Backing(BackingNode::new(child_key, digest))));
        }
    }
    let value = digest_at(bytes, 1 + BRANCH_WIDTH * Digest::LEN);
    if !value.is_zero() {
        branch.value_hash = Some(value);
    }
    Ok(branch)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(byte: u8) -> Digest {
        Digest::from_bytes([byte; 32])
    }

    // "leafendkey" with each byte masked to its low nibble
    const LEAF_KEY_END: [u8; 10] = [0xc, 0x5, 0x1, 0x6, 0x5, 0xe, 0x4, 0xb, 0x5, 0x9];

    #[test]
    fn test_root_roundtrip() {
        let rn = RootNode::new(filled(0x11));
        let data = rn.serialize().unwrap();

        let mut expected = vec![0x00];
        expected.extend_from_slice(&[0x11; 32]);
        assert_eq!(data, expected);

        assert_eq!(deserialize_root(&data).unwrap(), rn);
        assert_eq!(
            deserialize_node(&data, &[]).unwrap(),
            Node::Root(rn)
        );
    }

    #[test]
    fn test_leaf_roundtrip_even() {
        let ln = LeafNode::new(vec![], LEAF_KEY_END.to_vec(), filled(0xaa));
        let data = ln.serialize().unwrap();

        let mut expected = vec![0x04];
        expected.extend_from_slice(&[0xaa; 32]);
        expected.extend_from_slice(&[0xc5, 0x16, 0x5e, 0x4b, 0x59]);
        assert_eq!(data, expected);

        assert_eq!(deserialize_leaf(&data, &[]).unwrap(), ln);
    }

    #[test]
    fn test_leaf_roundtrip_odd() {
        let ln = LeafNode::new(vec![], LEAF_KEY_END[..9].to_vec(), filled(0xaa));
        let data = ln.serialize().unwrap();

        let mut expected = vec![0x03];
        expected.extend_from_slice(&[0xaa; 32]);
        expected.extend_from_slice(&[0xc5, 0x16, 0x5e, 0x4b, 0x50]);
        assert_eq!(data, expected);

        assert_eq!(deserialize_leaf(&data, &[]).unwrap(), ln);
    }

    #[test]
    fn test_leaf_empty_key_end() {
        let ln = LeafNode::new(vec![0x1], vec![], filled(0x42));
        let data = ln.serialize().unwrap();
        assert_eq!(data[0], 0x04);
        assert_eq!(data.len(), 33);
        assert_eq!(deserialize_leaf(&data, &[0x1]).unwrap(), ln);
    }

    #[test]
    fn test_extension_roundtrip() {
        // "extensionkey" masked to low nibbles, then the odd truncation
        let shared: Vec<u8> = vec![0x5, 0x8, 0x4, 0x5, 0xe, 0x3, 0x9, 0xf, 0xe, 0xb, 0x5, 0x9];
        for (tag, shared_key, packed_tail) in [
            (0x02u8, shared.clone(), vec![0x58, 0x45, 0xe3, 0x9f, 0xeb, 0x59]),
            (0x01u8, shared[..11].to_vec(), vec![0x58, 0x45, 0xe3, 0x9f, 0xeb, 0x50]),
        ] {
            let mut child_key = vec![0x2];
            child_key.extend_from_slice(&shared_key);
            let child = Box::new(Node::Backing(BackingNode::new(child_key, filled(0xbb))));
            let en = ExtensionNode::new(vec![0x2], shared_key, child);
            let data = en.serialize().unwrap();

            let mut expected = vec![tag];
            expected.extend_from_slice(&[0xbb; 32]);
            expected.extend_from_slice(&packed_tail);
            assert_eq!(data, expected);

            assert_eq!(deserialize_extension(&data, &[0x2]).unwrap(), en);
        }
    }

    #[test]
    fn test_extension_rejects_empty_shared_key() {
        let mut data = vec![0x02];
        data.extend_from_slice(&[0xbb; 32]);
        assert!(matches!(
            deserialize_extension(&data, &[]),
            Err(Error::BadEncoding(_))
        ));
    }

    #[test]
    fn test_branch_roundtrip() {
        let mut bn = BranchNode::new(vec![0x7]);
        for i in [0usize, 3, 15] {
            let mut child_key = vec![0x7];
            child_key.push(i as u8);
            bn.children[i] = Some(Box::new(Node::Backing(BackingNode::new(
                child_key,
                filled(i as u8 + 1),
            ))));
        }
        bn.value_hash = Some(filled(0xee));

        let data = bn.serialize().unwrap();
        assert_eq!(data.len(), 1 + 17 * 32);
        assert_eq!(data[0], 0x05);
        assert_eq!(&data[1..33], &[0x01; 32]);
        assert_eq!(&data[33..65], &[0x00; 32]);
        assert_eq!(&data[1 + 3 * 32..1 + 4 * 32], &[0x04; 32]);
        assert_eq!(&data[1 + 16 * 32..], &[0xee; 32]);

        assert_eq!(deserialize_branch(&data, &[0x7]).unwrap(), bn);
    }

    #[test]
    fn test_branch_without_value() {
        let mut bn = BranchNode::new(vec![]);
        bn.children[4] = Some(Box::new(Node::Backing(BackingNode::new(
            vec![0x4],
            filled(0x99),
        ))));
        let data = bn.serialize().unwrap();
        let decoded = deserialize_branch(&data, &[]).unwrap();
        assert_eq!(decoded.value_hash, None);
        assert_eq!(decoded.occupants(), 1);
        assert_eq!(decoded.single_child(), Some(4));
    }

    #[test]
    fn test_wrong_tags_rejected() {
        let mut ext = vec![0x01];
        ext.extend_from_slice(&[0xbb; 32]);
        ext.push(0x50);

        assert!(deserialize_leaf(&ext, &[]).is_err());
        assert!(deserialize_branch(&ext, &[]).is_err());
        assert!(deserialize_root(&ext).is_err());

        let mut broken = ext.clone();
        broken[0] = 0x06;
        assert!(deserialize_extension(&broken, &[]).is_err());
        assert!(matches!(
            deserialize_node(&broken, &[]),
            Err(Error::BadEncoding(_))
        ));
        assert!(matches!(
            deserialize_node(&[], &[]),
            Err(Error::BadEncoding(_))
        ));
    }

    #[test]
    fn test_truncated_records_rejected() {
        let ln = LeafNode::new(vec![], vec![0x1, 0x2], filled(0xaa));
        let data = ln.serialize().unwrap();
        assert!(deserialize_leaf(&data[..20], &[]).is_err());

        let bn = BranchNode::new(vec![]);
        let data = bn.serialize().unwrap();
        assert!(deserialize_branch(&data[..data.len() - 1], &[]).is_err());

        let rn = RootNode::new(filled(0x11));
        let data = rn.serialize().unwrap();
        assert!(deserialize_root(&data[..32]).is_err());
    }
}
