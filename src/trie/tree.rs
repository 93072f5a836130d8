//! Trie store manager and mutation engine
//!
//! [`Trie`] owns the backing store, the current root, and the set of
//! database keys whose persisted nodes have been superseded since the last
//! commit. Mutation descends from the root and rewrites the spine above the
//! point of change, keeping the trie canonical: no branch with fewer than
//! two occupants, no chained extensions, no extension over a leaf. Hashing
//! is incremental; unchanged subtrees keep their cached digests. Commit
//! serializes every changed node and applies puts and deletes in one atomic
//! batch.
//!
//! Nested snapshots are a stack of overlays: `child` pushes a layer with a
//! copy of the root and an empty pending-delete set, `merge` folds the top
//! layer into its parent, `discard` drops it.

use super::node::{self, BackingNode, BranchNode, ExtensionNode, LeafNode, Node};
use crate::model::Digest;
use crate::store::{BackingStore, WriteBatch};
use crate::{nibbles, Error, Result};
use std::collections::HashSet;

/// Maximum key length in bytes
pub const MAX_KEY_LENGTH: usize = 65535;

struct Layer {
    root: Option<Node>,
    /// Database keys whose persisted bytes became stale since the last
    /// commit. Keys re-put by the commit batch are not deleted.
    dels: HashSet<Vec<u8>>,
}

impl Layer {
    fn new(root: Option<Node>) -> Self {
        Layer { root, dels: HashSet::new() }
    }
}

/// Result of a delete descent on one node
enum DeleteOutcome {
    /// Key not present; the subtree is unchanged
    NotFound,
    /// Key removed and this node vanished with it
    Emptied,
    /// Key removed; this node was rewritten in place
    Updated,
}

/// An authenticated key/value map persisted through a [`BackingStore`].
///
/// Values are hashed on insertion; the trie stores and authenticates the
/// digests. A single owner mutates the trie; there is no internal locking.
pub struct Trie<S: BackingStore> {
    store: S,
    base: Layer,
    overlays: Vec<Layer>,
}

impl<S: BackingStore> Trie<S> {
    /// Open a trie with an empty root
    pub fn new(store: S) -> Self {
        Trie { store, base: Layer::new(None), overlays: Vec::new() }
    }

    /// Open the trie at an existing root digest. The root becomes a
    /// placeholder; nodes are faulted in from the store on demand.
    pub fn set_root(&mut self, digest: Digest) {
        self.layer_mut().root = if digest.is_zero() {
            None
        } else {
            Some(Node::Backing(BackingNode::new(Vec::new(), digest)))
        };
    }

    /// Insert or overwrite `key` with the digest of `value`
    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        Self::check_key(key)?;
        let path = nibbles::from_key(key);
        let value_hash = Digest::digest(value);

        match self.layer_mut().root.take() {
            None => {
                self.layer_mut().root =
                    Some(Node::Leaf(LeafNode::new(Vec::new(), path, value_hash)));
                Ok(())
            }
            Some(mut root) => {
                let result = self.descend_add(&mut root, &path, value_hash);
                self.layer_mut().root = Some(root);
                result
            }
        }
    }

    /// Remove `key`; returns whether it was present
    pub fn delete(&mut self, key: &[u8]) -> Result<bool> {
        Self::check_key(key)?;
        let path = nibbles::from_key(key);

        let Some(mut root) = self.layer_mut().root.take() else {
            return Ok(false);
        };
        match self.descend_delete(&mut root, &path) {
            Ok(DeleteOutcome::Emptied) => Ok(true),
            Ok(DeleteOutcome::Updated) => {
                self.layer_mut().root = Some(root);
                Ok(true)
            }
            Ok(DeleteOutcome::NotFound) => {
                self.layer_mut().root = Some(root);
                Ok(false)
            }
            Err(err) => {
                self.layer_mut().root = Some(root);
                Err(err)
            }
        }
    }

    /// Current root digest. Rehashes any rewritten spine and caches the
    /// results; the logical map and the backing store are unchanged.
    pub fn root_hash(&mut self) -> Result<Digest> {
        match self.layer_mut().root.as_mut() {
            None => Ok(Digest::ZERO),
            Some(root) => {
                if let Some(digest) = root.cached_hash() {
                    return Ok(digest);
                }
                descend_hash(root)?;
                root.cached_hash()
                    .ok_or_else(|| Error::Corruption("root digest not computed".into()))
            }
        }
    }

    /// Persist every change since the last commit in one atomic batch:
    /// puts for new nodes, deletes for superseded ones. Merges any open
    /// overlays first. On store failure the in-memory state is retained and
    /// the commit may be retried.
    pub fn commit(&mut self) -> Result<()> {
        while !self.overlays.is_empty() {
            self.merge();
        }

        let mut batch = self.store.new_batch();
        let mut put_keys = HashSet::new();
        if let Some(root) = self.base.root.as_mut() {
            descend_hash_with_commit(root, &mut batch, &mut put_keys)?;
        }
        for key in &self.base.dels {
            if !put_keys.contains(key) {
                batch.delete(key.clone());
            }
        }
        self.store.apply(batch)?;

        if let Some(root) = self.base.root.as_mut() {
            mark_stored(root);
        }
        self.base.dels.clear();
        Ok(())
    }

    /// Push a nested snapshot: same root, fresh pending-delete set.
    /// Mutations are invisible to the parent until [`Trie::merge`].
    pub fn child(&mut self) {
        let root = self.layer().root.clone();
        self.overlays.push(Layer::new(root));
    }

    /// Fold the top snapshot into its parent: the snapshot's root replaces
    /// the parent's and its pending deletes are unioned in
    pub fn merge(&mut self) {
        if let Some(layer) = self.overlays.pop() {
            let parent = match self.overlays.last_mut() {
                Some(overlay) => overlay,
                None => &mut self.base,
            };
            parent.root = layer.root;
            parent.dels.extend(layer.dels);
        }
    }

    /// Drop the top snapshot, discarding its changes
    pub fn discard(&mut self) {
        self.overlays.pop();
    }

    /// Release the backing store
    pub fn close(mut self) -> Result<()> {
        self.store.close()
    }

    fn layer(&self) -> &Layer {
        self.overlays.last().unwrap_or(&self.base)
    }

    fn layer_mut(&mut self) -> &mut Layer {
        match self.overlays.last_mut() {
            Some(layer) => layer,
            None => &mut self.base,
        }
    }

    fn check_key(key: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Err(Error::EmptyKey);
        }
        if key.len() > MAX_KEY_LENGTH {
            return Err(Error::KeyTooLong(key.len()));
        }
        Ok(())
    }

    /// Load the node a placeholder stands for. A key scheduled for deletion
    /// is a soft miss (absent); a key the store does not have is a
    /// data-integrity failure.
    fn get_node(&self, backing: &BackingNode) -> Result<Option<Node>> {
        let db_key = nibbles::serialize(&backing.key)?;
        if self.layer().dels.contains(&db_key) {
            return Ok(None);
        }
        match self.store.get(&db_key)? {
            Some(bytes) => {
                let mut loaded = node::deserialize_node(&bytes, &backing.key)?;
                loaded.set_cached_hash(backing.hash);
                loaded.set_stored(true);
                Ok(Some(loaded))
            }
            None => Err(Error::Corruption(format!(
                "missing trie node at key {}",
                hex::encode(&db_key)
            ))),
        }
    }

    /// Replace a placeholder with its loaded node, in place
    fn materialize(&self, slot: &mut Node) -> Result<()> {
        let Node::Backing(backing) = slot else { return Ok(()) };
        match self.get_node(backing)? {
            Some(loaded) => {
                *slot = loaded;
                Ok(())
            }
            None => Err(Error::Corruption(format!(
                "deleted node still reachable at key {}",
                hex::encode(nibbles::serialize(&backing.key)?)
            ))),
        }
    }

    /// Record that the persisted bytes under a node's key are now stale
    fn del_node(&mut self, node: &Node) -> Result<()> {
        if node.is_stored() {
            let db_key = nibbles::serialize(node.key())?;
            self.layer_mut().dels.insert(db_key);
        }
        Ok(())
    }

    /// A node's content changed in place: record the stale bytes and drop
    /// its caches. The key is re-put at commit while the node stays
    /// reachable, superseding the delete.
    fn touch(&mut self, node: &mut Node) -> Result<()> {
        self.del_node(node)?;
        node.mark_dirty();
        Ok(())
    }

    fn descend_add(&mut self, node: &mut Node, remaining: &[u8], value_hash: Digest) -> Result<()> {
        match node {
            Node::Backing(_) => {
                self.materialize(node)?;
                self.descend_add(node, remaining, value_hash)
            }
            Node::Root(_) => Err(Error::Corruption(
                "root pointer record inside the trie".into(),
            )),
            Node::Leaf(leaf) => {
                if leaf.key_end == remaining {
                    leaf.value_hash = value_hash;
                    return self.touch(node);
                }
                // diverging keys: split into a branch at the shared prefix
                let prefix = nibbles::shared_prefix(&leaf.key_end, remaining);
                let p = prefix.len();
                let branch_key = [leaf.key.as_slice(), prefix.as_slice()].concat();
                let mut branch = BranchNode::new(branch_key.clone());

                if leaf.key_end.len() > p {
                    let idx = leaf.key_end[p];
                    let mut moved_key = branch_key.clone();
                    moved_key.push(idx);
                    branch.children[idx as usize] = Some(Box::new(Node::Leaf(LeafNode::new(
                        moved_key,
                        leaf.key_end[p + 1..].to_vec(),
                        leaf.value_hash,
                    ))));
                } else {
                    branch.value_hash = Some(leaf.value_hash);
                }
                if remaining.len() > p {
                    let idx = remaining[p];
                    let mut new_key = branch_key.clone();
                    new_key.push(idx);
                    branch.children[idx as usize] = Some(Box::new(Node::Leaf(LeafNode::new(
                        new_key,
                        remaining[p + 1..].to_vec(),
                        value_hash,
                    ))));
                } else {
                    branch.value_hash = Some(value_hash);
                }

                let leaf_key = leaf.key.clone();
                self.del_node(node)?;
                *node = if p > 0 {
                    Node::Extension(ExtensionNode::new(
                        leaf_key,
                        prefix,
                        Box::new(Node::Branch(branch)),
                    ))
                } else {
                    Node::Branch(branch)
                };
                Ok(())
            }
            Node::Extension(ext) => {
                let prefix = nibbles::shared_prefix(&ext.shared_key, remaining);
                if prefix.len() == ext.shared_key.len() {
                    let rest = nibbles::shift(remaining, prefix.len() as isize);
                    self.descend_add(ext.child.as_mut(), &rest, value_hash)?;
                    return self.touch(node);
                }
                // the extension splits at the divergence point
                let p = prefix.len();
                let old_idx = ext.shared_key[p];
                let branch_key = [ext.key.as_slice(), prefix.as_slice()].concat();
                let mut branch = BranchNode::new(branch_key.clone());

                let child = std::mem::replace(&mut ext.child, vacant());
                if ext.shared_key.len() == p + 1 {
                    // the child keeps its position below the new branch
                    branch.children[old_idx as usize] = Some(child);
                } else {
                    let mut sub_key = branch_key.clone();
                    sub_key.push(old_idx);
                    let sub_shared = ext.shared_key[p + 1..].to_vec();
                    branch.children[old_idx as usize] = Some(Box::new(Node::Extension(
                        ExtensionNode::new(sub_key, sub_shared, child),
                    )));
                }

                if remaining.len() > p {
                    let idx = remaining[p];
                    let mut leaf_key = branch_key.clone();
                    leaf_key.push(idx);
                    branch.children[idx as usize] = Some(Box::new(Node::Leaf(LeafNode::new(
                        leaf_key,
                        remaining[p + 1..].to_vec(),
                        value_hash,
                    ))));
                } else {
                    branch.value_hash = Some(value_hash);
                }

                let ext_key = ext.key.clone();
                self.del_node(node)?;
                *node = if p > 0 {
                    Node::Extension(ExtensionNode::new(
                        ext_key,
                        prefix,
                        Box::new(Node::Branch(branch)),
                    ))
                } else {
                    Node::Branch(branch)
                };
                Ok(())
            }
            Node::Branch(branch) => {
                if remaining.is_empty() {
                    // the key terminates at this branch
                    branch.value_hash = Some(value_hash);
                } else {
                    let idx = remaining[0] as usize;
                    let rest = remaining[1..].to_vec();
                    match branch.children[idx].as_mut() {
                        Some(child) => {
                            self.descend_add(child.as_mut(), &rest, value_hash)?;
                        }
                        None => {
                            let mut child_key = branch.key.clone();
                            child_key.push(remaining[0]);
                            branch.children[idx] = Some(Box::new(Node::Leaf(LeafNode::new(
                                child_key, rest, value_hash,
                            ))));
                        }
                    }
                }
                self.touch(node)
            }
        }
    }

    fn descend_delete(&mut self, node: &mut Node, remaining: &[u8]) -> Result<DeleteOutcome> {
        match node {
            Node::Backing(_) => {
                self.materialize(node)?;
                self.descend_delete(node, remaining)
            }
            Node::Root(_) => Err(Error::Corruption(
                "root pointer record inside the trie".into(),
            )),
            Node::Leaf(leaf) => {
                if leaf.key_end == remaining {
                    self.del_node(node)?;
                    Ok(DeleteOutcome::Emptied)
                } else {
                    Ok(DeleteOutcome::NotFound)
                }
            }
            Node::Extension(ext) => {
                let prefix = nibbles::shared_prefix(&ext.shared_key, remaining);
                if prefix.len() != ext.shared_key.len() {
                    return Ok(DeleteOutcome::NotFound);
                }
                let rest = nibbles::shift(remaining, prefix.len() as isize);
                match self.descend_delete(ext.child.as_mut(), &rest)? {
                    DeleteOutcome::NotFound => Ok(DeleteOutcome::NotFound),
                    DeleteOutcome::Emptied => Err(Error::Corruption(
                        "extension child vanished on delete".into(),
                    )),
                    DeleteOutcome::Updated => {
                        self.raise_extension(node)?;
                        Ok(DeleteOutcome::Updated)
                    }
                }
            }
            Node::Branch(branch) => {
                if remaining.is_empty() {
                    if branch.value_hash.take().is_none() {
                        return Ok(DeleteOutcome::NotFound);
                    }
                } else {
                    let idx = remaining[0] as usize;
                    let rest = &remaining[1..];
                    let outcome = match branch.children[idx].as_mut() {
                        None => return Ok(DeleteOutcome::NotFound),
                        Some(child) => self.descend_delete(child.as_mut(), rest)?,
                    };
                    match outcome {
                        DeleteOutcome::NotFound => return Ok(DeleteOutcome::NotFound),
                        DeleteOutcome::Emptied => branch.children[idx] = None,
                        DeleteOutcome::Updated => {}
                    }
                }
                self.touch(node)?;
                self.collapse_branch(node)?;
                Ok(DeleteOutcome::Updated)
            }
        }
    }

    /// Replace a branch left with a single occupant after a deletion,
    /// re-hoisting the surviving structure through its position
    fn collapse_branch(&mut self, node: &mut Node) -> Result<()> {
        let Node::Branch(branch) = node else { return Ok(()) };
        if branch.occupants() >= 2 {
            return Ok(());
        }

        if let Some(value_hash) = branch.value_hash {
            // only the branch value remains: a leaf ends here now
            let branch_key = branch.key.clone();
            *node = Node::Leaf(LeafNode::new(branch_key, Vec::new(), value_hash));
            return Ok(());
        }

        let Some((idx, mut child)) = branch.take_single_child() else {
            return Err(Error::Corruption("branch with no occupants".into()));
        };
        // the survivor must be inspected to re-hoist it
        self.materialize(child.as_mut())?;

        let branch_key = branch.key.clone();
        if !matches!(child.as_ref(), Node::Branch(_)) {
            // the survivor leaves its old position
            self.del_node(child.as_ref())?;
        }
        *node = match *child {
            Node::Leaf(leaf) => {
                let mut key_end = vec![idx];
                key_end.extend_from_slice(&leaf.key_end);
                Node::Leaf(LeafNode::new(branch_key, key_end, leaf.value_hash))
            }
            Node::Extension(sub) => {
                let mut shared = vec![idx];
                shared.extend_from_slice(&sub.shared_key);
                Node::Extension(ExtensionNode::new(branch_key, shared, sub.child))
            }
            branch_child @ Node::Branch(_) => Node::Extension(ExtensionNode::new(
                branch_key,
                vec![idx],
                Box::new(branch_child),
            )),
            Node::Root(_) | Node::Backing(_) => {
                return Err(Error::Corruption(
                    "unexpected node kind under collapsing branch".into(),
                ))
            }
        };
        Ok(())
    }

    /// After a delete below an extension: absorb a collapsed leaf, merge a
    /// collapsed extension, or just invalidate the cache if the child is
    /// still a branch
    fn raise_extension(&mut self, node: &mut Node) -> Result<()> {
        let Node::Extension(ext) = node else { return Ok(()) };
        if matches!(ext.child.as_ref(), Node::Branch(_) | Node::Backing(_)) {
            return self.touch(node);
        }

        let child = std::mem::replace(&mut ext.child, vacant());
        let ext_key = ext.key.clone();
        let shared = ext.shared_key.clone();
        self.del_node(child.as_ref())?;
        self.del_node(node)?;
        *node = match *child {
            Node::Leaf(leaf) => {
                let mut key_end = shared;
                key_end.extend_from_slice(&leaf.key_end);
                Node::Leaf(LeafNode::new(ext_key, key_end, leaf.value_hash))
            }
            Node::Extension(sub) => {
                let mut merged = shared;
                merged.extend_from_slice(&sub.shared_key);
                Node::Extension(ExtensionNode::new(ext_key, merged, sub.child))
            }
            Node::Branch(_) | Node::Backing(_) | Node::Root(_) => {
                return Err(Error::Corruption(
                    "unexpected node kind under extension".into(),
                ))
            }
        };
        Ok(())
    }
}

/// Stand-in while a child is moved during a structural rewrite
fn vacant() -> Box<Node> {
    Box::new(Node::Backing(BackingNode::new(Vec::new(), Digest::ZERO)))
}

/// Post-order hash of a subtree. Nodes with a cached digest, and the
/// subtrees below them, are skipped.
fn descend_hash(node: &mut Node) -> Result<()> {
    match node {
        Node::Backing(_) | Node::Root(_) => Ok(()),
        Node::Leaf(leaf) => {
            if leaf.hash.is_none() {
                leaf.hash = Some(Digest::digest(&leaf.serialize()?));
            }
            Ok(())
        }
        Node::Extension(ext) => {
            if ext.hash.is_some() {
                return Ok(());
            }
            descend_hash(ext.child.as_mut())?;
            ext.hash = Some(Digest::digest(&ext.serialize()?));
            Ok(())
        }
        Node::Branch(branch) => {
            if branch.hash.is_some() {
                return Ok(());
            }
            for child in branch.children.iter_mut().flatten() {
                descend_hash(child.as_mut())?;
            }
            branch.hash = Some(Digest::digest(&branch.serialize()?));
            Ok(())
        }
    }
}

/// Post-order hash that also queues a put for every node not yet in the
/// store. Subtrees whose root is known-persisted are clean and skipped;
/// placeholders are already on disk and emit nothing.
fn descend_hash_with_commit(
    node: &mut Node,
    batch: &mut WriteBatch,
    put_keys: &mut HashSet<Vec<u8>>,
) -> Result<()> {
    if matches!(node, Node::Backing(_) | Node::Root(_)) || node.is_stored() {
        return Ok(());
    }
    match node {
        Node::Extension(ext) => {
            descend_hash_with_commit(ext.child.as_mut(), batch, put_keys)?;
        }
        Node::Branch(branch) => {
            for child in branch.children.iter_mut().flatten() {
                descend_hash_with_commit(child.as_mut(), batch, put_keys)?;
            }
        }
        _ => {}
    }
    let bytes = node.serialize()?;
    if node.cached_hash().is_none() {
        node.set_cached_hash(Digest::digest(&bytes));
    }
    let db_key = nibbles::serialize(node.key())?;
    put_keys.insert(db_key.clone());
    batch.put(db_key, bytes);
    Ok(())
}

/// After a successful apply, flag the written spine as persisted
fn mark_stored(node: &mut Node) {
    if matches!(node, Node::Backing(_) | Node::Root(_)) || node.is_stored() {
        return;
    }
    match node {
        Node::Extension(ext) => mark_stored(ext.child.as_mut()),
        Node::Branch(branch) => {
            for child in branch.children.iter_mut().flatten() {
                mark_stored(child.as_mut());
            }
        }
        _ => {}
    }
    node.set_stored(true);
}

#[cfg(test)]
impl<S: BackingStore> Trie<S> {
    pub(crate) fn root_node(&self) -> Option<&Node> {
        self.layer().root.as_ref()
    }

    /// Walk the whole trie, faulting placeholders read-only, and assert the
    /// canonical-shape invariants
    pub(crate) fn verify_canonical_shape(&self) {
        if let Some(root) = self.layer().root.as_ref() {
            self.verify_node(root, &[]);
        }
    }

    fn verify_node(&self, node: &Node, path: &[u8]) -> &'static str {
        match node {
            Node::Backing(backing) => {
                assert_eq!(backing.key.as_slice(), path);
                let loaded = self
                    .get_node(backing)
                    .unwrap()
                    .expect("reachable node present in store");
                self.verify_node(&loaded, path)
            }
            Node::Leaf(leaf) => {
                assert_eq!(leaf.key.as_slice(), path);
                "leaf"
            }
            Node::Extension(ext) => {
                assert_eq!(ext.key.as_slice(), path);
                assert!(!ext.shared_key.is_empty(), "extension with empty shared key");
                let mut child_path = path.to_vec();
                child_path.extend_from_slice(&ext.shared_key);
                let child_kind = self.verify_node(ext.child.as_ref(), &child_path);
                assert_eq!(child_kind, "branch", "extension child must be a branch");
                "extension"
            }
            Node::Branch(branch) => {
                assert_eq!(branch.key.as_slice(), path);
                assert!(
                    branch.occupants() >= 2,
                    "branch with fewer than two occupants"
                );
                for (i, child) in branch.children.iter().enumerate() {
                    if let Some(child) = child {
                        let mut child_path = path.to_vec();
                        child_path.push(i as u8);
                        self.verify_node(child, &child_path);
                    }
                }
                "branch"
            }
            Node::Root(_) => panic!("root pointer record inside the trie"),
        }
    }

    /// Database keys of every node reachable from the root
    pub(crate) fn reachable_db_keys(&self) -> HashSet<Vec<u8>> {
        let mut keys = HashSet::new();
        if let Some(root) = self.layer().root.as_ref() {
            self.collect_reachable(root, &[], &mut keys);
        }
        keys
    }

    fn collect_reachable(&self, node: &Node, path: &[u8], keys: &mut HashSet<Vec<u8>>) {
        keys.insert(nibbles::serialize(path).unwrap());
        match node {
            Node::Backing(backing) => {
                let loaded = self
                    .get_node(backing)
                    .unwrap()
                    .expect("reachable node present in store");
                self.collect_reachable(&loaded, path, keys);
            }
            Node::Extension(ext) => {
                let mut child_path = path.to_vec();
                child_path.extend_from_slice(&ext.shared_key);
                self.collect_reachable(ext.child.as_ref(), &child_path, keys);
            }
            Node::Branch(branch) => {
                for (i, child) in branch.children.iter().enumerate() {
                    if let Some(child) = child {
                        let mut child_path = path.to_vec();
                        child_path.push(i as u8);
                        self.collect_reachable(child, &child_path, keys);
                    }
                }
            }
            Node::Leaf(_) | Node::Root(_) => {}
        }
    }
}
