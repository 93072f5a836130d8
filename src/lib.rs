//! # trellis_db
//!
//! A persistent Merkle-Patricia state trie: an authenticated, ordered
//! key/value map whose root digest is a succinct cryptographic commitment
//! to the entire map.
//!
//! trellis_db backs replicated-ledger state: callers mutate the map in
//! batches and snapshot a root digest per batch, most of the trie lives in
//! a backing store and is faulted in lazily, and equal subtrees across
//! revisions share storage through content addressing.
//!
//! ## Core Concepts
//!
//! - **Nodes**: leaves, path-compressing extensions, and 16-way branches,
//!   each committing to its subtree via a BLAKE3 digest
//! - **Placeholders**: unmaterialized subtrees named by path and digest,
//!   loaded from the backing store on demand
//! - **Commit**: one atomic write batch per snapshot — puts for new nodes,
//!   deletes for superseded ones
//! - **Snapshots**: nested copy-on-write overlays that merge into or are
//!   discarded from their parent
//!
//! ## Example
//!
//! ```
//! use trellis_db::{MemoryStore, Trie};
//!
//! # fn main() -> trellis_db::Result<()> {
//! let store = MemoryStore::new();
//! let mut trie = Trie::new(store.clone());
//! trie.add(b"account/1", b"balance=10")?;
//! trie.add(b"account/2", b"balance=20")?;
//! trie.commit()?;
//! let root = trie.root_hash()?;
//!
//! let mut reopened = Trie::new(store);
//! reopened.set_root(root);
//! assert_eq!(reopened.root_hash()?, root);
//! # Ok(())
//! # }
//! ```

pub mod model;
pub mod nibbles;
pub mod store;
pub mod trie;

mod error;

pub use error::{Error, Result};
pub use model::Digest;
pub use store::{BackingStore, MemoryStore, NullStore, WriteBatch};
pub use trie::{Trie, MAX_KEY_LENGTH};

#[cfg(test)]
mod proptests;
