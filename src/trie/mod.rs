//! Persistent Merkle-Patricia trie
//!
//! The node algebra and wire format live in [`node`]; the store manager,
//! mutation engine, and hasher live in [`tree`].

pub(crate) mod node;
pub(crate) mod tree;

pub use node::Node;
pub use tree::{Trie, MAX_KEY_LENGTH};
