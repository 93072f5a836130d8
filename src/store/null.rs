//! Null backing store

use super::{BackingStore, WriteBatch};
use crate::Result;

/// A store where every read is absent and every write succeeds.
///
/// Useful for exercising the mutation engine without persistence.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullStore;

impl NullStore {
    pub fn new() -> Self {
        NullStore
    }
}

impl BackingStore for NullStore {
    fn get(&self, _key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }

    fn apply(&self, _batch: WriteBatch) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}
