// src/recording/dictionary.rs
//! Incremental name dictionary
//!
//! Interns class, method and test names into small integer ids. Ids are handed
//! out in first-seen order starting at 1 and never change for the lifetime of
//! a session. The dictionary remembers which entries have not been written out
//! yet so encoders can emit each definition exactly once.

use crate::utils::errors::{DiscoveryError, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Stable handle for an interned name; 0 is never assigned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct NameId(u32);

impl NameId {
    /// Wrap a raw id, rejecting the unused value 0
    pub fn new(raw: u32) -> Option<Self> {
        (raw != 0).then_some(Self(raw))
    }

    pub fn get(self) -> u32 {
        self.0
    }

    fn index(self) -> usize {
        (self.0 - 1) as usize
    }

    /// Id of the entry stored at `index`
    fn from_index(index: usize) -> Option<Self> {
        index
            .checked_add(1)
            .and_then(|raw| u32::try_from(raw).ok())
            .map(Self)
    }
}

impl fmt::Display for NameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A dictionary definition handed to an encoder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DictionaryEntry<'a> {
    pub id: NameId,
    pub name: &'a str,
}

/// Bidirectional name registry.
///
/// Not synchronized; the owning session serializes access.
#[derive(Debug, Default)]
pub struct NameDictionary {
    ids: HashMap<Arc<str>, NameId>,
    names: Vec<Arc<str>>,
    /// Number of leading entries already written out
    flushed: usize,
}

impl NameDictionary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Id for `name`, assigning the next one on first sight.
    ///
    /// Fails only once every 32-bit id is taken.
    pub fn enumerate(&mut self, name: &str) -> Result<NameId> {
        if let Some(&id) = self.ids.get(name) {
            return Ok(id);
        }

        let id = NameId::from_index(self.names.len()).ok_or_else(|| {
            DiscoveryError::ContractViolation(format!(
                "name dictionary is full, cannot intern {:?}",
                name
            ))
        })?;
        let name: Arc<str> = Arc::from(name);
        self.names.push(Arc::clone(&name));
        self.ids.insert(name, id);
        Ok(id)
    }

    /// Id already assigned to `name`, if any
    pub fn lookup(&self, name: &str) -> Option<NameId> {
        self.ids.get(name).copied()
    }

    pub fn name(&self, id: NameId) -> Option<&str> {
        self.names.get(id.index()).map(|name| &**name)
    }

    /// Unwritten entries in assignment order; marks them written
    pub fn pending_entries(&mut self) -> Vec<DictionaryEntry<'_>> {
        let start = self.flushed;
        self.commit_flushed(self.names.len());
        self.entries().skip(start).collect()
    }

    /// Unwritten entries in assignment order, left unwritten until
    /// [`commit_flushed`](Self::commit_flushed) confirms them
    pub fn peek_pending(
        &self,
    ) -> impl DoubleEndedIterator<Item = DictionaryEntry<'_>> + ExactSizeIterator {
        self.entries().skip(self.flushed)
    }

    /// Mark the first `count` entries as written. Never moves backwards.
    pub fn commit_flushed(&mut self, count: usize) {
        self.flushed = self.flushed.max(count.min(self.names.len()));
    }

    pub fn has_pending(&self) -> bool {
        self.flushed < self.names.len()
    }

    pub fn pending_count(&self) -> usize {
        self.names.len() - self.flushed
    }

    /// Every entry in assignment order, regardless of flush state
    pub fn entries(
        &self,
    ) -> impl DoubleEndedIterator<Item = DictionaryEntry<'_>> + ExactSizeIterator {
        // Ids were checked when the names were interned
        self.names.iter().enumerate().map(|(index, name)| DictionaryEntry {
            id: NameId(index as u32 + 1),
            name,
        })
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}
