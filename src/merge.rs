// src/merge.rs
//! Branch hit counters and their additive merge
//!
//! Counters collected by independent runs are combined at aggregation time,
//! off the recording path. A multi-way branch keeps one counter per case key
//! plus a default counter; a two-way jump keeps a true/false pair.

use crate::recording::codec::{write_compact, write_len, ByteReader};
use crate::utils::errors::{DiscoveryError, Result};
use serde::Serialize;

/// Hit counters of a multi-way branch
///
/// `hits` may outgrow `keys` after merging with a longer vector; the extra
/// positions have no key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CounterVector {
    keys: Vec<i32>,
    hits: Vec<u32>,
    default_hits: u32,
}

impl CounterVector {
    /// One zeroed counter per case key
    pub fn new(keys: Vec<i32>) -> Self {
        let hits = vec![0; keys.len()];
        Self {
            keys,
            hits,
            default_hits: 0,
        }
    }

    /// Build from parts; `keys` and `hits` must have the same length
    pub fn from_parts(keys: Vec<i32>, hits: Vec<u32>, default_hits: u32) -> Result<Self> {
        if keys.len() != hits.len() {
            return Err(DiscoveryError::ContractViolation(format!(
                "{} keys but {} hit counters",
                keys.len(),
                hits.len()
            )));
        }
        Ok(Self {
            keys,
            hits,
            default_hits,
        })
    }

    pub fn keys(&self) -> &[i32] {
        &self.keys
    }

    pub fn hits(&self) -> &[u32] {
        &self.hits
    }

    pub fn default_hits(&self) -> u32 {
        self.default_hits
    }

    /// Count a hit on the case at `index`. Out-of-range indices are ignored.
    pub fn touch(&mut self, index: usize) {
        if let Some(hit) = self.hits.get_mut(index) {
            *hit = hit.saturating_add(1);
        }
    }

    pub fn touch_default(&mut self) {
        self.default_hits = self.default_hits.saturating_add(1);
    }

    /// Total hits across every case and the default branch
    pub fn total_hits(&self) -> u64 {
        self.hits.iter().map(|&h| u64::from(h)).sum::<u64>() + u64::from(self.default_hits)
    }

    /// Add `other`'s counters into this one.
    ///
    /// Overlapping positions are summed and `other`'s tail is appended as is.
    /// Keys are taken from `other` only when this vector has none; two
    /// different non-empty key sets are not reconciled.
    pub fn merge(&mut self, other: &CounterVector) {
        self.default_hits = self.default_hits.saturating_add(other.default_hits);

        for (mine, theirs) in self.hits.iter_mut().zip(&other.hits) {
            *mine = mine.saturating_add(*theirs);
        }
        if other.hits.len() > self.hits.len() {
            self.hits.extend_from_slice(&other.hits[self.hits.len()..]);
        }

        if self.keys.is_empty() && !other.keys.is_empty() {
            self.keys = other.keys.clone();
        }
    }

    /// `default count { key hit }` as compact ints. Positions without a key
    /// are not written.
    pub fn encode(&self, out: &mut Vec<u8>) -> Result<()> {
        let count = self.keys.len().min(self.hits.len());
        write_compact(out, self.default_hits);
        write_len(out, count)?;
        for (&key, &hit) in self.keys.iter().zip(&self.hits) {
            write_compact(out, key as u32);
            write_compact(out, hit);
        }
        Ok(())
    }

    pub fn decode(reader: &mut ByteReader<'_>) -> Result<Self> {
        let default_hits = reader.read_compact()?;
        let count = reader.read_compact()? as usize;

        // Each pair takes at least two bytes
        let mut keys = Vec::with_capacity(count.min(reader.remaining() / 2));
        let mut hits = Vec::with_capacity(keys.capacity());
        for _ in 0..count {
            keys.push(reader.read_compact()? as i32);
            hits.push(reader.read_compact()?);
        }

        Ok(Self {
            keys,
            hits,
            default_hits,
        })
    }
}

/// Hit counters of a two-way jump
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JumpCounter {
    pub true_hits: u32,
    pub false_hits: u32,
}

impl JumpCounter {
    pub fn touch(&mut self, taken: bool) {
        let hit = if taken {
            &mut self.true_hits
        } else {
            &mut self.false_hits
        };
        *hit = hit.saturating_add(1);
    }

    pub fn merge(&mut self, other: &JumpCounter) {
        self.true_hits = self.true_hits.saturating_add(other.true_hits);
        self.false_hits = self.false_hits.saturating_add(other.false_hits);
    }
}

mod kinds {
    pub const JUMP: u8 = 0;
    pub const SWITCH: u8 = 1;
}

/// Counter data of one branch site
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BranchCounters {
    Jump(JumpCounter),
    Switch(CounterVector),
}

impl BranchCounters {
    pub fn kind_name(&self) -> &'static str {
        match self {
            BranchCounters::Jump(_) => "jump",
            BranchCounters::Switch(_) => "switch",
        }
    }

    /// Merge counters of the same branch kind
    pub fn merge(&mut self, other: &BranchCounters) -> Result<()> {
        match (self, other) {
            (BranchCounters::Jump(mine), BranchCounters::Jump(theirs)) => mine.merge(theirs),
            (BranchCounters::Switch(mine), BranchCounters::Switch(theirs)) => mine.merge(theirs),
            (mine, theirs) => {
                return Err(DiscoveryError::ContractViolation(format!(
                    "cannot merge {} counters into {} counters",
                    theirs.kind_name(),
                    mine.kind_name()
                )))
            }
        }
        Ok(())
    }

    /// Kind byte followed by the counter payload
    pub fn encode(&self, out: &mut Vec<u8>) -> Result<()> {
        match self {
            BranchCounters::Jump(jump) => {
                out.push(kinds::JUMP);
                write_compact(out, jump.true_hits);
                write_compact(out, jump.false_hits);
                Ok(())
            }
            BranchCounters::Switch(switch) => {
                out.push(kinds::SWITCH);
                switch.encode(out)
            }
        }
    }

    pub fn decode(reader: &mut ByteReader<'_>) -> Result<Self> {
        match reader.read_u8()? {
            kinds::JUMP => Ok(BranchCounters::Jump(JumpCounter {
                true_hits: reader.read_compact()?,
                false_hits: reader.read_compact()?,
            })),
            kinds::SWITCH => Ok(BranchCounters::Switch(CounterVector::decode(reader)?)),
            other => Err(DiscoveryError::MalformedTrace(format!(
                "unknown counter kind {} at offset {}",
                other,
                reader.position() - 1
            ))),
        }
    }
}
