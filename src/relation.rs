//! Immutable input relations.
//!
//! A relation is a single column of `(key, payload)` tuples where `key` is the
//! row id and `payload` the value that filters and joins compare.

use std::borrow::Cow;

use crate::error::{Error, Result};

/// Position of a relation in the catalog handed to the executioner.
pub type RelationId = usize;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Tuple {
    pub key: u64,
    pub payload: u64,
}

impl Tuple {
    #[inline(always)]
    pub fn new(key: u64, payload: u64) -> Self {
        Self { key, payload }
    }

    /// Value of this tuple under the given column role.
    #[inline(always)]
    pub fn value(&self, column: Column) -> u64 {
        match column {
            Column::Key => self.key,
            Column::Payload => self.payload,
        }
    }
}

/// Which half of a tuple an operand reads.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Column {
    Key,
    Payload,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Relation {
    tuples: Box<[Tuple]>,
}

impl Relation {
    /// Wraps loaded tuples. The tuple at position `i` must carry key `i`.
    pub fn new(tuples: Vec<Tuple>) -> Result<Self> {
        if let Some((position, tuple)) = tuples
            .iter()
            .enumerate()
            .find(|(i, t)| t.key != *i as u64)
        {
            return Err(Error::MisplacedKey {
                position,
                key: tuple.key,
            });
        }
        Ok(Self {
            tuples: tuples.into_boxed_slice(),
        })
    }

    /// Builds a relation from a payload column, keys are assigned `0..n`.
    pub fn from_payloads(payloads: impl IntoIterator<Item = u64>) -> Self {
        let tuples: Box<[Tuple]> = payloads
            .into_iter()
            .enumerate()
            .map(|(i, payload)| Tuple::new(i as u64, payload))
            .collect();
        Self { tuples }
    }

    pub fn tuples(&self) -> &[Tuple] {
        &self.tuples
    }

    pub fn len(&self) -> usize {
        self.tuples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tuples.is_empty()
    }

    /// Value of row `key` under `column`.
    ///
    /// Keys handed out by this relation are always in range, so an out of
    /// range key is a logic error upstream.
    #[inline(always)]
    pub fn value(&self, key: u64, column: Column) -> u64 {
        match column {
            Column::Key => key,
            Column::Payload => self.tuples[key as usize].payload,
        }
    }

    /// Projects the relation onto `column`: the key is kept and the payload is
    /// replaced by the column's value, ready for partitioning.
    pub fn project(&self, column: Column) -> Cow<'_, [Tuple]> {
        match column {
            Column::Payload => Cow::Borrowed(&self.tuples),
            Column::Key => self.tuples.iter().map(|t| Tuple::new(t.key, t.key)).collect(),
        }
    }
}
