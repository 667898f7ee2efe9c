//! Append-only list of join results.
//!
//! Results are collected into a chain of fixed-capacity buffers. A buffer is
//! allocated once with room for [`CAPACITY`] pairs and never grows, a new
//! buffer is chained only when the tail is full. Large joins therefore never
//! pay for reallocation copies and no single allocation exceeds 1 MiB.
//!
//! ```text
//!  ResultList
//! ┌──────────────┐    ┌──────────────┐    ┌──────────────┐
//! │ buffer 0     │───►│ buffer 1     │───►│ tail         │
//! │ CAPACITY/CAP │    │ CAPACITY/CAP │    │ 0..CAPACITY  │
//! └──────────────┘    └──────────────┘    └──────────────┘
//! ```
use std::fmt;
use std::mem::size_of;
use std::ops::Index;

use crate::error::{Error, Result};

/// A matching `(key1, key2)` pair produced by a join.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Pair {
    pub key1: u64,
    pub key2: u64,
}

impl Pair {
    #[inline(always)]
    pub fn new(key1: u64, key2: u64) -> Self {
        Self { key1, key2 }
    }
}

/// Number of pairs held by one buffer.
pub const CAPACITY: usize = 1024 * 1024 / size_of::<Pair>();

pub struct Buffer {
    data: Vec<Pair>,
}

impl Buffer {
    fn allocate() -> Result<Self> {
        let mut data = Vec::new();
        data.try_reserve_exact(CAPACITY)
            .map_err(|_| Error::BufferAllocation { capacity: CAPACITY })?;
        Ok(Self { data })
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline(always)]
    fn is_full(&self) -> bool {
        self.data.len() == CAPACITY
    }

    pub fn as_slice(&self) -> &[Pair] {
        &self.data
    }
}

impl Index<usize> for Buffer {
    type Output = Pair;

    #[inline(always)]
    fn index(&self, i: usize) -> &Pair {
        &self.data[i]
    }
}

#[derive(Default)]
pub struct ResultList {
    buffers: Vec<Buffer>,
    len: usize,
}

impl ResultList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a pair to the tail buffer, chaining a fresh buffer when the
    /// tail is full.
    #[inline]
    pub fn append(&mut self, pair: Pair) -> Result<()> {
        let needs_buffer = self.buffers.last().is_none_or(Buffer::is_full);
        if needs_buffer {
            self.buffers.push(Buffer::allocate()?);
        }
        // The tail exists and has room: it was either just pushed or not full.
        if let Some(tail) = self.buffers.last_mut() {
            tail.data.push(pair);
        }
        self.len += 1;
        Ok(())
    }

    /// Moves every pair of `other` to the end of this list.
    pub fn absorb(&mut self, other: ResultList) -> Result<()> {
        if self.is_empty() {
            *self = other;
            return Ok(());
        }
        for pair in other.iter() {
            self.append(*pair)?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The buffer chain, head first.
    pub fn buffers(&self) -> impl Iterator<Item = &Buffer> {
        self.buffers.iter()
    }

    /// Every pair in append order.
    pub fn iter(&self) -> impl Iterator<Item = &Pair> + Clone {
        self.buffers.iter().flat_map(Buffer::as_slice)
    }
}

impl fmt::Debug for ResultList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultList")
            .field("len", &self.len)
            .field("buffers", &self.buffers.len())
            .finish()
    }
}
