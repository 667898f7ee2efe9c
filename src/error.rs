//! Error types for query execution.

use thiserror::Error;

use crate::relation::RelationId;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// An operand names a relation the catalog does not hold.
    #[error("unknown relation {relation}: catalog holds {catalog} relations")]
    UnknownRelation { relation: RelationId, catalog: usize },

    /// A relation was expected in the intermediate results but never joined in.
    /// A tracked relation with zero surviving rows is not this error.
    #[error("relation {0} is not tracked by any intermediate result")]
    UntrackedRelation(RelationId),

    #[error("entity {0} was merged away or never existed")]
    StaleEntity(usize),

    #[error("tuple at position {position} carries key {key}; keys must be row ids")]
    MisplacedKey { position: usize, key: u64 },

    #[error("failed to allocate a result buffer of {capacity} pairs")]
    BufferAllocation { capacity: usize },
}
