//! Radix hash join query engine.
//!
//! Evaluates a query of filter and join predicates over in-memory relations
//! and reports per-column checksums of the result.
//!
//! ```
//! use rhj::{Comparison, Executioner, Operand, Query, Relation};
//!
//! let relations = [
//!     Relation::from_payloads([0, 5]),
//!     Relation::from_payloads([5, 9]),
//! ];
//! let query = Query::new()
//!     .join(Operand::payload(0), Comparison::Equal, Operand::payload(1))
//!     .checksum(Operand::key(0));
//!
//! let sums = Executioner::new(&relations).execute(&query).unwrap();
//! assert_eq!(sums, vec!["1"]);
//! ```
#![cfg_attr(feature = "nightly", feature(core_intrinsics))]
#![cfg_attr(feature = "nightly", allow(internal_features))]
pub mod config;
pub mod error;
pub mod executioner;
pub mod index;
pub mod partition;
pub mod query;
pub mod relation;
pub mod result;

pub use config::JoinConfig;
pub use error::{Error, Result};
pub use executioner::{Entity, EntityId, Executioner, IntermediateResults};
pub use index::{Index, Order, nested_loop_join, radix_join};
pub use partition::{Bucket, PsumTable};
pub use query::{Checksum, Comparison, Operand, Predicate, Query, Rhs};
pub use relation::{Column, Relation, RelationId, Tuple};
pub use result::{CAPACITY, Pair, ResultList};
