//! Vindexes: keyspace-id mapping functions consumed by the query planner.
//!
//! Architecture role:
//! - the core [`Vindex`] contract plus opt-in capability traits
//! - shard destinations ([`ShardDestination`], [`KeyRange`])
//! - the write-once process registry of vindex factories
//! - the identity [`Binary`] vindex
//!
//! Key modules:
//! - [`vindex`]
//! - [`destination`]
//! - [`registry`]
//! - [`binary`]

pub mod binary;
pub mod destination;
pub mod registry;
pub mod vindex;

pub use binary::Binary;
pub use destination::{KeyRange, ShardDestination};
pub use registry::{create_vindex, register, VindexFactory};
pub use vindex::{
    find_unknown_params, Hashing, Reversible, Sequential, SingleColumn, VCursor, Vindex,
};
