//! Storage-tier stateful connection manager for keymux.
//!
//! Architecture role:
//! - dedicated backend connections pinned across client RPCs for the
//!   duration of a transaction or reserved session
//! - lifecycle enforcement: at-most-one owner, idempotent release, taint
//!   tracking, renewal, advisory expiry
//! - per-user reserved/transaction accounting and the transaction log
//!
//! Key modules:
//! - [`backend`]
//! - [`pool`]
//! - [`stateful_connection`]
//! - [`tx`]

pub mod backend;
pub mod pool;
pub mod stateful_connection;
pub mod tx;

pub use backend::{BackendConn, QueryResult, Setting};
pub use pool::StatefulPool;
pub use stateful_connection::{Properties, StatefulConnection, TabletEnv};
pub use tx::{ReleaseReason, TxLogRecord, TxProperties};
