//! Backend connection contract.
//!
//! The pool primitive owns real MySQL connections; the stateful tier drives
//! them through this trait. Errors classified as connection errors
//! ([`kmx_common::KmxError::is_conn_err`]) make the caller consider a server
//! health check.

use std::sync::Arc;
use std::time::Duration;

use kmx_common::{RequestContext, Result};
use kmx_sql::Value;
use tonic::async_trait;

/// One result set from a backend.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    /// Column names, present when fields were requested.
    pub fields: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    pub rows_affected: u64,
    /// Opaque session-state-changes blob reported by the backend, when
    /// session tracking is on.
    pub session_state_changes: String,
}

/// A system-variable setting applied to a dedicated connection.
///
/// Settings are compared by pointer identity: the pool interns them, so two
/// equal queries share one allocation.
#[derive(Debug, PartialEq, Eq)]
pub struct Setting {
    /// Query that applies the setting.
    pub apply_query: String,
    /// Query that restores the default.
    pub reset_query: String,
}

/// Dedicated backend connection handed out by the pool primitive.
#[async_trait]
pub trait BackendConn: Send {
    /// Execute without client-side retries. Used inside transactions where a
    /// silent reconnect would lose state.
    async fn exec_once(
        &mut self,
        ctx: &RequestContext,
        query: &str,
        max_rows: usize,
        want_fields: bool,
    ) -> Result<QueryResult>;

    /// Execute with the backend's reconnect-and-retry behavior.
    async fn exec(
        &mut self,
        ctx: &RequestContext,
        query: &str,
        max_rows: usize,
        want_fields: bool,
    ) -> Result<QueryResult>;

    /// Fetch the next result set of a multi-result execution.
    async fn fetch_next(
        &mut self,
        ctx: &RequestContext,
        max_rows: usize,
        want_fields: bool,
    ) -> Result<QueryResult>;

    /// Kill the currently executing query and the connection.
    async fn kill(&mut self, reason: &str, elapsed: Duration) -> Result<()>;

    /// Apply a session setting.
    async fn apply_setting(&mut self, ctx: &RequestContext, setting: Arc<Setting>) -> Result<()>;

    /// Currently applied setting, when any.
    fn setting(&self) -> Option<Arc<Setting>>;

    /// Whether the underlying MySQL connection is gone.
    fn is_closed(&self) -> bool;

    /// Close the underlying MySQL connection.
    fn close(&mut self);

    /// MySQL connection id.
    fn id(&self) -> i64;

    /// Text of the currently executing query.
    fn current(&self) -> String;

    /// Mark the connection as carrying session state; it must not return to
    /// the general-purpose pool.
    fn taint(&mut self);

    /// Whether the connection uses a unix socket.
    fn is_unix_socket(&self) -> bool;

    /// Return the connection to the pool primitive. Consumes the handle.
    fn recycle(self: Box<Self>);
}
