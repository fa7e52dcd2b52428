//! Transaction metadata carried on a dedicated connection.

use std::fmt;
use std::time::Instant;

use kmx_common::{CallerId, GatewayCallerId, MetricsRegistry};
use serde::Serialize;

/// Why a dedicated connection is being released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseReason {
    TxClose,
    TxCommit,
    TxRollback,
    TxKill,
    ConnInitFail,
    ConnRelease,
    ConnRenewFail,
}

impl ReleaseReason {
    /// Short metric-label name.
    pub fn name(&self) -> &'static str {
        match self {
            ReleaseReason::TxClose => "Close",
            ReleaseReason::TxCommit => "Commit",
            ReleaseReason::TxRollback => "Rollback",
            ReleaseReason::TxKill => "Kill",
            ReleaseReason::ConnInitFail => "ConnInitFail",
            ReleaseReason::ConnRelease => "ConnRelease",
            ReleaseReason::ConnRenewFail => "ConnRenewFail",
        }
    }
}

impl fmt::Display for ReleaseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verbose = match self {
            ReleaseReason::TxClose => "closed",
            ReleaseReason::TxCommit => "transaction committed",
            ReleaseReason::TxRollback => "transaction rolled back",
            ReleaseReason::TxKill => "kill",
            ReleaseReason::ConnInitFail => "initFail",
            ReleaseReason::ConnRelease => "release connection",
            ReleaseReason::ConnRenewFail => "connection renew failed",
        };
        write!(f, "{verbose}")
    }
}

/// Transactional state of a dedicated connection.
#[derive(Debug, Clone)]
pub struct TxProperties {
    pub effective_caller: Option<CallerId>,
    pub immediate_caller: Option<GatewayCallerId>,
    pub start_time: Instant,
    pub end_time: Option<Instant>,
    /// Queries executed within the transaction, for the transaction log.
    pub queries: Vec<String>,
    pub autocommit: bool,
    /// How the transaction ended; stamped at log time.
    pub conclusion: String,
    /// Timing sink for per-conclusion transaction durations.
    pub stats: MetricsRegistry,
}

impl TxProperties {
    /// Open-transaction properties starting now.
    pub fn new(
        effective_caller: Option<CallerId>,
        immediate_caller: Option<GatewayCallerId>,
        autocommit: bool,
        stats: MetricsRegistry,
    ) -> Self {
        Self {
            effective_caller,
            immediate_caller,
            start_time: Instant::now(),
            end_time: None,
            queries: Vec::new(),
            autocommit,
            conclusion: String::new(),
            stats,
        }
    }

    /// Record one query executed inside the transaction.
    pub fn record_query(&mut self, query: &str) {
        self.queries.push(query.to_string());
    }
}

/// Structured record emitted to the transaction log.
#[derive(Debug, Serialize)]
pub struct TxLogRecord {
    pub conn_id: i64,
    pub conclusion: String,
    pub duration_ns: u64,
    pub autocommit: bool,
    pub queries: Vec<String>,
    pub effective_caller: String,
    pub immediate_caller: String,
}
