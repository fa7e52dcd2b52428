//! Dedicated backend connection pinned to one proxy session.
//!
//! Used for transactions and reserved (session-state-bearing) connections.
//! After use the connection must be returned either with `unlock` (parks it
//! in the pool) or `release` (retires it). A released connection has no
//! backend handle; every operation except the idempotent release paths
//! rejects it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use kmx_common::{
    principal, username, CallerId, ConnId, GatewayCallerId, KmxError, MetricsRegistry,
    RequestContext, Result, TabletConfig, USER_LABEL_DISABLED,
};
use tracing::info;

use crate::backend::{BackendConn, QueryResult, Setting};
use crate::pool::StatefulPool;
use crate::tx::{ReleaseReason, TxLogRecord, TxProperties};

/// Environment handle of the storage tier: configuration, metrics, and the
/// MySQL health checker.
pub trait TabletEnv: Send + Sync {
    /// Tablet configuration.
    fn config(&self) -> &TabletConfig;
    /// Process metrics registry.
    fn metrics(&self) -> &MetricsRegistry;
    /// Ask the health loop to probe MySQL; called when a backend error looks
    /// like a dead server.
    fn check_mysql(&self);
}

/// Reserved-connection metadata.
#[derive(Debug, Clone)]
pub struct Properties {
    pub effective_caller: Option<CallerId>,
    pub immediate_caller: Option<GatewayCallerId>,
    pub start_time: Instant,
    /// Sink for per-reason release accounting.
    pub stats: MetricsRegistry,
}

fn reserved_username(props: &Properties) -> &str {
    let p = principal(props.effective_caller.as_ref());
    if !p.is_empty() {
        return p;
    }
    username(props.immediate_caller.as_ref())
}

/// A dedicated backend connection with transaction and reservation state.
pub struct StatefulConnection {
    pool: Option<Arc<dyn StatefulPool>>,
    db_conn: Option<Box<dyn BackendConn>>,
    conn_id: ConnId,
    env: Arc<dyn TabletEnv>,
    tx_props: Option<TxProperties>,
    reserved_props: Option<Properties>,
    tainted: bool,
    enforce_timeout: bool,
    timeout: Duration,
    expiry_time: Instant,
}

impl StatefulConnection {
    /// Connection registered by the pool under `conn_id`.
    pub fn new(
        pool: Option<Arc<dyn StatefulPool>>,
        db_conn: Box<dyn BackendConn>,
        conn_id: ConnId,
        env: Arc<dyn TabletEnv>,
        enforce_timeout: bool,
    ) -> Self {
        Self {
            pool,
            db_conn: Some(db_conn),
            conn_id,
            env,
            tx_props: None,
            reserved_props: None,
            tainted: false,
            enforce_timeout,
            timeout: Duration::ZERO,
            expiry_time: Instant::now(),
        }
    }

    /// Logical id assigned by the pool.
    pub fn conn_id(&self) -> ConnId {
        self.conn_id
    }

    /// Close the underlying connection without releasing; a later unlock
    /// will notice and release.
    pub fn close(&mut self) {
        if let Some(conn) = self.db_conn.as_mut() {
            conn.close();
        }
    }

    /// True when the connection can no longer execute queries.
    pub fn is_closed(&self) -> bool {
        match &self.db_conn {
            None => true,
            Some(conn) => conn.is_closed(),
        }
    }

    /// True when the connection has transaction state.
    pub fn is_in_transaction(&self) -> bool {
        self.tx_props.is_some()
    }

    /// True when the connection carries reserved session state.
    pub fn is_tainted(&self) -> bool {
        self.tainted
    }

    /// Advisory expiry check used by the pool sweeper; never closes the
    /// connection itself.
    pub fn elapsed_timeout(&self) -> bool {
        if !self.enforce_timeout {
            return false;
        }
        if self.timeout.is_zero() {
            return false;
        }
        self.expiry_time < Instant::now()
    }

    /// Execute a statement on the dedicated connection, without client-side
    /// retries.
    pub async fn exec(
        &mut self,
        ctx: &RequestContext,
        query: &str,
        max_rows: usize,
        want_fields: bool,
    ) -> Result<QueryResult> {
        if self.is_closed() {
            return Err(self.aborted_error());
        }
        let Some(conn) = self.db_conn.as_mut() else {
            return Err(KmxError::Aborted("connection was aborted".to_string()));
        };
        match conn.exec_once(ctx, query, max_rows, want_fields).await {
            Ok(result) => Ok(result),
            Err(err) => {
                if err.is_conn_err() && !ctx.is_cancelled() {
                    // A canceled caller means the query was killed on
                    // purpose; only probe MySQL for unexplained failures.
                    self.env.check_mysql();
                }
                Err(err)
            }
        }
    }

    fn aborted_error(&self) -> KmxError {
        match &self.tx_props {
            Some(tx) => KmxError::Aborted(format!("transaction was aborted: {}", tx.conclusion)),
            None => KmxError::Aborted("connection was aborted".to_string()),
        }
    }

    /// Execute with the backend's retry behavior, returning the opaque
    /// session-state-changes blob.
    pub async fn exec_with_retry(
        &mut self,
        ctx: &RequestContext,
        query: &str,
        max_rows: usize,
        want_fields: bool,
    ) -> Result<String> {
        let Some(conn) = self.db_conn.as_mut().filter(|c| !c.is_closed()) else {
            return Err(KmxError::Canceled("connection is closed".to_string()));
        };
        let result = conn.exec(ctx, query, max_rows, want_fields).await?;
        Ok(result.session_state_changes)
    }

    /// Fetch the next result set.
    pub async fn fetch_next(
        &mut self,
        ctx: &RequestContext,
        max_rows: usize,
        want_fields: bool,
    ) -> Result<QueryResult> {
        let Some(conn) = self.db_conn.as_mut().filter(|c| !c.is_closed()) else {
            return Err(KmxError::Canceled("connection is closed".to_string()));
        };
        conn.fetch_next(ctx, max_rows, want_fields).await
    }

    /// Park the connection back in the pool. Inside a transaction the idle
    /// clock keeps counting from BEGIN, so the time is not refreshed.
    ///
    /// Idempotent.
    pub fn unlock(&mut self) {
        let update_time = !self.is_in_transaction();
        self.unlock_inner(update_time);
    }

    /// Park the connection, always refreshing its idle clock.
    ///
    /// Idempotent.
    pub fn unlock_update_time(&mut self) {
        self.unlock_inner(true);
    }

    fn unlock_inner(&mut self, update_time: bool) {
        let Some(conn) = &self.db_conn else {
            return;
        };
        if conn.is_closed() {
            self.release_string("unlocked closed connection");
        } else if let Some(pool) = &self.pool {
            pool.mark_as_not_in_use(self.conn_id, update_time);
        }
    }

    /// Retire the connection for good.
    ///
    /// Idempotent; a released connection is a no-op.
    pub fn release(&mut self, reason: ReleaseReason) {
        self.release_string(&reason.to_string());
    }

    /// Retire the connection with a free-form reason.
    pub fn release_string(&mut self, reason: &str) {
        let Some(conn) = self.db_conn.take() else {
            return;
        };
        if let Some(pool) = &self.pool {
            pool.unregister(self.conn_id, reason);
        }
        conn.recycle();
        self.log_reserved_conn(reason);
    }

    /// Replace the backend connection with a fresh one via the pool. On
    /// failure the connection is closed and unusable.
    pub async fn renew(&mut self) -> Result<()> {
        let Some(pool) = self.pool.clone() else {
            return Err(KmxError::FailedPrecondition(
                "connection does not belong to a pool".to_string(),
            ));
        };
        if let Err(err) = pool.renew_conn(self).await {
            self.close();
            return Err(KmxError::wrap("connection renew failed", err));
        }
        Ok(())
    }

    /// Install a new backend handle; called by the pool during renew.
    pub fn replace_backend(&mut self, db_conn: Box<dyn BackendConn>, conn_id: ConnId) {
        self.db_conn = Some(db_conn);
        self.conn_id = conn_id;
    }

    /// Text of the currently executing query, when a backend is attached.
    pub fn current(&self) -> Option<String> {
        self.db_conn.as_ref().map(|c| c.current())
    }

    /// MySQL connection id of the backend, when attached.
    pub fn backend_id(&self) -> Option<i64> {
        self.db_conn.as_ref().map(|c| c.id())
    }

    /// Kill the currently executing query and connection.
    pub async fn kill(&mut self, reason: &str, elapsed: Duration) -> Result<()> {
        match self.db_conn.as_mut() {
            Some(conn) => conn.kill(reason, elapsed).await,
            None => Err(KmxError::Canceled("connection is closed".to_string())),
        }
    }

    /// Transactional properties, when inside a transaction.
    pub fn tx_properties(&self) -> Option<&TxProperties> {
        self.tx_props.as_ref()
    }

    /// Mutable transactional properties.
    pub fn tx_properties_mut(&mut self) -> Option<&mut TxProperties> {
        self.tx_props.as_mut()
    }

    /// Enter a transaction; called by the transaction engine after BEGIN
    /// succeeds on the backend.
    pub fn set_tx_properties(&mut self, props: TxProperties) {
        self.tx_props = Some(props);
    }

    /// Clear transaction state after it has been logged.
    pub fn clean_tx_state(&mut self) {
        self.tx_props = None;
    }

    /// Reserve the connection for its session: record who owns it, mark the
    /// backend as carrying session state, and start per-user accounting.
    pub fn taint(&mut self, ctx: &RequestContext, stats: MetricsRegistry) -> Result<()> {
        if self.db_conn.is_none() {
            return Err(KmxError::FailedPrecondition(
                "connection is closed".to_string(),
            ));
        }
        if self.tainted {
            return Err(KmxError::FailedPrecondition(
                "connection is already reserved".to_string(),
            ));
        }

        let props = Properties {
            effective_caller: ctx.effective_caller().cloned(),
            immediate_caller: ctx.immediate_caller().cloned(),
            start_time: Instant::now(),
            stats,
        };
        let user = reserved_username(&props).to_string();
        self.tainted = true;
        self.reserved_props = Some(props);
        if let Some(conn) = self.db_conn.as_mut() {
            conn.taint();
        }

        let metrics = self.env.metrics();
        if self.env.config().skip_user_metrics {
            metrics.inc_user_active_reserved(USER_LABEL_DISABLED);
        } else {
            metrics.inc_user_active_reserved(&user);
        }
        Ok(())
    }

    /// Reserved-connection metadata, when reserved.
    pub fn reserved_properties(&self) -> Option<&Properties> {
        self.reserved_props.as_ref()
    }

    /// Stamp the transaction conclusion, emit per-user counters, and send
    /// one structured record to the transaction log.
    pub fn log_transaction(&mut self, reason: ReleaseReason) {
        let Some(tx) = self.tx_props.as_mut() else {
            return; // nothing to log without a transaction
        };
        tx.conclusion = reason.name().to_string();
        let end = Instant::now();
        tx.end_time = Some(end);
        let duration = end.duration_since(tx.start_time);
        tx.stats
            .observe_transaction(reason.name(), duration.as_secs_f64());

        let mut user = principal(tx.effective_caller.as_ref()).to_string();
        if user.is_empty() {
            user = username(tx.immediate_caller.as_ref()).to_string();
        }
        if !self.env.config().skip_user_metrics {
            self.env.metrics().record_user_transaction(
                &user,
                reason.name(),
                duration.as_nanos() as u64,
            );
        }

        let record = TxLogRecord {
            conn_id: self.conn_id.0,
            conclusion: reason.name().to_string(),
            duration_ns: duration.as_nanos() as u64,
            autocommit: tx.autocommit,
            queries: tx.queries.clone(),
            effective_caller: principal(tx.effective_caller.as_ref()).to_string(),
            immediate_caller: username(tx.immediate_caller.as_ref()).to_string(),
        };
        info!(
            target: "tx_log",
            record = %serde_json::to_string(&record).unwrap_or_default(),
            "transaction concluded"
        );
    }

    /// Apply a session setting, skipping the round trip when the identical
    /// setting is already in place.
    pub async fn apply_setting(
        &mut self,
        ctx: &RequestContext,
        setting: Arc<Setting>,
    ) -> Result<bool> {
        let Some(conn) = self.db_conn.as_mut() else {
            return Err(KmxError::Canceled("connection is closed".to_string()));
        };
        if let Some(current) = conn.setting() {
            if Arc::ptr_eq(&current, &setting) {
                return Ok(false);
            }
        }
        conn.apply_setting(ctx, setting).await?;
        Ok(true)
    }

    /// Set the inactivity timeout and restart the expiry clock.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
        self.reset_expiry_time();
    }

    fn reset_expiry_time(&mut self) {
        self.expiry_time = Instant::now() + self.timeout;
    }

    /// Whether the backend talks over a unix socket.
    pub fn is_unix_socket(&self) -> bool {
        self.db_conn
            .as_ref()
            .map(|c| c.is_unix_socket())
            .unwrap_or(false)
    }

    // Reserved-connection release accounting.
    fn log_reserved_conn(&mut self, reason: &str) {
        let Some(props) = &self.reserved_props else {
            return; // not a reserved connection
        };
        props.stats.record_release_reason(reason);
        let held_ns = props.start_time.elapsed().as_nanos() as u64;
        let user = reserved_username(props).to_string();

        let metrics = self.env.metrics();
        if self.env.config().skip_user_metrics {
            metrics.dec_user_active_reserved(USER_LABEL_DISABLED);
        } else {
            metrics.dec_user_active_reserved(&user);
            metrics.record_reserved_release(&user, held_ns);
        }
    }
}
