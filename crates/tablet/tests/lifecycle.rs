//! Stateful connection lifecycle against mock backend, pool, and environment.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kmx_common::{
    CallerId, ConnId, ErrorCode, GatewayCallerId, KmxError, MetricsRegistry, RequestContext,
    Result, TabletConfig, USER_LABEL_DISABLED,
};
use kmx_tablet::{
    BackendConn, QueryResult, ReleaseReason, Setting, StatefulConnection, StatefulPool, TabletEnv,
    TxProperties,
};
use tonic::async_trait;

// -----------------------------
// Mocks
// -----------------------------

#[derive(Default)]
struct BackendState {
    closed: AtomicBool,
    tainted: AtomicBool,
    recycled: AtomicBool,
    fail_conn_err: AtomicBool,
    setting: Mutex<Option<Arc<Setting>>>,
}

struct MockBackend {
    id: i64,
    state: Arc<BackendState>,
}

impl MockBackend {
    fn new(id: i64) -> (Self, Arc<BackendState>) {
        let state = Arc::new(BackendState::default());
        (
            Self {
                id,
                state: Arc::clone(&state),
            },
            state,
        )
    }

    fn result() -> QueryResult {
        QueryResult {
            fields: vec!["a".to_string()],
            rows: vec![vec![kmx_sql::Value::Int64(1)]],
            rows_affected: 0,
            session_state_changes: "schema_track".to_string(),
        }
    }
}

#[async_trait]
impl BackendConn for MockBackend {
    async fn exec_once(
        &mut self,
        _ctx: &RequestContext,
        _query: &str,
        _max_rows: usize,
        _want_fields: bool,
    ) -> Result<QueryResult> {
        if self.state.fail_conn_err.load(Ordering::SeqCst) {
            return Err(KmxError::Connection("broken pipe".to_string()));
        }
        Ok(Self::result())
    }

    async fn exec(
        &mut self,
        _ctx: &RequestContext,
        _query: &str,
        _max_rows: usize,
        _want_fields: bool,
    ) -> Result<QueryResult> {
        Ok(Self::result())
    }

    async fn fetch_next(
        &mut self,
        _ctx: &RequestContext,
        _max_rows: usize,
        _want_fields: bool,
    ) -> Result<QueryResult> {
        Ok(Self::result())
    }

    async fn kill(&mut self, _reason: &str, _elapsed: Duration) -> Result<()> {
        self.state.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn apply_setting(
        &mut self,
        _ctx: &RequestContext,
        setting: Arc<Setting>,
    ) -> Result<()> {
        *self.state.setting.lock().expect("setting lock") = Some(setting);
        Ok(())
    }

    fn setting(&self) -> Option<Arc<Setting>> {
        self.state.setting.lock().expect("setting lock").clone()
    }

    fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }

    fn close(&mut self) {
        self.state.closed.store(true, Ordering::SeqCst);
    }

    fn id(&self) -> i64 {
        self.id
    }

    fn current(&self) -> String {
        "select 1".to_string()
    }

    fn taint(&mut self) {
        self.state.tainted.store(true, Ordering::SeqCst);
    }

    fn is_unix_socket(&self) -> bool {
        false
    }

    fn recycle(self: Box<Self>) {
        self.state.recycled.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct MockPool {
    unregistered: Mutex<Vec<(ConnId, String)>>,
    parked: Mutex<Vec<(ConnId, bool)>>,
    fail_renew: AtomicBool,
}

#[async_trait]
impl StatefulPool for MockPool {
    fn unregister(&self, conn_id: ConnId, reason: &str) {
        self.unregistered
            .lock()
            .expect("unregister lock")
            .push((conn_id, reason.to_string()));
    }

    fn mark_as_not_in_use(&self, conn_id: ConnId, update_time: bool) {
        self.parked
            .lock()
            .expect("parked lock")
            .push((conn_id, update_time));
    }

    async fn renew_conn(&self, sc: &mut StatefulConnection) -> Result<()> {
        if self.fail_renew.load(Ordering::SeqCst) {
            return Err(KmxError::Connection("reconnect refused".to_string()));
        }
        let (backend, _) = MockBackend::new(99);
        let new_id = ConnId(sc.conn_id().0 + 1000);
        sc.replace_backend(Box::new(backend), new_id);
        Ok(())
    }
}

struct MockEnv {
    config: TabletConfig,
    metrics: MetricsRegistry,
    mysql_checks: AtomicUsize,
}

impl MockEnv {
    fn new(skip_user_metrics: bool) -> Arc<Self> {
        Arc::new(Self {
            config: TabletConfig {
                skip_user_metrics,
                ..Default::default()
            },
            metrics: MetricsRegistry::new(),
            mysql_checks: AtomicUsize::new(0),
        })
    }
}

impl TabletEnv for MockEnv {
    fn config(&self) -> &TabletConfig {
        &self.config
    }

    fn metrics(&self) -> &MetricsRegistry {
        &self.metrics
    }

    fn check_mysql(&self) {
        self.mysql_checks.fetch_add(1, Ordering::SeqCst);
    }
}

struct Fixture {
    sc: StatefulConnection,
    pool: Arc<MockPool>,
    env: Arc<MockEnv>,
    backend: Arc<BackendState>,
}

fn fixture() -> Fixture {
    fixture_with_env(MockEnv::new(false))
}

fn fixture_with_env(env: Arc<MockEnv>) -> Fixture {
    let pool = Arc::new(MockPool::default());
    let (backend, state) = MockBackend::new(7);
    let sc = StatefulConnection::new(
        Some(pool.clone() as Arc<dyn StatefulPool>),
        Box::new(backend),
        ConnId(1),
        env.clone() as Arc<dyn TabletEnv>,
        true,
    );
    Fixture {
        sc,
        pool,
        env,
        backend: state,
    }
}

fn reserved_ctx(user: &str) -> RequestContext {
    RequestContext::with_callers(
        None,
        Some(GatewayCallerId {
            username: user.to_string(),
        }),
    )
}

// -----------------------------
// Exec paths
// -----------------------------

#[tokio::test]
async fn exec_returns_backend_result() {
    let mut f = fixture();
    let ctx = RequestContext::new();
    let result = f.sc.exec(&ctx, "select 1", 100, true).await.expect("exec");
    assert_eq!(result.rows.len(), 1);
}

#[tokio::test]
async fn exec_after_release_is_aborted_and_unregister_happens_once() {
    let mut f = fixture();
    f.sc.release(ReleaseReason::ConnRelease);

    let ctx = RequestContext::new();
    let err = f.sc.exec(&ctx, "select 1", 100, true).await.expect_err("closed");
    assert_eq!(err.code(), ErrorCode::Aborted);
    assert_eq!(err.to_string(), "connection was aborted");

    // release again: safe no-op
    f.sc.release(ReleaseReason::ConnRelease);
    f.sc.release_string("again");
    assert_eq!(f.pool.unregistered.lock().expect("lock").len(), 1);
    assert!(f.backend.recycled.load(Ordering::SeqCst));
}

#[tokio::test]
async fn exec_after_aborted_transaction_reports_conclusion() {
    let mut f = fixture();
    f.sc.set_tx_properties(TxProperties::new(
        None,
        None,
        false,
        f.env.metrics.clone(),
    ));
    f.sc.log_transaction(ReleaseReason::TxRollback);
    f.sc.release(ReleaseReason::TxRollback);

    let ctx = RequestContext::new();
    let err = f.sc.exec(&ctx, "select 1", 100, true).await.expect_err("closed");
    assert_eq!(err.code(), ErrorCode::Aborted);
    assert_eq!(err.to_string(), "transaction was aborted: Rollback");
}

#[tokio::test]
async fn conn_error_triggers_mysql_check_unless_caller_cancelled() {
    let mut f = fixture();
    f.backend.fail_conn_err.store(true, Ordering::SeqCst);

    let ctx = RequestContext::new();
    let err = f.sc.exec(&ctx, "select 1", 100, true).await.expect_err("conn error");
    assert!(err.is_conn_err());
    assert_eq!(f.env.mysql_checks.load(Ordering::SeqCst), 1);

    let cancelled = RequestContext::new();
    cancelled.cancel();
    let _ = f.sc.exec(&cancelled, "select 1", 100, true).await.expect_err("conn error");
    // the query was killed on purpose; no second probe
    assert_eq!(f.env.mysql_checks.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn exec_with_retry_returns_session_state_changes() {
    let mut f = fixture();
    let ctx = RequestContext::new();
    let changes = f
        .sc
        .exec_with_retry(&ctx, "set names utf8mb4", 0, false)
        .await
        .expect("exec");
    assert_eq!(changes, "schema_track");

    f.sc.release(ReleaseReason::ConnRelease);
    let err = f
        .sc
        .exec_with_retry(&ctx, "set names utf8mb4", 0, false)
        .await
        .expect_err("closed");
    assert_eq!(err.code(), ErrorCode::Canceled);
    assert_eq!(err.to_string(), "connection is closed");
}

#[tokio::test]
async fn fetch_next_requires_open_connection() {
    let mut f = fixture();
    let ctx = RequestContext::new();
    f.sc.fetch_next(&ctx, 100, true).await.expect("fetch");
    f.sc.release(ReleaseReason::ConnRelease);
    let err = f.sc.fetch_next(&ctx, 100, true).await.expect_err("closed");
    assert_eq!(err.code(), ErrorCode::Canceled);
}

// -----------------------------
// Unlock / release
// -----------------------------

#[test]
fn unlock_keeps_transaction_time() {
    let mut f = fixture();
    f.sc.set_tx_properties(TxProperties::new(None, None, false, f.env.metrics.clone()));
    f.sc.unlock();
    assert_eq!(
        f.pool.parked.lock().expect("lock").as_slice(),
        &[(ConnId(1), false)]
    );

    f.sc.clean_tx_state();
    f.sc.unlock();
    assert_eq!(
        f.pool.parked.lock().expect("lock").as_slice(),
        &[(ConnId(1), false), (ConnId(1), true)]
    );

    f.sc.unlock_update_time();
    assert_eq!(f.pool.parked.lock().expect("lock").len(), 3);
}

#[test]
fn unlocking_a_closed_backend_releases_it() {
    let mut f = fixture();
    f.backend.closed.store(true, Ordering::SeqCst);
    f.sc.unlock();
    let unregistered = f.pool.unregistered.lock().expect("lock");
    assert_eq!(unregistered.len(), 1);
    assert_eq!(unregistered[0].1, "unlocked closed connection");
}

#[test]
fn released_connection_is_inert() {
    let mut f = fixture();
    f.sc.release(ReleaseReason::TxCommit);
    assert!(f.sc.is_closed());
    assert_eq!(f.sc.backend_id(), None);
    assert_eq!(f.sc.current(), None);
    // unlock after release: no park, no second unregister
    f.sc.unlock();
    assert!(f.pool.parked.lock().expect("lock").is_empty());
    assert_eq!(f.pool.unregistered.lock().expect("lock").len(), 1);
}

// -----------------------------
// Renew
// -----------------------------

#[tokio::test]
async fn renew_swaps_backend_and_keeps_connection_usable() {
    let mut f = fixture();
    assert_eq!(f.sc.backend_id(), Some(7));
    f.sc.renew().await.expect("renew");
    assert_eq!(f.sc.backend_id(), Some(99));
    assert_eq!(f.sc.conn_id(), ConnId(1001));
    assert!(!f.sc.is_closed());
}

#[tokio::test]
async fn renew_failure_closes_connection_and_wraps_error() {
    let mut f = fixture();
    f.pool.fail_renew.store(true, Ordering::SeqCst);
    let err = f.sc.renew().await.expect_err("renew fails");
    assert!(
        err.to_string().starts_with("connection renew failed"),
        "{err}"
    );
    assert!(f.sc.is_closed());
    assert!(f.backend.closed.load(Ordering::SeqCst));
}

// -----------------------------
// Taint and accounting
// -----------------------------

#[test]
fn taint_reserves_exactly_once() {
    let mut f = fixture();
    let ctx = reserved_ctx("alice");
    f.sc.taint(&ctx, f.env.metrics.clone()).expect("first taint");
    assert!(f.sc.is_tainted());
    assert!(f.backend.tainted.load(Ordering::SeqCst));

    let err = f.sc.taint(&ctx, f.env.metrics.clone()).expect_err("second taint");
    assert_eq!(err.code(), ErrorCode::FailedPrecondition);
    assert_eq!(err.to_string(), "connection is already reserved");
}

#[test]
fn taint_after_release_is_a_precondition_failure() {
    let mut f = fixture();
    f.sc.release(ReleaseReason::ConnRelease);
    let err = f
        .sc
        .taint(&reserved_ctx("alice"), f.env.metrics.clone())
        .expect_err("closed");
    assert_eq!(err.code(), ErrorCode::FailedPrecondition);
    assert_eq!(err.to_string(), "connection is closed");
}

#[test]
fn reserved_metrics_balance_on_release() {
    let mut f = fixture();
    let ctx = reserved_ctx("alice");
    f.sc.taint(&ctx, f.env.metrics.clone()).expect("taint");
    assert_eq!(f.env.metrics.user_active_reserved("alice"), 1.0);

    f.sc.release(ReleaseReason::ConnRelease);
    assert_eq!(f.env.metrics.user_active_reserved("alice"), 0.0);
    assert_eq!(f.env.metrics.user_reserved_total("alice"), 1.0);

    let text = f.env.metrics.render_prometheus();
    assert!(text.contains("kmx_user_reserved_time_ns_total"));
    assert!(text.contains("kmx_reserved_release_total"));
}

#[test]
fn effective_principal_wins_over_immediate_username() {
    let mut f = fixture();
    let ctx = RequestContext::with_callers(
        Some(CallerId {
            principal: "svc".to_string(),
            ..Default::default()
        }),
        Some(GatewayCallerId {
            username: "alice".to_string(),
        }),
    );
    f.sc.taint(&ctx, f.env.metrics.clone()).expect("taint");
    assert_eq!(f.env.metrics.user_active_reserved("svc"), 1.0);
    assert_eq!(f.env.metrics.user_active_reserved("alice"), 0.0);
}

#[test]
fn disabled_user_metrics_use_sentinel_label() {
    let mut f = fixture_with_env(MockEnv::new(true));
    let ctx = reserved_ctx("alice");
    f.sc.taint(&ctx, f.env.metrics.clone()).expect("taint");
    assert_eq!(f.env.metrics.user_active_reserved(USER_LABEL_DISABLED), 1.0);

    f.sc.release(ReleaseReason::ConnRelease);
    assert_eq!(f.env.metrics.user_active_reserved(USER_LABEL_DISABLED), 0.0);
    // per-user totals are suppressed entirely
    assert_eq!(f.env.metrics.user_reserved_total("alice"), 0.0);
    assert_eq!(f.env.metrics.user_reserved_total(USER_LABEL_DISABLED), 0.0);
}

#[test]
fn log_transaction_emits_user_counters() {
    let mut f = fixture();
    f.sc.set_tx_properties(TxProperties::new(
        Some(CallerId {
            principal: "svc".to_string(),
            ..Default::default()
        }),
        Some(GatewayCallerId {
            username: "alice".to_string(),
        }),
        false,
        f.env.metrics.clone(),
    ));
    if let Some(tx) = f.sc.tx_properties_mut() {
        tx.record_query("update t set a = 1");
    }
    f.sc.log_transaction(ReleaseReason::TxCommit);

    assert_eq!(f.env.metrics.user_transaction_total("svc", "Commit"), 1.0);
    assert_eq!(f.env.metrics.user_transaction_total("alice", "Commit"), 0.0);
    let tx = f.sc.tx_properties().expect("tx props");
    assert_eq!(tx.conclusion, "Commit");
    assert!(tx.end_time.is_some());

    // without a transaction, logging is a no-op
    f.sc.clean_tx_state();
    f.sc.log_transaction(ReleaseReason::TxCommit);
    assert_eq!(f.env.metrics.user_transaction_total("svc", "Commit"), 1.0);
}

// -----------------------------
// Settings and timeout
// -----------------------------

#[tokio::test]
async fn apply_setting_skips_identical_pointer() {
    let mut f = fixture();
    let ctx = RequestContext::new();
    let setting = Arc::new(Setting {
        apply_query: "set sql_mode = 'STRICT_ALL_TABLES'".to_string(),
        reset_query: "set sql_mode = default".to_string(),
    });

    assert!(f.sc.apply_setting(&ctx, setting.clone()).await.expect("apply"));
    assert!(!f.sc.apply_setting(&ctx, setting.clone()).await.expect("same"));

    let equal_but_distinct = Arc::new(Setting {
        apply_query: "set sql_mode = 'STRICT_ALL_TABLES'".to_string(),
        reset_query: "set sql_mode = default".to_string(),
    });
    assert!(f
        .sc
        .apply_setting(&ctx, equal_but_distinct)
        .await
        .expect("distinct"));
}

#[test]
fn elapsed_timeout_is_advisory_and_gated() {
    let mut f = fixture();
    // enforce_timeout is set but no timeout configured yet
    assert!(!f.sc.elapsed_timeout());

    f.sc.set_timeout(Duration::from_millis(1));
    std::thread::sleep(Duration::from_millis(5));
    assert!(f.sc.elapsed_timeout());

    f.sc.set_timeout(Duration::from_secs(3600));
    assert!(!f.sc.elapsed_timeout());
}

// -----------------------------
// Pool handout exclusivity
// -----------------------------

// The pool primitive is the single arbiter of ownership; its id allocation
// must never hand the same logical connection to two owners.
#[tokio::test]
async fn concurrent_handouts_never_share_a_conn_id() {
    let next_id = Arc::new(AtomicI64::new(0));
    let mut handles = Vec::new();
    for _ in 0..32 {
        let next_id = Arc::clone(&next_id);
        handles.push(tokio::spawn(async move {
            let env = MockEnv::new(false);
            let (backend, _) = MockBackend::new(1);
            let sc = StatefulConnection::new(
                None,
                Box::new(backend),
                ConnId(next_id.fetch_add(1, Ordering::SeqCst)),
                env as Arc<dyn TabletEnv>,
                false,
            );
            sc.conn_id()
        }));
    }
    let mut seen = std::collections::HashSet::new();
    for handle in handles {
        let id = handle.await.expect("join");
        assert!(seen.insert(id), "duplicate conn id handed out: {id}");
    }
}
