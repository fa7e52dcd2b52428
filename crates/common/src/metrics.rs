use std::sync::{Arc, OnceLock};

use prometheus::{
    CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};

/// Label value substituted for real usernames when user metrics are disabled.
pub const USER_LABEL_DISABLED: &str = "disabled";

/// Process metrics registry for the proxy core.
///
/// Carries the per-user reserved-connection and transaction families reported
/// by the stateful connection manager, plus planner plan-shape counters.
#[derive(Clone, Debug)]
pub struct MetricsRegistry {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    registry: Registry,
    user_active_reserved: GaugeVec,
    user_reserved_total: CounterVec,
    user_reserved_time_ns: CounterVec,
    user_transaction_total: CounterVec,
    user_transaction_time_ns: CounterVec,
    reserved_release_total: CounterVec,
    transaction_seconds: HistogramVec,
    queries_planned: CounterVec,
}

impl MetricsRegistry {
    /// Fresh registry with all families registered.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner::new()),
        }
    }

    /// A reserved connection became active for `user`.
    pub fn inc_user_active_reserved(&self, user: &str) {
        self.inner
            .user_active_reserved
            .with_label_values(&[user])
            .inc();
    }

    /// A reserved connection for `user` was released.
    pub fn dec_user_active_reserved(&self, user: &str) {
        self.inner
            .user_active_reserved
            .with_label_values(&[user])
            .dec();
    }

    /// Currently active reserved connections for `user`.
    pub fn user_active_reserved(&self, user: &str) -> f64 {
        self.inner
            .user_active_reserved
            .with_label_values(&[user])
            .get()
    }

    /// Record one finished reserved connection for `user` held for
    /// `held_ns` nanoseconds.
    pub fn record_reserved_release(&self, user: &str, held_ns: u64) {
        self.inner
            .user_reserved_total
            .with_label_values(&[user])
            .inc();
        self.inner
            .user_reserved_time_ns
            .with_label_values(&[user])
            .inc_by(held_ns as f64);
    }

    /// Total released reserved connections for `user`.
    pub fn user_reserved_total(&self, user: &str) -> f64 {
        self.inner
            .user_reserved_total
            .with_label_values(&[user])
            .get()
    }

    /// Record one concluded transaction for `user`.
    pub fn record_user_transaction(&self, user: &str, conclusion: &str, duration_ns: u64) {
        let labels = [user, conclusion];
        self.inner
            .user_transaction_total
            .with_label_values(&labels)
            .inc();
        self.inner
            .user_transaction_time_ns
            .with_label_values(&labels)
            .inc_by(duration_ns as f64);
    }

    /// Total concluded transactions for `user` with `conclusion`.
    pub fn user_transaction_total(&self, user: &str, conclusion: &str) -> f64 {
        self.inner
            .user_transaction_total
            .with_label_values(&[user, conclusion])
            .get()
    }

    /// Record a reserved-connection release reason (user-independent).
    pub fn record_release_reason(&self, reason: &str) {
        self.inner
            .reserved_release_total
            .with_label_values(&[reason])
            .inc();
    }

    /// Record a transaction conclusion timing (user-independent).
    pub fn observe_transaction(&self, conclusion: &str, secs: f64) {
        self.inner
            .transaction_seconds
            .with_label_values(&[conclusion])
            .observe(secs.max(0.0));
    }

    /// Count one produced plan by outermost primitive kind.
    pub fn record_query_plan(&self, plan: &str) {
        self.inner.queries_planned.with_label_values(&[plan]).inc();
    }

    /// Render all families in Prometheus text exposition format.
    pub fn render_prometheus(&self) -> String {
        let metric_families = self.inner.registry.gather();
        let mut out = Vec::new();
        let enc = TextEncoder::new();
        if enc.encode(&metric_families, &mut out).is_err() {
            return String::new();
        }
        String::from_utf8_lossy(&out).to_string()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsInner {
    fn new() -> Self {
        let registry = Registry::new();

        let user_active_reserved = gauge_vec(
            &registry,
            "kmx_user_active_reserved_count",
            "Currently active reserved connections per user",
            &["user"],
        );
        let user_reserved_total = counter_vec(
            &registry,
            "kmx_user_reserved_total",
            "Released reserved connections per user",
            &["user"],
        );
        let user_reserved_time_ns = counter_vec(
            &registry,
            "kmx_user_reserved_time_ns_total",
            "Nanoseconds reserved connections were held, per user",
            &["user"],
        );
        let user_transaction_total = counter_vec(
            &registry,
            "kmx_user_transaction_total",
            "Concluded transactions per user and conclusion",
            &["user", "conclusion"],
        );
        let user_transaction_time_ns = counter_vec(
            &registry,
            "kmx_user_transaction_time_ns_total",
            "Nanoseconds spent in transactions, per user and conclusion",
            &["user", "conclusion"],
        );
        let reserved_release_total = counter_vec(
            &registry,
            "kmx_reserved_release_total",
            "Reserved connection releases per reason",
            &["reason"],
        );
        let transaction_seconds = histogram_vec(
            &registry,
            "kmx_transaction_seconds",
            "Transaction duration per conclusion",
            &["conclusion"],
        );
        let queries_planned = counter_vec(
            &registry,
            "kmx_queries_planned_total",
            "Plans produced per outermost primitive kind",
            &["plan"],
        );

        Self {
            registry,
            user_active_reserved,
            user_reserved_total,
            user_reserved_time_ns,
            user_transaction_total,
            user_transaction_time_ns,
            reserved_release_total,
            transaction_seconds,
            queries_planned,
        }
    }
}

fn counter_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> CounterVec {
    let c = CounterVec::new(Opts::new(name, help), labels).expect("counter vec");
    registry
        .register(Box::new(c.clone()))
        .expect("register counter");
    c
}

fn gauge_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> GaugeVec {
    let g = GaugeVec::new(Opts::new(name, help), labels).expect("gauge vec");
    registry
        .register(Box::new(g.clone()))
        .expect("register gauge");
    g
}

fn histogram_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> HistogramVec {
    let h = HistogramVec::new(HistogramOpts::new(name, help), labels).expect("histogram vec");
    registry
        .register(Box::new(h.clone()))
        .expect("register histogram");
    h
}

static GLOBAL_METRICS: OnceLock<MetricsRegistry> = OnceLock::new();

/// Process-wide registry used when no explicit one is wired in.
pub fn global_metrics() -> &'static MetricsRegistry {
    GLOBAL_METRICS.get_or_init(MetricsRegistry::new)
}

#[cfg(test)]
mod tests {
    use super::MetricsRegistry;

    #[test]
    fn renders_prometheus_text() {
        let m = MetricsRegistry::new();
        m.inc_user_active_reserved("alice");
        let text = m.render_prometheus();
        assert!(text.contains("kmx_user_active_reserved_count"));
        assert!(text.contains("alice"));
    }

    #[test]
    fn reserved_families_balance() {
        let m = MetricsRegistry::new();
        m.inc_user_active_reserved("bob");
        m.dec_user_active_reserved("bob");
        m.record_reserved_release("bob", 1_500);
        assert_eq!(m.user_active_reserved("bob"), 0.0);
        assert_eq!(m.user_reserved_total("bob"), 1.0);

        let text = m.render_prometheus();
        assert!(text.contains("kmx_user_reserved_total"));
        assert!(text.contains("kmx_user_reserved_time_ns_total"));
    }

    #[test]
    fn transaction_families_carry_conclusion_label() {
        let m = MetricsRegistry::new();
        m.record_user_transaction("carol", "commit", 2_000);
        m.observe_transaction("commit", 0.002);
        assert_eq!(m.user_transaction_total("carol", "commit"), 1.0);
        let text = m.render_prometheus();
        assert!(text.contains("kmx_user_transaction_total"));
        assert!(text.contains("conclusion=\"commit\""));
        assert!(text.contains("kmx_transaction_seconds"));
    }
}
