//! Caller identity and per-request cancellation context.
//!
//! Every storage-tier operation takes a [`RequestContext`]: the routing tier
//! records who is acting (effective and immediate caller) and the context
//! carries a cancellation token so backend errors can be classified as
//! caller-cancellation versus a dead server.

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Effective caller identity set by the application talking to the proxy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerId {
    /// Security principal on whose behalf the request runs.
    pub principal: String,
    /// Application component issuing the request.
    pub component: String,
    /// Finer-grained subcomponent, when reported.
    pub subcomponent: String,
}

/// Immediate caller identity: the proxy-session user as authenticated by the
/// routing tier.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayCallerId {
    /// Authenticated session username.
    pub username: String,
}

/// Principal of an optional effective caller; empty when absent.
pub fn principal(id: Option<&CallerId>) -> &str {
    id.map(|c| c.principal.as_str()).unwrap_or("")
}

/// Username of an optional immediate caller; empty when absent.
pub fn username(id: Option<&GatewayCallerId>) -> &str {
    id.map(|c| c.username.as_str()).unwrap_or("")
}

/// Per-request context: caller identities plus a cancellation token.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    cancel: CancellationToken,
    effective_caller: Option<CallerId>,
    immediate_caller: Option<GatewayCallerId>,
}

impl RequestContext {
    /// Context with no caller identity.
    pub fn new() -> Self {
        Self::default()
    }

    /// Context carrying the given caller identities.
    pub fn with_callers(
        effective: Option<CallerId>,
        immediate: Option<GatewayCallerId>,
    ) -> Self {
        Self {
            cancel: CancellationToken::new(),
            effective_caller: effective,
            immediate_caller: immediate,
        }
    }

    /// The cancellation token backing this request.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Request the operation be abandoned.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether the caller has abandoned this request.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Effective caller identity, when set.
    pub fn effective_caller(&self) -> Option<&CallerId> {
        self.effective_caller.as_ref()
    }

    /// Immediate caller identity, when set.
    pub fn immediate_caller(&self) -> Option<&GatewayCallerId> {
        self.immediate_caller.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::{principal, username, CallerId, GatewayCallerId, RequestContext};

    #[test]
    fn cancellation_is_observable() {
        let ctx = RequestContext::new();
        assert!(!ctx.is_cancelled());
        ctx.cancel();
        assert!(ctx.is_cancelled());
    }

    #[test]
    fn caller_helpers_default_to_empty() {
        assert_eq!(principal(None), "");
        assert_eq!(username(None), "");
        let ctx = RequestContext::with_callers(
            Some(CallerId {
                principal: "svc".to_string(),
                ..Default::default()
            }),
            Some(GatewayCallerId {
                username: "alice".to_string(),
            }),
        );
        assert_eq!(principal(ctx.effective_caller()), "svc");
        assert_eq!(username(ctx.immediate_caller()), "alice");
    }
}
