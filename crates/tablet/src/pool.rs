//! Pool-facing contract of the stateful tier.
//!
//! The pool primitive is external; the stateful connection only needs these
//! three hooks. `unregister` and `mark_as_not_in_use` must tolerate repeated
//! calls for connections the pool no longer tracks.

use kmx_common::{ConnId, Result};
use tonic::async_trait;

use crate::stateful_connection::StatefulConnection;

/// Hooks the stateful connection invokes on its owning pool.
#[async_trait]
pub trait StatefulPool: Send + Sync {
    /// The connection is gone for good; drop it from the registry.
    fn unregister(&self, conn_id: ConnId, reason: &str);

    /// Park an in-use connection back into the pool. `update_time` refreshes
    /// its idle clock; transactions keep the original time so their age is
    /// measured from BEGIN.
    fn mark_as_not_in_use(&self, conn_id: ConnId, update_time: bool);

    /// Replace the connection's backend with a fresh one, keeping it
    /// registered.
    async fn renew_conn(&self, sc: &mut StatefulConnection) -> Result<()>;
}
