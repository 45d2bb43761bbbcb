//! Sync point barrier: wait until no participating session has work in flight

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tracing::debug;

use crate::session::DeviceSession;

/// Wait until every session reports a settled status (not busy, not
/// connecting). Returns `false` if `timeout` elapsed first.
pub(crate) async fn wait_for_quiescence(sessions: &[Arc<dyn DeviceSession>], timeout: Duration) -> bool {
    let waits = sessions.iter().map(|session| {
        let mut rx = session.subscribe();
        let alias = session.alias().to_string();
        async move {
            if rx.wait_for(|info| info.status.is_settled()).await.is_err() {
                debug!("[{}] status channel closed while waiting at sync point", alias);
            }
        }
    });

    tokio::time::timeout(timeout, join_all(waits)).await.is_ok()
}
