//! The seam between the engine and the protocol libraries beneath it.
//!
//! Implementations only move bytes: they report transport-level failures as
//! `Err(TransportError)` and item-level failures inside the returned vector.
//! Session bookkeeping, deadlines and retries live above this layer.

use async_trait::async_trait;
use eipua_core::{DataKind, GatewayError, ProtocolError, Quality, TransportError, Value};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub type ItemResult<T> = Result<T, ProtocolError>;

#[async_trait]
pub trait DeviceTransport: Send {
    async fn connect(&mut self, endpoint: &str) -> Result<(), TransportError>;

    /// Read a batch of address paths. The returned vector matches `paths`
    /// index for index.
    async fn read_batch(&mut self, paths: &[String]) -> Result<Vec<ItemResult<Value>>, TransportError>;

    /// Lightweight liveness read, e.g. the identity object.
    async fn heartbeat(&mut self) -> Result<(), TransportError>;

    async fn disconnect(&mut self) -> Result<(), TransportError>;

    /// Largest number of paths one `read_batch` call may carry.
    fn max_batch(&self) -> usize {
        usize::MAX
    }
}

/// Node the publisher maintains on the server for one tag.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeSpec {
    pub node_id: String,
    pub browse_name: String,
    pub kind: DataKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureOutcome {
    Existing,
    Created,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeWrite {
    pub node_id: String,
    /// `None` writes a status-only value.
    pub value: Option<Value>,
    pub quality: Quality,
    pub source_timestamp_us: u64,
}

#[async_trait]
pub trait ServerTransport: Send {
    async fn connect(&mut self, endpoint: &str) -> Result<(), TransportError>;

    /// Make sure each node exists, creating the missing ones. Must be
    /// idempotent per `node_id`.
    async fn ensure_nodes(
        &mut self,
        nodes: &[NodeSpec],
    ) -> Result<Vec<ItemResult<EnsureOutcome>>, TransportError>;

    async fn write(&mut self, writes: &[NodeWrite]) -> Result<Vec<ItemResult<()>>, TransportError>;

    async fn ping(&mut self) -> Result<(), TransportError>;

    async fn disconnect(&mut self) -> Result<(), TransportError>;
}

/// Run `fut` under a deadline and the shutdown token.
pub async fn bounded<F, T>(
    cancel: &CancellationToken,
    op: &'static str,
    after: Duration,
    fut: F,
) -> Result<T, GatewayError>
where
    F: Future<Output = Result<T, TransportError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(GatewayError::Cancelled),
        res = tokio::time::timeout(after, fut) => match res {
            Ok(inner) => inner.map_err(GatewayError::from),
            Err(_) => Err(TransportError::Timeout { op, after }.into()),
        },
    }
}

/// Clock reading on tokio's clock, so paused-time tests drive every deadline.
pub fn now() -> std::time::Instant {
    tokio::time::Instant::now().into_std()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn bounded_times_out() {
        let cancel = CancellationToken::new();
        let res: Result<(), _> = bounded(&cancel, "read", Duration::from_secs(2), async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(())
        })
        .await;
        assert!(matches!(
            res,
            Err(GatewayError::Transport(TransportError::Timeout { op: "read", .. }))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_observes_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let res: Result<(), _> = bounded(&cancel, "connect", Duration::from_secs(2), async {
            std::future::pending::<()>().await;
            Ok(())
        })
        .await;
        assert!(matches!(res, Err(GatewayError::Cancelled)));
    }
}
