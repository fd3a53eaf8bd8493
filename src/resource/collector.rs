//! Collector function contract
//!
//! A collector lists one resource type in one region through a provider SDK
//! and writes each raw item into a [`ResultSender`]. It must honor
//! cancellation of its [`CollectContext`]. Collectors of the
//! `DetailWithCancel` flavor also receive the cancellation token and may
//! end their own pipeline early.

use super::services::CloudServices;
use crate::error::CollectError;
use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Boxed future returned by collector functions
pub type CollectFuture = BoxFuture<'static, anyhow::Result<()>>;

type DetailFn =
    dyn Fn(CollectContext, Arc<dyn CloudServices>, ResultSender) -> CollectFuture + Send + Sync;

type DetailWithCancelFn = dyn Fn(CollectContext, CancellationToken, Arc<dyn CloudServices>, ResultSender) -> CollectFuture
    + Send
    + Sync;

/// One of the two collector signatures
#[derive(Clone)]
pub enum Collector {
    /// Runs to completion or returns an error
    Detail(Arc<DetailFn>),
    /// May call `cancel()` to end its own pipeline; the pipeline then waits
    /// for cancellation or the deadline before finishing the region.
    DetailWithCancel(Arc<DetailWithCancelFn>),
}

impl Collector {
    pub fn detail<F, Fut>(f: F) -> Self
    where
        F: Fn(CollectContext, Arc<dyn CloudServices>, ResultSender) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self::Detail(Arc::new(move |ctx, services, tx| Box::pin(f(ctx, services, tx))))
    }

    pub fn detail_with_cancel<F, Fut>(f: F) -> Self
    where
        F: Fn(CollectContext, CancellationToken, Arc<dyn CloudServices>, ResultSender) -> Fut
            + Send
            + Sync
            + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self::DetailWithCancel(Arc::new(move |ctx, cancel, services, tx| {
            Box::pin(f(ctx, cancel, services, tx))
        }))
    }

    pub fn is_cancellable(&self) -> bool {
        matches!(self, Self::DetailWithCancel(_))
    }
}

impl fmt::Debug for Collector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Detail(_) => f.write_str("Collector::Detail"),
            Self::DetailWithCancel(_) => f.write_str("Collector::DetailWithCancel"),
        }
    }
}

/// Identity and cancellation of one region pass
#[derive(Debug, Clone)]
pub struct CollectContext {
    pub cloud_account_id: String,
    pub platform: String,
    pub region: String,
    pub resource_type: String,
    /// Version tag of this collection, also used as trace id
    pub trace_id: String,
    token: CancellationToken,
}

impl CollectContext {
    pub fn new(
        cloud_account_id: &str,
        platform: &str,
        region: &str,
        resource_type: &str,
        trace_id: &str,
        token: CancellationToken,
    ) -> Self {
        Self {
            cloud_account_id: cloud_account_id.to_string(),
            platform: platform.to_string(),
            region: region.to_string(),
            resource_type: resource_type.to_string(),
            trace_id: trace_id.to_string(),
            token,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the pass is cancelled or its deadline elapses
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}

/// Writing half of the raw-item channel
///
/// Sending after the consumer closed the channel on its idle timeout yields
/// [`CollectError::ChannelClosed`].
#[derive(Debug, Clone)]
pub struct ResultSender {
    tx: mpsc::Sender<Value>,
    idle_timeout: Duration,
}

impl ResultSender {
    pub(crate) fn new(tx: mpsc::Sender<Value>, idle_timeout: Duration) -> Self {
        Self { tx, idle_timeout }
    }

    /// Serialize and send one raw item
    pub async fn send<T: Serialize + ?Sized>(&self, item: &T) -> Result<(), CollectError> {
        let value =
            serde_json::to_value(item).map_err(|e| CollectError::Transform(e.to_string()))?;
        self.send_value(value).await
    }

    pub async fn send_value(&self, value: Value) -> Result<(), CollectError> {
        self.tx
            .send(value)
            .await
            .map_err(|_| CollectError::ChannelClosed(self.idle_timeout))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_send_serializes_items() {
        let (tx, mut rx) = mpsc::channel(4);
        let sender = ResultSender::new(tx, Duration::from_secs(5));

        #[derive(Serialize)]
        #[serde(rename_all = "PascalCase")]
        struct Instance {
            instance_id: String,
        }

        sender
            .send(&Instance {
                instance_id: "i-1".into(),
            })
            .await
            .unwrap();

        assert_eq!(rx.recv().await.unwrap(), json!({"InstanceId": "i-1"}));
    }

    #[tokio::test]
    async fn test_send_on_closed_channel_is_an_error() {
        let (tx, mut rx) = mpsc::channel(4);
        let sender = ResultSender::new(tx, Duration::from_secs(5));
        rx.close();

        let err = sender.send_value(json!(1)).await.unwrap_err();
        assert!(matches!(err, CollectError::ChannelClosed(_)));
        assert!(sender.is_closed());
    }

    #[tokio::test]
    async fn test_context_observes_cancellation() {
        let token = CancellationToken::new();
        let ctx = CollectContext::new("acc", "AWS", "us-east-1", "EC2", "v1", token.clone());
        assert!(!ctx.is_cancelled());

        token.cancel();
        ctx.cancelled().await;
        assert!(ctx.is_cancelled());
    }

    #[test]
    fn test_collector_flavor() {
        let plain = Collector::detail(|_, _, _| async { Ok(()) });
        let cancellable = Collector::detail_with_cancel(|_, cancel, _, _| async move {
            cancel.cancel();
            Ok(())
        });
        assert!(!plain.is_cancellable());
        assert!(cancellable.is_cancellable());
        assert_eq!(format!("{:?}", plain), "Collector::Detail");
    }
}
