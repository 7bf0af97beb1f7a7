// Live push channel consumed by the synchronizer
use crate::domain::error::MalformedEvent;
use crate::domain::event::PushEvent;
use crate::domain::query_key::QueryKey;
use async_trait::async_trait;
use futures::stream::BoxStream;

/// One decoded frame. Frames that match neither event shape are delivered
/// as `Err(MalformedEvent)` so the synchronizer can report them.
pub type PushFrame = Result<PushEvent, MalformedEvent>;

/// An outer `Err` is a transport failure and ends the subscription.
pub type PushStream = BoxStream<'static, anyhow::Result<PushFrame>>;

#[async_trait]
pub trait PushChannel: Send + Sync {
    /// Open a subscription telling the server which query to push
    /// snapshots for. Raw points are pushed regardless of the query.
    async fn subscribe(&self, key: &QueryKey) -> anyhow::Result<PushStream>;
}
