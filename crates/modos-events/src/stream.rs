use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::Stream;
use modos_protocol::StreamChunk;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;

use crate::bus::{EventBus, ListenerId};
use crate::pending::RequestIdClaim;

/// Chunks published on one `stream.<request_id>` channel.
///
/// Yields data chunks, then the `done` chunk, then ends. The bus listener is
/// detached as soon as `done` is seen or the subscription is dropped.
pub struct StreamSubscription {
    bus: EventBus,
    channel: String,
    listener: Option<ListenerId>,
    chunks: UnboundedReceiverStream<StreamChunk>,
    _claim: Option<RequestIdClaim>,
}

impl StreamSubscription {
    pub(crate) fn new(
        bus: EventBus,
        channel: String,
        listener: ListenerId,
        receiver: mpsc::UnboundedReceiver<StreamChunk>,
    ) -> Self {
        Self {
            bus,
            channel,
            listener: Some(listener),
            chunks: UnboundedReceiverStream::new(receiver),
            _claim: None,
        }
    }

    /// Keep `claim` reserved until the subscription is dropped.
    pub fn hold(mut self, claim: RequestIdClaim) -> Self {
        self._claim = Some(claim);
        self
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn is_attached(&self) -> bool {
        self.listener.is_some()
    }

    fn detach(&mut self) {
        if let Some(listener) = self.listener.take() {
            self.bus.off(&self.channel, listener);
            debug!(channel = %self.channel, "stream listener detached");
        }
    }
}

impl Stream for StreamSubscription {
    type Item = StreamChunk;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.listener.is_none() {
            return Poll::Ready(None);
        }
        match Pin::new(&mut this.chunks).poll_next(cx) {
            Poll::Ready(Some(chunk)) => {
                if chunk.done {
                    this.detach();
                }
                Poll::Ready(Some(chunk))
            }
            Poll::Ready(None) => {
                this.detach();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for StreamSubscription {
    fn drop(&mut self) {
        self.detach();
    }
}
