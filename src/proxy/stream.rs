//! Bounded logging passthrough for streaming payloads.
//!
//! Long-lived server→client streams are forwarded through an explicit
//! bounded channel rather than lazy delegation: the producer is
//! backpressured when the consumer stalls, each chunk is traced for
//! debugging, and chunks pass through unmodified in their original order.
//! A finite stream stays finite; an infinite one stays infinite.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use tokio::sync::mpsc;

/// Capacity of the forwarding channel between producer and HTTP consumer.
pub const STREAM_CHANNEL_CAPACITY: usize = 32;

/// Consumer side of a forwarded stream.
pub struct ChunkStream<T> {
    rx: mpsc::Receiver<T>,
}

impl<T> Stream for ChunkStream<T> {
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

/// Forward `stream` through a bounded channel, tracing every chunk.
///
/// The pump task stops when the source ends or the consumer is dropped.
pub fn forward_chunks<S, T>(label: impl Into<String>, stream: S) -> ChunkStream<T>
where
    S: Stream<Item = T> + Send + 'static,
    T: Send + 'static,
{
    let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
    let label = label.into();

    tokio::spawn(async move {
        futures::pin_mut!(stream);
        let mut sequence: u64 = 0;
        while let Some(chunk) = stream.next().await {
            sequence += 1;
            tracing::trace!(stream = %label, chunk = sequence, "forwarding stream chunk");
            if tx.send(chunk).await.is_err() {
                tracing::debug!(stream = %label, "stream consumer dropped, stopping forward");
                break;
            }
        }
    });

    ChunkStream { rx }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_forward_preserves_order_and_count() {
        let source = futures::stream::iter(0..100u32);
        let forwarded = forward_chunks("test", source);
        let collected: Vec<u32> = forwarded.collect().await;
        assert_eq!(collected, (0..100).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_forward_finite_stream_terminates() {
        let source = futures::stream::iter(vec!["a", "b"]);
        let mut forwarded = forward_chunks("test", source);
        assert_eq!(forwarded.next().await, Some("a"));
        assert_eq!(forwarded.next().await, Some("b"));
        assert_eq!(forwarded.next().await, None);
    }

    #[tokio::test]
    async fn test_forward_applies_backpressure() {
        // With no consumer polling, the pump must stall once the channel is
        // full instead of draining the whole source.
        let produced = Arc::new(AtomicUsize::new(0));
        let counter = produced.clone();
        let source = futures::stream::iter(0..10_000usize).inspect(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let forwarded = forward_chunks("test", source);
        tokio::time::sleep(Duration::from_millis(100)).await;

        let count = produced.load(Ordering::SeqCst);
        assert!(
            count <= STREAM_CHANNEL_CAPACITY + 1,
            "producer ran {} chunks ahead of a stalled consumer",
            count
        );
        drop(forwarded);
    }
}
