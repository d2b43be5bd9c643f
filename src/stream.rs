/*
 * rescenter - Resource aggregation and transaction engine for software centers.
 * Copyright (C) 2025  compiledkernel-idk and rescenter contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! Batched result streams.
//!
//! A [`ResultsStream`] carries the batches one backend found for one query.
//! The producing side is a [`StreamSender`]: batches go out in the order they
//! are sent, and the stream ends exactly once, either through
//! [`StreamSender::finish`] or because the sender was dropped. After that the
//! stream yields nothing more.

use futures::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::resource::StreamResult;

enum StreamEvent {
    Batch(Vec<StreamResult>),
    Finished,
}

/// Producer half of a [`ResultsStream`]
#[derive(Debug)]
pub struct StreamSender {
    name: String,
    tx: mpsc::UnboundedSender<StreamEvent>,
}

impl StreamSender {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue a batch; empty batches are skipped. Returns false once the consumer is gone.
    pub fn send(&self, batch: Vec<StreamResult>) -> bool {
        if batch.is_empty() {
            return !self.tx.is_closed();
        }
        self.tx.send(StreamEvent::Batch(batch)).is_ok()
    }

    /// True when the consumer cancelled or dropped the stream
    pub fn is_cancelled(&self) -> bool {
        self.tx.is_closed()
    }

    /// Resolves when the consumer cancels or drops the stream
    pub async fn cancelled(&self) {
        self.tx.closed().await
    }

    /// Terminal signal
    pub fn finish(self) {
        let _ = self.tx.send(StreamEvent::Finished);
    }
}

/// Consumer half: a `Stream` of non-empty batches that ends on the terminal signal
pub struct ResultsStream {
    name: String,
    backend: Option<String>,
    rx: mpsc::UnboundedReceiver<StreamEvent>,
    received: usize,
    terminated: bool,
}

impl std::fmt::Debug for ResultsStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultsStream")
            .field("name", &self.name)
            .field("backend", &self.backend)
            .field("received", &self.received)
            .field("terminated", &self.terminated)
            .finish()
    }
}

impl ResultsStream {
    /// Create a connected sender/stream pair
    pub fn channel(name: impl Into<String>) -> (StreamSender, ResultsStream) {
        let name = name.into();
        let (tx, rx) = mpsc::unbounded_channel();
        (
            StreamSender {
                name: name.clone(),
                tx,
            },
            ResultsStream {
                name,
                backend: None,
                rx,
                received: 0,
                terminated: false,
            },
        )
    }

    /// Stream that already holds all of its results
    pub fn from_results(name: impl Into<String>, results: Vec<StreamResult>) -> ResultsStream {
        let (tx, stream) = Self::channel(name);
        tx.send(results);
        tx.finish();
        stream
    }

    /// Stream that is terminal right away
    pub fn empty(name: impl Into<String>) -> ResultsStream {
        Self::from_results(name, Vec::new())
    }

    pub fn with_backend(mut self, backend: impl Into<String>) -> Self {
        self.backend = Some(backend.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn backend(&self) -> Option<&str> {
        self.backend.as_deref()
    }

    /// Number of resources delivered to the consumer so far
    pub fn result_count(&self) -> usize {
        self.received
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Stop consuming; the producer sees the stream as cancelled
    pub fn cancel(&mut self) {
        self.rx.close();
        self.terminated = true;
    }

    /// Next batch, or `None` once terminal
    pub async fn next_batch(&mut self) -> Option<Vec<StreamResult>> {
        futures::future::poll_fn(|cx| Pin::new(&mut *self).poll_next(cx)).await
    }

    /// Drain the stream into one vector
    pub async fn collect_all(mut self) -> Vec<StreamResult> {
        let mut all = Vec::new();
        while let Some(batch) = self.next_batch().await {
            all.extend(batch);
        }
        all
    }
}

impl Stream for ResultsStream {
    type Item = Vec<StreamResult>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.terminated {
            return Poll::Ready(None);
        }
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(StreamEvent::Batch(batch))) => {
                self.received += batch.len();
                Poll::Ready(Some(batch))
            }
            Poll::Ready(Some(StreamEvent::Finished)) | Poll::Ready(None) => {
                self.terminated = true;
                self.rx.close();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Send `results` in slices of `slice_size`, pausing between slices so long
/// listings do not monopolize the runtime. Stops early if the consumer left.
pub async fn send_in_slices(
    sender: &StreamSender,
    results: Vec<StreamResult>,
    slice_size: usize,
    pause: Duration,
) -> bool {
    let slice_size = slice_size.max(1);
    let mut iter = results.into_iter().peekable();
    while iter.peek().is_some() {
        let batch: Vec<StreamResult> = iter.by_ref().take(slice_size).collect();
        if !sender.send(batch) {
            return false;
        }
        if iter.peek().is_some() {
            if pause.is_zero() {
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(pause).await;
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{Resource, ResourceInfo, ResourceKey, ResourceKind};
    use std::sync::Arc;

    fn results(n: usize) -> Vec<StreamResult> {
        (0..n)
            .map(|i| {
                StreamResult::new(Arc::new(Resource::new(
                    ResourceKey::new("memory", format!("pkg{i}")),
                    ResourceKind::Technical,
                    ResourceInfo::new(format!("pkg{i}"), "local"),
                )))
            })
            .collect()
    }

    #[tokio::test]
    async fn test_batches_then_terminal() {
        let (tx, mut stream) = ResultsStream::channel("test");
        assert!(tx.send(results(2)));
        assert!(tx.send(Vec::new()));
        assert!(tx.send(results(3)));
        tx.finish();

        assert_eq!(stream.next_batch().await.map(|b| b.len()), Some(2));
        assert_eq!(stream.next_batch().await.map(|b| b.len()), Some(3));
        assert!(stream.next_batch().await.is_none());
        assert!(stream.next_batch().await.is_none());
        assert!(stream.is_terminated());
        assert_eq!(stream.result_count(), 5);
    }

    #[tokio::test]
    async fn test_dropped_sender_is_terminal() {
        let (tx, stream) = ResultsStream::channel("dropped");
        tx.send(results(1));
        drop(tx);
        assert_eq!(stream.collect_all().await.len(), 1);
    }

    #[tokio::test]
    async fn test_empty_stream() {
        let mut stream = ResultsStream::empty("nothing");
        assert!(stream.next_batch().await.is_none());
        assert_eq!(stream.result_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_is_seen_by_producer() {
        let (tx, mut stream) = ResultsStream::channel("cancel");
        assert!(!tx.is_cancelled());
        stream.cancel();
        assert!(tx.is_cancelled());
        tx.cancelled().await;
        assert!(!tx.send(results(1)));
        assert!(stream.next_batch().await.is_none());
    }

    #[tokio::test]
    async fn test_send_in_slices_keeps_order() {
        let (tx, mut stream) = ResultsStream::channel("slices");
        let all = results(5);
        let ids: Vec<String> = all.iter().map(|r| r.resource.id().to_string()).collect();
        assert!(send_in_slices(&tx, all, 2, Duration::ZERO).await);
        tx.finish();

        let mut sizes = Vec::new();
        let mut seen = Vec::new();
        while let Some(batch) = stream.next_batch().await {
            sizes.push(batch.len());
            seen.extend(batch.into_iter().map(|r| r.resource.id().to_string()));
        }
        assert_eq!(sizes, vec![2, 2, 1]);
        assert_eq!(seen, ids);
    }
}
