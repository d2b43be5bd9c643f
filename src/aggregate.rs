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

//! Fan-in of many backend streams into one.
//!
//! Every child stream is polled from a single task, so consumers see one
//! writer even though producers run concurrently. Batches from the same child
//! keep their order. The aggregate ends when every child ended, when the
//! consumer cancels, or when the optional deadline expires. A deadline is
//! lossy by design: children still running at that point are abandoned and
//! whatever they send later is discarded.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::pin::Pin;
use std::time::Duration;
use tokio::time::Instant;
use tokio_stream::{Stream, StreamExt, StreamMap};
use tracing::{debug, info, warn, Instrument};

use crate::resource::{ResourceKey, StreamResult};
use crate::stream::{ResultsStream, StreamSender};

/// How results reachable from more than one child are merged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DedupPolicy {
    /// Drop repeats of the same backend resource
    #[default]
    Identity,
    /// Also merge resources of different backends sharing an appstream id (first one wins)
    AppstreamId,
    /// Relay everything
    Disabled,
}

/// Per-use-case aggregation settings
#[derive(Debug, Clone)]
pub struct AggregateOptions {
    /// Hard wall-clock cutoff; `None` waits for every child
    pub deadline: Option<Duration>,
    pub dedup: DedupPolicy,
    /// Delay before the first coalesced emission
    pub emission_interval: Duration,
    /// Added to the delay after every emission
    pub emission_backoff: Duration,
    /// Children slower than this are logged
    pub slow_stream_warning: Duration,
}

impl Default for AggregateOptions {
    fn default() -> Self {
        Self {
            deadline: None,
            dedup: DedupPolicy::Identity,
            emission_interval: Duration::ZERO,
            emission_backoff: Duration::from_millis(100),
            slow_stream_warning: Duration::from_secs(5),
        }
    }
}

impl AggregateOptions {
    /// Options for bulk consumers that need a finite answer
    pub fn bounded(deadline: Duration) -> Self {
        Self {
            deadline: Some(deadline),
            ..Self::default()
        }
    }

    pub fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn with_dedup(mut self, dedup: DedupPolicy) -> Self {
        self.dedup = dedup;
        self
    }
}

enum ChildEvent {
    Batch(Vec<StreamResult>),
    Finished,
}

type ChildStream = Pin<Box<dyn Stream<Item = ChildEvent> + Send>>;

/// Builds the merged stream for a set of children
pub struct AggregatedResultsStream;

impl AggregatedResultsStream {
    /// Merge `streams` into one [`ResultsStream`]; must be called inside a tokio runtime
    pub fn new(streams: Vec<ResultsStream>, options: AggregateOptions) -> ResultsStream {
        let (tx, out) = ResultsStream::channel("AggregatedResultsStream");
        if streams.is_empty() {
            debug!("no streams to aggregate");
            tx.finish();
            return out;
        }

        let mut children: StreamMap<usize, ChildStream> = StreamMap::new();
        let mut names = Vec::with_capacity(streams.len());
        for (idx, stream) in streams.into_iter().enumerate() {
            names.push(stream.name().to_string());
            let child: ChildStream = Box::pin(
                stream
                    .map(ChildEvent::Batch)
                    .chain(tokio_stream::once(ChildEvent::Finished)),
            );
            children.insert(idx, child);
        }

        let span = tracing::debug_span!("aggregate", children = names.len());
        tokio::spawn(run(children, names, tx, options).instrument(span));
        out
    }
}

struct Dedup {
    policy: DedupPolicy,
    keys: HashSet<ResourceKey>,
    appstream: HashSet<String>,
}

impl Dedup {
    fn new(policy: DedupPolicy) -> Self {
        Self {
            policy,
            keys: HashSet::new(),
            appstream: HashSet::new(),
        }
    }

    fn admit(&mut self, result: &StreamResult) -> bool {
        match self.policy {
            DedupPolicy::Disabled => true,
            DedupPolicy::Identity => self.keys.insert(result.resource.key().clone()),
            DedupPolicy::AppstreamId => {
                if !self.keys.insert(result.resource.key().clone()) {
                    return false;
                }
                match result.resource.appstream_id() {
                    Some(id) => self.appstream.insert(id.to_lowercase()),
                    None => true,
                }
            }
        }
    }
}

async fn sleep_until_opt(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn run(
    mut children: StreamMap<usize, ChildStream>,
    names: Vec<String>,
    tx: StreamSender,
    options: AggregateOptions,
) {
    let started = Instant::now();
    let deadline = options.deadline.map(|d| started + d);
    let mut dedup = Dedup::new(options.dedup);
    let mut buffer: Vec<StreamResult> = Vec::new();
    let mut interval = options.emission_interval;
    let mut flush_at: Option<Instant> = None;
    let mut relayed = 0usize;
    let mut duplicates = 0usize;

    loop {
        tokio::select! {
            biased;
            _ = tx.cancelled() => {
                debug!(pending = children.len(), "aggregate cancelled by consumer");
                return;
            }
            _ = sleep_until_opt(deadline) => {
                let abandoned: Vec<&str> = children.keys().map(|k| names[*k].as_str()).collect();
                info!(
                    ?abandoned,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "aggregation cutoff reached, results may be partial"
                );
                break;
            }
            _ = sleep_until_opt(flush_at), if !buffer.is_empty() => {
                relayed += buffer.len();
                if !tx.send(std::mem::take(&mut buffer)) {
                    return;
                }
                interval += options.emission_backoff;
                flush_at = None;
            }
            item = children.next() => match item {
                Some((_, ChildEvent::Batch(batch))) => {
                    for result in batch {
                        if dedup.admit(&result) {
                            buffer.push(result);
                        } else {
                            duplicates += 1;
                        }
                    }
                    if !buffer.is_empty() && flush_at.is_none() {
                        flush_at = Some(Instant::now() + interval);
                    }
                }
                Some((idx, ChildEvent::Finished)) => {
                    let elapsed = started.elapsed();
                    if elapsed >= options.slow_stream_warning {
                        warn!(stream = %names[idx], elapsed_ms = elapsed.as_millis() as u64, "stream took really long");
                    } else {
                        debug!(stream = %names[idx], elapsed_ms = elapsed.as_millis() as u64, "stream finished");
                    }
                }
                None => break,
            }
        }
    }

    // Dropping the map detaches any child that is still running.
    drop(children);
    relayed += buffer.len();
    if !buffer.is_empty() {
        tx.send(buffer);
    }
    debug!(relayed, duplicates, "aggregate finished");
    tx.finish();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{Resource, ResourceInfo, ResourceKind, ResourceRef};
    use std::sync::Arc;

    fn res(backend: &str, id: &str, appstream: Option<&str>) -> ResourceRef {
        let r = Resource::new(
            ResourceKey::new(backend, id),
            ResourceKind::Application,
            ResourceInfo::new(id, backend),
        );
        Arc::new(match appstream {
            Some(a) => r.with_appstream_id(a),
            None => r,
        })
    }

    fn batch(backend: &str, ids: &[&str]) -> Vec<StreamResult> {
        ids.iter().map(|id| StreamResult::new(res(backend, id, None))).collect()
    }

    #[tokio::test]
    async fn test_no_children_is_immediately_terminal() {
        let mut out = AggregatedResultsStream::new(Vec::new(), AggregateOptions::default());
        assert!(out.next_batch().await.is_none());
        assert_eq!(out.result_count(), 0);
    }

    #[tokio::test]
    async fn test_three_plus_zero() {
        let a = ResultsStream::from_results("a", batch("a", &["x", "y", "z"]));
        let b = ResultsStream::empty("b");
        let out = AggregatedResultsStream::new(vec![a, b], AggregateOptions::default());
        let all = out.collect_all().await;
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn test_waits_for_every_child() {
        let (tx_a, a) = ResultsStream::channel("a");
        let (tx_b, b) = ResultsStream::channel("b");
        let mut out = AggregatedResultsStream::new(vec![a, b], AggregateOptions::default());

        tx_a.send(batch("a", &["one"]));
        tx_a.finish();
        let first = out.next_batch().await.unwrap();
        assert_eq!(first.len(), 1);

        tx_b.send(batch("b", &["two", "three"]));
        tx_b.finish();
        let mut rest = 0;
        while let Some(b) = out.next_batch().await {
            rest += b.len();
        }
        assert_eq!(rest, 2);
        assert!(out.is_terminated());
    }

    #[tokio::test]
    async fn test_identity_dedup() {
        let shared = res("a", "x", None);
        let a = ResultsStream::from_results("a1", vec![StreamResult::new(shared.clone())]);
        let b = ResultsStream::from_results("a2", vec![StreamResult::new(shared)]);
        let all = AggregatedResultsStream::new(vec![a, b], AggregateOptions::default())
            .collect_all()
            .await;
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn test_appstream_dedup_policy() {
        let make = || {
            vec![
                ResultsStream::from_results("flatpak", vec![StreamResult::new(res("flatpak", "org.gimp.GIMP", Some("org.gimp.GIMP")))]),
                ResultsStream::from_results("native", vec![StreamResult::new(res("native", "gimp", Some("org.gimp.gimp")))]),
            ]
        };
        let merged = AggregatedResultsStream::new(make(), AggregateOptions::default().with_dedup(DedupPolicy::AppstreamId))
            .collect_all()
            .await;
        assert_eq!(merged.len(), 1);

        let separate = AggregatedResultsStream::new(make(), AggregateOptions::default())
            .collect_all()
            .await;
        assert_eq!(separate.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_forces_terminal_with_partial_results() {
        let (tx_slow, slow) = ResultsStream::channel("never-finishes");
        let fast = ResultsStream::from_results("fast", batch("fast", &["a", "b"]));
        tx_slow.send(batch("slow", &["early"]));

        let started = Instant::now();
        let out = AggregatedResultsStream::new(
            vec![slow, fast],
            AggregateOptions::bounded(Duration::from_secs(15)),
        );
        let all = out.collect_all().await;
        let elapsed = started.elapsed();

        assert_eq!(all.len(), 3);
        assert!(elapsed >= Duration::from_secs(15));
        assert!(elapsed < Duration::from_secs(16));
        // Late results of the abandoned child go nowhere
        assert!(tx_slow.is_cancelled());
        assert!(!tx_slow.send(batch("slow", &["late"])));
    }

    #[tokio::test]
    async fn test_consumer_cancel_reaches_children() {
        let (tx_child, child) = ResultsStream::channel("child");
        let mut out = AggregatedResultsStream::new(vec![child], AggregateOptions::default());
        out.cancel();
        tokio::time::timeout(Duration::from_secs(5), tx_child.cancelled())
            .await
            .expect("child should observe cancellation");
    }

    #[tokio::test(start_paused = true)]
    async fn test_coalesces_close_batches() {
        let (tx, child) = ResultsStream::channel("burst");
        let options = AggregateOptions {
            emission_interval: Duration::from_millis(50),
            ..AggregateOptions::default()
        };
        let mut out = AggregatedResultsStream::new(vec![child], options);
        tx.send(batch("m", &["a"]));
        tx.send(batch("m", &["b"]));
        tx.send(batch("m", &["c"]));
        let first = out.next_batch().await.unwrap();
        assert_eq!(first.len(), 3);
        tx.finish();
        assert!(out.next_batch().await.is_none());
    }
}
