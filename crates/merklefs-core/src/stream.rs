// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Directory streaming: cancellable, resumable entry production.
//!
//! Each backend supplies an [`EntrySource`] that enumerates its native
//! entries into a bounded channel from a background task. The stream caches
//! delivered entries for the lifetime of one listing session so consumers can
//! resume at any previously issued offset; offsets are assigned here,
//! monotonically from 1. Offset 0 always means "start of stream".

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{FsError, FsResult};
use crate::types::DirectoryEntry;

/// Backend-native entry producer.
///
/// Implementations enumerate entries, translate each to the protocol-neutral
/// shape (leaving `offset` zero; the stream numbers entries as they arrive),
/// and push them to `out`. The producer must stop on cancellation or when the
/// receiver goes away, and relays the first enumeration failure as a terminal
/// `Err` item before closing the channel.
#[async_trait]
pub trait EntrySource: Send + Sync + 'static {
    async fn send_entries(
        &self,
        scope: CancellationToken,
        out: mpsc::Sender<FsResult<DirectoryEntry>>,
    );
}

/// Send one item, backing off to cancellation. Returns false when the
/// producer should stop (consumer gone or scope canceled).
pub async fn send_or_cancel(
    scope: &CancellationToken,
    out: &mpsc::Sender<FsResult<DirectoryEntry>>,
    item: FsResult<DirectoryEntry>,
) -> bool {
    tokio::select! {
        _ = scope.cancelled() => false,
        sent = out.send(item) => sent.is_ok(),
    }
}

/// Precomputed entry source, used for materialized snapshots (overlay map,
/// root listings captured at open time) and in tests.
pub struct VecSource {
    entries: Vec<DirectoryEntry>,
}

impl VecSource {
    pub fn new(entries: Vec<DirectoryEntry>) -> Self {
        Self { entries }
    }
}

#[async_trait]
impl EntrySource for VecSource {
    async fn send_entries(
        &self,
        scope: CancellationToken,
        out: mpsc::Sender<FsResult<DirectoryEntry>>,
    ) {
        for entry in &self.entries {
            if !send_or_cancel(&scope, &out, Ok(entry.clone())).await {
                return;
            }
        }
    }
}

/// One listing session over a backend directory.
pub struct DirectoryStream {
    source: Arc<dyn EntrySource>,
    depth: usize,
    rx: Option<mpsc::Receiver<FsResult<DirectoryEntry>>>,
    producer: Option<CancellationToken>,
    cache: Vec<DirectoryEntry>,
    done: bool,
    terminal: Option<FsError>,
    errored: bool,
    opened: bool,
}

impl DirectoryStream {
    pub fn new(source: Arc<dyn EntrySource>, depth: usize) -> Self {
        Self {
            source,
            depth,
            rx: None,
            producer: None,
            cache: Vec::new(),
            done: false,
            terminal: None,
            errored: false,
            opened: false,
        }
    }

    /// Start the background producer. Fails with `AlreadyOpen` if the stream
    /// was opened before and not reset.
    pub fn open(&mut self, scope: &CancellationToken) -> FsResult<()> {
        if self.opened {
            return Err(FsError::AlreadyOpen);
        }
        self.spawn_producer(scope);
        self.opened = true;
        Ok(())
    }

    /// Rewind to the start of the stream.
    ///
    /// Equivalent to a fresh open: the producer is restarted and previously
    /// issued offsets become stale.
    pub fn reset(&mut self, scope: &CancellationToken) -> FsResult<()> {
        if !self.opened {
            return Err(FsError::InvalidOperation);
        }
        self.stop_producer();
        self.cache.clear();
        self.done = false;
        self.terminal = None;
        self.errored = false;
        self.spawn_producer(scope);
        Ok(())
    }

    fn spawn_producer(&mut self, scope: &CancellationToken) {
        let token = scope.child_token();
        let (tx, rx) = mpsc::channel(self.depth);
        let source = Arc::clone(&self.source);
        let task_token = token.clone();
        tokio::spawn(async move {
            source.send_entries(task_token, tx).await;
        });
        self.producer = Some(token);
        self.rx = Some(rx);
    }

    fn stop_producer(&mut self) {
        if let Some(token) = self.producer.take() {
            token.cancel();
        }
        self.rx = None;
    }

    pub fn is_open(&self) -> bool {
        self.opened
    }

    /// Read up to `count` entries resuming after resume token `offset`
    /// (0 = start). `count == 0` means "the rest of the stream".
    ///
    /// At end of stream, `offset == total` yields an empty result and
    /// `offset > total` is an `OffsetBeyondBound` error.
    pub async fn read(&mut self, offset: u64, count: usize) -> FsResult<Vec<DirectoryEntry>> {
        if !self.opened {
            return Err(FsError::InvalidOperation);
        }

        // Materialize up to the resume point plus the window; a zero count
        // drains the producer to the end of the stream.
        let needed = if count == 0 {
            usize::MAX
        } else {
            (offset as usize).saturating_add(count.min(4096))
        };
        self.fill(needed).await?;

        let total = self.cache.len() as u64;
        // fill() stops short of `needed` only at end of stream, and the
        // cache keeps every delivered entry, so every offset up to the total
        // is serviceable.
        if offset > total {
            return Err(FsError::OffsetBeyondBound {
                offset,
                bound: total,
            });
        }

        let start = offset as usize;
        let end = if count == 0 {
            self.cache.len()
        } else {
            (start + count).min(self.cache.len())
        };
        let slice = self.cache[start..end].to_vec();

        // Relay a mid-stream failure once the consumer drains up to it.
        if slice.is_empty() && self.errored {
            if let Some(err) = self.terminal.take() {
                return Err(err);
            }
            return Err(FsError::Io(std::io::Error::other("listing failed")));
        }

        Ok(slice)
    }

    /// Pull from the producer until `needed` entries are cached, the stream
    /// ends, or a terminal error arrives.
    async fn fill(&mut self, needed: usize) -> FsResult<()> {
        while self.cache.len() < needed && !self.done {
            let rx = match self.rx.as_mut() {
                Some(rx) => rx,
                None => {
                    self.done = true;
                    break;
                }
            };
            match rx.recv().await {
                Some(Ok(mut entry)) => {
                    entry.offset = self.cache.len() as u64 + 1;
                    self.cache.push(entry);
                }
                Some(Err(err)) => {
                    self.done = true;
                    self.errored = true;
                    self.terminal = Some(err);
                    self.rx = None;
                }
                None => {
                    self.done = true;
                    self.rx = None;
                }
            }
        }
        Ok(())
    }
}

impl Drop for DirectoryStream {
    fn drop(&mut self) {
        self.stop_producer();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{NodeKind, Qid, QidType};

    fn entries(n: usize) -> Vec<DirectoryEntry> {
        (0..n)
            .map(|i| DirectoryEntry {
                name: format!("entry-{i}"),
                offset: 0,
                kind: NodeKind::File,
                qid: Qid {
                    kind: QidType::Regular,
                    path: i as u64,
                },
            })
            .collect()
    }

    fn open_stream(n: usize) -> (DirectoryStream, CancellationToken) {
        let token = CancellationToken::new();
        let mut stream = DirectoryStream::new(Arc::new(VecSource::new(entries(n))), 8);
        stream.open(&token).unwrap();
        (stream, token)
    }

    #[tokio::test]
    async fn offsets_start_at_one_and_increase() {
        let (mut stream, _token) = open_stream(5);
        let all = stream.read(0, 0).await.unwrap();
        assert_eq!(all.len(), 5);
        for (i, entry) in all.iter().enumerate() {
            assert_eq!(entry.offset, i as u64 + 1);
        }
    }

    #[tokio::test]
    async fn resume_reproduces_suffix_for_every_k() {
        let n = 7;
        let (mut stream, _token) = open_stream(n);
        let all = stream.read(0, 0).await.unwrap();
        for k in 0..=n {
            let suffix = stream.read(k as u64, 0).await.unwrap();
            assert_eq!(suffix.as_slice(), &all[k..], "resume at {k}");
        }
    }

    #[tokio::test]
    async fn bound_checks_at_end_of_stream() {
        let (mut stream, _token) = open_stream(3);
        let _ = stream.read(0, 0).await.unwrap();
        assert!(stream.read(3, 0).await.unwrap().is_empty());
        assert!(matches!(
            stream.read(4, 0).await,
            Err(FsError::OffsetBeyondBound { offset: 4, bound: 3 })
        ));
    }

    #[tokio::test]
    async fn zero_count_reads_drain_arbitrarily_long_streams() {
        let (mut stream, _token) = open_stream(5000);
        let all = stream.read(0, 0).await.unwrap();
        assert_eq!(all.len(), 5000);
        assert_eq!(all.last().unwrap().offset, 5000);
        let tail = stream.read(4998, 0).await.unwrap();
        assert_eq!(tail.len(), 2);
    }

    #[tokio::test]
    async fn bounded_reads_check_offsets_against_the_bound() {
        let (mut stream, _token) = open_stream(3);
        assert_eq!(stream.read(0, 2).await.unwrap().len(), 2);
        assert!(matches!(
            stream.read(9, 2).await,
            Err(FsError::OffsetBeyondBound { offset: 9, bound: 3 })
        ));
    }

    #[tokio::test]
    async fn double_open_is_rejected() {
        let token = CancellationToken::new();
        let mut stream = DirectoryStream::new(Arc::new(VecSource::new(entries(1))), 8);
        stream.open(&token).unwrap();
        assert!(matches!(stream.open(&token), Err(FsError::AlreadyOpen)));
    }

    #[tokio::test]
    async fn reset_is_equivalent_to_fresh_open() {
        let (mut stream, token) = open_stream(4);
        let first = stream.read(0, 2).await.unwrap();
        stream.reset(&token).unwrap();
        let again = stream.read(0, 0).await.unwrap();
        assert_eq!(again.len(), 4);
        assert_eq!(&again[..2], first.as_slice());
    }

    struct FailingSource {
        good: usize,
    }

    #[async_trait]
    impl EntrySource for FailingSource {
        async fn send_entries(
            &self,
            scope: CancellationToken,
            out: mpsc::Sender<FsResult<DirectoryEntry>>,
        ) {
            for entry in entries(self.good) {
                if !send_or_cancel(&scope, &out, Ok(entry)).await {
                    return;
                }
            }
            let _ = send_or_cancel(&scope, &out, Err(FsError::NotFound)).await;
        }
    }

    #[tokio::test]
    async fn mid_stream_failure_is_terminal_not_corrupt() {
        let token = CancellationToken::new();
        let mut stream = DirectoryStream::new(Arc::new(FailingSource { good: 2 }), 8);
        stream.open(&token).unwrap();
        let delivered = stream.read(0, 0).await.unwrap();
        assert_eq!(delivered.len(), 2);
        assert!(matches!(stream.read(2, 0).await, Err(FsError::NotFound)));
    }

    #[tokio::test]
    async fn canceling_scope_unblocks_producer() {
        // Producer larger than the channel bound; cancel while it is parked
        // on a full channel and confirm the task exits.
        let token = CancellationToken::new();
        let source = Arc::new(VecSource::new(entries(64)));
        let child = token.child_token();
        let (tx, mut rx) = mpsc::channel(1);
        let done = tokio::spawn({
            let source = Arc::clone(&source);
            let child = child.clone();
            async move { source.send_entries(child, tx).await }
        });
        // Take one entry, then cancel without draining the rest.
        let first = rx.recv().await.unwrap().unwrap();
        assert_eq!(first.name, "entry-0");
        child.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(1), done)
            .await
            .expect("producer should exit on cancel")
            .unwrap();
    }
}
