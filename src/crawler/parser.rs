//! Repository stream consumption
//!
//! The fetch service's response is an unbounded byte stream of NDJSON.
//! Network reads do not line up with line boundaries, so bytes are buffered
//! and framed on `\n` before decoding.

use crate::crawler::scheduler::CrawlContext;
use crate::directory::IdentityHostPair;
use crate::records::NormalizedRecord;
use crate::state::IdentityStatus;
use crate::storage::StorageError;
use futures::{Stream, StreamExt};
use serde_json::{Map, Value};
use std::fmt::Display;
use std::string::FromUtf8Error;
use std::sync::atomic::Ordering;
use std::time::Duration;
use thiserror::Error;

/// Errors that end a stream early
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("stream read failed: {0}")]
    Read(String),

    #[error("no data received for {0:?}")]
    IdleTimeout(Duration),

    #[error("state store error: {0}")]
    State(#[from] StorageError),
}

/// Splits a byte stream into lines
///
/// Bytes are only split at `\n`, so multi-byte characters cut by a read
/// boundary are reassembled before decoding.
#[derive(Debug, Default)]
pub struct LineFramer {
    buffer: Vec<u8>,
    consumed: usize,
    scan_from: usize,
}

impl LineFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a chunk read from the stream
    pub fn push(&mut self, chunk: &[u8]) {
        if self.consumed > 0 && self.consumed * 2 >= self.buffer.len() {
            self.buffer.drain(..self.consumed);
            self.scan_from -= self.consumed;
            self.consumed = 0;
        }
        self.buffer.extend_from_slice(chunk);
    }

    /// Returns the next complete line, without its terminator
    ///
    /// A line that is not valid UTF-8 is returned as an error and consumed.
    pub fn next_line(&mut self) -> Option<Result<String, FromUtf8Error>> {
        match self.buffer[self.scan_from..].iter().position(|b| *b == b'\n') {
            Some(offset) => {
                let end = self.scan_from + offset;
                let line = String::from_utf8(self.buffer[self.consumed..end].to_vec());
                self.consumed = end + 1;
                self.scan_from = self.consumed;
                Some(line)
            }
            None => {
                self.scan_from = self.buffer.len();
                None
            }
        }
    }

    /// Bytes received but not yet returned as a line
    pub fn pending(&self) -> usize {
        self.buffer.len() - self.consumed
    }

    /// Returns the unterminated remainder, if it holds anything but whitespace
    pub fn finish(mut self) -> Option<Vec<u8>> {
        let rest = self.buffer.split_off(self.consumed);
        if rest.iter().all(|b| b.is_ascii_whitespace()) {
            None
        } else {
            Some(rest)
        }
    }
}

/// What a fully consumed stream produced
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamSummary {
    pub lines: u64,
    pub records: u64,
    pub rejected_lines: u64,
    pub enqueue_failures: u64,
    pub trailing_bytes: usize,
    /// Status the identity was left in
    pub status: IdentityStatus,
}

/// Consumes an identity's repository stream
///
/// Every complete line is decoded, normalized and enqueued. Undecodable
/// lines are skipped. An enqueue failure marks the identity Retry and
/// consumption continues. On a clean end the identity becomes Completed
/// unless it was marked Retry; on a read error or idle timeout it becomes
/// Retry and the error is returned.
pub async fn consume_stream<S, B, E>(
    ctx: &CrawlContext,
    pair: &IdentityHostPair,
    stream: S,
) -> Result<StreamSummary, StreamError>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: Display,
{
    let mut stream = std::pin::pin!(stream);
    let mut framer = LineFramer::new();
    let mut summary = StreamSummary::default();

    loop {
        let next = match tokio::time::timeout(ctx.stream_idle_timeout, stream.next()).await {
            Ok(next) => next,
            Err(_) => {
                return Err(mark_retry(ctx, pair, StreamError::IdleTimeout(ctx.stream_idle_timeout)).await);
            }
        };

        match next {
            Some(Ok(chunk)) => {
                framer.push(chunk.as_ref());
                while let Some(line) = framer.next_line() {
                    match line {
                        Ok(line) => process_line(ctx, pair, &line, &mut summary).await,
                        Err(e) => {
                            tracing::warn!(identity = %pair.identity, "Skipping line that is not UTF-8: {}", e);
                            summary.lines += 1;
                            summary.rejected_lines += 1;
                            ctx.metrics.lines_rejected.increment(1);
                        }
                    }
                }
            }
            Some(Err(e)) => {
                return Err(mark_retry(ctx, pair, StreamError::Read(e.to_string())).await);
            }
            None => break,
        }
    }

    if let Some(rest) = framer.finish() {
        tracing::warn!(
            identity = %pair.identity,
            "Stream ended mid-line, dropping {} trailing bytes",
            rest.len()
        );
        summary.trailing_bytes = rest.len();
        ctx.metrics.lines_rejected.increment(1);
    }

    if summary.enqueue_failures > 0 {
        summary.status = IdentityStatus::Retry;
        return Ok(summary);
    }

    ctx.state
        .set(&pair.identity, IdentityStatus::Completed)
        .await?;
    summary.status = IdentityStatus::Completed;
    ctx.metrics.identities_completed.increment(1);

    let completed = ctx.completed.fetch_add(1, Ordering::Relaxed) + 1;
    if ctx.progress_every > 0 && completed % ctx.progress_every == 0 {
        tracing::info!("Completed {} identities", completed);
    }

    tracing::debug!(
        identity = %pair.identity,
        records = summary.records,
        rejected = summary.rejected_lines,
        "Repository consumed"
    );
    Ok(summary)
}

async fn process_line(
    ctx: &CrawlContext,
    pair: &IdentityHostPair,
    line: &str,
    summary: &mut StreamSummary,
) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }
    summary.lines += 1;

    let entries: Map<String, Value> = match serde_json::from_str(line) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!(identity = %pair.identity, "Skipping undecodable line: {}", e);
            summary.rejected_lines += 1;
            ctx.metrics.lines_rejected.increment(1);
            return;
        }
    };

    for record in ctx.normalizer.normalize_line(&pair.identity, entries) {
        let result = match record {
            NormalizedRecord::Post(post) => ctx.posts.enqueue(post).await,
            NormalizedRecord::Profile(profile) => ctx.profiles.enqueue(profile).await,
        };

        match result {
            Ok(()) => {
                summary.records += 1;
                ctx.metrics.records_enqueued.increment(1);
            }
            Err(e) => {
                ctx.metrics.enqueue_failures.increment(1);
                if summary.enqueue_failures == 0 {
                    tracing::warn!(identity = %pair.identity, "Enqueue failed, marking for retry: {}", e);
                    if let Err(e) = ctx.state.set(&pair.identity, IdentityStatus::Retry).await {
                        tracing::error!(identity = %pair.identity, "Failed to mark retry: {}", e);
                    }
                }
                summary.enqueue_failures += 1;
            }
        }
    }
}

async fn mark_retry(ctx: &CrawlContext, pair: &IdentityHostPair, error: StreamError) -> StreamError {
    if let Err(e) = ctx.state.set(&pair.identity, IdentityStatus::Retry).await {
        tracing::error!(identity = %pair.identity, "Failed to mark retry: {}", e);
    }
    error
}
