//! Identity scheduling
//!
//! Pairs are processed in fixed-size chunks. Within a chunk a semaphore
//! bounds how many repositories stream at once; a chunk is fully drained
//! before the next one starts. Identities left in `Retry` after a pass are
//! run again in up to `retry_passes` further passes.

use crate::config::CrawlerConfig;
use crate::crawler::fetcher::{FetchClient, FetchResult};
use crate::crawler::parser::{consume_stream, StreamError};
use crate::directory::IdentityHostPair;
use crate::output::Metrics;
use crate::records::{Normalizer, PostRecord, ProfileRecord};
use crate::shutdown::ShutdownSignal;
use crate::state::{IdentityStateStore, IdentityStatus};
use crate::storage::BatchQueue;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};

/// Everything an identity task needs, shared across tasks
pub struct CrawlContext {
    pub state: Arc<dyn IdentityStateStore>,
    pub posts: BatchQueue<PostRecord>,
    pub profiles: BatchQueue<ProfileRecord>,
    pub normalizer: Normalizer,
    pub metrics: Arc<Metrics>,

    /// Identities completed so far in this run
    pub completed: AtomicU64,

    /// Log a progress line every this many completed identities
    pub progress_every: u64,

    /// Longest wait for the next chunk of a response body
    pub stream_idle_timeout: Duration,
}

/// How identities are scheduled
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub concurrency: usize,
    pub chunk_size: usize,
    pub retry_passes: u32,
    pub shutdown_grace: Duration,
}

impl SchedulerSettings {
    pub fn from_config(config: &CrawlerConfig) -> Self {
        Self {
            concurrency: config.concurrency as usize,
            chunk_size: config.chunk_size,
            retry_passes: config.retry_passes,
            shutdown_grace: config.shutdown_grace(),
        }
    }
}

/// How a single identity ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityOutcome {
    /// Already Completed or Failed in an earlier run
    Skipped,
    Completed,
    Failed,
    /// Interrupted or partially persisted; eligible for another pass
    Retry,
    /// The state store could not be read or written
    Errored,
}

/// Outcome counts for one pass over the pairs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    pub completed: usize,
    pub failed: usize,
    pub retry: usize,
    pub skipped: usize,
    pub errored: usize,
    pub abandoned: usize,
}

impl PassReport {
    pub fn record(&mut self, outcome: IdentityOutcome) {
        match outcome {
            IdentityOutcome::Skipped => self.skipped += 1,
            IdentityOutcome::Completed => self.completed += 1,
            IdentityOutcome::Failed => self.failed += 1,
            IdentityOutcome::Retry => self.retry += 1,
            IdentityOutcome::Errored => self.errored += 1,
        }
    }

    /// Identities whose task ran to an outcome or was abandoned
    pub fn total(&self) -> usize {
        self.completed + self.failed + self.retry + self.skipped + self.errored + self.abandoned
    }
}

/// Result of a full scheduler run
#[derive(Debug, Clone, Default)]
pub struct CrawlReport {
    pub passes: Vec<PassReport>,

    /// True if a shutdown stopped the run before every pass finished
    pub interrupted: bool,
}

impl CrawlReport {
    pub fn completed(&self) -> usize {
        self.passes.iter().map(|p| p.completed).sum()
    }

    /// Identities still marked Retry after the last pass
    pub fn remaining_retry(&self) -> usize {
        self.passes.last().map(|p| p.retry).unwrap_or(0)
    }
}

/// Runs identity tasks with bounded concurrency
pub struct CrawlScheduler {
    ctx: Arc<CrawlContext>,
    fetcher: FetchClient,
    settings: SchedulerSettings,
    semaphore: Arc<Semaphore>,
    shutdown: ShutdownSignal,
}

type TaskResult = Result<(IdentityHostPair, IdentityOutcome), JoinError>;

impl CrawlScheduler {
    pub fn new(
        ctx: Arc<CrawlContext>,
        fetcher: FetchClient,
        settings: SchedulerSettings,
        shutdown: ShutdownSignal,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(settings.concurrency.max(1)));
        Self {
            ctx,
            fetcher,
            settings,
            semaphore,
            shutdown,
        }
    }

    /// Processes every pair, then re-runs identities left in Retry
    pub async fn run(&self, pairs: Vec<IdentityHostPair>) -> CrawlReport {
        let mut report = CrawlReport::default();
        let mut pending = pairs;

        for pass in 0..=self.settings.retry_passes {
            if pending.is_empty() || self.shutdown.is_triggered() {
                break;
            }

            if pass == 0 {
                tracing::info!("Processing {} identities", pending.len());
            } else {
                tracing::info!("Retry pass {}: {} identities", pass, pending.len());
            }

            let (pass_report, retry) = self.run_pass(pending).await;
            tracing::info!(
                "Pass {} finished: {} completed, {} failed, {} retry, {} skipped, {} errored, {} abandoned",
                pass,
                pass_report.completed,
                pass_report.failed,
                pass_report.retry,
                pass_report.skipped,
                pass_report.errored,
                pass_report.abandoned
            );
            report.passes.push(pass_report);
            pending = retry;
        }

        report.interrupted = self.shutdown.is_triggered();
        report
    }

    async fn run_pass(&self, pairs: Vec<IdentityHostPair>) -> (PassReport, Vec<IdentityHostPair>) {
        let mut report = PassReport::default();
        let mut retry = Vec::new();

        let chunk_size = self.settings.chunk_size.max(1);
        let chunk_count = pairs.len().div_ceil(chunk_size);

        for (index, chunk) in pairs.chunks(chunk_size).enumerate() {
            if self.shutdown.is_triggered() {
                break;
            }
            let started = Instant::now();

            let mut tasks = JoinSet::new();
            for pair in chunk {
                let permit = tokio::select! {
                    biased;
                    _ = self.shutdown.wait() => None,
                    permit = Arc::clone(&self.semaphore).acquire_owned() => permit.ok(),
                };
                let permit = match permit {
                    Some(permit) => permit,
                    None => break,
                };

                let ctx = Arc::clone(&self.ctx);
                let fetcher = self.fetcher.clone();
                let pair = pair.clone();
                tasks.spawn(async move {
                    let _permit = permit;
                    let outcome = process_identity(&ctx, &fetcher, &pair).await;
                    (pair, outcome)
                });
            }

            self.drain(&mut tasks, &mut report, &mut retry).await;
            tracing::info!(
                "Chunk {}/{} done: {} identities in {:.1}s",
                index + 1,
                chunk_count,
                chunk.len(),
                started.elapsed().as_secs_f64()
            );
        }

        (report, retry)
    }

    /// Waits for a chunk's tasks; on shutdown, gives them the grace period
    /// and then aborts whatever is left
    async fn drain(
        &self,
        tasks: &mut JoinSet<(IdentityHostPair, IdentityOutcome)>,
        report: &mut PassReport,
        retry: &mut Vec<IdentityHostPair>,
    ) {
        loop {
            tokio::select! {
                joined = tasks.join_next() => match joined {
                    Some(joined) => collect(joined, report, retry),
                    None => return,
                },
                _ = self.shutdown.wait() => break,
            }
        }

        tracing::info!(
            "Waiting up to {:?} for {} in-flight identities",
            self.settings.shutdown_grace,
            tasks.len()
        );
        let finished = tokio::time::timeout(self.settings.shutdown_grace, async {
            while let Some(joined) = tasks.join_next().await {
                collect(joined, report, retry);
            }
        })
        .await;

        if finished.is_err() {
            tasks.abort_all();
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Err(e) if e.is_cancelled() => {
                        report.abandoned += 1;
                        self.ctx.metrics.identities_abandoned.increment(1);
                    }
                    other => collect(other, report, retry),
                }
            }
            tracing::warn!(
                "Abandoned {} identities; they stay Processing and are re-attempted next run",
                report.abandoned
            );
        }
    }
}

fn collect(joined: TaskResult, report: &mut PassReport, retry: &mut Vec<IdentityHostPair>) {
    match joined {
        Ok((pair, outcome)) => {
            report.record(outcome);
            if outcome == IdentityOutcome::Retry {
                retry.push(pair);
            }
        }
        Err(e) => {
            tracing::error!("Identity task failed: {}", e);
            report.errored += 1;
        }
    }
}

/// Fetches and consumes one identity's repository
///
/// Completed and Failed identities are skipped. A fetch that never starts
/// streaming marks the identity Failed; stream problems leave it Retry.
pub async fn process_identity(
    ctx: &CrawlContext,
    fetcher: &FetchClient,
    pair: &IdentityHostPair,
) -> IdentityOutcome {
    let status = match ctx.state.get(&pair.identity).await {
        Ok(status) => status,
        Err(e) => {
            tracing::error!(identity = %pair.identity, "Failed to read status: {}", e);
            return IdentityOutcome::Errored;
        }
    };

    if status.is_terminal() {
        ctx.metrics.identities_skipped.increment(1);
        return IdentityOutcome::Skipped;
    }
    if status.is_reattempt() {
        ctx.metrics.identities_retried.increment(1);
        tracing::info!(identity = %pair.identity, "Re-attempting identity left {}", status);
    }

    if let Err(e) = ctx.state.set(&pair.identity, IdentityStatus::Processing).await {
        tracing::error!(identity = %pair.identity, "Failed to mark processing: {}", e);
        return IdentityOutcome::Errored;
    }

    let started = Instant::now();
    let outcome = match fetcher.fetch(pair).await {
        FetchResult::Streaming(response) => {
            ctx.metrics.fetch_successes.increment(1);
            match consume_stream(ctx, pair, response.bytes_stream()).await {
                Ok(summary) if summary.status == IdentityStatus::Completed => {
                    IdentityOutcome::Completed
                }
                Ok(_) => IdentityOutcome::Retry,
                Err(StreamError::State(e)) => {
                    tracing::error!(identity = %pair.identity, "Failed to record completion: {}", e);
                    IdentityOutcome::Errored
                }
                Err(e) => {
                    tracing::warn!(
                        identity = %pair.identity,
                        host = %pair.host,
                        "Stream interrupted: {}",
                        e
                    );
                    IdentityOutcome::Retry
                }
            }
        }
        failure => {
            ctx.metrics.fetch_failures.increment(1);
            if !failure.is_gone() {
                tracing::warn!(
                    identity = %pair.identity,
                    host = %pair.host,
                    "Fetch failed: {:?}",
                    failure
                );
            }
            match ctx.state.set(&pair.identity, IdentityStatus::Failed).await {
                Ok(()) => {
                    ctx.metrics.identities_failed.increment(1);
                    IdentityOutcome::Failed
                }
                Err(e) => {
                    tracing::error!(identity = %pair.identity, "Failed to mark failed: {}", e);
                    IdentityOutcome::Errored
                }
            }
        }
    };
    ctx.metrics.observe_fetch(started.elapsed());

    outcome
}
