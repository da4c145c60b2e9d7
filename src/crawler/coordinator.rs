//! Pipeline coordination
//!
//! Runs the harvest end to end: directory dump, grouping, health checks,
//! selection, the crawl itself and finally the queue drain. A shutdown
//! request ends the run early; the dump and the health probes stop as soon
//! as they notice it.

use crate::config::Config;
use crate::crawler::fetcher::{build_http_client, FetchClient};
use crate::crawler::scheduler::{CrawlContext, CrawlReport, CrawlScheduler, SchedulerSettings};
use crate::directory::{
    dump_directory, load_pairs, select_healthy, DumpOutcome, HostHealthChecker, IdentityHostPair,
};
use crate::output::{Metrics, StatsAggregator};
use crate::records::{Normalizer, PlausibleWindow, PostRecord, ProfileRecord};
use crate::shutdown::{ShutdownReason, ShutdownSignal};
use crate::state::SqliteStateStore;
use crate::storage::{
    open_output_database, open_state_database, BatchInserter, BatchQueue, BatchQueueConfig,
    PostInserter, ProfileInserter,
};
use crate::{HarvestError, Result};
use chrono::Utc;
use reqwest::Client;
use std::path::Path;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Instant;

/// What a pipeline run did
#[derive(Debug, Clone, Default)]
pub struct PipelineReport {
    /// Identities handed to the scheduler
    pub selected: usize,

    pub crawl: CrawlReport,

    /// True if a shutdown request ended the run early
    pub interrupted: bool,
}

/// Owns the shared clients and runs the stages in order
pub struct Pipeline {
    config: Config,
    client: Client,
    metrics: Arc<Metrics>,
    shutdown: ShutdownSignal,
}

impl Pipeline {
    pub fn new(config: Config, shutdown: ShutdownSignal) -> Result<Self> {
        Self::with_metrics(config, shutdown, Arc::new(Metrics::new()))
    }

    /// Like [`Pipeline::new`], reporting into the given handles
    pub fn with_metrics(
        config: Config,
        shutdown: ShutdownSignal,
        metrics: Arc<Metrics>,
    ) -> Result<Self> {
        let client = build_http_client()?;
        Ok(Self {
            config,
            client,
            metrics,
            shutdown,
        })
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Runs every stage
    ///
    /// Returns [`HarvestError::Fatal`] if a persistence failure tripped the
    /// shutdown signal; a signal-initiated shutdown returns an interrupted
    /// report.
    pub async fn run(&self) -> Result<PipelineReport> {
        let started = Instant::now();
        let directory = &self.config.directory;

        let dumped = dump_directory(directory, &self.shutdown).await?;
        if matches!(dumped, DumpOutcome::Cancelled { .. }) || self.shutdown.is_triggered() {
            return Ok(self.interrupted());
        }

        let groups = load_pairs(Path::new(&directory.pairs_path)).await?;
        if self.shutdown.is_triggered() {
            return Ok(self.interrupted());
        }

        let checker = HostHealthChecker::new(
            self.client.clone(),
            self.config.health.clone(),
            directory.relay_host.as_str(),
        );
        // Probes in flight are dropped and nothing is cached
        let health = tokio::select! {
            biased;
            _ = self.shutdown.wait() => return Ok(self.interrupted()),
            health = checker.check(&groups) => health?,
        };

        let mut pairs = select_healthy(&groups, &health);
        drop(groups);

        if let Some(max) = self.config.crawler.max_identities {
            if pairs.len() > max {
                tracing::info!("Limiting run to {} of {} identities", max, pairs.len());
                pairs.truncate(max);
            }
        }

        let selected = pairs.len();
        let crawl = self.crawl(pairs).await?;

        tracing::info!(
            "Harvest finished in {:.1}s: {} of {} identities completed",
            started.elapsed().as_secs_f64(),
            crawl.completed(),
            selected
        );

        Ok(PipelineReport {
            selected,
            interrupted: crawl.interrupted,
            crawl,
        })
    }

    /// Crawls the given pairs and drains both queues
    pub async fn crawl(&self, pairs: Vec<IdentityHostPair>) -> Result<CrawlReport> {
        let persistence = &self.config.persistence;
        let crawler = &self.config.crawler;

        let output = open_output_database(Path::new(&persistence.database_path))?;
        let state_db = open_state_database(Path::new(&persistence.state_path))?;
        let stats = StatsAggregator::new(state_db.clone());
        let queue_config = BatchQueueConfig::from_persistence(persistence);

        let post_inserter: Arc<dyn BatchInserter<PostRecord>> =
            Arc::new(PostInserter::new(output.clone(), Some(stats.clone())));
        let profile_inserter: Arc<dyn BatchInserter<ProfileRecord>> =
            Arc::new(ProfileInserter::new(output, Some(stats)));

        let state = SqliteStateStore::new(state_db);
        let ctx = Arc::new(CrawlContext {
            state: Arc::new(state.clone()),
            posts: BatchQueue::new(
                "posts",
                queue_config.clone(),
                post_inserter,
                Arc::clone(&self.metrics),
                self.shutdown.clone(),
            ),
            profiles: BatchQueue::new(
                "profiles",
                queue_config,
                profile_inserter,
                Arc::clone(&self.metrics),
                self.shutdown.clone(),
            ),
            normalizer: Normalizer::new(PlausibleWindow::around(
                Utc::now(),
                crawler.plausible_years_back,
                crawler.plausible_years_ahead,
            )),
            metrics: Arc::clone(&self.metrics),
            completed: AtomicU64::new(0),
            progress_every: crawler.progress_every,
            stream_idle_timeout: crawler.stream_idle_timeout(),
        });

        let fetcher = FetchClient::new(
            self.client.clone(),
            crawler.fetch_url.as_str(),
            crawler.request_timeout(),
        );
        let scheduler = CrawlScheduler::new(
            Arc::clone(&ctx),
            fetcher,
            SchedulerSettings::from_config(crawler),
            self.shutdown.clone(),
        );

        let started = Instant::now();
        let report = scheduler.run(pairs).await;
        tracing::info!("Crawl finished in {:.1}s", started.elapsed().as_secs_f64());

        let posts_drained = ctx.posts.shutdown().await;
        let profiles_drained = ctx.profiles.shutdown().await;

        match state.count_by_status().await {
            Ok(counts) => {
                for (status, count) in counts {
                    tracing::info!("Identities {}: {}", status, count);
                }
            }
            Err(e) => tracing::warn!("Failed to count identity statuses: {}", e),
        }

        if let Some(ShutdownReason::Fatal(message)) = self.shutdown.reason() {
            return Err(HarvestError::Fatal(message));
        }
        posts_drained?;
        profiles_drained?;

        Ok(report)
    }

    fn interrupted(&self) -> PipelineReport {
        tracing::info!("Shutdown requested, stopping before the crawl");
        PipelineReport {
            interrupted: true,
            ..PipelineReport::default()
        }
    }
}

/// Builds a pipeline and runs it
///
/// # Example
///
/// ```no_run
/// use skyharvest::config::load_config;
/// use skyharvest::crawler::run_harvest;
/// use skyharvest::shutdown::ShutdownSignal;
/// use std::path::Path;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let config = load_config(Path::new("harvest.toml"))?;
/// run_harvest(config, ShutdownSignal::new()).await?;
/// # Ok(())
/// # }
/// ```
pub async fn run_harvest(config: Config, shutdown: ShutdownSignal) -> Result<PipelineReport> {
    Pipeline::new(config, shutdown)?.run().await
}
