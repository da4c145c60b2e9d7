//! Crawler module for repository harvesting
//!
//! This module contains the core ingestion logic, including:
//! - Streaming fetches through the repository fetch service
//! - NDJSON framing and record dispatch
//! - Bounded-concurrency identity scheduling with retry passes
//! - End-to-end pipeline coordination

mod coordinator;
mod fetcher;
mod parser;
mod scheduler;

pub use coordinator::{run_harvest, Pipeline, PipelineReport};
pub use fetcher::{build_http_client, FetchClient, FetchResult};
pub use parser::{consume_stream, LineFramer, StreamError, StreamSummary};
pub use scheduler::{
    process_identity, CrawlContext, CrawlReport, CrawlScheduler, IdentityOutcome, PassReport,
    SchedulerSettings,
};
