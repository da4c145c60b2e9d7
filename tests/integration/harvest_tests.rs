//! Integration tests for the harvester
//!
//! These tests use wiremock to stand in for the repository fetch service and
//! for the hosts answering health probes, and run the pipeline end-to-end
//! against temporary databases.

use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use serde_json::json;
use skyharvest::config::{parse_config, Config};
use skyharvest::crawler::{run_harvest, Pipeline};
use skyharvest::directory::{select_healthy, HostHealthChecker, IdentityHostPair};
use skyharvest::output::metrics::{FETCHES, IDENTITIES, IDENTITIES_RETRIED, LINES_REJECTED};
use skyharvest::output::Metrics;
use skyharvest::shutdown::ShutdownSignal;
use skyharvest::state::{IdentityStateStore, SqliteStateStore};
use skyharvest::storage::{count_output_rows, open_output_database, open_state_database};
use skyharvest::IdentityStatus;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use wiremock::matchers::{body_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const DESCRIBE: &str = "/xrpc/com.atproto.server.describeServer";

/// Host part of a mock server's URI, e.g. `127.0.0.1:40123`
fn host_of(server: &MockServer) -> String {
    url::Url::parse(&server.uri())
        .map(|u| format!("{}:{}", u.host_str().unwrap(), u.port().unwrap()))
        .expect("Failed to parse mock server URI")
}

/// Creates a test configuration rooted in `dir`
fn create_test_config(dir: &TempDir, fetch_url: &str) -> Config {
    let path = |name: &str| dir.path().join(name).to_string_lossy().replace('\\', "/");
    let toml = format!(
        r#"
[directory]
plc-db-path = "{plc}"
pairs-path = "{pairs}"
relay-host = "relay.example.net"

[health]
cache-path = "{health}"
concurrency = 4
timeout-secs = 5
max-retries = 2
scheme = "http"

[crawler]
fetch-url = "{fetch_url}"
concurrency = 4
request-timeout-secs = 5
stream-idle-timeout-secs = 5
shutdown-grace-secs = 1

[persistence]
database-path = "{db}"
state-path = "{state}"
batch-size = 100
batch-timeout-ms = 50
max-attempts = 2
backoff-base-ms = 10
"#,
        plc = path("plc.db"),
        pairs = path("pairs.jsonl"),
        health = path("health.json"),
        db = path("harvest.db"),
        state = path("state.db"),
        fetch_url = fetch_url,
    );
    parse_config(&toml).expect("test config should be valid")
}

fn write_pairs(config: &Config, pairs: &[IdentityHostPair]) {
    let mut content = String::new();
    for pair in pairs {
        content.push_str(&serde_json::to_string(pair).unwrap());
        content.push('\n');
    }
    std::fs::write(&config.directory.pairs_path, content).unwrap();
}

async fn mount_healthy(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path(DESCRIBE))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"did": "did:web:pds", "availableUserDomains": [".test"]})),
        )
        .mount(server)
        .await;
}

/// Pipeline reporting into its own recorder
fn recorded_pipeline(config: Config) -> (Pipeline, Snapshotter) {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    let metrics = Arc::new(Metrics::with_recorder(&recorder));
    let pipeline = Pipeline::with_metrics(config, ShutdownSignal::new(), metrics)
        .expect("Failed to build pipeline");
    (pipeline, snapshotter)
}

fn counter(snapshotter: &Snapshotter, name: &str, labels: &[(&str, &str)]) -> u64 {
    snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .find_map(|(key, _, _, value)| {
            let key = key.key();
            let matches = key.name() == name
                && key.labels().count() == labels.len()
                && labels
                    .iter()
                    .all(|(k, v)| key.labels().any(|l| l.key() == *k && l.value() == *v));
            match value {
                DebugValue::Counter(count) if matches => Some(count),
                _ => None,
            }
        })
        .unwrap_or(0)
}

async fn row_count(config: &Config, table: &str) -> i64 {
    let db = open_output_database(Path::new(&config.persistence.database_path)).unwrap();
    let counts = db.call(|conn| count_output_rows(conn)).await.unwrap();
    counts
        .into_iter()
        .find(|(name, _)| *name == table)
        .map(|(_, count)| count)
        .unwrap()
}

async fn status_of(config: &Config, identity: &str) -> IdentityStatus {
    let db = open_state_database(Path::new(&config.persistence.state_path)).unwrap();
    SqliteStateStore::new(db).get(identity).await.unwrap()
}

#[tokio::test]
async fn test_full_harvest() {
    let healthy = MockServer::start().await;
    let unhealthy = MockServer::start().await;
    let healthy_host = host_of(&healthy);
    let unhealthy_host = host_of(&unhealthy);

    mount_healthy(&healthy).await;
    Mock::given(method("GET"))
        .and(path(DESCRIBE))
        .respond_with(ResponseTemplate::new(404))
        .mount(&unhealthy)
        .await;

    let body = concat!(
        r#"{"app.bsky.feed.post/abc":{"cid":"bafypost","value":{"text":"hi 😀😀🎉","langs":["en"],"createdAt":"2024-05-01T12:00:00Z"}}}"#,
        "\n",
        r#"{"app.bsky.actor.profile/self":{"cid":"bafyprof","value":{"displayName":"Alice 🎉","description":"plain"}},"app.bsky.feed.like/xyz":{"cid":"bafylike","value":{}}}"#,
        "\n",
    );
    Mock::given(method("POST"))
        .and(path("/fetch"))
        .and(body_json(json!({"did": "did:plc:alice", "pds": healthy_host})))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(body)
                .insert_header("content-type", "application/x-ndjson"),
        )
        .expect(1)
        .mount(&healthy)
        .await;
    Mock::given(method("POST"))
        .and(path("/fetch"))
        .and(body_json(json!({"did": "did:plc:bob", "pds": healthy_host})))
        .respond_with(ResponseTemplate::new(502))
        .expect(1)
        .mount(&healthy)
        .await;

    let dir = TempDir::new().unwrap();
    let config = create_test_config(&dir, &format!("{}/fetch", healthy.uri()));
    write_pairs(
        &config,
        &[
            IdentityHostPair::new("did:plc:alice", healthy_host.as_str()),
            IdentityHostPair::new("did:plc:bob", healthy_host.as_str()),
            IdentityHostPair::new("did:plc:carol", unhealthy_host.as_str()),
        ],
    );

    let report = run_harvest(config.clone(), ShutdownSignal::new())
        .await
        .expect("harvest should succeed");

    assert_eq!(report.selected, 2);
    assert!(!report.interrupted);
    assert_eq!(report.crawl.passes.len(), 1);
    assert_eq!(report.crawl.passes[0].completed, 1);
    assert_eq!(report.crawl.passes[0].failed, 1);

    assert_eq!(status_of(&config, "did:plc:alice").await, IdentityStatus::Completed);
    assert_eq!(status_of(&config, "did:plc:bob").await, IdentityStatus::Failed);
    assert_eq!(status_of(&config, "did:plc:carol").await, IdentityStatus::Pending);

    assert_eq!(row_count(&config, "posts").await, 1);
    assert_eq!(row_count(&config, "post_emojis").await, 2);
    assert_eq!(row_count(&config, "profiles").await, 1);
    assert_eq!(row_count(&config, "profile_display_name_emojis").await, 1);
    assert_eq!(row_count(&config, "profile_description_emojis").await, 0);

    let cache = std::fs::read_to_string(&config.health.cache_path).unwrap();
    let cached: serde_json::Value = serde_json::from_str(&cache).unwrap();
    assert_eq!(cached[&healthy_host], json!(true));
    assert_eq!(cached[&unhealthy_host], json!(false));
}

#[tokio::test]
async fn test_rerun_skips_terminal_identities() {
    let server = MockServer::start().await;
    let host = host_of(&server);
    mount_healthy(&server).await;

    Mock::given(method("POST"))
        .and(path("/fetch"))
        .and(body_json(json!({"did": "did:plc:done", "pds": host})))
        .respond_with(ResponseTemplate::new(200).set_body_string(""))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/fetch"))
        .and(body_json(json!({"did": "did:plc:gone", "pds": host})))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let config = create_test_config(&dir, &format!("{}/fetch", server.uri()));
    write_pairs(
        &config,
        &[
            IdentityHostPair::new("did:plc:done", host.as_str()),
            IdentityHostPair::new("did:plc:gone", host.as_str()),
        ],
    );

    let first = run_harvest(config.clone(), ShutdownSignal::new()).await.unwrap();
    assert_eq!(first.crawl.passes[0].completed, 1);
    assert_eq!(first.crawl.passes[0].failed, 1);

    // Second run: both identities are terminal, so no fetch is issued
    let second = run_harvest(config.clone(), ShutdownSignal::new()).await.unwrap();
    assert_eq!(second.crawl.passes[0].skipped, 2);

    let (third, recorded) = recorded_pipeline(config);
    third.run().await.unwrap();
    assert_eq!(counter(&recorded, FETCHES, &[("outcome", "success")]), 0);
    assert_eq!(counter(&recorded, FETCHES, &[("outcome", "failure")]), 0);
    assert_eq!(counter(&recorded, IDENTITIES, &[("outcome", "skipped")]), 2);
}

#[tokio::test]
async fn test_interrupted_identity_is_retried() {
    let server = MockServer::start().await;
    let host = host_of(&server);

    Mock::given(method("POST"))
        .and(path("/fetch"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            "{\"app.bsky.feed.post/abc\":{\"cid\":\"c1\",\"value\":{\"text\":\"x\"}}}\n",
        ))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let config = create_test_config(&dir, &format!("{}/fetch", server.uri()));

    // A crash left this identity Processing
    {
        let db = open_state_database(Path::new(&config.persistence.state_path)).unwrap();
        SqliteStateStore::new(db)
            .set("did:plc:crashed", IdentityStatus::Processing)
            .await
            .unwrap();
    }

    let (pipeline, recorded) = recorded_pipeline(config.clone());
    let report = pipeline
        .crawl(vec![IdentityHostPair::new("did:plc:crashed", host.as_str())])
        .await
        .unwrap();

    assert_eq!(report.completed(), 1);
    assert_eq!(counter(&recorded, IDENTITIES_RETRIED, &[]), 1);
    assert_eq!(status_of(&config, "did:plc:crashed").await, IdentityStatus::Completed);
    assert_eq!(row_count(&config, "posts").await, 1);
}

#[tokio::test]
async fn test_health_probe_retries_then_caches() {
    let server = MockServer::start().await;
    let host = host_of(&server);

    Mock::given(method("GET"))
        .and(path(DESCRIBE))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(DESCRIBE))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"availableUserDomains": []})))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let config = create_test_config(&dir, "http://127.0.0.1:1/fetch");
    let mut groups = std::collections::BTreeMap::new();
    groups.insert(host.clone(), vec!["did:plc:a".to_string()]);
    groups.insert("relay.example.net".to_string(), vec!["did:plc:b".to_string()]);
    groups.insert("bad_host!".to_string(), vec!["did:plc:c".to_string()]);

    let checker = HostHealthChecker::new(
        reqwest::Client::new(),
        config.health.clone(),
        config.directory.relay_host.as_str(),
    );
    let health = checker.check(&groups).await.unwrap();

    assert_eq!(health.get(&host), Some(&true));
    assert_eq!(health.get("relay.example.net"), Some(&true));
    assert_eq!(health.get("bad_host!"), None);

    let selected = select_healthy(&groups, &health);
    assert_eq!(selected.len(), 2);

    // The cache is used as is on the next check, with no probe issued
    let cached = checker.check(&groups).await.unwrap();
    assert_eq!(cached, health);
}

#[tokio::test]
async fn test_unterminated_last_line_still_completes() {
    let server = MockServer::start().await;
    let host = host_of(&server);

    Mock::given(method("POST"))
        .and(path("/fetch"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            "{\"app.bsky.feed.post/abc\":{\"cid\":\"c1\",\"value\":{}}}\n{\"app.bsky.feed.po",
        ))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let config = create_test_config(&dir, &format!("{}/fetch", server.uri()));
    let (pipeline, recorded) = recorded_pipeline(config.clone());

    let report = pipeline
        .crawl(vec![IdentityHostPair::new("did:plc:ok", host.as_str())])
        .await
        .unwrap();

    // The partial trailing line is dropped; the identity still completes
    assert_eq!(report.passes.len(), 1);
    assert_eq!(report.remaining_retry(), 0);
    assert_eq!(status_of(&config, "did:plc:ok").await, IdentityStatus::Completed);
    assert_eq!(row_count(&config, "posts").await, 1);
    assert_eq!(counter(&recorded, LINES_REJECTED, &[]), 1);
}
