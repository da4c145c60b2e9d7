//! Directory snapshot extraction
//!
//! The directory mirror is read once and flattened into a JSONL file of
//! `{"did","pds"}` lines; later runs reuse that file.

use crate::config::DirectoryConfig;
use crate::directory::IdentityHostPair;
use crate::host::normalize_host;
use crate::shutdown::ShutdownSignal;
use crate::{HarvestError, Result};
use rusqlite::{Connection, OpenFlags};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::time::Instant;

/// Latest host for every identity, ordered by identity
pub const LATEST_PAIRS_SQL: &str = "
    SELECT identity.did, atproto_pds.endpoint
    FROM identity
    JOIN plc_log ON identity.identity_id = plc_log.identity
    JOIN atproto_pds ON plc_log.atproto_pds = atproto_pds.pds_id
    WHERE plc_log.entry_id IN (SELECT MAX(entry_id) FROM plc_log GROUP BY identity)
    ORDER BY identity.did ASC
";

const PROGRESS_ROWS: u64 = 1_000_000;
const SHUTDOWN_CHECK_ROWS: u64 = 10_000;

/// Identities grouped by host, both in sorted order
pub type HostGroups = BTreeMap<String, Vec<String>>;

/// What [`dump_directory`] did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpOutcome {
    /// The pairs file already existed
    Skipped,
    Written { rows: u64 },
    /// A shutdown request stopped the dump; no pairs file was written
    Cancelled { rows: u64 },
}

/// Writes the pairs file from the directory mirror unless it already exists
///
/// The file is written under a temporary name and renamed when complete, so
/// an interrupted dump is redone on the next run. The shutdown signal is
/// polled every few thousand rows.
pub async fn dump_directory(
    config: &DirectoryConfig,
    shutdown: &ShutdownSignal,
) -> Result<DumpOutcome> {
    let config = config.clone();
    let shutdown = shutdown.clone();
    tokio::task::spawn_blocking(move || dump_blocking(&config, &shutdown))
        .await
        .map_err(|e| HarvestError::Task(e.to_string()))?
}

fn dump_blocking(config: &DirectoryConfig, shutdown: &ShutdownSignal) -> Result<DumpOutcome> {
    let output = Path::new(&config.pairs_path);
    if output.exists() {
        tracing::info!("{} already exists, skipping directory dump", output.display());
        return Ok(DumpOutcome::Skipped);
    }

    tracing::info!("Dumping directory from {}", config.plc_db_path);
    let conn = Connection::open_with_flags(&config.plc_db_path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;

    let partial = output.with_extension("partial");
    let mut writer = BufWriter::new(File::create(&partial)?);

    let started = Instant::now();
    let mut rows = 0u64;
    let mut stmt = conn.prepare(LATEST_PAIRS_SQL)?;
    let mut results = stmt.query([])?;

    while let Some(row) = results.next()? {
        if rows % SHUTDOWN_CHECK_ROWS == 0 && shutdown.is_triggered() {
            drop(writer);
            std::fs::remove_file(&partial)?;
            tracing::info!("Directory dump stopped after {} rows", rows);
            return Ok(DumpOutcome::Cancelled { rows });
        }

        let identity: String = row.get(0)?;
        let endpoint: String = row.get(1)?;
        let host = normalize_host(&endpoint, &config.relay_host, &config.default_host_markers);

        serde_json::to_writer(&mut writer, &IdentityHostPair::new(identity, host))?;
        writer.write_all(b"\n")?;

        rows += 1;
        if rows % PROGRESS_ROWS == 0 {
            tracing::info!(
                "Dumped {} rows ({:.0} rows/s)",
                rows,
                rows as f64 / started.elapsed().as_secs_f64()
            );
        }
    }

    writer.flush()?;
    drop(writer);
    std::fs::rename(&partial, output)?;

    tracing::info!(
        "Dumped {} pairs to {} in {:.1}s",
        rows,
        output.display(),
        started.elapsed().as_secs_f64()
    );
    Ok(DumpOutcome::Written { rows })
}

/// Reads the pairs file back, grouping identities by host
///
/// Lines that do not decode are logged and skipped.
pub async fn load_pairs(path: &Path) -> Result<HostGroups> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || load_blocking(&path))
        .await
        .map_err(|e| HarvestError::Task(e.to_string()))?
}

fn load_blocking(path: &Path) -> Result<HostGroups> {
    let reader = BufReader::new(File::open(path)?);
    let mut groups = HostGroups::new();
    let mut lines = 0u64;

    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<IdentityHostPair>(&line) {
            Ok(pair) => groups.entry(pair.host).or_default().push(pair.identity),
            Err(e) => {
                tracing::warn!("Skipping malformed pair on line {}: {}", index + 1, e);
                continue;
            }
        }

        lines += 1;
        if lines % PROGRESS_ROWS == 0 {
            tracing::info!("Loaded {} pairs", lines);
        }
    }

    tracing::info!("Loaded {} pairs across {} hosts", lines, groups.len());
    Ok(groups)
}
