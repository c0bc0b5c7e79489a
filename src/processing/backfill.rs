//! Corpus schema migration and embedding backfill.
//!
//! The schema only ever evolves additively: new optional columns, never a
//! destructive rewrite, so existing fingerprint data survives every
//! migration. Backfill feeds batches of legacy rows through a bounded
//! channel to isolated workers, each with its own pooled connection and a
//! local failure buffer merged at the end.

use std::sync::Arc;

use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::sql_query;
use futures::future::join_all;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::db::DbPool;
use crate::domain::matching::MatchError;
use crate::embedding::Embedder;
use crate::index::{IndexEntry, VectorIndex};
use crate::models::config::{BackfillConfig, MAX_BACKFILL_CONCURRENCY};
use crate::repository::errors::RepositoryResult;
use crate::repository::{DieselRepository, SubtitleReader, SubtitleWriter};

const CREATE_SUBTITLES_TABLE: &str = "
CREATE TABLE IF NOT EXISTS subtitles (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    series TEXT NOT NULL,
    season INTEGER NOT NULL,
    episode INTEGER NOT NULL,
    episode_name TEXT,
    text_raw TEXT NOT NULL,
    text_no_timecodes TEXT NOT NULL,
    text_no_markup TEXT NOT NULL,
    text_clean TEXT NOT NULL,
    hash_raw TEXT NOT NULL,
    hash_no_timecodes TEXT NOT NULL,
    hash_no_markup TEXT NOT NULL,
    hash_clean TEXT NOT NULL,
    source_format TEXT NOT NULL,
    created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
    updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
    UNIQUE (series, season, episode)
);
";

#[derive(QueryableByName)]
struct ColumnInfo {
    #[diesel(sql_type = diesel::sql_types::Text)]
    name: String,
}

/// Create the corpus table when absent and add columns introduced since.
///
/// Idempotent: each column is checked for existence before being added, so
/// re-running against an up-to-date database changes nothing.
pub fn migrate_schema(pool: &DbPool) -> RepositoryResult<()> {
    let mut conn = pool.get()?;

    conn.batch_execute(CREATE_SUBTITLES_TABLE)?;

    let columns: Vec<ColumnInfo> = sql_query("PRAGMA table_info(subtitles)").load(&mut conn)?;
    if !columns.iter().any(|c| c.name == "embedding") {
        conn.batch_execute("ALTER TABLE subtitles ADD COLUMN embedding BLOB")?;
        log::info!("Added embedding column to the subtitles table");
    }

    Ok(())
}

/// Outcome of one backfill pass.
#[derive(Debug, Default)]
pub struct BackfillReport {
    /// Rows that were missing an embedding when the pass started.
    pub total: usize,
    pub succeeded: usize,
    /// Per-row failures, collected rather than aborting the pass.
    pub failed: Vec<(i32, String)>,
    pub cancelled: bool,
}

struct BatchOutcome {
    processed: usize,
    embedded: Vec<(i32, Vec<f32>)>,
    failed: Vec<(i32, String)>,
}

/// Generate embeddings for corpus rows that lack one.
///
/// Rows are processed in batches with one commit per batch; individual row
/// failures are collected, never fatal to sibling work. Re-running after a
/// partial pass only touches rows still missing an embedding. On
/// cancellation no new batches are scheduled, but in-flight batches finish
/// cleanly.
pub async fn populate_missing<E>(
    pool: &DbPool,
    embedder: Arc<E>,
    config: &BackfillConfig,
    cancel: CancellationToken,
) -> Result<BackfillReport, MatchError>
where
    E: Embedder + 'static,
{
    if config.max_concurrency == 0 || config.max_concurrency > MAX_BACKFILL_CONCURRENCY {
        return Err(MatchError::InvalidInput(format!(
            "backfill concurrency {} outside 1..={MAX_BACKFILL_CONCURRENCY}",
            config.max_concurrency
        )));
    }
    let batch_size = config.batch_size.max(1);

    let repo = DieselRepository::new(pool.clone());
    let pending = repo.list_missing_embeddings()?;
    let total = pending.len();
    if total == 0 {
        log::info!("Backfill: no rows missing embeddings");
        return Ok(BackfillReport::default());
    }
    log::info!(
        "Backfill: {total} rows missing embeddings, {} workers, batches of {batch_size}",
        config.max_concurrency
    );

    // Load the model before fanning out so every worker shares one handle.
    embedder.preload(&cancel)?;

    let batches: Vec<Vec<(i32, String)>> = pending
        .into_iter()
        .map(|r| (r.id, r.variants.clean))
        .collect::<Vec<_>>()
        .chunks(batch_size)
        .map(<[(i32, String)]>::to_vec)
        .collect();

    let (batch_tx, batch_rx) = mpsc::channel::<Vec<(i32, String)>>(config.max_concurrency);
    let batch_rx = Arc::new(tokio::sync::Mutex::new(batch_rx));
    let (outcome_tx, mut outcome_rx) = mpsc::unbounded_channel::<BatchOutcome>();

    let mut handles = Vec::with_capacity(config.max_concurrency);
    for _ in 0..config.max_concurrency {
        // One repository per worker: independent store connections avoid
        // write contention between batch commits.
        let repo = DieselRepository::new(pool.clone());
        let embedder = Arc::clone(&embedder);
        let batch_rx = Arc::clone(&batch_rx);
        let outcome_tx = outcome_tx.clone();
        let worker_cancel = cancel.clone();
        handles.push(tokio::spawn(async move {
            loop {
                // The batch being processed always commits whole; queued
                // batches are abandoned once cancellation fires.
                if worker_cancel.is_cancelled() {
                    break;
                }
                let batch = { batch_rx.lock().await.recv().await };
                let Some(batch) = batch else { break };
                let outcome = process_batch(&repo, embedder.as_ref(), &batch);
                if outcome_tx.send(outcome).is_err() {
                    break;
                }
            }
        }));
    }
    drop(outcome_tx);

    let feeder_cancel = cancel.clone();
    let feeder = tokio::spawn(async move {
        for batch in batches {
            if feeder_cancel.is_cancelled() {
                return true;
            }
            // A closed channel means every worker exited, which happens
            // mid-send only on cancellation.
            if batch_tx.send(batch).await.is_err() {
                return feeder_cancel.is_cancelled();
            }
        }
        false
    });

    let mut report = BackfillReport {
        total,
        ..Default::default()
    };
    let mut processed = 0usize;
    let mut last_decile = 0usize;
    while let Some(outcome) = outcome_rx.recv().await {
        processed += outcome.processed;
        report.succeeded += outcome.embedded.len();
        report.failed.extend(outcome.failed);
        let decile = processed * 10 / total;
        if decile > last_decile {
            last_decile = decile;
            log::info!("Backfill progress: {}% ({processed}/{total})", decile * 10);
        }
    }

    report.cancelled = feeder.await.unwrap_or(false);
    join_all(handles).await;

    log::info!(
        "Backfill finished: {}/{} rows embedded, {} failed{}",
        report.succeeded,
        report.total,
        report.failed.len(),
        if report.cancelled { " (cancelled)" } else { "" }
    );
    Ok(report)
}

/// Embed one batch and commit it in a single transaction.
fn process_batch<E: Embedder + ?Sized>(
    repo: &DieselRepository,
    embedder: &E,
    batch: &[(i32, String)],
) -> BatchOutcome {
    let mut embedded = Vec::with_capacity(batch.len());
    let mut failed = Vec::new();

    for (id, text) in batch {
        match embedder.embed(text) {
            Ok(vector) => embedded.push((*id, vector)),
            Err(e) => failed.push((*id, e.to_string())),
        }
    }

    if let Err(e) = repo.set_subtitle_embeddings(&embedded) {
        // The whole batch rolled back; report every row as failed.
        failed.extend(embedded.drain(..).map(|(id, _)| (id, e.to_string())));
    }

    BatchOutcome {
        processed: batch.len(),
        embedded,
        failed,
    }
}

/// Repopulate the vector index from the corpus embeddings.
pub fn rebuild_index<R: SubtitleReader>(
    repo: &R,
    index: &VectorIndex,
) -> Result<usize, MatchError> {
    let entries: Vec<IndexEntry> = repo
        .list_subtitles(None)?
        .into_iter()
        .filter_map(|record| {
            record.embedding.map(|vector| IndexEntry {
                id: record.id,
                series: record.series,
                source_format: record.source_format,
                vector,
            })
        })
        .collect();
    index.rebuild(&entries)
}

/// Full maintenance pass: migrate, backfill, then rebuild the index.
///
/// The index rebuild is skipped after a cancelled backfill so a partial
/// pass never silently publishes a half-updated index.
pub async fn run<E>(
    pool: &DbPool,
    embedder: Arc<E>,
    index: &VectorIndex,
    config: &BackfillConfig,
    cancel: CancellationToken,
) -> Result<BackfillReport, MatchError>
where
    E: Embedder + 'static,
{
    migrate_schema(pool)?;
    let report = populate_missing(pool, embedder, config, cancel).await?;
    if !report.cancelled {
        let count = rebuild_index(&DieselRepository::new(pool.clone()), index)?;
        log::info!("Rebuilt vector index with {count} entries");
    }
    Ok(report)
}
