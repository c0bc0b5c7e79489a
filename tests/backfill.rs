mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use diesel::connection::SimpleConnection;
use tokio_util::sync::CancellationToken;

use episodic::db::establish_connection_pool;
use episodic::domain::matching::MatchError;
use episodic::domain::subtitle::SourceFormat;
use episodic::embedding::Embedder;
use episodic::index::VectorIndex;
use episodic::models::config::BackfillConfig;
use episodic::processing::{backfill, migrate_schema, populate_missing, rebuild_index};
use episodic::repository::{DieselRepository, SubtitleReader, SubtitleWriter};

use common::{StubEmbedder, TestDb, insert_episode, subtitle_text};

fn backfill_config(max_concurrency: usize, batch_size: usize) -> BackfillConfig {
    BackfillConfig {
        max_concurrency,
        batch_size,
    }
}

/// Embedder that cancels the shared token on its n-th call, simulating a
/// shutdown request arriving while a batch is being embedded.
struct MidRunCancelEmbedder {
    inner: StubEmbedder,
    cancel: CancellationToken,
    calls: AtomicUsize,
    cancel_at: usize,
}

impl Embedder for MidRunCancelEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>, MatchError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) + 1 == self.cancel_at {
            self.cancel.cancel();
        }
        self.inner.embed(text)
    }

    fn dimension(&self) -> usize {
        self.inner.dimension()
    }
}

#[tokio::test]
async fn populate_missing_embeds_every_pending_row() {
    let db = TestDb::new("backfill_all.db");
    let repo = DieselRepository::new(db.pool());
    for i in 0..25 {
        insert_episode(
            &repo,
            "Breaking Bad",
            1,
            i,
            &subtitle_text(i as u32 + 1, 2048),
            SourceFormat::Text,
        );
    }

    let embedder = Arc::new(StubEmbedder::new(3));
    let report = populate_missing(
        &db.pool(),
        embedder,
        &backfill_config(4, 8),
        CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(report.total, 25);
    assert_eq!(report.succeeded, 25);
    assert!(report.failed.is_empty());
    assert!(!report.cancelled);

    let rows = repo.list_subtitles(None).unwrap();
    assert!(rows.iter().all(|r| r.embedding.is_some()));
    assert!(
        rows.iter()
            .all(|r| r.embedding.as_ref().unwrap().len() == 3)
    );
}

#[tokio::test]
async fn populate_missing_is_idempotent() {
    let db = TestDb::new("backfill_idempotent.db");
    let repo = DieselRepository::new(db.pool());
    for i in 0..5 {
        insert_episode(
            &repo,
            "The Wire",
            2,
            i,
            &subtitle_text(i as u32 + 10, 2048),
            SourceFormat::Pgs,
        );
    }

    let embedder = Arc::new(StubEmbedder::new(3));
    let first = populate_missing(
        &db.pool(),
        Arc::clone(&embedder),
        &backfill_config(2, 2),
        CancellationToken::new(),
    )
    .await
    .unwrap();
    assert_eq!(first.succeeded, 5);

    // Nothing left to do on the second pass.
    let second = populate_missing(
        &db.pool(),
        embedder,
        &backfill_config(2, 2),
        CancellationToken::new(),
    )
    .await
    .unwrap();
    assert_eq!(second.total, 0);
    assert_eq!(second.succeeded, 0);
}

#[tokio::test]
async fn row_failures_are_collected_not_fatal() {
    let db = TestDb::new("backfill_failures.db");
    let repo = DieselRepository::new(db.pool());
    for i in 0..6 {
        let mut text = subtitle_text(i as u32 + 20, 2048);
        if i % 3 == 0 {
            text.push_str("POISON");
        }
        insert_episode(&repo, "Fargo", 1, i, &text, SourceFormat::Text);
    }

    let mut embedder = StubEmbedder::new(3);
    embedder.fail_marker = Some("POISON".to_string());
    let report = populate_missing(
        &db.pool(),
        Arc::new(embedder),
        &backfill_config(3, 2),
        CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(report.total, 6);
    assert_eq!(report.succeeded, 4);
    assert_eq!(report.failed.len(), 2);

    // Only the failed rows remain pending.
    let healthy = Arc::new(StubEmbedder::new(3));
    let retry = populate_missing(
        &db.pool(),
        healthy,
        &backfill_config(3, 2),
        CancellationToken::new(),
    )
    .await
    .unwrap();
    assert_eq!(retry.total, 2);
    assert_eq!(retry.succeeded, 2);
}

#[tokio::test]
async fn concurrency_bound_is_validated() {
    let db = TestDb::new("backfill_bounds.db");
    let embedder = Arc::new(StubEmbedder::new(3));
    for bad in [0, 101] {
        let result = populate_missing(
            &db.pool(),
            Arc::clone(&embedder),
            &backfill_config(bad, 8),
            CancellationToken::new(),
        )
        .await;
        assert!(matches!(result, Err(MatchError::InvalidInput(_))));
    }
}

#[tokio::test]
async fn cancellation_schedules_no_new_batches() {
    let db = TestDb::new("backfill_cancel.db");
    let repo = DieselRepository::new(db.pool());
    for i in 0..10 {
        insert_episode(
            &repo,
            "Fargo",
            2,
            i,
            &subtitle_text(i as u32 + 40, 2048),
            SourceFormat::Text,
        );
    }

    let cancel = CancellationToken::new();
    cancel.cancel();
    let report = populate_missing(
        &db.pool(),
        Arc::new(StubEmbedder::new(3)),
        &backfill_config(2, 4),
        cancel,
    )
    .await
    .unwrap();

    assert!(report.cancelled);
    assert_eq!(report.succeeded, 0);
    let pending = repo.list_missing_embeddings().unwrap();
    assert_eq!(pending.len(), 10);
}

#[tokio::test]
async fn cancellation_mid_run_keeps_committed_batches() {
    let db = TestDb::new("backfill_cancel_midrun.db");
    let repo = DieselRepository::new(db.pool());
    for i in 0..20 {
        insert_episode(
            &repo,
            "Fargo",
            3,
            i,
            &subtitle_text(i as u32 + 80, 2048),
            SourceFormat::Text,
        );
    }

    let cancel = CancellationToken::new();
    let embedder = MidRunCancelEmbedder {
        inner: StubEmbedder::new(3),
        cancel: cancel.clone(),
        calls: AtomicUsize::new(0),
        cancel_at: 1,
    };
    let report = populate_missing(
        &db.pool(),
        Arc::new(embedder),
        &backfill_config(1, 4),
        cancel,
    )
    .await
    .unwrap();

    // The batch in flight when the token fired still committed whole;
    // later batches never started.
    assert!(report.cancelled);
    assert!(report.failed.is_empty());
    assert!(report.succeeded >= 4, "got {}", report.succeeded);
    assert!(report.succeeded < 20, "got {}", report.succeeded);
    assert_eq!(report.succeeded % 4, 0);

    // Committed rows persist and the remainder stays pending, so a later
    // pass picks up exactly where this one stopped.
    let pending = repo.list_missing_embeddings().unwrap();
    assert_eq!(pending.len(), 20 - report.succeeded);

    let resumed = populate_missing(
        &db.pool(),
        Arc::new(StubEmbedder::new(3)),
        &backfill_config(1, 4),
        CancellationToken::new(),
    )
    .await
    .unwrap();
    assert_eq!(resumed.total, 20 - report.succeeded);
    assert_eq!(resumed.succeeded, resumed.total);
}

#[tokio::test]
async fn run_rebuilds_the_index_after_backfill() {
    let db = TestDb::new("backfill_run.db");
    let repo = DieselRepository::new(db.pool());
    for i in 0..4 {
        insert_episode(
            &repo,
            "Breaking Bad",
            3,
            i,
            &subtitle_text(i as u32 + 60, 2048),
            SourceFormat::VobSub,
        );
    }

    let index = VectorIndex::new(3).unwrap();
    assert!(index.is_empty());

    let report = backfill::run(
        &db.pool(),
        Arc::new(StubEmbedder::new(3)),
        &index,
        &backfill_config(2, 2),
        CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(report.succeeded, 4);
    assert_eq!(index.len(), 4);
}

#[test]
fn migrate_schema_is_idempotent_and_additive() {
    let filename = "backfill_migrate.db";
    std::fs::remove_file(filename).ok();

    // Legacy schema without the embedding column.
    let pool = establish_connection_pool(filename).unwrap();
    {
        let mut conn = pool.get().unwrap();
        conn.batch_execute(
            "CREATE TABLE subtitles (
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
            );",
        )
        .unwrap();
    }

    migrate_schema(&pool).unwrap();
    // Second run must be a no-op, not an error.
    migrate_schema(&pool).unwrap();

    // The added column is usable and existing rows are intact.
    let repo = DieselRepository::new(pool.clone());
    insert_episode(
        &repo,
        "The Wire",
        1,
        1,
        &subtitle_text(99, 2048),
        SourceFormat::Text,
    );
    let pending = repo.list_missing_embeddings().unwrap();
    assert_eq!(pending.len(), 1);

    drop(repo);
    drop(pool);
    std::fs::remove_file(filename).ok();
    std::fs::remove_file(format!("{filename}-shm")).ok();
    std::fs::remove_file(format!("{filename}-wal")).ok();
}

#[test]
fn rebuild_index_skips_rows_without_embeddings() {
    let db = TestDb::new("backfill_partial_index.db");
    let repo = DieselRepository::new(db.pool());

    let with = insert_episode(
        &repo,
        "Fargo",
        1,
        1,
        &subtitle_text(70, 2048),
        SourceFormat::Text,
    );
    insert_episode(
        &repo,
        "Fargo",
        1,
        2,
        &subtitle_text(71, 2048),
        SourceFormat::Text,
    );
    repo.set_subtitle_embedding(with, &[0.0, 1.0, 0.0]).unwrap();

    let index = VectorIndex::new(3).unwrap();
    let count = rebuild_index(&repo, &index).unwrap();
    assert_eq!(count, 1);
}
