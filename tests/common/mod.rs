//! Helpers for integration tests.

use episodic::db::{DbPool, establish_connection_pool};
use episodic::domain::matching::MatchError;
use episodic::domain::subtitle::{NewSubtitleRecord, SourceFormat, TextVariants};
use episodic::embedding::{Embedder, normalize_embedding};
use episodic::processing::migrate_schema;
use episodic::repository::{DieselRepository, SubtitleWriter};

/// Temporary database used in integration tests.
pub struct TestDb {
    filename: String,
    pool: DbPool,
}

impl TestDb {
    pub fn new(filename: &str) -> Self {
        std::fs::remove_file(filename).ok(); // Clean up old DB

        let pool =
            establish_connection_pool(filename).expect("Failed to establish SQLite connection.");
        migrate_schema(&pool).expect("Failed to migrate test database.");
        TestDb {
            filename: filename.to_string(),
            pool,
        }
    }

    pub fn pool(&self) -> DbPool {
        self.pool.clone()
    }
}

impl Drop for TestDb {
    fn drop(&mut self) {
        std::fs::remove_file(&self.filename).ok();
        std::fs::remove_file(format!("{}-shm", &self.filename)).ok();
        std::fs::remove_file(format!("{}-wal", &self.filename)).ok();
    }
}

/// Deterministic pseudo-subtitle text long enough for stable fingerprints.
pub fn subtitle_text(seed: u32, len: usize) -> String {
    let lines = [
        "I am the one who knocks.",
        "Say my name.",
        "We need to cook.",
        "Tread lightly.",
        "Better call Saul.",
        "Yeah, science!",
        "No half measures.",
        "I did it for me.",
        "Stay out of my territory.",
        "It's all about the chemistry.",
    ];
    let mut state = seed;
    let mut out = String::new();
    while out.len() < len {
        state = state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
        out.push_str(lines[(state >> 16) as usize % lines.len()]);
        out.push('\n');
    }
    out
}

/// Store one reference episode whose four variants share `text`.
pub fn insert_episode(
    repo: &DieselRepository,
    series: &str,
    season: i32,
    episode: i32,
    text: &str,
    format: SourceFormat,
) -> i32 {
    let variants = TextVariants {
        raw: text.to_string(),
        no_timecodes: text.to_string(),
        no_markup: text.to_string(),
        clean: text.to_string(),
    };
    let record = NewSubtitleRecord::new(series, season, episode, None, variants, format)
        .expect("fingerprinting test text should succeed");
    repo.upsert_subtitle(&record)
        .expect("upsert should succeed")
}

/// Embedder stub returning canned unit vectors per exact text, without any
/// model runtime.
pub struct StubEmbedder {
    pub dimension: usize,
    pub vectors: Vec<(String, Vec<f32>)>,
    pub fail_marker: Option<String>,
    pub unavailable: bool,
}

impl StubEmbedder {
    pub fn new(dimension: usize) -> Self {
        StubEmbedder {
            dimension,
            vectors: Vec::new(),
            fail_marker: None,
            unavailable: false,
        }
    }

    pub fn with_vector(mut self, text: &str, vector: Vec<f32>) -> Self {
        self.vectors.push((text.to_string(), vector));
        self
    }
}

impl Embedder for StubEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>, MatchError> {
        if self.unavailable {
            return Err(MatchError::ModelUnavailable("stubbed outage".to_string()));
        }
        if text.trim().is_empty() {
            return Err(MatchError::InvalidInput("empty text".to_string()));
        }
        if let Some(marker) = &self.fail_marker {
            if text.contains(marker.as_str()) {
                return Err(MatchError::ModelUnavailable(
                    "stubbed inference failure".to_string(),
                ));
            }
        }
        let vector = self
            .vectors
            .iter()
            .find(|(key, _)| key == text)
            .map(|(_, v)| v.clone())
            .unwrap_or_else(|| {
                let mut v = vec![0.0; self.dimension];
                v[0] = 1.0;
                v
            });
        Ok(normalize_embedding(&vector))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}
