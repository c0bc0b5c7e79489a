use crate::db::{DbConnection, DbPool};
use crate::domain::subtitle::{NewSubtitleRecord, SubtitleRecord};
use crate::repository::errors::{RepositoryError, RepositoryResult};

pub mod errors;
pub mod subtitle;

pub trait SubtitleReader {
    /// Fetch one corpus entry by its (series, season, episode) key.
    fn get_subtitle(&self, series: &str, season: i32, episode: i32)
    -> RepositoryResult<SubtitleRecord>;

    /// List corpus entries, optionally scoped to one series.
    fn list_subtitles(&self, series: Option<&str>) -> RepositoryResult<Vec<SubtitleRecord>>;

    fn list_subtitles_by_ids(&self, ids: &[i32]) -> RepositoryResult<Vec<SubtitleRecord>>;

    /// Rows that still lack an embedding; the backfill work set.
    fn list_missing_embeddings(&self) -> RepositoryResult<Vec<SubtitleRecord>>;
}

pub trait SubtitleWriter {
    /// Insert or update on the (series, season, episode) key, returning the
    /// row id.
    fn upsert_subtitle(&self, record: &NewSubtitleRecord) -> RepositoryResult<i32>;

    fn set_subtitle_embedding(&self, id: i32, embedding: &[f32]) -> RepositoryResult<usize>;

    /// Persist a batch of embeddings in one transaction.
    fn set_subtitle_embeddings(&self, embeddings: &[(i32, Vec<f32>)]) -> RepositoryResult<usize>;
}

/// Diesel-backed repository over the subtitle corpus.
#[derive(Clone)]
pub struct DieselRepository {
    pool: DbPool,
}

impl DieselRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub(crate) fn conn(
        &self,
    ) -> Result<diesel::r2d2::PooledConnection<diesel::r2d2::ConnectionManager<DbConnection>>, RepositoryError>
    {
        Ok(self.pool.get()?)
    }
}
