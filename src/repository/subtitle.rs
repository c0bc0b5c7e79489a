use bytemuck::cast_slice;
use chrono::Utc;
use diesel::prelude::*;

use crate::domain::subtitle::{NewSubtitleRecord, SubtitleRecord};
use crate::models::subtitle::{NewSubtitle as DbNewSubtitle, Subtitle as DbSubtitle};
use crate::repository::errors::{RepositoryError, RepositoryResult};
use crate::repository::{DieselRepository, SubtitleReader, SubtitleWriter};

fn into_domain(rows: Vec<DbSubtitle>) -> RepositoryResult<Vec<SubtitleRecord>> {
    rows.into_iter().map(SubtitleRecord::try_from).collect()
}

impl SubtitleReader for DieselRepository {
    fn get_subtitle(
        &self,
        series: &str,
        season: i32,
        episode: i32,
    ) -> RepositoryResult<SubtitleRecord> {
        use crate::schema::subtitles;

        let mut conn = self.conn()?;

        let row = subtitles::table
            .filter(subtitles::series.eq(series))
            .filter(subtitles::season.eq(season))
            .filter(subtitles::episode.eq(episode))
            .first::<DbSubtitle>(&mut conn)?;

        SubtitleRecord::try_from(row)
    }

    fn list_subtitles(&self, series: Option<&str>) -> RepositoryResult<Vec<SubtitleRecord>> {
        use crate::schema::subtitles;

        let mut conn = self.conn()?;

        let mut query = subtitles::table.into_boxed();
        if let Some(series) = series {
            query = query.filter(subtitles::series.eq(series));
        }
        let rows = query
            .order(subtitles::id.asc())
            .load::<DbSubtitle>(&mut conn)?;

        into_domain(rows)
    }

    fn list_subtitles_by_ids(&self, ids: &[i32]) -> RepositoryResult<Vec<SubtitleRecord>> {
        use crate::schema::subtitles;

        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.conn()?;

        let rows = subtitles::table
            .filter(subtitles::id.eq_any(ids))
            .order(subtitles::id.asc())
            .load::<DbSubtitle>(&mut conn)?;

        into_domain(rows)
    }

    fn list_missing_embeddings(&self) -> RepositoryResult<Vec<SubtitleRecord>> {
        use crate::schema::subtitles;

        let mut conn = self.conn()?;

        let rows = subtitles::table
            .filter(subtitles::embedding.is_null())
            .order(subtitles::id.asc())
            .load::<DbSubtitle>(&mut conn)?;

        into_domain(rows)
    }
}

impl SubtitleWriter for DieselRepository {
    fn upsert_subtitle(&self, record: &NewSubtitleRecord) -> RepositoryResult<i32> {
        use crate::schema::subtitles;

        let mut conn = self.conn()?;
        let db_record: DbNewSubtitle = record.clone().into();

        let id = diesel::insert_into(subtitles::table)
            .values(&db_record)
            .on_conflict((subtitles::series, subtitles::season, subtitles::episode))
            .do_update()
            .set((
                &db_record,
                subtitles::updated_at.eq(Utc::now().naive_utc()),
            ))
            .returning(subtitles::id)
            .get_result::<i32>(&mut conn)?;

        Ok(id)
    }

    fn set_subtitle_embedding(&self, id: i32, embedding: &[f32]) -> RepositoryResult<usize> {
        use crate::schema::subtitles;

        let mut conn = self.conn()?;

        // Convert &[f32] to &[u8]
        let blob: Vec<u8> = cast_slice(embedding).to_vec();

        let affected = diesel::update(subtitles::table.filter(subtitles::id.eq(id)))
            .set((
                subtitles::embedding.eq(blob),
                subtitles::updated_at.eq(Utc::now().naive_utc()),
            ))
            .execute(&mut conn)?;

        Ok(affected)
    }

    fn set_subtitle_embeddings(&self, embeddings: &[(i32, Vec<f32>)]) -> RepositoryResult<usize> {
        use crate::schema::subtitles;

        if embeddings.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn()?;

        let affected = conn.transaction(|conn| {
            let mut affected_rows = 0;
            for (id, embedding) in embeddings {
                let blob: Vec<u8> = cast_slice(embedding.as_slice()).to_vec();
                affected_rows += diesel::update(subtitles::table.filter(subtitles::id.eq(id)))
                    .set((
                        subtitles::embedding.eq(blob),
                        subtitles::updated_at.eq(Utc::now().naive_utc()),
                    ))
                    .execute(conn)?;
            }
            Ok::<usize, RepositoryError>(affected_rows)
        })?;

        Ok(affected)
    }
}
