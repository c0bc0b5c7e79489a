//! Diesel row models for the subtitle corpus and their domain conversions.

use chrono::NaiveDateTime;
use diesel::prelude::*;

use crate::domain::subtitle::{
    NewSubtitleRecord, SourceFormat, SubtitleRecord, TextVariants, VariantHashes,
};
use crate::repository::errors::RepositoryError;
use crate::schema::subtitles;

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = subtitles)]
pub struct Subtitle {
    pub id: i32,
    pub series: String,
    pub season: i32,
    pub episode: i32,
    pub episode_name: Option<String>,
    pub text_raw: String,
    pub text_no_timecodes: String,
    pub text_no_markup: String,
    pub text_clean: String,
    pub hash_raw: String,
    pub hash_no_timecodes: String,
    pub hash_no_markup: String,
    pub hash_clean: String,
    pub embedding: Option<Vec<u8>>,
    pub source_format: String,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Clone, Insertable, AsChangeset)]
#[diesel(table_name = subtitles)]
pub struct NewSubtitle {
    pub series: String,
    pub season: i32,
    pub episode: i32,
    pub episode_name: Option<String>,
    pub text_raw: String,
    pub text_no_timecodes: String,
    pub text_no_markup: String,
    pub text_clean: String,
    pub hash_raw: String,
    pub hash_no_timecodes: String,
    pub hash_no_markup: String,
    pub hash_clean: String,
    pub source_format: String,
}

impl TryFrom<Subtitle> for SubtitleRecord {
    type Error = RepositoryError;

    fn try_from(row: Subtitle) -> Result<Self, Self::Error> {
        let source_format: SourceFormat = row
            .source_format
            .parse()
            .map_err(|e| RepositoryError::Validation(format!("row {}: {e}", row.id)))?;

        let embedding = match row.embedding {
            Some(blob) => {
                if blob.len() % std::mem::size_of::<f32>() != 0 {
                    return Err(RepositoryError::Validation(format!(
                        "row {}: embedding blob of {} bytes is not a float vector",
                        row.id,
                        blob.len()
                    )));
                }
                // pod_collect_to_vec tolerates the blob's 1-byte alignment.
                Some(bytemuck::pod_collect_to_vec::<u8, f32>(&blob))
            }
            None => None,
        };

        Ok(SubtitleRecord {
            id: row.id,
            series: row.series,
            season: row.season,
            episode: row.episode,
            episode_name: row.episode_name,
            variants: TextVariants {
                raw: row.text_raw,
                no_timecodes: row.text_no_timecodes,
                no_markup: row.text_no_markup,
                clean: row.text_clean,
            },
            hashes: VariantHashes {
                raw: row.hash_raw,
                no_timecodes: row.hash_no_timecodes,
                no_markup: row.hash_no_markup,
                clean: row.hash_clean,
            },
            embedding,
            source_format,
        })
    }
}

impl From<NewSubtitleRecord> for NewSubtitle {
    fn from(record: NewSubtitleRecord) -> Self {
        NewSubtitle {
            series: record.series,
            season: record.season,
            episode: record.episode,
            episode_name: record.episode_name,
            text_raw: record.variants.raw,
            text_no_timecodes: record.variants.no_timecodes,
            text_no_markup: record.variants.no_markup,
            text_clean: record.variants.clean,
            hash_raw: record.hashes.raw,
            hash_no_timecodes: record.hashes.no_timecodes,
            hash_no_markup: record.hashes.no_markup,
            hash_clean: record.hashes.clean,
            source_format: record.source_format.as_str().to_string(),
        }
    }
}
