use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::domain::matching::MatchError;

/// Container the subtitle text was extracted from.
///
/// OCR-derived formats carry progressively more noise: VobSub is the
/// noisiest, PGS is cleaner, plain text subtitles are cleanest. Thresholds
/// are tuned per format for that reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceFormat {
    Text,
    Pgs,
    VobSub,
}

impl SourceFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceFormat::Text => "text",
            SourceFormat::Pgs => "pgs",
            SourceFormat::VobSub => "vobsub",
        }
    }
}

impl fmt::Display for SourceFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceFormat {
    type Err = MatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(SourceFormat::Text),
            "pgs" => Ok(SourceFormat::Pgs),
            "vobsub" => Ok(SourceFormat::VobSub),
            other => Err(MatchError::UnsupportedFormat(other.to_string())),
        }
    }
}

/// Normalization stage a text variant or fuzzy hash belongs to.
///
/// Each stage removes a different category of noise: timing codes, markup,
/// then OCR artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariantKind {
    Raw,
    NoTimecodes,
    NoMarkup,
    Clean,
}

/// The four normalized renditions of one subtitle track.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TextVariants {
    pub raw: String,
    pub no_timecodes: String,
    pub no_markup: String,
    pub clean: String,
}

impl TextVariants {
    pub fn iter(&self) -> impl Iterator<Item = (VariantKind, &str)> {
        [
            (VariantKind::Raw, self.raw.as_str()),
            (VariantKind::NoTimecodes, self.no_timecodes.as_str()),
            (VariantKind::NoMarkup, self.no_markup.as_str()),
            (VariantKind::Clean, self.clean.as_str()),
        ]
        .into_iter()
    }
}

/// Fuzzy-hash signature per text variant.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VariantHashes {
    pub raw: String,
    pub no_timecodes: String,
    pub no_markup: String,
    pub clean: String,
}

impl VariantHashes {
    /// Fingerprint every variant of the given text.
    pub fn from_variants(variants: &TextVariants) -> Result<Self, MatchError> {
        Ok(VariantHashes {
            raw: crate::fuzzy::compute(variants.raw.as_bytes())?,
            no_timecodes: crate::fuzzy::compute(variants.no_timecodes.as_bytes())?,
            no_markup: crate::fuzzy::compute(variants.no_markup.as_bytes())?,
            clean: crate::fuzzy::compute(variants.clean.as_bytes())?,
        })
    }

    pub fn get(&self, kind: VariantKind) -> &str {
        match kind {
            VariantKind::Raw => &self.raw,
            VariantKind::NoTimecodes => &self.no_timecodes,
            VariantKind::NoMarkup => &self.no_markup,
            VariantKind::Clean => &self.clean,
        }
    }
}

/// A stored reference subtitle, keyed by (series, season, episode).
#[derive(Debug, Clone)]
pub struct SubtitleRecord {
    pub id: i32,
    pub series: String,
    pub season: i32,
    pub episode: i32,
    pub episode_name: Option<String>,
    pub variants: TextVariants,
    pub hashes: VariantHashes,
    pub embedding: Option<Vec<f32>>,
    pub source_format: SourceFormat,
}

/// A reference subtitle about to be stored. Embeddings are backfilled later.
#[derive(Debug, Clone)]
pub struct NewSubtitleRecord {
    pub series: String,
    pub season: i32,
    pub episode: i32,
    pub episode_name: Option<String>,
    pub variants: TextVariants,
    pub hashes: VariantHashes,
    pub source_format: SourceFormat,
}

impl NewSubtitleRecord {
    /// Build a new record, fingerprinting every text variant.
    pub fn new(
        series: impl Into<String>,
        season: i32,
        episode: i32,
        episode_name: Option<String>,
        variants: TextVariants,
        source_format: SourceFormat,
    ) -> Result<Self, MatchError> {
        let hashes = VariantHashes::from_variants(&variants)?;
        Ok(NewSubtitleRecord {
            series: series.into(),
            season,
            episode,
            episode_name,
            variants,
            hashes,
            source_format,
        })
    }
}
