use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::subtitle::{SourceFormat, TextVariants};
use crate::repository::errors::RepositoryError;

/// Errors surfaced by the matching layer.
///
/// Invalid input is rejected synchronously before any storage or network
/// I/O. A missing model is kept distinct from a genuine no-match so callers
/// can tell "could not try" apart from "tried and found nothing".
#[derive(Debug, Error)]
pub enum MatchError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("unsupported source format: {0}")]
    UnsupportedFormat(String),
    #[error("embedding model unavailable: {0}")]
    ModelUnavailable(String),
    #[error("vector index error: {0}")]
    Index(String),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// Fingerprinting method used to match a query against the corpus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchStrategy {
    Fuzzy,
    Embedding,
    Hybrid,
}

/// An unidentified subtitle track to match: the normalized text variants
/// plus the detected container format. Never persisted.
#[derive(Debug, Clone)]
pub struct FingerprintQuery {
    pub variants: TextVariants,
    pub source_format: SourceFormat,
}

/// The episode a candidate points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpisodeRef {
    pub id: i32,
    pub series: String,
    pub season: i32,
    pub episode: i32,
    pub episode_name: Option<String>,
}

/// One ranked corpus entry considered for a query.
#[derive(Debug, Clone)]
pub struct MatchCandidate {
    pub episode: EpisodeRef,
    pub similarity: f32,
    pub confidence: f32,
    pub rank: usize,
}

/// Confidence tier of an identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Confidence clears the rename floor; downstream may act automatically.
    DefinitiveMatch,
    /// Top candidates are within the ambiguity margin of each other.
    AmbiguousMatch,
    /// Clears the match floor but is not rename-eligible.
    Match,
    NoMatch,
}

impl Classification {
    /// Ordering of tiers for monotonicity checks: higher is more confident.
    /// Ambiguous and plain matches share a tier.
    pub fn tier(&self) -> u8 {
        match self {
            Classification::NoMatch => 0,
            Classification::AmbiguousMatch | Classification::Match => 1,
            Classification::DefinitiveMatch => 2,
        }
    }
}

/// Outcome of one identification query.
#[derive(Debug, Clone)]
pub struct Identification {
    pub classification: Classification,
    /// Present unless the classification is [`Classification::NoMatch`]
    /// against an empty candidate list.
    pub best: Option<MatchCandidate>,
    pub candidates: Vec<MatchCandidate>,
    /// Explanatory note for ambiguous or low-confidence outcomes.
    pub note: Option<String>,
    pub source_format: SourceFormat,
    /// Strategy that actually produced the reported result.
    pub strategy: MatchStrategy,
}

impl Identification {
    pub fn no_match(source_format: SourceFormat, strategy: MatchStrategy) -> Self {
        Identification {
            classification: Classification::NoMatch,
            best: None,
            candidates: Vec::new(),
            note: None,
            source_format,
            strategy,
        }
    }
}
