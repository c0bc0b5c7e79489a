//! Configuration models loaded from external sources.
//!
//! `episodic.yaml` in the working directory is merged with
//! `EPISODIC_`-prefixed environment variables; every field has a default so
//! the worker runs without a config file.

use std::path::PathBuf;

use serde::Deserialize;

use crate::domain::matching::MatchStrategy;
use crate::domain::subtitle::SourceFormat;

/// Bounds accepted for the backfill concurrency setting.
pub const MAX_BACKFILL_CONCURRENCY: usize = 100;

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database_url: String,
    pub matching: MatchingConfig,
    pub model: ModelConfig,
    pub backfill: BackfillConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            database_url: "episodic.db".to_string(),
            matching: MatchingConfig::default(),
            model: ModelConfig::default(),
            backfill: BackfillConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load from `episodic.yaml` (optional) plus `EPISODIC_*` environment
    /// overrides, then validate threshold ordering per format.
    pub fn load() -> Result<Self, config::ConfigError> {
        let mut cfg: AppConfig = config::Config::builder()
            .add_source(config::File::with_name("episodic").required(false))
            .add_source(config::Environment::with_prefix("EPISODIC").separator("__"))
            .build()?
            .try_deserialize()?;
        cfg.matching.thresholds.validate();
        Ok(cfg)
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct MatchingConfig {
    pub strategy: MatchStrategy,
    pub thresholds: ThresholdSettings,
    /// Score gap within which the top two candidates are indistinguishable.
    pub ambiguity_margin: f32,
    pub top_k: usize,
    /// Degrade the embedding strategy to fuzzy when the model is
    /// unavailable instead of surfacing an error.
    pub fallback_to_fuzzy: bool,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        MatchingConfig {
            strategy: MatchStrategy::Hybrid,
            thresholds: ThresholdSettings::default(),
            ambiguity_margin: crate::DEFAULT_AMBIGUITY_MARGIN,
            top_k: crate::DEFAULT_TOP_K,
            fallback_to_fuzzy: true,
        }
    }
}

/// Per-format confidence triple.
///
/// `similarity_floor` is the minimum similarity for a candidate to be
/// considered at all, `match_confidence` the floor for reporting a match,
/// `rename_confidence` the floor for acting on one automatically.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq)]
pub struct ThresholdProfile {
    pub similarity_floor: f32,
    pub match_confidence: f32,
    pub rename_confidence: f32,
}

impl ThresholdProfile {
    pub fn is_ordered(&self) -> bool {
        (0.0..=1.0).contains(&self.similarity_floor)
            && self.similarity_floor <= self.match_confidence
            && self.match_confidence <= self.rename_confidence
            && self.rename_confidence <= 1.0
    }
}

/// Per-format thresholds. OCR-derived text tolerates progressively less
/// noise as format quality improves, so each format is tuned independently.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct ThresholdSettings {
    pub text: ThresholdProfile,
    pub pgs: ThresholdProfile,
    pub vobsub: ThresholdProfile,
}

impl Default for ThresholdSettings {
    fn default() -> Self {
        ThresholdSettings {
            text: ThresholdProfile {
                similarity_floor: 0.60,
                match_confidence: 0.65,
                rename_confidence: 0.75,
            },
            pgs: ThresholdProfile {
                similarity_floor: 0.50,
                match_confidence: 0.55,
                rename_confidence: 0.65,
            },
            vobsub: ThresholdProfile {
                similarity_floor: 0.45,
                match_confidence: 0.50,
                rename_confidence: 0.60,
            },
        }
    }
}

impl ThresholdSettings {
    pub fn profile(&self, format: SourceFormat) -> &ThresholdProfile {
        match format {
            SourceFormat::Text => &self.text,
            SourceFormat::Pgs => &self.pgs,
            SourceFormat::VobSub => &self.vobsub,
        }
    }

    /// Enforce `floor <= match <= rename` per format, falling back to the
    /// default profile on violation.
    pub fn validate(&mut self) {
        let defaults = ThresholdSettings::default();
        for (name, profile, fallback) in [
            ("text", &mut self.text, defaults.text),
            ("pgs", &mut self.pgs, defaults.pgs),
            ("vobsub", &mut self.vobsub, defaults.vobsub),
        ] {
            if !profile.is_ordered() {
                log::warn!(
                    "Invalid {name} threshold profile {profile:?}; falling back to {fallback:?}"
                );
                *profile = fallback;
            }
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Model name understood by [`crate::embedding::resolve_model`].
    pub name: String,
    pub cache_dir: PathBuf,
    /// Expected sha256 of the cached ONNX artifact, hex-encoded.
    pub checksum: Option<String>,
    pub download_retries: u32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        ModelConfig {
            name: "all-minilm-l6-v2".to_string(),
            cache_dir: PathBuf::from(".fastembed_cache"),
            checksum: None,
            download_retries: 3,
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(default)]
pub struct BackfillConfig {
    /// Number of concurrent backfill workers, validated into `1..=100`.
    pub max_concurrency: usize,
    /// Rows per transaction.
    pub batch_size: usize,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        BackfillConfig {
            max_concurrency: 4,
            batch_size: 16,
        }
    }
}
