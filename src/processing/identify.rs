//! Identification orchestrator.
//!
//! Per query the pipeline is: validate, select a strategy, compute the
//! fingerprint(s), search the corpus, apply the per-format thresholds and
//! classify the outcome.

use crate::domain::matching::{
    Classification, EpisodeRef, FingerprintQuery, Identification, MatchCandidate, MatchError,
    MatchStrategy,
};
use crate::domain::subtitle::SubtitleRecord;
use crate::embedding::Embedder;
use crate::fuzzy;
use crate::index::VectorIndex;
use crate::models::config::{MatchingConfig, ThresholdProfile};
use crate::repository::SubtitleReader;

/// Matches fingerprint queries against the stored corpus.
pub struct Identifier<'a, R, E> {
    repo: &'a R,
    embedder: &'a E,
    index: &'a VectorIndex,
    config: &'a MatchingConfig,
}

impl<'a, R, E> Identifier<'a, R, E>
where
    R: SubtitleReader,
    E: Embedder,
{
    pub fn new(
        repo: &'a R,
        embedder: &'a E,
        index: &'a VectorIndex,
        config: &'a MatchingConfig,
    ) -> Self {
        Identifier {
            repo,
            embedder,
            index,
            config,
        }
    }

    /// Identify the episode a subtitle track belongs to.
    ///
    /// An empty corpus yields a no-match result, not an error. A missing
    /// embedding model degrades to the fuzzy engine only when the fallback
    /// flag is configured; otherwise it surfaces as
    /// [`MatchError::ModelUnavailable`], distinct from a genuine no-match.
    pub fn identify(&self, query: &FingerprintQuery) -> Result<Identification, MatchError> {
        if query.variants.clean.trim().is_empty() {
            return Err(MatchError::InvalidInput(
                "query has no cleaned subtitle text".to_string(),
            ));
        }

        let profile = self.config.thresholds.profile(query.source_format);

        match self.config.strategy {
            MatchStrategy::Fuzzy => {
                let candidates = self.fuzzy_candidates(query, profile)?;
                Ok(self.classify(candidates, MatchStrategy::Fuzzy, query, profile))
            }
            MatchStrategy::Embedding => match self.embedding_candidates(query, profile) {
                Ok(candidates) => {
                    Ok(self.classify(candidates, MatchStrategy::Embedding, query, profile))
                }
                Err(MatchError::ModelUnavailable(reason)) if self.config.fallback_to_fuzzy => {
                    log::warn!("Embedding model unavailable ({reason}); falling back to fuzzy");
                    let candidates = self.fuzzy_candidates(query, profile)?;
                    Ok(self.classify(candidates, MatchStrategy::Fuzzy, query, profile))
                }
                Err(e) => Err(e),
            },
            MatchStrategy::Hybrid => self.identify_hybrid(query, profile),
        }
    }

    /// Embedding first; a result below the match floor retries with the
    /// fuzzy engine. Whichever result clears the floor is reported,
    /// preferring the higher confidence when both do. When neither clears
    /// it, the best available candidate is returned flagged low-confidence.
    fn identify_hybrid(
        &self,
        query: &FingerprintQuery,
        profile: &ThresholdProfile,
    ) -> Result<Identification, MatchError> {
        let embedding = match self.embedding_candidates(query, profile) {
            Ok(candidates) => Some(candidates),
            Err(MatchError::ModelUnavailable(reason)) if self.config.fallback_to_fuzzy => {
                log::warn!("Embedding model unavailable ({reason}); hybrid using fuzzy only");
                None
            }
            Err(e) => return Err(e),
        };

        let embedding_confidence = embedding
            .as_deref()
            .and_then(|c| c.first())
            .map(|c| c.confidence)
            .unwrap_or(0.0);

        if embedding_confidence >= profile.match_confidence {
            let candidates = embedding.unwrap_or_default();
            return Ok(self.classify(candidates, MatchStrategy::Embedding, query, profile));
        }

        let fuzzy = self.fuzzy_candidates(query, profile)?;
        let fuzzy_confidence = fuzzy.first().map(|c| c.confidence).unwrap_or(0.0);

        if fuzzy_confidence >= profile.match_confidence
            && fuzzy_confidence >= embedding_confidence
        {
            return Ok(self.classify(fuzzy, MatchStrategy::Fuzzy, query, profile));
        }

        // Neither strategy cleared the floor: report the best available.
        // A skipped embedding pass never claims the embedding tag.
        let (candidates, strategy) = match embedding {
            Some(candidates) if embedding_confidence >= fuzzy_confidence => {
                (candidates, MatchStrategy::Embedding)
            }
            _ => (fuzzy, MatchStrategy::Fuzzy),
        };
        let mut result = self.classify(candidates, strategy, query, profile);
        if result.best.is_some() && result.note.is_none() {
            result.note = Some(format!(
                "low confidence: best candidate below the {:.2} match floor",
                profile.match_confidence
            ));
        }
        Ok(result)
    }

    /// Fingerprint every non-empty variant and score each corpus entry by
    /// the maximum similarity across variants. Each normalization stage
    /// removes a different category of noise, so the best-aligned pair wins.
    fn fuzzy_candidates(
        &self,
        query: &FingerprintQuery,
        profile: &ThresholdProfile,
    ) -> Result<Vec<MatchCandidate>, MatchError> {
        let mut query_hashes = Vec::new();
        for (kind, text) in query.variants.iter() {
            if !text.trim().is_empty() {
                query_hashes.push((kind, fuzzy::compute(text.as_bytes())?));
            }
        }

        let records = self.repo.list_subtitles(None)?;
        let mut candidates = Vec::new();
        for record in &records {
            let mut best = 0u32;
            for (kind, hash) in &query_hashes {
                let stored = record.hashes.get(*kind);
                if stored.is_empty() {
                    continue;
                }
                best = best.max(fuzzy::compare(hash, stored)?);
            }
            let similarity = best as f32 / 100.0;
            if similarity >= profile.similarity_floor {
                candidates.push(candidate(record, similarity, 0));
            }
        }

        sort_and_rank(&mut candidates, self.config.top_k);
        Ok(candidates)
    }

    /// Embed the cleaned text and query the vector index.
    fn embedding_candidates(
        &self,
        query: &FingerprintQuery,
        profile: &ThresholdProfile,
    ) -> Result<Vec<MatchCandidate>, MatchError> {
        let vector = self.embedder.embed(&query.variants.clean)?;
        let hits = self.index.search(
            &vector,
            self.config.top_k,
            Some(profile.similarity_floor),
            None,
        )?;
        if hits.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<i32> = hits.iter().map(|h| h.id).collect();
        let records = self.repo.list_subtitles_by_ids(&ids)?;

        let mut candidates = Vec::new();
        for hit in &hits {
            match records.iter().find(|r| r.id == hit.id) {
                Some(record) => candidates.push(candidate(record, hit.similarity, 0)),
                // Stale index entries are only fixed by an explicit rebuild.
                None => log::warn!(
                    "Vector index entry {} has no corpus row; index needs a rebuild",
                    hit.id
                ),
            }
        }

        sort_and_rank(&mut candidates, self.config.top_k);
        Ok(candidates)
    }

    /// Apply the threshold profile to ranked candidates.
    fn classify(
        &self,
        candidates: Vec<MatchCandidate>,
        strategy: MatchStrategy,
        query: &FingerprintQuery,
        profile: &ThresholdProfile,
    ) -> Identification {
        let Some(best) = candidates.first().cloned() else {
            return Identification::no_match(query.source_format, strategy);
        };

        // A runner-up within the ambiguity margin blocks automatic action
        // even above the rename floor; renaming on a near-tie is worse than
        // asking.
        let ambiguous_runner_up = candidates.get(1).filter(|second| {
            best.confidence - second.confidence <= self.config.ambiguity_margin
        });

        let (classification, note) = if best.confidence < profile.match_confidence {
            (Classification::NoMatch, None)
        } else if let Some(second) = ambiguous_runner_up {
            let note = format!(
                "ambiguous: {} S{:02}E{:02} ({:.2}) and {} S{:02}E{:02} ({:.2}) are within {:.2} of each other",
                best.episode.series,
                best.episode.season,
                best.episode.episode,
                best.confidence,
                second.episode.series,
                second.episode.season,
                second.episode.episode,
                second.confidence,
                self.config.ambiguity_margin,
            );
            (Classification::AmbiguousMatch, Some(note))
        } else if best.confidence >= profile.rename_confidence {
            (Classification::DefinitiveMatch, None)
        } else {
            (Classification::Match, None)
        };

        Identification {
            classification,
            best: Some(best),
            candidates,
            note,
            source_format: query.source_format,
            strategy,
        }
    }
}

fn candidate(record: &SubtitleRecord, similarity: f32, rank: usize) -> MatchCandidate {
    MatchCandidate {
        episode: EpisodeRef {
            id: record.id,
            series: record.series.clone(),
            season: record.season,
            episode: record.episode,
            episode_name: record.episode_name.clone(),
        },
        similarity,
        confidence: similarity,
        rank,
    }
}

/// Order by descending similarity, ties by ascending record id, then assign
/// ranks and truncate to `top_k`.
fn sort_and_rank(candidates: &mut Vec<MatchCandidate>, top_k: usize) {
    candidates.sort_by(|a, b| {
        b.similarity
            .partial_cmp(&a.similarity)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.episode.id.cmp(&b.episode.id))
    });
    candidates.truncate(top_k);
    for (i, candidate) in candidates.iter_mut().enumerate() {
        candidate.rank = i;
    }
}
