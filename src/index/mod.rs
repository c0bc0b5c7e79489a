//! Approximate nearest-neighbor search over corpus embeddings.
//!
//! Backed by a usearch navigable small-world graph with cosine metric.
//! Reads take a shared lock and may run concurrently without limit; a
//! rebuild constructs a fresh graph off to the side and swaps it in under
//! the write lock, so searches never observe a half-populated index. A
//! stale index is only ever fixed by an explicit rebuild.

use std::collections::HashMap;
use std::sync::RwLock;

use usearch::{Index, IndexOptions, MetricKind, ScalarKind};

use crate::domain::matching::MatchError;
use crate::domain::subtitle::SourceFormat;

/// One corpus embedding to be inserted on rebuild.
#[derive(Debug, Clone)]
pub struct IndexEntry {
    pub id: i32,
    pub series: String,
    pub source_format: SourceFormat,
    pub vector: Vec<f32>,
}

/// Optional scoping of a search by record metadata.
#[derive(Debug, Clone, Default)]
pub struct SearchFilter {
    pub series: Option<String>,
    pub source_format: Option<SourceFormat>,
}

impl SearchFilter {
    fn matches(&self, meta: &EntryMeta) -> bool {
        if let Some(series) = &self.series {
            if !meta.series.eq_ignore_ascii_case(series) {
                return false;
            }
        }
        if let Some(format) = self.source_format {
            if meta.source_format != format {
                return false;
            }
        }
        true
    }
}

/// A ranked search hit. Distance is reported as `1 - cosine`.
#[derive(Debug, Clone, PartialEq)]
pub struct Neighbor {
    pub id: i32,
    pub distance: f32,
    pub similarity: f32,
}

#[derive(Debug, Clone)]
struct EntryMeta {
    series: String,
    source_format: SourceFormat,
}

struct IndexState {
    index: Index,
    meta: HashMap<u64, EntryMeta>,
}

/// Similarity index over the stored corpus embeddings.
pub struct VectorIndex {
    dimensions: usize,
    state: RwLock<IndexState>,
}

fn new_graph(dimensions: usize) -> Result<Index, MatchError> {
    Index::new(&IndexOptions {
        dimensions,
        metric: MetricKind::Cos,
        quantization: ScalarKind::F32,
        ..Default::default()
    })
    .map_err(|e| MatchError::Index(e.to_string()))
}

impl VectorIndex {
    pub fn new(dimensions: usize) -> Result<Self, MatchError> {
        if dimensions == 0 {
            return Err(MatchError::InvalidInput(
                "index dimensionality must be positive".to_string(),
            ));
        }
        Ok(VectorIndex {
            dimensions,
            state: RwLock::new(IndexState {
                index: new_graph(dimensions)?,
                meta: HashMap::new(),
            }),
        })
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn len(&self) -> usize {
        self.state.read().map(|s| s.meta.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Search the `top_k` closest entries to `query`.
    ///
    /// Results are ordered by descending similarity, ties broken by
    /// ascending record id for determinism. An empty index yields an empty
    /// list, never an error.
    pub fn search(
        &self,
        query: &[f32],
        top_k: usize,
        min_similarity: Option<f32>,
        filter: Option<&SearchFilter>,
    ) -> Result<Vec<Neighbor>, MatchError> {
        if query.len() != self.dimensions {
            return Err(MatchError::InvalidInput(format!(
                "query vector has {} dimensions, index expects {}",
                query.len(),
                self.dimensions
            )));
        }
        if top_k == 0 {
            return Err(MatchError::InvalidInput(
                "top_k must be positive".to_string(),
            ));
        }

        let state = self
            .state
            .read()
            .map_err(|_| MatchError::Index("index lock poisoned".to_string()))?;
        if state.meta.is_empty() {
            return Ok(Vec::new());
        }

        // Metadata filtering happens after the graph search, so oversample
        // to keep top_k meaningful for scoped queries.
        let fetch = if filter.is_some() {
            (top_k * 4).min(state.meta.len()).max(top_k)
        } else {
            top_k.min(state.meta.len())
        };

        let matches = state
            .index
            .search(query, fetch)
            .map_err(|e| MatchError::Index(e.to_string()))?;

        let mut neighbors: Vec<Neighbor> = matches
            .keys
            .iter()
            .zip(matches.distances.iter())
            .filter(|(key, _)| {
                filter
                    .map(|f| state.meta.get(key).is_some_and(|m| f.matches(m)))
                    .unwrap_or(true)
            })
            .map(|(&key, &distance)| Neighbor {
                id: key as i32,
                distance,
                similarity: (1.0 - distance).clamp(0.0, 1.0),
            })
            .filter(|n| min_similarity.is_none_or(|floor| n.similarity >= floor))
            .collect();

        neighbors.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.id.cmp(&b.id))
        });
        neighbors.truncate(top_k);
        Ok(neighbors)
    }

    /// Discard the current graph and repopulate it from `entries`.
    ///
    /// Builds the replacement off-lock and swaps it in atomically; used
    /// after a bulk backfill. Returns the number of indexed entries.
    pub fn rebuild(&self, entries: &[IndexEntry]) -> Result<usize, MatchError> {
        let index = new_graph(self.dimensions)?;
        let mut meta = HashMap::with_capacity(entries.len());

        if !entries.is_empty() {
            index
                .reserve(entries.len())
                .map_err(|e| MatchError::Index(e.to_string()))?;
        }
        for entry in entries {
            if entry.vector.len() != self.dimensions {
                return Err(MatchError::InvalidInput(format!(
                    "entry {} has {} dimensions, index expects {}",
                    entry.id,
                    entry.vector.len(),
                    self.dimensions
                )));
            }
            index
                .add(entry.id as u64, &entry.vector)
                .map_err(|e| MatchError::Index(e.to_string()))?;
            meta.insert(
                entry.id as u64,
                EntryMeta {
                    series: entry.series.clone(),
                    source_format: entry.source_format,
                },
            );
        }

        let mut state = self
            .state
            .write()
            .map_err(|_| MatchError::Index("index lock poisoned".to_string()))?;
        state.index = index;
        state.meta = meta;
        Ok(state.meta.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: i32, series: &str, format: SourceFormat, vector: Vec<f32>) -> IndexEntry {
        IndexEntry {
            id,
            series: series.to_string(),
            source_format: format,
            vector,
        }
    }

    fn seeded_index() -> VectorIndex {
        let index = VectorIndex::new(3).unwrap();
        index
            .rebuild(&[
                entry(1, "Breaking Bad", SourceFormat::VobSub, vec![1.0, 0.0, 0.0]),
                entry(2, "Breaking Bad", SourceFormat::Text, vec![0.0, 1.0, 0.0]),
                entry(3, "The Wire", SourceFormat::Pgs, vec![0.7071, 0.7071, 0.0]),
            ])
            .unwrap();
        index
    }

    #[test]
    fn empty_index_returns_empty_list() {
        let index = VectorIndex::new(3).unwrap();
        let hits = index.search(&[1.0, 0.0, 0.0], 5, None, None).unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn search_rejects_dimension_mismatch_and_zero_top_k() {
        let index = VectorIndex::new(3).unwrap();
        assert!(matches!(
            index.search(&[1.0, 0.0], 5, None, None),
            Err(MatchError::InvalidInput(_))
        ));
        assert!(matches!(
            index.search(&[1.0, 0.0, 0.0], 0, None, None),
            Err(MatchError::InvalidInput(_))
        ));
    }

    #[test]
    fn search_orders_by_descending_similarity() {
        let index = seeded_index();
        let hits = index.search(&[1.0, 0.0, 0.0], 3, None, None).unwrap();
        assert_eq!(hits[0].id, 1);
        for pair in hits.windows(2) {
            assert!(pair[0].similarity >= pair[1].similarity);
        }
        for hit in &hits {
            assert!((0.0..=1.0).contains(&hit.similarity));
            assert!((hit.distance - (1.0 - hit.similarity)).abs() < 1e-5);
        }
    }

    #[test]
    fn min_similarity_floors_the_results() {
        let index = seeded_index();
        let hits = index
            .search(&[1.0, 0.0, 0.0], 3, Some(0.9), None)
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, 1);
    }

    #[test]
    fn metadata_filter_scopes_the_search() {
        let index = seeded_index();
        let filter = SearchFilter {
            series: Some("The Wire".to_string()),
            source_format: None,
        };
        let hits = index
            .search(&[1.0, 0.0, 0.0], 3, None, Some(&filter))
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, 3);

        let filter = SearchFilter {
            series: None,
            source_format: Some(SourceFormat::Text),
        };
        let hits = index
            .search(&[0.0, 1.0, 0.0], 3, None, Some(&filter))
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, 2);
    }

    #[test]
    fn rebuild_replaces_previous_contents() {
        let index = seeded_index();
        assert_eq!(index.len(), 3);
        let count = index
            .rebuild(&[entry(9, "Fargo", SourceFormat::Text, vec![0.0, 0.0, 1.0])])
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(index.len(), 1);
        let hits = index.search(&[0.0, 0.0, 1.0], 5, None, None).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, 9);
    }

    #[test]
    fn rebuild_rejects_mismatched_entry_dimensions() {
        let index = VectorIndex::new(3).unwrap();
        let bad = entry(1, "Fargo", SourceFormat::Text, vec![1.0, 0.0]);
        assert!(matches!(
            index.rebuild(&[bad]),
            Err(MatchError::InvalidInput(_))
        ));
    }
}
