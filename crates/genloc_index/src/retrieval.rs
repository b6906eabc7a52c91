use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::chunk::Chunker;
use crate::snapshot::{SegmentResult, SnapshotError, SnapshotStore};
use crate::store::{IndexStore, StoreError};

pub const DEFAULT_NEIGHBORS: usize = 300;
pub const DEFAULT_CANDIDATE_LIMIT: usize = 50;

#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub path: String,
    pub similarity: f32,
}

/// Files ordered by their best similarity to a bug report.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CandidateList {
    pub entries: Vec<Candidate>,
}

impl CandidateList {
    /// Merges the hits of every segment. A file scores the maximum
    /// `1 - distance` over all of its chunks; files keep first-seen order on
    /// equal scores.
    pub fn from_search_result(segments: &[SegmentResult], limit: usize) -> Self {
        let mut best: IndexMap<&str, f32> = IndexMap::new();
        for segment in segments {
            for (metadata, distance) in segment.metadata.iter().zip(segment.distance.iter()) {
                let similarity = 1.0 - distance;
                best.entry(metadata.file.as_str())
                    .and_modify(|score| {
                        if similarity > *score {
                            *score = similarity;
                        }
                    })
                    .or_insert(similarity);
            }
        }

        let mut entries: Vec<Candidate> = best
            .into_iter()
            .map(|(path, similarity)| Candidate {
                path: path.to_string(),
                similarity,
            })
            .collect();
        entries.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
        entries.truncate(limit);
        Self { entries }
    }

    pub fn paths(&self) -> Vec<String> {
        self.entries.iter().map(|entry| entry.path.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Turns bug-report text into a candidate list through the index store.
pub struct RetrievalRanker {
    segmenter: Chunker,
    neighbors: usize,
    candidate_limit: usize,
}

impl RetrievalRanker {
    /// `segmenter` must count tokens the way the embedding model does.
    pub fn new(segmenter: Chunker, neighbors: usize, candidate_limit: usize) -> Self {
        Self {
            segmenter,
            neighbors,
            candidate_limit,
        }
    }

    /// Queries every report segment, persists the raw neighbours for the bug
    /// and returns the merged candidate list.
    pub fn retrieve(
        &self,
        store: &dyn IndexStore,
        snapshots: &SnapshotStore,
        bug_id: &str,
        report: &str,
    ) -> Result<CandidateList, RetrievalError> {
        let segments = self.segmenter.split(report);
        debug!(bug_id, segments = segments.len(), "Querying report segments");

        let results: Vec<SegmentResult> = store
            .query(&segments, self.neighbors)?
            .into_iter()
            .map(SegmentResult::from_hits)
            .collect();
        snapshots.write_search_result(bug_id, &results)?;

        let candidates = CandidateList::from_search_result(&results, self.candidate_limit);
        info!(bug_id, candidates = candidates.len(), "Retrieved candidate files");
        Ok(candidates)
    }

    /// Candidate list from a previously persisted search result.
    pub fn load(&self, snapshots: &SnapshotStore, bug_id: &str) -> Result<CandidateList, RetrievalError> {
        let results = snapshots.read_search_result(bug_id)?;
        Ok(CandidateList::from_search_result(&results, self.candidate_limit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ChunkMetadata;

    fn segment(hits: &[(&str, f32)]) -> SegmentResult {
        SegmentResult {
            document: hits.iter().map(|(file, _)| format!("file: {file}\n")).collect(),
            metadata: hits
                .iter()
                .map(|(file, _)| ChunkMetadata {
                    file: file.to_string(),
                })
                .collect(),
            distance: hits.iter().map(|(_, distance)| *distance).collect(),
        }
    }

    #[test]
    fn files_score_their_best_chunk_not_the_sum() {
        let segments = vec![
            segment(&[("fileA", 0.1), ("fileB", 0.5)]),
            segment(&[("fileA", 0.3)]),
        ];
        let candidates = CandidateList::from_search_result(&segments, 50);

        assert_eq!(candidates.paths(), vec!["fileA", "fileB"]);
        assert!((candidates.entries[0].similarity - 0.9).abs() < 1e-6);
        assert!((candidates.entries[1].similarity - 0.5).abs() < 1e-6);
    }

    #[test]
    fn later_segments_can_raise_a_score() {
        let segments = vec![
            segment(&[("a.py", 0.6), ("b.py", 0.4)]),
            segment(&[("a.py", 0.05)]),
        ];
        let candidates = CandidateList::from_search_result(&segments, 50);
        assert_eq!(candidates.paths(), vec!["a.py", "b.py"]);
        assert!((candidates.entries[0].similarity - 0.95).abs() < 1e-6);
    }

    #[test]
    fn list_is_truncated_to_the_limit() {
        let hits: Vec<(String, f32)> = (0..60)
            .map(|index| (format!("f{index}.py"), index as f32 / 100.0))
            .collect();
        let borrowed: Vec<(&str, f32)> = hits.iter().map(|(f, d)| (f.as_str(), *d)).collect();
        let candidates = CandidateList::from_search_result(&[segment(&borrowed)], 50);

        assert_eq!(candidates.len(), 50);
        assert_eq!(candidates.entries[0].path, "f0.py");
        assert_eq!(candidates.entries[49].path, "f49.py");
    }
}
