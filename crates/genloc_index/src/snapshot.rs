use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::entity_table::{EntityTable, FileSnapshotRow};
use crate::store::{ChunkMetadata, SearchHit};

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid JSON in '{path}': {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Raw neighbours of one bug-report segment, in store order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SegmentResult {
    pub document: Vec<String>,
    pub metadata: Vec<ChunkMetadata>,
    pub distance: Vec<f32>,
}

impl SegmentResult {
    pub fn from_hits(hits: Vec<SearchHit>) -> Self {
        let mut segment = SegmentResult::default();
        for hit in hits {
            segment.document.push(hit.document);
            segment.metadata.push(hit.metadata);
            segment.distance.push(hit.distance);
        }
        segment
    }
}

/// Project names may contain `/`; paths use `__` instead.
pub fn sanitize_project_name(project: &str) -> String {
    project.replace('/', "__")
}

/// Per-bug JSON files under `<output>/<project>_bug_data/`.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn for_project(output_dir: &Path, project: &str) -> Self {
        Self::new(output_dir.join(format!("{}_bug_data", sanitize_project_name(project))))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn entity_table_path(&self, bug_id: &str) -> PathBuf {
        self.root.join(format!("{bug_id}_filewise_method_data.json"))
    }

    pub fn search_result_path(&self, bug_id: &str) -> PathBuf {
        self.root.join(format!("{bug_id}.json"))
    }

    pub fn write_entity_table(&self, bug_id: &str, table: &EntityTable) -> Result<PathBuf, SnapshotError> {
        let path = self.entity_table_path(bug_id);
        write_json(&path, &table.snapshot())?;
        debug!(bug_id, files = table.len(), path = %path.display(), "Wrote entity table snapshot");
        Ok(path)
    }

    pub fn read_entity_table(&self, bug_id: &str) -> Result<EntityTable, SnapshotError> {
        let rows: Vec<FileSnapshotRow> = read_json(&self.entity_table_path(bug_id))?;
        Ok(EntityTable::from_snapshot(rows))
    }

    pub fn write_search_result(
        &self,
        bug_id: &str,
        segments: &[SegmentResult],
    ) -> Result<PathBuf, SnapshotError> {
        let path = self.search_result_path(bug_id);
        write_json(&path, segments)?;
        Ok(path)
    }

    pub fn read_search_result(&self, bug_id: &str) -> Result<Vec<SegmentResult>, SnapshotError> {
        read_json(&self.search_result_path(bug_id))
    }

    pub fn has_bug(&self, bug_id: &str) -> bool {
        self.entity_table_path(bug_id).is_file() && self.search_result_path(bug_id).is_file()
    }
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), SnapshotError> {
    let io_error = |source| SnapshotError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_error)?;
    }
    let mut writer = BufWriter::new(File::create(path).map_err(io_error)?);
    serde_json::to_writer(&mut writer, value).map_err(|source| SnapshotError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    writer.flush().map_err(io_error)
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, SnapshotError> {
    let file = File::open(path).map_err(|source| SnapshotError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_reader(BufReader::new(file)).map_err(|source| SnapshotError::Json {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use indexmap::IndexMap;

    use super::*;

    #[test]
    fn entity_tables_round_trip_through_disk() {
        let scratch = tempfile::tempdir().unwrap();
        let store = SnapshotStore::for_project(scratch.path(), "apache/commons");
        assert!(store.root().ends_with("apache__commons_bug_data"));

        let mut table = EntityTable::new();
        let mut entities = IndexMap::new();
        entities.insert("run(self)".to_string(), "def run(self): pass".to_string());
        table.insert("pkg/run.py", entities);

        let path = store.write_entity_table("42", &table).unwrap();
        assert!(path.ends_with("42_filewise_method_data.json"));

        let raw: serde_json::Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(raw[0]["filepath"], "pkg/run.py");
        assert_eq!(raw[0]["filename"], "run.py");
        assert_eq!(raw[0]["methods"][0]["signature"], "run(self)");

        assert_eq!(store.read_entity_table("42").unwrap(), table);
    }

    #[test]
    fn search_results_keep_segment_layout() {
        let scratch = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(scratch.path());
        let segment = SegmentResult::from_hits(vec![SearchHit {
            document: "file: a.py\ndef a(): pass".into(),
            metadata: ChunkMetadata { file: "a.py".into() },
            distance: 0.25,
        }]);

        store.write_search_result("7", &[segment.clone()]).unwrap();
        assert!(!store.has_bug("7"));
        assert_eq!(store.read_search_result("7").unwrap(), vec![segment]);
    }

    #[test]
    fn missing_snapshots_report_the_path() {
        let scratch = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(scratch.path());
        let error = store.read_entity_table("missing").unwrap_err();
        assert!(error.to_string().contains("missing_filewise_method_data.json"));
    }
}
