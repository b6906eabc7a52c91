use std::collections::HashSet;

use genloc_index::fuzzy::{filenames_match, most_similar_path};
use genloc_index::{EntityTable, SourceLanguage};
use tracing::debug;

use crate::agent::RankedEntry;

/// Maps model-provided file names onto tracked paths.
///
/// An exact path wins. Otherwise the tracked files sharing the entry's
/// basename are compared by path-token similarity and the closest one is
/// taken. Entries that match nothing are dropped, and repeated model paths
/// count once.
pub fn resolve_ranked_list(
    entries: &[RankedEntry],
    table: &EntityTable,
    language: SourceLanguage,
) -> Vec<String> {
    let extension = language.extension();
    let mut seen_inputs = HashSet::new();
    let mut resolved = Vec::new();

    for entry in entries {
        let file = entry.file.trim();
        if !seen_inputs.insert(file) {
            continue;
        }

        let path = if table.contains(file) {
            Some(file)
        } else {
            let same_name = table
                .iter()
                .filter(|(_, record)| filenames_match(&record.filename, file, extension))
                .map(|(path, _)| path);
            most_similar_path(file, same_name)
        };

        match path {
            Some(path) => resolved.push(path.to_string()),
            None => debug!(file, "Ranked file does not resolve to a tracked path"),
        }
    }
    resolved
}

#[cfg(test)]
mod tests {
    use indexmap::IndexMap;

    use super::*;

    fn table(paths: &[&str]) -> EntityTable {
        let mut table = EntityTable::new();
        for path in paths {
            let mut entities = IndexMap::new();
            entities.insert("run()".to_string(), "def run(): pass".to_string());
            table.insert(path, entities);
        }
        table
    }

    fn entries(files: &[&str]) -> Vec<RankedEntry> {
        files
            .iter()
            .map(|file| RankedEntry {
                file: file.to_string(),
                justification: String::new(),
            })
            .collect()
    }

    #[test]
    fn exact_paths_then_closest_basename_match() {
        let table = table(&["src/app/views.py", "src/admin/views.py", "src/app/models.py"]);
        let resolved = resolve_ranked_list(
            &entries(&["src/app/models.py", "admin/views.py", "missing.py", "app/VIEWS"]),
            &table,
            SourceLanguage::Python,
        );
        assert_eq!(
            resolved,
            vec!["src/app/models.py", "src/admin/views.py", "src/app/views.py"]
        );
    }

    #[test]
    fn repeated_model_paths_count_once() {
        let table = table(&["pkg/a.py"]);
        let resolved = resolve_ranked_list(
            &entries(&["pkg/a.py", "pkg/a.py"]),
            &table,
            SourceLanguage::Python,
        );
        assert_eq!(resolved, vec!["pkg/a.py"]);
    }
}
