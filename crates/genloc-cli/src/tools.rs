//! Lookup tools offered to the model during refinement, backed by one bug's
//! entity table snapshot and candidate list.

use genloc_index::fuzzy::{closest_entities, filenames_match, method_name, normalize_signature};
use genloc_index::{EntityTable, FileRecord, SourceLanguage};
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::chat::ToolDefinition;

pub const SEARCH_FILE: &str = "search_file";
pub const SEARCH_METHOD: &str = "search_method";
pub const GET_CANDIDATE_FILES: &str = "get_candidate_files";
pub const GET_METHOD_SIGNATURES: &str = "get_method_signatures_of_a_file";
pub const GET_METHOD_BODY: &str = "get_method_body";

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("invalid arguments for {tool}: {message}")]
    InvalidArguments { tool: String, message: String },
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct SearchFileArgs {
    /// File name inferred from the bug report, with or without extension (e.g. `person.py`).
    pub filename: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct SearchMethodArgs {
    /// Name of the function or method to look for (e.g. `update_person_details`).
    pub method_name: String,
}

#[derive(Debug, Default, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct GetCandidateFilesArgs {}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct GetMethodSignaturesArgs {
    /// Path of the file to inspect.
    pub filepath: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct GetMethodBodyArgs {
    /// Path of the file that contains the method.
    pub filepath: String,
    /// Signature of the method whose body should be returned.
    pub method_signature: String,
}

/// JSON schema for `T` with the generator's top-level annotations removed.
pub fn parameters_schema<T: JsonSchema>() -> Value {
    let mut value = serde_json::to_value(schemars::schema_for!(T)).unwrap_or_else(|_| json!({}));
    if let Value::Object(map) = &mut value {
        map.remove("$schema");
        map.remove("title");
        map.entry("type").or_insert_with(|| json!("object"));
        map.entry("properties").or_insert_with(|| json!({}));
    }
    value
}

pub fn tool_definitions(language: SourceLanguage) -> Vec<ToolDefinition> {
    let language = match language {
        SourceLanguage::Python => "Python",
        SourceLanguage::Java => "Java",
    };
    vec![
        ToolDefinition::function(
            SEARCH_FILE,
            &format!(
                "Check whether a {language} file with the given name exists in the codebase. \
                 Returns every matching filepath."
            ),
            parameters_schema::<SearchFileArgs>(),
        ),
        ToolDefinition::function(
            SEARCH_METHOD,
            &format!(
                "Find every {language} file that defines a method with the given name. \
                 Returns filepaths with the matching signatures."
            ),
            parameters_schema::<SearchMethodArgs>(),
        ),
        ToolDefinition::function(
            GET_CANDIDATE_FILES,
            "List the files most similar to the bug report according to semantic search. \
             Use it when the report gives no strong hint about file or method names.",
            parameters_schema::<GetCandidateFilesArgs>(),
        ),
        ToolDefinition::function(
            GET_METHOD_SIGNATURES,
            &format!(
                "List the method signatures defined in a {language} file, to judge its \
                 structure and pick methods worth reading."
            ),
            parameters_schema::<GetMethodSignaturesArgs>(),
        ),
        ToolDefinition::function(
            GET_METHOD_BODY,
            &format!(
                "Return the source of one method from a {language} file so its logic can be \
                 compared with the reported symptoms."
            ),
            parameters_schema::<GetMethodBodyArgs>(),
        ),
    ]
}

/// Read-only tool implementations over one bug's snapshot.
#[derive(Debug, Clone)]
pub struct ToolBackends {
    table: EntityTable,
    candidates: Vec<String>,
    language: SourceLanguage,
    signature_threshold: usize,
}

impl ToolBackends {
    pub fn new(
        table: EntityTable,
        candidates: Vec<String>,
        language: SourceLanguage,
        signature_threshold: usize,
    ) -> Self {
        Self {
            table,
            candidates,
            language,
            signature_threshold,
        }
    }

    pub fn table(&self) -> &EntityTable {
        &self.table
    }

    /// Runs the named tool on JSON-encoded arguments. Unknown tools produce
    /// an error payload; arguments that do not fit the tool's schema are an
    /// error.
    pub fn dispatch(&self, name: &str, arguments: &str) -> Result<Value, ToolError> {
        let response = match name {
            SEARCH_FILE => {
                let args: SearchFileArgs = parse_args(name, arguments)?;
                self.search_file(&args.filename)
            }
            SEARCH_METHOD => {
                let args: SearchMethodArgs = parse_args(name, arguments)?;
                self.search_method(&args.method_name)
            }
            GET_CANDIDATE_FILES => {
                let _: GetCandidateFilesArgs = parse_args(name, arguments)?;
                self.get_candidate_files()
            }
            GET_METHOD_SIGNATURES => {
                let args: GetMethodSignaturesArgs = parse_args(name, arguments)?;
                self.get_method_signatures_of_a_file(&args.filepath)
            }
            GET_METHOD_BODY => {
                let args: GetMethodBodyArgs = parse_args(name, arguments)?;
                self.get_method_body(&args.filepath, &args.method_signature)
            }
            other => json!({ "error": format!("Unknown function: {other}") }),
        };
        Ok(response)
    }

    fn files_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = (&'a str, &'a FileRecord)> + 'a {
        let extension = self.language.extension();
        self.table
            .iter()
            .filter(move |(_, record)| filenames_match(&record.filename, name, extension))
    }

    pub fn search_file(&self, filename: &str) -> Value {
        let matches: Vec<Value> = self
            .files_named(filename)
            .map(|(path, _)| json!({ "filename": filename, "filepath": path }))
            .collect();
        if matches.is_empty() {
            debug!(filename, "No file matched");
            return json!({ "error": "File not found", "filename": filename });
        }
        Value::Array(matches)
    }

    pub fn search_method(&self, name: &str) -> Value {
        let wanted = method_name(name).to_lowercase();
        let mut matches = Vec::new();
        for (path, record) in self.table.iter() {
            for entity in &record.entities {
                if method_name(&entity.signature).to_lowercase() == wanted {
                    matches.push(json!({
                        "filepath": path,
                        "signature": normalize_signature(&entity.signature),
                    }));
                }
            }
        }
        if matches.is_empty() {
            debug!(method = name, "No method matched");
            return json!({ "error": "Method not found", "method_name": name });
        }
        Value::Array(matches)
    }

    pub fn get_candidate_files(&self) -> Value {
        json!(self.candidates)
    }

    pub fn get_method_signatures_of_a_file(&self, filepath: &str) -> Value {
        let describe = |path: &str, record: &FileRecord| {
            let signatures: Vec<String> = record
                .entities
                .iter()
                .map(|entity| normalize_signature(&entity.signature))
                .collect();
            json!({ "filepath": path, "signatures": signatures })
        };

        if let Some(record) = self.table.get(filepath) {
            return describe(filepath, record);
        }

        let matches: Vec<Value> = self
            .files_named(filepath)
            .map(|(path, record)| describe(path, record))
            .collect();
        match matches.len() {
            0 => {
                debug!(filepath, "No file matched");
                json!({ "error": "File not found", "filepath": filepath })
            }
            1 => matches.into_iter().next().unwrap_or(Value::Null),
            count => {
                warn!(filepath, count, "Several files share this name");
                Value::Array(matches)
            }
        }
    }

    pub fn get_method_body(&self, filepath: &str, signature: &str) -> Value {
        if let Some(record) = self.table.get(filepath) {
            let found = self.method_bodies(filepath, record, signature);
            if !found.is_empty() {
                return Value::Array(found);
            }
        }

        let found: Vec<Value> = self
            .files_named(filepath)
            .flat_map(|(path, record)| self.method_bodies(path, record, signature))
            .collect();
        if found.is_empty() {
            debug!(filepath, signature, "No method body matched");
            return json!({
                "error": "Problem in filepath or method signature",
                "filepath": filepath,
                "signature": signature,
            });
        }
        if found.len() > 1 {
            warn!(filepath, signature, count = found.len(), "Several method bodies matched");
        }
        Value::Array(found)
    }

    fn method_bodies(&self, path: &str, record: &FileRecord, signature: &str) -> Vec<Value> {
        closest_entities(signature, &record.entities, self.signature_threshold)
            .into_iter()
            .map(|entity| {
                json!({
                    "filepath": path,
                    "signature": normalize_signature(&entity.signature),
                    "body": entity.body,
                })
            })
            .collect()
    }
}

fn parse_args<T: DeserializeOwned>(tool: &str, arguments: &str) -> Result<T, ToolError> {
    let arguments = if arguments.trim().is_empty() { "{}" } else { arguments };
    serde_json::from_str(arguments).map_err(|error| ToolError::InvalidArguments {
        tool: tool.to_string(),
        message: error.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use genloc_index::fuzzy::DEFAULT_SIGNATURE_DISTANCE;
    use indexmap::IndexMap;

    use super::*;

    fn backends() -> ToolBackends {
        let mut table = EntityTable::new();
        let mut person = IndexMap::new();
        person.insert(
            "update_person_details(self,  name )".to_string(),
            "def update_person_details(self, name):\n    self.name = name".to_string(),
        );
        person.insert("save(self)".to_string(), "def save(self):\n    pass".to_string());
        table.insert("app/models/person.py", person);

        let mut other = IndexMap::new();
        other.insert("save(self, force)".to_string(), "def save(self, force):\n    pass".to_string());
        table.insert("legacy/Person.py", other);

        ToolBackends::new(
            table,
            vec!["app/models/person.py".into(), "legacy/Person.py".into()],
            SourceLanguage::Python,
            DEFAULT_SIGNATURE_DISTANCE,
        )
    }

    #[test]
    fn search_file_matches_basenames_case_insensitively() {
        let response = backends().dispatch(SEARCH_FILE, r#"{"filename": "person"}"#).unwrap();
        let paths: Vec<&str> = response
            .as_array()
            .unwrap()
            .iter()
            .map(|entry| entry["filepath"].as_str().unwrap())
            .collect();
        assert_eq!(paths, vec!["app/models/person.py", "legacy/Person.py"]);

        let missing = backends().search_file("account.py");
        assert_eq!(missing["error"], "File not found");
    }

    #[test]
    fn search_method_compares_names_only() {
        let response = backends().search_method("SAVE(anything)");
        assert_eq!(response.as_array().unwrap().len(), 2);
        assert_eq!(response[1]["signature"], "save(self,force)");
        assert_eq!(backends().search_method("delete")["error"], "Method not found");
    }

    #[test]
    fn signatures_fall_back_to_basename_matches() {
        let tools = backends();
        let exact = tools.get_method_signatures_of_a_file("app/models/person.py");
        assert_eq!(exact["signatures"][0], "update_person_details(self,name)");

        let fallback = tools.get_method_signatures_of_a_file("models/PERSON.py");
        assert_eq!(fallback.as_array().unwrap().len(), 2);

        let missing = tools.get_method_signatures_of_a_file("nothing.py");
        assert_eq!(missing["error"], "File not found");
    }

    #[test]
    fn method_bodies_tolerate_small_signature_differences() {
        let tools = backends();
        let exact = tools.get_method_body("app/models/person.py", "update_person_details( self, name)");
        assert!(exact[0]["body"].as_str().unwrap().contains("self.name = name"));

        let fuzzy = tools.get_method_body("app/models/person.py", "update_person_detail(self, nam)");
        assert_eq!(fuzzy.as_array().unwrap().len(), 1);

        let too_far = tools.get_method_body("app/models/person.py", "remove_everything(x)");
        assert_eq!(too_far["error"], "Problem in filepath or method signature");
    }

    #[test]
    fn signature_distance_threshold_is_inclusive_of_small_edits_only() {
        let mut table = EntityTable::new();
        let mut entities = IndexMap::new();
        entities.insert(
            "compute_total(items, tax)".to_string(),
            "def compute_total(items, tax):\n    return sum(items) * tax".to_string(),
        );
        table.insert("billing/total.py", entities);
        let tools = ToolBackends::new(table, Vec::new(), SourceLanguage::Python, DEFAULT_SIGNATURE_DISTANCE);

        let three_edits = tools.get_method_body("billing/total.py", "compute_totl(item, tx)");
        assert_eq!(three_edits[0]["signature"], "compute_total(items,tax)");

        let six_edits = tools.get_method_body("billing/total.py", "comp_total(it, tax)");
        assert_eq!(six_edits["error"], "Problem in filepath or method signature");
    }

    #[test]
    fn method_body_lookup_falls_back_to_other_files_with_the_same_name() {
        let body = backends().get_method_body("person.py", "save(self, force)");
        let entries = body.as_array().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["filepath"], "legacy/Person.py");
    }

    #[test]
    fn unknown_tools_and_bad_arguments() {
        let tools = backends();
        assert_eq!(
            tools.dispatch("drop_table", "{}").unwrap(),
            json!({ "error": "Unknown function: drop_table" })
        );
        assert!(tools.dispatch(SEARCH_FILE, r#"{"file": "a.py"}"#).is_err());
        assert!(tools.dispatch(SEARCH_FILE, "not json").is_err());
        assert_eq!(tools.dispatch(GET_CANDIDATE_FILES, "").unwrap().as_array().unwrap().len(), 2);
    }

    #[test]
    fn tool_schemas_forbid_extra_properties() {
        let schema = parameters_schema::<GetMethodBodyArgs>();
        assert!(schema.get("$schema").is_none());
        assert!(schema.get("title").is_none());
        assert_eq!(schema["additionalProperties"], json!(false));
        assert_eq!(schema["required"], json!(["filepath", "method_signature"]));
        assert_eq!(tool_definitions(SourceLanguage::Java).len(), 5);
    }
}
