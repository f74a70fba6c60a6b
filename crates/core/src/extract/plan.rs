//! # Plan Records
//!
//! Typed view of a generation payload. `fileList` is always derived from the
//! keys of `generatedFiles`, so the two describe the same set and
//! `fileCount == fileList.len()`. Disagreements in the model's own `files` /
//! `filesCount` fields are logged and kept visible in `unresolvedPaths`; no
//! generated file is ever dropped to make the record consistent.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{extract_json, extract_message, salvage_generated_files};

const REPLICATION_KEYS: &[&str] = &[
    "replicationSpecs",
    "visualAnalysis",
    "cloneStrategy",
    "replicationDetails",
    "visualReplication",
];

/// Clone/replication notes attached to a plan, tagged with the key they came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationStrategy {
    pub kind: String,
    pub details: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanRecord {
    pub title: Option<String>,
    pub narrative_steps: Vec<String>,
    /// path -> file content
    pub generated_files: BTreeMap<String, String>,
    pub file_list: Vec<String>,
    pub file_count: usize,
    pub frontend_files: Vec<String>,
    pub backend_routes: Vec<Value>,
    pub brand_kit: Option<Value>,
    pub replication_strategy: Option<ReplicationStrategy>,
    pub url: Option<String>,
    /// Paths the model listed in `files` without providing content
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unresolved_paths: Vec<String>,
    pub message: Option<String>,
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::String(s)) => vec![s.clone()],
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// Frontend file entries may be plain paths or `{name|path|filename}` objects.
fn file_name(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Object(obj) => ["name", "path", "filename"]
            .iter()
            .find_map(|k| obj.get(*k).and_then(Value::as_str))
            .map(str::to_string)
            .unwrap_or_else(|| value.to_string()),
        other => other.to_string(),
    }
}

fn file_content(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Object(obj) => match obj.get("code") {
            Some(Value::String(code)) => code.clone(),
            Some(other) => other.to_string(),
            None => value.to_string(),
        },
        other => other.to_string(),
    }
}

fn non_empty_str(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

impl PlanRecord {
    /// Build from an extracted JSON value.
    pub fn from_value(value: &Value) -> Self {
        let empty = Map::new();
        let obj = value.as_object().unwrap_or(&empty);

        let generated_files: BTreeMap<String, String> = obj
            .get("generatedFiles")
            .and_then(Value::as_object)
            .map(|files| {
                files
                    .iter()
                    .map(|(path, entry)| (path.clone(), file_content(entry)))
                    .collect()
            })
            .unwrap_or_default();

        let declared = string_list(obj.get("files"));
        let declared_count = obj.get("filesCount").and_then(Value::as_u64);

        let steps = obj.get("Steps").or_else(|| obj.get("steps"));

        let mut record = Self {
            title: non_empty_str(obj.get("title")),
            narrative_steps: string_list(steps),
            generated_files,
            frontend_files: obj
                .get("frontendFiles")
                .and_then(Value::as_array)
                .map(|files| files.iter().map(file_name).collect())
                .unwrap_or_default(),
            backend_routes: obj
                .get("backendRoutes")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default(),
            brand_kit: obj.get("brandKit").filter(|v| !v.is_null()).cloned(),
            replication_strategy: REPLICATION_KEYS.iter().find_map(|key| {
                obj.get(*key).filter(|v| !v.is_null()).map(|details| ReplicationStrategy {
                    kind: key.to_string(),
                    details: details.clone(),
                })
            }),
            url: non_empty_str(obj.get("url")),
            message: non_empty_str(obj.get("message")),
            ..Default::default()
        };
        record.reconcile(&declared, declared_count);
        record
    }

    /// Extract a plan from raw generation output.
    ///
    /// Falls back to salvaging just the `generatedFiles` object when the text as
    /// a whole does not parse. Returns `None` when neither yields files or steps.
    pub fn from_model_output(raw: &str) -> Option<Self> {
        let extraction = extract_json(raw, "generation output");
        if !extraction.is_fallback() {
            let record = Self::from_value(&extraction.value);
            if !record.generated_files.is_empty() || !record.narrative_steps.is_empty() {
                return Some(record);
            }
        }

        let files = salvage_generated_files(raw)?;
        tracing::warn!("Recovered {} generated files from unparsable output", files.len());
        let mut value = Map::new();
        value.insert("generatedFiles".to_string(), Value::Object(files));
        let mut record = Self::from_value(&Value::Object(value));
        record.message = extract_message(raw);
        Some(record)
    }

    /// Derive `file_list`/`file_count` from `generated_files` and log how the
    /// model's own bookkeeping disagrees with it.
    fn reconcile(&mut self, declared: &[String], declared_count: Option<u64>) {
        let keys: BTreeSet<&String> = self.generated_files.keys().collect();

        let mut file_list: Vec<String> = Vec::with_capacity(keys.len());
        let mut seen = BTreeSet::new();
        for path in declared {
            if keys.contains(path) {
                if seen.insert(path.clone()) {
                    file_list.push(path.clone());
                }
            } else if !self.unresolved_paths.contains(path) {
                self.unresolved_paths.push(path.clone());
            }
        }
        let undeclared: Vec<String> = keys
            .iter()
            .filter(|k| !seen.contains(k.as_str()))
            .map(|k| k.to_string())
            .collect();

        if !self.unresolved_paths.is_empty() {
            tracing::warn!(
                "Plan lists {} file(s) without content: {:?}",
                self.unresolved_paths.len(),
                self.unresolved_paths
            );
        }
        if !declared.is_empty() && !undeclared.is_empty() {
            tracing::warn!(
                "Plan has {} generated file(s) missing from its files list: {:?}",
                undeclared.len(),
                undeclared
            );
        }
        file_list.extend(undeclared);

        if let Some(count) = declared_count {
            if count as usize != file_list.len() {
                tracing::warn!(
                    "Plan filesCount is {} but {} file(s) were generated",
                    count,
                    file_list.len()
                );
            }
        }

        self.file_count = file_list.len();
        self.file_list = file_list;
    }

    /// `fileList` and the `generatedFiles` keys are the same set and the count matches.
    pub fn is_consistent(&self) -> bool {
        let listed: BTreeSet<&String> = self.file_list.iter().collect();
        let generated: BTreeSet<&String> = self.generated_files.keys().collect();
        listed == generated
            && self.file_list.len() == listed.len()
            && self.file_count == self.file_list.len()
    }

    /// Whether the model's output had to be reconciled.
    pub fn has_unresolved_paths(&self) -> bool {
        !self.unresolved_paths.is_empty()
    }
}
