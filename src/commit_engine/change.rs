//! Pending change operations and their application against a JSON/text
//! value, ahead of being folded into a new root tree by the commit engine.

use serde::{Deserialize, Serialize};

use crate::errors::DogmaError;

/// Typed content of a [`Change`]. Field/variant names mirror the values the
/// client SDK already serializes over the wire, so a server built against
/// this type speaks the same JSON shape a `line-centraldogma-rs`-style
/// client sends.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(tag = "type", content = "content")]
pub enum ChangeContent {
    UpsertJson(serde_json::Value),
    UpsertText(String),
    Remove,
    Rename(String),
    ApplyJsonPatch(serde_json::Value),
    ApplyTextPatch(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Change {
    pub path: String,
    #[serde(flatten)]
    pub content: ChangeContent,
}

impl Change {
    pub fn upsert_json(path: impl Into<String>, value: serde_json::Value) -> Self {
        Change { path: path.into(), content: ChangeContent::UpsertJson(value) }
    }

    pub fn upsert_text(path: impl Into<String>, text: impl Into<String>) -> Self {
        Change { path: path.into(), content: ChangeContent::UpsertText(text.into()) }
    }

    pub fn remove(path: impl Into<String>) -> Self {
        Change { path: path.into(), content: ChangeContent::Remove }
    }

    pub fn rename(path: impl Into<String>, new_path: impl Into<String>) -> Self {
        Change { path: path.into(), content: ChangeContent::Rename(new_path.into()) }
    }
}

/// Applies an RFC-6902 JSON patch document, plus the store's `safeReplace`
/// extension op: `{"op":"safeReplace","path":...,"oldValue":...,"value":...}`
/// which fails with [`DogmaError::ChangeConflict`] if the current value at
/// `path` does not deep-equal `oldValue`. Standard ops are delegated to the
/// `json-patch` crate; `safeReplace` entries are peeled off first since
/// `json_patch::Patch` has no such op.
pub fn apply_json_patch(current: &serde_json::Value, patch_doc: &serde_json::Value) -> Result<serde_json::Value, DogmaError> {
    let ops = patch_doc
        .as_array()
        .ok_or_else(|| DogmaError::ChangeFormat("JSON patch must be an array of operations".into()))?;

    let mut doc = current.clone();
    for op in ops {
        let op_name = op
            .get("op")
            .and_then(|v| v.as_str())
            .ok_or_else(|| DogmaError::ChangeFormat("patch operation missing \"op\"".into()))?;

        if op_name == "safeReplace" {
            let path = op
                .get("path")
                .and_then(|v| v.as_str())
                .ok_or_else(|| DogmaError::ChangeFormat("safeReplace missing \"path\"".into()))?;
            let old_value = op.get("oldValue").cloned().unwrap_or(serde_json::Value::Null);
            let new_value = op
                .get("value")
                .cloned()
                .ok_or_else(|| DogmaError::ChangeFormat("safeReplace missing \"value\"".into()))?;

            let pointer = json_pointer_path(path);
            let existing = doc.pointer(&pointer).cloned().unwrap_or(serde_json::Value::Null);
            if existing != old_value {
                return Err(DogmaError::ChangeConflict(format!(
                    "safeReplace at {path}: current value does not match oldValue"
                )));
            }
            set_at_pointer(&mut doc, &pointer, new_value)?;
            continue;
        }

        let single = json_patch::Patch(vec![
            serde_json::from_value(op.clone()).map_err(|e| DogmaError::ChangeFormat(e.to_string()))?
        ]);
        json_patch::patch(&mut doc, &single).map_err(|e| DogmaError::ChangeConflict(e.to_string()))?;
    }
    Ok(doc)
}

/// Computes the minimal RFC-6902 patch turning `from` into `to`.
pub fn diff_json_patch(from: &serde_json::Value, to: &serde_json::Value) -> serde_json::Value {
    let patch = json_patch::diff(from, to);
    serde_json::to_value(patch).expect("json_patch::Patch always serializes")
}

fn json_pointer_path(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}

fn set_at_pointer(doc: &mut serde_json::Value, pointer: &str, value: serde_json::Value) -> Result<(), DogmaError> {
    if pointer.is_empty() || pointer == "/" {
        *doc = value;
        return Ok(());
    }
    let segments: Vec<&str> = pointer.trim_start_matches('/').split('/').collect();
    let (last, parents) = segments.split_last().expect("non-empty pointer");
    let mut node = doc;
    for seg in parents {
        node = node
            .get_mut(unescape_pointer_segment(seg))
            .ok_or_else(|| DogmaError::ChangeConflict(format!("path segment {seg} does not exist")))?;
    }
    match node {
        serde_json::Value::Object(map) => {
            map.insert(unescape_pointer_segment(last), value);
        }
        serde_json::Value::Array(arr) => {
            let idx: usize = last
                .parse()
                .map_err(|_| DogmaError::ChangeFormat(format!("invalid array index {last}")))?;
            if idx >= arr.len() {
                return Err(DogmaError::ChangeConflict(format!("array index {idx} out of bounds")));
            }
            arr[idx] = value;
        }
        _ => return Err(DogmaError::ChangeFormat("cannot index into a scalar".into())),
    }
    Ok(())
}

fn unescape_pointer_segment(seg: &str) -> String {
    seg.replace("~1", "/").replace("~0", "~")
}
