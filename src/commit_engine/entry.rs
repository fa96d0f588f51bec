//! Materialized entries: what a `get`/`find`/`query` call actually returns.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EntryType {
    Json,
    Text,
    Directory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntryContent {
    Json(serde_json::Value),
    Text(String),
    Directory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub path: String,
    #[serde(rename = "type")]
    pub entry_type: EntryType,
    pub content: EntryContent,
    pub revision: i64,
}

impl Entry {
    pub fn directory(path: impl Into<String>, revision: i64) -> Self {
        Entry {
            path: path.into(),
            entry_type: EntryType::Directory,
            content: EntryContent::Directory,
            revision,
        }
    }

    pub fn json(path: impl Into<String>, value: serde_json::Value, revision: i64) -> Self {
        Entry {
            path: path.into(),
            entry_type: EntryType::Json,
            content: EntryContent::Json(value),
            revision,
        }
    }

    pub fn text(path: impl Into<String>, text: impl Into<String>, revision: i64) -> Self {
        Entry {
            path: path.into(),
            entry_type: EntryType::Text,
            content: EntryContent::Text(text.into()),
            revision,
        }
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match &self.content {
            EntryContent::Json(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match &self.content {
            EntryContent::Text(t) => Some(t),
            _ => None,
        }
    }
}

/// A listed entry omits `content` — used by `find`'s directory listings
/// where callers only want to know what exists, not its body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListEntry {
    pub path: String,
    #[serde(rename = "type")]
    pub entry_type: EntryType,
}

impl From<&Entry> for ListEntry {
    fn from(e: &Entry) -> Self {
        ListEntry {
            path: e.path.clone(),
            entry_type: e.entry_type,
        }
    }
}
