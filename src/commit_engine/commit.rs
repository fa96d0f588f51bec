//! Commit metadata types, mirroring the field/variant names a client SDK
//! already expects on the wire.

use serde::{Deserialize, Serialize};

use crate::commit_engine::change::Change;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Author {
    pub name: String,
    pub email: String,
}

impl Author {
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Author { name: name.into(), email: email.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(tag = "markup", content = "detail")]
pub enum CommitDetail {
    Markdown(String),
    Plaintext(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitMessage {
    pub summary: String,
    #[serde(flatten, skip_serializing_if = "Option::is_none")]
    pub detail: Option<CommitDetail>,
}

impl CommitMessage {
    pub fn summary_only(summary: impl Into<String>) -> Self {
        CommitMessage { summary: summary.into(), detail: None }
    }

    pub fn detail_text(&self) -> &str {
        match &self.detail {
            Some(CommitDetail::Markdown(s)) | Some(CommitDetail::Plaintext(s)) => s,
            None => "",
        }
    }
}

/// A fully materialized commit: the metadata the revision log stores, plus
/// the ordered changes that produced it. `changes` reflects any
/// normalization the push pipeline performed (e.g. `UpsertJson` rewritten
/// to `ApplyJsonPatch`), per the "normalization is observable" invariant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Commit {
    pub revision: i64,
    pub author: Author,
    pub commit_message: CommitMessage,
    pub changes: Vec<Change>,
    pub timestamp_millis: i64,
}

/// Result of a `push`/`transform` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushResult {
    pub revision: i64,
    pub timestamp_millis: i64,
}
