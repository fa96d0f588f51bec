//! Query evaluation (`QUERY_JSON_PATH` and friends) and the deep-merge used
//! by `merge`.

use serde::{Deserialize, Serialize};
use serde_json_path::JsonPath;

use crate::commit_engine::entry::{Entry, EntryContent};
use crate::errors::DogmaError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", tag = "type", content = "expressions")]
pub enum QueryType {
    Identity,
    IdentityJson,
    IdentityText,
    JsonPath(Vec<String>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Query {
    pub path: String,
    #[serde(rename = "type", flatten)]
    pub query_type: QueryType,
}

impl Query {
    pub fn identity(path: impl Into<String>) -> Self {
        Query { path: path.into(), query_type: QueryType::Identity }
    }

    pub fn of_json(path: impl Into<String>) -> Self {
        Query { path: path.into(), query_type: QueryType::IdentityJson }
    }

    pub fn of_text(path: impl Into<String>) -> Self {
        Query { path: path.into(), query_type: QueryType::IdentityText }
    }

    pub fn of_json_path(path: impl Into<String>, expressions: Vec<String>) -> Self {
        Query { path: path.into(), query_type: QueryType::JsonPath(expressions) }
    }
}

/// Applies `query.query_type` to an already-fetched `entry`, returning the
/// (possibly narrowed) resulting entry. Each JSONPath expression filters
/// the document produced by the previous one; an expression yielding no
/// match fails with `QueryExecution`.
pub fn evaluate(entry: &Entry, query_type: &QueryType) -> Result<Entry, DogmaError> {
    match query_type {
        QueryType::Identity | QueryType::IdentityJson | QueryType::IdentityText => Ok(entry.clone()),
        QueryType::JsonPath(expressions) => {
            let mut current = entry
                .as_json()
                .ok_or_else(|| DogmaError::QueryExecution(format!("{} is not a JSON entry", entry.path)))?
                .clone();
            for expr in expressions {
                let path = JsonPath::parse(expr).map_err(|e| DogmaError::QueryExecution(e.to_string()))?;
                let matches = path.query(&current).all();
                let first = matches
                    .into_iter()
                    .next()
                    .ok_or_else(|| DogmaError::QueryExecution(format!("expression {expr} matched nothing")))?;
                current = first.clone();
            }
            Ok(Entry::json(entry.path.clone(), current, entry.revision))
        }
    }
}

/// One source consulted by `merge`, in priority order (later sources win
/// conflicts with earlier ones via right-fold deep-merge).
pub struct MergeSource {
    pub path: String,
    pub optional: bool,
}

/// Right-fold deep merge of an ordered list of JSON entries: scalars in a
/// later source replace earlier ones, objects merge key-wise, arrays are
/// replaced wholesale. A type mismatch at any merged sub-path fails with
/// `QueryExecution`.
pub fn deep_merge(values: Vec<serde_json::Value>) -> Result<serde_json::Value, DogmaError> {
    let mut iter = values.into_iter();
    let mut acc = match iter.next() {
        Some(v) => v,
        None => return Ok(serde_json::Value::Null),
    };
    for next in iter {
        acc = merge_two(acc, next)?;
    }
    Ok(acc)
}

fn merge_two(lhs: serde_json::Value, rhs: serde_json::Value) -> Result<serde_json::Value, DogmaError> {
    use serde_json::Value;
    match (lhs, rhs) {
        (Value::Object(mut l), Value::Object(r)) => {
            for (k, rv) in r {
                let merged = match l.remove(&k) {
                    Some(lv) => merge_two(lv, rv)?,
                    None => rv,
                };
                l.insert(k, merged);
            }
            Ok(Value::Object(l))
        }
        (Value::Object(l), rhs) => Err(DogmaError::QueryExecution(format!(
            "type mismatch merging object {} with {rhs}",
            Value::Object(l)
        ))),
        (lhs, Value::Object(r)) => Err(DogmaError::QueryExecution(format!(
            "type mismatch merging {lhs} with object {}",
            Value::Object(r)
        ))),
        (_, rhs) => Ok(rhs),
    }
}

/// Content of an entry as a JSON value, used by `merge` to fold text/JSON
/// uniformly — merge only ever operates on JSON entries.
pub fn entry_as_merge_value(entry: &Entry) -> Result<serde_json::Value, DogmaError> {
    match &entry.content {
        EntryContent::Json(v) => Ok(v.clone()),
        _ => Err(DogmaError::QueryExecution(format!("{} is not a JSON entry", entry.path))),
    }
}
