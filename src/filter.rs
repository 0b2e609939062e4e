use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::Record;

/// Comparison operator of a filter. Values compare lexicographically on
/// their string form.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Predicate {
    #[default]
    #[serde(rename = "$eq", alias = "eq")]
    Eq,
    #[serde(rename = "$ne", alias = "ne")]
    Ne,
    #[serde(rename = "$lt", alias = "lt")]
    Lt,
    #[serde(rename = "$lte", alias = "lte")]
    Lte,
    #[serde(rename = "$gt", alias = "gt")]
    Gt,
    #[serde(rename = "$gte", alias = "gte")]
    Gte,
}

impl Predicate {
    fn accepts(&self, ord: Ordering) -> bool {
        match self {
            Predicate::Eq => ord == Ordering::Equal,
            Predicate::Ne => ord != Ordering::Equal,
            Predicate::Lt => ord == Ordering::Less,
            Predicate::Lte => ord != Ordering::Greater,
            Predicate::Gt => ord == Ordering::Greater,
            Predicate::Gte => ord != Ordering::Less,
        }
    }
}

/// Single-field condition. An empty filter matches everything; a field
/// without a value matches records where the field exists.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Filter {
    #[serde(default)]
    pub field: Option<String>,
    #[serde(default)]
    pub predicate: Option<Predicate>,
    #[serde(default)]
    pub value: Option<Value>,
}

impl Filter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn new(field: impl Into<String>, predicate: Predicate, value: impl Into<Value>) -> Self {
        Self {
            field: Some(field.into()),
            predicate: Some(predicate),
            value: Some(value.into()),
        }
    }

    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, Predicate::Eq, value)
    }

    pub fn matches(&self, record: &Record) -> bool {
        let Some(field) = self.field.as_deref() else {
            return true;
        };
        let Some(actual) = resolve(record, field) else {
            return false;
        };
        match &self.value {
            Some(expected) => {
                let ord = actual.as_str().cmp(string_form(expected).as_str());
                self.predicate.unwrap_or_default().accepts(ord)
            }
            None => true,
        }
    }
}

/// Find parameters: a filter plus a result cap (`-1` or absent = unbounded).
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Query {
    #[serde(default)]
    pub filter: Filter,
    #[serde(default)]
    pub limit: Option<i64>,
}

impl Query {
    pub fn new(filter: Filter) -> Self {
        Self { filter, limit: None }
    }

    pub fn with_limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Cap as a length, `None` when unbounded.
    pub fn cap(&self) -> Option<usize> {
        self.limit.and_then(|limit| usize::try_from(limit).ok())
    }

    pub fn truncate(&self, records: &mut Vec<Record>) {
        if let Some(cap) = self.cap() {
            records.truncate(cap);
        }
    }
}

/// `id`/`_id` and `name` address record metadata, `doc.` forces a document
/// lookup, and dots descend into nested objects.
fn resolve(record: &Record, field: &str) -> Option<String> {
    match field {
        "id" | "_id" => return Some(record.id.to_string()),
        "name" => return Some(record.name.clone()),
        _ => {}
    }
    let path = field.strip_prefix("doc.").unwrap_or(field);
    let mut parts = path.split('.');
    let mut current = record.doc.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(string_form(current))
}

fn string_form(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
