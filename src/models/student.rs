// src/models/student.rs

//! Student records and the listing payload they arrive in.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::FetchError;

/// One student as reported by the listing endpoint.
///
/// School name and id are not part of the record; they come from the
/// target being harvested and are attached when the page is persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudentRecord {
    /// Matriculation identifier (primary key in the snapshot table)
    pub matriculation_id: String,

    /// Student display name
    pub name: String,

    /// Class/section label
    pub class: String,

    /// Shift label (morning, afternoon, ...)
    pub shift: String,

    /// Birth date exactly as the portal formats it
    pub birth_date: String,
}

impl StudentRecord {
    /// Build a record from one element of the listing `data` array.
    ///
    /// Each field takes the first non-empty value among its upstream keys;
    /// anything missing, null or non-scalar becomes an empty string.
    pub fn from_value(value: &Value) -> Self {
        let Some(obj) = value.as_object() else {
            return Self::default();
        };

        Self {
            matriculation_id: first_text(obj, &["matricula", "id"]),
            name: first_text(obj, &["nome"]),
            class: first_text(obj, &["turmaNome", "turma"]),
            shift: first_text(obj, &["turnoNome", "turno"]),
            birth_date: first_text(obj, &["dataNascimento"]),
        }
    }

    /// Whether the record can be keyed in the snapshot table.
    pub fn has_key(&self) -> bool {
        !self.matriculation_id.is_empty()
    }
}

fn first_text(obj: &Map<String, Value>, keys: &[&str]) -> String {
    keys.iter()
        .filter_map(|key| obj.get(*key))
        .map(scalar_text)
        .find(|text| !text.is_empty())
        .unwrap_or_default()
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => String::new(),
    }
}

/// Top-level body of a listing response.
#[derive(Debug, Deserialize)]
pub struct ListingPayload {
    #[serde(default)]
    data: Option<ListingData>,
}

/// The two shapes the `data` field is known to take.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ListingData {
    /// `{"data": [...]}`
    Flat(Vec<Value>),
    /// `{"data": {"data": [...], ...paging metadata}}`
    Nested(NestedPage),
}

/// Paged wrapper around the nested list.
#[derive(Debug, Deserialize)]
pub struct NestedPage {
    #[serde(default)]
    data: Option<Vec<Value>>,
}

impl ListingPayload {
    /// Decode a response body.
    pub fn from_json(body: &str) -> std::result::Result<Self, FetchError> {
        serde_json::from_str(body).map_err(|e| FetchError::Decode(e.to_string()))
    }

    /// Flatten either shape into records. A missing list is an empty page.
    pub fn into_records(self) -> Vec<StudentRecord> {
        let items = match self.data {
            Some(ListingData::Flat(items)) => items,
            Some(ListingData::Nested(page)) => page.data.unwrap_or_default(),
            None => Vec::new(),
        };

        items.iter().map(StudentRecord::from_value).collect()
    }
}
