//! Format-at-read: raw records to display strings.
//!
//! Pure and synchronous. The cache never stores formatted values; views
//! call [`format`] on what they read.

use std::collections::BTreeMap;

use chrono::DateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tessera_core::{DataPayload, FieldMetadata, MetadataPayload, RawRecord, RefNames, SemanticType};

/// Display label and style tag of one enum code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnumLabel {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<String>,
}

impl EnumLabel {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            style: None,
        }
    }

    pub fn styled(text: impl Into<String>, style: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            style: Some(style.into()),
        }
    }
}

/// Field name -> enum code -> label.
pub type LabelLookup = BTreeMap<String, BTreeMap<String, EnumLabel>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FormattedCell {
    pub field: String,
    pub display: String,
    pub style: Option<String>,
}

/// A record with its display cells in metadata order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FormattedRecord {
    pub raw: RawRecord,
    pub cells: Vec<FormattedCell>,
}

impl FormattedRecord {
    pub fn display(&self, field: &str) -> Option<&str> {
        self.cells
            .iter()
            .find(|cell| cell.field == field)
            .map(|cell| cell.display.as_str())
    }

    pub fn style(&self, field: &str) -> Option<&str> {
        self.cells
            .iter()
            .find(|cell| cell.field == field)
            .and_then(|cell| cell.style.as_deref())
    }
}

/// Format every record for the visible fields of `metadata`.
pub fn format(
    records: &[RawRecord],
    metadata: &MetadataPayload,
    ref_names: &RefNames,
    labels: &LabelLookup,
) -> Vec<FormattedRecord> {
    records
        .iter()
        .map(|record| format_record(record, metadata, ref_names, labels))
        .collect()
}

/// Format a cached page with its own reference names.
pub fn format_page(
    page: &DataPayload,
    metadata: &MetadataPayload,
    labels: &LabelLookup,
) -> Vec<FormattedRecord> {
    format(&page.records, metadata, &page.ref_names, labels)
}

pub fn format_record(
    record: &RawRecord,
    metadata: &MetadataPayload,
    ref_names: &RefNames,
    labels: &LabelLookup,
) -> FormattedRecord {
    let cells = metadata
        .visible_fields()
        .map(|(field, meta)| {
            let value = if field == "id" {
                Value::String(record.id.as_str().to_string())
            } else {
                record.get(field).cloned().unwrap_or(Value::Null)
            };
            format_cell(field, &value, meta, ref_names, labels)
        })
        .collect();
    FormattedRecord {
        raw: record.clone(),
        cells,
    }
}

fn format_cell(
    field: &str,
    value: &Value,
    meta: Option<&FieldMetadata>,
    ref_names: &RefNames,
    labels: &LabelLookup,
) -> FormattedCell {
    let semantic = meta.map(|m| m.semantic_type).unwrap_or_default();
    let (display, style) = match semantic {
        _ if value.is_null() => (String::new(), None),
        SemanticType::Enum => {
            let code = plain(value);
            match labels.get(field).and_then(|codes| codes.get(&code)) {
                Some(label) => (label.text.clone(), label.style.clone()),
                None => (code, None),
            }
        }
        SemanticType::Reference => {
            let table = meta
                .and_then(|m| m.lookup.as_ref())
                .map(|lookup| lookup.entity_type.as_str())
                .unwrap_or(field);
            (resolve_reference(value, table, ref_names), None)
        }
        SemanticType::Date => (format_date(value), None),
        SemanticType::DateTime => (format_date_time(value), None),
        _ => (plain(value), None),
    };
    FormattedCell {
        field: field.to_string(),
        display,
        style,
    }
}

/// Type-driven rendering shared by every semantic type.
fn plain(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(true) => "Yes".to_string(),
        Value::Bool(false) => "No".to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        Value::Array(items) => items.iter().map(plain).collect::<Vec<_>>().join(", "),
        Value::Object(_) => value.to_string(),
    }
}

fn resolve_reference(value: &Value, table: &str, ref_names: &RefNames) -> String {
    let names = ref_names.get(table);
    let name_of = |item: &Value| {
        let id = plain(item);
        names
            .and_then(|names| names.get(&id))
            .cloned()
            .unwrap_or(id)
    };
    match value {
        Value::Array(items) => items.iter().map(name_of).collect::<Vec<_>>().join(", "),
        other => name_of(other),
    }
}

fn format_date(value: &Value) -> String {
    match value {
        Value::String(s) => s.get(..10).unwrap_or(s).to_string(),
        other => plain(other),
    }
}

fn format_date_time(value: &Value) -> String {
    let Value::String(s) = value else {
        return plain(value);
    };
    if let Ok(parsed) = DateTime::parse_from_rfc3339(s) {
        return parsed.format("%Y-%m-%d %H:%M").to_string();
    }
    match (s.get(..10), s.get(11..16)) {
        (Some(date), Some(time)) => format!("{date} {time}"),
        _ => s.clone(),
    }
}
