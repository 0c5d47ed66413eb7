//! Wire record schema.
//!
//! The schema is an Avro record definition (`.avsc`) describing the field
//! order and nullability of a serialized [`PositionRecord`]. It is loaded once
//! at startup; anything other than exactly the canonical field set is
//! rejected so the publisher never starts with a mismatched layout.
//!
//! [`PositionRecord`]: crate::telemetry::PositionRecord

use crate::telemetry::{FieldName, FIELD_COUNT};
use heapless::Vec;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Schema shipped with the crate, identical to the deployed `gps.avsc`.
pub const BUILTIN_SCHEMA: &str = include_str!("../schema/gps.avsc");

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("cannot read schema {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("schema is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("schema type must be \"record\", found {0:?}")]
    NotARecord(String),
    #[error("schema field {0:?} is not part of the position record")]
    UnknownField(String),
    #[error("schema field {0} is declared more than once")]
    DuplicateField(FieldName),
    #[error("schema is missing fields: {0}")]
    MissingFields(String),
    #[error("schema field {field} has unsupported type {found}")]
    FieldType { field: FieldName, found: String },
}

/// Value branch of a nullable field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumericKind {
    Double,
    Long,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSchema {
    pub field: FieldName,
    pub null_branch: u8,
    pub value_branch: u8,
    pub kind: NumericKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordSchema {
    name: String,
    fields: Vec<FieldSchema, FIELD_COUNT>,
}

#[derive(Deserialize)]
struct RecordDef {
    #[serde(rename = "type")]
    kind: String,
    name: String,
    #[serde(default)]
    namespace: Option<String>,
    fields: std::vec::Vec<FieldDef>,
}

#[derive(Deserialize)]
struct FieldDef {
    name: String,
    #[serde(rename = "type")]
    ty: serde_json::Value,
}

impl RecordSchema {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SchemaError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| SchemaError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    pub fn builtin() -> Result<Self, SchemaError> {
        Self::parse(BUILTIN_SCHEMA)
    }

    pub fn parse(text: &str) -> Result<Self, SchemaError> {
        let def: RecordDef = serde_json::from_str(text)?;
        if def.kind != "record" {
            return Err(SchemaError::NotARecord(def.kind));
        }

        let mut fields: Vec<FieldSchema, FIELD_COUNT> = Vec::new();
        for field_def in &def.fields {
            let field = FieldName::from_name(&field_def.name)
                .ok_or_else(|| SchemaError::UnknownField(field_def.name.clone()))?;
            if fields.iter().any(|f| f.field == field) {
                return Err(SchemaError::DuplicateField(field));
            }
            let schema = parse_nullable(field, &field_def.ty)?;
            fields
                .push(schema)
                .map_err(|_| SchemaError::DuplicateField(field))?;
        }

        if fields.len() != FIELD_COUNT {
            let missing: std::vec::Vec<&str> = FieldName::ALL
                .iter()
                .filter(|name| !fields.iter().any(|f| f.field == **name))
                .map(|name| name.as_str())
                .collect();
            return Err(SchemaError::MissingFields(missing.join(", ")));
        }

        let name = match def.namespace {
            Some(ns) if !ns.is_empty() => format!("{}.{}", ns, def.name),
            _ => def.name,
        };

        Ok(Self { name, fields })
    }

    /// Fully qualified record name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fields in wire order.
    pub fn fields(&self) -> &[FieldSchema] {
        &self.fields
    }
}

fn primitive_name(value: &serde_json::Value) -> Option<&str> {
    match value {
        serde_json::Value::String(s) => Some(s.as_str()),
        serde_json::Value::Object(map) if !map.contains_key("logicalType") => {
            map.get("type").and_then(serde_json::Value::as_str)
        }
        _ => None,
    }
}

fn parse_nullable(field: FieldName, ty: &serde_json::Value) -> Result<FieldSchema, SchemaError> {
    let unsupported = || SchemaError::FieldType {
        field,
        found: ty.to_string(),
    };

    let branches = ty.as_array().ok_or_else(unsupported)?;
    if branches.len() != 2 {
        return Err(unsupported());
    }

    let mut null_branch = None;
    let mut value = None;
    for (index, branch) in branches.iter().enumerate() {
        match primitive_name(branch) {
            Some("null") => null_branch = Some(index as u8),
            Some("double") => value = Some((index as u8, NumericKind::Double)),
            // Whole epoch seconds are acceptable for the timestamp only
            Some("long") if field == FieldName::Time => value = Some((index as u8, NumericKind::Long)),
            _ => return Err(unsupported()),
        }
    }

    match (null_branch, value) {
        (Some(null_branch), Some((value_branch, kind))) => Ok(FieldSchema {
            field,
            null_branch,
            value_branch,
            kind,
        }),
        _ => Err(unsupported()),
    }
}
