//! Declarative row models
//!
//! A `RowModel` describes the logical shape of one source's records: field
//! names, semantic types, optionality, source-column aliases, and field-level
//! constraints. The same model drives in-memory validation, target-table DDL,
//! and alias-to-canonical renaming.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Semantic type of a field, independent of any SQL dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SemanticType {
    Integer,
    Float,
    Boolean,
    Date,
    #[serde(rename = "datetime")]
    DateTime,
    Text,
}

/// A typed, validated field value.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Null,
    Int(i64),
    Float(f64),
    Bool(bool),
    Date(NaiveDate),
    DateTime(DateTime<Utc>),
    Text(String),
}

impl FieldValue {
    /// Canonical textual form, used for row digests and DLQ payloads.
    /// `Null` renders as the empty string.
    pub fn canonical_text(&self) -> String {
        match self {
            FieldValue::Null => String::new(),
            FieldValue::Int(v) => v.to_string(),
            FieldValue::Float(v) => v.to_string(),
            FieldValue::Bool(v) => v.to_string(),
            FieldValue::Date(v) => v.format("%Y-%m-%d").to_string(),
            FieldValue::DateTime(v) => v.to_rfc3339(),
            FieldValue::Text(v) => v.clone(),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }
}

/// Field-level constraint, enforced by the row validator after coercion.
///
/// All variants except `Custom` are serde-loadable; custom predicates can
/// only be attached by sources defined in code.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Constraint {
    MaxLength(usize),
    MinLength(usize),
    Range { min: Option<f64>, max: Option<f64> },
    OneOf(Vec<String>),
    #[serde(skip)]
    Custom {
        name: &'static str,
        check: fn(&FieldValue) -> bool,
    },
}

// `Constraint::Custom` carries a `&'static str` field, which a derived
// `Deserialize` impl cannot currently type-check when the enum is embedded in
// another `Deserialize` type (serde_derive infers a `'de: 'static` bound even
// though the variant is `#[serde(skip)]`d). Deserializing through a shadow
// enum that omits the unreachable variant sidesteps that without changing
// the wire format.
#[derive(Deserialize)]
#[serde(rename_all = "snake_case")]
enum ConstraintWire {
    MaxLength(usize),
    MinLength(usize),
    Range { min: Option<f64>, max: Option<f64> },
    OneOf(Vec<String>),
}

impl From<ConstraintWire> for Constraint {
    fn from(wire: ConstraintWire) -> Self {
        match wire {
            ConstraintWire::MaxLength(n) => Constraint::MaxLength(n),
            ConstraintWire::MinLength(n) => Constraint::MinLength(n),
            ConstraintWire::Range { min, max } => Constraint::Range { min, max },
            ConstraintWire::OneOf(values) => Constraint::OneOf(values),
        }
    }
}

impl<'de> Deserialize<'de> for Constraint {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        ConstraintWire::deserialize(deserializer).map(Constraint::from)
    }
}

/// One field of a row model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSpec {
    /// Canonical field name; doubles as the target-table column name.
    pub name: String,
    #[serde(rename = "type")]
    pub semantic_type: SemanticType,
    #[serde(default = "default_required")]
    pub required: bool,
    /// Column name in the source file, when it differs from `name`.
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default)]
    pub constraints: Vec<Constraint>,
}

fn default_required() -> bool {
    true
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, semantic_type: SemanticType) -> Self {
        Self {
            name: name.into(),
            semantic_type,
            required: true,
            alias: None,
            constraints: Vec::new(),
        }
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn with_constraint(mut self, constraint: Constraint) -> Self {
        self.constraints.push(constraint);
        self
    }

    /// Source-file column name: the alias if declared, the field name otherwise.
    pub fn source_alias(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }
}

/// Ordered collection of field specs forming one source's record shape.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RowModel {
    pub fields: Vec<FieldSpec>,
}

impl RowModel {
    pub fn new(fields: Vec<FieldSpec>) -> Self {
        Self { fields }
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }

    /// Lowercased source alias -> canonical field name.
    pub fn alias_map(&self) -> HashMap<String, String> {
        self.fields
            .iter()
            .map(|f| (f.source_alias().to_lowercase(), f.name.clone()))
            .collect()
    }

    /// Lowercased aliases of required fields; these must all be present in a
    /// file header for the file to be processable.
    pub fn required_aliases(&self) -> BTreeSet<String> {
        self.fields
            .iter()
            .filter(|f| f.required)
            .map(|f| f.source_alias().to_lowercase())
            .collect()
    }

    /// Source alias for a canonical field name (falls back to the name itself).
    pub fn alias_of<'a>(&'a self, field_name: &'a str) -> &'a str {
        self.field(field_name)
            .map(|f| f.source_alias())
            .unwrap_or(field_name)
    }

    /// Two models are compatible when they declare identical column sets and
    /// types. Sources sharing a target table must be compatible.
    pub fn compatible_with(&self, other: &RowModel) -> bool {
        if self.fields.len() != other.fields.len() {
            return false;
        }
        self.fields.iter().all(|f| {
            other
                .field(&f.name)
                .is_some_and(|o| o.semantic_type == f.semantic_type && o.required == f.required)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn widget_model() -> RowModel {
        RowModel::new(vec![
            FieldSpec::new("id", SemanticType::Integer),
            FieldSpec::new("name", SemanticType::Text).with_alias("Widget Name"),
            FieldSpec::new("notes", SemanticType::Text).optional(),
        ])
    }

    #[test]
    fn alias_map_is_lowercased() {
        let model = widget_model();
        let map = model.alias_map();
        assert_eq!(map.get("widget name").map(String::as_str), Some("name"));
        assert_eq!(map.get("id").map(String::as_str), Some("id"));
    }

    #[test]
    fn required_aliases_exclude_optional_fields() {
        let model = widget_model();
        let required = model.required_aliases();
        assert!(required.contains("id"));
        assert!(required.contains("widget name"));
        assert!(!required.contains("notes"));
    }

    #[test]
    fn compatibility_ignores_aliases_but_not_types() {
        let a = widget_model();
        let mut b = widget_model();
        b.fields[1].alias = None;
        assert!(a.compatible_with(&b));

        b.fields[0].semantic_type = SemanticType::Text;
        assert!(!a.compatible_with(&b));
    }

    #[test]
    fn canonical_text_renders_null_as_empty() {
        assert_eq!(FieldValue::Null.canonical_text(), "");
        assert_eq!(FieldValue::Int(42).canonical_text(), "42");
        assert_eq!(
            FieldValue::Date(NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()).canonical_text(),
            "2024-03-01"
        );
    }
}
