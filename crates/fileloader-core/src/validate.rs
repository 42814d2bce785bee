//! Row validation
//!
//! The validator is pure and stateless: rename source aliases to canonical
//! field names, drop unknown fields, coerce each value to its declared type,
//! then enforce field constraints. It is the only place user-declared
//! constraints are enforced. A record either comes out fully typed or as an
//! ordered list of per-field errors destined for the dead-letter queue.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde_json::json;

use crate::readers::{RawCell, RawRecord};
use crate::sources::{Constraint, FieldSpec, FieldValue, RowModel, SemanticType};

/// One per-field validation failure.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationError {
    /// Source-file column name (alias), as the file's owner knows it.
    pub column_name: String,
    /// String form of the offending value.
    pub column_value: String,
    /// Stable machine classification, e.g. `int_parsing`.
    pub error_type: String,
    /// Lowercased human-readable message.
    pub error_msg: String,
}

impl ValidationError {
    fn new(
        column_name: &str,
        column_value: String,
        error_type: &str,
        error_msg: String,
    ) -> Self {
        Self {
            column_name: column_name.to_string(),
            column_value,
            error_type: error_type.to_string(),
            error_msg: error_msg.to_lowercase(),
        }
    }

    pub fn as_json(&self) -> serde_json::Value {
        json!({
            "column_name": self.column_name,
            "column_value": self.column_value,
            "error_type": self.error_type,
            "error_msg": self.error_msg,
        })
    }
}

/// A validated record, keyed by canonical field names.
#[derive(Debug, Clone)]
pub struct TypedRecord {
    pub values: Vec<(String, FieldValue)>,
}

impl TypedRecord {
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.values
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, value)| value)
    }
}

/// Validate one raw record against a row model.
pub fn validate_record(
    model: &RowModel,
    record: &RawRecord,
) -> Result<TypedRecord, Vec<ValidationError>> {
    let mut values = Vec::with_capacity(model.fields.len());
    let mut errors = Vec::new();

    for spec in &model.fields {
        let alias = spec.source_alias();
        let cell = record.fields.get(&alias.to_lowercase());

        match coerce(spec, cell) {
            Ok(value) => {
                if let Some(error) = check_constraints(spec, &value) {
                    errors.push(error);
                } else {
                    values.push((spec.name.clone(), value));
                }
            },
            Err(error) => errors.push(error),
        }
    }

    if errors.is_empty() {
        Ok(TypedRecord { values })
    } else {
        Err(errors)
    }
}

/// Dead-letter payload: the subset of the raw record containing grain fields
/// plus the fields that errored, keyed by source alias.
pub fn dlq_payload(
    model: &RowModel,
    grain: &[String],
    record: &RawRecord,
    errors: &[ValidationError],
) -> serde_json::Value {
    let mut keep: Vec<&str> = grain.iter().map(|g| model.alias_of(g)).collect();
    keep.extend(errors.iter().map(|e| e.column_name.as_str()));

    let mut map = serde_json::Map::new();
    for alias in keep {
        let lowered = alias.to_lowercase();
        if map.contains_key(&lowered) {
            continue;
        }
        if let Some(cell) = record.fields.get(&lowered) {
            map.insert(lowered, json!(cell.display_text()));
        }
    }
    serde_json::Value::Object(map)
}

fn coerce(spec: &FieldSpec, cell: Option<&RawCell>) -> Result<FieldValue, ValidationError> {
    let alias = spec.source_alias();

    // Absent cells and empty text for non-text fields count as missing.
    let missing = match cell {
        None => true,
        Some(RawCell::Null) => true,
        Some(RawCell::Text(s)) => {
            s.trim().is_empty() && spec.semantic_type != SemanticType::Text
        },
        _ => false,
    };

    if missing {
        return if spec.required {
            Err(ValidationError::new(
                alias,
                String::new(),
                "missing",
                "field required".to_string(),
            ))
        } else {
            Ok(FieldValue::Null)
        };
    }

    let cell = cell.unwrap_or(&RawCell::Null);
    match spec.semantic_type {
        SemanticType::Integer => coerce_integer(alias, cell),
        SemanticType::Float => coerce_float(alias, cell),
        SemanticType::Boolean => coerce_boolean(alias, cell),
        SemanticType::Date => coerce_date(alias, cell),
        SemanticType::DateTime => coerce_datetime(alias, cell),
        SemanticType::Text => Ok(FieldValue::Text(cell.display_text())),
    }
}

fn coerce_integer(alias: &str, cell: &RawCell) -> Result<FieldValue, ValidationError> {
    let fail = |value: String| {
        ValidationError::new(
            alias,
            value,
            "int_parsing",
            "input should be a valid integer".to_string(),
        )
    };
    match cell {
        RawCell::Int(i) => Ok(FieldValue::Int(*i)),
        RawCell::Float(f) if f.fract() == 0.0 => Ok(FieldValue::Int(*f as i64)),
        RawCell::Text(s) => s
            .trim()
            .parse::<i64>()
            .map(FieldValue::Int)
            .map_err(|_| fail(s.clone())),
        other => Err(fail(other.display_text())),
    }
}

fn coerce_float(alias: &str, cell: &RawCell) -> Result<FieldValue, ValidationError> {
    let fail = |value: String| {
        ValidationError::new(
            alias,
            value,
            "float_parsing",
            "input should be a valid number".to_string(),
        )
    };
    match cell {
        RawCell::Float(f) => Ok(FieldValue::Float(*f)),
        RawCell::Int(i) => Ok(FieldValue::Float(*i as f64)),
        RawCell::Text(s) => s
            .trim()
            .parse::<f64>()
            .map(FieldValue::Float)
            .map_err(|_| fail(s.clone())),
        other => Err(fail(other.display_text())),
    }
}

fn coerce_boolean(alias: &str, cell: &RawCell) -> Result<FieldValue, ValidationError> {
    let fail = |value: String| {
        ValidationError::new(
            alias,
            value,
            "bool_parsing",
            "input should be a valid boolean".to_string(),
        )
    };
    match cell {
        RawCell::Bool(b) => Ok(FieldValue::Bool(*b)),
        RawCell::Int(0) => Ok(FieldValue::Bool(false)),
        RawCell::Int(1) => Ok(FieldValue::Bool(true)),
        RawCell::Text(s) => match s.trim().to_lowercase().as_str() {
            "true" | "t" | "yes" | "y" | "1" => Ok(FieldValue::Bool(true)),
            "false" | "f" | "no" | "n" | "0" => Ok(FieldValue::Bool(false)),
            _ => Err(fail(s.clone())),
        },
        other => Err(fail(other.display_text())),
    }
}

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y"];

fn coerce_date(alias: &str, cell: &RawCell) -> Result<FieldValue, ValidationError> {
    let fail = |value: String| {
        ValidationError::new(
            alias,
            value,
            "date_parsing",
            "input should be a valid date".to_string(),
        )
    };
    match cell {
        RawCell::DateTime(dt) => Ok(FieldValue::Date(dt.date())),
        RawCell::Text(s) => {
            let trimmed = s.trim();
            DATE_FORMATS
                .iter()
                .find_map(|fmt| NaiveDate::parse_from_str(trimmed, fmt).ok())
                .map(FieldValue::Date)
                .ok_or_else(|| fail(s.clone()))
        },
        other => Err(fail(other.display_text())),
    }
}

fn coerce_datetime(alias: &str, cell: &RawCell) -> Result<FieldValue, ValidationError> {
    let fail = |value: String| {
        ValidationError::new(
            alias,
            value,
            "datetime_parsing",
            "input should be a valid datetime".to_string(),
        )
    };
    match cell {
        RawCell::DateTime(naive) => Ok(FieldValue::DateTime(Utc.from_utc_datetime(naive))),
        RawCell::Text(s) => {
            let trimmed = s.trim();
            if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
                return Ok(FieldValue::DateTime(dt.with_timezone(&Utc)));
            }
            if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S") {
                return Ok(FieldValue::DateTime(Utc.from_utc_datetime(&naive)));
            }
            if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S") {
                return Ok(FieldValue::DateTime(Utc.from_utc_datetime(&naive)));
            }
            if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
                let midnight = date.and_hms_opt(0, 0, 0).unwrap_or_default();
                return Ok(FieldValue::DateTime(Utc.from_utc_datetime(&midnight)));
            }
            Err(fail(s.clone()))
        },
        other => Err(fail(other.display_text())),
    }
}

fn check_constraints(spec: &FieldSpec, value: &FieldValue) -> Option<ValidationError> {
    if value.is_null() {
        return None;
    }
    let alias = spec.source_alias();

    for constraint in &spec.constraints {
        match constraint {
            Constraint::MaxLength(max) => {
                if let FieldValue::Text(s) = value {
                    if s.chars().count() > *max {
                        return Some(ValidationError::new(
                            alias,
                            s.clone(),
                            "max_length",
                            format!("value exceeds maximum length of {max}"),
                        ));
                    }
                }
            },
            Constraint::MinLength(min) => {
                if let FieldValue::Text(s) = value {
                    if s.chars().count() < *min {
                        return Some(ValidationError::new(
                            alias,
                            s.clone(),
                            "min_length",
                            format!("value is shorter than minimum length of {min}"),
                        ));
                    }
                }
            },
            Constraint::Range { min, max } => {
                let numeric = match value {
                    FieldValue::Int(i) => Some(*i as f64),
                    FieldValue::Float(f) => Some(*f),
                    _ => None,
                };
                if let Some(n) = numeric {
                    if min.is_some_and(|m| n < m) || max.is_some_and(|m| n > m) {
                        return Some(ValidationError::new(
                            alias,
                            value.canonical_text(),
                            "range",
                            format!(
                                "value outside allowed range [{}, {}]",
                                min.map_or("-inf".to_string(), |m| m.to_string()),
                                max.map_or("inf".to_string(), |m| m.to_string()),
                            ),
                        ));
                    }
                }
            },
            Constraint::OneOf(allowed) => {
                let text = value.canonical_text();
                if !allowed.iter().any(|a| a.eq_ignore_ascii_case(&text)) {
                    return Some(ValidationError::new(
                        alias,
                        text,
                        "enum",
                        format!("value is not one of: {}", allowed.join(", ")),
                    ));
                }
            },
            Constraint::Custom { name, check } => {
                if !check(value) {
                    return Some(ValidationError::new(
                        alias,
                        value.canonical_text(),
                        "custom",
                        format!("failed check '{name}'"),
                    ));
                }
            },
        }
    }

    None
}
