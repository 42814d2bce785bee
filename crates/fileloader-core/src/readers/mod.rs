//! File readers
//!
//! Each reader streams one file as a lazy sequence of `(row_number, field
//! map)` pairs. Readers are single-pass and not restartable; the underlying
//! handles close when the reader is dropped, so every exit path releases
//! them.

pub mod delimited;
pub mod factory;
pub mod json;
pub mod spreadsheet;

use std::collections::{BTreeSet, HashMap};

use chrono::NaiveDateTime;
use fileloader_common::LoadError;

pub use factory::{extension_of, open_reader, supported_path, SUPPORTED_EXTENSIONS};

/// A raw cell as read from the file, before validation. Delimited text only
/// ever produces `Text`; spreadsheets and JSON carry their native types
/// through so the validator can coerce without round-tripping strings.
#[derive(Debug, Clone, PartialEq)]
pub enum RawCell {
    Null,
    Text(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    DateTime(NaiveDateTime),
}

impl RawCell {
    /// String form used in dead-letter payloads and error messages.
    pub fn display_text(&self) -> String {
        match self {
            RawCell::Null => String::new(),
            RawCell::Text(s) => s.clone(),
            RawCell::Int(v) => v.to_string(),
            RawCell::Float(v) => v.to_string(),
            RawCell::Bool(v) => v.to_string(),
            RawCell::DateTime(v) => v.format("%Y-%m-%dT%H:%M:%S").to_string(),
        }
    }
}

/// One logical row read from the file. Keys are lowercased source aliases.
#[derive(Debug, Clone)]
pub struct RawRecord {
    /// 1-based index after skip_rows and header.
    pub row_number: i64,
    pub fields: HashMap<String, RawCell>,
}

/// Item produced by a reader: either a parsed record or a structural defect
/// (surplus fields, non-object JSON item) the validator never sees. Defects
/// are dead-lettered like validation failures.
#[derive(Debug, Clone)]
pub enum RawRow {
    Record(RawRecord),
    Defect {
        row_number: i64,
        column_name: String,
        column_value: String,
        error_type: &'static str,
        error_msg: String,
    },
}

impl RawRow {
    pub fn row_number(&self) -> i64 {
        match self {
            RawRow::Record(r) => r.row_number,
            RawRow::Defect { row_number, .. } => *row_number,
        }
    }
}

/// Lazy, single-pass record stream over one file.
pub trait RecordStream: Send {
    /// Source-column names observed in the file (lowercased). For delimited
    /// and spreadsheet files this is the header row; for JSON it is the key
    /// set of the first item, resolved lazily before iteration continues.
    fn observed_fields(&mut self) -> Result<BTreeSet<String>, LoadError>;

    /// Next row, or `None` at end of stream.
    fn next_row(&mut self) -> Option<Result<RawRow, LoadError>>;
}

/// Validate a reader's observed header against the row model: every required
/// alias must be present. Extra columns are tolerated (the validator prunes
/// them).
pub fn validate_header(
    stream: &mut dyn RecordStream,
    required_aliases: &BTreeSet<String>,
    file_name: &str,
) -> Result<(), LoadError> {
    let observed = stream.observed_fields()?;

    let missing: Vec<String> = required_aliases
        .iter()
        .filter(|alias| !observed.contains(*alias))
        .cloned()
        .collect();

    if !missing.is_empty() {
        return Err(LoadError::MissingColumns {
            file: file_name.to_string(),
            missing,
            required: required_aliases.iter().cloned().collect(),
        });
    }

    Ok(())
}
