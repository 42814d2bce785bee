//! JSON reader
//!
//! Reads an array of objects, either at the document root or under a dotted
//! array selector, optionally through a gzip decompression stream. Nested
//! objects flatten into `parent_key` form; the observed field set is the
//! flattened key set of the first item, resolved lazily before iteration.

use std::collections::{BTreeSet, HashMap};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use fileloader_common::LoadError;
use flate2::read::GzDecoder;
use serde_json::Value;

use super::{RawCell, RawRecord, RawRow, RecordStream};

pub struct JsonReader {
    file_name: String,
    items: std::vec::IntoIter<Value>,
    skip_rows: usize,
    skipped: usize,
    observed: Option<BTreeSet<String>>,
    row_number: i64,
}

impl JsonReader {
    pub fn open(
        path: &Path,
        array_path: Option<&str>,
        skip_rows: usize,
        gzipped: bool,
    ) -> Result<Self, LoadError> {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();

        let file = File::open(path)?;
        let reader: Box<dyn Read + Send> = if gzipped {
            Box::new(GzDecoder::new(file))
        } else {
            Box::new(file)
        };

        let document: Value = serde_json::from_reader(BufReader::new(reader))
            .map_err(|e| LoadError::Config(format!("malformed JSON in '{file_name}': {e}")))?;

        let array = select_array(&document, array_path).ok_or_else(|| {
            LoadError::Config(format!(
                "no array found in '{file_name}' at selector '{}'",
                array_path.unwrap_or("<root>")
            ))
        })?;

        Ok(Self {
            file_name,
            items: array.to_vec().into_iter(),
            skip_rows,
            skipped: 0,
            observed: None,
            row_number: 0,
        })
    }
}

impl RecordStream for JsonReader {
    fn observed_fields(&mut self) -> Result<BTreeSet<String>, LoadError> {
        if self.observed.is_none() {
            // The key set comes from the first item only; later items with
            // extra keys are pruned and later items missing required keys
            // fail row validation instead.
            let observed = match self.items.as_slice().first() {
                Some(first @ Value::Object(_)) => {
                    flatten_object(first).keys().cloned().collect()
                },
                Some(_) => BTreeSet::new(),
                None => {
                    return Err(LoadError::MissingHeader {
                        file: self.file_name.clone(),
                    });
                },
            };
            self.observed = Some(observed);
        }
        Ok(self.observed.clone().unwrap_or_default())
    }

    fn next_row(&mut self) -> Option<Result<RawRow, LoadError>> {
        loop {
            let item = self.items.next()?;
            if self.skipped < self.skip_rows {
                self.skipped += 1;
                continue;
            }
            self.row_number += 1;

            if !item.is_object() {
                return Some(Ok(RawRow::Defect {
                    row_number: self.row_number,
                    column_name: String::new(),
                    column_value: item.to_string(),
                    error_type: "not_an_object",
                    error_msg: "array item is not a json object".to_string(),
                }));
            }

            let fields = flatten_object(&item);
            return Some(Ok(RawRow::Record(RawRecord {
                row_number: self.row_number,
                fields,
            })));
        }
    }
}

fn select_array<'a>(document: &'a Value, array_path: Option<&str>) -> Option<&'a [Value]> {
    let mut node = document;
    if let Some(path) = array_path {
        for segment in path.split('.').filter(|s| !s.is_empty()) {
            node = node.get(segment)?;
        }
    }
    node.as_array().map(Vec::as_slice)
}

/// Flatten a JSON object into lowercased `parent_key` entries. Scalar lists
/// stringify; lists of objects flatten with their index in the key.
fn flatten_object(value: &Value) -> HashMap<String, RawCell> {
    let mut out = HashMap::new();
    if let Value::Object(map) = value {
        for (key, val) in map {
            flatten_into(&mut out, &key.to_lowercase(), val);
        }
    }
    out
}

fn flatten_into(out: &mut HashMap<String, RawCell>, key: &str, value: &Value) {
    match value {
        Value::Object(map) => {
            for (child_key, child) in map {
                flatten_into(out, &format!("{key}_{}", child_key.to_lowercase()), child);
            }
        },
        Value::Array(items) => {
            if items.iter().any(Value::is_object) {
                for (i, item) in items.iter().enumerate() {
                    flatten_into(out, &format!("{key}_{i}"), item);
                }
            } else {
                let joined: Vec<String> = items.iter().map(scalar_text).collect();
                out.insert(key.to_string(), RawCell::Text(format!("[{}]", joined.join(", "))));
            }
        },
        scalar => {
            out.insert(key.to_string(), scalar_to_raw(scalar));
        },
    }
}

fn scalar_to_raw(value: &Value) -> RawCell {
    match value {
        Value::Null => RawCell::Null,
        Value::Bool(b) => RawCell::Bool(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                RawCell::Int(i)
            } else {
                RawCell::Float(n.as_f64().unwrap_or(f64::NAN))
            }
        },
        Value::String(s) => RawCell::Text(s.clone()),
        other => RawCell::Text(other.to_string()),
    }
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
