//! Spreadsheet reader
//!
//! Opens `.xlsx`/`.xls` workbooks through calamine. The configured sheet (or
//! the first one) is read, skip_rows are discarded, the next non-empty row
//! is the header, and cells keep their native spreadsheet types so the
//! validator can coerce numbers and dates without string round-trips.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use calamine::{open_workbook_auto, Data, Reader};
use fileloader_common::LoadError;

use super::{RawCell, RawRecord, RawRow, RecordStream};

pub struct SpreadsheetReader {
    file_name: String,
    rows: std::vec::IntoIter<Vec<Data>>,
    skip_rows: usize,
    header: Option<Vec<String>>,
    row_number: i64,
}

impl SpreadsheetReader {
    pub fn open(path: &Path, sheet: Option<&str>, skip_rows: usize) -> Result<Self, LoadError> {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();

        let mut workbook = open_workbook_auto(path)
            .map_err(|e| LoadError::Config(format!("cannot open workbook '{file_name}': {e}")))?;

        let range = match sheet {
            Some(name) => workbook
                .worksheet_range(name)
                .map_err(|e| LoadError::Config(format!("sheet '{name}' in '{file_name}': {e}")))?,
            None => workbook
                .worksheet_range_at(0)
                .ok_or_else(|| LoadError::MissingHeader {
                    file: file_name.clone(),
                })?
                .map_err(|e| LoadError::Config(format!("first sheet of '{file_name}': {e}")))?,
        };

        let rows: Vec<Vec<Data>> = range.rows().map(|r| r.to_vec()).collect();

        Ok(Self {
            file_name,
            rows: rows.into_iter(),
            skip_rows,
            header: None,
            row_number: 0,
        })
    }

    fn ensure_header(&mut self) -> Result<&[String], LoadError> {
        if self.header.is_none() {
            let mut skipped = 0usize;
            loop {
                let row = self.rows.next().ok_or_else(|| LoadError::MissingHeader {
                    file: self.file_name.clone(),
                })?;
                if skipped < self.skip_rows {
                    skipped += 1;
                    continue;
                }
                if row.iter().any(|c| !matches!(c, Data::Empty)) {
                    let header = header_names(&row);
                    if header_is_unusable(&header) {
                        return Err(LoadError::MissingHeader {
                            file: self.file_name.clone(),
                        });
                    }
                    self.header = Some(header);
                    break;
                }
            }
        }
        Ok(self.header.as_deref().unwrap_or_default())
    }
}

impl RecordStream for SpreadsheetReader {
    fn observed_fields(&mut self) -> Result<BTreeSet<String>, LoadError> {
        Ok(self
            .ensure_header()?
            .iter()
            .filter(|h| !h.is_empty())
            .cloned()
            .collect())
    }

    fn next_row(&mut self) -> Option<Result<RawRow, LoadError>> {
        if self.header.is_none() {
            if let Err(e) = self.ensure_header() {
                return Some(Err(e));
            }
        }

        loop {
            let row = self.rows.next()?;
            if row.iter().all(|c| matches!(c, Data::Empty)) {
                continue;
            }

            self.row_number += 1;
            let header = self.header.as_deref().unwrap_or_default();

            if row.len() > header.len() {
                let surplus: Vec<String> = row[header.len()..]
                    .iter()
                    .filter(|c| !matches!(c, Data::Empty))
                    .map(|c| c.to_string())
                    .collect();
                if !surplus.is_empty() {
                    return Some(Ok(RawRow::Defect {
                        row_number: self.row_number,
                        column_name: String::new(),
                        column_value: surplus.join(","),
                        error_type: "extra_columns",
                        error_msg: format!(
                            "row has {} cells but the header declares {}",
                            row.len(),
                            header.len()
                        ),
                    }));
                }
            }

            let fields: HashMap<String, RawCell> = header
                .iter()
                .enumerate()
                .filter(|(_, name)| !name.is_empty())
                .map(|(i, name)| {
                    let cell = row.get(i).map(cell_to_raw).unwrap_or(RawCell::Null);
                    (name.clone(), cell)
                })
                .collect();

            return Some(Ok(RawRow::Record(RawRecord {
                row_number: self.row_number,
                fields,
            })));
        }
    }
}

fn header_names(row: &[Data]) -> Vec<String> {
    row.iter()
        .map(|c| match c {
            Data::Empty => String::new(),
            other => other.to_string().trim().to_lowercase(),
        })
        .collect()
}

/// Headers made only of blanks or bare numbers are artifacts of headerless
/// sheets, not real column names.
fn header_is_unusable(header: &[String]) -> bool {
    header
        .iter()
        .all(|h| h.is_empty() || h.trim_start_matches('-').chars().all(|c| c.is_ascii_digit()))
}

fn cell_to_raw(cell: &Data) -> RawCell {
    match cell {
        Data::Empty => RawCell::Null,
        Data::String(s) => RawCell::Text(s.clone()),
        Data::Int(i) => RawCell::Int(*i),
        Data::Float(f) => RawCell::Float(*f),
        Data::Bool(b) => RawCell::Bool(*b),
        Data::DateTime(dt) => match dt.as_datetime() {
            Some(naive) => RawCell::DateTime(naive),
            None => RawCell::Float(dt.as_f64()),
        },
        Data::DateTimeIso(s) | Data::DurationIso(s) => RawCell::Text(s.clone()),
        // Cell-level errors (#DIV/0! and friends) surface as text so the
        // validator reports them per field.
        Data::Error(e) => RawCell::Text(format!("{e:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_names_are_trimmed_and_lowercased() {
        let row = vec![
            Data::String(" Customer Id ".to_string()),
            Data::String("NAME".to_string()),
            Data::Empty,
        ];
        assert_eq!(header_names(&row), vec!["customer id", "name", ""]);
    }

    #[test]
    fn numeric_only_headers_are_unusable() {
        let unusable = vec!["".to_string(), "-1".to_string(), "2".to_string()];
        assert!(header_is_unusable(&unusable));
        let usable = vec!["id".to_string(), "-1".to_string()];
        assert!(!header_is_unusable(&usable));
    }

    #[test]
    fn cells_keep_native_types() {
        assert_eq!(cell_to_raw(&Data::Int(7)), RawCell::Int(7));
        assert_eq!(cell_to_raw(&Data::Float(1.5)), RawCell::Float(1.5));
        assert_eq!(cell_to_raw(&Data::Bool(true)), RawCell::Bool(true));
        assert_eq!(
            cell_to_raw(&Data::String("x".to_string())),
            RawCell::Text("x".to_string())
        );
        assert_eq!(cell_to_raw(&Data::Empty), RawCell::Null);
    }
}
