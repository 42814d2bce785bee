//! Delimited-text reader
//!
//! Streams CSV-family files with a configurable delimiter and character
//! encoding, optionally through a gzip decompression stream. The configured
//! number of leading rows is skipped, the next non-empty row is the header,
//! and every following row becomes a field map keyed by header names.
//!
//! Rows shorter than the header pad with empty strings; rows with surplus
//! non-empty fields are defects routed to the dead-letter queue.

use std::collections::{BTreeSet, HashMap};
use std::fs::File;
use std::io::Read;
use std::path::Path;

use encoding_rs_io::DecodeReaderBytesBuilder;
use fileloader_common::LoadError;
use flate2::read::GzDecoder;

use super::{RawCell, RawRecord, RawRow, RecordStream};

pub struct DelimitedReader {
    file_name: String,
    reader: csv::Reader<Box<dyn Read + Send>>,
    skip_rows: usize,
    header: Option<Vec<String>>,
    row_number: i64,
}

impl DelimitedReader {
    pub fn open(
        path: &Path,
        delimiter: char,
        encoding: &str,
        skip_rows: usize,
        gzipped: bool,
    ) -> Result<Self, LoadError> {
        if !delimiter.is_ascii() {
            return Err(LoadError::Config(format!(
                "delimiter '{delimiter}' is not a single-byte character"
            )));
        }

        let encoding = encoding_rs::Encoding::for_label(encoding.as_bytes())
            .ok_or_else(|| LoadError::Config(format!("unknown encoding label '{encoding}'")))?;

        let file = File::open(path)?;
        let raw: Box<dyn Read + Send> = if gzipped {
            Box::new(GzDecoder::new(file))
        } else {
            Box::new(file)
        };
        let decoded: Box<dyn Read + Send> = Box::new(
            DecodeReaderBytesBuilder::new()
                .encoding(Some(encoding))
                .build(raw),
        );

        let reader = csv::ReaderBuilder::new()
            .delimiter(delimiter as u8)
            .has_headers(false)
            .flexible(true)
            .from_reader(decoded);

        Ok(Self {
            file_name: path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default()
                .to_string(),
            reader,
            skip_rows,
            header: None,
            row_number: 0,
        })
    }

    fn read_record(&mut self) -> Result<Option<csv::StringRecord>, LoadError> {
        let mut record = csv::StringRecord::new();
        match self.reader.read_record(&mut record) {
            Ok(true) => Ok(Some(record)),
            Ok(false) => Ok(None),
            Err(e) => Err(LoadError::Config(format!(
                "malformed delimited data in '{}': {e}",
                self.file_name
            ))),
        }
    }

    /// Skip leading rows, then take the first non-empty row as the header.
    fn ensure_header(&mut self) -> Result<&[String], LoadError> {
        if self.header.is_none() {
            let mut skipped = 0usize;
            loop {
                let record = self.read_record()?.ok_or_else(|| LoadError::MissingHeader {
                    file: self.file_name.clone(),
                })?;
                if skipped < self.skip_rows {
                    skipped += 1;
                    continue;
                }
                if record.iter().any(|f| !f.trim().is_empty()) {
                    self.header = Some(
                        record
                            .iter()
                            .map(|f| f.trim().to_lowercase())
                            .collect(),
                    );
                    break;
                }
            }
        }
        Ok(self.header.as_deref().unwrap_or_default())
    }
}

impl RecordStream for DelimitedReader {
    fn observed_fields(&mut self) -> Result<BTreeSet<String>, LoadError> {
        Ok(self.ensure_header()?.iter().cloned().collect())
    }

    fn next_row(&mut self) -> Option<Result<RawRow, LoadError>> {
        if self.header.is_none() {
            if let Err(e) = self.ensure_header() {
                return Some(Err(e));
            }
        }

        loop {
            let record = match self.read_record() {
                Ok(Some(r)) => r,
                Ok(None) => return None,
                Err(e) => return Some(Err(e)),
            };

            // Fully empty rows (trailing newlines, spacer lines) carry no data.
            if record.iter().all(|f| f.is_empty()) {
                continue;
            }

            self.row_number += 1;
            let header = self.header.as_deref().unwrap_or_default();

            // Surplus fields beyond the header are an error for this row;
            // a bare trailing delimiter (empty surplus) is tolerated.
            if record.len() > header.len() {
                let surplus: Vec<&str> = record.iter().skip(header.len()).collect();
                if surplus.iter().any(|f| !f.is_empty()) {
                    return Some(Ok(RawRow::Defect {
                        row_number: self.row_number,
                        column_name: String::new(),
                        column_value: surplus.join(","),
                        error_type: "extra_columns",
                        error_msg: format!(
                            "row has {} fields but the header declares {}",
                            record.len(),
                            header.len()
                        ),
                    }));
                }
            }

            let fields: HashMap<String, RawCell> = header
                .iter()
                .enumerate()
                .map(|(i, name)| {
                    // Short rows pad with empty strings, not missing fields.
                    let value = record.get(i).unwrap_or("");
                    (name.clone(), RawCell::Text(value.to_string()))
                })
                .collect();

            return Some(Ok(RawRow::Record(RawRecord {
                row_number: self.row_number,
                fields,
            })));
        }
    }
}
