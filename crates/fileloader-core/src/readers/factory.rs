//! Reader selection by file extension
//!
//! Maps a `(source, extension)` pair onto a concrete reader, verifying the
//! extension's reader family against the configured source variant.
//! Compressed variants (`.csv.gz`, `.json.gz`) transparently wrap a
//! decompression stream inside the reader.

use std::path::Path;

use fileloader_common::LoadError;

use super::delimited::DelimitedReader;
use super::json::JsonReader;
use super::spreadsheet::SpreadsheetReader;
use super::RecordStream;
use crate::sources::{SourceConfig, SourceFormat};

/// Extensions the scheduler discovers and the factory accepts.
pub const SUPPORTED_EXTENSIONS: &[&str] = &["csv", "csv.gz", "json", "json.gz", "xlsx", "xls"];

/// Extension of a path, honoring the double `.gz` suffixes. Lowercased.
pub fn extension_of(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_str()?.to_lowercase();
    for ext in SUPPORTED_EXTENSIONS {
        if name.ends_with(&format!(".{ext}")) {
            return Some((*ext).to_string());
        }
    }
    // Fall back to the last dot segment so unsupported formats report
    // their real extension.
    name.rsplit_once('.').map(|(_, ext)| ext.to_string())
}

/// Whether the scheduler should pick this path up at all.
pub fn supported_path(path: &Path) -> bool {
    extension_of(path).is_some_and(|ext| SUPPORTED_EXTENSIONS.contains(&ext.as_str()))
}

/// Open a reader for a file under a source configuration.
///
/// Fails with `UnsupportedFormat` for unknown extensions and
/// `ReaderMismatch` when the extension's reader family does not match the
/// source variant.
pub fn open_reader(
    path: &Path,
    source: &SourceConfig,
) -> Result<Box<dyn RecordStream>, LoadError> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .to_string();

    let extension = extension_of(path).ok_or_else(|| LoadError::UnsupportedFormat {
        file: file_name.clone(),
        extension: String::new(),
    })?;

    let expected = match extension.as_str() {
        "csv" | "csv.gz" => "delimited",
        "json" | "json.gz" => "json",
        "xlsx" | "xls" => "spreadsheet",
        _ => {
            return Err(LoadError::UnsupportedFormat {
                file: file_name,
                extension,
            });
        },
    };

    if expected != source.format.kind_name() {
        return Err(LoadError::ReaderMismatch {
            extension,
            source_name: source.name.clone(),
            expected,
            actual: source.format.kind_name(),
        });
    }

    let gzipped = extension.ends_with(".gz");

    match &source.format {
        SourceFormat::Delimited {
            delimiter,
            encoding,
            skip_rows,
        } => Ok(Box::new(DelimitedReader::open(
            path, *delimiter, encoding, *skip_rows, gzipped,
        )?)),
        SourceFormat::Json {
            array_path,
            skip_rows,
        } => Ok(Box::new(JsonReader::open(
            path,
            array_path.as_deref(),
            *skip_rows,
            gzipped,
        )?)),
        SourceFormat::Spreadsheet { sheet, skip_rows } => Ok(Box::new(SpreadsheetReader::open(
            path,
            sheet.as_deref(),
            *skip_rows,
        )?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::{FieldSpec, RowModel, SemanticType};
    use std::path::PathBuf;

    fn delimited_source() -> SourceConfig {
        SourceConfig {
            name: "widgets".to_string(),
            file_pattern: "widgets*.csv".to_string(),
            model: RowModel::new(vec![FieldSpec::new("id", SemanticType::Integer)]),
            table_name: "widgets".to_string(),
            grain: vec!["id".to_string()],
            audit_query: None,
            validation_error_threshold: 0.0,
            notification_recipients: vec![],
            format: SourceFormat::Delimited {
                delimiter: ',',
                encoding: "utf-8".to_string(),
                skip_rows: 0,
            },
        }
    }

    #[test]
    fn recognizes_double_extensions() {
        assert_eq!(
            extension_of(&PathBuf::from("/in/widgets.csv.gz")).as_deref(),
            Some("csv.gz")
        );
        assert_eq!(
            extension_of(&PathBuf::from("widgets.CSV")).as_deref(),
            Some("csv")
        );
        assert_eq!(
            extension_of(&PathBuf::from("widgets.parquet")).as_deref(),
            Some("parquet")
        );
        assert!(supported_path(&PathBuf::from("a.json.gz")));
        assert!(!supported_path(&PathBuf::from("a.parquet")));
        assert!(!supported_path(&PathBuf::from("no_extension")));
    }

    #[test]
    fn mismatched_source_variant_is_rejected() {
        let source = delimited_source();
        let err = open_reader(&PathBuf::from("widgets.json"), &source).unwrap_err();
        assert!(matches!(err, LoadError::ReaderMismatch { .. }));
    }

    #[test]
    fn unknown_extension_is_unsupported() {
        let source = delimited_source();
        let err = open_reader(&PathBuf::from("widgets.parquet"), &source).unwrap_err();
        assert!(matches!(err, LoadError::UnsupportedFormat { .. }));
    }
}
