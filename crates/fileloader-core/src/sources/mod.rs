//! Source configurations and the process-wide registry
//!
//! A source binds a file-name pattern to a row model, a target table, a
//! grain, and reader options. The registry holds all configured sources,
//! resolves which one owns a discovered file, and is immutable after startup.

pub mod model;
pub mod registry;

use serde::{Deserialize, Serialize};

pub use model::{Constraint, FieldSpec, FieldValue, RowModel, SemanticType};
pub use registry::SourceRegistry;

/// Reader-specific options, one variant per supported file family.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceFormat {
    Delimited {
        #[serde(default = "default_delimiter")]
        delimiter: char,
        #[serde(default = "default_encoding")]
        encoding: String,
        #[serde(default)]
        skip_rows: usize,
    },
    Spreadsheet {
        #[serde(default)]
        sheet: Option<String>,
        #[serde(default)]
        skip_rows: usize,
    },
    Json {
        /// Dotted path to the record array; `None` means the document root.
        #[serde(default)]
        array_path: Option<String>,
        #[serde(default)]
        skip_rows: usize,
    },
}

fn default_delimiter() -> char {
    ','
}

fn default_encoding() -> String {
    "utf-8".to_string()
}

impl SourceFormat {
    pub fn kind_name(&self) -> &'static str {
        match self {
            SourceFormat::Delimited { .. } => "delimited",
            SourceFormat::Spreadsheet { .. } => "spreadsheet",
            SourceFormat::Json { .. } => "json",
        }
    }
}

/// One named source configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub name: String,
    /// Glob matched against the basename of discovered files.
    pub file_pattern: String,
    pub model: RowModel,
    pub table_name: String,
    /// Ordered field names forming the natural key of the target table.
    pub grain: Vec<String>,
    /// Optional audit SQL with a `{table}` placeholder for the stage table.
    /// Must return exactly one row of 0/1 columns.
    #[serde(default)]
    pub audit_query: Option<String>,
    /// Tolerated fraction of failing records, in [0, 1].
    #[serde(default)]
    pub validation_error_threshold: f64,
    #[serde(default)]
    pub notification_recipients: Vec<String>,
    pub format: SourceFormat,
}

impl SourceConfig {
    pub fn matches_file(&self, file_name: &str) -> bool {
        glob::Pattern::new(&self.file_pattern.to_lowercase())
            .map(|p| p.matches(&file_name.to_lowercase()))
            .unwrap_or(false)
    }

    /// Length of the literal prefix of the glob pattern, used to rank
    /// competing matches (longest literal prefix wins).
    pub fn literal_prefix_len(&self) -> usize {
        self.file_pattern
            .chars()
            .take_while(|c| !matches!(c, '*' | '?' | '['))
            .count()
    }

    pub fn skip_rows(&self) -> usize {
        match &self.format {
            SourceFormat::Delimited { skip_rows, .. }
            | SourceFormat::Spreadsheet { skip_rows, .. }
            | SourceFormat::Json { skip_rows, .. } => *skip_rows,
        }
    }
}
