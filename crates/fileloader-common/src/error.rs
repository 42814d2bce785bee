//! Error types for fileloader
//!
//! Every failure a file pipeline can hit maps onto one `LoadError` variant.
//! The variant decides two things downstream: whether the operation is worth
//! retrying (`is_transient`) and which notification channel hears about it
//! (`ErrorKind::is_file_problem`).

use thiserror::Error;

/// Result type alias for fileloader operations
pub type Result<T> = std::result::Result<T, LoadError>;

/// Stable error classification, persisted in the run log and used to route
/// notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    UnsupportedFormat,
    ReaderMismatch,
    MissingHeader,
    MissingColumns,
    ThresholdExceeded,
    GrainDuplicates,
    AuditFailed,
    DuplicateFile,
    DbTransient,
    DbFatal,
    Cancelled,
    Io,
    Config,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::UnsupportedFormat => "unsupported-format",
            ErrorKind::ReaderMismatch => "reader-mismatch",
            ErrorKind::MissingHeader => "missing-header",
            ErrorKind::MissingColumns => "missing-columns",
            ErrorKind::ThresholdExceeded => "threshold-exceeded",
            ErrorKind::GrainDuplicates => "grain-duplicates",
            ErrorKind::AuditFailed => "audit-failed",
            ErrorKind::DuplicateFile => "duplicate-file",
            ErrorKind::DbTransient => "db-transient",
            ErrorKind::DbFatal => "db-fatal",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Io => "io",
            ErrorKind::Config => "config",
        }
    }

    /// File problems are reported to the business recipients configured on
    /// the source; everything else is an internal matter.
    pub fn is_file_problem(&self) -> bool {
        matches!(
            self,
            ErrorKind::MissingHeader
                | ErrorKind::MissingColumns
                | ErrorKind::ThresholdExceeded
                | ErrorKind::GrainDuplicates
                | ErrorKind::AuditFailed
                | ErrorKind::DuplicateFile
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Main error type for file processing
#[derive(Error, Debug)]
pub enum LoadError {
    /// File extension has no registered reader
    #[error("unsupported file extension '.{extension}' for '{file}'")]
    UnsupportedFormat { file: String, extension: String },

    /// Reader chosen by extension does not accept the configured source variant
    #[error("extension '.{extension}' expects a {expected} source, but '{source_name}' is configured as {actual}")]
    ReaderMismatch {
        extension: String,
        source_name: String,
        expected: &'static str,
        actual: &'static str,
    },

    /// No usable header row in the file
    #[error("no usable header found in '{file}'")]
    MissingHeader { file: String },

    /// Header present but required columns are absent
    #[error("missing required columns in '{file}': {}. required: {}", missing.join(", "), required.join(", "))]
    MissingColumns {
        file: String,
        missing: Vec<String>,
        required: Vec<String>,
    },

    /// Validation error rate exceeded the source threshold
    #[error(
        "validation error rate ({rate:.2}%) exceeds threshold ({threshold:.2}%). \
         total records processed: {processed}, failed records: {errors}. \
         sample validation errors: {samples}"
    )]
    ThresholdExceeded {
        rate: f64,
        threshold: f64,
        processed: i64,
        errors: i64,
        samples: String,
    },

    /// Grain values in the stage table are not unique
    #[error(
        "grain values are not unique for file '{file}' (table {table}, grain columns: {grain}). \
         {duplicates} duplicated grain value(s). example duplicate grain violations:\n{examples}"
    )]
    GrainDuplicates {
        file: String,
        table: String,
        grain: String,
        duplicates: i64,
        examples: String,
    },

    /// One or more user audit checks returned 0
    #[error("audit checks failed for file '{file}' (table {table}). failed audits: {}", failed.join(", "))]
    AuditFailed {
        file: String,
        table: String,
        failed: Vec<String>,
    },

    /// The target table already holds rows for this source file
    #[error("file '{file}' has already been loaded into '{table}'")]
    DuplicateFile { file: String, table: String },

    /// Database operation failed
    #[error("database operation failed: {operation} - {reason}")]
    Database {
        operation: String,
        reason: String,
        transient: bool,
    },

    /// The run was cancelled by a shutdown signal
    #[error("run cancelled by shutdown signal")]
    Cancelled,

    /// Filesystem operation failed
    #[error("file operation failed: {0}")]
    Io(#[from] std::io::Error),

    /// Source or runtime configuration is invalid
    #[error("configuration error: {0}")]
    Config(String),
}

impl LoadError {
    /// Create a database error, classification decided by the caller.
    pub fn database(operation: impl Into<String>, reason: impl Into<String>, transient: bool) -> Self {
        Self::Database {
            operation: operation.into(),
            reason: reason.into(),
            transient,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            LoadError::UnsupportedFormat { .. } => ErrorKind::UnsupportedFormat,
            LoadError::ReaderMismatch { .. } => ErrorKind::ReaderMismatch,
            LoadError::MissingHeader { .. } => ErrorKind::MissingHeader,
            LoadError::MissingColumns { .. } => ErrorKind::MissingColumns,
            LoadError::ThresholdExceeded { .. } => ErrorKind::ThresholdExceeded,
            LoadError::GrainDuplicates { .. } => ErrorKind::GrainDuplicates,
            LoadError::AuditFailed { .. } => ErrorKind::AuditFailed,
            LoadError::DuplicateFile { .. } => ErrorKind::DuplicateFile,
            LoadError::Database { transient: true, .. } => ErrorKind::DbTransient,
            LoadError::Database { transient: false, .. } => ErrorKind::DbFatal,
            LoadError::Cancelled => ErrorKind::Cancelled,
            LoadError::Io(_) => ErrorKind::Io,
            LoadError::Config(_) => ErrorKind::Config,
        }
    }

    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, LoadError::Database { transient: true, .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_strings_are_stable() {
        assert_eq!(ErrorKind::ThresholdExceeded.as_str(), "threshold-exceeded");
        assert_eq!(ErrorKind::GrainDuplicates.as_str(), "grain-duplicates");
        assert_eq!(ErrorKind::DbTransient.as_str(), "db-transient");
    }

    #[test]
    fn file_problems_route_to_business_channel() {
        for kind in [
            ErrorKind::MissingHeader,
            ErrorKind::MissingColumns,
            ErrorKind::ThresholdExceeded,
            ErrorKind::GrainDuplicates,
            ErrorKind::AuditFailed,
            ErrorKind::DuplicateFile,
        ] {
            assert!(kind.is_file_problem(), "{kind} should be a file problem");
        }
        for kind in [
            ErrorKind::UnsupportedFormat,
            ErrorKind::DbFatal,
            ErrorKind::Cancelled,
            ErrorKind::Io,
        ] {
            assert!(!kind.is_file_problem(), "{kind} should be internal");
        }
    }

    #[test]
    fn transient_classification_follows_the_flag() {
        let transient = LoadError::database("insert batch", "deadlock detected", true);
        let fatal = LoadError::database("insert batch", "syntax error", false);
        assert!(transient.is_transient());
        assert_eq!(transient.kind(), ErrorKind::DbTransient);
        assert!(!fatal.is_transient());
        assert_eq!(fatal.kind(), ErrorKind::DbFatal);
    }
}
