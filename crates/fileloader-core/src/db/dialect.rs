//! SQL dialect capability
//!
//! The engine speaks three dialect families through one thin surface:
//! placeholder syntax, identifier limits, column type names, and the
//! idempotent upsert construct. Everything else is plain portable SQL.

use fileloader_common::LoadError;

use crate::sources::SemanticType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Postgres,
    MySql,
    Sqlite,
}

impl Dialect {
    /// Select the dialect from a connection URL scheme.
    pub fn from_url(url: &str) -> Result<Self, LoadError> {
        let scheme = url.split("://").next().unwrap_or_default();
        match scheme {
            "postgres" | "postgresql" => Ok(Dialect::Postgres),
            "mysql" | "mariadb" => Ok(Dialect::MySql),
            "sqlite" => Ok(Dialect::Sqlite),
            other => Err(LoadError::Config(format!(
                "unsupported database scheme '{other}' in connection url"
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Dialect::Postgres => "postgres",
            Dialect::MySql => "mysql",
            Dialect::Sqlite => "sqlite",
        }
    }

    /// Placeholder for the 1-based bind ordinal.
    pub fn placeholder(&self, ordinal: usize) -> String {
        match self {
            Dialect::Postgres => format!("${ordinal}"),
            Dialect::MySql | Dialect::Sqlite => "?".to_string(),
        }
    }

    /// Comma-separated placeholder list for ordinals `start..start + count`.
    pub fn placeholders(&self, start: usize, count: usize) -> String {
        (start..start + count)
            .map(|i| self.placeholder(i))
            .collect::<Vec<_>>()
            .join(", ")
    }

    pub fn max_identifier_len(&self) -> usize {
        match self {
            Dialect::Postgres => 63,
            Dialect::MySql => 64,
            Dialect::Sqlite => 128,
        }
    }

    /// Upper bound on bind parameters per statement, used to chunk batched
    /// inserts.
    pub fn max_bind_params(&self) -> usize {
        match self {
            Dialect::Postgres => 65_535,
            Dialect::MySql => 65_535,
            Dialect::Sqlite => 32_766,
        }
    }

    /// Column type for a semantic type. Temporal and identifier values are
    /// persisted as ISO-8601 / hyphenated text so one bind path serves all
    /// three dialects.
    pub fn column_type(&self, semantic: SemanticType) -> &'static str {
        match (self, semantic) {
            (_, SemanticType::Integer) => "BIGINT",
            (Dialect::MySql, SemanticType::Float) => "DOUBLE",
            (_, SemanticType::Float) => "DOUBLE PRECISION",
            (_, SemanticType::Boolean) => "BOOLEAN",
            (Dialect::MySql, _) => "VARCHAR(255)",
            (_, _) => "TEXT",
        }
    }

    /// Type for long, unindexed text columns (error messages, payloads).
    pub fn long_text_type(&self) -> &'static str {
        "TEXT"
    }

    /// Atomic upsert from a stage table into the target, keyed on the grain.
    /// Matched rows update their non-grain columns; unmatched rows insert.
    pub fn upsert_from_stage(
        &self,
        target: &str,
        stage: &str,
        insert_columns: &[String],
        select_exprs: &[String],
        grain: &[String],
        update_columns: &[String],
    ) -> String {
        let cols = insert_columns.join(", ");
        let select = select_exprs.join(", ");
        let grain_cols = grain.join(", ");

        match self {
            Dialect::Postgres | Dialect::Sqlite => {
                // SQLite needs the WHERE clause so ON CONFLICT parses after
                // INSERT ... SELECT; Postgres tolerates it.
                let action = if update_columns.is_empty() {
                    "DO NOTHING".to_string()
                } else {
                    let sets = update_columns
                        .iter()
                        .map(|c| format!("{c} = excluded.{c}"))
                        .collect::<Vec<_>>()
                        .join(", ");
                    format!("DO UPDATE SET {sets}")
                };
                format!(
                    "INSERT INTO {target} ({cols}) SELECT {select} FROM {stage} WHERE true \
                     ON CONFLICT ({grain_cols}) {action}"
                )
            },
            Dialect::MySql => {
                if update_columns.is_empty() {
                    format!("INSERT IGNORE INTO {target} ({cols}) SELECT {select} FROM {stage}")
                } else {
                    let sets = update_columns
                        .iter()
                        .map(|c| format!("{c} = VALUES({c})"))
                        .collect::<Vec<_>>()
                        .join(", ");
                    format!(
                        "INSERT INTO {target} ({cols}) SELECT {select} FROM {stage} \
                         ON DUPLICATE KEY UPDATE {sets}"
                    )
                }
            },
        }
    }
}

/// Replace every character outside `[A-Za-z0-9_]` with `_`.
pub fn sanitize_identifier(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

/// Stage table name for a source file: `stage_<sanitized-filename>`,
/// truncated to the dialect identifier limit. Filenames are unique within
/// the watch directory, so names cannot collide across live pipelines.
pub fn stage_table_name(dialect: Dialect, file_name: &str) -> String {
    let mut name = format!("stage_{}", sanitize_identifier(file_name));
    name.truncate(dialect.max_identifier_len());
    name
}
