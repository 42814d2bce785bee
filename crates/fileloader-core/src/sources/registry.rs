//! Source registry
//!
//! Process-wide, read-only after construction. Construction validates every
//! source so misconfiguration fails at startup rather than mid-pipeline.

use std::collections::HashMap;
use std::path::Path;

use fileloader_common::LoadError;

use super::SourceConfig;

/// Validated, immutable set of source configurations.
#[derive(Debug, Default)]
pub struct SourceRegistry {
    sources: Vec<SourceConfig>,
}

impl SourceRegistry {
    /// Build a registry, rejecting invalid or mutually inconsistent sources.
    pub fn new(sources: Vec<SourceConfig>) -> Result<Self, LoadError> {
        let mut by_table: HashMap<&str, &SourceConfig> = HashMap::new();

        for source in &sources {
            validate_source(source)?;

            if let Some(existing) = by_table.get(source.table_name.as_str()) {
                if !existing.model.compatible_with(&source.model) {
                    return Err(LoadError::Config(format!(
                        "sources '{}' and '{}' declare target table '{}' with incompatible row models",
                        existing.name, source.name, source.table_name
                    )));
                }
            } else {
                by_table.insert(&source.table_name, source);
            }
        }

        // Ambiguous pattern pairs (same longest literal prefix) are a build
        // error; detect them by probing each pattern's own literal prefix.
        for (i, a) in sources.iter().enumerate() {
            for b in sources.iter().skip(i + 1) {
                if a.file_pattern != b.file_pattern
                    && a.literal_prefix_len() == b.literal_prefix_len()
                    && patterns_overlap(a, b)
                {
                    return Err(LoadError::Config(format!(
                        "sources '{}' and '{}' have ambiguous file patterns '{}' and '{}'",
                        a.name, b.name, a.file_pattern, b.file_pattern
                    )));
                }
                if a.file_pattern == b.file_pattern {
                    return Err(LoadError::Config(format!(
                        "sources '{}' and '{}' declare the same file pattern '{}'",
                        a.name, b.name, a.file_pattern
                    )));
                }
            }
        }

        Ok(Self { sources })
    }

    /// Load source definitions from a JSON file. Custom predicate
    /// constraints cannot be expressed declaratively; attach those through
    /// code-built sources instead.
    pub fn from_json_file(path: &Path) -> Result<Self, LoadError> {
        let data = std::fs::read_to_string(path)?;
        let sources: Vec<SourceConfig> = serde_json::from_str(&data)
            .map_err(|e| LoadError::Config(format!("invalid source definitions in {}: {e}", path.display())))?;
        Self::new(sources)
    }

    /// Resolve the source owning a file. Glob runs against the basename;
    /// when several patterns match, the longest literal prefix wins.
    pub fn match_file(&self, file_name: &str) -> Option<&SourceConfig> {
        self.sources
            .iter()
            .filter(|s| s.matches_file(file_name))
            .max_by_key(|s| s.literal_prefix_len())
    }

    pub fn iter(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter()
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

fn validate_source(source: &SourceConfig) -> Result<(), LoadError> {
    if !is_legal_identifier(&source.table_name) {
        return Err(LoadError::Config(format!(
            "source '{}': target table name '{}' is not a legal SQL identifier",
            source.name, source.table_name
        )));
    }

    if source.grain.is_empty() {
        return Err(LoadError::Config(format!(
            "source '{}': grain must name at least one field",
            source.name
        )));
    }

    for grain_field in &source.grain {
        match source.model.field(grain_field) {
            None => {
                return Err(LoadError::Config(format!(
                    "source '{}': grain field '{}' is not part of the row model",
                    source.name, grain_field
                )));
            },
            Some(spec) if !spec.required => {
                return Err(LoadError::Config(format!(
                    "source '{}': grain field '{}' must be required",
                    source.name, grain_field
                )));
            },
            Some(_) => {},
        }
    }

    if !(0.0..=1.0).contains(&source.validation_error_threshold) {
        return Err(LoadError::Config(format!(
            "source '{}': validation_error_threshold {} is outside [0, 1]",
            source.name, source.validation_error_threshold
        )));
    }

    if source.model.fields.is_empty() {
        return Err(LoadError::Config(format!(
            "source '{}': row model has no fields",
            source.name
        )));
    }

    if let Some(query) = &source.audit_query {
        if !query.contains("{table}") {
            return Err(LoadError::Config(format!(
                "source '{}': audit query is missing the {{table}} placeholder",
                source.name
            )));
        }
    }

    Ok(())
}

fn is_legal_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {},
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Conservative overlap probe for equal-prefix patterns, not full glob
/// intersection: same literal prefix and same extension tail means a file
/// name can match both with no winner (`orders-*.csv` vs `orders-?.csv`).
/// Different tails (`widgets*.csv` vs `widgets*.json`) never tie on a real
/// file and stay legal.
fn patterns_overlap(a: &SourceConfig, b: &SourceConfig) -> bool {
    let prefix_a: String = a.file_pattern.chars().take(a.literal_prefix_len()).collect();
    let prefix_b: String = b.file_pattern.chars().take(b.literal_prefix_len()).collect();
    if !prefix_a.eq_ignore_ascii_case(&prefix_b) {
        return false;
    }
    let tail = |pattern: &str| {
        pattern
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_lowercase())
            .unwrap_or_default()
    };
    tail(&a.file_pattern) == tail(&b.file_pattern)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::{FieldSpec, RowModel, SemanticType, SourceFormat};

    fn source(name: &str, pattern: &str, table: &str) -> SourceConfig {
        SourceConfig {
            name: name.to_string(),
            file_pattern: pattern.to_string(),
            model: RowModel::new(vec![
                FieldSpec::new("id", SemanticType::Integer),
                FieldSpec::new("name", SemanticType::Text),
            ]),
            table_name: table.to_string(),
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
    fn longest_literal_prefix_wins() {
        let registry = SourceRegistry::new(vec![
            source("broad", "widgets*.csv", "widgets"),
            source("narrow", "widgets_eu_*.csv", "widgets_eu"),
        ])
        .unwrap();

        let matched = registry.match_file("widgets_eu_2024.csv").unwrap();
        assert_eq!(matched.name, "narrow");
        let matched = registry.match_file("widgets_us.csv").unwrap();
        assert_eq!(matched.name, "broad");
        assert!(registry.match_file("orders.csv").is_none());
    }

    #[test]
    fn matching_is_case_insensitive() {
        let registry = SourceRegistry::new(vec![source("w", "widgets-*.csv", "widgets")]).unwrap();
        assert!(registry.match_file("Widgets-JAN.CSV").is_some());
    }

    #[test]
    fn equal_prefix_patterns_are_rejected() {
        let err = SourceRegistry::new(vec![
            source("a", "widgets-*.csv", "widgets"),
            source("b", "widgets-?.csv", "widgets_b"),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("ambiguous"));
    }

    #[test]
    fn grain_must_be_required_model_field() {
        let mut bad = source("a", "a-*.csv", "a_table");
        bad.grain = vec!["missing".to_string()];
        assert!(SourceRegistry::new(vec![bad]).is_err());

        let mut optional_grain = source("b", "b-*.csv", "b_table");
        optional_grain.model.fields[0].required = false;
        assert!(SourceRegistry::new(vec![optional_grain]).is_err());
    }

    #[test]
    fn incompatible_models_on_shared_table_are_rejected() {
        let a = source("a", "a-*.csv", "shared");
        let mut b = source("b", "b-*.csv", "shared");
        b.model.fields[0].semantic_type = SemanticType::Text;
        let err = SourceRegistry::new(vec![a, b]).unwrap_err();
        assert!(err.to_string().contains("incompatible"));
    }

    #[test]
    fn illegal_table_names_are_rejected() {
        let mut bad = source("a", "a-*.csv", "ok");
        bad.table_name = "1drop table".to_string();
        assert!(SourceRegistry::new(vec![bad]).is_err());
    }

    #[test]
    fn threshold_outside_unit_interval_is_rejected() {
        let mut bad = source("a", "a-*.csv", "a_table");
        bad.validation_error_threshold = 1.5;
        assert!(SourceRegistry::new(vec![bad]).is_err());
    }

    #[test]
    fn audit_query_needs_table_placeholder() {
        let mut bad = source("a", "a-*.csv", "a_table");
        bad.audit_query = Some("SELECT 1".to_string());
        assert!(SourceRegistry::new(vec![bad]).is_err());
    }
}
