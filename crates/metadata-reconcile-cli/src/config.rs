use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use metadata_reconcile_core::{AmbiguityPolicy, FieldSpec};
use serde::Deserialize;

pub const DEFAULT_DB: &str = "./metadata.sqlite3";

/// File-level settings. Every value can be overridden by a command-line flag.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub db: Option<PathBuf>,
    pub ambiguity: AmbiguityPolicy,
    /// Term counted by `test-connection`.
    pub sample_term: Option<String>,
    pub log_file: Option<PathBuf>,
    pub flatten: FlattenConfig,
    pub labels: LabelConfig,
    pub rewrite: RewriteConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct FlattenConfig {
    pub source: FieldSpec,
    pub target: FieldSpec,
    pub display_field: FieldSpec,
}

impl Default for FlattenConfig {
    fn default() -> Self {
        Self {
            source: FieldSpec::new("dc", "subject", None),
            target: FieldSpec::new("local", "subject", Some("flat")),
            display_field: FieldSpec::new("dc", "title", None),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct LabelConfig {
    pub source: Option<FieldSpec>,
    pub target: Option<FieldSpec>,
    /// Precedence order; the first field with a value supplies the label.
    pub label_fields: Vec<FieldSpec>,
    /// Extra fields read into the lookup so that identifiers of objects
    /// without any label are logged as such.
    pub known_fields: Vec<FieldSpec>,
}

impl Default for LabelConfig {
    fn default() -> Self {
        Self {
            source: None,
            target: None,
            label_fields: vec![
                FieldSpec::new("dc", "title", None),
                FieldSpec::new("organization", "legalName", None),
            ],
            known_fields: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct RewriteConfig {
    pub vocabulary: Option<PathBuf>,
    pub scope: Option<FieldSpec>,
}

impl Config {
    /// Read `path`, or fall back to defaults when no file is given.
    ///
    /// # Errors
    /// Returns an error when the file cannot be read or is not valid config YAML.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let body = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::parse(&body).with_context(|| format!("invalid config file {}", path.display()))
    }

    /// # Errors
    /// Returns an error when `body` is not valid config YAML.
    pub fn parse(body: &str) -> Result<Self> {
        if body.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(body).context("failed to parse config YAML")
    }

    #[must_use]
    pub fn db_path(&self, flag: Option<&Path>) -> PathBuf {
        flag.map(Path::to_path_buf)
            .or_else(|| self.db.clone())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DB))
    }
}
