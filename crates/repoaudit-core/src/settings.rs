use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;

use crate::audit::coordinator::DEFAULT_MAX_CONCURRENCY;
use crate::report::OutputFormat;

/// Run configuration for an audit.
///
/// Resolution order (highest priority first):
/// 1. CLI flags (applied via [`AuditSettings::apply`])
/// 2. Environment variables (`REPOAUDIT_*`)
/// 3. The config file passed with `--config`
/// 4. Compiled defaults
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AuditSettings {
    pub policy_paths: Vec<PathBuf>,
    pub format: OutputFormat,
    pub namespace: Option<String>,
    pub trace: bool,
    pub merge: bool,
    pub max_concurrency: usize,
}

impl Default for AuditSettings {
    fn default() -> Self {
        Self {
            policy_paths: vec![PathBuf::from("policies")],
            format: OutputFormat::default(),
            namespace: None,
            trace: false,
            merge: false,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
        }
    }
}

/// Values given on the command line; `None`/empty leaves the lower layers untouched.
#[derive(Debug, Clone, Default)]
pub struct SettingsOverrides {
    pub policy_paths: Vec<PathBuf>,
    pub format: Option<OutputFormat>,
    pub namespace: Option<String>,
    pub trace: bool,
    pub merge: bool,
    pub max_concurrency: Option<usize>,
}

impl AuditSettings {
    const ENV_PREFIX: &'static str = "REPOAUDIT";

    /// Load defaults, then `config_path` (format chosen by extension), then `REPOAUDIT_*` variables.
    ///
    /// `REPOAUDIT_POLICY_PATHS` accepts a comma separated list.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = config_path {
            builder = builder.add_source(File::from(path).required(true));
        }
        builder = builder.add_source(
            Environment::with_prefix(Self::ENV_PREFIX)
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("policy_paths"),
        );
        let settings: Self = builder
            .build()
            .context("failed to read configuration")?
            .try_deserialize()
            .context("invalid configuration")?;
        Ok(settings)
    }

    pub fn apply(mut self, overrides: SettingsOverrides) -> Self {
        if !overrides.policy_paths.is_empty() {
            self.policy_paths = overrides.policy_paths;
        }
        if let Some(format) = overrides.format {
            self.format = format;
        }
        if overrides.namespace.is_some() {
            self.namespace = overrides.namespace;
        }
        self.trace |= overrides.trace;
        self.merge |= overrides.merge;
        if let Some(limit) = overrides.max_concurrency {
            self.max_concurrency = limit;
        }
        self
    }
}
