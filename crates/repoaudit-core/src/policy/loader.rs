use std::{
    collections::BTreeSet,
    fs,
    path::{Path, PathBuf},
};

use anyhow::{anyhow, bail, Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use tracing::debug;
use walkdir::WalkDir;

use super::{Annotation, AnnotationScope, PolicyModule};
use crate::error::{AuditError, AuditResult};

const REGO_EXTENSION: &str = "rego";
const METADATA_MARKER: &str = "# METADATA";

static PACKAGE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^package\s+([A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z_][A-Za-z0-9_]*)*)\s*(?:#.*)?$")
        .expect("package pattern is valid")
});

static RULE_HEAD_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?:default\s+)?([A-Za-z_][A-Za-z0-9_]*)\s*(?:\{|\[|\(|:=|=|if\b|contains\b|$)",
    )
    .expect("rule head pattern is valid")
});

const KEYWORDS: &[&str] = &[
    "package", "import", "default", "else", "some", "every", "not", "with", "as", "true",
    "false", "null",
];

/// Loads `.rego` policy modules from files and directories (searched recursively).
pub struct FilePolicyLoader {
    paths: Vec<PathBuf>,
}

impl FilePolicyLoader {
    pub fn new<I, P>(paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            paths: paths.into_iter().map(Into::into).collect(),
        }
    }

    /// Parse every policy file under the configured paths, in path order.
    pub fn load(&self) -> AuditResult<Vec<PolicyModule>> {
        let files = self.policy_files()?;
        if files.is_empty() {
            return Err(AuditError::NoPoliciesFound {
                paths: self.paths.clone(),
            });
        }
        files
            .into_iter()
            .map(|file| {
                fs::read_to_string(&file)
                    .with_context(|| format!("failed to read policy file {}", file.display()))
                    .and_then(|source| parse_module(&file, source))
                    .map_err(|source| AuditError::PolicyLoad { path: file, source })
            })
            .collect()
    }

    fn policy_files(&self) -> AuditResult<BTreeSet<PathBuf>> {
        let mut files = BTreeSet::new();
        for path in &self.paths {
            if !path.exists() {
                return Err(AuditError::PolicyLoad {
                    path: path.clone(),
                    source: anyhow!("path does not exist"),
                });
            }
            for entry in WalkDir::new(path).follow_links(true) {
                let entry = entry.map_err(|err| AuditError::PolicyLoad {
                    path: path.clone(),
                    source: err.into(),
                })?;
                if entry.file_type().is_file() && is_policy_file(entry.path()) {
                    files.insert(entry.into_path());
                }
            }
        }
        debug!(count = files.len(), "discovered policy files");
        Ok(files)
    }
}

fn is_policy_file(path: &Path) -> bool {
    path.extension().and_then(|ext| ext.to_str()) == Some(REGO_EXTENSION)
}

#[derive(Debug, Default, Deserialize)]
struct RawAnnotation {
    scope: Option<AnnotationScope>,
    title: Option<String>,
    description: Option<String>,
    #[serde(default)]
    custom: serde_json::Map<String, serde_json::Value>,
}

/// Extract the package, rule heads and METADATA blocks from a policy source.
pub fn parse_module(path: &Path, source: String) -> Result<PolicyModule> {
    let mut package: Option<String> = None;
    let mut rules: Vec<String> = Vec::new();
    let mut pending: Vec<RawAnnotation> = Vec::new();
    // `None` target means the block annotated the package clause.
    let mut attached: Vec<(RawAnnotation, Option<String>)> = Vec::new();

    let mut lines = source.lines().enumerate().peekable();
    while let Some((idx, line)) = lines.next() {
        let trimmed = line.trim();
        if trimmed == METADATA_MARKER {
            let mut yaml = String::new();
            while let Some((_, next)) = lines.peek() {
                let Some(body) = next.trim_start().strip_prefix('#') else {
                    break;
                };
                yaml.push_str(body.strip_prefix(' ').unwrap_or(body));
                yaml.push('\n');
                lines.next();
            }
            let raw = if yaml.trim().is_empty() {
                RawAnnotation::default()
            } else {
                serde_yaml::from_str(&yaml).with_context(|| {
                    format!("invalid METADATA block at {}:{}", path.display(), idx + 1)
                })?
            };
            pending.push(raw);
            continue;
        }
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if let Some(caps) = PACKAGE_RE.captures(trimmed) {
            package = Some(caps[1].to_string());
            attached.extend(pending.drain(..).map(|raw| (raw, None)));
            continue;
        }
        if let Some(name) = rule_head(line) {
            if !rules.contains(&name) {
                rules.push(name.clone());
            }
            attached.extend(pending.drain(..).map(|raw| (raw, Some(name.clone()))));
            continue;
        }
        // METADATA only binds to the declaration directly below it.
        pending.clear();
    }

    let Some(package) = package else {
        bail!("missing package clause in {}", path.display());
    };

    let annotations = attached
        .into_iter()
        .map(|(raw, rule)| {
            let (default_scope, target) = match rule {
                Some(rule) => (AnnotationScope::Rule, format!("data.{package}.{rule}")),
                None => (AnnotationScope::Package, format!("data.{package}")),
            };
            Annotation {
                scope: raw.scope.unwrap_or(default_scope),
                target,
                title: raw.title,
                description: raw.description,
                custom: raw.custom,
            }
        })
        .collect();

    Ok(PolicyModule {
        path: path.to_path_buf(),
        package,
        source,
        rules,
        annotations,
    })
}

fn rule_head(line: &str) -> Option<String> {
    let caps = RULE_HEAD_RE.captures(line)?;
    let name = &caps[1];
    if KEYWORDS.contains(&name) {
        return None;
    }
    Some(name.to_string())
}
