use std::path::PathBuf;

use serde::Deserialize;
use serde_json::Value;

pub mod loader;
pub mod rego;
pub mod test_runner;

pub use loader::FilePolicyLoader;
pub use rego::RegoBackend;

/// Where a METADATA block applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnnotationScope {
    Rule,
    Document,
    Package,
    Subpackages,
}

/// One METADATA block attached to a package or rule.
#[derive(Debug, Clone, PartialEq)]
pub struct Annotation {
    pub scope: AnnotationScope,
    /// Fully qualified path of the annotated node (`data.<package>[.<rule>]`).
    pub target: String,
    pub title: Option<String>,
    pub description: Option<String>,
    /// Free-form `custom:` section.
    pub custom: serde_json::Map<String, Value>,
}

/// A parsed policy source file.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyModule {
    pub path: PathBuf,
    /// Package name without the `data.` root; doubles as the rule namespace.
    pub package: String,
    pub source: String,
    /// Distinct rule head names in declaration order.
    pub rules: Vec<String>,
    pub annotations: Vec<Annotation>,
}

impl PolicyModule {
    pub fn namespace(&self) -> &str {
        &self.package
    }

    /// Fully qualified path of a rule declared in this module.
    pub fn rule_path(&self, rule: &str) -> String {
        format!("data.{}.{}", self.package, rule)
    }

    /// Closest rule-scoped annotation whose target is exactly this rule.
    pub fn rule_annotation(&self, rule: &str) -> Option<&Annotation> {
        let target = self.rule_path(rule);
        self.annotations
            .iter()
            .rev()
            .find(|a| a.scope == AnnotationScope::Rule && a.target == target)
    }
}
