use std::{fmt, sync::Arc};

use anyhow::Result as AnyResult;
use serde_json::{Map, Value};

use crate::audit::Properties;
use crate::error::{AuditError, AuditResult};

pub mod client;
pub mod github;
pub mod gitlab;
pub mod settings;

pub use github::GitHub;
pub use gitlab::GitLab;
pub use settings::GitHubSettings;

/// A structural input record.
pub type Record = Map<String, Value>;

type BuiltinFn = dyn Fn(Vec<Value>) -> AnyResult<Value> + Send + Sync;

/// A function made callable from policies, e.g. `github.request`.
#[derive(Clone)]
pub struct Builtin {
    pub name: String,
    pub arity: u8,
    func: Arc<BuiltinFn>,
}

impl Builtin {
    pub fn new<F>(name: impl Into<String>, arity: u8, func: F) -> Self
    where
        F: Fn(Vec<Value>) -> AnyResult<Value> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            arity,
            func: Arc::new(func),
        }
    }

    pub fn call(&self, args: Vec<Value>) -> AnyResult<Value> {
        (self.func)(args)
    }
}

impl fmt::Debug for Builtin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Builtin")
            .field("name", &self.name)
            .field("arity", &self.arity)
            .finish()
    }
}

/// Source platform capability: namespace and property derivation plus policy builtins.
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    /// Infer the rule namespace governing `record`.
    fn derive_namespace(&self, record: &Record) -> AuditResult<String>;

    /// Project display properties out of `record`.
    fn derive_properties(&self, namespace: &str, record: &Record) -> AuditResult<Properties>;

    /// Functions this provider contributes to the policy backend.
    fn builtins(&self) -> Vec<Builtin> {
        Vec::new()
    }
}

/// Static `namespace -> required top-level keys` table.
///
/// Detection is deterministic: namespaces requiring more keys are tried
/// first, ties keep declaration order.
#[derive(Debug, Clone)]
pub struct NamespaceTable {
    entries: Vec<(&'static str, &'static [&'static str])>,
}

impl NamespaceTable {
    pub fn new(entries: &[(&'static str, &'static [&'static str])]) -> Self {
        let mut entries = entries.to_vec();
        entries.sort_by(|a, b| b.1.len().cmp(&a.1.len()));
        Self { entries }
    }

    pub fn detect(&self, record: &Record) -> AuditResult<String> {
        self.entries
            .iter()
            .find(|(_, keys)| keys.iter().all(|key| record.contains_key(*key)))
            .map(|(namespace, _)| namespace.to_string())
            .ok_or(AuditError::UnknownNamespace)
    }

    pub fn namespaces(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.entries.iter().map(|(namespace, _)| *namespace)
    }

    pub fn required_keys(&self, namespace: &str) -> Option<&'static [&'static str]> {
        self.entries
            .iter()
            .find(|(candidate, _)| *candidate == namespace)
            .map(|(_, keys)| *keys)
    }
}

/// Per-namespace list of `(property, dotted source path)` projections.
pub type PropertyTemplate = &'static [(&'static str, &'static str)];

/// Render a template against a record; missing source fields become `null`.
pub fn project_properties(template: PropertyTemplate, record: &Record) -> Properties {
    template
        .iter()
        .map(|(property, path)| {
            let value = lookup_path(record, path).cloned().unwrap_or(Value::Null);
            (property.to_string(), value)
        })
        .collect()
}

fn lookup_path<'a>(record: &'a Record, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = record.get(segments.next()?)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// The provider that recognised an input and the namespace it derived.
pub struct Derivation {
    pub provider: Arc<dyn Provider>,
    pub namespace: String,
}

/// Ask providers in order; the first one able to derive a namespace wins.
pub fn derive_namespace(providers: &[Arc<dyn Provider>], input: &Value) -> AuditResult<Derivation> {
    let record = input.as_object().ok_or(AuditError::UnknownNamespace)?;
    for provider in providers {
        match provider.derive_namespace(record) {
            Ok(namespace) => {
                return Ok(Derivation {
                    provider: Arc::clone(provider),
                    namespace,
                })
            }
            Err(AuditError::UnknownNamespace) => continue,
            Err(err) => return Err(err),
        }
    }
    Err(AuditError::UnknownNamespace)
}

/// Properties for a namespace, asking each provider until one has a template.
pub fn derive_properties(
    providers: &[Arc<dyn Provider>],
    namespace: &str,
    input: &Value,
) -> AuditResult<Properties> {
    let record = input.as_object().ok_or(AuditError::UnknownNamespace)?;
    for provider in providers {
        match provider.derive_properties(namespace, record) {
            Err(AuditError::UnknownReportProperties { .. }) => continue,
            other => return other,
        }
    }
    Err(AuditError::UnknownReportProperties {
        namespace: namespace.to_string(),
    })
}
