use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result as AnyResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::error::{AuditError, AuditResult};

pub mod check;
pub mod coordinator;
pub mod extract;
pub mod query;

/// Opaque display metadata attached to a report.
pub type Properties = serde_json::Map<String, Value>;

/// Severity bucket a rule reports under; doubles as the SARIF level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleKind {
    Error,
    Warning,
    Note,
}

impl RuleKind {
    const ALIASES: [(RuleKind, &'static [&'static str]); 3] = [
        (RuleKind::Error, &["error", "fail", "violation"]),
        (RuleKind::Warning, &["warning", "warn"]),
        (RuleKind::Note, &["note", "info"]),
    ];

    /// Resolve a rule head prefix (`fail`, `warn`, ...) to its kind.
    pub fn from_prefix(prefix: &str) -> Option<Self> {
        Self::ALIASES
            .iter()
            .find(|(_, aliases)| aliases.contains(&prefix))
            .map(|(kind, _)| *kind)
    }

    /// Security severity used when a rule carries no explicit annotation.
    pub fn default_security_severity(self) -> f64 {
        match self {
            Self::Error => 7.0,
            Self::Warning => 4.0,
            Self::Note => 1.0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Note => "note",
        }
    }
}

/// A named, severity-tagged policy rule extracted from a policy module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    /// Identifier following the kind prefix in the rule head (`has_description`).
    pub id: String,
    /// Kind prefix exactly as declared in the rule head (`fail`, `warn`, ...).
    pub prefix: String,
    pub kind: RuleKind,
    /// Numeric severity within 0.0–10.0 inclusive.
    pub security_severity: f64,
    pub title: String,
    pub description: String,
    pub tags: BTreeSet<String>,
    pub namespace: String,
}

impl Rule {
    /// Build a rule with defaults derived from its kind; annotations may override afterwards.
    pub fn new(
        namespace: impl Into<String>,
        prefix: impl Into<String>,
        id: impl Into<String>,
    ) -> Result<Self, RuleValidationError> {
        let prefix = prefix.into();
        let id = id.into();
        let kind = RuleKind::from_prefix(&prefix).ok_or_else(|| {
            RuleValidationError::UnknownKind {
                prefix: prefix.clone(),
            }
        })?;
        let rule = Self {
            title: id.clone(),
            description: id.clone(),
            security_severity: kind.default_security_severity(),
            tags: BTreeSet::new(),
            namespace: namespace.into(),
            id,
            prefix,
            kind,
        };
        rule.validate()?;
        Ok(rule)
    }

    /// Globally unique identity within one compiled rule set: `namespace/kind/id`.
    pub fn uid(&self) -> String {
        format!("{}/{}/{}", self.namespace, self.prefix, self.id)
    }

    /// Name of the rule body inside its namespace (`<kind>_<id>`).
    pub fn head_name(&self) -> String {
        format!("{}_{}", self.prefix, self.id)
    }

    /// Mirrors the rule kind.
    pub fn severity(&self) -> RuleKind {
        self.kind
    }

    pub fn validate(&self) -> Result<(), RuleValidationError> {
        if self.id.trim().is_empty() {
            return Err(RuleValidationError::EmptyId);
        }
        if !self.security_severity.is_finite() || !(0.0..=10.0).contains(&self.security_severity)
        {
            return Err(RuleValidationError::InvalidSecuritySeverity {
                uid: self.uid(),
                value: self.security_severity,
            });
        }
        Ok(())
    }
}

/// Errors emitted while validating rule definitions.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RuleValidationError {
    #[error("rule id must not be blank")]
    EmptyId,
    #[error("unknown rule kind prefix `{prefix}`")]
    UnknownKind { prefix: String },
    #[error("rule `{uid}` security severity must be within 0.0..=10.0 (got {value})")]
    InvalidSecuritySeverity { uid: String, value: f64 },
}

/// Outcome of evaluating one rule against one input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResult {
    /// UID of the evaluated rule.
    #[serde(rename = "rule")]
    pub rule_uid: String,
    /// The check-query planned for the rule.
    pub query: String,
    pub skipped: bool,
    /// Meaningful only when `skipped` is false.
    pub passed: bool,
}

impl CheckResult {
    pub fn skipped(rule: &Rule, query: impl Into<String>) -> Self {
        Self {
            rule_uid: rule.uid(),
            query: query.into(),
            skipped: true,
            passed: false,
        }
    }

    pub fn evaluated(rule: &Rule, query: impl Into<String>, passed: bool) -> Self {
        Self {
            rule_uid: rule.uid(),
            query: query.into(),
            skipped: false,
            passed,
        }
    }

    /// Whether this result should surface as a finding.
    pub fn is_violation(&self) -> bool {
        !self.skipped && !self.passed
    }
}

/// Rules considered for an input and the results gathered for them.
///
/// Every key of `results` is also a key of `rules`; the rule count is always
/// the live size of `rules`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Report {
    rules: BTreeMap<String, Rule>,
    results: BTreeMap<String, CheckResult>,
    properties: Properties,
}

impl Report {
    /// Seed a report with every rule applicable to the input.
    pub fn with_rules<I>(rules: I, properties: Properties) -> Self
    where
        I: IntoIterator<Item = Rule>,
    {
        let mut report = Self {
            properties,
            ..Self::default()
        };
        for rule in rules {
            report.add_rule(rule);
        }
        report
    }

    /// Insert a rule, replacing any rule with the same UID.
    pub fn add_rule(&mut self, rule: Rule) {
        self.rules.insert(rule.uid(), rule);
    }

    /// Insert a result keyed by its rule UID; the rule must already be present.
    pub fn add_result(&mut self, result: CheckResult) -> AuditResult<()> {
        if !self.rules.contains_key(&result.rule_uid) {
            return Err(AuditError::OrphanResult {
                uid: result.rule_uid,
            });
        }
        self.results.insert(result.rule_uid.clone(), result);
        Ok(())
    }

    pub fn rules(&self) -> &BTreeMap<String, Rule> {
        &self.rules
    }

    pub fn results(&self) -> &BTreeMap<String, CheckResult> {
        &self.results
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    pub fn set_properties(&mut self, properties: Properties) {
        self.properties = properties;
    }

    /// Results that are neither skipped nor passed, paired with their rule.
    pub fn violations(&self) -> impl Iterator<Item = (&Rule, &CheckResult)> {
        self.results
            .values()
            .filter(|result| result.is_violation())
            .filter_map(|result| self.rules.get(&result.rule_uid).map(|rule| (rule, result)))
    }

    /// Union of all reports; on UID collision the later report wins.
    ///
    /// Property keys survive only when every report carrying them agrees on the
    /// value, so the merge stays commutative for disjoint rule sets.
    pub fn merge<I>(reports: I) -> Self
    where
        I: IntoIterator<Item = Report>,
    {
        let mut merged = Self::default();
        let mut conflicting = BTreeSet::new();
        for report in reports {
            merged.rules.extend(report.rules);
            merged.results.extend(report.results);
            for (key, value) in report.properties {
                match merged.properties.get(&key) {
                    Some(existing) if *existing != value => {
                        conflicting.insert(key);
                    }
                    Some(_) => {}
                    None => {
                        merged.properties.insert(key, value);
                    }
                }
            }
        }
        for key in conflicting {
            merged.properties.remove(&key);
        }
        merged
    }
}

/// Solutions produced by a policy query; emptiness is the only signal consumed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultSet {
    solutions: Vec<Value>,
}

impl ResultSet {
    pub fn new(solutions: Vec<Value>) -> Self {
        Self { solutions }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.solutions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.solutions.len()
    }

    pub fn solutions(&self) -> &[Value] {
        &self.solutions
    }
}

/// Evaluates boolean queries against an input and a compiled rule set.
///
/// Implementations are shared read-only across concurrent checks.
#[async_trait]
pub trait PolicyBackend: Send + Sync {
    /// Run `query` against `input`; the result set is non-empty iff the query has a solution.
    async fn evaluate(&self, query: &str, input: &Value) -> AnyResult<ResultSet>;
}
