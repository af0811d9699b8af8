use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;
use tracing::{debug, trace, warn};

use super::Rule;
use crate::policy::{Annotation, PolicyModule};

const TAGS_KEY: &str = "tags";
const SECURITY_SEVERITY_KEY: &str = "security-severity";

/// Every auditable rule of a compiled policy set, grouped by namespace.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuleSet {
    namespaces: BTreeMap<String, BTreeMap<String, Rule>>,
}

impl RuleSet {
    /// Extract rules from all modules; a UID declared twice keeps the last extraction.
    pub fn from_modules(modules: &[PolicyModule]) -> Self {
        let mut set = Self::default();
        for module in modules {
            let rules = extract_rules(module);
            debug!(
                namespace = module.namespace(),
                path = %module.path.display(),
                count = rules.len(),
                "extracted rules"
            );
            set.namespaces
                .entry(module.namespace().to_string())
                .or_default()
                .extend(rules);
        }
        set
    }

    /// Rules that apply to inputs of `namespace`, ordered by UID.
    pub fn rules_for(&self, namespace: &str) -> Vec<Rule> {
        self.namespaces
            .get(namespace)
            .map(|rules| rules.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn namespaces(&self) -> impl Iterator<Item = &str> {
        self.namespaces.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.namespaces.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Turn the `<kind>_<id>` rule declarations of one module into rules keyed by UID.
///
/// Declarations without a known kind prefix are skipped.
pub fn extract_rules(module: &PolicyModule) -> BTreeMap<String, Rule> {
    let mut rules = BTreeMap::new();
    for head in &module.rules {
        let Some((prefix, id)) = split_head(head) else {
            trace!(head, "ignoring rule without kind prefix");
            continue;
        };
        let mut rule = match Rule::new(module.namespace(), prefix, id) {
            Ok(rule) => rule,
            Err(err) => {
                trace!(head, %err, "ignoring rule");
                continue;
            }
        };
        if let Some(annotation) = module.rule_annotation(head) {
            apply_annotation(&mut rule, annotation);
        }
        rules.insert(rule.uid(), rule);
    }
    rules
}

fn split_head(head: &str) -> Option<(&str, &str)> {
    let (prefix, id) = head.split_once('_')?;
    if prefix.is_empty() || id.is_empty() {
        return None;
    }
    Some((prefix, id))
}

fn apply_annotation(rule: &mut Rule, annotation: &Annotation) {
    if let Some(title) = non_blank(annotation.title.as_deref()) {
        rule.title = title.to_string();
    }
    rule.description = non_blank(annotation.description.as_deref())
        .map(str::to_string)
        .unwrap_or_else(|| rule.title.clone());
    if let Some(tags) = annotation.custom.get(TAGS_KEY) {
        rule.tags = parse_tags(tags);
    }
    if let Some(value) = annotation.custom.get(SECURITY_SEVERITY_KEY) {
        match parse_security_severity(value) {
            Some(severity) => rule.security_severity = severity,
            None => warn!(
                rule = %rule.uid(),
                %value,
                default = rule.security_severity,
                "ignoring invalid security severity"
            ),
        }
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

fn parse_tags(value: &Value) -> BTreeSet<String> {
    match value {
        Value::String(tag) => BTreeSet::from([tag.clone()]),
        Value::Array(items) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        _ => BTreeSet::new(),
    }
}

/// Numbers and numeric strings within `0.0..=10.0`; anything else is rejected.
fn parse_security_severity(value: &Value) -> Option<f64> {
    let severity = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }?;
    (severity.is_finite() && (0.0..=10.0).contains(&severity)).then_some(severity)
}
