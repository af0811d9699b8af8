use super::Rule;

/// The two queries issued for a rule: is it skipped, and is it violated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryPlan {
    pub skip: String,
    pub check: String,
}

impl QueryPlan {
    pub fn for_rule(rule: &Rule) -> Self {
        Self {
            skip: skip_query(rule),
            check: check_query(rule),
        }
    }
}

/// Membership test against the namespace-level `skip` collection.
pub fn skip_query(rule: &Rule) -> String {
    format!(
        "data.{}.skip[_][_] == {}",
        rule.namespace,
        rego_string(&rule.id)
    )
}

/// Reference to the rule body; any solution means the input violates the rule.
pub fn check_query(rule: &Rule) -> String {
    format!("data.{}.{}", rule.namespace, rule.head_name())
}

// JSON string literals are valid Rego string literals.
fn rego_string(value: &str) -> String {
    serde_json::Value::String(value.to_string()).to_string()
}
