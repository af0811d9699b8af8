use serde::Serialize;
use serde_json::json;
use tracing::{debug, instrument};

use super::PolicyModule;
use crate::audit::PolicyBackend;

const TEST_PREFIX: &str = "test_";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase", tag = "outcome", content = "message")]
pub enum TestOutcome {
    Pass,
    Fail,
    Error(String),
}

/// Result of one `test_*` rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PolicyTestResult {
    pub package: String,
    pub name: String,
    #[serde(flatten)]
    pub outcome: TestOutcome,
}

impl PolicyTestResult {
    pub fn passed(&self) -> bool {
        self.outcome == TestOutcome::Pass
    }
}

/// Evaluate every `test_*` rule against an empty input. A test passes when its rule has a solution.
#[instrument(skip_all, fields(modules = modules.len()))]
pub async fn run_policy_tests<B>(modules: &[PolicyModule], backend: &B) -> Vec<PolicyTestResult>
where
    B: PolicyBackend + ?Sized,
{
    let input = json!({});
    let mut results = Vec::new();
    for module in modules {
        for name in module.rules.iter().filter(|r| r.starts_with(TEST_PREFIX)) {
            let query = module.rule_path(name);
            let outcome = match backend.evaluate(&query, &input).await {
                Ok(solutions) if solutions.is_empty() => TestOutcome::Fail,
                Ok(_) => TestOutcome::Pass,
                Err(err) => TestOutcome::Error(format!("{err:#}")),
            };
            debug!(%query, ?outcome, "policy test finished");
            results.push(PolicyTestResult {
                package: module.package.clone(),
                name: name.clone(),
                outcome,
            });
        }
    }
    results
}
