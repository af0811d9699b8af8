use std::sync::Arc;

use serde_json::Value;
use tracing::{instrument, trace};

use super::{query::QueryPlan, CheckResult, PolicyBackend, ResultSet, Rule};
use crate::error::{AuditError, AuditResult, CheckPhase};

/// Runs the skip/check protocol for one rule against one input.
pub struct Checker<B: ?Sized> {
    backend: Arc<B>,
}

impl<B: ?Sized> Clone for Checker<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
        }
    }
}

impl<B> Checker<B>
where
    B: PolicyBackend + ?Sized,
{
    pub fn new(backend: Arc<B>) -> Self {
        Self { backend }
    }

    /// A skip solution short-circuits; otherwise the rule passes iff the check-query has no solution.
    #[instrument(name = "check_rule", skip(self, rule, input), fields(uid = %rule.uid()))]
    pub async fn check(&self, rule: &Rule, input: &Value) -> AuditResult<CheckResult> {
        let plan = QueryPlan::for_rule(rule);

        let skip = self.evaluate(&plan.skip, input, CheckPhase::Skip).await?;
        if !skip.is_empty() {
            trace!("rule skipped");
            return Ok(CheckResult::skipped(rule, plan.check));
        }

        let violations = self.evaluate(&plan.check, input, CheckPhase::Check).await?;
        let passed = violations.is_empty();
        trace!(passed, "rule evaluated");
        Ok(CheckResult::evaluated(rule, plan.check, passed))
    }

    async fn evaluate(&self, query: &str, input: &Value, phase: CheckPhase) -> AuditResult<ResultSet> {
        trace!(%phase, query, "evaluating query");
        self.backend
            .evaluate(query, input)
            .await
            .map_err(|source| AuditError::BackendEvaluation {
                query: query.to_string(),
                phase,
                source,
            })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use anyhow::Result as AnyResult;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// Backend answering from fixed sets of solvable and failing queries, recording every call.
    #[derive(Default)]
    pub(crate) struct ScriptedBackend {
        pub solvable: HashSet<String>,
        pub failing: HashSet<String>,
        pub calls: Mutex<Vec<String>>,
    }

    impl ScriptedBackend {
        pub(crate) fn solving<I: IntoIterator<Item = String>>(queries: I) -> Self {
            Self {
                solvable: queries.into_iter().collect(),
                ..Self::default()
            }
        }

        pub(crate) fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PolicyBackend for ScriptedBackend {
        async fn evaluate(&self, query: &str, _input: &Value) -> AnyResult<ResultSet> {
            self.calls.lock().unwrap().push(query.to_string());
            if self.failing.contains(query) {
                anyhow::bail!("backend exploded");
            }
            if self.solvable.contains(query) {
                Ok(ResultSet::new(vec![json!(true)]))
            } else {
                Ok(ResultSet::empty())
            }
        }
    }

    fn rule() -> Rule {
        Rule::new("pull_request", "error", "has_description").unwrap()
    }

    #[tokio::test]
    async fn skip_takes_precedence_and_check_is_never_run() {
        let plan = QueryPlan::for_rule(&rule());
        let backend = Arc::new(ScriptedBackend::solving([plan.skip.clone(), plan.check.clone()]));
        let result = Checker::new(Arc::clone(&backend))
            .check(&rule(), &json!({}))
            .await
            .unwrap();

        assert!(result.skipped);
        assert!(!result.passed);
        assert_eq!(backend.calls(), vec![plan.skip]);
    }

    #[tokio::test]
    async fn check_solution_means_failure() {
        let plan = QueryPlan::for_rule(&rule());
        let backend = Arc::new(ScriptedBackend::solving([plan.check.clone()]));
        let result = Checker::new(Arc::clone(&backend))
            .check(&rule(), &json!({"base": "main", "head": "feat"}))
            .await
            .unwrap();

        assert!(!result.skipped);
        assert!(!result.passed);
        assert_eq!(result.query, plan.check);
        assert_eq!(backend.calls().len(), 2);
    }

    #[tokio::test]
    async fn no_solution_means_pass() {
        let backend = Arc::new(ScriptedBackend::default());
        let result = Checker::new(backend).check(&rule(), &json!({})).await.unwrap();
        assert!(!result.skipped);
        assert!(result.passed);
        assert_eq!(result.rule_uid, "pull_request/error/has_description");
    }

    #[tokio::test]
    async fn backend_errors_carry_the_phase() {
        let plan = QueryPlan::for_rule(&rule());
        let backend = Arc::new(ScriptedBackend {
            failing: HashSet::from([plan.check.clone()]),
            ..ScriptedBackend::default()
        });
        let err = Checker::new(backend)
            .check(&rule(), &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AuditError::BackendEvaluation { phase: CheckPhase::Check, ref query, .. } if *query == plan.check
        ));
    }
}
