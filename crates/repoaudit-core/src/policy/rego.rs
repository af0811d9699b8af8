use std::sync::Arc;

use anyhow::{anyhow, Context, Result as AnyResult};
use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, trace};

use super::PolicyModule;
use crate::audit::{PolicyBackend, ResultSet};
use crate::error::{AuditError, AuditResult};
use crate::provider::Builtin;

/// Policy backend over the `regorus` Rego interpreter.
///
/// The compiled engine is immutable once built; each evaluation works on its
/// own clone so concurrent checks never share interpreter state.
#[derive(Clone)]
pub struct RegoBackend {
    engine: Arc<regorus::Engine>,
    trace: bool,
}

impl RegoBackend {
    /// Compile `modules` and register provider `builtins` on a fresh engine.
    pub fn compile(modules: &[PolicyModule], builtins: &[Builtin]) -> AuditResult<Self> {
        let mut engine = regorus::Engine::new();
        for module in modules {
            let package = engine
                .add_policy(module.path.display().to_string(), module.source.clone())
                .map_err(|err| AuditError::PolicyLoad {
                    path: module.path.clone(),
                    source: anyhow!("{err}"),
                })?;
            // Rule extraction and query planning go by the loader's package.
            let compiled = package.strip_prefix("data.").unwrap_or(&package);
            if compiled != module.package {
                return Err(AuditError::PolicyLoad {
                    path: module.path.clone(),
                    source: anyhow!(
                        "engine compiled package `{compiled}` but the module declares `{}`",
                        module.package
                    ),
                });
            }
        }
        for builtin in builtins {
            register_builtin(&mut engine, builtin).map_err(|source| AuditError::PolicyLoad {
                path: builtin.name.clone().into(),
                source,
            })?;
        }
        debug!(
            modules = modules.len(),
            builtins = builtins.len(),
            "compiled policy engine"
        );
        Ok(Self {
            engine: Arc::new(engine),
            trace: false,
        })
    }

    /// Enable interpreter tracing for every evaluation.
    pub fn with_tracing(mut self, enabled: bool) -> Self {
        self.trace = enabled;
        self
    }
}

fn register_builtin(engine: &mut regorus::Engine, builtin: &Builtin) -> AnyResult<()> {
    let builtin = builtin.clone();
    let name = builtin.name.clone();
    let arity = builtin.arity;
    engine
        .add_extension(
            name,
            arity,
            Box::new(move |args: Vec<regorus::Value>| {
                let args = args
                    .iter()
                    .map(to_json)
                    .collect::<AnyResult<Vec<_>>>()?;
                let output = builtin.call(args)?;
                from_json(&output)
            }),
        )
        .map_err(|err| anyhow!("failed to register builtin: {err}"))
}

fn to_json(value: &regorus::Value) -> AnyResult<Value> {
    serde_json::to_value(value).context("failed to convert policy value to JSON")
}

fn from_json(value: &Value) -> AnyResult<regorus::Value> {
    regorus::Value::from_json_str(&value.to_string())
        .map_err(|err| anyhow!("failed to convert JSON to policy value: {err}"))
}

/// A solution counts only when every expression is defined and not `false`.
fn is_solution(result: &regorus::QueryResult) -> bool {
    result.expressions.iter().all(|expr| {
        !matches!(
            expr.value,
            regorus::Value::Undefined | regorus::Value::Bool(false)
        )
    })
}

fn evaluate_blocking(
    engine: &regorus::Engine,
    query: String,
    input: &str,
    trace: bool,
) -> AnyResult<ResultSet> {
    let mut engine = engine.clone();
    let input = regorus::Value::from_json_str(input).map_err(|err| anyhow!("invalid input: {err}"))?;
    engine.set_input(input);
    let results = engine
        .eval_query(query, trace)
        .map_err(|err| anyhow!("{err}"))?;
    let solutions = results
        .result
        .iter()
        .filter(|result| is_solution(result))
        .map(|result| {
            let values: Vec<&regorus::Value> = result.expressions.iter().map(|e| &e.value).collect();
            serde_json::to_value(values).context("failed to convert query result to JSON")
        })
        .collect::<AnyResult<Vec<_>>>()?;
    Ok(ResultSet::new(solutions))
}

#[async_trait]
impl PolicyBackend for RegoBackend {
    async fn evaluate(&self, query: &str, input: &Value) -> AnyResult<ResultSet> {
        trace!(query, "evaluating");
        let engine = Arc::clone(&self.engine);
        let query = query.to_string();
        let input = input.to_string();
        let trace = self.trace;
        tokio::task::spawn_blocking(move || evaluate_blocking(&engine, query, &input, trace))
            .await
            .context("policy evaluation task failed")?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::loader::parse_module;
    use serde_json::json;
    use std::path::Path;

    const POLICY: &str = r#"package pull_request

import future.keywords.contains
import future.keywords.if

error_has_description if {
	not input.description
}

warn_large if {
	input.additions > 1000
}

skip contains ["large"] if {
	input.draft == true
}
"#;

    fn backend(builtins: &[Builtin]) -> RegoBackend {
        let module = parse_module(Path::new("pull_request.rego"), POLICY.to_string()).unwrap();
        RegoBackend::compile(&[module], builtins).unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn defined_rule_yields_a_solution() {
        let backend = backend(&[]);
        let rs = backend
            .evaluate("data.pull_request.error_has_description", &json!({"base": "main"}))
            .await
            .unwrap();
        assert!(!rs.is_empty());

        let rs = backend
            .evaluate(
                "data.pull_request.error_has_description",
                &json!({"description": "adds things"}),
            )
            .await
            .unwrap();
        assert!(rs.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn skip_membership_query() {
        let backend = backend(&[]);
        let query = r#"data.pull_request.skip[_][_] == "large""#;
        assert!(!backend.evaluate(query, &json!({"draft": true})).await.unwrap().is_empty());
        assert!(backend.evaluate(query, &json!({"draft": false})).await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn false_comparisons_are_not_solutions() {
        let backend = backend(&[]);
        assert!(backend.evaluate("1 == 2", &json!({})).await.unwrap().is_empty());
        assert!(!backend.evaluate("1 == 1", &json!({})).await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn builtins_are_callable_from_policies() {
        let upper = Builtin::new("acme.upper", 1, |args: Vec<Value>| {
            Ok(json!(args[0].as_str().unwrap_or_default().to_uppercase()))
        });
        let backend = backend(&[upper]);
        let rs = backend
            .evaluate(r#"acme.upper(input.name) == "WIDGETS""#, &json!({"name": "widgets"}))
            .await
            .unwrap();
        assert!(!rs.is_empty());
    }

    #[test]
    fn dotted_packages_compile() {
        let module = parse_module(
            Path::new("mr.rego"),
            "package gitlab.merge_request\n\nwarn_x := true\n".to_string(),
        )
        .unwrap();
        assert_eq!(module.package, "gitlab.merge_request");
        assert!(RegoBackend::compile(&[module], &[]).is_ok());
    }

    #[test]
    fn package_disagreement_is_a_policy_load_error() {
        let mut module = parse_module(Path::new("pull_request.rego"), POLICY.to_string()).unwrap();
        module.package = "repository".to_string();
        let err = RegoBackend::compile(&[module], &[]).err().expect("compile should fail");
        match err {
            AuditError::PolicyLoad { path, source } => {
                assert_eq!(path, Path::new("pull_request.rego"));
                assert!(source.to_string().contains("`pull_request`"), "{source}");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn compile_errors_are_policy_load_errors() {
        let module = parse_module(
            Path::new("broken.rego"),
            "package broken\n\nerror_x if {\n".to_string(),
        )
        .unwrap();
        let err = RegoBackend::compile(&[module], &[]).err().expect("compile should fail");
        assert!(matches!(err, AuditError::PolicyLoad { .. }));
    }
}
