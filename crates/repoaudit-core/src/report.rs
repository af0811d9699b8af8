use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::audit::{CheckResult, Properties, Report, Rule};
use crate::error::{AuditError, AuditResult};

const SARIF_SCHEMA: &str = "https://json.schemastore.org/sarif-2.1.0.json";
const SARIF_VERSION: &str = "2.1.0";
const TOOL_NAME: &str = "repoaudit";
const TOOL_URI: &str = "https://github.com/repoaudit/repoaudit";

/// Format styles supported by the renderer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Json,
    #[default]
    Sarif,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "sarif" => Ok(Self::Sarif),
            other => Err(format!("unknown output format `{other}` (expected json or sarif)")),
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Json => f.write_str("json"),
            Self::Sarif => f.write_str("sarif"),
        }
    }
}

/// Produce a report string from a `Report` using the desired format.
pub fn render_report(report: &Report, format: OutputFormat) -> AuditResult<String> {
    render_reports(std::slice::from_ref(report), format)
}

/// Render a batch. JSON yields a single object for one report and an array
/// otherwise; SARIF yields one run per report.
pub fn render_reports(reports: &[Report], format: OutputFormat) -> AuditResult<String> {
    for report in reports {
        validate(report)?;
    }
    let document = match format {
        OutputFormat::Json => match reports {
            [single] => to_value(JsonReport::from(single))?,
            many => to_value(many.iter().map(JsonReport::from).collect::<Vec<_>>())?,
        },
        OutputFormat::Sarif => sarif_document(reports)?,
    };
    serde_json::to_string_pretty(&document).map_err(|err| AuditError::Render(err.to_string()))
}

fn to_value<T: Serialize>(value: T) -> AuditResult<Value> {
    serde_json::to_value(value).map_err(|err| AuditError::Render(err.to_string()))
}

fn validate(report: &Report) -> AuditResult<()> {
    for rule in report.rules().values() {
        rule.validate()
            .map_err(|err| AuditError::Render(err.to_string()))?;
    }
    if let Some(orphan) = report
        .results()
        .keys()
        .find(|uid| !report.rules().contains_key(*uid))
    {
        return Err(AuditError::Render(format!(
            "result `{orphan}` has no matching rule"
        )));
    }
    Ok(())
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct JsonReport<'a> {
    rules: BTreeMap<&'a str, JsonRule<'a>>,
    results: &'a BTreeMap<String, CheckResult>,
    rule_count: usize,
    properties: &'a Properties,
}

#[derive(Debug, Serialize)]
struct JsonRule<'a> {
    id: &'a str,
    namespace: &'a str,
    severity: &'static str,
    #[serde(rename = "security-severity")]
    security_severity: f64,
    title: &'a str,
    description: &'a str,
    tags: Vec<&'a str>,
}

impl<'a> From<&'a Report> for JsonReport<'a> {
    fn from(report: &'a Report) -> Self {
        Self {
            rules: report
                .rules()
                .iter()
                .map(|(uid, rule)| (uid.as_str(), JsonRule::from(rule)))
                .collect(),
            results: report.results(),
            rule_count: report.rule_count(),
            properties: report.properties(),
        }
    }
}

impl<'a> From<&'a Rule> for JsonRule<'a> {
    fn from(rule: &'a Rule) -> Self {
        Self {
            id: &rule.id,
            namespace: &rule.namespace,
            severity: rule.severity().as_str(),
            security_severity: rule.security_severity,
            title: &rule.title,
            description: &rule.description,
            tags: rule.tags.iter().map(String::as_str).collect(),
        }
    }
}

fn sarif_document(reports: &[Report]) -> AuditResult<Value> {
    let runs = reports.iter().map(sarif_run).collect::<AuditResult<Vec<_>>>()?;
    Ok(json!({
        "$schema": SARIF_SCHEMA,
        "version": SARIF_VERSION,
        "runs": runs,
    }))
}

fn sarif_run(report: &Report) -> AuditResult<Value> {
    let index: BTreeMap<&str, usize> = report
        .rules()
        .keys()
        .enumerate()
        .map(|(i, uid)| (uid.as_str(), i))
        .collect();
    let rules: Vec<Value> = report.rules().values().map(sarif_rule).collect();

    let mut results = Vec::new();
    for (rule, result) in report.violations() {
        let uid = result.rule_uid.as_str();
        let rule_index = index
            .get(uid)
            .copied()
            .ok_or_else(|| AuditError::Render(format!("result `{uid}` has no matching rule")))?;
        results.push(json!({
            "ruleId": uid,
            "ruleIndex": rule_index,
            "level": rule.severity().as_str(),
            "message": {
                "text": rule.title,
            },
            "locations": [{
                "physicalLocation": {
                    "artifactLocation": {
                        "uri": "."
                    }
                }
            }]
        }));
    }

    let mut run = json!({
        "tool": {
            "driver": {
                "name": TOOL_NAME,
                "informationUri": TOOL_URI,
                "version": env!("CARGO_PKG_VERSION"),
                "rules": rules,
            }
        },
        "results": results,
    });
    if !report.properties().is_empty() {
        run["properties"] = Value::Object(report.properties().clone());
    }
    Ok(run)
}

fn sarif_rule(rule: &Rule) -> Value {
    json!({
        "id": rule.uid(),
        "name": rule.title,
        "shortDescription": {
            "text": rule.title,
        },
        "fullDescription": {
            "text": rule.description,
            "markdown": rule.description,
        },
        "help": {
            "text": rule.description,
            "markdown": rule.description,
        },
        "defaultConfiguration": {
            "level": rule.severity().as_str(),
        },
        "properties": {
            "tags": rule.tags,
            "security-severity": format!("{:.1}", rule.security_severity),
        }
    })
}
