use std::sync::Arc;

use anyhow::{bail, Context};
use once_cell::sync::Lazy;
use serde_json::Value;
use tokio::runtime::Handle;

use super::{
    client::GitHubClient, project_properties, Builtin, NamespaceTable, PropertyTemplate, Provider,
    Record,
};
use crate::audit::Properties;
use crate::error::{AuditError, AuditResult};

static NAMESPACES: Lazy<NamespaceTable> = Lazy::new(|| {
    NamespaceTable::new(&[
        ("issue", &["reactions", "closed_by"]),
        ("pull_request", &["base", "head"]),
        ("repository", &["owner", "full_name"]),
        ("organization", &["login", "members_url"]),
        ("user", &["login", "hireable"]),
    ])
});

const PROPERTY_TEMPLATES: &[(&str, PropertyTemplate)] = &[
    ("issue", &[("id", "id"), ("number", "number")]),
    ("pull_request", &[("id", "id"), ("number", "number")]),
    (
        "repository",
        &[
            ("owner", "owner.login"),
            ("repo", "name"),
            ("default_branch", "default_branch"),
        ],
    ),
    ("organization", &[("login", "login"), ("name", "name")]),
    ("user", &[("login", "login"), ("name", "name")]),
];

/// GitHub REST resources: issues, pull requests, repositories, organizations and users.
#[derive(Debug, Clone, Default)]
pub struct GitHub {
    client: Option<Arc<GitHubClient>>,
}

impl GitHub {
    /// Provider whose policies may call `github.request` and `github.graphql` through `client`.
    pub fn new(client: GitHubClient) -> Self {
        Self {
            client: Some(Arc::new(client)),
        }
    }

    fn request_builtin(client: Arc<GitHubClient>) -> Builtin {
        Builtin::new("github.request", 2, move |args: Vec<Value>| {
            let [route, params] = args.as_slice() else {
                bail!("github.request expects 2 arguments, got {}", args.len());
            };
            let Some(route) = route.as_str() else {
                bail!("github.request route must be a string");
            };
            let params = params.as_object().cloned().unwrap_or_default();
            let handle = Handle::try_current().context("github.request needs a tokio runtime")?;
            handle.block_on(client.request(route, &params))
        })
    }

    fn graphql_builtin(client: Arc<GitHubClient>) -> Builtin {
        Builtin::new("github.graphql", 2, move |args: Vec<Value>| {
            let [query, variables] = args.as_slice() else {
                bail!("github.graphql expects 2 arguments, got {}", args.len());
            };
            let Some(query) = query.as_str() else {
                bail!("github.graphql query must be a string");
            };
            let variables = variables.as_object().cloned().unwrap_or_default();
            let handle = Handle::try_current().context("github.graphql needs a tokio runtime")?;
            handle.block_on(client.graphql(query, &variables))
        })
    }
}

impl Provider for GitHub {
    fn name(&self) -> &str {
        "github"
    }

    fn derive_namespace(&self, record: &Record) -> AuditResult<String> {
        NAMESPACES.detect(record)
    }

    fn derive_properties(&self, namespace: &str, record: &Record) -> AuditResult<Properties> {
        PROPERTY_TEMPLATES
            .iter()
            .find(|(candidate, _)| *candidate == namespace)
            .map(|(_, template)| project_properties(template, record))
            .ok_or_else(|| AuditError::UnknownReportProperties {
                namespace: namespace.to_string(),
            })
    }

    fn builtins(&self) -> Vec<Builtin> {
        self.client
            .iter()
            .flat_map(|client| {
                [
                    Self::request_builtin(Arc::clone(client)),
                    Self::graphql_builtin(Arc::clone(client)),
                ]
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::GitHubSettings;
    use httpmock::prelude::*;
    use serde_json::json;

    fn record(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn detects_each_namespace() {
        let gh = GitHub::default();
        let cases = [
            (json!({"reactions": {}, "closed_by": null}), "issue"),
            (json!({"base": "main", "head": "feat"}), "pull_request"),
            (json!({"owner": {"login": "acme"}, "full_name": "acme/w"}), "repository"),
            (json!({"login": "acme", "members_url": "u"}), "organization"),
            (json!({"login": "octocat", "hireable": true}), "user"),
        ];
        for (input, expected) in cases {
            assert_eq!(gh.derive_namespace(&record(input)).unwrap(), expected);
        }
    }

    #[test]
    fn overlapping_inputs_resolve_in_declaration_order() {
        let gh = GitHub::default();
        let ns = gh
            .derive_namespace(&record(json!({"login": "x", "members_url": "u", "hireable": false})))
            .unwrap();
        assert_eq!(ns, "organization");
    }

    #[test]
    fn unknown_shapes_fail() {
        let gh = GitHub::default();
        assert!(matches!(
            gh.derive_namespace(&record(json!({"base": "main"}))),
            Err(AuditError::UnknownNamespace)
        ));
    }

    #[test]
    fn repository_properties_flatten_owner() {
        let gh = GitHub::default();
        let props = gh
            .derive_properties(
                "repository",
                &record(json!({
                    "owner": {"login": "acme"},
                    "name": "widgets",
                    "full_name": "acme/widgets",
                    "default_branch": "main"
                })),
            )
            .unwrap();
        assert_eq!(
            Value::Object(props),
            json!({"owner": "acme", "repo": "widgets", "default_branch": "main"})
        );
    }

    #[test]
    fn namespaces_without_template_fail() {
        let err = GitHub::default()
            .derive_properties("gitlab.project", &Record::new())
            .unwrap_err();
        assert!(matches!(err, AuditError::UnknownReportProperties { .. }));
    }

    #[test]
    fn builtins_require_a_client() {
        assert!(GitHub::default().builtins().is_empty());
        let gh = GitHub::new(GitHubClient::new(&GitHubSettings::default()).unwrap());
        let builtins = gh.builtins();
        let names: Vec<_> = builtins.iter().map(|b| (b.name.as_str(), b.arity)).collect();
        assert_eq!(names, vec![("github.request", 2), ("github.graphql", 2)]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn request_builtin_calls_the_api_from_blocking_code() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/repos/acme/widgets").query_param("per_page", "1");
                then.status(200).json_body(json!({"private": false}));
            })
            .await;

        let client = GitHubClient::new(&GitHubSettings {
            api_url: server.base_url(),
            ..GitHubSettings::default()
        })
        .unwrap();
        let builtin = GitHub::new(client).builtins().remove(0);
        let response = tokio::task::spawn_blocking(move || {
            builtin.call(vec![
                json!("GET /repos/{owner}/{repo}"),
                json!({"owner": "acme", "repo": "widgets", "per_page": 1}),
            ])
        })
        .await
        .unwrap()
        .unwrap();

        assert_eq!(response, json!({"status": 200, "body": {"private": false}}));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn graphql_builtin_posts_query_and_variables() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/graphql").json_body(json!({
                    "query": "{ repository(owner: $o) { isPrivate } }",
                    "variables": {"o": "acme"}
                }));
                then.status(200)
                    .json_body(json!({"data": {"repository": {"isPrivate": true}}}));
            })
            .await;

        let client = GitHubClient::new(&GitHubSettings {
            api_url: server.base_url(),
            ..GitHubSettings::default()
        })
        .unwrap();
        let builtin = GitHub::new(client)
            .builtins()
            .into_iter()
            .find(|b| b.name == "github.graphql")
            .unwrap();
        let response = tokio::task::spawn_blocking(move || {
            builtin.call(vec![
                json!("{ repository(owner: $o) { isPrivate } }"),
                json!({"o": "acme"}),
            ])
        })
        .await
        .unwrap()
        .unwrap();

        mock.assert_async().await;
        assert_eq!(
            response,
            json!({"status": 200, "body": {"data": {"repository": {"isPrivate": true}}}})
        );
    }
}
