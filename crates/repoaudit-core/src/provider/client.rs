use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde_json::{json, Map, Value};
use tracing::debug;

use super::GitHubSettings;

static PATH_PARAM_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{([A-Za-z_]+)\}").expect("path parameter pattern is valid"));

/// Thin GitHub API client backing the `github.request` and `github.graphql` policy builtins.
#[derive(Debug, Clone)]
pub struct GitHubClient {
    http: Client,
    base_url: String,
    token: Option<String>,
}

impl GitHubClient {
    pub fn new(settings: &GitHubSettings) -> Result<Self> {
        let mut builder = Client::builder().user_agent(concat!("repoaudit/", env!("CARGO_PKG_VERSION")));
        if let Some(secs) = settings.timeout_secs {
            builder = builder.timeout(Duration::from_secs(secs));
        }
        let http = builder.build().context("failed to build GitHub HTTP client")?;
        Ok(Self {
            http,
            base_url: settings.api_url.trim_end_matches('/').to_string(),
            token: settings.token.clone(),
        })
    }

    /// Perform a `"GET /path/{param}"` style request.
    ///
    /// Placeholders are filled from `params`; the remaining entries become the
    /// query string. Returns `{"status": <code>, "body": <json>}`.
    pub async fn request(&self, route: &str, params: &Map<String, Value>) -> Result<Value> {
        let (method, path) = split_route(route)?;
        if method != "GET" {
            bail!("only GET requests are supported, got `{method}`");
        }
        let (path, query) = build_path(path, params)?;
        let url = format!("{}{}", self.base_url, path);
        debug!(%url, "github request");

        let request = self.http.get(&url).query(&query);
        self.send(request, &url).await
    }

    /// POST a GraphQL document to `<api_url>/graphql`.
    ///
    /// Returns `{"status": <code>, "body": <json>}` like [`GitHubClient::request`].
    pub async fn graphql(&self, query: &str, variables: &Map<String, Value>) -> Result<Value> {
        let url = format!("{}/graphql", self.base_url);
        debug!(%url, "github graphql request");
        let request = self.http.post(&url).json(&json!({
            "query": query,
            "variables": variables,
        }));
        self.send(request, &url).await
    }

    async fn send(&self, request: RequestBuilder, url: &str) -> Result<Value> {
        let mut request = request.header("Accept", "application/vnd.github+json");
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("failed to call GitHub API at {url}"))?;
        let status = response.status();
        let body: Value = response
            .json()
            .await
            .context("failed to parse GitHub API response")?;

        if status == StatusCode::FORBIDDEN {
            let message = body
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("no message");
            bail!("forbidden: {message}");
        }

        Ok(json!({
            "status": status.as_u16(),
            "body": body,
        }))
    }
}

fn split_route(route: &str) -> Result<(String, &str)> {
    let mut parts = route.split_whitespace();
    match (parts.next(), parts.next(), parts.next()) {
        (Some(method), Some(path), None) => Ok((method.to_ascii_uppercase(), path)),
        _ => bail!("expected `METHOD /path`, got `{route}`"),
    }
}

fn build_path(path: &str, params: &Map<String, Value>) -> Result<(String, Vec<(String, String)>)> {
    let mut remaining = params.clone();
    let mut missing = None;
    let filled = PATH_PARAM_RE.replace_all(path, |caps: &regex::Captures<'_>| {
        let name = &caps[1];
        match remaining.remove(name).as_ref().map(scalar_to_string) {
            Some(Ok(value)) => value,
            Some(Err(err)) => {
                missing.get_or_insert(err);
                String::new()
            }
            None => {
                missing.get_or_insert(anyhow!("missing value for path parameter `{name}`"));
                String::new()
            }
        }
    });
    if let Some(err) = missing {
        return Err(err);
    }
    let query = remaining
        .iter()
        .map(|(key, value)| Ok((key.clone(), scalar_to_string(value)?)))
        .collect::<Result<Vec<_>>>()?;
    Ok((filled.into_owned(), query))
}

fn scalar_to_string(value: &Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => bail!("can't use `{other}` as a request parameter"),
    }
}
