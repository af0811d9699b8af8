use anyhow::Result;
use std::collections::HashMap;

/// Environment-driven configuration for the GitHub API client used by policy builtins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitHubSettings {
    pub api_url: String,
    pub token: Option<String>,
    pub timeout_secs: Option<u64>,
}

impl Default for GitHubSettings {
    fn default() -> Self {
        Self {
            api_url: Self::DEFAULT_API_URL.to_string(),
            token: None,
            timeout_secs: None,
        }
    }
}

impl GitHubSettings {
    pub const DEFAULT_API_URL: &'static str = "https://api.github.com";
    const API_URL_ENV: [&'static str; 2] = ["GITHUB_API_URL", "GH_API_URL"];
    const TOKEN_ENV: [&'static str; 2] = ["GITHUB_TOKEN", "GH_TOKEN"];
    const TIMEOUT_ENV: &'static str = "REPOAUDIT_GITHUB_TIMEOUT_SECS";

    /// Load settings from environment variables.
    ///
    /// * `GITHUB_API_URL` / `GH_API_URL`: API base URL (default: `https://api.github.com`).
    /// * `GITHUB_TOKEN` / `GH_TOKEN`: optional token; requests are anonymous without it.
    /// * `REPOAUDIT_GITHUB_TIMEOUT_SECS`: optional request timeout.
    pub fn from_env() -> Result<Self> {
        Ok(Self::from_map(std::env::vars().collect()))
    }

    fn from_map(vars: HashMap<String, String>) -> Self {
        let first = |keys: &[&str]| {
            keys.iter()
                .filter_map(|key| vars.get(*key))
                .map(|v| v.trim().to_string())
                .find(|v| !v.is_empty())
        };
        Self {
            api_url: first(&Self::API_URL_ENV)
                .unwrap_or_else(|| Self::DEFAULT_API_URL.to_string()),
            token: first(&Self::TOKEN_ENV),
            timeout_secs: vars
                .get(Self::TIMEOUT_ENV)
                .and_then(|v| v.trim().parse::<u64>().ok()),
        }
    }
}
