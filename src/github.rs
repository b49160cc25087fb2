use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use octocrab::Octocrab;
use regex::Regex;
use reqwest::header::{HeaderMap, ACCEPT, AUTHORIZATION, CONTENT_LENGTH, RETRY_AFTER, USER_AGENT};
use reqwest::{Response, StatusCode};
use serde::Deserialize;
use std::env;
use std::process::Command;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::model::{RateLimitInfo, RemoteRepo};
use crate::provider::{RepoRef, StarPage, StarProvider};

const STAR_MEDIA_TYPE: &str = "application/vnd.github.star+json";
const API_VERSION: &str = "2022-11-28";

/// GitHub client wrapper with authentication management
pub struct GitHubClient {
    http: reqwest::Client,
    api_url: String,
    token: String,
    per_page: u32,
    strategy: AuthStrategy,
}

/// GitHub authentication strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStrategy {
    /// Use GitHub CLI authentication
    GitHubCLI,
    /// Use environment variable token
    EnvironmentToken,
    /// Token stored in the config file
    ConfigToken,
}

#[derive(Debug, Deserialize)]
struct ApiOwner {
    login: String,
}

#[derive(Debug, Deserialize)]
struct ApiRepo {
    id: i64,
    name: String,
    owner: ApiOwner,
    description: Option<String>,
    language: Option<String>,
    #[serde(default)]
    topics: Vec<String>,
    #[serde(default)]
    stargazers_count: u64,
    pushed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    html_url: String,
    #[serde(default)]
    archived: bool,
    #[serde(default)]
    fork: bool,
}

/// Items come wrapped with `starred_at` when the star media type is honoured
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StarredItem {
    Timestamped {
        starred_at: DateTime<Utc>,
        repo: ApiRepo,
    },
    Plain(ApiRepo),
}

impl StarredItem {
    fn into_remote(self) -> RemoteRepo {
        let (repo, starred_at) = match self {
            StarredItem::Timestamped { starred_at, repo } => (repo, Some(starred_at)),
            StarredItem::Plain(repo) => (repo, None),
        };
        RemoteRepo {
            id: repo.id,
            owner: repo.owner.login,
            name: repo.name,
            description: repo.description,
            language: repo.language,
            topics: repo.topics,
            stars: repo.stargazers_count,
            pushed_at: repo.pushed_at,
            starred_at,
            html_url: repo.html_url,
            archived: repo.archived,
            fork: repo.fork,
        }
    }
}

fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

/// Read the `x-ratelimit-*` headers. Missing headers read as an unknown
/// window that never blocks.
pub fn parse_rate_limit(headers: &HeaderMap) -> RateLimitInfo {
    let limit = header_u64(headers, "x-ratelimit-limit");
    let remaining = header_u64(headers, "x-ratelimit-remaining");
    let reset_at = header_u64(headers, "x-ratelimit-reset")
        .and_then(|secs| Utc.timestamp_opt(secs as i64, 0).single());

    match (limit, remaining) {
        (Some(limit), Some(remaining)) => RateLimitInfo {
            limit: limit.min(u32::MAX as u64) as u32,
            remaining: remaining.min(u32::MAX as u64) as u32,
            reset_at,
        },
        _ => RateLimitInfo {
            limit: 0,
            remaining: u32::MAX,
            reset_at: None,
        },
    }
}

/// Page number of the `rel="next"` entry of a `Link` header
pub fn parse_next_page(headers: &HeaderMap) -> Option<u32> {
    static NEXT_LINK: OnceLock<Option<Regex>> = OnceLock::new();
    static PAGE_PARAM: OnceLock<Option<Regex>> = OnceLock::new();

    let link = headers.get("link")?.to_str().ok()?;
    let next_link = NEXT_LINK
        .get_or_init(|| Regex::new(r#"<([^>]+)>\s*;\s*rel="next""#).ok())
        .as_ref()?;
    let page_param = PAGE_PARAM
        .get_or_init(|| Regex::new(r"[?&]page=(\d+)").ok())
        .as_ref()?;

    let url = next_link.captures(link)?.get(1)?.as_str();
    page_param.captures(url)?.get(1)?.as_str().parse().ok()
}

impl GitHubClient {
    /// Create a new GitHub client with automatic authentication
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let (strategy, token) = Self::detect_authentication(config)?;
        info!("Using authentication strategy: {:?}", strategy);
        Self::with_token(&config.github.api_url, token, config.github.per_page, strategy)
    }

    /// Build a client for an explicit token and API root
    pub fn with_token(
        api_url: &str,
        token: impl Into<String>,
        per_page: u32,
        strategy: AuthStrategy,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http,
            api_url: api_url.trim_end_matches('/').to_string(),
            token: token.into(),
            per_page: per_page.clamp(1, 100),
            strategy,
        })
    }

    pub fn strategy(&self) -> AuthStrategy {
        self.strategy
    }

    /// Confirm the token works and return the login it belongs to
    pub async fn verify_identity(&self) -> anyhow::Result<String> {
        let client = Octocrab::builder()
            .base_uri(self.api_url.as_str())
            .context("Invalid GitHub API URL")?
            .personal_token(self.token.clone())
            .build()
            .context("Failed to create GitHub client")?;

        let user = client
            .current()
            .user()
            .await
            .context("Failed to get current user information. Check your authentication.")?;

        info!("Authenticated as GitHub user: {}", user.login);
        Ok(user.login)
    }

    /// Detect and obtain GitHub authentication
    fn detect_authentication(config: &Config) -> anyhow::Result<(AuthStrategy, String)> {
        match config.github.auth_method.as_str() {
            "auto" => {
                // Try GitHub CLI first, then environment token, then config
                if let Ok(token) = Self::try_github_cli() {
                    Ok((AuthStrategy::GitHubCLI, token))
                } else if let Ok(token) = Self::try_environment_token() {
                    Ok((AuthStrategy::EnvironmentToken, token))
                } else if let Some(token) = Self::config_token(config) {
                    Ok((AuthStrategy::ConfigToken, token))
                } else {
                    Err(anyhow!(
                        "No GitHub authentication found. Please either:\n\
                         1. Install and authenticate GitHub CLI: gh auth login\n\
                         2. Set GITHUB_TOKEN environment variable\n\
                         3. Set github.token in the starshelf config"
                    ))
                }
            }
            "gh_cli" => {
                let token = Self::try_github_cli()
                    .context("GitHub CLI authentication failed. Run: gh auth login")?;
                Ok((AuthStrategy::GitHubCLI, token))
            }
            "token" => {
                if let Ok(token) = Self::try_environment_token() {
                    Ok((AuthStrategy::EnvironmentToken, token))
                } else {
                    let token = Self::config_token(config).ok_or_else(|| {
                        anyhow!("Neither GITHUB_TOKEN nor github.token is set")
                    })?;
                    Ok((AuthStrategy::ConfigToken, token))
                }
            }
            other => Err(anyhow!("Unknown auth method: {}", other)),
        }
    }

    fn config_token(config: &Config) -> Option<String> {
        config
            .github
            .token
            .as_ref()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
    }

    /// Try to get token from GitHub CLI
    fn try_github_cli() -> anyhow::Result<String> {
        debug!("Attempting GitHub CLI authentication");

        if !Self::is_command_available("gh") {
            return Err(anyhow!("GitHub CLI (gh) is not installed"));
        }

        let token_output = Command::new("gh")
            .args(["auth", "token"])
            .output()
            .context("Failed to get GitHub CLI token")?;

        if !token_output.status.success() {
            return Err(anyhow!(
                "Failed to retrieve token from GitHub CLI: {}",
                String::from_utf8_lossy(&token_output.stderr)
            ));
        }

        let token = String::from_utf8(token_output.stdout)
            .context("GitHub CLI token is not valid UTF-8")?
            .trim()
            .to_string();

        if token.is_empty() {
            return Err(anyhow!("GitHub CLI returned empty token"));
        }

        debug!("Successfully obtained token from GitHub CLI");
        Ok(token)
    }

    /// Try to get token from environment variable
    fn try_environment_token() -> anyhow::Result<String> {
        debug!("Attempting environment variable authentication");

        let token =
            env::var("GITHUB_TOKEN").context("GITHUB_TOKEN environment variable not set")?;

        if token.is_empty() {
            return Err(anyhow!("GITHUB_TOKEN is empty"));
        }

        if !token.starts_with("ghp_")
            && !token.starts_with("gho_")
            && !token.starts_with("ghs_")
            && !token.starts_with("github_pat_")
        {
            warn!("GITHUB_TOKEN doesn't look like a GitHub token (expected ghp_, gho_, ghs_ or github_pat_ prefix)");
        }

        Ok(token)
    }

    /// Check if a command is available in PATH
    fn is_command_available(command: &str) -> bool {
        Command::new("which")
            .arg(command)
            .output()
            .map(|output| output.status.success())
            .unwrap_or(false)
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, format!("{}{}", self.api_url, path))
            .header(AUTHORIZATION, format!("Bearer {}", self.token))
            .header(USER_AGENT, concat!("starshelf/", env!("CARGO_PKG_VERSION")))
            .header("X-GitHub-Api-Version", API_VERSION)
    }

    /// Map a non-success response onto the error taxonomy
    async fn failure(response: Response, operation: String) -> Error {
        let status = response.status();
        let rate_limit = parse_rate_limit(response.headers());
        let retry_after = header_u64(response.headers(), RETRY_AFTER.as_str());
        let body = response.text().await.unwrap_or_default();
        let snippet: String = body.chars().take(200).collect();

        match status {
            StatusCode::UNAUTHORIZED => Error::AuthExpired { operation },
            StatusCode::FORBIDDEN | StatusCode::TOO_MANY_REQUESTS
                if rate_limit.remaining == 0 || retry_after.is_some() =>
            {
                let wait = match retry_after {
                    Some(secs) => Duration::from_secs(secs),
                    None => rate_limit.retry_after(Utc::now()),
                };
                Error::RateLimited {
                    retry_after: wait,
                    committed_pages: 0,
                }
            }
            _ => Error::remote(operation, format!("HTTP {}: {}", status, snippet)),
        }
    }
}

#[async_trait]
impl StarProvider for GitHubClient {
    async fn fetch_starred_page(&self, page: u32) -> Result<StarPage> {
        let operation = format!("fetch page {}", page);
        debug!("Fetching starred repositories page {}", page);

        let response = self
            .request(reqwest::Method::GET, "/user/starred")
            .header(ACCEPT, STAR_MEDIA_TYPE)
            .query(&[
                ("per_page", self.per_page.to_string()),
                ("page", page.to_string()),
                ("sort", "created".to_string()),
                ("direction", "desc".to_string()),
            ])
            .send()
            .await
            .map_err(|e| Error::remote(operation.clone(), e))?;

        if !response.status().is_success() {
            return Err(Self::failure(response, operation).await);
        }

        let rate_limit = parse_rate_limit(response.headers());
        let next_page = parse_next_page(response.headers());
        let items: Vec<StarredItem> = response
            .json()
            .await
            .map_err(|e| Error::remote(operation, format!("unreadable response: {}", e)))?;

        Ok(StarPage {
            repos: items.into_iter().map(StarredItem::into_remote).collect(),
            next_page,
            rate_limit,
        })
    }

    async fn set_starred(&self, repo: &RepoRef, starred: bool) -> Result<RateLimitInfo> {
        let (method, verb) = if starred {
            (reqwest::Method::PUT, "star")
        } else {
            (reqwest::Method::DELETE, "unstar")
        };
        let operation = format!("{} {}", verb, repo.full_name());

        let response = self
            .request(method, &format!("/user/starred/{}/{}", repo.owner, repo.name))
            .header(CONTENT_LENGTH, "0")
            .send()
            .await
            .map_err(|e| Error::remote(operation.clone(), e))?;

        let status = response.status();
        // Unstarring something that is already gone is the state we wanted.
        if status.is_success() || (!starred && status == StatusCode::NOT_FOUND) {
            return Ok(parse_rate_limit(response.headers()));
        }
        Err(Self::failure(response, operation).await)
    }

    fn provider_name(&self) -> &'static str {
        "github"
    }
}

/// Test current authentication
pub async fn test_authentication(config: &Config) -> anyhow::Result<()> {
    println!("Testing GitHub authentication...");

    let client = match GitHubClient::new(config) {
        Ok(client) => client,
        Err(e) => {
            println!("Authentication failed: {}", e);
            return Ok(());
        }
    };
    println!("   Strategy: {:?}", client.strategy());

    match client.verify_identity().await {
        Ok(login) => println!("Authentication successful\n   Username: {}", login),
        Err(e) => println!("Authentication failed: {:#}", e),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn test_parse_next_page() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "link",
            HeaderValue::from_static(
                r#"<https://api.github.com/user/starred?per_page=100&page=3>; rel="next", <https://api.github.com/user/starred?per_page=100&page=9>; rel="last""#,
            ),
        );
        assert_eq!(parse_next_page(&headers), Some(3));

        let mut last = HeaderMap::new();
        last.insert(
            "link",
            HeaderValue::from_static(
                r#"<https://api.github.com/user/starred?page=1>; rel="first""#,
            ),
        );
        assert_eq!(parse_next_page(&last), None);
        assert_eq!(parse_next_page(&HeaderMap::new()), None);
    }

    #[test]
    fn test_parse_rate_limit() {
        let mut headers = HeaderMap::new();
        headers.insert("x-ratelimit-limit", HeaderValue::from_static("5000"));
        headers.insert("x-ratelimit-remaining", HeaderValue::from_static("42"));
        headers.insert("x-ratelimit-reset", HeaderValue::from_static("1700000000"));

        let info = parse_rate_limit(&headers);
        assert_eq!(info.limit, 5000);
        assert_eq!(info.remaining, 42);
        assert_eq!(info.reset_at.map(|t| t.timestamp()), Some(1_700_000_000));

        let unknown = parse_rate_limit(&HeaderMap::new());
        assert_eq!(unknown.reset_at, None);
        assert_eq!(unknown.remaining, u32::MAX);
    }

    #[test]
    fn test_starred_item_shapes() {
        let wrapped: StarredItem = serde_json::from_str(
            r#"{"starred_at":"2024-01-02T03:04:05Z","repo":{"id":1,"name":"tokio","owner":{"login":"tokio-rs"},"description":null,"language":"Rust","topics":["async"],"stargazers_count":10,"pushed_at":"2024-01-01T00:00:00Z","html_url":"https://github.com/tokio-rs/tokio"}}"#,
        )
        .unwrap();
        let remote = wrapped.into_remote();
        assert_eq!(remote.full_name(), "tokio-rs/tokio");
        assert!(remote.starred_at.is_some());

        let plain: StarredItem = serde_json::from_str(
            r#"{"id":2,"name":"serde","owner":{"login":"serde-rs"},"description":"ser/de","language":"Rust"}"#,
        )
        .unwrap();
        let remote = plain.into_remote();
        assert_eq!(remote.id, 2);
        assert!(remote.starred_at.is_none());
        assert!(remote.topics.is_empty());
    }
}
