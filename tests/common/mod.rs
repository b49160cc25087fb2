//! Common test utilities and helpers for starshelf tests
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashSet;
use std::env;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use starshelf::error::{Error, Result};
use starshelf::model::{RateLimitInfo, RemoteRepo};
use starshelf::provider::{RepoRef, StarPage, StarProvider};
use starshelf::{Categorizer, EntityStore, SyncEngine, SyncOptions};

/// Test configuration helper
pub struct TestEnvironment {
    pub temp_dir: TempDir,
    pub config_dir: PathBuf,
    pub original_env: Vec<(String, Option<String>)>,
}

impl TestEnvironment {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let config_dir = temp_dir.path().join("starshelf");
        std::fs::create_dir_all(&config_dir).expect("Failed to create config dir");

        let env_vars = vec!["GITHUB_TOKEN", "XDG_CONFIG_HOME", "STARSHELF_DB"];
        let original_env = env_vars
            .iter()
            .map(|var| (var.to_string(), env::var(var).ok()))
            .collect();

        Self {
            temp_dir,
            config_dir,
            original_env,
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.temp_dir.path().join("data").join("shelf.db")
    }

    pub fn create_test_config(&self, content: &str) -> PathBuf {
        let config_path = self.config_dir.join("config.yml");
        std::fs::write(&config_path, content).expect("Failed to write test config");
        config_path
    }

    pub fn create_minimal_config(&self) -> PathBuf {
        let config_content = format!(
            r#"
store:
  db_path: "{}"
folders:
  default_folders:
    - name: "Active"
      tags: ["active"]
    - name: "Rust"
      tags: ["lang:rust", "topic:rust*"]
"#,
            self.db_path().display()
        );
        self.create_test_config(&config_content)
    }
}

impl Drop for TestEnvironment {
    fn drop(&mut self) {
        for (key, value) in &self.original_env {
            match value {
                Some(val) => env::set_var(key, val),
                None => env::remove_var(key),
            }
        }
    }
}

/// Builder for remote repositories
#[derive(Debug, Clone)]
pub struct MockRepository {
    repo: RemoteRepo,
}

impl MockRepository {
    pub fn new(id: i64, owner: &str, name: &str) -> Self {
        Self {
            repo: RemoteRepo {
                id,
                owner: owner.to_string(),
                name: name.to_string(),
                description: Some(format!("{} description", name)),
                language: None,
                topics: Vec::new(),
                stars: 100,
                pushed_at: Some(Utc::now() - ChronoDuration::days(10)),
                starred_at: Some(Utc::now() - ChronoDuration::hours(id)),
                html_url: format!("https://github.com/{}/{}", owner, name),
                archived: false,
                fork: false,
            },
        }
    }

    pub fn language(mut self, language: &str) -> Self {
        self.repo.language = Some(language.to_string());
        self
    }

    pub fn topics(mut self, topics: &[&str]) -> Self {
        self.repo.topics = topics.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn pushed_days_ago(mut self, days: i64) -> Self {
        self.repo.pushed_at = Some(Utc::now() - ChronoDuration::days(days));
        self
    }

    pub fn starred_at(mut self, at: DateTime<Utc>) -> Self {
        self.repo.starred_at = Some(at);
        self
    }

    pub fn stars(mut self, stars: u64) -> Self {
        self.repo.stars = stars;
        self
    }

    pub fn build(self) -> RemoteRepo {
        self.repo
    }
}

#[derive(Debug)]
struct FakeState {
    /// Starred repositories, newest star first
    starred: Vec<RemoteRepo>,
    /// Repositories that can be starred
    catalog: Vec<RemoteRepo>,
    per_page: usize,
    limit: u32,
    remaining: u32,
    reset_at: Option<DateTime<Utc>>,
    failing_pages: HashSet<u32>,
    failing_star_calls: u32,
    /// Star calls answer with this retry-after while set
    star_rate_limit: Option<Duration>,
    auth_expired: bool,
    delay: Option<Duration>,
    fetches: Vec<u32>,
    star_calls: Vec<(i64, bool)>,
}

type Hook = Box<dyn FnOnce() + Send>;

/// Writes another process makes while a request is in flight
#[derive(Default)]
struct Hooks {
    on_fetch: Option<Hook>,
    on_star: Option<Hook>,
}

impl std::fmt::Debug for Hooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hooks")
            .field("on_fetch", &self.on_fetch.is_some())
            .field("on_star", &self.on_star.is_some())
            .finish()
    }
}

/// In-process star feed with scripted rate limits and failures
#[derive(Debug)]
pub struct FakeProvider {
    state: Mutex<FakeState>,
    hooks: Mutex<Hooks>,
}

impl FakeProvider {
    pub fn new(mut starred: Vec<RemoteRepo>) -> Arc<Self> {
        starred.sort_by(|a, b| b.starred_at.cmp(&a.starred_at));
        Arc::new(Self {
            state: Mutex::new(FakeState {
                catalog: starred.clone(),
                starred,
                per_page: 100,
                limit: 5000,
                remaining: 5000,
                reset_at: Some(Utc::now() + ChronoDuration::hours(1)),
                failing_pages: HashSet::new(),
                failing_star_calls: 0,
                star_rate_limit: None,
                auth_expired: false,
                delay: None,
                fetches: Vec::new(),
                star_calls: Vec::new(),
            }),
            hooks: Mutex::new(Hooks::default()),
        })
    }

    /// Replace the starred set, keeping the feed newest-first
    pub fn set_starred_repos(&self, mut starred: Vec<RemoteRepo>) {
        starred.sort_by(|a, b| b.starred_at.cmp(&a.starred_at));
        let mut state = self.state.lock().unwrap();
        for repo in &starred {
            if !state.catalog.iter().any(|r| r.id == repo.id) {
                state.catalog.push(repo.clone());
            }
        }
        state.starred = starred;
    }

    pub fn starred_ids(&self) -> Vec<i64> {
        self.state.lock().unwrap().starred.iter().map(|r| r.id).collect()
    }

    pub fn set_per_page(&self, per_page: usize) {
        self.state.lock().unwrap().per_page = per_page;
    }

    pub fn set_remaining(&self, remaining: u32) {
        self.state.lock().unwrap().remaining = remaining;
    }

    pub fn fail_page(&self, page: u32) {
        self.state.lock().unwrap().failing_pages.insert(page);
    }

    pub fn heal_pages(&self) {
        self.state.lock().unwrap().failing_pages.clear();
    }

    pub fn fail_star_calls(&self, count: u32) {
        self.state.lock().unwrap().failing_star_calls = count;
    }

    pub fn rate_limit_star_calls(&self, retry_after: Option<Duration>) {
        self.state.lock().unwrap().star_rate_limit = retry_after;
    }

    /// Run `hook` once, after the next page has been read but before it is returned
    pub fn on_fetch(&self, hook: impl FnOnce() + Send + 'static) {
        self.hooks.lock().unwrap().on_fetch = Some(Box::new(hook));
    }

    /// Run `hook` once, while the next star call is in flight
    pub fn on_star(&self, hook: impl FnOnce() + Send + 'static) {
        self.hooks.lock().unwrap().on_star = Some(Box::new(hook));
    }

    pub fn expire_auth(&self, expired: bool) {
        self.state.lock().unwrap().auth_expired = expired;
    }

    pub fn set_delay(&self, delay: Duration) {
        self.state.lock().unwrap().delay = Some(delay);
    }

    /// Drop `starred_at` from every item, as an API without star timestamps would
    pub fn strip_star_times(&self) {
        let mut state = self.state.lock().unwrap();
        for repo in &mut state.starred {
            repo.starred_at = None;
        }
    }

    pub fn fetches(&self) -> Vec<u32> {
        self.state.lock().unwrap().fetches.clone()
    }

    pub fn star_calls(&self) -> Vec<(i64, bool)> {
        self.state.lock().unwrap().star_calls.clone()
    }

    fn read_page(&self, page: u32) -> Result<StarPage> {
        let mut state = self.state.lock().unwrap();
        state.fetches.push(page);
        if state.auth_expired {
            return Err(Error::AuthExpired {
                operation: format!("fetch page {}", page),
            });
        }
        if state.failing_pages.contains(&page) {
            return Err(Error::RemoteUnavailable {
                operation: format!("fetch page {}", page),
                message: "connection reset".to_string(),
                committed_pages: 0,
            });
        }
        state.remaining = state.remaining.saturating_sub(1);

        let start = (page.saturating_sub(1) as usize) * state.per_page;
        let repos: Vec<RemoteRepo> = state
            .starred
            .iter()
            .skip(start)
            .take(state.per_page)
            .cloned()
            .collect();
        let next_page = if start + state.per_page < state.starred.len() {
            Some(page + 1)
        } else {
            None
        };

        Ok(StarPage {
            repos,
            next_page,
            rate_limit: Self::rate_limit(&state),
        })
    }

    fn rate_limit(state: &FakeState) -> RateLimitInfo {
        RateLimitInfo {
            limit: state.limit,
            remaining: state.remaining,
            reset_at: state.reset_at,
        }
    }
}

#[async_trait]
impl StarProvider for FakeProvider {
    async fn fetch_starred_page(&self, page: u32) -> Result<StarPage> {
        let delay = self.state.lock().unwrap().delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let page_result = self.read_page(page);
        let hook = self.hooks.lock().unwrap().on_fetch.take();
        if let Some(hook) = hook {
            hook();
        }
        page_result
    }

    async fn set_starred(&self, repo: &RepoRef, starred: bool) -> Result<RateLimitInfo> {
        let hook = self.hooks.lock().unwrap().on_star.take();
        if let Some(hook) = hook {
            hook();
        }

        let mut state = self.state.lock().unwrap();
        state.star_calls.push((repo.id, starred));
        if state.auth_expired {
            return Err(Error::AuthExpired {
                operation: format!("star {}", repo.full_name()),
            });
        }
        if let Some(retry_after) = state.star_rate_limit {
            state.remaining = 0;
            return Err(Error::RateLimited {
                retry_after,
                committed_pages: 0,
            });
        }
        if state.failing_star_calls > 0 {
            state.failing_star_calls -= 1;
            return Err(Error::RemoteUnavailable {
                operation: format!("star {}", repo.full_name()),
                message: "502 Bad Gateway".to_string(),
                committed_pages: 0,
            });
        }

        state.remaining = state.remaining.saturating_sub(1);
        if starred {
            if !state.starred.iter().any(|r| r.id == repo.id) {
                if let Some(mut known) = state.catalog.iter().find(|r| r.id == repo.id).cloned() {
                    known.starred_at = Some(Utc::now());
                    state.starred.insert(0, known);
                }
            }
        } else {
            state.starred.retain(|r| r.id != repo.id);
        }
        Ok(Self::rate_limit(&state))
    }

    fn provider_name(&self) -> &'static str {
        "fake"
    }
}

/// Options with immediate retries so queued pushes are always due
pub fn test_options() -> SyncOptions {
    SyncOptions {
        rate_limit_buffer: 100,
        request_timeout: Duration::from_secs(5),
        max_push_attempts: 3,
        retry_backoff: Duration::ZERO,
        retry_backoff_max: Duration::ZERO,
    }
}

pub fn engine_with(provider: Arc<FakeProvider>, options: SyncOptions) -> SyncEngine {
    SyncEngine::new(provider, Categorizer::default(), options)
}

pub fn engine(provider: Arc<FakeProvider>) -> SyncEngine {
    engine_with(provider, test_options())
}

pub fn store() -> EntityStore {
    EntityStore::open_in_memory().expect("in-memory store")
}

/// File-backed store; a second `open_at` on the path stands in for another process
pub fn file_store(dir: &TempDir) -> (EntityStore, PathBuf) {
    let path = dir.path().join("shelf.db");
    (EntityStore::open_at(&path).expect("file store"), path)
}

pub fn tag_names(store: &EntityStore, repo_id: i64) -> Vec<String> {
    store
        .tags_for(repo_id)
        .expect("tags")
        .into_iter()
        .map(|t| t.name)
        .collect()
}
