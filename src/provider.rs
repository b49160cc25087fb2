//! Remote provider abstraction
//!
//! The synchronizer only talks to the remote service through this trait, so
//! GitHub (or a scripted fake in tests) can be plugged in without touching
//! the reconciliation logic.

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::model::{RateLimitInfo, RemoteRepo};

/// One page of the remote star feed.
#[derive(Debug, Clone)]
pub struct StarPage {
    /// Items in the provider's native order (newest star first)
    pub repos: Vec<RemoteRepo>,
    /// Page to request next; `None` once the feed is exhausted
    pub next_page: Option<u32>,
    pub rate_limit: RateLimitInfo,
}

/// Repository identity needed for star mutations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoRef {
    pub id: i64,
    pub owner: String,
    pub name: String,
}

impl RepoRef {
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

/// Remote source of starred repositories.
///
/// Every call reports the current rate-limit window so the caller can stop
/// before the budget runs out.
#[async_trait]
pub trait StarProvider: Send + Sync {
    /// Fetch one page of starred repositories. Pages are 1-based.
    async fn fetch_starred_page(&self, page: u32) -> Result<StarPage>;

    /// Star or unstar a repository.
    async fn set_starred(&self, repo: &RepoRef, starred: bool) -> Result<RateLimitInfo>;

    /// Provider name for display/logging
    fn provider_name(&self) -> &'static str;
}

/// Provider for offline browsing. Every remote call fails as unavailable,
/// so star changes stay queued until a real provider pushes them.
#[derive(Debug, Clone, Copy, Default)]
pub struct Offline;

#[async_trait]
impl StarProvider for Offline {
    async fn fetch_starred_page(&self, page: u32) -> Result<StarPage> {
        Err(Error::remote(format!("fetch page {}", page), "offline"))
    }

    async fn set_starred(&self, repo: &RepoRef, starred: bool) -> Result<RateLimitInfo> {
        let verb = if starred { "star" } else { "unstar" };
        Err(Error::remote(format!("{} {}", verb, repo.full_name()), "offline"))
    }

    fn provider_name(&self) -> &'static str {
        "offline"
    }
}
