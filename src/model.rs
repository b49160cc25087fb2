//! Canonical records kept in the entity store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A starred repository as reported by the remote provider, already
/// normalized into provider-agnostic fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRepo {
    /// Stable remote id
    pub id: i64,
    pub owner: String,
    pub name: String,
    pub description: Option<String>,
    pub language: Option<String>,
    pub topics: Vec<String>,
    pub stars: u64,
    pub pushed_at: Option<DateTime<Utc>>,
    /// When the user starred it; drives incremental early-stop
    pub starred_at: Option<DateTime<Utc>>,
    pub html_url: String,
    pub archived: bool,
    pub fork: bool,
}

/// Remote-authoritative fields that participate in the content hash.
#[derive(Serialize)]
struct HashedFields<'a> {
    owner: &'a str,
    name: &'a str,
    description: Option<&'a str>,
    language: Option<&'a str>,
    topics: Vec<&'a str>,
    stars: u64,
    pushed_at: Option<i64>,
    html_url: &'a str,
    archived: bool,
    fork: bool,
}

impl RemoteRepo {
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }

    /// Hex SHA-256 over the mutable remote fields. Topic order is ignored.
    pub fn content_hash(&self) -> String {
        let mut topics: Vec<&str> = self.topics.iter().map(String::as_str).collect();
        topics.sort_unstable();

        let fields = HashedFields {
            owner: &self.owner,
            name: &self.name,
            description: self.description.as_deref(),
            language: self.language.as_deref(),
            topics,
            stars: self.stars,
            pushed_at: self.pushed_at.map(|t| t.timestamp()),
            html_url: &self.html_url,
            archived: self.archived,
            fork: self.fork,
        };

        // Serializing a plain struct of strings and integers cannot fail.
        let bytes = serde_json::to_vec(&fields).unwrap_or_default();
        hex::encode(Sha256::digest(&bytes))
    }
}

/// Local mirror of a starred repository plus its sync metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct RepositoryRecord {
    pub id: i64,
    pub owner: String,
    pub name: String,
    pub description: Option<String>,
    pub language: Option<String>,
    pub topics: Vec<String>,
    pub stars: u64,
    pub pushed_at: Option<DateTime<Utc>>,
    pub starred_at: Option<DateTime<Utc>>,
    pub html_url: String,
    pub archived: bool,
    pub fork: bool,
    pub content_hash: String,
    pub last_synced_at: Option<DateTime<Utc>>,
    /// A star/unstar is queued for remote propagation
    pub local_dirty: bool,
    pub desired_starred: Option<bool>,
    pub push_attempts: u32,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub last_push_error: Option<String>,
    /// Retry budget exhausted; waits for explicit resolution
    pub conflict: bool,
    pub tombstoned_at: Option<DateTime<Utc>>,
    /// Consecutive full passes in which the record was missing
    pub absent_passes: u32,
    pub seen_pass: u64,
    pub version: i64,
}

impl RepositoryRecord {
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }

    pub fn is_tombstoned(&self) -> bool {
        self.tombstoned_at.is_some()
    }

    /// True when a queued unstar should win over the remote still listing it.
    pub fn wants_unstar(&self) -> bool {
        self.local_dirty && self.desired_starred == Some(false)
    }

    pub fn wants_star(&self) -> bool {
        self.local_dirty && self.desired_starred == Some(true)
    }
}

/// Where a tag came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TagOrigin {
    /// Assigned by the user; never touched by categorization
    User,
    /// Derived from repository attributes; replaced on every pass
    Auto,
}

impl TagOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            TagOrigin::User => "user",
            TagOrigin::Auto => "auto",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(TagOrigin::User),
            "auto" => Some(TagOrigin::Auto),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tag {
    pub name: String,
    pub origin: TagOrigin,
}

/// How a virtual folder decides membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FolderKind {
    /// Membership is computed from current tags at read time
    TagQuery,
    /// Membership is an explicit, persisted set of repositories
    Manual,
}

impl FolderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FolderKind::TagQuery => "tag_query",
            FolderKind::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "tag_query" => Some(FolderKind::TagQuery),
            "manual" => Some(FolderKind::Manual),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VirtualFolder {
    pub id: i64,
    /// Display name as the user typed it
    pub name: String,
    /// Case-normalized name; unique across folders
    pub key: String,
    pub kind: FolderKind,
    /// Ordered tag filters; empty for manual folders
    pub filters: Vec<String>,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Normalize a folder name for uniqueness checks: trim, collapse inner
/// whitespace, lowercase.
pub fn normalize_folder_name(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    Incremental,
    Full,
}

impl SyncMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncMode::Incremental => "incremental",
            SyncMode::Full => "full",
        }
    }
}

/// Rate-limit window as reported by the remote on every call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitInfo {
    pub limit: u32,
    pub remaining: u32,
    pub reset_at: Option<DateTime<Utc>>,
}

impl RateLimitInfo {
    /// Time until the window resets, zero if already past or unknown.
    pub fn retry_after(&self, now: DateTime<Utc>) -> std::time::Duration {
        self.reset_at
            .and_then(|reset| (reset - now).to_std().ok())
            .unwrap_or_default()
    }
}

/// Process-wide pagination and rate-limit state, persisted after every
/// committed page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncCursor {
    /// Monotonic id of the current (or last) pass
    pub pass_id: u64,
    pub mode: Option<SyncMode>,
    /// Next page to fetch; `None` when no pass is in flight
    pub next_page: Option<u32>,
    pub pass_started_at: Option<DateTime<Utc>>,
    /// Newest star timestamp covered by the last completed pass
    pub checkpoint: Option<DateTime<Utc>>,
    /// Newest star timestamp seen by the pass in flight
    pub pass_newest: Option<DateTime<Utc>>,
    pub last_completed_at: Option<DateTime<Utc>>,
    pub rate_limit: Option<RateLimitInfo>,
}

impl SyncCursor {
    pub fn in_flight(&self) -> bool {
        self.next_page.is_some()
    }
}

/// Ordering for repository listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Stars,
    Updated,
    Name,
    Language,
}

impl SortOrder {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "stars" => Some(SortOrder::Stars),
            "updated" => Some(SortOrder::Updated),
            "name" => Some(SortOrder::Name),
            "language" => Some(SortOrder::Language),
            _ => None,
        }
    }

    pub(crate) fn sql(&self) -> &'static str {
        match self {
            SortOrder::Stars => "stars DESC, owner, name",
            SortOrder::Updated => "pushed_at DESC, owner, name",
            SortOrder::Name => "owner COLLATE NOCASE, name COLLATE NOCASE",
            SortOrder::Language => "language COLLATE NOCASE, stars DESC",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote() -> RemoteRepo {
        RemoteRepo {
            id: 7,
            owner: "tokio-rs".into(),
            name: "tokio".into(),
            description: Some("async runtime".into()),
            language: Some("Rust".into()),
            topics: vec!["async".into(), "runtime".into()],
            stars: 25_000,
            pushed_at: None,
            starred_at: None,
            html_url: "https://github.com/tokio-rs/tokio".into(),
            archived: false,
            fork: false,
        }
    }

    #[test]
    fn test_content_hash_ignores_topic_order_and_star_time() {
        let a = remote();
        let mut b = remote();
        b.topics.reverse();
        b.starred_at = Some(Utc::now());
        assert_eq!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn test_content_hash_changes_with_remote_fields() {
        let a = remote();
        let mut b = remote();
        b.stars += 1;
        assert_ne!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn test_normalize_folder_name() {
        assert_eq!(normalize_folder_name("  Web   Frameworks "), "web frameworks");
        assert_eq!(normalize_folder_name("RUST"), normalize_folder_name("rust"));
    }

    #[test]
    fn test_origin_and_kind_round_trip_strings() {
        assert_eq!(TagOrigin::parse(TagOrigin::User.as_str()), Some(TagOrigin::User));
        assert_eq!(FolderKind::parse("tag_query"), Some(FolderKind::TagQuery));
        assert_eq!(FolderKind::parse("bogus"), None);
    }
}
