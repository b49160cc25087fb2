//! Auto-tag derivation
//!
//! Auto tags are a pure function of language, topics and last push time.
//! They are recomputed as a whole set and diffed against what is stored, so
//! an old `lang:` or `topic:` tag disappears as soon as the attribute does.

use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeSet;

use crate::error::Result;
use crate::model::{RemoteRepo, RepositoryRecord};
use crate::store::StoreTx;

pub const TAG_ACTIVE: &str = "active";
pub const TAG_STALE: &str = "stale";
pub const LANGUAGE_PREFIX: &str = "lang:";
pub const TOPIC_PREFIX: &str = "topic:";

/// The attributes categorization depends on, and nothing else
#[derive(Debug, Clone, Copy)]
pub struct CategoryInputs<'a> {
    pub language: Option<&'a str>,
    pub topics: &'a [String],
    pub pushed_at: Option<DateTime<Utc>>,
}

impl<'a> From<&'a RepositoryRecord> for CategoryInputs<'a> {
    fn from(record: &'a RepositoryRecord) -> Self {
        Self {
            language: record.language.as_deref(),
            topics: &record.topics,
            pushed_at: record.pushed_at,
        }
    }
}

impl<'a> From<&'a RemoteRepo> for CategoryInputs<'a> {
    fn from(repo: &'a RemoteRepo) -> Self {
        Self {
            language: repo.language.as_deref(),
            topics: &repo.topics,
            pushed_at: repo.pushed_at,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Categorizer {
    freshness: Duration,
}

impl Categorizer {
    pub fn new(freshness: Duration) -> Self {
        Self { freshness }
    }

    pub fn freshness(&self) -> Duration {
        self.freshness
    }

    /// Auto tags as of now
    pub fn categorize<'a>(&self, inputs: impl Into<CategoryInputs<'a>>) -> BTreeSet<String> {
        self.categorize_at(inputs, Utc::now())
    }

    /// Auto tags relative to a fixed clock. Exactly one of `active`/`stale`
    /// is always present; a record that has never been pushed is stale.
    pub fn categorize_at<'a>(
        &self,
        inputs: impl Into<CategoryInputs<'a>>,
        now: DateTime<Utc>,
    ) -> BTreeSet<String> {
        let inputs = inputs.into();
        let mut tags = BTreeSet::new();

        if let Some(language) = inputs.language.map(str::trim).filter(|l| !l.is_empty()) {
            tags.insert(format!("{}{}", LANGUAGE_PREFIX, language));
        }

        for topic in inputs.topics {
            let topic = topic.trim().to_lowercase();
            if !topic.is_empty() {
                tags.insert(format!("{}{}", TOPIC_PREFIX, topic));
            }
        }

        let fresh = inputs
            .pushed_at
            .is_some_and(|pushed| pushed >= now - self.freshness);
        tags.insert(if fresh { TAG_ACTIVE } else { TAG_STALE }.to_string());

        tags
    }

    /// Recompute and store the auto tags of one record inside the caller's
    /// transaction. Returns true when the stored set changed.
    pub fn apply<'a>(
        &self,
        tx: &StoreTx<'_>,
        repo_id: i64,
        inputs: impl Into<CategoryInputs<'a>>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let desired = self.categorize_at(inputs, now);
        tx.replace_auto_tags(repo_id, &desired)
    }
}

impl Default for Categorizer {
    fn default() -> Self {
        Self::new(Duration::days(90))
    }
}
