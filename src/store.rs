//! Entity Store - SQLite persistence for starred repositories
//!
//! This module provides durable storage for:
//! - Repository records and their sync metadata (hash, tombstones, dirty queue)
//! - Tag associations (user and auto origin)
//! - Virtual folders and manual folder membership
//! - The sync cursor and an audit log of sync events
//!
//! All writes go through [`EntityStore::write`], which runs the closure inside
//! one immediate transaction. A reconciliation page (record upserts plus
//! categorization plus cursor) is one such transaction, so readers on other
//! connections only ever see fully committed pages.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{Error, Result, StorageContext};
use crate::model::{
    FolderKind, RemoteRepo, RepositoryRecord, SortOrder, SyncCursor, Tag, TagOrigin,
    VirtualFolder,
};

const CURSOR_KEY: &str = "cursor";
const CAS_RETRIES: usize = 5;

const RECORD_COLUMNS: &str = "id, owner, name, description, language, topics, stars, pushed_at, \
     starred_at, html_url, archived, fork, content_hash, last_synced_at, local_dirty, \
     desired_starred, push_attempts, next_attempt_at, last_push_error, conflict, tombstoned_at, \
     absent_passes, seen_pass, version";

const FOLDER_COLUMNS: &str =
    "id, name, name_key, kind, filters, description, created_at, updated_at";

/// Event types recorded in the sync audit log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    /// Record went missing from a full pass and was tombstoned
    Tombstoned,
    /// Tombstoned record showed up again
    Restored,
    /// Record was hard-deleted (confirmed absence or explicit purge)
    Purged,
    /// A queued star/unstar failed and will be retried
    PushFailed,
    /// Retry budget exhausted; explicit resolution required
    PendingConflict,
    /// User resolved a pending conflict
    ConflictResolved,
    /// Pass stopped early (rate limit, outage, auth)
    PassInterrupted,
    /// Incremental pass could not trust ordering and ran as full
    IncrementalFallback,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Tombstoned => "tombstoned",
            EventType::Restored => "restored",
            EventType::Purged => "purged",
            EventType::PushFailed => "push_failed",
            EventType::PendingConflict => "pending_conflict",
            EventType::ConflictResolved => "conflict_resolved",
            EventType::PassInterrupted => "pass_interrupted",
            EventType::IncrementalFallback => "incremental_fallback",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "tombstoned" => Some(EventType::Tombstoned),
            "restored" => Some(EventType::Restored),
            "purged" => Some(EventType::Purged),
            "push_failed" => Some(EventType::PushFailed),
            "pending_conflict" => Some(EventType::PendingConflict),
            "conflict_resolved" => Some(EventType::ConflictResolved),
            "pass_interrupted" => Some(EventType::PassInterrupted),
            "incremental_fallback" => Some(EventType::IncrementalFallback),
            _ => None,
        }
    }

    /// Get the severity level for this event type
    pub fn severity(&self) -> Severity {
        match self {
            EventType::Restored | EventType::ConflictResolved => Severity::Info,
            EventType::Tombstoned | EventType::Purged => Severity::Info,
            EventType::PushFailed => Severity::Warning,
            EventType::PassInterrupted => Severity::Warning,
            EventType::IncrementalFallback => Severity::Warning,
            EventType::PendingConflict => Severity::Error,
        }
    }
}

/// Severity levels for events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "info" => Some(Severity::Info),
            "warning" => Some(Severity::Warning),
            "error" => Some(Severity::Error),
            _ => None,
        }
    }
}

/// Unacknowledged events per severity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventCounts {
    pub info: u32,
    pub warning: u32,
    pub error: u32,
}

impl EventCounts {
    pub fn total(&self) -> u32 {
        self.info + self.warning + self.error
    }
}

/// A sync event record
#[derive(Debug, Clone)]
pub struct SyncEvent {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub repo_full_name: Option<String>,
    pub event_type: EventType,
    pub severity: Severity,
    pub summary: String,
    pub details: Option<String>,
    pub acknowledged: bool,
}

/// Builder for creating new sync events
#[derive(Debug)]
pub struct SyncEventBuilder {
    repo_full_name: Option<String>,
    event_type: EventType,
    summary: String,
    details: Option<String>,
}

impl SyncEventBuilder {
    pub fn new(event_type: EventType, summary: impl Into<String>) -> Self {
        Self {
            repo_full_name: None,
            event_type,
            summary: summary.into(),
            details: None,
        }
    }

    pub fn repo(mut self, full_name: impl Into<String>) -> Self {
        self.repo_full_name = Some(full_name.into());
        self
    }

    pub fn details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

/// What an upsert did to the stored record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordChange {
    Inserted,
    Updated,
    Unchanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub change: RecordChange,
    /// A tombstone was lifted because the record reappeared
    pub restored: bool,
}

/// Tag usage across live records
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagCount {
    pub name: String,
    pub origin: TagOrigin,
    pub count: u32,
}

pub(crate) fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn parse_ts(value: Option<String>) -> Option<DateTime<Utc>> {
    value
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<RepositoryRecord> {
    let topics: Option<String> = row.get(5)?;
    Ok(RepositoryRecord {
        id: row.get(0)?,
        owner: row.get(1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        language: row.get(4)?,
        topics: topics
            .and_then(|t| serde_json::from_str(&t).ok())
            .unwrap_or_default(),
        stars: row.get::<_, i64>(6)?.max(0) as u64,
        pushed_at: parse_ts(row.get(7)?),
        starred_at: parse_ts(row.get(8)?),
        html_url: row.get(9)?,
        archived: row.get(10)?,
        fork: row.get(11)?,
        content_hash: row.get(12)?,
        last_synced_at: parse_ts(row.get(13)?),
        local_dirty: row.get(14)?,
        desired_starred: row.get(15)?,
        push_attempts: row.get(16)?,
        next_attempt_at: parse_ts(row.get(17)?),
        last_push_error: row.get(18)?,
        conflict: row.get(19)?,
        tombstoned_at: parse_ts(row.get(20)?),
        absent_passes: row.get(21)?,
        seen_pass: row.get::<_, i64>(22)?.max(0) as u64,
        version: row.get(23)?,
    })
}

fn row_to_folder(row: &Row<'_>) -> rusqlite::Result<VirtualFolder> {
    let filters: String = row.get(4)?;
    Ok(VirtualFolder {
        id: row.get(0)?,
        name: row.get(1)?,
        key: row.get(2)?,
        kind: FolderKind::parse(&row.get::<_, String>(3)?).unwrap_or(FolderKind::Manual),
        filters: serde_json::from_str(&filters).unwrap_or_default(),
        description: row.get(5)?,
        created_at: parse_ts(row.get(6)?).unwrap_or_else(Utc::now),
        updated_at: parse_ts(row.get(7)?).unwrap_or_else(Utc::now),
    })
}

fn row_to_event(row: &Row<'_>) -> rusqlite::Result<SyncEvent> {
    Ok(SyncEvent {
        id: row.get(0)?,
        timestamp: parse_ts(row.get(1)?).unwrap_or_else(Utc::now),
        repo_full_name: row.get(2)?,
        event_type: EventType::parse(&row.get::<_, String>(3)?)
            .unwrap_or(EventType::PassInterrupted),
        severity: Severity::parse(&row.get::<_, String>(4)?).unwrap_or(Severity::Info),
        summary: row.get(5)?,
        details: row.get(6)?,
        acknowledged: row.get::<_, i32>(7)? != 0,
    })
}

fn escape_like(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len() + 2);
    escaped.push('%');
    for c in text.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('%');
    escaped
}

// =========================================================================
// Shared read queries (used by both the store and open transactions)
// =========================================================================

fn query_records(
    conn: &Connection,
    where_clause: &str,
    params: &[&dyn rusqlite::ToSql],
    order: &str,
) -> Result<Vec<RepositoryRecord>> {
    let sql = format!(
        "SELECT {} FROM repositories {} ORDER BY {}",
        RECORD_COLUMNS, where_clause, order
    );
    let mut stmt = conn.prepare(&sql).storage("prepare record query")?;
    let records = stmt
        .query_map(params, row_to_record)
        .storage("query records")?
        .collect::<rusqlite::Result<Vec<_>>>()
        .storage("collect records")?;
    Ok(records)
}

fn get_record(conn: &Connection, id: i64) -> Result<Option<RepositoryRecord>> {
    conn.query_row(
        &format!("SELECT {} FROM repositories WHERE id = ?1", RECORD_COLUMNS),
        params![id],
        row_to_record,
    )
    .optional()
    .storage("get record")
}

fn tags_for(conn: &Connection, repo_id: i64) -> Result<Vec<Tag>> {
    let mut stmt = conn
        .prepare("SELECT name, origin FROM tags WHERE repo_id = ?1 ORDER BY name")
        .storage("prepare tag query")?;
    let tags = stmt
        .query_map(params![repo_id], |row| {
            Ok(Tag {
                name: row.get(0)?,
                origin: TagOrigin::parse(&row.get::<_, String>(1)?).unwrap_or(TagOrigin::User),
            })
        })
        .storage("query tags")?
        .collect::<rusqlite::Result<Vec<_>>>()
        .storage("collect tags")?;
    Ok(tags)
}

fn tag_names(conn: &Connection, repo_id: i64, origin: TagOrigin) -> Result<BTreeSet<String>> {
    let mut stmt = conn
        .prepare("SELECT name FROM tags WHERE repo_id = ?1 AND origin = ?2")
        .storage("prepare tag names")?;
    let names = stmt
        .query_map(params![repo_id, origin.as_str()], |row| row.get(0))
        .storage("query tag names")?
        .collect::<rusqlite::Result<BTreeSet<String>>>()
        .storage("collect tag names")?;
    Ok(names)
}

fn get_folder_by_key(conn: &Connection, key: &str) -> Result<Option<VirtualFolder>> {
    conn.query_row(
        &format!("SELECT {} FROM folders WHERE name_key = ?1", FOLDER_COLUMNS),
        params![key],
        row_to_folder,
    )
    .optional()
    .storage("get folder")
}

fn load_cursor(conn: &Connection) -> Result<SyncCursor> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value FROM sync_state WHERE key = ?1",
            params![CURSOR_KEY],
            |row| row.get(0),
        )
        .optional()
        .storage("load cursor")?;

    Ok(raw
        .and_then(|value| serde_json::from_str(&value).ok())
        .unwrap_or_default())
}

/// State database for the starred-repository mirror
pub struct EntityStore {
    conn: Connection,
    path: Option<PathBuf>,
}

impl EntityStore {
    /// Open or create the store at a specific path
    pub fn open_at(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::InvalidInput(format!(
                    "cannot create database directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let conn = Connection::open(path).storage("open database")?;
        let mut store = Self {
            conn,
            path: Some(path.to_path_buf()),
        };
        store.initialize()?;

        info!("Entity store opened at {}", path.display());
        Ok(store)
    }

    /// Open an in-memory store (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().storage("open in-memory database")?;
        let mut store = Self { conn, path: None };
        store.initialize()?;
        Ok(store)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Initialize the database schema
    fn initialize(&mut self) -> Result<()> {
        self.conn
            .busy_timeout(Duration::from_secs(5))
            .storage("set busy timeout")?;
        // WAL lets readers on other connections proceed during a sync pass.
        let _mode: String = self
            .conn
            .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
            .storage("enable WAL")?;

        self.conn
            .execute_batch(
                r#"
                PRAGMA foreign_keys = ON;

                CREATE TABLE IF NOT EXISTS repositories (
                    id INTEGER PRIMARY KEY,
                    owner TEXT NOT NULL,
                    name TEXT NOT NULL,
                    description TEXT,
                    language TEXT,
                    topics TEXT NOT NULL DEFAULT '[]',
                    stars INTEGER NOT NULL DEFAULT 0,
                    pushed_at TEXT,
                    starred_at TEXT,
                    html_url TEXT NOT NULL DEFAULT '',
                    archived INTEGER NOT NULL DEFAULT 0,
                    fork INTEGER NOT NULL DEFAULT 0,
                    content_hash TEXT NOT NULL,
                    last_synced_at TEXT,
                    local_dirty INTEGER NOT NULL DEFAULT 0,
                    desired_starred INTEGER,
                    push_attempts INTEGER NOT NULL DEFAULT 0,
                    next_attempt_at TEXT,
                    last_push_error TEXT,
                    conflict INTEGER NOT NULL DEFAULT 0,
                    tombstoned_at TEXT,
                    absent_passes INTEGER NOT NULL DEFAULT 0,
                    seen_pass INTEGER NOT NULL DEFAULT 0,
                    version INTEGER NOT NULL DEFAULT 1
                );

                CREATE TABLE IF NOT EXISTS tags (
                    repo_id INTEGER NOT NULL REFERENCES repositories(id) ON DELETE CASCADE,
                    name TEXT NOT NULL COLLATE NOCASE,
                    origin TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    PRIMARY KEY (repo_id, name)
                );

                CREATE TABLE IF NOT EXISTS folders (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL,
                    name_key TEXT NOT NULL UNIQUE,
                    kind TEXT NOT NULL,
                    filters TEXT NOT NULL DEFAULT '[]',
                    description TEXT NOT NULL DEFAULT '',
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                -- Manual membership only; tag-query folders are evaluated at read time
                CREATE TABLE IF NOT EXISTS folder_members (
                    folder_id INTEGER NOT NULL REFERENCES folders(id) ON DELETE CASCADE,
                    repo_id INTEGER NOT NULL REFERENCES repositories(id) ON DELETE CASCADE,
                    added_at TEXT NOT NULL,
                    PRIMARY KEY (folder_id, repo_id)
                );

                CREATE TABLE IF NOT EXISTS sync_state (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS sync_events (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    timestamp TEXT NOT NULL,
                    repo_full_name TEXT,
                    event_type TEXT NOT NULL,
                    severity TEXT NOT NULL,
                    summary TEXT NOT NULL,
                    details TEXT,
                    acknowledged INTEGER DEFAULT 0
                );

                CREATE UNIQUE INDEX IF NOT EXISTS idx_members_one_manual ON folder_members(repo_id);
                CREATE INDEX IF NOT EXISTS idx_repos_full_name ON repositories(owner, name);
                CREATE INDEX IF NOT EXISTS idx_repos_dirty ON repositories(local_dirty, next_attempt_at);
                CREATE INDEX IF NOT EXISTS idx_repos_seen ON repositories(seen_pass);
                CREATE INDEX IF NOT EXISTS idx_tags_name ON tags(name);
                CREATE INDEX IF NOT EXISTS idx_events_unack ON sync_events(acknowledged, timestamp);
                "#,
            )
            .storage("initialize schema")?;

        debug!("Entity store schema initialized");
        Ok(())
    }

    /// Run `op` inside one immediate transaction. Any error rolls back.
    pub fn write<T, F>(&mut self, operation: &'static str, op: F) -> Result<T>
    where
        F: FnOnce(&StoreTx<'_>) -> Result<T>,
    {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .storage(operation)?;
        let store_tx = StoreTx { tx };
        let value = op(&store_tx)?;
        store_tx.tx.commit().storage(operation)?;
        Ok(value)
    }

    // =========================================================================
    // Repository Queries
    // =========================================================================

    pub fn get_record(&self, id: i64) -> Result<Option<RepositoryRecord>> {
        get_record(&self.conn, id)
    }

    /// Look a repository up by numeric id or `owner/name` (case-insensitive)
    pub fn resolve(&self, repo: &str) -> Result<RepositoryRecord> {
        let repo = repo.trim();
        if let Ok(id) = repo.parse::<i64>() {
            if let Some(record) = self.get_record(id)? {
                return Ok(record);
            }
        }

        let (owner, name) = repo
            .split_once('/')
            .ok_or_else(|| Error::RepoNotFound(repo.to_string()))?;

        query_records(
            &self.conn,
            "WHERE owner = ?1 COLLATE NOCASE AND name = ?2 COLLATE NOCASE",
            params![owner, name],
            "id",
        )?
        .into_iter()
        .next()
        .ok_or_else(|| Error::RepoNotFound(repo.to_string()))
    }

    /// All live (non-tombstoned) records
    pub fn list_repos(&self, sort: SortOrder) -> Result<Vec<RepositoryRecord>> {
        query_records(&self.conn, "WHERE tombstoned_at IS NULL", params![], sort.sql())
    }

    pub fn repos_by_tag(&self, tag: &str, sort: SortOrder) -> Result<Vec<RepositoryRecord>> {
        let tag = tag.trim();
        query_records(
            &self.conn,
            "WHERE tombstoned_at IS NULL AND id IN (SELECT repo_id FROM tags WHERE name = ?1)",
            params![tag],
            sort.sql(),
        )
    }

    /// Free-text search over `owner/name` and description
    pub fn search(&self, text: &str, sort: SortOrder) -> Result<Vec<RepositoryRecord>> {
        let pattern = escape_like(text.trim());
        query_records(
            &self.conn,
            r"WHERE tombstoned_at IS NULL
              AND ((owner || '/' || name) LIKE ?1 ESCAPE '\' OR description LIKE ?1 ESCAPE '\')",
            params![pattern],
            sort.sql(),
        )
    }

    /// Records with a local mutation not yet confirmed remotely
    pub fn dirty_records(&self) -> Result<Vec<RepositoryRecord>> {
        query_records(
            &self.conn,
            "WHERE local_dirty = 1",
            params![],
            "conflict DESC, next_attempt_at, id",
        )
    }

    /// Dirty records whose retry time has come and that are not in conflict
    pub fn due_pushes(&self, now: DateTime<Utc>) -> Result<Vec<RepositoryRecord>> {
        let now = fmt_ts(now);
        query_records(
            &self.conn,
            "WHERE local_dirty = 1 AND conflict = 0 AND (next_attempt_at IS NULL OR next_attempt_at <= ?1)",
            params![now],
            "id",
        )
    }

    pub fn pending_conflicts(&self) -> Result<Vec<RepositoryRecord>> {
        query_records(&self.conn, "WHERE local_dirty = 1 AND conflict = 1", params![], "id")
    }

    pub fn tombstoned_records(&self) -> Result<Vec<RepositoryRecord>> {
        query_records(
            &self.conn,
            "WHERE tombstoned_at IS NOT NULL",
            params![],
            "tombstoned_at, id",
        )
    }

    /// Live records with their tags, for evaluating tag-query folders
    pub fn records_with_tags(&self, sort: SortOrder) -> Result<Vec<(RepositoryRecord, Vec<Tag>)>> {
        let records = self.list_repos(sort)?;

        let mut stmt = self
            .conn
            .prepare("SELECT repo_id, name, origin FROM tags ORDER BY repo_id, name")
            .storage("prepare all tags")?;
        let mut by_repo: HashMap<i64, Vec<Tag>> = HashMap::new();
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    Tag {
                        name: row.get(1)?,
                        origin: TagOrigin::parse(&row.get::<_, String>(2)?)
                            .unwrap_or(TagOrigin::User),
                    },
                ))
            })
            .storage("query all tags")?;
        for row in rows {
            let (repo_id, tag) = row.storage("read tag row")?;
            by_repo.entry(repo_id).or_default().push(tag);
        }

        Ok(records
            .into_iter()
            .map(|record| {
                let tags = by_repo.remove(&record.id).unwrap_or_default();
                (record, tags)
            })
            .collect())
    }

    pub fn count_records(&self) -> Result<u64> {
        self.conn
            .query_row("SELECT COUNT(*) FROM repositories", [], |row| {
                row.get::<_, i64>(0)
            })
            .map(|count| count.max(0) as u64)
            .storage("count records")
    }

    // =========================================================================
    // Tag Queries
    // =========================================================================

    pub fn tags_for(&self, repo_id: i64) -> Result<Vec<Tag>> {
        tags_for(&self.conn, repo_id)
    }

    pub fn auto_tags_for(&self, repo_id: i64) -> Result<BTreeSet<String>> {
        tag_names(&self.conn, repo_id, TagOrigin::Auto)
    }

    /// Tag names with usage counts across live records
    pub fn all_tags(&self) -> Result<Vec<TagCount>> {
        let mut stmt = self
            .conn
            .prepare(
                r#"
                SELECT t.name, t.origin, COUNT(*)
                FROM tags t JOIN repositories r ON r.id = t.repo_id
                WHERE r.tombstoned_at IS NULL
                GROUP BY t.name, t.origin
                ORDER BY t.origin DESC, t.name
                "#,
            )
            .storage("prepare tag counts")?;
        let counts = stmt
            .query_map([], |row| {
                Ok(TagCount {
                    name: row.get(0)?,
                    origin: TagOrigin::parse(&row.get::<_, String>(1)?)
                        .unwrap_or(TagOrigin::User),
                    count: row.get(2)?,
                })
            })
            .storage("query tag counts")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .storage("collect tag counts")?;
        Ok(counts)
    }

    // =========================================================================
    // Folder Queries
    // =========================================================================

    pub fn list_folders(&self) -> Result<Vec<VirtualFolder>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM folders ORDER BY name_key",
                FOLDER_COLUMNS
            ))
            .storage("prepare folder list")?;
        let folders = stmt
            .query_map([], row_to_folder)
            .storage("list folders")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .storage("collect folders")?;
        Ok(folders)
    }

    pub fn get_folder_by_key(&self, key: &str) -> Result<Option<VirtualFolder>> {
        get_folder_by_key(&self.conn, key)
    }

    /// Live members of a manual folder
    pub fn manual_members(&self, folder_id: i64, sort: SortOrder) -> Result<Vec<RepositoryRecord>> {
        query_records(
            &self.conn,
            "WHERE tombstoned_at IS NULL AND id IN (SELECT repo_id FROM folder_members WHERE folder_id = ?1)",
            params![folder_id],
            sort.sql(),
        )
    }

    /// The manual folder a repository currently belongs to, if any
    pub fn manual_folder_of(&self, repo_id: i64) -> Result<Option<VirtualFolder>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {} FROM folders WHERE id = (SELECT folder_id FROM folder_members WHERE repo_id = ?1)",
                    FOLDER_COLUMNS
                ),
                params![repo_id],
                row_to_folder,
            )
            .optional()
            .storage("get manual folder of repo")
    }

    // =========================================================================
    // Sync Cursor
    // =========================================================================

    pub fn load_cursor(&self) -> Result<SyncCursor> {
        load_cursor(&self.conn)
    }

    /// Versions of the currently tombstoned records, keyed by id
    pub fn tombstone_versions(&self) -> Result<HashMap<i64, i64>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, version FROM repositories WHERE tombstoned_at IS NOT NULL")
            .storage("prepare tombstone versions")?;
        let versions = stmt
            .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)))
            .storage("query tombstone versions")?
            .collect::<rusqlite::Result<HashMap<_, _>>>()
            .storage("collect tombstone versions")?;
        Ok(versions)
    }

    /// Local star intent, compare-and-swap on the record version. Retried
    /// when a concurrent writer bumped the version in between.
    pub fn set_star_intent(&mut self, repo_id: i64, starred: bool) -> Result<RepositoryRecord> {
        let seen = self
            .get_record(repo_id)?
            .ok_or_else(|| Error::RepoNotFound(repo_id.to_string()))?;
        self.swap_star_intent(seen, starred)
    }

    fn swap_star_intent(
        &mut self,
        mut seen: RepositoryRecord,
        starred: bool,
    ) -> Result<RepositoryRecord> {
        let repo_id = seen.id;
        for attempt in 1..=CAS_RETRIES {
            let swapped = self.write("queue star change", |tx| {
                tx.cas_star_intent(repo_id, starred, seen.version)
            })?;
            let current = self
                .get_record(repo_id)?
                .ok_or_else(|| Error::RepoNotFound(repo_id.to_string()))?;
            if swapped {
                return Ok(current);
            }
            debug!(
                "Version moved under star intent for {} (attempt {})",
                current.full_name(),
                attempt
            );
            seen = current;
        }

        Err(Error::InvalidInput(format!(
            "repository {} kept changing; try again",
            repo_id
        )))
    }

    // =========================================================================
    // Event Operations
    // =========================================================================

    pub fn record_event(&mut self, builder: SyncEventBuilder) -> Result<i64> {
        self.write("record event", |tx| tx.record_event(builder))
    }

    pub fn get_unacknowledged_events(&self) -> Result<Vec<SyncEvent>> {
        self.get_events_with_filter(Some(false), None, None)
    }

    /// Get recent events with optional filters
    pub fn get_events_with_filter(
        &self,
        acknowledged: Option<bool>,
        event_type: Option<EventType>,
        limit: Option<u32>,
    ) -> Result<Vec<SyncEvent>> {
        let mut conditions = Vec::new();
        let mut param_values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(ack) = acknowledged {
            conditions.push(format!("acknowledged = ?{}", param_values.len() + 1));
            param_values.push(Box::new(if ack { 1i32 } else { 0i32 }));
        }
        if let Some(et) = event_type {
            conditions.push(format!("event_type = ?{}", param_values.len() + 1));
            param_values.push(Box::new(et.as_str().to_string()));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        let limit_clause = limit.map(|l| format!(" LIMIT {}", l)).unwrap_or_default();

        let sql = format!(
            r#"
            SELECT id, timestamp, repo_full_name, event_type, severity, summary, details, acknowledged
            FROM sync_events
            {}
            ORDER BY timestamp DESC, id DESC
            {}
            "#,
            where_clause, limit_clause
        );

        let mut stmt = self.conn.prepare(&sql).storage("prepare event query")?;

        let param_refs: Vec<&dyn rusqlite::ToSql> =
            param_values.iter().map(|p| p.as_ref()).collect();

        let events = stmt
            .query_map(param_refs.as_slice(), row_to_event)
            .storage("query events")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .storage("collect events")?;

        Ok(events)
    }

    /// Mark every outstanding event as seen
    pub fn acknowledge_all(&mut self) -> Result<u64> {
        self.write("acknowledge events", |tx| {
            let count = tx
                .tx
                .execute(
                    "UPDATE sync_events SET acknowledged = 1 WHERE acknowledged = 0",
                    [],
                )
                .storage("acknowledge events")?;
            Ok(count as u64)
        })
    }

    pub fn unacknowledged_counts(&self) -> Result<EventCounts> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT severity, COUNT(*) FROM sync_events WHERE acknowledged = 0 GROUP BY severity",
            )
            .storage("prepare event counts")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, u32>(1)?)))
            .storage("count events")?;

        let mut counts = EventCounts::default();
        for row in rows {
            let (severity, count) = row.storage("read event count")?;
            match Severity::parse(&severity) {
                Some(Severity::Info) => counts.info = count,
                Some(Severity::Warning) => counts.warning = count,
                Some(Severity::Error) => counts.error = count,
                None => {}
            }
        }
        Ok(counts)
    }

    /// Clean up acknowledged events older than `days`
    pub fn cleanup_old_events(&mut self, days: u32) -> Result<u64> {
        let cutoff = fmt_ts(Utc::now() - chrono::Duration::days(days as i64));
        self.write("cleanup events", |tx| {
            let count = tx
                .tx
                .execute(
                    "DELETE FROM sync_events WHERE timestamp < ?1 AND acknowledged = 1",
                    params![cutoff],
                )
                .storage("cleanup events")?;
            Ok(count as u64)
        })
    }
}

/// Write handle valid for the duration of one transaction
pub struct StoreTx<'c> {
    tx: rusqlite::Transaction<'c>,
}

impl StoreTx<'_> {
    pub fn get_record(&self, id: i64) -> Result<Option<RepositoryRecord>> {
        get_record(&self.tx, id)
    }

    pub fn load_cursor(&self) -> Result<SyncCursor> {
        load_cursor(&self.tx)
    }

    pub fn save_cursor(&self, cursor: &SyncCursor) -> Result<()> {
        let value = serde_json::to_string(cursor)
            .map_err(|e| Error::InvalidInput(format!("cursor not serializable: {}", e)))?;
        self.tx
            .execute(
                "INSERT INTO sync_state (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![CURSOR_KEY, value],
            )
            .storage("save cursor")?;
        Ok(())
    }

    /// Insert or refresh a record from the remote. Only remote-authoritative
    /// columns are written; tags, folder membership and the dirty queue are
    /// left alone.
    ///
    /// `fetched_tombstone` is the record's version if it was already
    /// tombstoned when the page was requested. A tombstone is only lifted when
    /// that version still matches, so a local unstar confirmed while the page
    /// was in flight survives the commit.
    pub fn upsert_remote(
        &self,
        remote: &RemoteRepo,
        pass_id: u64,
        fetched_tombstone: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<UpsertOutcome> {
        let hash = remote.content_hash();
        let topics = serde_json::to_string(&remote.topics).unwrap_or_else(|_| "[]".to_string());
        let now_s = fmt_ts(now);
        let pushed_at = remote.pushed_at.map(fmt_ts);
        let starred_at = remote.starred_at.map(fmt_ts);

        let Some(existing) = self.get_record(remote.id)? else {
            self.tx
                .execute(
                    r#"
                    INSERT INTO repositories (id, owner, name, description, language, topics, stars,
                        pushed_at, starred_at, html_url, archived, fork, content_hash, last_synced_at,
                        seen_pass, version)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, 1)
                    "#,
                    params![
                        remote.id,
                        remote.owner,
                        remote.name,
                        remote.description,
                        remote.language,
                        topics,
                        remote.stars as i64,
                        pushed_at,
                        starred_at,
                        remote.html_url,
                        remote.archived,
                        remote.fork,
                        hash,
                        now_s,
                        pass_id as i64,
                    ],
                )
                .storage("insert record")?;
            return Ok(UpsertOutcome {
                change: RecordChange::Inserted,
                restored: false,
            });
        };

        // A queued unstar keeps the tombstone decision for the push queue.
        let restored = existing.is_tombstoned()
            && !existing.wants_unstar()
            && fetched_tombstone == Some(existing.version);
        if existing.is_tombstoned() && !existing.wants_unstar() && !restored {
            debug!(
                "Keeping tombstone on {}, changed locally since the page was fetched",
                existing.full_name()
            );
        }

        let change = if existing.content_hash != hash {
            self.tx
                .execute(
                    r#"
                    UPDATE repositories SET
                        owner = ?2, name = ?3, description = ?4, language = ?5, topics = ?6,
                        stars = ?7, pushed_at = ?8, html_url = ?9, archived = ?10, fork = ?11,
                        content_hash = ?12, version = version + 1
                    WHERE id = ?1
                    "#,
                    params![
                        remote.id,
                        remote.owner,
                        remote.name,
                        remote.description,
                        remote.language,
                        topics,
                        remote.stars as i64,
                        pushed_at,
                        remote.html_url,
                        remote.archived,
                        remote.fork,
                        hash,
                    ],
                )
                .storage("update record")?;
            RecordChange::Updated
        } else {
            RecordChange::Unchanged
        };

        self.tx
            .execute(
                r#"
                UPDATE repositories SET
                    starred_at = COALESCE(?2, starred_at),
                    last_synced_at = ?3,
                    seen_pass = ?4,
                    absent_passes = 0,
                    tombstoned_at = CASE WHEN ?5 THEN NULL ELSE tombstoned_at END,
                    version = version + CASE WHEN ?5 THEN 1 ELSE 0 END
                WHERE id = ?1
                "#,
                params![remote.id, starred_at, now_s, pass_id as i64, restored],
            )
            .storage("mark record seen")?;

        Ok(UpsertOutcome { change, restored })
    }

    /// Replace the auto-origin tag set of a record with `desired`. User tags
    /// are never removed; an auto tag whose name a user tag already holds is
    /// skipped. Returns true when anything changed.
    pub fn replace_auto_tags(&self, repo_id: i64, desired: &BTreeSet<String>) -> Result<bool> {
        let current = tag_names(&self.tx, repo_id, TagOrigin::Auto)?;
        let now = fmt_ts(Utc::now());
        let mut changed = false;

        for stale in current.difference(desired) {
            self.tx
                .execute(
                    "DELETE FROM tags WHERE repo_id = ?1 AND name = ?2 AND origin = 'auto'",
                    params![repo_id, stale],
                )
                .storage("remove auto tag")?;
            changed = true;
        }

        for fresh in desired.difference(&current) {
            let inserted = self
                .tx
                .execute(
                    "INSERT OR IGNORE INTO tags (repo_id, name, origin, created_at) VALUES (?1, ?2, 'auto', ?3)",
                    params![repo_id, fresh, now],
                )
                .storage("add auto tag")?;
            changed |= inserted > 0;
        }

        Ok(changed)
    }

    /// Attach a user tag. A same-named auto tag is taken over by the user.
    pub fn add_user_tag(&self, repo_id: i64, name: &str) -> Result<()> {
        self.tx
            .execute(
                r#"
                INSERT INTO tags (repo_id, name, origin, created_at) VALUES (?1, ?2, 'user', ?3)
                ON CONFLICT(repo_id, name) DO UPDATE SET origin = 'user', name = excluded.name
                "#,
                params![repo_id, name, fmt_ts(Utc::now())],
            )
            .storage("add user tag")?;
        Ok(())
    }

    /// Returns false when the record had no such user tag
    pub fn remove_user_tag(&self, repo_id: i64, name: &str) -> Result<bool> {
        let removed = self
            .tx
            .execute(
                "DELETE FROM tags WHERE repo_id = ?1 AND name = ?2 AND origin = 'user'",
                params![repo_id, name],
            )
            .storage("remove user tag")?;
        Ok(removed > 0)
    }

    /// Live-or-tombstoned records that the given pass never saw
    pub fn records_not_seen(&self, pass_id: u64) -> Result<Vec<RepositoryRecord>> {
        let pass_id = pass_id as i64;
        query_records(&self.tx, "WHERE seen_pass <> ?1", params![pass_id], "id")
    }

    pub fn tombstone(&self, repo_id: i64, absent_passes: u32, now: DateTime<Utc>) -> Result<()> {
        self.tx
            .execute(
                r#"
                UPDATE repositories SET
                    tombstoned_at = COALESCE(tombstoned_at, ?2),
                    absent_passes = ?3,
                    version = version + 1
                WHERE id = ?1
                "#,
                params![repo_id, fmt_ts(now), absent_passes],
            )
            .storage("tombstone record")?;
        Ok(())
    }

    /// Hard delete; tags and memberships go with it
    pub fn delete_record(&self, repo_id: i64) -> Result<()> {
        self.tx
            .execute("DELETE FROM repositories WHERE id = ?1", params![repo_id])
            .storage("delete record")?;
        Ok(())
    }

    fn cas_star_intent(&self, repo_id: i64, starred: bool, expected_version: i64) -> Result<bool> {
        let updated = self
            .tx
            .execute(
                r#"
                UPDATE repositories SET
                    local_dirty = 1, desired_starred = ?2, push_attempts = 0,
                    next_attempt_at = NULL, last_push_error = NULL, conflict = 0,
                    version = version + 1
                WHERE id = ?1 AND version = ?3
                "#,
                params![repo_id, starred, expected_version],
            )
            .storage("queue star change")?;
        Ok(updated == 1)
    }

    /// The remote confirmed the queued star state
    pub fn clear_star_intent(&self, repo_id: i64, starred: bool, now: DateTime<Utc>) -> Result<()> {
        self.tx
            .execute(
                r#"
                UPDATE repositories SET
                    local_dirty = 0, desired_starred = NULL, push_attempts = 0,
                    next_attempt_at = NULL, last_push_error = NULL, conflict = 0,
                    tombstoned_at = CASE WHEN ?2 THEN NULL ELSE COALESCE(tombstoned_at, ?3) END,
                    absent_passes = 0,
                    version = version + 1
                WHERE id = ?1
                "#,
                params![repo_id, starred, fmt_ts(now)],
            )
            .storage("clear star intent")?;
        Ok(())
    }

    pub fn record_push_failure(
        &self,
        repo_id: i64,
        attempts: u32,
        error: &str,
        next_attempt_at: Option<DateTime<Utc>>,
        conflict: bool,
    ) -> Result<()> {
        self.tx
            .execute(
                r#"
                UPDATE repositories SET
                    push_attempts = ?2, last_push_error = ?3, next_attempt_at = ?4,
                    conflict = ?5, version = version + 1
                WHERE id = ?1
                "#,
                params![repo_id, attempts, error, next_attempt_at.map(fmt_ts), conflict],
            )
            .storage("record push failure")?;
        Ok(())
    }

    /// Postpone a push without counting it as a failed attempt
    pub fn defer_push(&self, repo_id: i64, next_attempt_at: DateTime<Utc>) -> Result<()> {
        self.tx
            .execute(
                r#"
                UPDATE repositories SET
                    next_attempt_at = ?2, version = version + 1
                WHERE id = ?1
                "#,
                params![repo_id, fmt_ts(next_attempt_at)],
            )
            .storage("defer push")?;
        Ok(())
    }

    /// Re-arm retries for a conflicted record
    pub fn rearm_push(&self, repo_id: i64) -> Result<()> {
        self.tx
            .execute(
                r#"
                UPDATE repositories SET
                    push_attempts = 0, next_attempt_at = NULL, conflict = 0,
                    version = version + 1
                WHERE id = ?1
                "#,
                params![repo_id],
            )
            .storage("rearm push")?;
        Ok(())
    }

    /// Drop the local intent and keep whatever the remote says
    pub fn drop_star_intent(&self, repo_id: i64) -> Result<()> {
        self.tx
            .execute(
                r#"
                UPDATE repositories SET
                    local_dirty = 0, desired_starred = NULL, push_attempts = 0,
                    next_attempt_at = NULL, last_push_error = NULL, conflict = 0,
                    version = version + 1
                WHERE id = ?1
                "#,
                params![repo_id],
            )
            .storage("drop star intent")?;
        Ok(())
    }

    // =========================================================================
    // Folder Writes
    // =========================================================================

    pub fn get_folder_by_key(&self, key: &str) -> Result<Option<VirtualFolder>> {
        get_folder_by_key(&self.tx, key)
    }

    pub fn insert_folder(
        &self,
        name: &str,
        key: &str,
        kind: FolderKind,
        filters: &[String],
        description: &str,
    ) -> Result<i64> {
        let now = fmt_ts(Utc::now());
        let filters = serde_json::to_string(filters).unwrap_or_else(|_| "[]".to_string());
        self.tx
            .execute(
                r#"
                INSERT INTO folders (name, name_key, kind, filters, description, created_at, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
                "#,
                params![name, key, kind.as_str(), filters, description, now],
            )
            .storage("insert folder")?;
        Ok(self.tx.last_insert_rowid())
    }

    pub fn rename_folder(&self, folder_id: i64, name: &str, key: &str) -> Result<()> {
        self.tx
            .execute(
                "UPDATE folders SET name = ?2, name_key = ?3, updated_at = ?4 WHERE id = ?1",
                params![folder_id, name, key, fmt_ts(Utc::now())],
            )
            .storage("rename folder")?;
        Ok(())
    }

    /// Deletes the folder and its membership rows, never the repositories
    pub fn delete_folder(&self, folder_id: i64) -> Result<()> {
        self.tx
            .execute("DELETE FROM folders WHERE id = ?1", params![folder_id])
            .storage("delete folder")?;
        Ok(())
    }

    pub fn manual_folder_of(&self, repo_id: i64) -> Result<Option<i64>> {
        self.tx
            .query_row(
                "SELECT folder_id FROM folder_members WHERE repo_id = ?1",
                params![repo_id],
                |row| row.get(0),
            )
            .optional()
            .storage("get membership")
    }

    pub fn add_member(&self, folder_id: i64, repo_id: i64) -> Result<()> {
        self.tx
            .execute(
                "INSERT OR IGNORE INTO folder_members (folder_id, repo_id, added_at) VALUES (?1, ?2, ?3)",
                params![folder_id, repo_id, fmt_ts(Utc::now())],
            )
            .storage("add folder member")?;
        Ok(())
    }

    pub fn remove_member(&self, folder_id: i64, repo_id: i64) -> Result<bool> {
        let removed = self
            .tx
            .execute(
                "DELETE FROM folder_members WHERE folder_id = ?1 AND repo_id = ?2",
                params![folder_id, repo_id],
            )
            .storage("remove folder member")?;
        Ok(removed > 0)
    }

    pub fn remove_from_all_manual(&self, repo_id: i64) -> Result<usize> {
        self.tx
            .execute(
                "DELETE FROM folder_members WHERE repo_id = ?1",
                params![repo_id],
            )
            .storage("clear memberships")
    }

    // =========================================================================
    // Events
    // =========================================================================

    pub fn record_event(&self, builder: SyncEventBuilder) -> Result<i64> {
        let severity = builder.event_type.severity();

        self.tx
            .execute(
                r#"
                INSERT INTO sync_events (timestamp, repo_full_name, event_type, severity, summary, details)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
                params![
                    fmt_ts(Utc::now()),
                    builder.repo_full_name,
                    builder.event_type.as_str(),
                    severity.as_str(),
                    builder.summary,
                    builder.details,
                ],
            )
            .storage("record event")?;

        debug!(
            "Recorded event: {} - {}",
            builder.event_type.as_str(),
            builder.summary
        );
        Ok(self.tx.last_insert_rowid())
    }
}
