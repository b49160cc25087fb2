//! Sync Engine - reconciles the remote star feed with the entity store
//!
//! A pass walks the star feed page by page. Each page is committed in its
//! own transaction together with categorization and the advanced cursor, so
//! an interrupted pass leaves the store at the last fully committed page and
//! can be resumed from there. The next page is prefetched while the current
//! one commits; commits stay strictly sequential.
//!
//! Local star/unstar intents live on the records themselves as a queue of
//! dirty rows with attempt counters. They are pushed at the start of every
//! pass and become a pending conflict once the retry budget is spent. Pushes
//! spend the same rate-limit budget as fetches; a rate-limited push is
//! deferred to the end of the window without counting as an attempt.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::categorizer::{CategoryInputs, Categorizer};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::model::{RateLimitInfo, RepositoryRecord, SyncCursor, SyncMode};
use crate::provider::{RepoRef, StarPage, StarProvider};
use crate::store::{EntityStore, EventType, RecordChange, StoreTx, SyncEventBuilder};

/// Tunables for a sync engine
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Stop before a fetch when fewer calls than this remain
    pub rate_limit_buffer: u32,
    pub request_timeout: Duration,
    /// Failed pushes before a dirty record becomes a pending conflict
    pub max_push_attempts: u32,
    pub retry_backoff: Duration,
    pub retry_backoff_max: Duration,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            rate_limit_buffer: 100,
            request_timeout: Duration::from_secs(30),
            max_push_attempts: 3,
            retry_backoff: Duration::from_secs(30),
            retry_backoff_max: Duration::from_secs(3600),
        }
    }
}

impl SyncOptions {
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let (retry_backoff, retry_backoff_max) = config.retry_backoff()?;
        Ok(Self {
            rate_limit_buffer: config.sync.rate_limit_buffer,
            request_timeout: config.request_timeout(),
            max_push_attempts: config.sync.max_push_attempts.max(1),
            retry_backoff,
            retry_backoff_max,
        })
    }
}

/// Results from one reconciliation pass
#[derive(Debug, Clone, PartialEq)]
pub struct SyncReport {
    /// Mode the pass finished in
    pub mode: SyncMode,
    pub added: usize,
    pub updated: usize,
    /// Newly tombstoned records
    pub removed: usize,
    /// Records where a queued local intent disagreed with the remote
    pub conflicted: usize,
    pub restored: usize,
    /// Tombstones promoted to deletion
    pub purged: usize,
    /// Pages committed by this call
    pub pages: u32,
    /// Continued an interrupted pass instead of starting a new one
    pub resumed: bool,
    /// Incremental ordering could not be trusted; the pass ran as full
    pub degraded_to_full: bool,
    /// Incremental pass reached the checkpoint before the end of the feed
    pub stopped_early: bool,
    /// Queued star changes confirmed by the remote during this call
    pub pushed: usize,
    pub pending_conflicts: usize,
    pub duration: Duration,
}

impl SyncReport {
    fn new(mode: SyncMode) -> Self {
        Self {
            mode,
            added: 0,
            updated: 0,
            removed: 0,
            conflicted: 0,
            restored: 0,
            purged: 0,
            pages: 0,
            resumed: false,
            degraded_to_full: false,
            stopped_early: false,
            pushed: 0,
            pending_conflicts: 0,
            duration: Duration::ZERO,
        }
    }

    /// True when nothing in the store changed
    pub fn is_noop(&self) -> bool {
        self.added == 0
            && self.updated == 0
            && self.removed == 0
            && self.restored == 0
            && self.purged == 0
    }
}

/// Outcome of draining the pending-mutation queue
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushSummary {
    pub pushed: usize,
    pub failed: usize,
    pub new_conflicts: usize,
}

/// What happened to a single star change
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    /// Remote confirmed the change
    Applied,
    /// Remote call failed; the change stays queued for a later retry
    Queued { error: String, attempts: u32 },
    /// The record changed while the call was in flight; left for the next push
    Superseded,
}

/// How to settle a pending conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Keep the local intent and retry pushing it
    KeepLocal,
    /// Drop the local intent and keep the remote state
    AcceptRemote,
}

impl Resolution {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "keep-local" | "keep_local" | "local" => Some(Resolution::KeepLocal),
            "accept-remote" | "accept_remote" | "remote" => Some(Resolution::AcceptRemote),
            _ => None,
        }
    }
}

/// Backoff before retry number `attempts + 1`: `base * 2^(attempts - 1)`, capped
pub fn backoff_delay(base: Duration, max: Duration, attempts: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempts.saturating_sub(1));
    base.saturating_mul(factor).min(max)
}

async fn fetch_page(
    provider: &dyn StarProvider,
    page: u32,
    request_timeout: Duration,
) -> Result<StarPage> {
    match timeout(request_timeout, provider.fetch_starred_page(page)).await {
        Ok(result) => result,
        Err(_) => Err(Error::remote(
            format!("fetch page {}", page),
            format!("request timed out after {}s", request_timeout.as_secs()),
        )),
    }
}

/// A page together with the tombstones that existed when it was requested
struct FetchedPage {
    page: StarPage,
    tombstones: HashMap<i64, i64>,
}

/// Next page fetched in the background while the current one commits.
/// Dropping it cancels the request.
struct Prefetch {
    page: u32,
    tombstones: HashMap<i64, i64>,
    handle: JoinHandle<Result<StarPage>>,
}

impl Prefetch {
    fn spawn(
        provider: Arc<dyn StarProvider>,
        page: u32,
        request_timeout: Duration,
        tombstones: HashMap<i64, i64>,
    ) -> Self {
        let handle =
            tokio::spawn(async move { fetch_page(provider.as_ref(), page, request_timeout).await });
        Self {
            page,
            tombstones,
            handle,
        }
    }

    async fn join(mut self) -> Result<FetchedPage> {
        let page = match (&mut self.handle).await {
            Ok(result) => result?,
            Err(e) => return Err(Error::remote(format!("fetch page {}", self.page), e)),
        };
        Ok(FetchedPage {
            page,
            tombstones: std::mem::take(&mut self.tombstones),
        })
    }
}

impl Drop for Prefetch {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[derive(Debug, Default)]
struct PageCounts {
    added: usize,
    updated: usize,
    restored: usize,
    conflicted: usize,
    pushed: usize,
}

/// How an incremental pass should treat a fetched page
#[derive(Debug, PartialEq, Eq)]
enum PageVerdict {
    Apply,
    /// Whole page predates the checkpoint; the pass is complete
    Stop,
    /// Ordering cannot be trusted; continue as a full pass
    Degrade(&'static str),
}

fn judge_incremental_page(
    page: &StarPage,
    checkpoint: Option<DateTime<Utc>>,
    previous_oldest: Option<DateTime<Utc>>,
) -> PageVerdict {
    let mut stamps = Vec::with_capacity(page.repos.len());
    for repo in &page.repos {
        match repo.starred_at {
            Some(ts) => stamps.push(ts),
            None => return PageVerdict::Degrade("star timestamps missing"),
        }
    }

    let Some(&newest) = stamps.first() else {
        return PageVerdict::Apply;
    };
    if stamps.windows(2).any(|w| w[1] > w[0]) {
        return PageVerdict::Degrade("page not in reverse-chronological order");
    }
    if previous_oldest.is_some_and(|prev| newest > prev) {
        return PageVerdict::Degrade("page newer than the previous page");
    }

    match checkpoint {
        Some(checkpoint) if newest < checkpoint => PageVerdict::Stop,
        _ => PageVerdict::Apply,
    }
}

/// Only settle the intent a push actually carried
fn version_unchanged(tx: &StoreTx<'_>, record: &RepositoryRecord) -> Result<bool> {
    Ok(tx
        .get_record(record.id)?
        .is_some_and(|current| current.version == record.version))
}

fn repo_ref(record: &RepositoryRecord) -> RepoRef {
    RepoRef {
        id: record.id,
        owner: record.owner.clone(),
        name: record.name.clone(),
    }
}

/// The reconciliation engine
#[derive(Clone)]
pub struct SyncEngine {
    provider: Arc<dyn StarProvider>,
    categorizer: Categorizer,
    options: SyncOptions,
}

impl SyncEngine {
    pub fn new(
        provider: Arc<dyn StarProvider>,
        categorizer: Categorizer,
        options: SyncOptions,
    ) -> Self {
        Self {
            provider,
            categorizer,
            options,
        }
    }

    pub fn provider_name(&self) -> &'static str {
        self.provider.provider_name()
    }

    pub fn categorizer(&self) -> &Categorizer {
        &self.categorizer
    }

    /// Reset the cursor and run a fresh full pass
    pub async fn resync(&self, store: &mut EntityStore) -> Result<SyncReport> {
        info!("Full resync requested, resetting sync cursor");
        store.write("reset cursor", |tx| {
            let old = tx.load_cursor()?;
            tx.save_cursor(&SyncCursor {
                pass_id: old.pass_id,
                rate_limit: old.rate_limit,
                ..Default::default()
            })
        })?;
        self.reconcile(store, SyncMode::Full).await
    }

    /// Run (or resume) a reconciliation pass
    pub async fn reconcile(&self, store: &mut EntityStore, mode: SyncMode) -> Result<SyncReport> {
        let started = Instant::now();
        let now = Utc::now();

        let push = self.push_pending(store).await?;

        let mut cursor = store.load_cursor()?;
        let resumable = cursor.in_flight()
            && (cursor.mode == Some(mode) || cursor.mode == Some(SyncMode::Full));

        let mut report;
        if resumable {
            let resumed_mode = cursor.mode.unwrap_or(mode);
            report = SyncReport::new(resumed_mode);
            report.resumed = true;
            info!(
                "Resuming {} pass {} at page {}",
                resumed_mode.as_str(),
                cursor.pass_id,
                cursor.next_page.unwrap_or(1)
            );
        } else {
            let effective = if mode == SyncMode::Incremental && cursor.checkpoint.is_none() {
                info!("No sync checkpoint yet, running a full pass");
                SyncMode::Full
            } else {
                mode
            };
            report = SyncReport::new(effective);

            cursor = SyncCursor {
                pass_id: cursor.pass_id + 1,
                mode: Some(effective),
                next_page: Some(1),
                pass_started_at: Some(now),
                checkpoint: cursor.checkpoint,
                pass_newest: None,
                last_completed_at: cursor.last_completed_at,
                rate_limit: cursor.rate_limit,
            };
            let fresh = cursor.clone();
            store.write("start pass", |tx| tx.save_cursor(&fresh))?;
            info!(
                "Starting {} pass {} via {}",
                effective.as_str(),
                cursor.pass_id,
                self.provider.provider_name()
            );
        }
        report.pushed = push.pushed;

        match self.run_pages(store, &mut cursor, &mut report).await {
            Ok(()) => {}
            Err(e) => {
                let e = e.with_committed_pages(report.pages);
                warn!("Sync pass {} interrupted: {}", cursor.pass_id, e);
                if let Err(log_err) = store.record_event(
                    SyncEventBuilder::new(EventType::PassInterrupted, "Sync pass interrupted")
                        .details(e.to_string()),
                ) {
                    warn!("Failed to record interrupted pass: {}", log_err);
                }
                return Err(e);
            }
        }

        report.pending_conflicts = store.pending_conflicts()?.len();
        report.duration = started.elapsed();

        info!(
            "Sync completed in {:.2}s: {} added, {} updated, {} removed, {} restored, {} purged, {} conflicted ({} pages)",
            report.duration.as_secs_f64(),
            report.added,
            report.updated,
            report.removed,
            report.restored,
            report.purged,
            report.conflicted,
            report.pages
        );
        if report.pending_conflicts > 0 {
            warn!(
                "{} pending conflict(s) need resolution",
                report.pending_conflicts
            );
        }

        Ok(report)
    }

    fn check_budget(&self, cursor: &SyncCursor, now: DateTime<Utc>) -> Result<()> {
        let Some(rate_limit) = cursor.rate_limit else {
            return Ok(());
        };
        let window_open = rate_limit.reset_at.is_some_and(|reset| reset > now);
        if rate_limit.remaining < self.options.rate_limit_buffer && window_open {
            return Err(Error::RateLimited {
                retry_after: rate_limit.retry_after(now),
                committed_pages: 0,
            });
        }
        Ok(())
    }

    fn budget_allows_prefetch(&self, rate_limit: &RateLimitInfo) -> bool {
        rate_limit.remaining >= self.options.rate_limit_buffer.saturating_add(1)
    }

    async fn run_pages(
        &self,
        store: &mut EntityStore,
        cursor: &mut SyncCursor,
        report: &mut SyncReport,
    ) -> Result<()> {
        let mut prefetch: Option<Prefetch> = None;
        let mut previous_oldest: Option<DateTime<Utc>> = None;

        while let Some(page_no) = cursor.next_page {
            self.check_budget(cursor, Utc::now())?;

            let fetched = match prefetch.take() {
                Some(pending) if pending.page == page_no => pending.join().await?,
                _ => {
                    let tombstones = store.tombstone_versions()?;
                    let page =
                        fetch_page(self.provider.as_ref(), page_no, self.options.request_timeout)
                            .await?;
                    FetchedPage { page, tombstones }
                }
            };
            let page = &fetched.page;
            debug!(
                "Fetched page {} ({} repositories, {} calls remaining)",
                page_no,
                page.repos.len(),
                page.rate_limit.remaining
            );

            let mut stop = false;
            if cursor.mode == Some(SyncMode::Incremental) {
                match judge_incremental_page(page, cursor.checkpoint, previous_oldest) {
                    PageVerdict::Apply => {}
                    PageVerdict::Stop => stop = true,
                    PageVerdict::Degrade(reason) => {
                        warn!(
                            "Incremental sync falling back to a full pass at page {}: {}",
                            page_no, reason
                        );
                        cursor.mode = Some(SyncMode::Full);
                        report.mode = SyncMode::Full;
                        report.degraded_to_full = true;
                        store.record_event(
                            SyncEventBuilder::new(
                                EventType::IncrementalFallback,
                                "Incremental sync ran as a full pass",
                            )
                            .details(format!("page {}: {}", page_no, reason)),
                        )?;
                    }
                }
            }
            previous_oldest = page
                .repos
                .iter()
                .filter_map(|r| r.starred_at)
                .min()
                .or(previous_oldest);

            if stop {
                info!(
                    "Page {} predates the checkpoint, incremental pass complete",
                    page_no
                );
                report.stopped_early = true;
                cursor.rate_limit = Some(page.rate_limit);
                cursor.next_page = None;
                break;
            }

            if let Some(next) = page.next_page {
                if self.budget_allows_prefetch(&page.rate_limit) {
                    prefetch = Some(Prefetch::spawn(
                        Arc::clone(&self.provider),
                        next,
                        self.options.request_timeout,
                        store.tombstone_versions()?,
                    ));
                }
            }

            self.commit_page(store, cursor, &fetched, report)?;
        }

        drop(prefetch);
        self.finish_pass(store, cursor, report)
    }

    /// Apply one page, categorize it and advance the cursor atomically
    fn commit_page(
        &self,
        store: &mut EntityStore,
        cursor: &mut SyncCursor,
        fetched: &FetchedPage,
        report: &mut SyncReport,
    ) -> Result<()> {
        let page = &fetched.page;
        let now = Utc::now();
        let pass_id = cursor.pass_id;

        let mut next = cursor.clone();
        next.next_page = page.next_page;
        next.rate_limit = Some(page.rate_limit);
        next.pass_newest = page
            .repos
            .iter()
            .filter_map(|r| r.starred_at)
            .chain(cursor.pass_newest)
            .max();

        let counts = store.write("commit page", |tx| {
            let mut counts = PageCounts::default();
            for remote in &page.repos {
                let fetched_tombstone = fetched.tombstones.get(&remote.id).copied();
                let outcome = tx.upsert_remote(remote, pass_id, fetched_tombstone, now)?;
                match outcome.change {
                    RecordChange::Inserted => counts.added += 1,
                    RecordChange::Updated => counts.updated += 1,
                    RecordChange::Unchanged => {}
                }
                if outcome.restored {
                    counts.restored += 1;
                    info!("Restored {} after it reappeared", remote.full_name());
                    tx.record_event(
                        SyncEventBuilder::new(EventType::Restored, "Repository reappeared")
                            .repo(remote.full_name()),
                    )?;
                }

                self.categorizer
                    .apply(tx, remote.id, CategoryInputs::from(remote), now)?;

                if let Some(record) = tx.get_record(remote.id)? {
                    if record.wants_unstar() {
                        // Still listed remotely: the queued unstar wins and is retried.
                        counts.conflicted += 1;
                        debug!(
                            "{} still starred remotely, keeping local unstar",
                            record.full_name()
                        );
                    } else if record.wants_star() {
                        tx.clear_star_intent(record.id, true, now)?;
                        counts.pushed += 1;
                    }
                }
            }
            tx.save_cursor(&next)?;
            Ok(counts)
        })?;

        *cursor = next;
        report.pages += 1;
        report.added += counts.added;
        report.updated += counts.updated;
        report.restored += counts.restored;
        report.conflicted += counts.conflicted;
        report.pushed += counts.pushed;

        debug!(
            "Committed page (pass {}, {} repositories, next page {:?})",
            pass_id,
            page.repos.len(),
            cursor.next_page
        );
        Ok(())
    }

    /// Close the pass: sweep absences after a full pass and advance the
    /// checkpoint, in one transaction
    fn finish_pass(
        &self,
        store: &mut EntityStore,
        cursor: &mut SyncCursor,
        report: &mut SyncReport,
    ) -> Result<()> {
        let now = Utc::now();
        let full = cursor.mode == Some(SyncMode::Full);

        let mut done = cursor.clone();
        done.next_page = None;
        done.checkpoint = done.pass_newest.max(done.checkpoint);
        done.last_completed_at = Some(now);

        let (removed, purged, conflicted) = store.write("finish pass", |tx| {
            let swept = if full {
                self.sweep_absent(tx, done.pass_id, now)?
            } else {
                (0, 0, 0)
            };
            tx.save_cursor(&done)?;
            Ok(swept)
        })?;

        *cursor = done;
        report.removed += removed;
        report.purged += purged;
        report.conflicted += conflicted;
        Ok(())
    }

    /// Tombstone records a full pass did not see; delete the ones that were
    /// already absent from the previous full pass
    fn sweep_absent(
        &self,
        tx: &StoreTx<'_>,
        pass_id: u64,
        now: DateTime<Utc>,
    ) -> Result<(usize, usize, usize)> {
        let (mut removed, mut purged, mut conflicted) = (0, 0, 0);

        for record in tx.records_not_seen(pass_id)? {
            let name = record.full_name();

            if record.wants_star() {
                // Missing remotely but queued to be starred; the push decides.
                conflicted += 1;
                continue;
            }
            if record.wants_unstar() {
                // Already gone remotely, so the queued unstar is satisfied.
                tx.clear_star_intent(record.id, false, now)?;
            }

            let prior = if record.is_tombstoned() {
                record.absent_passes
            } else {
                0
            };
            let absent = prior + 1;

            if absent >= 2 {
                tx.delete_record(record.id)?;
                purged += 1;
                info!("Purged {} after {} full passes without it", name, absent);
                tx.record_event(
                    SyncEventBuilder::new(EventType::Purged, "Confirmed absent, deleted")
                        .repo(&name)
                        .details(format!("absent from {} consecutive full passes", absent)),
                )?;
            } else {
                tx.tombstone(record.id, absent, now)?;
                if !record.is_tombstoned() {
                    removed += 1;
                    info!("Tombstoned {}, no longer starred remotely", name);
                    tx.record_event(
                        SyncEventBuilder::new(EventType::Tombstoned, "Missing from full pass")
                            .repo(&name),
                    )?;
                }
            }
        }

        Ok((removed, purged, conflicted))
    }

    // =========================================================================
    // Pending-mutation queue
    // =========================================================================

    /// Push every due star change. Transport failures are recorded on the
    /// record; an expired token or an exhausted rate-limit budget aborts the
    /// drain and leaves the rest queued.
    pub async fn push_pending(&self, store: &mut EntityStore) -> Result<PushSummary> {
        let mut summary = PushSummary::default();
        let due = store.due_pushes(Utc::now())?;
        if due.is_empty() {
            return Ok(summary);
        }

        info!("Pushing {} queued star change(s)", due.len());
        for record in due {
            match self.push_one(store, &record).await {
                Ok(PushOutcome::Applied) => summary.pushed += 1,
                Ok(PushOutcome::Queued { .. }) => summary.failed += 1,
                Ok(PushOutcome::Superseded) => {}
                Err(Error::PendingConflict { .. }) => {
                    summary.failed += 1;
                    summary.new_conflicts += 1;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(summary)
    }

    /// Propagate one record's queued intent. Fails with `PendingConflict`
    /// when this attempt exhausts the retry budget. `AuthExpired` and
    /// `RateLimited` leave the attempt counter alone.
    async fn push_one(
        &self,
        store: &mut EntityStore,
        record: &RepositoryRecord,
    ) -> Result<PushOutcome> {
        let Some(desired) = record.desired_starred else {
            store.write("drop empty intent", |tx| tx.drop_star_intent(record.id))?;
            return Ok(PushOutcome::Superseded);
        };
        let target = repo_ref(record);
        let operation = if desired { "star" } else { "unstar" };

        if let Err(e) = self.check_budget(&store.load_cursor()?, Utc::now()) {
            debug!(
                "Holding {} {}, rate-limit budget below the buffer",
                operation,
                target.full_name()
            );
            return Err(e);
        }

        let result = match timeout(
            self.options.request_timeout,
            self.provider.set_starred(&target, desired),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(Error::remote(
                format!("{} {}", operation, target.full_name()),
                format!(
                    "request timed out after {}s",
                    self.options.request_timeout.as_secs()
                ),
            )),
        };
        let now = Utc::now();

        match result {
            Ok(rate_limit) => {
                let applied = store.write("confirm push", |tx| {
                    let mut cursor = tx.load_cursor()?;
                    cursor.rate_limit = Some(rate_limit);
                    tx.save_cursor(&cursor)?;
                    if !version_unchanged(tx, record)? {
                        return Ok(false);
                    }
                    tx.clear_star_intent(record.id, desired, now)?;
                    Ok(true)
                })?;
                if applied {
                    info!("{} {} confirmed", operation, target.full_name());
                    Ok(PushOutcome::Applied)
                } else {
                    Ok(PushOutcome::Superseded)
                }
            }
            Err(e @ Error::AuthExpired { .. }) => {
                error!("{} {} rejected: {}", operation, target.full_name(), e);
                Err(e)
            }
            Err(Error::RateLimited { retry_after, .. }) => {
                let resume_at = now
                    + chrono::Duration::from_std(retry_after)
                        .unwrap_or_else(|_| chrono::Duration::zero());
                store.write("defer push", |tx| {
                    let mut cursor = tx.load_cursor()?;
                    let limit = cursor.rate_limit.map(|r| r.limit).unwrap_or_default();
                    cursor.rate_limit = Some(RateLimitInfo {
                        limit,
                        remaining: 0,
                        reset_at: Some(resume_at),
                    });
                    tx.save_cursor(&cursor)?;
                    if version_unchanged(tx, record)? {
                        tx.defer_push(record.id, resume_at)?;
                    }
                    Ok(())
                })?;
                warn!(
                    "{} {} rate limited, deferred for {}s",
                    operation,
                    target.full_name(),
                    retry_after.as_secs()
                );
                Err(Error::RateLimited {
                    retry_after,
                    committed_pages: 0,
                })
            }
            Err(e) => {
                let attempts = record.push_attempts + 1;
                let message = e.to_string();
                let conflict = attempts >= self.options.max_push_attempts;
                let next_attempt_at = if conflict {
                    None
                } else {
                    let delay = backoff_delay(
                        self.options.retry_backoff,
                        self.options.retry_backoff_max,
                        attempts,
                    );
                    chrono::Duration::from_std(delay).ok().map(|d| now + d)
                };

                let recorded = store.write("record push failure", |tx| {
                    if !version_unchanged(tx, record)? {
                        return Ok(false);
                    }
                    tx.record_push_failure(record.id, attempts, &message, next_attempt_at, conflict)?;
                    let event = if conflict {
                        SyncEventBuilder::new(
                            EventType::PendingConflict,
                            format!("{} could not be applied remotely", operation),
                        )
                    } else {
                        SyncEventBuilder::new(EventType::PushFailed, format!("{} failed", operation))
                    };
                    tx.record_event(
                        event
                            .repo(target.full_name())
                            .details(format!("attempt {}: {}", attempts, message)),
                    )?;
                    Ok(true)
                })?;

                if !recorded {
                    return Ok(PushOutcome::Superseded);
                }
                if conflict {
                    error!(
                        "{} {} failed {} time(s), needs resolution: {}",
                        operation,
                        target.full_name(),
                        attempts,
                        message
                    );
                    return Err(Error::PendingConflict {
                        repo: target.full_name(),
                        desired_starred: desired,
                        attempts,
                        last_error: message,
                    });
                }
                warn!(
                    "{} {} failed (attempt {}), will retry: {}",
                    operation,
                    target.full_name(),
                    attempts,
                    message
                );
                Ok(PushOutcome::Queued {
                    error: message,
                    attempts,
                })
            }
        }
    }

    /// Queue a star change and try to push it right away
    pub async fn set_starred(
        &self,
        store: &mut EntityStore,
        repo: &str,
        starred: bool,
    ) -> Result<PushOutcome> {
        let record = store.resolve(repo)?;
        let queued = store.set_star_intent(record.id, starred)?;
        self.push_one(store, &queued).await
    }

    /// Settle a pending conflict
    pub async fn resolve_conflict(
        &self,
        store: &mut EntityStore,
        repo: &str,
        resolution: Resolution,
    ) -> Result<PushOutcome> {
        let record = store.resolve(repo)?;
        if !record.local_dirty {
            return Err(Error::InvalidInput(format!(
                "{} has no pending star change",
                record.full_name()
            )));
        }

        let name = record.full_name();
        match resolution {
            Resolution::KeepLocal => {
                store.write("keep local intent", |tx| {
                    tx.rearm_push(record.id)?;
                    tx.record_event(
                        SyncEventBuilder::new(EventType::ConflictResolved, "Kept local intent")
                            .repo(&name),
                    )
                })?;
                info!("Keeping local intent for {}, retrying", name);
                let rearmed = store
                    .get_record(record.id)?
                    .ok_or_else(|| Error::RepoNotFound(name.clone()))?;
                self.push_one(store, &rearmed).await
            }
            Resolution::AcceptRemote => {
                store.write("accept remote state", |tx| {
                    tx.drop_star_intent(record.id)?;
                    tx.record_event(
                        SyncEventBuilder::new(EventType::ConflictResolved, "Accepted remote state")
                            .repo(&name),
                    )
                })?;
                info!("Dropped local intent for {}", name);
                Ok(PushOutcome::Superseded)
            }
        }
    }

    /// Hard-delete a tombstoned record with its tags and memberships
    pub fn purge(&self, store: &mut EntityStore, repo: &str) -> Result<()> {
        let record = store.resolve(repo)?;
        if !record.is_tombstoned() {
            return Err(Error::InvalidInput(format!(
                "{} is still starred; unstar it before purging",
                record.full_name()
            )));
        }

        let name = record.full_name();
        store.write("purge record", |tx| {
            tx.delete_record(record.id)?;
            tx.record_event(
                SyncEventBuilder::new(EventType::Purged, "Purged on request").repo(&name),
            )?;
            Ok(())
        })?;
        info!("Purged {}", name);
        Ok(())
    }
}
