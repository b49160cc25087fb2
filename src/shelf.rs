//! Command facade
//!
//! Everything a presentation layer needs: queries, sync triggers and the
//! local mutation entry points, over one entity store and one sync engine.

use anyhow::Context;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info};

use crate::categorizer::{CategoryInputs, Categorizer};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::folders::{FolderManager, FolderMembership};
use crate::model::{RepositoryRecord, SortOrder, SyncMode, Tag, VirtualFolder};
use crate::provider::StarProvider;
use crate::store::{EntityStore, TagCount};
use crate::sync::{PushOutcome, PushSummary, Resolution, SyncEngine, SyncOptions, SyncReport};

pub struct Shelf {
    store: EntityStore,
    engine: SyncEngine,
    sort: SortOrder,
}

impl Shelf {
    pub fn new(store: EntityStore, engine: SyncEngine, sort: SortOrder) -> Self {
        Self {
            store,
            engine,
            sort,
        }
    }

    /// Open the configured store and wire it to `provider`. A brand-new
    /// store gets the configured default folders.
    pub fn open(config: &Config, provider: Arc<dyn StarProvider>) -> anyhow::Result<Self> {
        let db_path = config.db_path();
        let store = EntityStore::open_at(&db_path)
            .with_context(|| format!("Failed to open store at {}", db_path.display()))?;

        let categorizer = Categorizer::new(config.freshness_window()?);
        let options = SyncOptions::from_config(config)?;
        let engine = SyncEngine::new(provider, categorizer, options);

        let mut shelf = Self::new(store, engine, config.behavior.sort_order);
        if shelf.store.count_records()? == 0 && shelf.store.list_folders()?.is_empty() {
            let created = shelf
                .folders()
                .create_default_folders(&config.folders.default_folders)?;
            if !created.is_empty() {
                info!("Created {} default folder(s)", created.len());
            }
        }
        Ok(shelf)
    }

    pub fn store(&self) -> &EntityStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut EntityStore {
        &mut self.store
    }

    pub fn folders(&mut self) -> FolderManager<'_> {
        FolderManager::new(&mut self.store)
    }

    fn sort_or_default(&self, sort: Option<SortOrder>) -> SortOrder {
        sort.unwrap_or(self.sort)
    }

    // =========================================================================
    // Sync
    // =========================================================================

    pub async fn trigger_sync(&mut self, mode: SyncMode) -> Result<SyncReport> {
        self.engine.reconcile(&mut self.store, mode).await
    }

    pub async fn resync(&mut self) -> Result<SyncReport> {
        self.engine.resync(&mut self.store).await
    }

    pub async fn push_pending(&mut self) -> Result<PushSummary> {
        self.engine.push_pending(&mut self.store).await
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    pub async fn set_starred(&mut self, repo: &str, starred: bool) -> Result<PushOutcome> {
        self.engine.set_starred(&mut self.store, repo, starred).await
    }

    pub async fn resolve_conflict(
        &mut self,
        repo: &str,
        resolution: Resolution,
    ) -> Result<PushOutcome> {
        self.engine
            .resolve_conflict(&mut self.store, repo, resolution)
            .await
    }

    pub fn purge(&mut self, repo: &str) -> Result<()> {
        self.engine.purge(&mut self.store, repo)
    }

    fn clean_tag(tag: &str) -> Result<String> {
        let tag = tag.trim();
        if tag.is_empty() {
            return Err(Error::InvalidInput("tag name cannot be empty".to_string()));
        }
        Ok(tag.to_string())
    }

    /// Attach a user tag. User tags are never touched by categorization.
    pub fn tag_repo(&mut self, repo: &str, tag: &str) -> Result<()> {
        let tag = Self::clean_tag(tag)?;
        let record = self.store.resolve(repo)?;
        self.store
            .write("tag repo", |tx| tx.add_user_tag(record.id, &tag))?;
        debug!("Tagged {} with '{}'", record.full_name(), tag);
        Ok(())
    }

    /// Remove a user tag. If the categorizer derives the same name it comes
    /// back as an auto tag in the same transaction.
    pub fn untag_repo(&mut self, repo: &str, tag: &str) -> Result<bool> {
        let tag = Self::clean_tag(tag)?;
        let record = self.store.resolve(repo)?;
        let categorizer = self.engine.categorizer();

        let removed = self.store.write("untag repo", |tx| {
            let removed = tx.remove_user_tag(record.id, &tag)?;
            if removed {
                categorizer.apply(tx, record.id, CategoryInputs::from(&record), Utc::now())?;
            }
            Ok(removed)
        })?;
        if removed {
            debug!("Removed tag '{}' from {}", tag, record.full_name());
        }
        Ok(removed)
    }

    pub fn move_repo(&mut self, repo: &str, folder: &str) -> Result<VirtualFolder> {
        self.folders().move_repo(repo, folder)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn get_repo(&self, repo: &str) -> Result<RepositoryRecord> {
        self.store.resolve(repo)
    }

    pub fn list_repos(&self, sort: Option<SortOrder>) -> Result<Vec<RepositoryRecord>> {
        self.store.list_repos(self.sort_or_default(sort))
    }

    pub fn repos_by_folder(
        &mut self,
        folder: &str,
        sort: Option<SortOrder>,
    ) -> Result<Vec<RepositoryRecord>> {
        let sort = self.sort_or_default(sort);
        self.folders().repos_in_folder(folder, sort)
    }

    pub fn repos_by_tag(&self, tag: &str, sort: Option<SortOrder>) -> Result<Vec<RepositoryRecord>> {
        self.store.repos_by_tag(tag, self.sort_or_default(sort))
    }

    pub fn search(&self, text: &str, sort: Option<SortOrder>) -> Result<Vec<RepositoryRecord>> {
        self.store.search(text, self.sort_or_default(sort))
    }

    pub fn dirty_records(&self) -> Result<Vec<RepositoryRecord>> {
        self.store.dirty_records()
    }

    pub fn tombstoned_records(&self) -> Result<Vec<RepositoryRecord>> {
        self.store.tombstoned_records()
    }

    pub fn pending_conflicts(&self) -> Result<Vec<RepositoryRecord>> {
        self.store.pending_conflicts()
    }

    pub fn tags_for(&self, repo: &str) -> Result<Vec<Tag>> {
        let record = self.store.resolve(repo)?;
        self.store.tags_for(record.id)
    }

    pub fn all_tags(&self) -> Result<Vec<TagCount>> {
        self.store.all_tags()
    }

    pub fn folders_for(&mut self, repo: &str) -> Result<FolderMembership> {
        self.folders().folders_for(repo)
    }
}
