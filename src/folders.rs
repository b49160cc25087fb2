//! Virtual folders
//!
//! Folders are purely local. A manual folder persists its members; a
//! tag-query folder stores only its filters and is evaluated against the
//! current tags every time it is read.

use regex::Regex;
use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::config::DefaultFolder;
use crate::error::{Error, Result};
use crate::model::{
    normalize_folder_name, FolderKind, RepositoryRecord, SortOrder, Tag, VirtualFolder,
};
use crate::store::EntityStore;

/// Compiled tag-query filter. Terms are case-insensitive globs where `*`
/// matches any run of characters; a tag set matches when any term matches
/// any tag.
#[derive(Debug, Clone)]
pub struct TagQuery {
    terms: Vec<Regex>,
}

impl TagQuery {
    pub fn compile(filters: &[String]) -> Result<Self> {
        let terms = filters
            .iter()
            .map(|f| f.trim())
            .filter(|f| !f.is_empty())
            .map(|filter| {
                let pattern = filter
                    .split('*')
                    .map(regex::escape)
                    .collect::<Vec<_>>()
                    .join(".*");
                Regex::new(&format!("(?i)^{}$", pattern)).map_err(|e| {
                    Error::InvalidInput(format!("bad tag filter '{}': {}", filter, e))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        if terms.is_empty() {
            return Err(Error::InvalidInput(
                "a tag-query folder needs at least one tag filter".to_string(),
            ));
        }
        Ok(Self { terms })
    }

    pub fn matches_name(&self, tag: &str) -> bool {
        self.terms.iter().any(|re| re.is_match(tag))
    }

    pub fn matches<'a>(&self, tags: impl IntoIterator<Item = &'a Tag>) -> bool {
        tags.into_iter().any(|tag| self.matches_name(&tag.name))
    }
}

/// Aggregates over the live members of a folder
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FolderStats {
    pub repo_count: usize,
    pub total_stars: u64,
    pub avg_stars: f64,
    pub languages: BTreeMap<String, usize>,
    pub top_language: Option<String>,
}

/// Every folder a repository currently belongs to
#[derive(Debug, Clone, Default)]
pub struct FolderMembership {
    pub manual: Option<VirtualFolder>,
    pub tag_query: Vec<VirtualFolder>,
}

/// CRUD and queries over virtual folders, layered on the entity store
pub struct FolderManager<'s> {
    store: &'s mut EntityStore,
}

impl<'s> FolderManager<'s> {
    pub fn new(store: &'s mut EntityStore) -> Self {
        Self { store }
    }

    fn clean_name(name: &str) -> Result<(String, String)> {
        let folder_name = name.split_whitespace().collect::<Vec<_>>().join(" ");
        if folder_name.is_empty() {
            return Err(Error::InvalidInput("folder name cannot be empty".to_string()));
        }
        let key = normalize_folder_name(&folder_name);
        Ok((folder_name, key))
    }

    pub fn create_folder(
        &mut self,
        name: &str,
        kind: FolderKind,
        filters: &[String],
        description: &str,
    ) -> Result<VirtualFolder> {
        let (folder_name, key) = Self::clean_name(name)?;

        let filters: Vec<String> = match kind {
            FolderKind::TagQuery => {
                TagQuery::compile(filters)?;
                filters
                    .iter()
                    .map(|f| f.trim().to_string())
                    .filter(|f| !f.is_empty())
                    .collect()
            }
            FolderKind::Manual if !filters.is_empty() => {
                return Err(Error::InvalidInput(
                    "manual folders take explicit members, not tag filters".to_string(),
                ))
            }
            FolderKind::Manual => Vec::new(),
        };

        self.store.write("create folder", |tx| {
            if tx.get_folder_by_key(&key)?.is_some() {
                return Err(Error::NameConflict(folder_name.clone()));
            }
            tx.insert_folder(&folder_name, &key, kind, &filters, description)
        })?;

        info!("Created {} folder '{}'", kind.as_str(), folder_name);
        self.get_folder(&folder_name)
    }

    pub fn rename_folder(&mut self, name: &str, new_name: &str) -> Result<VirtualFolder> {
        let folder = self.get_folder(name)?;
        let (folder_name, key) = Self::clean_name(new_name)?;

        self.store.write("rename folder", |tx| {
            if let Some(existing) = tx.get_folder_by_key(&key)? {
                if existing.id != folder.id {
                    return Err(Error::NameConflict(folder_name.clone()));
                }
            }
            tx.rename_folder(folder.id, &folder_name, &key)
        })?;

        info!("Renamed folder '{}' to '{}'", folder.name, folder_name);
        self.get_folder(&folder_name)
    }

    /// Removes the folder and its membership rows. Deleting a folder that
    /// does not exist is a no-op; returns whether anything was deleted.
    pub fn delete_folder(&mut self, name: &str) -> Result<bool> {
        let key = normalize_folder_name(name);
        let deleted = self.store.write("delete folder", |tx| {
            match tx.get_folder_by_key(&key)? {
                Some(folder) => {
                    tx.delete_folder(folder.id)?;
                    Ok(true)
                }
                None => Ok(false),
            }
        })?;

        if deleted {
            info!("Deleted folder '{}'", name);
        } else {
            debug!("Folder '{}' did not exist, nothing to delete", name);
        }
        Ok(deleted)
    }

    fn manual_folder(&self, name: &str) -> Result<VirtualFolder> {
        let folder = self.get_folder(name)?;
        if folder.kind != FolderKind::Manual {
            return Err(Error::NotManualFolder(folder.name));
        }
        Ok(folder)
    }

    /// Add a repository to a manual folder. A repository lives in at most one
    /// manual folder; use [`FolderManager::move_repo`] to switch folders.
    pub fn add_to_folder(&mut self, name: &str, repo: &str) -> Result<()> {
        let folder = self.manual_folder(name)?;
        let record = self.store.resolve(repo)?;

        self.store.write("add to folder", |tx| {
            match tx.manual_folder_of(record.id)? {
                Some(current) if current == folder.id => Ok(()),
                Some(_) => Err(Error::InvalidInput(format!(
                    "{} already belongs to another manual folder; move it instead",
                    record.full_name()
                ))),
                None => tx.add_member(folder.id, record.id),
            }
        })?;

        debug!("Added {} to '{}'", record.full_name(), folder.name);
        Ok(())
    }

    pub fn remove_from_folder(&mut self, name: &str, repo: &str) -> Result<bool> {
        let folder = self.manual_folder(name)?;
        let record = self.store.resolve(repo)?;
        self.store
            .write("remove from folder", |tx| tx.remove_member(folder.id, record.id))
    }

    /// Make `folder` the repository's only manual folder. Tag-query
    /// membership is unaffected.
    pub fn move_repo(&mut self, repo: &str, folder: &str) -> Result<VirtualFolder> {
        let target = self.manual_folder(folder)?;
        let record = self.store.resolve(repo)?;

        self.store.write("move repo", |tx| {
            tx.remove_from_all_manual(record.id)?;
            tx.add_member(target.id, record.id)
        })?;

        info!("Moved {} to '{}'", record.full_name(), target.name);
        Ok(target)
    }

    pub fn list_folders(&self) -> Result<Vec<VirtualFolder>> {
        self.store.list_folders()
    }

    pub fn get_folder(&self, name: &str) -> Result<VirtualFolder> {
        self.store
            .get_folder_by_key(&normalize_folder_name(name))?
            .ok_or_else(|| Error::FolderNotFound(name.trim().to_string()))
    }

    /// Current members. Tag-query folders are evaluated now, never cached.
    pub fn repos_in_folder(&self, name: &str, sort: SortOrder) -> Result<Vec<RepositoryRecord>> {
        let folder = self.get_folder(name)?;
        match folder.kind {
            FolderKind::Manual => self.store.manual_members(folder.id, sort),
            FolderKind::TagQuery => {
                let query = TagQuery::compile(&folder.filters)?;
                Ok(self
                    .store
                    .records_with_tags(sort)?
                    .into_iter()
                    .filter(|(_, tags)| query.matches(tags))
                    .map(|(record, _)| record)
                    .collect())
            }
        }
    }

    pub fn folders_for(&self, repo: &str) -> Result<FolderMembership> {
        let record = self.store.resolve(repo)?;
        Ok(FolderMembership {
            manual: self.store.manual_folder_of(record.id)?,
            tag_query: self.matching_tag_folders(record.id)?,
        })
    }

    /// Tag-query folders whose filters match the repository's current tags
    pub fn suggest_folders(&self, repo: &str) -> Result<Vec<VirtualFolder>> {
        let record = self.store.resolve(repo)?;
        self.matching_tag_folders(record.id)
    }

    fn matching_tag_folders(&self, repo_id: i64) -> Result<Vec<VirtualFolder>> {
        let tags = self.store.tags_for(repo_id)?;
        let mut matching = Vec::new();
        for folder in self.store.list_folders()? {
            if folder.kind == FolderKind::TagQuery
                && TagQuery::compile(&folder.filters)?.matches(&tags)
            {
                matching.push(folder);
            }
        }
        Ok(matching)
    }

    pub fn folder_stats(&self, name: &str) -> Result<FolderStats> {
        let repos = self.repos_in_folder(name, SortOrder::Stars)?;
        if repos.is_empty() {
            return Ok(FolderStats::default());
        }

        let mut languages: BTreeMap<String, usize> = BTreeMap::new();
        for repo in &repos {
            if let Some(language) = &repo.language {
                *languages.entry(language.clone()).or_default() += 1;
            }
        }

        let total_stars: u64 = repos.iter().map(|r| r.stars).sum();
        // Ties resolve to the alphabetically first language.
        let top_language = languages
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
            .map(|(language, _)| language.clone());

        Ok(FolderStats {
            repo_count: repos.len(),
            total_stars,
            avg_stars: total_stars as f64 / repos.len() as f64,
            languages,
            top_language,
        })
    }

    /// Create configured tag-query folders that do not exist yet
    pub fn create_default_folders(
        &mut self,
        defaults: &[DefaultFolder],
    ) -> Result<Vec<VirtualFolder>> {
        let mut created = Vec::new();
        for default in defaults {
            if self
                .store
                .get_folder_by_key(&normalize_folder_name(&default.name))?
                .is_some()
            {
                continue;
            }
            created.push(self.create_folder(
                &default.name,
                FolderKind::TagQuery,
                &default.tags,
                &default.description,
            )?);
        }
        Ok(created)
    }
}
