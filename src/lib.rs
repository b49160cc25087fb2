//! Starshelf - an offline mirror of your GitHub stars, organized into
//! virtual folders
//!
//! Starshelf keeps starred repositories in a local SQLite store, derives
//! tags from their attributes and lets you group them into folders that
//! exist only on your machine.
//!
//! ## Core Features
//!
//! - **Incremental Sync**: Page-checkpointed reconciliation with tombstones and resume
//! - **Auto Categorization**: `lang:`, `topic:` and `active`/`stale` tags
//! - **Virtual Folders**: Tag-query folders evaluated live, plus manual folders
//! - **Offline Mutations**: Star/unstar queued locally and retried with backoff
//!
//! ## Modules
//!
//! - [`store`]: Entity store on SQLite
//! - [`sync`]: Reconciliation engine and pending-mutation queue
//! - [`categorizer`]: Auto-tag derivation
//! - [`folders`]: Virtual folder management
//! - [`github`]: GitHub star feed provider
//! - [`shelf`]: Facade for presentation and command consumers

pub mod categorizer;
pub mod config;
pub mod error;
pub mod folders;
pub mod github;
pub mod model;
pub mod provider;
pub mod shelf;
pub mod store;
pub mod sync;

pub use categorizer::Categorizer;
pub use config::Config;
pub use error::{Error, Result};
pub use folders::{FolderManager, TagQuery};
pub use github::GitHubClient;
pub use model::{FolderKind, RepositoryRecord, SortOrder, SyncMode, Tag, TagOrigin, VirtualFolder};
pub use provider::{Offline, StarProvider};
pub use shelf::Shelf;
pub use store::EntityStore;
pub use sync::{Resolution, SyncEngine, SyncOptions, SyncReport};
