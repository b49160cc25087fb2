use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::io::{self, BufRead, Write};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use starshelf::config::LoggingConfig;
use starshelf::error::Error;
use starshelf::folders::FolderStats;
use starshelf::github::{self, GitHubClient};
use starshelf::store::{EventType, Severity};
use starshelf::sync::{PushOutcome, SyncReport};
use starshelf::{
    Config, FolderKind, Offline, RepositoryRecord, Resolution, Shelf, SortOrder, StarProvider,
    SyncMode,
};

#[derive(Parser)]
#[command(name = "starshelf")]
#[command(about = "Offline mirror of your GitHub stars with virtual folders")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (defaults to XDG config location)
    #[arg(short, long)]
    config: Option<std::path::PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Write the default configuration and create the store
    Init {
        /// Skip the authentication check
        #[arg(long)]
        skip_auth: bool,
    },

    /// Manage authentication
    Auth {
        #[command(subcommand)]
        auth_command: AuthCommands,
    },

    /// Reconcile the local store with your GitHub stars
    Sync {
        /// Walk the whole star feed and detect removals
        #[arg(long)]
        full: bool,

        /// Discard the sync cursor and start a fresh full pass
        #[arg(long, conflicts_with = "full")]
        resync: bool,
    },

    /// List repositories from the local store
    List {
        /// Only repositories in this folder
        #[arg(long, conflicts_with_all = ["tag", "search"])]
        folder: Option<String>,

        /// Only repositories with this tag
        #[arg(long, conflicts_with = "search")]
        tag: Option<String>,

        /// Search names and descriptions
        #[arg(long)]
        search: Option<String>,

        /// Sort order (defaults to behavior.sort_order)
        #[arg(long, value_enum)]
        sort: Option<SortArg>,

        /// Show repository details
        #[arg(long)]
        details: bool,
    },

    /// Add or remove user tags
    Tag {
        #[command(subcommand)]
        tag_command: TagCommands,
    },

    /// Show all tags with usage counts
    Tags,

    /// Manage virtual folders
    Folder {
        #[command(subcommand)]
        folder_command: FolderCommands,
    },

    /// Move a repository into a manual folder (leaving any other)
    Move { repo: String, folder: String },

    /// Star a repository
    Star { repo: String },

    /// Unstar a repository
    Unstar {
        repo: String,

        /// Don't ask for confirmation
        #[arg(short, long)]
        yes: bool,
    },

    /// Show star changes not yet confirmed by GitHub
    Pending,

    /// Settle a pending conflict
    Resolve {
        repo: String,

        #[arg(value_enum)]
        resolution: ResolutionArg,
    },

    /// Permanently delete a tombstoned repository with its tags
    Purge { repo: String },

    /// Show the sync event log
    Events {
        /// Include acknowledged events
        #[arg(long)]
        all: bool,

        /// Acknowledge the events shown
        #[arg(long)]
        ack: bool,
    },
}

#[derive(Subcommand)]
enum AuthCommands {
    /// Check which credentials are used and whom they belong to
    Status,
}

#[derive(Subcommand)]
enum TagCommands {
    Add { repo: String, tag: String },
    Remove { repo: String, tag: String },
}

#[derive(Subcommand)]
enum FolderCommands {
    /// Create a folder; with --tag it is a tag-query folder, otherwise manual
    Create {
        name: String,

        /// Tag filter (repeatable, `*` wildcards allowed)
        #[arg(short, long = "tag")]
        tags: Vec<String>,

        #[arg(short, long, default_value = "")]
        description: String,
    },
    Rename { name: String, new_name: String },
    Delete { name: String },
    Add { folder: String, repo: String },
    Remove { folder: String, repo: String },
    List,
    Show {
        name: String,

        #[arg(long, value_enum)]
        sort: Option<SortArg>,
    },
    Stats { name: String },
}

#[derive(Clone, Copy, ValueEnum)]
enum SortArg {
    Stars,
    Updated,
    Name,
    Language,
}

impl From<SortArg> for SortOrder {
    fn from(arg: SortArg) -> Self {
        match arg {
            SortArg::Stars => SortOrder::Stars,
            SortArg::Updated => SortOrder::Updated,
            SortArg::Name => SortOrder::Name,
            SortArg::Language => SortOrder::Language,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum ResolutionArg {
    KeepLocal,
    AcceptRemote,
}

impl From<ResolutionArg> for Resolution {
    fn from(arg: ResolutionArg) -> Self {
        match arg {
            ResolutionArg::KeepLocal => Resolution::KeepLocal,
            ResolutionArg::AcceptRemote => Resolution::AcceptRemote,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_config(cli.config.as_deref())?;
    init_logging(cli.verbose, &config.logging)?;
    info!("Starting starshelf v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Commands::Init { skip_auth } => cmd_init(skip_auth, &config).await,
        Commands::Auth { auth_command } => cmd_auth(auth_command, &config).await,
        Commands::Sync { full, resync } => cmd_sync(full, resync, &config).await,
        Commands::List {
            folder,
            tag,
            search,
            sort,
            details,
        } => cmd_list(folder, tag, search, sort.map(Into::into), details, &config),
        Commands::Tag { tag_command } => cmd_tag(tag_command, &config),
        Commands::Tags => cmd_tags(&config),
        Commands::Folder { folder_command } => cmd_folder(folder_command, &config),
        Commands::Move { repo, folder } => {
            let mut shelf = open_shelf(&config, false)?;
            let target = shelf.move_repo(&repo, &folder)?;
            println!("📁 {} -> {}", repo, target.name);
            Ok(())
        }
        Commands::Star { repo } => cmd_star(&repo, true, false, &config).await,
        Commands::Unstar { repo, yes } => cmd_star(&repo, false, yes, &config).await,
        Commands::Pending => cmd_pending(&config),
        Commands::Resolve { repo, resolution } => {
            cmd_resolve(&repo, resolution.into(), &config).await
        }
        Commands::Purge { repo } => {
            let mut shelf = open_shelf(&config, false)?;
            shelf.purge(&repo)?;
            println!("🗑️  Purged {}", repo);
            Ok(())
        }
        Commands::Events { all, ack } => cmd_events(all, ack, &config),
    }
}

/// Initialize logging from config; `RUST_LOG` wins, `--verbose` forces debug
fn init_logging(verbose: bool, logging: &LoggingConfig) -> Result<()> {
    let level = if verbose { "debug" } else { logging.level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let registry = tracing_subscriber::registry().with(filter);
    match logging.format.as_str() {
        "pretty" => registry
            .with(fmt::layer().pretty().with_writer(io::stderr))
            .init(),
        "full" => registry.with(fmt::layer().with_writer(io::stderr)).init(),
        _ => registry
            .with(fmt::layer().compact().with_writer(io::stderr))
            .init(),
    }

    Ok(())
}

/// Load configuration from specified path or default location
fn load_config(config_path: Option<&std::path::Path>) -> Result<Config> {
    match config_path {
        Some(path) => Config::load(path),
        None => Config::load_or_default(),
    }
}

/// Open the shelf. Offline commands never need credentials.
fn open_shelf(config: &Config, online: bool) -> Result<Shelf> {
    let provider: Arc<dyn StarProvider> = if online {
        Arc::new(GitHubClient::new(config)?)
    } else {
        Arc::new(Offline)
    };
    Shelf::open(config, provider)
}

async fn cmd_init(skip_auth: bool, config: &Config) -> Result<()> {
    info!("Initializing starshelf...");

    let config_path = Config::default_config_path()?;
    if !config_path.exists() {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }
        config.save(&config_path)?;
    }

    let mut shelf = open_shelf(config, false)?;
    let created = shelf
        .folders()
        .create_default_folders(&config.folders.default_folders)?;

    println!("✅ starshelf initialized");
    println!("   Config: {:?}", config_path);
    println!("   Store: {:?}", config.db_path());
    for folder in created {
        println!("   Folder: {} ({})", folder.name, folder.filters.join(", "));
    }

    if !skip_auth {
        github::test_authentication(config).await?;
        println!("   Next: run 'starshelf sync'");
    }

    Ok(())
}

async fn cmd_auth(auth_command: AuthCommands, config: &Config) -> Result<()> {
    match auth_command {
        AuthCommands::Status => github::test_authentication(config).await,
    }
}

async fn cmd_sync(full: bool, resync: bool, config: &Config) -> Result<()> {
    let mut shelf = open_shelf(config, true)?;
    let mode = if full { SyncMode::Full } else { SyncMode::Incremental };

    let run = async {
        if resync {
            shelf.resync().await
        } else {
            shelf.trigger_sync(mode).await
        }
    };

    // Dropping the pass leaves the store at the last committed page.
    let result = tokio::select! {
        result = run => result,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, sync will resume from the last committed page");
            println!("⏸️  Sync interrupted; run 'starshelf sync' to resume");
            return Ok(());
        }
    };

    match result {
        Ok(report) => {
            print_report(&report);
            Ok(())
        }
        Err(Error::RateLimited {
            retry_after,
            committed_pages,
        }) => {
            println!(
                "⏳ Rate limited after {} page(s); progress saved. Retry in {}s.",
                committed_pages,
                retry_after.as_secs()
            );
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

fn print_report(report: &SyncReport) {
    println!(
        "✅ {} sync finished in {:.1}s ({} page(s){})",
        report.mode.as_str(),
        report.duration.as_secs_f64(),
        report.pages,
        if report.resumed { ", resumed" } else { "" }
    );
    println!(
        "   added {}, updated {}, removed {}, restored {}, purged {}",
        report.added, report.updated, report.removed, report.restored, report.purged
    );
    if report.pushed > 0 {
        println!("   pushed {} queued star change(s)", report.pushed);
    }
    if report.conflicted > 0 {
        println!("   {} record(s) where local intent overrides GitHub", report.conflicted);
    }
    if report.degraded_to_full {
        println!("⚠️  Star ordering looked unreliable; ran as a full pass");
    }
    if report.pending_conflicts > 0 {
        println!(
            "⚠️  {} pending conflict(s): see 'starshelf pending'",
            report.pending_conflicts
        );
    }
}

fn print_repo(repo: &RepositoryRecord, details: bool) {
    let marker = if repo.local_dirty { " *" } else { "" };
    if !details {
        println!("  ⭐ {:>6}  {}{}", repo.stars, repo.full_name(), marker);
        return;
    }

    println!("📁 {}{}", repo.full_name(), marker);
    if let Some(description) = &repo.description {
        println!("   📝 {}", description);
    }
    if let Some(language) = &repo.language {
        println!("   💻 {}", language);
    }
    println!("   ⭐ {}", repo.stars);
    if let Some(pushed) = repo.pushed_at {
        println!("   🕒 Pushed: {}", pushed.format("%Y-%m-%d"));
    }
    if !repo.html_url.is_empty() {
        println!("   🔗 {}", repo.html_url);
    }
    println!();
}

fn cmd_list(
    folder: Option<String>,
    tag: Option<String>,
    search: Option<String>,
    sort: Option<SortOrder>,
    details: bool,
    config: &Config,
) -> Result<()> {
    let mut shelf = open_shelf(config, false)?;

    let repos = if let Some(folder) = folder {
        shelf.repos_by_folder(&folder, sort)?
    } else if let Some(tag) = tag {
        shelf.repos_by_tag(&tag, sort)?
    } else if let Some(text) = search {
        shelf.search(&text, sort)?
    } else {
        shelf.list_repos(sort)?
    };

    println!("Repositories ({}):", repos.len());
    for repo in &repos {
        print_repo(repo, details);
    }
    Ok(())
}

fn cmd_tag(tag_command: TagCommands, config: &Config) -> Result<()> {
    let mut shelf = open_shelf(config, false)?;
    match tag_command {
        TagCommands::Add { repo, tag } => {
            shelf.tag_repo(&repo, &tag)?;
            println!("🏷️  {} +{}", repo, tag.trim());
        }
        TagCommands::Remove { repo, tag } => {
            if shelf.untag_repo(&repo, &tag)? {
                println!("🏷️  {} -{}", repo, tag.trim());
            } else {
                println!("{} has no user tag '{}'", repo, tag.trim());
            }
        }
    }
    Ok(())
}

fn cmd_tags(config: &Config) -> Result<()> {
    let shelf = open_shelf(config, false)?;
    let tags = shelf.all_tags()?;
    println!("Tags ({}):", tags.len());
    for tag in tags {
        println!("  {:>5}  {} ({})", tag.count, tag.name, tag.origin.as_str());
    }
    Ok(())
}

fn print_stats(name: &str, stats: &FolderStats) {
    println!("📊 {}", name);
    println!("   Repositories: {}", stats.repo_count);
    println!(
        "   Stars: {} total, {:.1} average",
        stats.total_stars, stats.avg_stars
    );
    if let Some(top) = &stats.top_language {
        println!("   Top language: {}", top);
    }
    for (language, count) in &stats.languages {
        println!("     {:<16} {}", language, count);
    }
}

fn cmd_folder(folder_command: FolderCommands, config: &Config) -> Result<()> {
    let mut shelf = open_shelf(config, false)?;
    let mut folders = shelf.folders();

    match folder_command {
        FolderCommands::Create {
            name,
            tags,
            description,
        } => {
            let kind = if tags.is_empty() {
                FolderKind::Manual
            } else {
                FolderKind::TagQuery
            };
            let folder = folders.create_folder(&name, kind, &tags, &description)?;
            println!("📁 Created {} folder '{}'", folder.kind.as_str(), folder.name);
        }
        FolderCommands::Rename { name, new_name } => {
            let folder = folders.rename_folder(&name, &new_name)?;
            println!("📁 Renamed '{}' to '{}'", name, folder.name);
        }
        FolderCommands::Delete { name } => {
            if folders.delete_folder(&name)? {
                println!("🗑️  Deleted folder '{}'", name);
            } else {
                println!("No folder named '{}'", name);
            }
        }
        FolderCommands::Add { folder, repo } => {
            folders.add_to_folder(&folder, &repo)?;
            println!("📁 {} +{}", folder, repo);
        }
        FolderCommands::Remove { folder, repo } => {
            if folders.remove_from_folder(&folder, &repo)? {
                println!("📁 {} -{}", folder, repo);
            } else {
                println!("{} is not in '{}'", repo, folder);
            }
        }
        FolderCommands::List => {
            let all = folders.list_folders()?;
            println!("Folders ({}):", all.len());
            for folder in all {
                match folder.kind {
                    FolderKind::TagQuery => {
                        println!("  🔎 {} [{}]", folder.name, folder.filters.join(", "))
                    }
                    FolderKind::Manual => println!("  📁 {}", folder.name),
                }
            }
        }
        FolderCommands::Show { name, sort } => {
            let sort = sort.map(Into::into).unwrap_or(config.behavior.sort_order);
            let repos = folders.repos_in_folder(&name, sort)?;
            println!("{} ({}):", name, repos.len());
            for repo in &repos {
                print_repo(repo, false);
            }
        }
        FolderCommands::Stats { name } => {
            let stats = folders.folder_stats(&name)?;
            print_stats(&name, &stats);
        }
    }
    Ok(())
}

fn confirm(prompt: &str) -> Result<bool> {
    print!("{} [y/N] ", prompt);
    io::stdout().flush()?;
    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim(), "y" | "Y" | "yes"))
}

fn print_push_outcome(repo: &str, starred: bool, outcome: &PushOutcome) {
    let verb = if starred { "Starred" } else { "Unstarred" };
    match outcome {
        PushOutcome::Applied => println!("✅ {} {}", verb, repo),
        PushOutcome::Queued { error, attempts } => println!(
            "⏳ {} {} locally; GitHub update queued (attempt {} failed: {})",
            verb, repo, attempts, error
        ),
        PushOutcome::Superseded => println!("ℹ️  {} changed meanwhile; nothing pushed", repo),
    }
}

async fn cmd_star(repo: &str, starred: bool, yes: bool, config: &Config) -> Result<()> {
    if !starred && config.behavior.confirm_unstar && !yes && !confirm(&format!("Unstar {}?", repo))? {
        println!("Cancelled");
        return Ok(());
    }

    let mut shelf = open_shelf(config, true)?;
    match shelf.set_starred(repo, starred).await {
        Ok(outcome) => {
            print_push_outcome(repo, starred, &outcome);
            Ok(())
        }
        Err(e @ Error::PendingConflict { .. }) => {
            println!("⚠️  {}", e);
            println!("   Resolve with: starshelf resolve {} keep-local|accept-remote", repo);
            Ok(())
        }
        Err(Error::RateLimited { retry_after, .. }) => {
            println!(
                "⏳ Queued, GitHub rate limit reached; pushed on a sync after {}s",
                retry_after.as_secs()
            );
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

fn cmd_pending(config: &Config) -> Result<()> {
    let shelf = open_shelf(config, false)?;
    let dirty = shelf.dirty_records()?;
    if dirty.is_empty() {
        println!("✅ No pending star changes");
        return Ok(());
    }

    println!("Pending star changes ({}):", dirty.len());
    for record in dirty {
        let wanted = match record.desired_starred {
            Some(true) => "star",
            Some(false) => "unstar",
            None => "?",
        };
        let state = if record.conflict {
            "CONFLICT".to_string()
        } else {
            match record.next_attempt_at {
                Some(at) => format!("retry at {}", at.format("%Y-%m-%d %H:%M")),
                None => "due".to_string(),
            }
        };
        println!(
            "  {} {} ({} attempt(s), {})",
            wanted,
            record.full_name(),
            record.push_attempts,
            state
        );
        if let Some(error) = &record.last_push_error {
            println!("     last error: {}", error);
        }
    }
    Ok(())
}

async fn cmd_resolve(repo: &str, resolution: Resolution, config: &Config) -> Result<()> {
    let online = resolution == Resolution::KeepLocal;
    let mut shelf = open_shelf(config, online)?;
    let wanted = shelf.get_repo(repo)?.desired_starred.unwrap_or(true);

    match shelf.resolve_conflict(repo, resolution).await {
        Ok(outcome) if resolution == Resolution::KeepLocal => {
            print_push_outcome(repo, wanted, &outcome);
            Ok(())
        }
        Ok(_) => {
            println!("✅ Dropped local change for {}", repo);
            Ok(())
        }
        Err(e @ Error::PendingConflict { .. }) => {
            println!("⚠️  {}", e);
            Ok(())
        }
        Err(Error::RateLimited { retry_after, .. }) => {
            println!(
                "⏳ Re-queued, GitHub rate limit reached; retry after {}s",
                retry_after.as_secs()
            );
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

fn cmd_events(all: bool, ack: bool, config: &Config) -> Result<()> {
    let mut shelf = open_shelf(config, false)?;
    let store = shelf.store_mut();

    let events = if all {
        store.get_events_with_filter(None, None, Some(100))?
    } else {
        store.get_unacknowledged_events()?
    };

    let counts = store.unacknowledged_counts()?;
    if events.is_empty() {
        println!("✅ No events");
        return Ok(());
    }
    if counts.total() > 0 {
        println!(
            "{} unacknowledged: {} error(s), {} warning(s), {} info",
            counts.total(),
            counts.error,
            counts.warning,
            counts.info
        );
    }

    for event in &events {
        let icon = match event.severity {
            Severity::Info => "ℹ️ ",
            Severity::Warning => "⚠️ ",
            Severity::Error => "❌",
        };
        let repo = event.repo_full_name.as_deref().unwrap_or("-");
        println!(
            "{} {} [{}] {}: {}",
            icon,
            event.timestamp.format("%Y-%m-%d %H:%M"),
            event.event_type.as_str(),
            repo,
            event.summary
        );
        if let Some(details) = &event.details {
            println!("      {}", details);
        }
        if event.event_type == EventType::PendingConflict && !event.acknowledged {
            println!("      resolve with: starshelf resolve {} keep-local|accept-remote", repo);
        }
    }

    if ack {
        let acknowledged = store.acknowledge_all()?;
        let pruned = store.cleanup_old_events(30)?;
        println!("Acknowledged {} event(s), pruned {}", acknowledged, pruned);
    }
    Ok(())
}
