mod common;

use assert_matches::assert_matches;
use serial_test::serial;
use std::sync::Arc;

use common::{FakeProvider, MockRepository, TestEnvironment};
use starshelf::error::Error;
use starshelf::model::{SortOrder, SyncMode, TagOrigin};
use starshelf::sync::PushOutcome;
use starshelf::{Config, Offline, Shelf};

fn load_config(env: &TestEnvironment) -> Config {
    let path = env.create_minimal_config();
    Config::load(&path).expect("config loads")
}

fn provider() -> Arc<FakeProvider> {
    FakeProvider::new(vec![
        MockRepository::new(1, "tokio-rs", "tokio")
            .language("Rust")
            .topics(&["rust", "async"])
            .build(),
        MockRepository::new(2, "golang", "go").language("Go").build(),
        MockRepository::new(3, "old", "dusty")
            .language("C")
            .pushed_days_ago(500)
            .build(),
    ])
}

#[test]
#[serial]
fn test_new_store_gets_default_folders_once() {
    let env = TestEnvironment::new();
    std::env::remove_var("STARSHELF_DB");
    let config = load_config(&env);

    {
        let mut shelf = Shelf::open(&config, Arc::new(Offline)).unwrap();
        let names: Vec<String> = shelf
            .folders()
            .list_folders()
            .unwrap()
            .into_iter()
            .map(|f| f.name)
            .collect();
        assert_eq!(names, vec!["Active".to_string(), "Rust".to_string()]);

        assert!(shelf.folders().delete_folder("active").unwrap());
    }

    // The store is no longer new, so deleted defaults stay deleted
    let mut shelf = Shelf::open(&config, Arc::new(Offline)).unwrap();
    assert_eq!(shelf.folders().list_folders().unwrap().len(), 1);
    assert!(env.db_path().exists());
}

#[test]
#[serial]
fn test_db_path_env_override() {
    let env = TestEnvironment::new();
    let override_path = env.temp_dir.path().join("elsewhere.db");
    std::env::set_var("STARSHELF_DB", &override_path);

    let config = load_config(&env);
    assert_eq!(config.db_path(), override_path);
}

#[tokio::test]
#[serial]
async fn test_sync_then_browse_by_folder_tag_and_search() {
    let env = TestEnvironment::new();
    std::env::remove_var("STARSHELF_DB");
    let config = load_config(&env);
    let mut shelf = Shelf::open(&config, provider()).unwrap();

    let report = shelf.trigger_sync(SyncMode::Full).await.unwrap();
    assert_eq!(report.added, 3);

    let active: Vec<i64> = shelf
        .repos_by_folder("Active", Some(SortOrder::Name))
        .unwrap()
        .iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(active, vec![2, 1]);

    let rust = shelf.repos_by_folder("rust", None).unwrap();
    assert_eq!(rust.len(), 1);
    assert_eq!(rust[0].full_name(), "tokio-rs/tokio");

    assert_eq!(shelf.repos_by_tag("stale", None).unwrap().len(), 1);
    assert_eq!(shelf.search("dust", None).unwrap().len(), 1);
    assert!(shelf.search("100%", None).unwrap().is_empty());

    let membership = shelf.folders_for("tokio-rs/tokio").unwrap();
    assert!(membership.manual.is_none());
    assert_eq!(membership.tag_query.len(), 2);
}

#[tokio::test]
#[serial]
async fn test_user_tag_shadows_and_restores_auto_tag() {
    let env = TestEnvironment::new();
    std::env::remove_var("STARSHELF_DB");
    let config = load_config(&env);
    let mut shelf = Shelf::open(&config, provider()).unwrap();
    shelf.trigger_sync(SyncMode::Full).await.unwrap();

    shelf.tag_repo("golang/go", "active").unwrap();
    let tag = shelf
        .tags_for("golang/go")
        .unwrap()
        .into_iter()
        .find(|t| t.name == "active")
        .unwrap();
    assert_eq!(tag.origin, TagOrigin::User);

    assert!(shelf.untag_repo("golang/go", "active").unwrap());
    let tag = shelf
        .tags_for("golang/go")
        .unwrap()
        .into_iter()
        .find(|t| t.name == "active")
        .unwrap();
    assert_eq!(tag.origin, TagOrigin::Auto);

    assert!(!shelf.untag_repo("golang/go", "missing").unwrap());
    assert_matches!(shelf.tag_repo("golang/go", "  "), Err(Error::InvalidInput(_)));
    assert_matches!(
        shelf.tag_repo("nobody/nothing", "x"),
        Err(Error::RepoNotFound(_))
    );

    let counts = shelf.all_tags().unwrap();
    let active = counts.iter().find(|c| c.name == "active").unwrap();
    assert_eq!(active.count, 2);
}

#[tokio::test]
#[serial]
async fn test_offline_star_change_stays_queued() {
    let env = TestEnvironment::new();
    std::env::remove_var("STARSHELF_DB");
    let config = load_config(&env);

    {
        let mut shelf = Shelf::open(&config, provider()).unwrap();
        shelf.trigger_sync(SyncMode::Full).await.unwrap();
    }

    let mut shelf = Shelf::open(&config, Arc::new(Offline)).unwrap();
    let outcome = shelf.set_starred("golang/go", false).await.unwrap();
    assert_matches!(outcome, PushOutcome::Queued { attempts: 1, .. });

    let dirty = shelf.dirty_records().unwrap();
    assert_eq!(dirty.len(), 1);
    assert_eq!(dirty[0].desired_starred, Some(false));
    // Still listed until the remote confirms
    assert_eq!(shelf.list_repos(None).unwrap().len(), 3);

    assert_matches!(
        shelf.trigger_sync(SyncMode::Incremental).await,
        Err(Error::RemoteUnavailable { .. })
    );
}
