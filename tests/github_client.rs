use assert_matches::assert_matches;
use serde_json::json;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use starshelf::error::Error;
use starshelf::github::{AuthStrategy, GitHubClient};
use starshelf::provider::{RepoRef, StarProvider};

fn client(server: &MockServer) -> GitHubClient {
    GitHubClient::with_token(&server.uri(), "test-token", 2, AuthStrategy::ConfigToken)
        .expect("client")
}

fn starred_item(id: i64, owner: &str, name: &str, starred_at: &str) -> serde_json::Value {
    json!({
        "starred_at": starred_at,
        "repo": {
            "id": id,
            "name": name,
            "owner": { "login": owner },
            "description": "a repository",
            "language": "Rust",
            "topics": ["cli", "async"],
            "stargazers_count": 1234,
            "pushed_at": "2026-09-01T12:00:00Z",
            "html_url": format!("https://github.com/{}/{}", owner, name),
            "archived": false,
            "fork": false
        }
    })
}

fn repo_ref() -> RepoRef {
    RepoRef {
        id: 7,
        owner: "tokio-rs".to_string(),
        name: "tokio".to_string(),
    }
}

#[tokio::test]
async fn test_fetch_starred_page_parses_items_and_headers() {
    let server = MockServer::start().await;
    let next = format!(
        "<{}/user/starred?per_page=2&page=2>; rel=\"next\", <{}/user/starred?per_page=2&page=5>; rel=\"last\"",
        server.uri(),
        server.uri()
    );

    Mock::given(method("GET"))
        .and(path("/user/starred"))
        .and(query_param("page", "1"))
        .and(query_param("per_page", "2"))
        .and(header("accept", "application/vnd.github.star+json"))
        .and(header("authorization", "Bearer test-token"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!([
                    starred_item(7, "tokio-rs", "tokio", "2026-10-01T08:00:00Z"),
                    starred_item(8, "serde-rs", "serde", "2026-09-30T08:00:00Z"),
                ]))
                .insert_header("x-ratelimit-limit", "5000")
                .insert_header("x-ratelimit-remaining", "4321")
                .insert_header("x-ratelimit-reset", "1900000000")
                .insert_header("link", next.as_str()),
        )
        .expect(1)
        .mount(&server)
        .await;

    let page = client(&server).fetch_starred_page(1).await.unwrap();
    assert_eq!(page.next_page, Some(2));
    assert_eq!(page.rate_limit.limit, 5000);
    assert_eq!(page.rate_limit.remaining, 4321);
    assert!(page.rate_limit.reset_at.is_some());

    assert_eq!(page.repos.len(), 2);
    let first = &page.repos[0];
    assert_eq!(first.id, 7);
    assert_eq!(first.full_name(), "tokio-rs/tokio");
    assert_eq!(first.language.as_deref(), Some("Rust"));
    assert_eq!(first.topics, vec!["cli".to_string(), "async".to_string()]);
    assert_eq!(first.stars, 1234);
    assert!(first.starred_at.is_some());
    assert!(first.pushed_at.is_some());
}

#[tokio::test]
async fn test_last_page_without_link_or_star_times() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/user/starred"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{
            "id": 9,
            "name": "plain",
            "owner": { "login": "someone" },
            "description": null,
            "language": null,
            "pushed_at": null
        }])))
        .mount(&server)
        .await;

    let page = client(&server).fetch_starred_page(3).await.unwrap();
    assert_eq!(page.next_page, None);
    assert_eq!(page.repos.len(), 1);
    assert!(page.repos[0].starred_at.is_none());
    assert!(page.repos[0].topics.is_empty());
    // No rate-limit headers: the window is unknown and never blocks
    assert_eq!(page.rate_limit.remaining, u32::MAX);
}

#[tokio::test]
async fn test_unauthorized_maps_to_auth_expired() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/user/starred"))
        .respond_with(
            ResponseTemplate::new(401).set_body_json(json!({ "message": "Bad credentials" })),
        )
        .mount(&server)
        .await;

    let err = client(&server).fetch_starred_page(1).await.unwrap_err();
    assert_matches!(err, Error::AuthExpired { .. });
}

#[tokio::test]
async fn test_exhausted_window_maps_to_rate_limited() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/user/starred"))
        .respond_with(
            ResponseTemplate::new(403)
                .insert_header("x-ratelimit-limit", "5000")
                .insert_header("x-ratelimit-remaining", "0")
                .insert_header("retry-after", "60")
                .set_body_json(json!({ "message": "API rate limit exceeded" })),
        )
        .mount(&server)
        .await;

    let err = client(&server).fetch_starred_page(1).await.unwrap_err();
    assert_matches!(err, Error::RateLimited { retry_after, .. } if retry_after.as_secs() == 60);
}

#[tokio::test]
async fn test_server_error_is_remote_unavailable() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/user/starred"))
        .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
        .mount(&server)
        .await;

    let err = client(&server).fetch_starred_page(1).await.unwrap_err();
    assert_matches!(err, Error::RemoteUnavailable { .. });
    assert!(err.is_retryable());
    assert!(err.to_string().contains("502"));
}

#[tokio::test]
async fn test_star_and_unstar_requests() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/user/starred/tokio-rs/tokio"))
        .respond_with(
            ResponseTemplate::new(204)
                .insert_header("x-ratelimit-limit", "5000")
                .insert_header("x-ratelimit-remaining", "10"),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/user/starred/tokio-rs/tokio"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let client = client(&server);
    let rate_limit = client.set_starred(&repo_ref(), true).await.unwrap();
    assert_eq!(rate_limit.remaining, 10);
    client.set_starred(&repo_ref(), false).await.unwrap();
}

#[tokio::test]
async fn test_unstar_of_missing_star_succeeds() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/user/starred/tokio-rs/tokio"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/user/starred/tokio-rs/tokio"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let client = client(&server);
    assert!(client.set_starred(&repo_ref(), false).await.is_ok());
    assert_matches!(
        client.set_starred(&repo_ref(), true).await,
        Err(Error::RemoteUnavailable { .. })
    );
}
