//! HTTP source pagination against a mock server

mod common;

use anyhow::Result;
use common::init_tracing;
use reef_import::config::{HttpSourceConfig, PaginationConfig, PaginationMode, PlainTextDecryptor, SourceConfig, SourceKind};
use reef_import::source::{HttpSource, ImportSource};
use reef_import::ImportError;
use serde_json::json;
use std::collections::BTreeMap;
use std::io::Read;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn http_config(url: String, pagination: PaginationConfig) -> SourceConfig {
    SourceConfig {
        kind: SourceKind::Http,
        path: None,
        pattern: None,
        selection: Default::default(),
        archive_path: None,
        remote: None,
        http: Some(HttpSourceConfig {
            url,
            bearer_token: None,
            headers: BTreeMap::new(),
            timeout_secs: 5,
            pagination,
        }),
    }
}

fn pagination(mode: PaginationMode) -> PaginationConfig {
    PaginationConfig {
        mode,
        ..Default::default()
    }
}

fn body_of(file: reef_import::models::SourceFile) -> Result<serde_json::Value> {
    let mut text = String::new();
    file.into_reader().read_to_string(&mut text)?;
    Ok(serde_json::from_str(&text)?)
}

#[tokio::test]
async fn test_offset_pagination_stops_on_short_page() -> Result<()> {
    init_tracing();
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/customers"))
        .and(query_param("offset", "0"))
        .and(query_param("limit", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"items": [{"id": 1}, {"id": 2}]})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/customers"))
        .and(query_param("offset", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"items": [{"id": 3}]})))
        .expect(1)
        .mount(&server)
        .await;

    let mut paging = pagination(PaginationMode::Offset);
    paging.page_size = 2;
    paging.records_path = Some("$.items".to_string());
    let config = http_config(format!("{}/api/customers", server.uri()), paging);

    let source = HttpSource::new(&config, &PlainTextDecryptor)?;
    let files = source.fetch(&config).await?;

    assert_eq!(files.len(), 2);
    assert_eq!(files[0].info.name, "customers-page-1");
    assert_eq!(files[1].info.name, "customers-page-2");
    let last = files.into_iter().last().map(body_of).transpose()?;
    assert_eq!(last, Some(json!({"items": [{"id": 3}]})));
    Ok(())
}

#[tokio::test]
async fn test_page_mode_counts_from_start_page() -> Result<()> {
    init_tracing();
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/orders"))
        .and(query_param("page", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"id": 1}])))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/orders"))
        .and(query_param("page", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&server)
        .await;

    let mut paging = pagination(PaginationMode::Page);
    paging.page_size = 1;
    paging.stop_on_empty_page = true;
    let config = http_config(format!("{}/orders", server.uri()), paging);

    let files = HttpSource::new(&config, &PlainTextDecryptor)?.fetch(&config).await?;
    assert_eq!(files.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_cursor_pagination_follows_body_cursor() -> Result<()> {
    init_tracing();
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/events"))
        .and(query_param("cursor", "abc"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": [{"id": 2}], "next": null})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/events"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": [{"id": 1}], "next": "abc"})))
        .expect(1)
        .mount(&server)
        .await;

    let mut paging = pagination(PaginationMode::Cursor);
    paging.cursor_path = Some("next".to_string());
    let config = http_config(format!("{}/events", server.uri()), paging);

    let files = HttpSource::new(&config, &PlainTextDecryptor)?.fetch(&config).await?;
    assert_eq!(files.len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_link_header_pagination() -> Result<()> {
    init_tracing();
    let server = MockServer::start().await;
    let next = format!("<{}/items?after=10>; rel=\"next\"", server.uri());

    Mock::given(method("GET"))
        .and(path("/items"))
        .and(query_param("after", "10"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"id": 11}])))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/items"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Link", next.as_str())
                .set_body_json(json!([{"id": 10}])),
        )
        .expect(1)
        .mount(&server)
        .await;

    let config = http_config(format!("{}/items", server.uri()), pagination(PaginationMode::Link));
    let files = HttpSource::new(&config, &PlainTextDecryptor)?.fetch(&config).await?;

    assert_eq!(files.len(), 2);
    assert!(files[1].info.identifier.ends_with("/items?after=10"));
    Ok(())
}

#[tokio::test]
async fn test_max_pages_caps_pagination() -> Result<()> {
    init_tracing();
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/endless"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"id": 1}])))
        .expect(3)
        .mount(&server)
        .await;

    let mut paging = pagination(PaginationMode::Page);
    paging.page_size = 1;
    paging.max_pages = 3;
    let config = http_config(format!("{}/endless", server.uri()), paging);

    let files = HttpSource::new(&config, &PlainTextDecryptor)?.fetch(&config).await?;
    assert_eq!(files.len(), 3);
    Ok(())
}

#[tokio::test]
async fn test_bearer_token_and_headers_are_sent() -> Result<()> {
    init_tracing();
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/secure"))
        .and(header("Authorization", "Bearer s3cret"))
        .and(header("X-Tenant", "acme"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": 1})))
        .expect(1)
        .mount(&server)
        .await;

    let mut config = http_config(format!("{}/secure", server.uri()), PaginationConfig::default());
    if let Some(http) = config.http.as_mut() {
        http.bearer_token = Some("s3cret".to_string());
        http.headers.insert("X-Tenant".to_string(), "acme".to_string());
    }

    let files = HttpSource::new(&config, &PlainTextDecryptor)?.fetch(&config).await?;
    assert_eq!(files.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_error_status_fails_the_fetch() -> Result<()> {
    init_tracing();
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/broken"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let config = http_config(format!("{}/broken", server.uri()), PaginationConfig::default());
    let source = HttpSource::new(&config, &PlainTextDecryptor)?;
    let err = source.fetch(&config).await.err();

    assert!(matches!(err, Some(ImportError::Source(_))));
    assert!(!source.test(&config).await.ok);
    Ok(())
}

#[tokio::test]
async fn test_probe_falls_back_to_get() -> Result<()> {
    init_tracing();
    let server = MockServer::start().await;

    Mock::given(method("HEAD"))
        .and(path("/probe"))
        .respond_with(ResponseTemplate::new(405))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/probe"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let config = http_config(format!("{}/probe", server.uri()), PaginationConfig::default());
    let probe = HttpSource::new(&config, &PlainTextDecryptor)?.test(&config).await;
    assert!(probe.ok, "{}", probe.message);
    Ok(())
}
