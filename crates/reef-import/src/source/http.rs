//! HTTP API source with pagination
//!
//! Each fetched page becomes one [`SourceFile`]. Paging always stops at
//! `max_pages`; Offset and Page modes also stop on a short page, and any mode
//! can stop on an empty page.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, LINK};
use reqwest::{StatusCode, Url};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{ImportSource, ProbeResult};
use crate::config::{HttpSourceConfig, PaginationMode, SecretDecryptor, SourceConfig};
use crate::error::{ImportError, Result};
use crate::models::{FileInfo, SourceFile};
use crate::parser::json::navigate;

pub struct HttpSource {
    client: reqwest::Client,
    http: HttpSourceConfig,
    base: Url,
}

impl HttpSource {
    pub fn new(config: &SourceConfig, decryptor: &dyn SecretDecryptor) -> Result<Self> {
        let http = config
            .http
            .clone()
            .ok_or_else(|| ImportError::config("source.http is required for HTTP sources"))?;
        let base = Url::parse(&http.url)
            .map_err(|e| ImportError::config(format!("Invalid source URL '{}': {}", http.url, e)))?;

        let mut headers = HeaderMap::new();
        for (name, value) in &http.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| ImportError::config(format!("Invalid header name '{}': {}", name, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| ImportError::config(format!("Invalid value for header '{}': {}", name, e)))?;
            headers.insert(name, value);
        }
        if let Some(token) = &http.bearer_token {
            let token = decryptor.decrypt(token)?;
            let mut value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|_| ImportError::config("Bearer token contains invalid characters"))?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(http.timeout_secs))
            .build()?;

        Ok(Self { client, http, base })
    }

    fn page_url(&self, page_index: u64, cursor: Option<&str>, next_link: Option<&Url>) -> Url {
        let p = &self.http.pagination;
        let mut url = self.base.clone();
        match p.mode {
            PaginationMode::None => {},
            PaginationMode::Offset => {
                url.query_pairs_mut()
                    .append_pair(&p.offset_param, &(page_index * p.page_size).to_string())
                    .append_pair(&p.limit_param, &p.page_size.to_string());
            },
            PaginationMode::Page => {
                url.query_pairs_mut()
                    .append_pair(&p.page_param, &(p.start_page + page_index).to_string())
                    .append_pair(&p.limit_param, &p.page_size.to_string());
            },
            PaginationMode::Cursor => {
                if let Some(cursor) = cursor {
                    url.query_pairs_mut().append_pair(&p.cursor_param, cursor);
                }
            },
            PaginationMode::Link => {
                if let Some(next) = next_link {
                    url = next.clone();
                }
            },
        }
        url
    }

    fn name_for(&self) -> String {
        self.base
            .path_segments()
            .and_then(|mut segments| segments.next_back().map(str::to_string))
            .filter(|s| !s.is_empty())
            .or_else(|| self.base.host_str().map(str::to_string))
            .unwrap_or_else(|| "response".to_string())
    }
}

/// Target of the `rel="next"` entry in a `Link` header
pub fn parse_next_link(header: &str) -> Option<String> {
    header.split(',').find_map(|part| {
        let mut pieces = part.split(';');
        let target = pieces.next()?.trim();
        let is_next = pieces.any(|param| {
            let param = param.trim().replace(' ', "");
            param.eq_ignore_ascii_case("rel=\"next\"") || param.eq_ignore_ascii_case("rel=next")
        });
        if !is_next {
            return None;
        }
        target
            .strip_prefix('<')
            .and_then(|t| t.strip_suffix('>'))
            .map(str::to_string)
    })
}

/// Records on a page: array length at `records_path`, 1 for an object
fn record_count(body: &serde_json::Value, records_path: Option<&str>) -> Option<u64> {
    let node = match records_path {
        Some(path) => navigate(body, path)?,
        None => body,
    };
    match node {
        serde_json::Value::Array(items) => Some(items.len() as u64),
        serde_json::Value::Null => Some(0),
        serde_json::Value::Object(_) => Some(1),
        _ => None,
    }
}

fn scalar_text(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[async_trait]
impl ImportSource for HttpSource {
    async fn fetch(&self, _config: &SourceConfig) -> Result<Vec<SourceFile>> {
        let p = &self.http.pagination;
        let mut files = Vec::new();
        let mut page_index: u64 = 0;
        let mut cursor: Option<String> = None;
        let mut next_link: Option<Url> = None;

        loop {
            if page_index >= u64::from(p.max_pages) {
                warn!(max_pages = p.max_pages, "Page limit reached, stopping pagination");
                break;
            }

            let url = self.page_url(page_index, cursor.as_deref(), next_link.as_ref());
            debug!(url = %url, page = page_index + 1, "Requesting page");

            let response = self.client.get(url.clone()).send().await?;
            let status = response.status();
            if !status.is_success() {
                return Err(ImportError::source(format!("HTTP {} from {}", status, url)));
            }

            let header_link = response
                .headers()
                .get(LINK)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_next_link);
            let bytes = response.bytes().await?.to_vec();
            let body: Option<serde_json::Value> = serde_json::from_slice(&bytes).ok();
            let count = body
                .as_ref()
                .and_then(|b| record_count(b, p.records_path.as_deref()));

            page_index += 1;

            if p.stop_on_empty_page && count == Some(0) {
                debug!(page = page_index, "Empty page, stopping pagination");
                break;
            }

            files.push(SourceFile::from_bytes(
                FileInfo {
                    identifier: url.to_string(),
                    name: format!("{}-page-{}", self.name_for(), page_index),
                    size: Some(bytes.len() as u64),
                    last_modified: None,
                },
                bytes,
            ));

            let more = match p.mode {
                PaginationMode::None => false,
                PaginationMode::Offset | PaginationMode::Page => {
                    matches!(count, Some(n) if n >= p.page_size && n > 0)
                },
                PaginationMode::Cursor => {
                    cursor = match (&body, p.cursor_path.as_deref()) {
                        (Some(body), Some(path)) => navigate(body, path).and_then(scalar_text),
                        _ => None,
                    };
                    cursor.is_some()
                },
                PaginationMode::Link => {
                    let target = header_link.or_else(|| match (&body, p.next_link_path.as_deref()) {
                        (Some(body), Some(path)) => navigate(body, path).and_then(scalar_text),
                        _ => None,
                    });
                    next_link = target.and_then(|t| url.join(&t).ok());
                    next_link.is_some()
                },
            };

            if !more {
                break;
            }
        }

        info!(url = %self.base, pages = files.len(), "Fetched HTTP source");
        Ok(files)
    }

    async fn list_files(&self, _config: &SourceConfig) -> Result<Vec<FileInfo>> {
        Ok(vec![FileInfo {
            identifier: self.base.to_string(),
            name: self.name_for(),
            size: None,
            last_modified: None,
        }])
    }

    async fn archive(&self, _config: &SourceConfig, _identifier: &str) -> Result<bool> {
        Ok(false)
    }

    async fn test(&self, _config: &SourceConfig) -> ProbeResult {
        let response = match self.client.head(self.base.clone()).send().await {
            Ok(response)
                if matches!(
                    response.status(),
                    StatusCode::METHOD_NOT_ALLOWED | StatusCode::NOT_IMPLEMENTED
                ) =>
            {
                self.client.get(self.base.clone()).send().await
            },
            other => other,
        };

        match response {
            Ok(response) if response.status().is_success() => {
                ProbeResult::ok(format!("HTTP {} from {}", response.status(), self.base))
            },
            Ok(response) => ProbeResult::failed(format!("HTTP {} from {}", response.status(), self.base)),
            Err(e) => ProbeResult::failed(format!("Request to {} failed: {}", self.base, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_next_link() {
        let header = r#"<https://api.example.com/items?page=1>; rel="prev", <https://api.example.com/items?page=3>; rel="next""#;
        assert_eq!(
            parse_next_link(header).as_deref(),
            Some("https://api.example.com/items?page=3")
        );
        assert!(parse_next_link(r#"<https://api.example.com/items?page=1>; rel="prev""#).is_none());
    }

    #[test]
    fn test_record_count() {
        let body: serde_json::Value = serde_json::from_str(r#"{"data":{"items":[1,2,3]}}"#).unwrap();
        assert_eq!(record_count(&body, Some("$.data.items")), Some(3));
        assert_eq!(record_count(&body, Some("$.missing")), None);
        assert_eq!(record_count(&serde_json::json!([]), None), Some(0));
    }
}
