//! HTTP adapter for the remote contracts
//!
//! Talks JSON over `reqwest` to a tracker-style REST API:
//!
//! - `GET {base}/{endpoint}?fields=id&page=N&pageSize=P` lists identities
//! - `GET {base}/{endpoint}?fields=*&updatedAfter=T` fetches the delta
//! - `POST {base}/{endpoint}` creates, `PUT`/`DELETE {base}/{endpoint}/{uid}`
//!   update and delete, answering with an import envelope
//! - `GET {base}/system/info` carries the server clock as `serverDate`
//!
//! Listings are paged; items sit under a key named after the endpoint and
//! the page count under `pager.pageCount`.

use crate::config::SyncConfig;
use crate::error::{RemoteError, SyncError, SyncResult};
use crate::record::{Record, RecordKind, Uid};
use crate::remote::{ImportResult, ImportStatus, RemoteResource, ResourceQuery, ServerClock};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use reqwest::{Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;

/// Longest piece of a response body carried into an error message
const MAX_ERROR_BODY: usize = 256;

/// Shared HTTP client and server coordinates
#[derive(Debug, Clone)]
pub struct HttpConnection {
    client: reqwest::Client,
    base_url: String,
    auth_token: Option<String>,
    page_size: u32,
}

impl HttpConnection {
    pub fn new(
        server_url: &str,
        auth_token: Option<String>,
        timeout: Duration,
        page_size: u32,
    ) -> SyncResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: server_url.trim_end_matches('/').to_string(),
            auth_token,
            page_size: page_size.max(1),
        })
    }

    pub fn from_config(config: &SyncConfig) -> SyncResult<Self> {
        Self::new(
            &config.server_url,
            config.auth_token.clone(),
            Duration::from_secs(config.request_timeout_secs),
            config.page_size,
        )
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        let mut req = self.client.request(method, url);
        if let Some(token) = &self.auth_token {
            req = req.bearer_auth(token);
        }
        req
    }
}

/// [`RemoteResource`] over one REST endpoint
pub struct HttpResourceClient {
    connection: HttpConnection,
    kind: RecordKind,
    endpoint: String,
    scope_param: Option<String>,
}

impl HttpResourceClient {
    pub fn new(
        connection: HttpConnection,
        kind: impl Into<RecordKind>,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            connection,
            kind: kind.into(),
            endpoint: endpoint.into(),
            scope_param: None,
        }
    }

    /// Query parameter carrying the scope key, e.g. `program`
    pub fn with_scope_param(mut self, name: impl Into<String>) -> Self {
        self.scope_param = Some(name.into());
        self
    }

    async fn list<T: DeserializeOwned>(
        &self,
        fields: &str,
        query: &ResourceQuery,
    ) -> Result<Vec<T>, RemoteError> {
        let mut items = Vec::new();
        let mut page = 1u32;

        loop {
            let mut params: Vec<(&str, String)> = vec![
                ("fields", fields.to_string()),
                ("paging", "true".to_string()),
                ("page", page.to_string()),
                ("pageSize", self.connection.page_size.to_string()),
            ];
            if let Some(since) = query.since {
                params.push(("updatedAfter", since.to_rfc3339()));
            }
            if let (Some(name), Some(scope)) = (&self.scope_param, &query.scope) {
                params.push((name.as_str(), scope.clone()));
            }

            let response = self
                .connection
                .request(Method::GET, &self.endpoint)
                .query(&params)
                .send()
                .await
                .map_err(from_reqwest)?;
            let body = success_body(response).await?;
            let (mut batch, page_count) = parse_page::<T>(&body, &self.endpoint)?;

            let last = batch.is_empty() || page >= page_count.unwrap_or(page);
            items.append(&mut batch);
            if last {
                break;
            }
            page += 1;
        }

        tracing::debug!(
            endpoint = %self.endpoint,
            items = items.len(),
            pages = page,
            "Listed resource"
        );
        Ok(items)
    }

    async fn import(
        &self,
        method: Method,
        path: &str,
        record: Option<&Record>,
    ) -> Result<ImportResult, RemoteError> {
        let mut req = self.connection.request(method, path);
        if let Some(record) = record {
            req = req.json(record);
        }
        let response = req.send().await.map_err(from_reqwest)?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(from_reqwest)?;
        parse_import(status, &body)
    }

    fn item_path(&self, uid: &Uid) -> String {
        format!("{}/{}", self.endpoint, uid)
    }
}

#[derive(Deserialize)]
struct Identity {
    #[serde(default)]
    id: Uid,
}

#[async_trait]
impl RemoteResource for HttpResourceClient {
    async fn list_basic(&self, query: &ResourceQuery) -> Result<Vec<Uid>, RemoteError> {
        let identities: Vec<Identity> = self.list("id", query).await?;
        Ok(identities.into_iter().map(|i| i.id).filter(Uid::is_valid).collect())
    }

    async fn fetch_full(&self, query: &ResourceQuery) -> Result<Vec<Record>, RemoteError> {
        let mut records: Vec<Record> = self.list("*", query).await?;
        for record in &mut records {
            record.kind = self.kind.clone();
        }
        Ok(records)
    }

    async fn create(&self, record: &Record) -> Result<ImportResult, RemoteError> {
        self.import(Method::POST, &self.endpoint, Some(record)).await
    }

    async fn update(&self, record: &Record) -> Result<ImportResult, RemoteError> {
        self.import(Method::PUT, &self.item_path(&record.uid), Some(record)).await
    }

    async fn delete(&self, uid: &Uid) -> Result<ImportResult, RemoteError> {
        self.import(Method::DELETE, &self.item_path(uid), None).await
    }

    async fn fetch_one(&self, uid: &Uid) -> Result<Record, RemoteError> {
        let response = self
            .connection
            .request(Method::GET, &self.item_path(uid))
            .query(&[("fields", "*")])
            .send()
            .await
            .map_err(from_reqwest)?;
        let body = success_body(response).await?;

        let mut record: Record = decode(&body)?;
        record.kind = self.kind.clone();
        Ok(record)
    }
}

/// [`ServerClock`] reading `serverDate` from the system info endpoint
pub struct HttpServerClock {
    connection: HttpConnection,
}

impl HttpServerClock {
    pub fn new(connection: HttpConnection) -> Self {
        Self { connection }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SystemInfo {
    server_date: String,
}

#[async_trait]
impl ServerClock for HttpServerClock {
    async fn now(&self) -> Result<DateTime<Utc>, RemoteError> {
        let response = self
            .connection
            .request(Method::GET, "system/info")
            .send()
            .await
            .map_err(from_reqwest)?;
        let body = success_body(response).await?;
        let info: SystemInfo = decode(&body)?;
        parse_server_date(&info.server_date)
    }
}

fn from_reqwest(err: reqwest::Error) -> RemoteError {
    if err.is_decode() {
        RemoteError::Decode {
            status: err.status().map(|s| s.as_u16()),
            message: err.to_string(),
        }
    } else {
        RemoteError::Transport(err.to_string())
    }
}

/// Body of a 2xx response, anything else as [`RemoteError::Http`]
async fn success_body(response: Response) -> Result<String, RemoteError> {
    let status = response.status();
    let body = response.text().await.map_err(from_reqwest)?;
    if status.is_success() {
        Ok(body)
    } else {
        Err(RemoteError::Http {
            status: status.as_u16(),
            message: excerpt(&body),
        })
    }
}

fn decode<T: DeserializeOwned>(body: &str) -> Result<T, RemoteError> {
    serde_json::from_str(body).map_err(|e| RemoteError::Decode {
        status: Some(200),
        message: e.to_string(),
    })
}

/// Items of one listing page and the total page count, when reported
fn parse_page<T: DeserializeOwned>(
    body: &str,
    key: &str,
) -> Result<(Vec<T>, Option<u32>), RemoteError> {
    let mut value: serde_json::Value = decode(body)?;

    let page_count = value
        .pointer("/pager/pageCount")
        .and_then(serde_json::Value::as_u64)
        .map(|count| u32::try_from(count).unwrap_or(u32::MAX));

    let items = match value.get_mut(key).map(serde_json::Value::take) {
        Some(items) => serde_json::from_value(items).map_err(|e| RemoteError::Decode {
            status: Some(200),
            message: format!("{}: {}", key, e),
        })?,
        None => Vec::new(),
    };

    Ok((items, page_count))
}

/// Interpret the answer to a create, update or delete request.
///
/// An import envelope is honoured whatever the HTTP status. A 2xx without
/// one counts as success.
fn parse_import(status: u16, body: &str) -> Result<ImportResult, RemoteError> {
    let success = (200..300).contains(&status);

    match serde_json::from_str::<ImportResult>(body) {
        Ok(mut result) => {
            if result.http_status.is_none() {
                result.http_status = Some(status);
            }
            if !success && result.is_success() {
                result.status = ImportStatus::Error;
            }
            Ok(result)
        }
        Err(_) if success && body.trim().is_empty() => Ok(ImportResult {
            http_status: Some(status),
            ..ImportResult::success()
        }),
        Err(e) if success => Err(RemoteError::Decode {
            status: Some(status),
            message: e.to_string(),
        }),
        Err(_) => Err(RemoteError::Http {
            status,
            message: excerpt(body),
        }),
    }
}

/// Server timestamps come with or without an offset; offset-less ones are UTC
fn parse_server_date(value: &str) -> Result<DateTime<Utc>, RemoteError> {
    if let Ok(date) = DateTime::parse_from_rfc3339(value) {
        return Ok(date.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|e| RemoteError::Decode {
            status: Some(200),
            message: format!("Invalid server date {:?}: {}", value, e),
        })
}

fn excerpt(body: &str) -> String {
    let trimmed = body.trim();
    match trimmed.char_indices().nth(MAX_ERROR_BODY) {
        Some((cut, _)) => format!("{}...", &trimmed[..cut]),
        None => trimmed.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_page_reads_items_and_pager() {
        let body = r#"{
            "pager": {"page": 1, "pageCount": 3, "pageSize": 2},
            "events": [
                {"id": "ZwwuwNp6gVd", "lastUpdated": "2024-03-01T10:00:00Z"},
                {"id": "Dq9KfBnTtVv", "lastUpdated": "2024-03-02T10:00:00Z"}
            ]
        }"#;

        let (records, pages) = parse_page::<Record>(body, "events").unwrap();
        assert_eq!(pages, Some(3));
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].uid, Uid::new("Dq9KfBnTtVv"));

        let (identities, pages) = parse_page::<Identity>(r#"{"events": []}"#, "events").unwrap();
        assert!(identities.is_empty());
        assert_eq!(pages, None);
    }

    #[test]
    fn test_parse_page_rejects_garbage() {
        let result = parse_page::<Record>("<html>", "events");
        assert!(matches!(result, Err(RemoteError::Decode { .. })));

        let result = parse_page::<Record>(r#"{"events": {"id": 1}}"#, "events");
        assert!(matches!(result, Err(RemoteError::Decode { .. })));
    }

    #[test]
    fn test_import_envelope_wins_over_status() {
        let body = r#"{
            "status": "ERROR",
            "description": "Enrollment date is after incident date",
            "conflicts": [{"object": "enrollmentDate", "value": "invalid"}]
        }"#;

        let result = parse_import(409, body).unwrap();
        assert!(!result.is_success());
        assert_eq!(result.http_status, Some(409));
        assert_eq!(result.failure_message(), "Enrollment date is after incident date");

        let ok = parse_import(200, r#"{"status": "OK", "httpStatusCode": 200}"#).unwrap();
        assert!(ok.is_success());
    }

    #[test]
    fn test_import_without_envelope() {
        assert!(parse_import(204, "").unwrap().is_success());
        assert!(matches!(
            parse_import(200, "not json"),
            Err(RemoteError::Decode { status: Some(200), .. })
        ));
        assert!(matches!(
            parse_import(503, "Service Unavailable"),
            Err(RemoteError::Http { status: 503, .. })
        ));
    }

    #[test]
    fn test_successful_envelope_on_error_status_is_a_rejection() {
        let result = parse_import(500, r#"{"status": "SUCCESS"}"#).unwrap();
        assert!(!result.is_success());
        assert_eq!(result.http_status, Some(500));
    }

    #[test]
    fn test_parse_server_date() {
        let expected = Utc.with_ymd_and_hms(2024, 5, 6, 7, 8, 9).unwrap();
        assert_eq!(parse_server_date("2024-05-06T07:08:09Z").unwrap(), expected);
        assert_eq!(parse_server_date("2024-05-06T09:08:09+02:00").unwrap(), expected);
        assert_eq!(parse_server_date("2024-05-06T07:08:09.000").unwrap(), expected);
        assert!(parse_server_date("yesterday").is_err());
    }

    #[test]
    fn test_excerpt_truncates_long_bodies() {
        let long = "x".repeat(MAX_ERROR_BODY + 10);
        assert_eq!(excerpt(&long).len(), MAX_ERROR_BODY + 3);
        assert_eq!(excerpt("  short \n"), "short");
    }

    #[test]
    fn test_connection_normalizes_base_url() {
        let connection =
            HttpConnection::new("http://localhost:8080/api/", None, Duration::from_secs(5), 0)
                .unwrap();
        assert_eq!(connection.base_url, "http://localhost:8080/api");
        assert_eq!(connection.page_size, 1);
    }
}
