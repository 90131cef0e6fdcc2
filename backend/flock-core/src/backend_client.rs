// src/backend_client.rs
use async_trait::async_trait;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info};
use url::Url;

use crate::attendance_book::ChangeEvent;
use crate::calendar::format_calendar_date;
use crate::models::{AttendanceMember, AttendanceRecord, AttendanceReport};
use crate::snapshot::BookSnapshot;

pub const MEMBERS_TABLE: &str = "attendance_members";
pub const RECORDS_TABLE: &str = "attendance_records";
pub const REPORTS_TABLE: &str = "attendance_reports";

const REST_PREFIX: &str = "rest/v1/";
const REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("URL parsing error: {0}")]
    UrlParse(#[from] url::ParseError),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Backend API error: Status={status}, Message='{message}'")]
    Api { status: StatusCode, message: String },
}

/// Where the attendance tables of record live.
#[async_trait]
pub trait AttendanceSource: Send + Sync {
    async fn fetch_all(&self) -> Result<BookSnapshot, BackendError>;
    async fn push_change(&self, event: &ChangeEvent) -> Result<(), BackendError>;
}

/// Client for the PostgREST-style table API of the hosted backend.
#[derive(Clone)]
pub struct BackendClient {
    http_client: Client,
    base_url: Url,
    api_key: String,
}

impl BackendClient {
    pub fn new(base_url: &str, api_key: &str) -> Result<Self, BackendError> {
        let mut base_url = Url::parse(base_url)?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let http_client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            http_client,
            base_url,
            api_key: api_key.to_string(),
        })
    }

    pub fn table_url(&self, table: &str, query: &[(&str, String)]) -> Result<Url, BackendError> {
        let mut url = self.base_url.join(REST_PREFIX)?.join(table)?;
        if !query.is_empty() {
            url.query_pairs_mut()
                .extend_pairs(query.iter().map(|(k, v)| (*k, v.as_str())));
        }
        Ok(url)
    }

    fn build_request(&self, method: Method, url: Url) -> RequestBuilder {
        self.http_client
            .request(method, url)
            .header("apikey", &self.api_key)
            .header(AUTHORIZATION, format!("Bearer {}", self.api_key))
            .header(ACCEPT, "application/json")
            .header(CONTENT_TYPE, "application/json")
    }

    fn upsert_request<T: Serialize>(
        &self,
        table: &str,
        on_conflict: &str,
        rows: &[T],
    ) -> Result<RequestBuilder, BackendError> {
        let url = self.table_url(table, &[("on_conflict", on_conflict.to_string())])?;
        Ok(self
            .build_request(Method::POST, url)
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .body(serde_json::to_vec(rows)?))
    }

    fn delete_request(&self, table: &str, filters: &[(&str, String)]) -> Result<RequestBuilder, BackendError> {
        let query: Vec<(&str, String)> = filters
            .iter()
            .map(|(column, value)| (*column, format!("eq.{}", value)))
            .collect();
        Ok(self.build_request(Method::DELETE, self.table_url(table, &query)?))
    }

    /// The request that mirrors one local change onto the backend tables.
    pub fn change_request(&self, event: &ChangeEvent) -> Result<RequestBuilder, BackendError> {
        match event {
            ChangeEvent::MemberUpserted(member) => {
                self.upsert_request(MEMBERS_TABLE, "id", std::slice::from_ref(member))
            }
            // Record rows cascade on the backend side.
            ChangeEvent::MemberDeleted { member_id } => {
                self.delete_request(MEMBERS_TABLE, &[("id", member_id.clone())])
            }
            ChangeEvent::RecordUpserted(record) => {
                self.upsert_request(RECORDS_TABLE, "member_id,date", std::slice::from_ref(record))
            }
            ChangeEvent::ReportFinalized(report) => {
                self.upsert_request(REPORTS_TABLE, "department,sunday", std::slice::from_ref(report))
            }
            ChangeEvent::ReportReopened { department, sunday } => self.delete_request(
                REPORTS_TABLE,
                &[
                    ("department", department.clone()),
                    ("sunday", format_calendar_date(sunday.date())),
                ],
            ),
        }
    }

    async fn send(&self, request: RequestBuilder, context_msg: &str) -> Result<reqwest::Response, BackendError> {
        let response = request.send().await.map_err(|e| {
            error!("Backend request for '{}' failed before a response: {}", context_msg, e);
            BackendError::Request(e)
        })?;
        let status = response.status();
        debug!("Backend response for '{}': Status={}", context_msg, status);
        if status.is_success() {
            return Ok(response);
        }
        let message = response
            .text()
            .await
            .unwrap_or_else(|e| format!("Failed to read error body: {}", e));
        error!(
            "Backend API error for '{}': Status={}, Body='{}'",
            context_msg, status, message
        );
        Err(BackendError::Api { status, message })
    }

    async fn fetch_table<T: DeserializeOwned>(&self, table: &str) -> Result<Vec<T>, BackendError> {
        let url = self.table_url(table, &[("select", "*".to_string())])?;
        let bytes = self
            .send(self.build_request(Method::GET, url), table)
            .await?
            .bytes()
            .await?;
        let rows: Vec<T> = serde_json::from_slice(&bytes)?;
        Ok(rows)
    }
}

#[async_trait]
impl AttendanceSource for BackendClient {
    async fn fetch_all(&self) -> Result<BookSnapshot, BackendError> {
        let members: Vec<AttendanceMember> = self.fetch_table(MEMBERS_TABLE).await?;
        let records: Vec<AttendanceRecord> = self.fetch_table(RECORDS_TABLE).await?;
        let reports: Vec<AttendanceReport> = self.fetch_table(REPORTS_TABLE).await?;
        info!(
            "Fetched {} members, {} records, {} reports from backend",
            members.len(),
            records.len(),
            reports.len()
        );
        Ok(BookSnapshot {
            members,
            records,
            reports,
            ..Default::default()
        })
    }

    async fn push_change(&self, event: &ChangeEvent) -> Result<(), BackendError> {
        let request = self.change_request(event)?;
        self.send(request, "push change").await?;
        Ok(())
    }
}
