// Copyright 2024, The Tremor Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use super::{AckToken, SessionFactory, WriteSession};
use crate::credentials::{TokenProvider, QUOTA_PROJECT_HEADER};
use crate::errors::{ClientError, FailureKind, WriteError};
use crate::record::{Record, TableId};
use serde::{Deserialize, Serialize};
use simd_json::OwnedValue;
use std::sync::Arc;
use std::time::Duration;

#[derive(Serialize)]
struct Row<'value> {
    #[serde(rename = "insertId")]
    insert_id: String,
    json: &'value OwnedValue,
}

#[derive(Deserialize)]
struct ErrorProto {
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Deserialize)]
struct InsertError {
    #[serde(default)]
    index: u64,
    #[serde(default)]
    errors: Vec<ErrorProto>,
}

#[derive(Deserialize)]
struct InsertAllResponse {
    #[serde(default, rename = "insertErrors")]
    insert_errors: Vec<InsertError>,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    errors: Vec<ErrorProto>,
}

#[derive(Deserialize)]
struct ErrorResponse {
    error: ErrorBody,
}

/// Classifies a failed `insertAll` call by its http status and error reason
pub(crate) fn classify_http(status: u16, reason: Option<&str>) -> FailureKind {
    match (status, reason) {
        (429, _) | (403, Some("quotaExceeded" | "rateLimitExceeded")) => FailureKind::Throttled,
        (500..=599, _) => FailureKind::Transport,
        (401 | 403, _) => FailureKind::PermissionDenied,
        (400, _) => FailureKind::MalformedPayload,
        _ => FailureKind::Rejected,
    }
}

/// Opens sessions against the legacy `tabledata.insertAll` API
pub struct InsertAllFactory<T: TokenProvider> {
    client: reqwest::Client,
    endpoint: String,
    token_provider: T,
    request_timeout: Duration,
    quota_project: Option<String>,
}

impl<T: TokenProvider> InsertAllFactory<T> {
    /// `endpoint` is the REST base url, usually `https://bigquery.googleapis.com/bigquery/v2`
    ///
    /// # Errors
    /// if the http client can not be built
    pub fn new(
        token_provider: T,
        endpoint: &str,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Self, ClientError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| ClientError::Channel(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            token_provider,
            request_timeout,
            quota_project: None,
        })
    }

    /// bills quota of every request to `project`
    #[must_use]
    pub fn with_quota_project(mut self, project: impl Into<String>) -> Self {
        self.quota_project = Some(project.into());
        self
    }
}

async fn authorization<T: TokenProvider>(token_provider: &T) -> Result<Arc<String>, tonic::Status> {
    let mut token_provider = token_provider.clone();
    // minting a token blocks
    tokio::task::spawn_blocking(move || token_provider.get_token())
        .await
        .map_err(|e| tonic::Status::unavailable(e.to_string()))?
}

#[async_trait::async_trait]
impl<T: TokenProvider> SessionFactory for InsertAllFactory<T> {
    async fn handshake(&self) -> Result<(), ClientError> {
        info!("Connecting to BigQuery ({})", self.endpoint);
        authorization(&self.token_provider)
            .await
            .map_err(|s| ClientError::AuthenticationRejected(s.message().to_string()))?;
        Ok(())
    }

    async fn open(&self, table: &TableId) -> Result<Box<dyn WriteSession>, ClientError> {
        Ok(Box::new(InsertAllSession {
            table: table.clone(),
            url: format!("{}/{}/insertAll", self.endpoint, table.path()),
            client: self.client.clone(),
            token_provider: self.token_provider.clone(),
            request_timeout: self.request_timeout,
            quota_project: self.quota_project.clone(),
        }))
    }
}

struct InsertAllSession<T: TokenProvider> {
    table: TableId,
    url: String,
    client: reqwest::Client,
    token_provider: T,
    request_timeout: Duration,
    quota_project: Option<String>,
}

impl<T: TokenProvider> InsertAllSession<T> {
    fn body(rows: &[Vec<u8>]) -> Vec<u8> {
        let mut body = br#"{"skipInvalidRows":false,"ignoreUnknownValues":false,"rows":["#.to_vec();
        for (i, row) in rows.iter().enumerate() {
            if i > 0 {
                body.push(b',');
            }
            body.extend_from_slice(row);
        }
        body.extend_from_slice(b"]}");
        body
    }
}

fn first_error(errors: &[ErrorProto]) -> (Option<&str>, String) {
    errors.first().map_or((None, String::new()), |e| {
        (
            e.reason.as_deref(),
            e.message.clone().unwrap_or_default(),
        )
    })
}

#[async_trait::async_trait]
impl<T: TokenProvider> WriteSession for InsertAllSession<T> {
    fn encode(&self, record: &Record) -> Result<Vec<u8>, WriteError> {
        let offset = record.offset();
        let json = record.to_json();
        let row = Row {
            // best effort de-duplication of retried rows
            insert_id: format!(
                "{}-{}-{}",
                offset.partition.topic, offset.partition.partition, offset.offset
            ),
            json: &json,
        };
        simd_json::serde::to_vec(&row).map_err(|e| WriteError::malformed(e.to_string()))
    }

    async fn append(&mut self, rows: &[Vec<u8>]) -> Result<AckToken, WriteError> {
        let token = authorization(&self.token_provider)
            .await
            .map_err(WriteError::from)?;
        let mut request = self
            .client
            .post(&self.url)
            .header("authorization", token.as_str())
            .header("content-type", "application/json");
        if let Some(project) = &self.quota_project {
            request = request.header(QUOTA_PROJECT_HEADER, project.as_str());
        }
        let response = request
            .timeout(self.request_timeout)
            .body(Self::body(rows))
            .send()
            .await
            .map_err(|e| WriteError::transport(e.to_string()))?;
        let status = response.status();
        let mut body = response
            .bytes()
            .await
            .map_err(|e| WriteError::transport(e.to_string()))?
            .to_vec();

        if status.is_success() {
            let res: InsertAllResponse = simd_json::serde::from_slice(&mut body)
                .map_err(|e| WriteError::transport(format!("invalid insertAll response: {e}")))?;
            if let Some(insert_error) = res.insert_errors.first() {
                let (reason, message) = first_error(&insert_error.errors);
                return Err(WriteError::new(
                    FailureKind::SchemaMismatch,
                    format!(
                        "{} row(s) rejected, row {}: {} {message}",
                        res.insert_errors.len(),
                        insert_error.index,
                        reason.unwrap_or("invalid"),
                    ),
                ));
            }
            return Ok(AckToken {
                stream: self.table.to_string(),
                offset: None,
                rows: rows.len(),
            });
        }

        let error = simd_json::serde::from_slice::<ErrorResponse>(&mut body)
            .ok()
            .map(|r| r.error);
        let (reason, message) = error.as_ref().map_or((None, String::new()), |e| {
            let (reason, message) = first_error(&e.errors);
            (reason, e.message.clone().unwrap_or(message))
        });
        Err(WriteError::new(
            classify_http(status.as_u16(), reason),
            format!("HTTP {status}: {message}"),
        ))
    }

    async fn close(&mut self) -> Result<(), ClientError> {
        Ok(())
    }
}
