//! Client side of the attendance server's kiosk endpoints.
//!
//! Payloads are parsed into strict structs with explicit defaults: the
//! server marshals empty lists as `null` and older builds omit optional
//! fields entirely.

use async_trait::async_trait;
use attend_core::{AttendanceKind, AttendanceRecord, Embedding, EmployeeRecord};
use chrono::SecondsFormat;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server returned {status}: {message}")]
    Status { status: u16, message: String },
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("malformed response: {0}")]
    Decode(String),
}

impl RemoteError {
    /// Whether retrying the same request later can plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            RemoteError::Http(_) | RemoteError::Timeout(_) => true,
            RemoteError::Status { status, .. } => *status >= 500 || *status == 408 || *status == 429,
            RemoteError::Decode(_) => false,
        }
    }
}

/// Kiosk id plus admin/pairing code, required by every remote call.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub kiosk_id: String,
    pub admin_code: String,
}

impl Credentials {
    /// Both parts must be present and non-blank.
    pub fn from_parts(kiosk_id: Option<String>, admin_code: Option<String>) -> Option<Self> {
        let kiosk_id = kiosk_id.filter(|s| !s.trim().is_empty())?;
        let admin_code = admin_code.filter(|s| !s.trim().is_empty())?;
        Some(Self {
            kiosk_id,
            admin_code,
        })
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("kiosk_id", &self.kiosk_id)
            .field("admin_code", &"<redacted>")
            .finish()
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn default_true() -> bool {
    true
}

/// Employee as shipped by `GET /kiosk/sync-data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmployeePayload {
    pub id: String,
    pub employee_id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub face_embeddings: Vec<Vec<f32>>,
    /// The endpoint only ships active employees, so absence means active.
    #[serde(default = "default_true")]
    pub is_active: bool,
}

impl From<EmployeePayload> for EmployeeRecord {
    fn from(p: EmployeePayload) -> Self {
        EmployeeRecord {
            id: p.id,
            employee_code: p.employee_id,
            name: p.name,
            face_embeddings: p.face_embeddings.into_iter().map(Embedding::from).collect(),
            is_active: p.is_active,
        }
    }
}

/// Office the kiosk is assigned to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfficeInfo {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub latitude: f64,
    #[serde(default)]
    pub longitude: f64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SyncDataResponse {
    #[serde(default, deserialize_with = "null_as_default")]
    pub employees: Vec<EmployeePayload>,
    /// Server clock at snapshot time; echoed back as `since` next time.
    pub last_sync_time: String,
    #[serde(default)]
    pub office_info: Option<OfficeInfo>,
}

/// Outbox entry as sent to `POST /kiosk/offline-sync`. The local id stays
/// on the device.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttendancePayload {
    pub employee_id: String,
    #[serde(rename = "type")]
    pub kind: AttendanceKind,
    pub timestamp: String,
    pub confidence: f32,
}

impl From<&AttendanceRecord> for AttendancePayload {
    fn from(r: &AttendanceRecord) -> Self {
        AttendancePayload {
            employee_id: r.employee_code.clone(),
            kind: r.kind,
            timestamp: r.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            confidence: r.confidence,
        }
    }
}

#[derive(Serialize)]
struct OfflineSyncRequest<'a> {
    kiosk_id: &'a str,
    admin_code: &'a str,
    records: &'a [AttendancePayload],
}

/// A record the server refused, by position in the submitted batch.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Rejection {
    pub index: usize,
    #[serde(default, deserialize_with = "null_as_default")]
    pub error: String,
    /// Retrying verbatim can never succeed (e.g. unknown employee).
    #[serde(default)]
    pub permanent: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct OfflineSyncResponse {
    #[serde(default)]
    pub synced: usize,
    #[serde(default, deserialize_with = "null_as_default")]
    pub errors: Vec<String>,
    /// Positions within the batch that were stored. When absent only
    /// `synced` is known.
    #[serde(default)]
    pub accepted: Option<Vec<usize>>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub rejected: Vec<Rejection>,
}

/// The two server operations the kiosk consumes.
#[async_trait]
pub trait RemoteService: Send + Sync {
    /// Pull the authoritative employee snapshot.
    async fn sync_data(
        &self,
        credentials: &Credentials,
        since: Option<&str>,
    ) -> Result<SyncDataResponse, RemoteError>;

    /// Push a batch of queued attendance.
    async fn push_attendance(
        &self,
        credentials: &Credentials,
        records: &[AttendancePayload],
    ) -> Result<OfflineSyncResponse, RemoteError>;
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

/// `reqwest`-backed implementation talking JSON over HTTP(S).
pub struct HttpRemote {
    client: reqwest::Client,
    base_url: String,
}

impl HttpRemote {
    /// `base_url` is the API root, e.g. `https://attend.example.com/api`.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, RemoteError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("attendd/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    async fn decode<T: for<'de> Deserialize<'de>>(resp: reqwest::Response) -> Result<T, RemoteError> {
        let status = resp.status();
        let body = resp.bytes().await?;
        if !status.is_success() {
            let message = serde_json::from_slice::<ErrorBody>(&body)
                .map(|b| b.error)
                .unwrap_or_else(|_| String::from_utf8_lossy(&body).into_owned());
            return Err(RemoteError::Status {
                status: status.as_u16(),
                message,
            });
        }
        serde_json::from_slice(&body).map_err(|e| RemoteError::Decode(e.to_string()))
    }
}

#[async_trait]
impl RemoteService for HttpRemote {
    async fn sync_data(
        &self,
        credentials: &Credentials,
        since: Option<&str>,
    ) -> Result<SyncDataResponse, RemoteError> {
        let mut query = vec![
            ("kiosk_id", credentials.kiosk_id.as_str()),
            ("code", credentials.admin_code.as_str()),
        ];
        if let Some(since) = since {
            query.push(("since", since));
        }
        tracing::debug!(kiosk_id = %credentials.kiosk_id, since = ?since, "GET kiosk/sync-data");
        let resp = self
            .client
            .get(self.url("kiosk/sync-data"))
            .query(&query)
            .send()
            .await?;
        Self::decode(resp).await
    }

    async fn push_attendance(
        &self,
        credentials: &Credentials,
        records: &[AttendancePayload],
    ) -> Result<OfflineSyncResponse, RemoteError> {
        tracing::debug!(
            kiosk_id = %credentials.kiosk_id,
            count = records.len(),
            "POST kiosk/offline-sync"
        );
        let resp = self
            .client
            .post(self.url("kiosk/offline-sync"))
            .json(&OfflineSyncRequest {
                kiosk_id: &credentials.kiosk_id,
                admin_code: &credentials.admin_code,
                records,
            })
            .send()
            .await?;
        Self::decode(resp).await
    }
}
