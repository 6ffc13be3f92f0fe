use attend_core::{AttendanceKind, Embedding};
use attend_sync::{ConnectivityMonitor, OfflineKiosk, SyncStatus, VerifyError};
use std::sync::Arc;
use zbus::interface;

/// D-Bus interface for the attendance kiosk daemon.
///
/// Bus name: org.attend.Kiosk1
/// Object path: /org/attend/Kiosk1
///
/// Results are JSON strings. When the local store could not be opened only
/// `Status` and `ReportLink` work; everything else fails so the kiosk can
/// fall back to online-only operation.
pub struct KioskService {
    kiosk: Option<OfflineKiosk>,
    monitor: Arc<ConnectivityMonitor>,
    store_error: Option<String>,
}

impl KioskService {
    pub fn new(kiosk: OfflineKiosk) -> Self {
        let monitor = Arc::clone(kiosk.coordinator().monitor());
        Self {
            kiosk: Some(kiosk),
            monitor,
            store_error: None,
        }
    }

    /// Service for a kiosk whose local store is unavailable.
    pub fn degraded(monitor: Arc<ConnectivityMonitor>, store_error: String) -> Self {
        Self {
            kiosk: None,
            monitor,
            store_error: Some(store_error),
        }
    }

    fn kiosk(&self) -> zbus::fdo::Result<&OfflineKiosk> {
        self.kiosk.as_ref().ok_or_else(|| {
            zbus::fdo::Error::Failed(format!(
                "offline store unavailable: {}",
                self.store_error.as_deref().unwrap_or("not initialized")
            ))
        })
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}

fn failed(e: impl std::fmt::Display) -> zbus::fdo::Error {
    zbus::fdo::Error::Failed(e.to_string())
}

#[interface(name = "org.attend.Kiosk1")]
impl KioskService {
    /// Return the sync status snapshot.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let status = match &self.kiosk {
            Some(kiosk) => kiosk.status(),
            None => SyncStatus {
                is_online: self.monitor.is_online(),
                sync_error: self.store_error.clone(),
                ..SyncStatus::default()
            },
        };
        let mut value = serde_json::to_value(&status).map_err(failed)?;
        value["version"] = env!("CARGO_PKG_VERSION").into();
        Ok(value.to_string())
    }

    /// Run a full sync (identity pull, then outbox push).
    async fn sync(&self) -> zbus::fdo::Result<String> {
        let report = self.kiosk()?.coordinator().full_sync().await;
        to_json(&report)
    }

    /// Pull the employee snapshot only.
    async fn sync_employees(&self) -> zbus::fdo::Result<bool> {
        Ok(self.kiosk()?.coordinator().sync_employee_data().await)
    }

    /// Push the attendance outbox only.
    async fn sync_attendance(&self) -> zbus::fdo::Result<String> {
        let report = self.kiosk()?.coordinator().sync_pending_attendance().await;
        to_json(&report)
    }

    /// Look up a cached employee by code. Returns `null` when unknown.
    async fn lookup_employee(&self, employee_code: &str) -> zbus::fdo::Result<String> {
        tracing::debug!(employee_code, "lookup_employee requested");
        let employee = self
            .kiosk()?
            .lookup_employee(employee_code)
            .await
            .map_err(failed)?;
        to_json(&employee)
    }

    /// Verify a captured embedding against the employee's cached references.
    async fn verify_face(&self, employee_code: &str, embedding: Vec<f64>) -> zbus::fdo::Result<String> {
        tracing::info!(employee_code, dim = embedding.len(), "verify_face requested");
        let probe = Embedding::new(embedding.into_iter().map(|v| v as f32).collect());
        let result = self
            .kiosk()?
            .verify_face_locally(employee_code, &probe)
            .await
            .map_err(|e| match e {
                VerifyError::Malformed(m) => zbus::fdo::Error::InvalidArgs(m.to_string()),
                other => failed(other),
            })?;
        to_json(&result)
    }

    /// Queue a check-in or check-out. Returns the local outbox id.
    async fn record_attendance(
        &self,
        employee_code: &str,
        kind: &str,
        confidence: f64,
    ) -> zbus::fdo::Result<i64> {
        let kind: AttendanceKind = kind
            .parse()
            .map_err(|e: attend_core::ParseKindError| zbus::fdo::Error::InvalidArgs(e.to_string()))?;
        self.kiosk()?
            .record_offline_attendance(employee_code, kind, confidence as f32)
            .await
            .map_err(failed)
    }

    /// List queued attendance, oldest first.
    async fn list_pending(&self) -> zbus::fdo::Result<String> {
        let pending = self.kiosk()?.pending_attendance().await.map_err(failed)?;
        to_json(&pending)
    }

    /// Passive link-state signal from the platform network manager.
    async fn report_link(&self, online: bool) {
        self.monitor.report(online);
    }
}
