//! Operations the kiosk interaction surface calls into.

use crate::coordinator::{SyncCoordinator, SyncStatus};
use attend_core::{
    match_employee, AttendanceKind, AttendanceRecord, Embedding, EmployeeRecord, EuclideanMatcher,
    MatchError, MatchResult, NewAttendance,
};
use attend_store::{LocalStore, StoreError};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

#[derive(Error, Debug)]
pub enum VerifyError {
    /// Integration defect; fail this attempt, do not retry.
    #[error(transparent)]
    Malformed(#[from] MatchError),
    #[error("local store: {0}")]
    Store(#[from] StoreError),
}

/// Local lookup, verification and attendance capture for one kiosk.
#[derive(Clone)]
pub struct OfflineKiosk {
    store: Arc<LocalStore>,
    coordinator: Arc<SyncCoordinator>,
    /// Maximum distance accepted as a match. Lower is stricter.
    match_threshold: f32,
}

impl OfflineKiosk {
    pub fn new(store: Arc<LocalStore>, coordinator: Arc<SyncCoordinator>, match_threshold: f32) -> Self {
        Self {
            store,
            coordinator,
            match_threshold,
        }
    }

    pub fn coordinator(&self) -> &Arc<SyncCoordinator> {
        &self.coordinator
    }

    pub async fn lookup_employee(&self, employee_code: &str) -> Result<Option<EmployeeRecord>, StoreError> {
        self.store.get_employee(employee_code).await
    }

    /// Compare a live embedding with the employee's cached references.
    /// An employee with nothing enrolled is a plain non-match.
    pub async fn verify_face_locally(
        &self,
        employee_code: &str,
        embedding: &Embedding,
    ) -> Result<MatchResult, VerifyError> {
        let employee = self.store.get_employee(employee_code).await?;
        let result = match_employee(&EuclideanMatcher, employee.as_ref(), embedding, self.match_threshold)?;
        tracing::info!(
            employee = employee_code,
            is_match = result.is_match,
            confidence = result.confidence,
            "local face verification"
        );
        Ok(result)
    }

    /// Queue an attendance event stamped with the device clock.
    pub async fn record_offline_attendance(
        &self,
        employee_code: &str,
        kind: AttendanceKind,
        confidence: f32,
    ) -> Result<i64, StoreError> {
        let local_id = self
            .store
            .enqueue_attendance(NewAttendance::now(employee_code, kind, confidence))
            .await?;
        tracing::info!(employee = employee_code, %kind, local_id, "attendance recorded offline");
        if let Err(e) = self.coordinator.refresh_pending_count().await {
            tracing::warn!(error = %e, "pending count refresh failed");
        }
        Ok(local_id)
    }

    /// Outbox contents, oldest first.
    pub async fn pending_attendance(&self) -> Result<Vec<AttendanceRecord>, StoreError> {
        self.store.list_pending_attendance().await
    }

    pub fn status(&self) -> SyncStatus {
        self.coordinator.status()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.coordinator.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectivity::ConnectivityMonitor;
    use crate::coordinator::SyncSettings;
    use crate::remote::{
        AttendancePayload, Credentials, OfflineSyncResponse, RemoteError, RemoteService,
        SyncDataResponse,
    };
    use async_trait::async_trait;

    /// Server that is never reachable; the kiosk works from the cache.
    struct Unreachable;

    #[async_trait]
    impl RemoteService for Unreachable {
        async fn sync_data(&self, _: &Credentials, _: Option<&str>) -> Result<SyncDataResponse, RemoteError> {
            Err(RemoteError::Status { status: 503, message: "down".into() })
        }

        async fn push_attendance(
            &self,
            _: &Credentials,
            _: &[AttendancePayload],
        ) -> Result<OfflineSyncResponse, RemoteError> {
            Err(RemoteError::Status { status: 503, message: "down".into() })
        }
    }

    async fn kiosk_at(path: &std::path::Path) -> OfflineKiosk {
        let store = Arc::new(LocalStore::open_at(path).await.unwrap());
        let coordinator = Arc::new(SyncCoordinator::new(
            Arc::clone(&store),
            Arc::new(Unreachable),
            Arc::new(ConnectivityMonitor::new(false)),
            Credentials::from_parts(Some("K1".into()), Some("123456".into())),
            SyncSettings::default(),
        ));
        coordinator.hydrate().await.unwrap();
        OfflineKiosk::new(store, coordinator, 0.6)
    }

    fn enrolled(code: &str, refs: Vec<Vec<f32>>) -> EmployeeRecord {
        EmployeeRecord {
            id: format!("id-{code}"),
            employee_code: code.into(),
            name: code.into(),
            face_embeddings: refs.into_iter().map(Embedding::new).collect(),
            is_active: true,
        }
    }

    #[tokio::test]
    async fn test_verify_and_record_while_offline() {
        let dir = tempfile::tempdir().unwrap();
        let kiosk = kiosk_at(&dir.path().join("kiosk.db")).await;
        kiosk
            .store
            .replace_employees(vec![enrolled("E1", vec![vec![0.6, 0.8]])])
            .await
            .unwrap();

        let result = kiosk
            .verify_face_locally("E1", &Embedding::new(vec![0.6, 0.8]))
            .await
            .unwrap();
        assert!(result.is_match);

        let id = kiosk
            .record_offline_attendance("E1", AttendanceKind::CheckIn, result.confidence)
            .await
            .unwrap();
        assert!(id > 0);
        assert_eq!(kiosk.status().pending_count, 1);
    }

    #[tokio::test]
    async fn test_no_biometric_is_non_match() {
        let dir = tempfile::tempdir().unwrap();
        let kiosk = kiosk_at(&dir.path().join("kiosk.db")).await;
        kiosk.store.replace_employees(vec![enrolled("E2", vec![])]).await.unwrap();

        let result = kiosk
            .verify_face_locally("E2", &Embedding::new(vec![0.1, 0.2]))
            .await
            .unwrap();
        assert!(!result.is_match);
        assert_eq!(result.confidence, 0.0);

        let unknown = kiosk
            .verify_face_locally("nobody", &Embedding::new(vec![0.1, 0.2]))
            .await
            .unwrap();
        assert!(!unknown.is_match);
    }

    #[tokio::test]
    async fn test_malformed_embedding_propagates() {
        let dir = tempfile::tempdir().unwrap();
        let kiosk = kiosk_at(&dir.path().join("kiosk.db")).await;
        kiosk
            .store
            .replace_employees(vec![enrolled("E1", vec![vec![0.6, 0.8]])])
            .await
            .unwrap();

        let err = kiosk
            .verify_face_locally("E1", &Embedding::new(vec![0.6, 0.8, 0.0]))
            .await
            .unwrap_err();
        assert!(matches!(err, VerifyError::Malformed(MatchError::MalformedEmbedding { .. })));
        assert_eq!(kiosk.status().sync_error, None);
    }

    #[tokio::test]
    async fn test_lookup_employee() {
        let dir = tempfile::tempdir().unwrap();
        let kiosk = kiosk_at(&dir.path().join("kiosk.db")).await;
        kiosk.store.replace_employees(vec![enrolled("E1", vec![])]).await.unwrap();
        assert_eq!(kiosk.lookup_employee("E1").await.unwrap().unwrap().name, "E1");
        assert!(kiosk.lookup_employee("E9").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_offline_records_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kiosk.db");
        {
            let kiosk = kiosk_at(&path).await;
            for kind in [AttendanceKind::CheckIn, AttendanceKind::CheckOut] {
                kiosk.record_offline_attendance("E1", kind, 0.92).await.unwrap();
            }
            kiosk.store.close().await.unwrap();
        }

        let kiosk = kiosk_at(&path).await;
        assert_eq!(kiosk.status().pending_count, 2);
        let pending = kiosk.store.list_pending_attendance().await.unwrap();
        assert_eq!(pending[0].kind, AttendanceKind::CheckIn);
        assert_eq!(pending[1].kind, AttendanceKind::CheckOut);
    }

    #[tokio::test]
    async fn test_failed_sync_leaves_cache_and_outbox() {
        let dir = tempfile::tempdir().unwrap();
        let kiosk = kiosk_at(&dir.path().join("kiosk.db")).await;
        kiosk.store.replace_employees(vec![enrolled("E1", vec![vec![1.0]])]).await.unwrap();
        kiosk.record_offline_attendance("E1", AttendanceKind::CheckIn, 0.9).await.unwrap();

        kiosk.coordinator().monitor().report(true);
        let report = kiosk.coordinator().full_sync().await;
        assert!(!report.employees_synced);
        assert_eq!(report.attendance.synced, 0);

        assert!(kiosk.lookup_employee("E1").await.unwrap().is_some());
        assert_eq!(kiosk.store.count_pending().await.unwrap(), 1);
        assert!(kiosk.status().sync_error.is_some());
    }
}
