//! Sync coordinator, the only component that talks to the server.
//!
//! A cycle pulls the employee snapshot into the local store and pushes the
//! attendance outbox. At most one cycle runs at a time: a call that arrives
//! while another is in flight is rejected with [`SkipReason::InProgress`],
//! since overlapping pushes of the same outbox could double-submit
//! attendance.
//!
//! Nothing here returns an error to the caller. Failures land in
//! [`SyncStatus::sync_error`] and the next scheduled tick retries; the
//! outbox and cache are never modified by a failed cycle.

use crate::connectivity::ConnectivityMonitor;
use crate::remote::{
    AttendancePayload, Credentials, OfficeInfo, OfflineSyncResponse, RemoteError, RemoteService,
};
use attend_core::{AttendanceRecord, EmployeeRecord};
use attend_store::{LocalStore, StoreError, OFFICE_INFO_KEY};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Tunables for the coordinator and its scheduler.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    /// Period between scheduled full syncs.
    pub sync_interval: Duration,
    /// Upper bound on each remote call.
    pub request_timeout: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            sync_interval: Duration::from_secs(30 * 60),
            request_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Idle,
    SyncingIdentity,
    SyncingAttendance,
}

/// Observable state for the kiosk UI.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncStatus {
    pub is_online: bool,
    /// A previous identity sync is cached, so local verification works.
    pub is_offline_ready: bool,
    pub is_syncing: bool,
    pub phase: SyncPhase,
    pub last_sync_time: Option<String>,
    /// Active (kiosk-valid) cached identities.
    pub employee_count: usize,
    pub pending_count: usize,
    pub sync_error: Option<String>,
    pub office: Option<OfficeInfo>,
}

impl Default for SyncStatus {
    fn default() -> Self {
        Self {
            is_online: false,
            is_offline_ready: false,
            is_syncing: false,
            phase: SyncPhase::Idle,
            last_sync_time: None,
            employee_count: 0,
            pending_count: 0,
            sync_error: None,
            office: None,
        }
    }
}

/// Why a sync call did no network work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Offline,
    MissingCredentials,
    InProgress,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SkipReason::Offline => "offline",
            SkipReason::MissingCredentials => "kiosk credentials not configured",
            SkipReason::InProgress => "sync already in progress",
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AttendanceSyncReport {
    /// Entries acknowledged by the server and pruned from the outbox.
    pub synced: usize,
    pub errors: Vec<String>,
    pub skipped: Option<SkipReason>,
}

impl AttendanceSyncReport {
    fn skipped(reason: SkipReason) -> Self {
        Self {
            synced: 0,
            errors: vec![reason.to_string()],
            skipped: Some(reason),
        }
    }

    fn failed(message: String) -> Self {
        Self {
            synced: 0,
            errors: vec![message],
            skipped: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FullSyncReport {
    pub employees_synced: bool,
    pub attendance: AttendanceSyncReport,
    /// Set when the whole cycle was refused.
    pub skipped: Option<SkipReason>,
}

#[derive(Error, Debug)]
enum CycleError {
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error("local store: {0}")]
    Store(#[from] StoreError),
    #[error("encode: {0}")]
    Encode(#[from] serde_json::Error),
}

impl CycleError {
    /// Whether the next scheduled cycle can plausibly succeed unchanged.
    fn is_transient(&self) -> bool {
        match self {
            CycleError::Remote(e) => e.is_transient(),
            CycleError::Store(_) | CycleError::Encode(_) => false,
        }
    }
}

/// Which outbox entries a push response lets us drop.
#[derive(Debug, Default, PartialEq)]
struct Acknowledgement {
    /// Stored by the server.
    accepted: Vec<i64>,
    /// Refused for good; retrying verbatim cannot succeed.
    dropped: Vec<i64>,
}

/// Map a push response back onto the submitted batch.
///
/// Per-position detail wins when the server sends it. A bare count is read
/// as "the first `synced` entries in FIFO order".
fn acknowledge(batch: &[AttendanceRecord], resp: &OfflineSyncResponse) -> Acknowledgement {
    let accepted: BTreeSet<usize> = match &resp.accepted {
        Some(positions) => positions.iter().copied().filter(|i| *i < batch.len()).collect(),
        None => (0..resp.synced.min(batch.len())).collect(),
    };
    let dropped: BTreeSet<usize> = resp
        .rejected
        .iter()
        .filter(|r| r.permanent && r.index < batch.len() && !accepted.contains(&r.index))
        .map(|r| r.index)
        .collect();
    Acknowledgement {
        accepted: accepted.iter().map(|i| batch[*i].local_id).collect(),
        dropped: dropped.iter().map(|i| batch[*i].local_id).collect(),
    }
}

pub struct SyncCoordinator {
    store: Arc<LocalStore>,
    remote: Arc<dyn RemoteService>,
    monitor: Arc<ConnectivityMonitor>,
    credentials: Option<Credentials>,
    settings: SyncSettings,
    cycle: Mutex<()>,
    status: Arc<watch::Sender<SyncStatus>>,
}

impl SyncCoordinator {
    pub fn new(
        store: Arc<LocalStore>,
        remote: Arc<dyn RemoteService>,
        monitor: Arc<ConnectivityMonitor>,
        credentials: Option<Credentials>,
        settings: SyncSettings,
    ) -> Self {
        let (status, _) = watch::channel(SyncStatus {
            is_online: monitor.is_online(),
            ..SyncStatus::default()
        });
        let status = Arc::new(status);
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(forward_link_state(monitor.subscribe(), Arc::downgrade(&status)));
        }
        Self {
            store,
            remote,
            monitor,
            credentials,
            settings,
            cycle: Mutex::new(()),
            status,
        }
    }

    /// Load counts, last sync time and office from the store into the status.
    pub async fn hydrate(&self) -> Result<(), StoreError> {
        let last_sync_time = self.store.get_last_sync_time().await?;
        let employee_count = self.store.count_active_employees().await?;
        let pending_count = self.store.count_pending().await?;
        let office = self
            .store
            .get_metadata(OFFICE_INFO_KEY)
            .await?
            .and_then(|raw| serde_json::from_str::<OfficeInfo>(&raw).ok());

        tracing::info!(
            offline_ready = last_sync_time.is_some(),
            employee_count,
            pending_count,
            "sync status hydrated from local store"
        );
        self.status.send_modify(|s| {
            s.is_offline_ready = last_sync_time.is_some();
            s.last_sync_time = last_sync_time;
            s.employee_count = employee_count;
            s.pending_count = pending_count;
            s.office = office;
        });
        Ok(())
    }

    /// Snapshot of the observable state.
    pub fn status(&self) -> SyncStatus {
        let mut status = self.status.borrow().clone();
        status.is_online = self.monitor.is_online();
        status
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    pub fn monitor(&self) -> &Arc<ConnectivityMonitor> {
        &self.monitor
    }

    /// Re-read the outbox size after an enqueue.
    pub async fn refresh_pending_count(&self) -> Result<usize, StoreError> {
        let pending = self.store.count_pending().await?;
        self.status.send_modify(|s| s.pending_count = pending);
        Ok(pending)
    }

    /// Pull and cache the employee snapshot. Returns whether it succeeded.
    pub async fn sync_employee_data(&self) -> bool {
        let Ok(_cycle) = self.cycle.try_lock() else {
            tracing::debug!("identity sync rejected; another sync is in flight");
            return false;
        };
        self.clear_error_if_ready();
        self.run_identity().await
    }

    /// Push the whole outbox and prune what the server acknowledged.
    pub async fn sync_pending_attendance(&self) -> AttendanceSyncReport {
        let Ok(_cycle) = self.cycle.try_lock() else {
            tracing::debug!("attendance sync rejected; another sync is in flight");
            return AttendanceSyncReport::skipped(SkipReason::InProgress);
        };
        self.clear_error_if_ready();
        self.run_attendance().await
    }

    /// Identity pull followed by outbox push. The push runs even when the
    /// pull fails.
    pub async fn full_sync(&self) -> FullSyncReport {
        let Ok(_cycle) = self.cycle.try_lock() else {
            tracing::debug!("full sync rejected; another sync is in flight");
            return FullSyncReport {
                employees_synced: false,
                attendance: AttendanceSyncReport::skipped(SkipReason::InProgress),
                skipped: Some(SkipReason::InProgress),
            };
        };
        self.clear_error_if_ready();
        let employees_synced = self.run_identity().await;
        let attendance = self.run_attendance().await;
        tracing::info!(
            employees_synced,
            attendance_synced = attendance.synced,
            attendance_errors = attendance.errors.len(),
            "full sync finished"
        );
        FullSyncReport {
            employees_synced,
            attendance,
            skipped: None,
        }
    }

    fn guard(&self) -> Result<&Credentials, SkipReason> {
        if !self.monitor.is_online() {
            return Err(SkipReason::Offline);
        }
        self.credentials.as_ref().ok_or(SkipReason::MissingCredentials)
    }

    fn set_phase(&self, phase: SyncPhase) {
        self.status.send_modify(|s| {
            s.phase = phase;
            s.is_syncing = phase != SyncPhase::Idle;
        });
    }

    /// A call refused by [`guard`](Self::guard) leaves the last failure in
    /// place; the outbox it describes is still undelivered.
    fn clear_error_if_ready(&self) {
        if self.guard().is_ok() {
            self.status.send_if_modified(|s| s.sync_error.take().is_some());
        }
    }

    fn record_error(&self, message: String) {
        self.status.send_modify(|s| s.sync_error = Some(message));
    }

    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, RemoteError>>,
    ) -> Result<T, RemoteError> {
        let limit = self.settings.request_timeout;
        tokio::time::timeout(limit, call)
            .await
            .map_err(|_| RemoteError::Timeout(limit))?
    }

    async fn run_identity(&self) -> bool {
        let credentials = match self.guard() {
            Ok(c) => c,
            Err(reason) => {
                tracing::debug!(%reason, "identity sync skipped");
                return false;
            }
        };

        self.set_phase(SyncPhase::SyncingIdentity);
        let outcome = self.pull_identity(credentials).await;
        self.set_phase(SyncPhase::Idle);

        match outcome {
            Ok(count) => {
                tracing::info!(count, "employee snapshot cached");
                true
            }
            Err(e) => {
                tracing::warn!(error = %e, transient = e.is_transient(), "identity sync failed");
                self.record_error(e.to_string());
                false
            }
        }
    }

    async fn pull_identity(&self, credentials: &Credentials) -> Result<usize, CycleError> {
        let since = self.store.get_last_sync_time().await?;
        let snapshot = self
            .bounded(self.remote.sync_data(credentials, since.as_deref()))
            .await?;

        let records: Vec<EmployeeRecord> = snapshot.employees.into_iter().map(Into::into).collect();
        let office_json = snapshot
            .office_info
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let count = self
            .store
            .apply_identity_snapshot(records, snapshot.last_sync_time.clone(), office_json)
            .await?;
        let employee_count = self.store.count_active_employees().await?;

        // Only raised once the store write has committed.
        self.status.send_modify(|s| {
            s.is_offline_ready = true;
            s.last_sync_time = Some(snapshot.last_sync_time);
            s.employee_count = employee_count;
            if snapshot.office_info.is_some() {
                s.office = snapshot.office_info;
            }
        });
        Ok(count)
    }

    async fn run_attendance(&self) -> AttendanceSyncReport {
        let credentials = match self.guard() {
            Ok(c) => c,
            Err(reason) => {
                tracing::debug!(%reason, "attendance sync skipped");
                return AttendanceSyncReport::skipped(reason);
            }
        };

        let pending = match self.store.list_pending_attendance().await {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(error = %e, "could not read attendance outbox");
                let message = format!("local store: {e}");
                self.record_error(message.clone());
                return AttendanceSyncReport::failed(message);
            }
        };
        if pending.is_empty() {
            return AttendanceSyncReport::default();
        }

        self.set_phase(SyncPhase::SyncingAttendance);
        let outcome = self.push_outbox(credentials, &pending).await;
        self.set_phase(SyncPhase::Idle);

        match outcome {
            Ok(report) => report,
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    transient = e.is_transient(),
                    queued = pending.len(),
                    "attendance push failed; outbox kept"
                );
                self.record_error(e.to_string());
                AttendanceSyncReport::failed(e.to_string())
            }
        }
    }

    async fn push_outbox(
        &self,
        credentials: &Credentials,
        pending: &[AttendanceRecord],
    ) -> Result<AttendanceSyncReport, CycleError> {
        let batch: Vec<AttendancePayload> = pending.iter().map(AttendancePayload::from).collect();
        let resp = self
            .bounded(self.remote.push_attendance(credentials, &batch))
            .await?;

        let ack = acknowledge(pending, &resp);
        for rejection in resp.rejected.iter().filter(|r| r.permanent) {
            tracing::warn!(
                index = rejection.index,
                error = %rejection.error,
                "attendance permanently rejected; dropping from outbox"
            );
        }

        let mut prune = ack.accepted.clone();
        prune.extend_from_slice(&ack.dropped);
        let removed = self.store.remove_attendance(&prune).await?;
        let remaining = self.store.count_pending().await?;
        self.status.send_modify(|s| s.pending_count = remaining);

        tracing::info!(
            submitted = pending.len(),
            accepted = ack.accepted.len(),
            dropped = ack.dropped.len(),
            removed,
            remaining,
            "attendance pushed"
        );

        let mut errors = resp.errors;
        for rejection in &resp.rejected {
            if !errors.contains(&rejection.error) && !rejection.error.is_empty() {
                errors.push(rejection.error.clone());
            }
        }
        if !errors.is_empty() {
            self.record_error(format!(
                "{} attendance record(s) rejected: {}",
                pending.len() - ack.accepted.len(),
                errors.join("; ")
            ));
        }

        Ok(AttendanceSyncReport {
            synced: ack.accepted.len(),
            errors,
            skipped: None,
        })
    }

    /// Run one full sync now (when online and configured), then one every
    /// `sync_interval` and on every offline → online transition. Ticks that
    /// fire while offline are skipped silently.
    pub fn spawn_scheduler(self: &Arc<Self>) -> SchedulerHandle {
        let coordinator = Arc::clone(self);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        if self.credentials.is_none() {
            tracing::warn!("kiosk credentials not configured; scheduled syncs will be skipped");
        }

        let task = tokio::spawn(async move {
            let period = coordinator.settings.sync_interval;
            let mut link = coordinator.monitor.subscribe();
            let mut was_online = *link.borrow_and_update();

            if was_online && coordinator.credentials.is_some() {
                coordinator.full_sync().await;
            }

            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {
                        if coordinator.monitor.is_online() {
                            coordinator.full_sync().await;
                        } else {
                            tracing::debug!("scheduled sync skipped; offline");
                        }
                    }
                    changed = link.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let online = *link.borrow_and_update();
                        if online && !was_online {
                            tracing::info!("link restored; syncing");
                            coordinator.full_sync().await;
                        }
                        was_online = online;
                    }
                }
            }
            tracing::debug!("sync scheduler stopped");
        });

        SchedulerHandle {
            shutdown: Some(shutdown_tx),
            task,
        }
    }
}

/// Mirror link transitions into the status channel for `subscribe` callers.
/// Ends once the coordinator is gone.
async fn forward_link_state(
    mut link: watch::Receiver<bool>,
    status: Weak<watch::Sender<SyncStatus>>,
) {
    while link.changed().await.is_ok() {
        let online = *link.borrow_and_update();
        let Some(status) = status.upgrade() else {
            break;
        };
        status.send_if_modified(|s| {
            let changed = s.is_online != online;
            s.is_online = online;
            changed
        });
    }
}

/// Owns the scheduler task. Dropping it also stops the scheduler.
pub struct SchedulerHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Stop scheduling and wait for an in-flight cycle to finish.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let _ = (&mut self.task).await;
    }
}
