//! attend-sync — Offline-capable attendance sync engine for the kiosk.
//!
//! Wires the local store, a connectivity monitor and the attendance server
//! together: employee snapshots are pulled into the store, queued attendance
//! is pushed out, and kiosk callers verify faces and record attendance
//! locally through [`OfflineKiosk`].

pub mod connectivity;
pub mod coordinator;
pub mod kiosk;
pub mod remote;

pub use connectivity::{ConnectivityMonitor, LinkProbe, SysfsLinkProbe};
pub use coordinator::{
    AttendanceSyncReport, FullSyncReport, SchedulerHandle, SkipReason, SyncCoordinator,
    SyncPhase, SyncSettings, SyncStatus,
};
pub use kiosk::{OfflineKiosk, VerifyError};
pub use remote::{Credentials, HttpRemote, OfficeInfo, RemoteError, RemoteService};
