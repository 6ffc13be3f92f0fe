//! attend-store — Durable device-resident store for the kiosk.
//!
//! Three logical tables live in one SQLite file: the cached employee
//! identities, the pending-attendance outbox and scalar sync metadata.
//! Nothing else on the device touches the database directly.

pub mod store;

pub use store::{LocalStore, StoreError, LAST_SYNC_TIME_KEY, OFFICE_INFO_KEY};
