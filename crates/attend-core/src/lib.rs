//! attend-core — Kiosk data model and local face matching.
//!
//! Holds the records cached on the kiosk (employee identities, queued
//! attendance) and the distance-based matcher used to verify an employee
//! without a round-trip to the server.

pub mod matcher;
pub mod types;

pub use matcher::{match_employee, EuclideanMatcher, MatchError, Matcher, NO_MATCH_DISTANCE};
pub use types::{
    AttendanceKind, AttendanceRecord, Embedding, EmployeeRecord, MatchResult, NewAttendance,
    ParseKindError,
};
