use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Face embedding vector produced by the external capture step.
///
/// Serialized as a bare array of numbers so a list of embeddings is the
/// `[[f32]]` shape the server ships.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    /// Number of components.
    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Euclidean (L2) distance. Callers must check dimensionality first;
    /// extra components on either side are ignored.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

impl From<Vec<f32>> for Embedding {
    fn from(values: Vec<f32>) -> Self {
        Self { values }
    }
}

/// Cached employee identity. The whole table is replaced on every
/// successful identity sync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmployeeRecord {
    /// Server-assigned identifier.
    pub id: String,
    /// Human-facing code used for QR/manual lookup. Unique within the cache.
    pub employee_code: String,
    pub name: String,
    /// Zero or more enrolled references.
    pub face_embeddings: Vec<Embedding>,
    /// Inactive employees stay cached but never match.
    pub is_active: bool,
}

/// Direction of an attendance event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AttendanceKind {
    CheckIn,
    CheckOut,
}

impl AttendanceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttendanceKind::CheckIn => "check-in",
            AttendanceKind::CheckOut => "check-out",
        }
    }
}

impl fmt::Display for AttendanceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown attendance kind: {0:?} (expected check-in or check-out)")]
pub struct ParseKindError(pub String);

impl FromStr for AttendanceKind {
    type Err = ParseKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "check-in" => Ok(AttendanceKind::CheckIn),
            "check-out" => Ok(AttendanceKind::CheckOut),
            other => Err(ParseKindError(other.to_string())),
        }
    }
}

/// An attendance event before the store has assigned it a local id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewAttendance {
    pub employee_code: String,
    pub kind: AttendanceKind,
    /// Device clock at the moment the action was confirmed.
    pub timestamp: DateTime<Utc>,
    /// Matcher confidence at capture time, kept for audit.
    pub confidence: f32,
}

impl NewAttendance {
    /// Stamp a new event with the current device time.
    pub fn now(employee_code: impl Into<String>, kind: AttendanceKind, confidence: f32) -> Self {
        Self {
            employee_code: employee_code.into(),
            kind,
            timestamp: Utc::now(),
            confidence,
        }
    }
}

/// A queued outbox entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    /// Store-assigned, monotonically increasing. Never sent to the server.
    pub local_id: i64,
    pub employee_code: String,
    pub kind: AttendanceKind,
    pub timestamp: DateTime<Utc>,
    pub confidence: f32,
}

/// Verdict of comparing a live embedding against an employee's references.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub is_match: bool,
    /// Smallest distance across all references.
    pub distance: f32,
    /// Monotonically decreasing in `distance`.
    pub similarity: f32,
    /// `similarity` clamped to [0, 1].
    pub confidence: f32,
}

impl MatchResult {
    /// Definitive non-match, used when there is nothing to compare against.
    pub fn no_match() -> Self {
        Self {
            is_match: false,
            distance: crate::matcher::NO_MATCH_DISTANCE,
            similarity: 0.0,
            confidence: 0.0,
        }
    }
}
