//! Local face matching against an employee's enrolled references.
//!
//! Policy: a probe matches when the distance to its *closest* reference is
//! at or below the configured threshold. Lower threshold = stricter
//! acceptance. The threshold belongs to configuration and is always passed
//! in by the caller.

use crate::types::{Embedding, EmployeeRecord, MatchResult};
use thiserror::Error;

/// Sentinel distance reported when there is nothing to compare against.
pub const NO_MATCH_DISTANCE: f32 = f32::MAX;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MatchError {
    #[error("embedding dimensionality mismatch: reference has {expected} components, probe has {actual}")]
    MalformedEmbedding { expected: usize, actual: usize },
    #[error("probe embedding is empty")]
    EmptyEmbedding,
}

/// Strategy for comparing a probe embedding against a set of references.
pub trait Matcher {
    fn compare(
        &self,
        probe: &Embedding,
        references: &[Embedding],
        threshold: f32,
    ) -> Result<MatchResult, MatchError>;
}

/// Minimum-Euclidean-distance matcher.
///
/// Every reference is compared; the best one decides the verdict. An
/// employee enrolled several times is matched against the enrollment closest
/// to the live sample, never an average.
pub struct EuclideanMatcher;

impl EuclideanMatcher {
    /// Map a distance to a similarity score.
    ///
    /// `1 - d²/2` equals the cosine similarity when both vectors are unit
    /// length and decreases monotonically in `d` for any input.
    pub fn similarity(distance: f32) -> f32 {
        1.0 - distance * distance / 2.0
    }
}

impl Matcher for EuclideanMatcher {
    fn compare(
        &self,
        probe: &Embedding,
        references: &[Embedding],
        threshold: f32,
    ) -> Result<MatchResult, MatchError> {
        if probe.values.is_empty() {
            return Err(MatchError::EmptyEmbedding);
        }
        // Validate every reference up front so the error does not depend on
        // reference order.
        if let Some(bad) = references.iter().find(|r| r.dim() != probe.dim()) {
            return Err(MatchError::MalformedEmbedding {
                expected: bad.dim(),
                actual: probe.dim(),
            });
        }

        let best = references
            .iter()
            .map(|r| probe.euclidean_distance(r))
            .fold(None, |best: Option<f32>, d| match best {
                Some(b) if b <= d => Some(b),
                _ => Some(d),
            });

        let Some(distance) = best else {
            return Ok(MatchResult::no_match());
        };

        let similarity = Self::similarity(distance);
        Ok(MatchResult {
            is_match: distance <= threshold,
            distance,
            similarity,
            confidence: similarity.clamp(0.0, 1.0),
        })
    }
}

/// Verify a probe against a cached employee.
///
/// Unknown, inactive and not-yet-enrolled employees are a definitive
/// non-match rather than an error; only malformed input fails.
pub fn match_employee<M: Matcher>(
    matcher: &M,
    employee: Option<&EmployeeRecord>,
    probe: &Embedding,
    threshold: f32,
) -> Result<MatchResult, MatchError> {
    match employee {
        Some(emp) if emp.is_active && !emp.face_embeddings.is_empty() => {
            matcher.compare(probe, &emp.face_embeddings, threshold)
        }
        Some(emp) => {
            tracing::debug!(
                employee = %emp.employee_code,
                active = emp.is_active,
                references = emp.face_embeddings.len(),
                "no usable reference embeddings; reporting non-match"
            );
            Ok(MatchResult::no_match())
        }
        None => Ok(MatchResult::no_match()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emb(values: &[f32]) -> Embedding {
        Embedding::new(values.to_vec())
    }

    fn employee(active: bool, refs: Vec<Embedding>) -> EmployeeRecord {
        EmployeeRecord {
            id: "id-1".into(),
            employee_code: "E1".into(),
            name: "Ana".into(),
            face_embeddings: refs,
            is_active: active,
        }
    }

    #[test]
    fn test_identical_embedding_matches_with_full_confidence() {
        let r = EuclideanMatcher
            .compare(&emb(&[1.0, 0.0, 0.0]), &[emb(&[1.0, 0.0, 0.0])], 0.6)
            .unwrap();
        assert!(r.is_match);
        assert_eq!(r.distance, 0.0);
        assert!((r.similarity - 1.0).abs() < 1e-6);
        assert!((r.confidence - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_best_reference_wins() {
        // Closest reference is last; all must be visited.
        let probe = emb(&[1.0, 0.0, 0.0]);
        let refs = vec![
            emb(&[0.0, 1.0, 0.0]),
            emb(&[0.0, 0.0, 1.0]),
            emb(&[0.9, 0.1, 0.0]),
        ];
        let r = EuclideanMatcher.compare(&probe, &refs, 0.6).unwrap();
        assert!(r.is_match);
        let expected = (0.1f32.powi(2) * 2.0).sqrt();
        assert!((r.distance - expected).abs() < 1e-6);
    }

    #[test]
    fn test_distance_is_reference_order_independent() {
        let probe = emb(&[0.3, 0.4, 0.5]);
        let a = emb(&[0.0, 1.0, 0.0]);
        let b = emb(&[0.3, 0.5, 0.5]);
        let c = emb(&[1.0, 0.0, 0.0]);
        let orders = [
            vec![a.clone(), b.clone(), c.clone()],
            vec![c.clone(), a.clone(), b.clone()],
            vec![b.clone(), c.clone(), a.clone()],
        ];
        let distances: Vec<f32> = orders
            .iter()
            .map(|refs| EuclideanMatcher.compare(&probe, refs, 0.6).unwrap().distance)
            .collect();
        assert!(distances.iter().all(|d| *d == distances[0]));
        assert_eq!(distances[0], probe.euclidean_distance(&b));
    }

    #[test]
    fn test_threshold_is_inclusive_and_lower_is_stricter() {
        let probe = emb(&[0.0, 0.0]);
        let refs = vec![emb(&[0.5, 0.0])];
        assert!(EuclideanMatcher.compare(&probe, &refs, 0.5).unwrap().is_match);
        assert!(!EuclideanMatcher.compare(&probe, &refs, 0.4).unwrap().is_match);
    }

    #[test]
    fn test_similarity_decreases_with_distance() {
        let near = EuclideanMatcher::similarity(0.2);
        let far = EuclideanMatcher::similarity(0.8);
        assert!(near > far);
    }

    #[test]
    fn test_confidence_clamped_for_far_probe() {
        let r = EuclideanMatcher
            .compare(&emb(&[0.0, 0.0]), &[emb(&[3.0, 0.0])], 0.6)
            .unwrap();
        assert!(!r.is_match);
        assert!(r.similarity < 0.0);
        assert_eq!(r.confidence, 0.0);
    }

    #[test]
    fn test_empty_references_is_no_match() {
        let r = EuclideanMatcher.compare(&emb(&[1.0]), &[], 0.6).unwrap();
        assert_eq!(r, MatchResult::no_match());
    }

    #[test]
    fn test_dimension_mismatch_is_malformed() {
        let err = EuclideanMatcher
            .compare(&emb(&[1.0, 0.0]), &[emb(&[1.0, 0.0]), emb(&[1.0, 0.0, 0.0])], 0.6)
            .unwrap_err();
        assert_eq!(
            err,
            MatchError::MalformedEmbedding {
                expected: 3,
                actual: 2
            }
        );
    }

    #[test]
    fn test_empty_probe_is_rejected() {
        let err = EuclideanMatcher.compare(&emb(&[]), &[emb(&[1.0])], 0.6).unwrap_err();
        assert_eq!(err, MatchError::EmptyEmbedding);
    }

    #[test]
    fn test_match_employee_without_biometric() {
        let emp = employee(true, vec![]);
        let r = match_employee(&EuclideanMatcher, Some(&emp), &emb(&[1.0, 0.0]), 0.6).unwrap();
        assert!(!r.is_match);
        assert_eq!(r.distance, NO_MATCH_DISTANCE);
        assert_eq!(r.confidence, 0.0);
    }

    #[test]
    fn test_match_employee_inactive_never_matches() {
        let emp = employee(false, vec![emb(&[1.0, 0.0])]);
        let r = match_employee(&EuclideanMatcher, Some(&emp), &emb(&[1.0, 0.0]), 0.6).unwrap();
        assert!(!r.is_match);
    }

    #[test]
    fn test_match_employee_unknown() {
        let r = match_employee(&EuclideanMatcher, None, &emb(&[1.0, 0.0]), 0.6).unwrap();
        assert!(!r.is_match);
    }

    #[test]
    fn test_match_employee_active_enrolled() {
        let emp = employee(true, vec![emb(&[1.0, 0.0])]);
        let r = match_employee(&EuclideanMatcher, Some(&emp), &emb(&[0.95, 0.05]), 0.6).unwrap();
        assert!(r.is_match);
        assert!(r.confidence > 0.9);
    }
}
