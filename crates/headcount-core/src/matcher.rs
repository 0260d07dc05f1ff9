//! Nearest-neighbour matching of a query descriptor against the registry.

use crate::registry::{RegistryEntry, RegistrySnapshot};
use crate::types::{FaceDescriptor, StudentId};
use thiserror::Error;

/// Default acceptance threshold on confidence.
pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.6;
/// Default distance scale for [`DistancePolicy::Scaled`].
pub const DEFAULT_MAX_DISTANCE: f32 = 0.6;

#[derive(Error, Debug)]
pub enum MatchError {
    #[error("descriptor length mismatch against student {student_id}: expected {expected}, got {actual}")]
    DimensionMismatch {
        student_id: StudentId,
        expected: usize,
        actual: usize,
    },
    #[error("invalid distance scale {0}: must be finite and positive")]
    InvalidScale(f32),
}

/// How a Euclidean distance maps to a confidence score.
///
/// The two policies are not interchangeable: `Scaled` is used when
/// comparing a fresh enrollment against the roster, `Raw` on the live
/// recognition path where descriptor distances already sit near `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DistancePolicy {
    /// `confidence = 1 - distance / max_distance`
    Scaled { max_distance: f32 },
    /// `confidence = 1 - distance`
    Raw,
}

impl DistancePolicy {
    /// Policy for the enrollment-comparison path.
    pub fn enrollment() -> Self {
        DistancePolicy::Scaled {
            max_distance: DEFAULT_MAX_DISTANCE,
        }
    }

    /// Policy for the live-recognition path.
    pub fn live() -> Self {
        DistancePolicy::Raw
    }

    /// Map a distance to confidence. Not clamped: a distance beyond the
    /// scale yields a negative confidence.
    pub fn confidence(&self, distance: f32) -> f32 {
        match *self {
            DistancePolicy::Scaled { max_distance } => 1.0 - distance / max_distance,
            DistancePolicy::Raw => 1.0 - distance,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DistancePolicy::Scaled { .. } => "scaled",
            DistancePolicy::Raw => "raw",
        }
    }

    fn validate(&self) -> Result<(), MatchError> {
        match *self {
            DistancePolicy::Scaled { max_distance }
                if !(max_distance.is_finite() && max_distance > 0.0) =>
            {
                Err(MatchError::InvalidScale(max_distance))
            }
            _ => Ok(()),
        }
    }
}

/// Outcome of matching one query descriptor.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchResult {
    Matched {
        student_id: StudentId,
        display_name: String,
        confidence: f32,
        distance: f32,
    },
    /// Nothing cleared the threshold. `best_distance` is `None` when the
    /// registry was empty.
    Unmatched { best_distance: Option<f32> },
}

impl MatchResult {
    pub fn is_matched(&self) -> bool {
        matches!(self, MatchResult::Matched { .. })
    }

    pub fn student_id(&self) -> Option<StudentId> {
        match self {
            MatchResult::Matched { student_id, .. } => Some(*student_id),
            MatchResult::Unmatched { .. } => None,
        }
    }
}

/// Best candidate found over a contiguous run of registry entries.
///
/// Scans over disjoint shards can be merged in shard order and give the
/// same answer as one scan over the whole registry.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MatchScan {
    best: Option<(usize, f32)>,
}

impl MatchScan {
    /// Scan `entries`, which start at position `offset` in the snapshot.
    pub fn scan(
        query: &FaceDescriptor,
        entries: &[RegistryEntry],
        offset: usize,
    ) -> Result<Self, MatchError> {
        let mut best: Option<(usize, f32)> = None;

        for (i, entry) in entries.iter().enumerate() {
            // The only failure is a length mismatch.
            let distance = query.euclidean_distance(&entry.descriptor).map_err(|_| {
                MatchError::DimensionMismatch {
                    student_id: entry.student_id,
                    expected: query.len(),
                    actual: entry.descriptor.len(),
                }
            })?;

            // Strict comparison: the earliest entry wins a tie.
            let better = match best {
                None => true,
                Some((_, d)) => distance < d,
            };
            if better {
                best = Some((offset + i, distance));
            }
        }

        Ok(Self { best })
    }

    /// Combine with the scan of the shard that follows this one.
    pub fn merge(self, later: MatchScan) -> MatchScan {
        match (self.best, later.best) {
            (Some((_, a)), Some((_, b))) if b < a => later,
            (None, _) => later,
            _ => self,
        }
    }

    /// Snapshot position and distance of the best candidate.
    pub fn best(&self) -> Option<(usize, f32)> {
        self.best
    }
}

/// Strategy for comparing a query descriptor against the enrolled gallery.
pub trait Matcher {
    fn compare(
        &self,
        query: &FaceDescriptor,
        gallery: &RegistrySnapshot,
        threshold: f32,
    ) -> Result<MatchResult, MatchError>;
}

/// Linear-scan Euclidean matcher with an explicit confidence policy.
#[derive(Debug, Clone, Copy)]
pub struct EuclideanMatcher {
    policy: DistancePolicy,
}

impl EuclideanMatcher {
    pub fn new(policy: DistancePolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> DistancePolicy {
        self.policy
    }
}

impl Matcher for EuclideanMatcher {
    fn compare(
        &self,
        query: &FaceDescriptor,
        gallery: &RegistrySnapshot,
        threshold: f32,
    ) -> Result<MatchResult, MatchError> {
        self.policy.validate()?;

        let scan = MatchScan::scan(query, gallery.entries(), 0)?;
        let Some((idx, distance)) = scan.best() else {
            return Ok(MatchResult::Unmatched {
                best_distance: None,
            });
        };

        let confidence = self.policy.confidence(distance);
        let entry = &gallery.entries()[idx];

        tracing::debug!(
            policy = self.policy.name(),
            student = %entry.student_id,
            distance,
            confidence,
            threshold,
            "best candidate"
        );

        if confidence >= threshold {
            Ok(MatchResult::Matched {
                student_id: entry.student_id,
                display_name: entry.display_name.clone(),
                confidence,
                distance,
            })
        } else {
            Ok(MatchResult::Unmatched {
                best_distance: Some(distance),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::DescriptorRegistry;
    use crate::types::EnrolledStudent;

    fn desc(values: &[f32]) -> FaceDescriptor {
        FaceDescriptor::new(values.to_vec()).unwrap()
    }

    fn gallery(rows: Vec<(i64, Vec<f32>)>) -> RegistrySnapshot {
        let roster: Vec<_> = rows
            .into_iter()
            .map(|(id, v)| {
                EnrolledStudent::new(StudentId(id), format!("s{id}")).with_descriptor(&desc(&v))
            })
            .collect();
        RegistrySnapshot::build(&roster)
    }

    #[test]
    fn test_exact_match_has_full_confidence() {
        let g = gallery(vec![(1, vec![0.3, 0.1]), (2, vec![0.9, 0.9])]);
        for policy in [DistancePolicy::enrollment(), DistancePolicy::live()] {
            let result = EuclideanMatcher::new(policy)
                .compare(&desc(&[0.9, 0.9]), &g, DEFAULT_CONFIDENCE_THRESHOLD)
                .unwrap();
            match result {
                MatchResult::Matched { student_id, confidence, distance, .. } => {
                    assert_eq!(student_id, StudentId(2));
                    assert_eq!(distance, 0.0);
                    assert_eq!(confidence, 1.0);
                }
                other => panic!("expected match, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_empty_registry_never_matches() {
        let registry = DescriptorRegistry::new();
        registry.load(&[]);
        let result = EuclideanMatcher::new(DistancePolicy::live())
            .compare(&desc(&[0.0; 128]), &registry.snapshot(), -10.0)
            .unwrap();
        assert_eq!(result, MatchResult::Unmatched { best_distance: None });
    }

    #[test]
    fn test_far_query_unmatched_under_scaled_policy() {
        // A at origin, B far away; query is ~1.41 from A, beyond the 0.6 scale.
        let g = gallery(vec![(1, vec![0.0, 0.0]), (2, vec![10.0, 10.0])]);
        let result = EuclideanMatcher::new(DistancePolicy::Scaled { max_distance: 0.6 })
            .compare(&desc(&[1.0, 1.0]), &g, 0.6)
            .unwrap();
        match result {
            MatchResult::Unmatched { best_distance: Some(d) } => {
                assert!((d - 2.0f32.sqrt()).abs() < 1e-5);
                assert!(DistancePolicy::Scaled { max_distance: 0.6 }.confidence(d) < 0.0);
            }
            other => panic!("expected unmatched, got {other:?}"),
        }
    }

    #[test]
    fn test_policies_disagree_on_same_distance() {
        // distance 0.3: scaled → 0.5 (rejected at 0.6), raw → 0.7 (accepted).
        let g = gallery(vec![(1, vec![0.0, 0.0])]);
        let q = desc(&[0.3, 0.0]);

        let scaled = EuclideanMatcher::new(DistancePolicy::enrollment())
            .compare(&q, &g, 0.6)
            .unwrap();
        assert!(!scaled.is_matched());

        let raw = EuclideanMatcher::new(DistancePolicy::live())
            .compare(&q, &g, 0.6)
            .unwrap();
        assert_eq!(raw.student_id(), Some(StudentId(1)));
    }

    #[test]
    fn test_tie_goes_to_first_inserted() {
        let g = gallery(vec![(7, vec![1.0, 0.0]), (3, vec![-1.0, 0.0]), (5, vec![0.0, 1.0])]);
        let result = EuclideanMatcher::new(DistancePolicy::live())
            .compare(&desc(&[0.0, 0.0]), &g, -1.0)
            .unwrap();
        assert_eq!(result.student_id(), Some(StudentId(7)));

        let reordered = gallery(vec![(3, vec![-1.0, 0.0]), (7, vec![1.0, 0.0])]);
        let result = EuclideanMatcher::new(DistancePolicy::live())
            .compare(&desc(&[0.0, 0.0]), &reordered, -1.0)
            .unwrap();
        assert_eq!(result.student_id(), Some(StudentId(3)));
    }

    #[test]
    fn test_dimension_mismatch_propagates() {
        let roster = vec![
            EnrolledStudent::new(StudentId(1), "ok").with_descriptor(&desc(&[0.0; 128])),
            EnrolledStudent::new(StudentId(2), "corrupt").with_descriptor(&desc(&[0.0; 64])),
        ];
        let g = RegistrySnapshot::build(&roster);

        let err = EuclideanMatcher::new(DistancePolicy::live())
            .compare(&desc(&[0.0; 128]), &g, 0.6)
            .unwrap_err();
        assert!(matches!(
            err,
            MatchError::DimensionMismatch { student_id: StudentId(2), expected: 128, actual: 64 }
        ));
    }

    #[test]
    fn test_threshold_monotonicity() {
        let g = gallery(vec![(1, vec![0.0, 0.0]), (2, vec![0.5, 0.5]), (3, vec![0.2, 0.9])]);
        let queries: Vec<FaceDescriptor> = (0..40)
            .map(|i| {
                let t = i as f32 / 40.0;
                desc(&[t, (t * 3.1).sin().abs()])
            })
            .collect();
        let thresholds = [-0.5, 0.0, 0.2, 0.4, 0.6, 0.8, 0.95, 1.0];

        for policy in [DistancePolicy::enrollment(), DistancePolicy::live()] {
            let matcher = EuclideanMatcher::new(policy);
            for pair in thresholds.windows(2) {
                let (lo, hi) = (pair[0], pair[1]);
                for q in &queries {
                    let at_hi = matcher.compare(q, &g, hi).unwrap();
                    if at_hi.is_matched() {
                        let at_lo = matcher.compare(q, &g, lo).unwrap();
                        assert_eq!(at_lo.student_id(), at_hi.student_id());
                    }
                }
            }
        }
    }

    #[test]
    fn test_invalid_scale_rejected() {
        let g = gallery(vec![(1, vec![0.0])]);
        let err = EuclideanMatcher::new(DistancePolicy::Scaled { max_distance: 0.0 })
            .compare(&desc(&[0.0]), &g, 0.6)
            .unwrap_err();
        assert!(matches!(err, MatchError::InvalidScale(_)));
    }

    #[test]
    fn test_sharded_scan_matches_full_scan() {
        let g = gallery(vec![
            (1, vec![3.0, 0.0]),
            (2, vec![1.0, 0.0]),
            (3, vec![0.0, 2.0]),
            (4, vec![-1.0, 0.0]),
            (5, vec![0.0, 1.0]),
        ]);
        let q = desc(&[0.0, 0.0]);
        let full = MatchScan::scan(&q, g.entries(), 0).unwrap();

        for split in 0..=g.len() {
            let (left, right) = g.entries().split_at(split);
            let merged = MatchScan::scan(&q, left, 0)
                .unwrap()
                .merge(MatchScan::scan(&q, right, split).unwrap());
            assert_eq!(merged, full, "split at {split}");
        }
        // Ties at distance 1.0 resolve to the first entry (student 2).
        assert_eq!(full.best(), Some((1, 1.0)));
    }
}
