//! Nearest-neighbour face matching by Euclidean distance.

use crate::types::{Embedding, Roster, StudentId};

/// Default maximum distance for a positive match.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.45;

/// Result of matching a probe embedding against a roster.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    /// Closest candidate, set only when its distance is under the threshold.
    pub student_id: Option<StudentId>,
    /// Distance to the closest candidate, `None` when nothing was compared.
    pub distance: Option<f32>,
}

impl MatchResult {
    pub fn none() -> Self {
        Self {
            student_id: None,
            distance: None,
        }
    }

    pub fn matched(&self) -> bool {
        self.student_id.is_some()
    }
}

/// Strategy for comparing a probe embedding against the enrolled roster.
pub trait Matcher {
    fn compare(&self, probe: &Embedding, roster: &Roster, threshold: f32) -> MatchResult;
}

/// Euclidean nearest-neighbour matcher.
///
/// Every candidate is visited. Candidates are walked in ascending id order
/// and only a strictly smaller distance replaces the current best, so a tie
/// resolves to the lowest id. Candidates whose dimensionality differs from
/// the probe, or whose distance is not a number, are ignored.
#[derive(Debug, Clone, Copy, Default)]
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn compare(&self, probe: &Embedding, roster: &Roster, threshold: f32) -> MatchResult {
        let mut best: Option<(StudentId, f32)> = None;

        for (&id, candidate) in roster {
            if candidate.dim() != probe.dim() {
                tracing::debug!(
                    student_id = id,
                    expected = probe.dim(),
                    got = candidate.dim(),
                    "skipping candidate with mismatched dimension"
                );
                continue;
            }
            let dist = probe.euclidean_distance(candidate);
            if dist.is_nan() {
                continue;
            }
            if best.map_or(true, |(_, d)| dist < d) {
                best = Some((id, dist));
            }
        }

        match best {
            Some((id, dist)) if dist < threshold => MatchResult {
                student_id: Some(id),
                distance: Some(dist),
            },
            Some((_, dist)) => MatchResult {
                student_id: None,
                distance: Some(dist),
            },
            None => MatchResult::none(),
        }
    }
}

/// Match an optional live embedding against the roster.
///
/// An absent embedding short-circuits to no match without any comparison.
pub fn match_face(
    live: Option<&Embedding>,
    roster: &Roster,
    threshold: f32,
) -> Option<StudentId> {
    let probe = live?;
    EuclideanMatcher.compare(probe, roster, threshold).student_id
}
