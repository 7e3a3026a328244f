//! Presence scoring and tri-state classification.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::AttendanceError;
use crate::types::{StudentId, Timestamp};

pub const DEFAULT_PRESENCE_THRESHOLD: f64 = 0.7;
pub const DEFAULT_LATE_THRESHOLD: f64 = 0.3;

/// Detection timestamps per student, as collected by a session.
pub type Tally = BTreeMap<StudentId, Vec<Timestamp>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AttendanceStatus {
    Present,
    Late,
    Absent,
}

impl AttendanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Present => "PRESENT",
            Self::Late => "LATE",
            Self::Absent => "ABSENT",
        }
    }
}

impl fmt::Display for AttendanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttendanceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PRESENT" => Ok(Self::Present),
            "LATE" => Ok(Self::Late),
            "ABSENT" => Ok(Self::Absent),
            other => Err(format!("unknown attendance status: {other}")),
        }
    }
}

/// Score and classification for one student.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PresenceEntry {
    pub student_id: StudentId,
    pub status: AttendanceStatus,
    pub score: f64,
}

/// Thresholds that turn a presence score into a status.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PresencePolicy {
    /// Score at or above which a student is present.
    pub presence_threshold: f64,
    /// Score strictly above which (and below `presence_threshold`) a student is late.
    pub late_threshold: f64,
}

impl Default for PresencePolicy {
    fn default() -> Self {
        Self {
            presence_threshold: DEFAULT_PRESENCE_THRESHOLD,
            late_threshold: DEFAULT_LATE_THRESHOLD,
        }
    }
}

impl PresencePolicy {
    pub fn new(presence_threshold: f64) -> Self {
        Self {
            presence_threshold,
            ..Self::default()
        }
    }

    pub fn classify(&self, score: f64) -> AttendanceStatus {
        if score >= self.presence_threshold {
            AttendanceStatus::Present
        } else if score > self.late_threshold {
            AttendanceStatus::Late
        } else {
            AttendanceStatus::Absent
        }
    }

    /// Detections per window second, clamped to 1.0.
    pub fn score(detections: usize, window_secs: u64) -> Result<f64, AttendanceError> {
        if window_secs == 0 {
            return Err(AttendanceError::InvalidConfiguration(
                "scan window must be greater than zero seconds".into(),
            ));
        }
        Ok((detections as f64 / window_secs as f64).min(1.0))
    }

    /// Score and classify every student with at least one detection.
    ///
    /// Students without detections are not emitted; see [`backfill_absent`].
    pub fn evaluate(
        &self,
        tally: &Tally,
        window_secs: u64,
    ) -> Result<Vec<PresenceEntry>, AttendanceError> {
        if window_secs == 0 {
            return Err(AttendanceError::InvalidConfiguration(
                "scan window must be greater than zero seconds".into(),
            ));
        }

        let mut entries = Vec::with_capacity(tally.len());
        for (&student_id, timestamps) in tally {
            if timestamps.is_empty() {
                continue;
            }
            let score = Self::score(timestamps.len(), window_secs)?;
            entries.push(PresenceEntry {
                student_id,
                status: self.classify(score),
                score,
            });
        }
        Ok(entries)
    }
}

/// Append an `ABSENT` entry with score 0.0 for every roster student that
/// the evaluator did not emit. Output stays ordered by student id.
pub fn backfill_absent(
    entries: Vec<PresenceEntry>,
    roster: impl IntoIterator<Item = StudentId>,
) -> Vec<PresenceEntry> {
    let mut by_id: BTreeMap<StudentId, PresenceEntry> =
        entries.into_iter().map(|e| (e.student_id, e)).collect();
    for student_id in roster {
        by_id.entry(student_id).or_insert(PresenceEntry {
            student_id,
            status: AttendanceStatus::Absent,
            score: 0.0,
        });
    }
    by_id.into_values().collect()
}
