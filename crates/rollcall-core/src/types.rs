use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::presence::AttendanceStatus;

pub type ClassId = i64;
pub type StudentId = i64;
pub type TeacherId = i64;
pub type SubjectId = i64;

/// Wall-clock instant at which a student was positively detected.
pub type Timestamp = DateTime<Utc>;

/// Enrolled identities eligible for matching within one class, keyed by id.
///
/// A `BTreeMap` keeps iteration in ascending id order, which the matcher
/// relies on to break distance ties towards the lowest id.
pub type Roster = BTreeMap<StudentId, Embedding>;

/// Face embedding vector. All vectors compared against each other must
/// share one dimensionality.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Compute Euclidean distance between two embeddings.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }

    /// True when every component is a finite number.
    pub fn is_finite(&self) -> bool {
        self.values.iter().all(|v| v.is_finite())
    }
}

impl From<Vec<f32>> for Embedding {
    fn from(values: Vec<f32>) -> Self {
        Self { values }
    }
}

/// One student's attendance outcome for one subject on one date.
///
/// Persisted with upsert semantics keyed by (student, subject, date), so
/// re-evaluating a date replaces the earlier record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub student_id: StudentId,
    pub subject_id: SubjectId,
    pub teacher_id: TeacherId,
    pub date: NaiveDate,
    pub status: AttendanceStatus,
    /// Fraction of the scan window in which the student was seen, in [0, 1].
    pub presence_score: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_euclidean_distance_345() {
        let a = Embedding::new(vec![0.0, 0.0]);
        let b = Embedding::new(vec![3.0, 4.0]);
        assert!((a.euclidean_distance(&b) - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_euclidean_distance_identical() {
        let a = Embedding::new(vec![0.1, -0.2, 0.3]);
        assert_eq!(a.euclidean_distance(&a.clone()), 0.0);
    }

    #[test]
    fn test_is_finite_rejects_nan() {
        assert!(Embedding::new(vec![1.0, 2.0]).is_finite());
        assert!(!Embedding::new(vec![1.0, f32::NAN]).is_finite());
        assert!(!Embedding::new(vec![f32::INFINITY]).is_finite());
    }

    #[test]
    fn test_embedding_serializes_as_plain_array() {
        let json = serde_json::to_string(&Embedding::new(vec![0.5, 1.0])).unwrap();
        assert_eq!(json, "[0.5,1.0]");
        let back: Embedding = serde_json::from_str("[0.25, -1.0]").unwrap();
        assert_eq!(back.values, vec![0.25, -1.0]);
    }
}
