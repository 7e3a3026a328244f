use thiserror::Error;

use crate::types::{ClassId, TeacherId};

/// Failures surfaced by the attendance engine to its callers.
///
/// Per-frame misses (no face, no embedding, no match) never show up here;
/// the detection loop swallows them.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AttendanceError {
    #[error("a session is already active for class {0}")]
    AlreadyActive(ClassId),
    #[error("no active session for class {0}")]
    NoSuchSession(ClassId),
    #[error("teacher {teacher_id} is not permitted to operate class {class_id}")]
    Unauthorized {
        teacher_id: TeacherId,
        class_id: ClassId,
    },
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("capture resource unavailable: {0}")]
    ResourceUnavailable(String),
}
