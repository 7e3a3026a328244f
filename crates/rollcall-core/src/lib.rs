//! rollcall-core: attendance session algorithms.
//!
//! Blink-gated liveness, nearest-neighbour face matching and presence
//! scoring. Nothing in this crate touches a camera, a model or a database;
//! those arrive through the traits in [`capture`].

pub mod capture;
pub mod codec;
pub mod error;
pub mod liveness;
pub mod matcher;
pub mod presence;
pub mod types;

pub use capture::{CaptureDevice, EmbeddingExtractor, FaceLandmarker, FrameSource};
pub use error::AttendanceError;
pub use liveness::{BlinkDetector, EyeLandmarks, FaceLandmarks};
pub use matcher::{match_face, EuclideanMatcher, MatchResult, Matcher};
pub use presence::{backfill_absent, AttendanceStatus, PresenceEntry, PresencePolicy, Tally};
pub use types::{
    AttendanceRecord, ClassId, Embedding, Roster, StudentId, SubjectId, TeacherId, Timestamp,
};
