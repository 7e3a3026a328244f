//! Attendance service: the composition root tying ownership checks, the
//! session registry, detection runs, presence scoring and persistence.

use std::future::Future;
use std::sync::Arc;

use chrono::NaiveDate;
use rollcall_core::{
    backfill_absent, AttendanceError, AttendanceRecord, CaptureDevice, ClassId,
    EmbeddingExtractor, FaceLandmarker, FrameSource, PresenceEntry, Roster, StudentId, SubjectId,
    TeacherId,
};
use thiserror::Error;

use crate::config::Config;
use crate::engine::{self, DetectionParams, DetectionSummary};
use crate::session::{SessionInfo, SessionStore};
use crate::store::{AttendanceStore, StoreError};

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error(transparent)]
    Attendance(#[from] AttendanceError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("worker thread exited without replying")]
    Worker,
    /// The session is closed and scored but its records were not saved.
    /// They are handed back so the write can be retried.
    #[error("failed to persist {} attendance records: {source}", .records.len())]
    Persist {
        records: Vec<AttendanceRecord>,
        #[source]
        source: StoreError,
    },
}

/// Supplies enrolled embeddings ahead of a scan.
pub trait RosterProvider {
    /// Embeddings of the students enrolled in one class.
    fn roster(&self, class_id: ClassId) -> impl Future<Output = Result<Roster, StoreError>> + Send;

    /// Every student of the class, including those with no embedding on file.
    fn class_members(
        &self,
        class_id: ClassId,
    ) -> impl Future<Output = Result<Vec<StudentId>, StoreError>> + Send;

    /// Embeddings of teachers who enrolled a face.
    fn teacher_gallery(&self) -> impl Future<Output = Result<Roster, StoreError>> + Send;
}

/// Decides whether a teacher may run a class for a subject.
pub trait OwnershipValidator {
    fn is_authorized(
        &self,
        teacher_id: TeacherId,
        class_id: ClassId,
        subject_id: SubjectId,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;
}

/// Durable sink for evaluated attendance.
pub trait AttendanceSink {
    /// Upsert by (student, subject, date).
    fn persist(
        &self,
        records: &[AttendanceRecord],
    ) -> impl Future<Output = Result<usize, StoreError>> + Send;
}

impl RosterProvider for AttendanceStore {
    async fn roster(&self, class_id: ClassId) -> Result<Roster, StoreError> {
        self.roster_for_class(class_id).await
    }

    async fn class_members(&self, class_id: ClassId) -> Result<Vec<StudentId>, StoreError> {
        self.class_student_ids(class_id).await
    }

    async fn teacher_gallery(&self) -> Result<Roster, StoreError> {
        AttendanceStore::teacher_gallery(self).await
    }
}

impl OwnershipValidator for AttendanceStore {
    async fn is_authorized(
        &self,
        teacher_id: TeacherId,
        class_id: ClassId,
        subject_id: SubjectId,
    ) -> Result<bool, StoreError> {
        AttendanceStore::is_authorized(self, teacher_id, class_id, subject_id).await
    }
}

impl AttendanceSink for AttendanceStore {
    async fn persist(&self, records: &[AttendanceRecord]) -> Result<usize, StoreError> {
        self.upsert_records(records).await
    }
}

pub struct AttendanceService<B> {
    config: Config,
    sessions: SessionStore,
    backend: Arc<B>,
}

impl<B> AttendanceService<B>
where
    B: RosterProvider + OwnershipValidator + AttendanceSink + Send + Sync,
{
    /// Build a service over a validated config.
    pub fn new(config: Config, backend: Arc<B>) -> Result<Self, AttendanceError> {
        config.validate()?;
        Ok(Self {
            config,
            sessions: SessionStore::new(),
            backend,
        })
    }

    #[cfg(test)]
    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    /// Open a session after the ownership check passes.
    pub async fn start_session(
        &self,
        teacher_id: TeacherId,
        class_id: ClassId,
        subject_id: SubjectId,
    ) -> Result<SessionInfo, ServiceError> {
        if !self
            .backend
            .is_authorized(teacher_id, class_id, subject_id)
            .await?
        {
            tracing::warn!(teacher_id, class_id, subject_id, "start refused: not authorized");
            return Err(AttendanceError::Unauthorized {
                teacher_id,
                class_id,
            }
            .into());
        }
        Ok(self.sessions.start(class_id, teacher_id, subject_id)?)
    }

    /// Run one detection window for the class's active session.
    ///
    /// The roster is fetched before the worker starts and no session lock
    /// is held across the fetch. If the device fails to open, the session
    /// is left exactly as it was.
    pub async fn run_detection<D, L, E>(
        &self,
        teacher_id: TeacherId,
        class_id: ClassId,
        device: D,
        landmarker: L,
        extractor: E,
    ) -> Result<DetectionSummary, ServiceError>
    where
        D: CaptureDevice + Send + 'static,
        L: FaceLandmarker<<D::Source as FrameSource>::Frame> + Send + 'static,
        E: EmbeddingExtractor<<D::Source as FrameSource>::Frame> + Send + 'static,
    {
        let handle = self.sessions.handle(class_id, teacher_id)?;
        let roster = self.backend.roster(class_id).await?;
        if roster.is_empty() {
            tracing::warn!(class_id, "roster has no enrolled embeddings");
        }

        let params = DetectionParams::for_scan(&self.config);
        let reply = engine::spawn_detection(handle, roster, device, landmarker, extractor, params)?;
        let summary = reply.await.map_err(|_| ServiceError::Worker)??;
        Ok(summary)
    }

    /// Close the session, score it and persist one record per student.
    ///
    /// With backfill enabled, class members never detected are recorded
    /// as absent with score 0.0. The session is gone once this returns,
    /// whatever the outcome; a storage failure after scoring comes back as
    /// [`ServiceError::Persist`] carrying the records, for
    /// [`AttendanceService::save_records`] to retry.
    pub async fn end_session(
        &self,
        teacher_id: TeacherId,
        class_id: ClassId,
        date: NaiveDate,
    ) -> Result<Vec<AttendanceRecord>, ServiceError> {
        let closed = self.sessions.end(class_id, teacher_id)?;

        let entries = self
            .config
            .presence_policy()
            .evaluate(&closed.tally, self.config.scan_window_secs)?;
        let to_record = |entries: Vec<PresenceEntry>| -> Vec<AttendanceRecord> {
            entries
                .into_iter()
                .map(|entry| AttendanceRecord {
                    student_id: entry.student_id,
                    subject_id: closed.info.subject_id,
                    teacher_id: closed.info.teacher_id,
                    date,
                    status: entry.status,
                    presence_score: entry.score,
                })
                .collect()
        };

        let entries = if self.config.backfill_absent {
            match self.backend.class_members(class_id).await {
                Ok(members) => backfill_absent(entries, members),
                Err(source) => {
                    tracing::error!(class_id, error = %source, "could not load class members");
                    return Err(ServiceError::Persist {
                        records: to_record(entries),
                        source,
                    });
                }
            }
        } else {
            entries
        };
        let records = to_record(entries);

        match self.backend.persist(&records).await {
            Ok(written) => {
                tracing::info!(
                    class_id,
                    teacher_id,
                    session_id = %closed.info.session_id,
                    duration_secs = (closed.closed_at - closed.info.created_at).num_seconds(),
                    written,
                    "attendance persisted"
                );
                Ok(records)
            }
            Err(source) => {
                tracing::error!(
                    class_id,
                    session_id = %closed.info.session_id,
                    records = records.len(),
                    error = %source,
                    "attendance not persisted"
                );
                Err(ServiceError::Persist { records, source })
            }
        }
    }

    /// Write already evaluated records, e.g. after a failed `end_session`.
    pub async fn save_records(&self, records: &[AttendanceRecord]) -> Result<usize, ServiceError> {
        Ok(self.backend.persist(records).await?)
    }

    /// Short liveness-gated scan against the teacher gallery.
    ///
    /// Returns the first teacher matched, or `None` when the window ends.
    pub async fn identify_teacher<D, L, E>(
        &self,
        device: D,
        landmarker: L,
        extractor: E,
    ) -> Result<Option<(TeacherId, f32)>, ServiceError>
    where
        D: CaptureDevice + Send + 'static,
        L: FaceLandmarker<<D::Source as FrameSource>::Frame> + Send + 'static,
        E: EmbeddingExtractor<<D::Source as FrameSource>::Frame> + Send + 'static,
    {
        let gallery = self.backend.teacher_gallery().await?;
        if gallery.is_empty() {
            tracing::warn!("no teacher has an enrolled face");
            return Ok(None);
        }

        let params = DetectionParams::for_identify(&self.config);
        let reply = engine::spawn_identify(gallery, device, landmarker, extractor, params)?;
        let found = reply.await.map_err(|_| ServiceError::Worker)??;
        match found {
            Some((teacher_id, distance)) => {
                tracing::info!(teacher_id, distance, "teacher identified")
            }
            None => tracing::info!("no teacher identified"),
        }
        Ok(found)
    }

    /// Discard every active session. Running detection loops see the
    /// cancellation and exit.
    pub fn shutdown(&self) -> usize {
        self.sessions.shutdown()
    }
}
