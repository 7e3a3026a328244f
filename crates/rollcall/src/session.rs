//! In-memory registry of active class sessions.
//!
//! The map lock is held only long enough to find, insert or remove a
//! session. Each session's tally sits behind its own lock, so detection
//! loops for different classes never wait on each other.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use rollcall_core::{AttendanceError, ClassId, StudentId, SubjectId, Tally, TeacherId, Timestamp};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Active,
    Closed,
}

/// Session metadata, without the tally.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionInfo {
    pub session_id: Uuid,
    pub class_id: ClassId,
    pub teacher_id: TeacherId,
    pub subject_id: SubjectId,
    pub created_at: Timestamp,
}

/// Everything a session collected, handed out exactly once by [`SessionStore::end`].
#[derive(Debug, Clone)]
pub struct ClosedSession {
    pub info: SessionInfo,
    pub closed_at: Timestamp,
    pub tally: Tally,
}

struct SessionState {
    status: SessionStatus,
    tally: Tally,
}

struct SessionSlot {
    info: SessionInfo,
    cancelled: AtomicBool,
    state: Mutex<SessionState>,
}

impl SessionSlot {
    fn check_owner(&self, teacher_id: TeacherId) -> Result<(), AttendanceError> {
        if self.info.teacher_id == teacher_id {
            Ok(())
        } else {
            tracing::warn!(
                class_id = self.info.class_id,
                owner = self.info.teacher_id,
                teacher_id,
                "rejected access to session owned by another teacher"
            );
            Err(AttendanceError::Unauthorized {
                teacher_id,
                class_id: self.info.class_id,
            })
        }
    }

    fn record(&self, student_id: StudentId, at: Timestamp) -> Result<usize, AttendanceError> {
        let mut state = lock(&self.state);
        if state.status == SessionStatus::Closed {
            return Err(AttendanceError::NoSuchSession(self.info.class_id));
        }
        let stamps = state.tally.entry(student_id).or_default();
        stamps.push(at);
        Ok(stamps.len())
    }
}

/// Shared registry of active sessions keyed by class id.
///
/// Clones share the same registry. Created once at startup and handed to
/// whoever needs it; nothing here is process-global.
#[derive(Clone, Default)]
pub struct SessionStore {
    sessions: Arc<Mutex<HashMap<ClassId, Arc<SessionSlot>>>>,
}

/// A detection loop's view of one session.
///
/// Bound to the session instance it was issued for: once that session is
/// closed, writes fail even if a new session is later started for the
/// same class.
#[derive(Clone)]
pub struct SessionHandle {
    slot: Arc<SessionSlot>,
}

impl SessionHandle {
    pub fn info(&self) -> &SessionInfo {
        &self.slot.info
    }

    /// Append a detection. Fails with `NoSuchSession` once the session is closed.
    pub fn record(&self, student_id: StudentId, at: Timestamp) -> Result<usize, AttendanceError> {
        self.slot.record(student_id, at)
    }

    /// True once the session has been ended or the store shut down.
    pub fn is_cancelled(&self) -> bool {
        self.slot.cancelled.load(Ordering::Acquire)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a session for `class_id`.
    ///
    /// The (teacher, subject, class) triple must already have been
    /// authorized by the caller.
    pub fn start(
        &self,
        class_id: ClassId,
        teacher_id: TeacherId,
        subject_id: SubjectId,
    ) -> Result<SessionInfo, AttendanceError> {
        let mut sessions = lock(&self.sessions);
        if sessions.contains_key(&class_id) {
            tracing::warn!(class_id, teacher_id, "session already active");
            return Err(AttendanceError::AlreadyActive(class_id));
        }

        let info = SessionInfo {
            session_id: Uuid::new_v4(),
            class_id,
            teacher_id,
            subject_id,
            created_at: Utc::now(),
        };
        sessions.insert(
            class_id,
            Arc::new(SessionSlot {
                info: info.clone(),
                cancelled: AtomicBool::new(false),
                state: Mutex::new(SessionState {
                    status: SessionStatus::Active,
                    tally: Tally::new(),
                }),
            }),
        );

        tracing::info!(
            class_id,
            teacher_id,
            subject_id,
            session_id = %info.session_id,
            "session started"
        );
        Ok(info)
    }

    /// Resolve the active session for `class_id`, checking that `teacher_id` owns it.
    pub fn handle(
        &self,
        class_id: ClassId,
        teacher_id: TeacherId,
    ) -> Result<SessionHandle, AttendanceError> {
        let slot = lock(&self.sessions)
            .get(&class_id)
            .cloned()
            .ok_or(AttendanceError::NoSuchSession(class_id))?;
        slot.check_owner(teacher_id)?;
        Ok(SessionHandle { slot })
    }

    /// Append `at` to the student's detection sequence in the active session.
    /// Detection loops record through [`SessionHandle::record`] instead.
    #[cfg(test)]
    pub fn record_detection(
        &self,
        class_id: ClassId,
        teacher_id: TeacherId,
        student_id: StudentId,
        at: Timestamp,
    ) -> Result<(), AttendanceError> {
        self.handle(class_id, teacher_id)?.record(student_id, at)?;
        Ok(())
    }

    /// Close and remove the session, returning its tally.
    ///
    /// Single-shot: removal happens under the registry lock, so of two
    /// concurrent calls exactly one succeeds and the other sees
    /// `NoSuchSession`. Any running detection loop is cancelled.
    pub fn end(
        &self,
        class_id: ClassId,
        teacher_id: TeacherId,
    ) -> Result<ClosedSession, AttendanceError> {
        let slot = {
            let mut sessions = lock(&self.sessions);
            let slot = sessions
                .get(&class_id)
                .ok_or(AttendanceError::NoSuchSession(class_id))?;
            slot.check_owner(teacher_id)?;
            sessions
                .remove(&class_id)
                .ok_or(AttendanceError::NoSuchSession(class_id))?
        };

        slot.cancelled.store(true, Ordering::Release);
        let tally = {
            let mut state = lock(&slot.state);
            state.status = SessionStatus::Closed;
            std::mem::take(&mut state.tally)
        };

        let closed = ClosedSession {
            info: slot.info.clone(),
            closed_at: Utc::now(),
            tally,
        };
        tracing::info!(
            class_id,
            teacher_id,
            session_id = %closed.info.session_id,
            students_seen = closed.tally.len(),
            "session ended"
        );
        Ok(closed)
    }

    #[cfg(test)]
    pub fn info(&self, class_id: ClassId) -> Option<SessionInfo> {
        lock(&self.sessions).get(&class_id).map(|s| s.info.clone())
    }

    #[cfg(test)]
    pub fn active_count(&self) -> usize {
        lock(&self.sessions).len()
    }

    /// Cancel and drop every active session. Tallies are discarded.
    pub fn shutdown(&self) -> usize {
        let drained: Vec<Arc<SessionSlot>> =
            lock(&self.sessions).drain().map(|(_, slot)| slot).collect();
        for slot in &drained {
            slot.cancelled.store(true, Ordering::Release);
            lock(&slot.state).status = SessionStatus::Closed;
        }
        if !drained.is_empty() {
            tracing::info!(count = drained.len(), "discarded active sessions at shutdown");
        }
        drained.len()
    }
}
