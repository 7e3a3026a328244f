//! Detection loop: liveness gate → embedding → roster match → tally.
//!
//! Each run owns its capture stream and its own [`BlinkDetector`] and runs
//! on a dedicated OS thread, since frame capture and model inference block.

use std::time::{Duration, Instant};

use chrono::Utc;
use rollcall_core::{
    AttendanceError, BlinkDetector, CaptureDevice, EmbeddingExtractor, EuclideanMatcher,
    FaceLandmarker, FrameSource, Matcher, Roster, StudentId,
};
use tokio::sync::oneshot;

use crate::config::Config;
use crate::session::SessionHandle;

/// Tunables for one detection or identification run.
#[derive(Debug, Clone, Copy)]
pub struct DetectionParams {
    pub window: Duration,
    pub match_threshold: f32,
    pub ear_threshold: f32,
    pub blink_frames: u32,
    /// Pause after the source had no frame ready.
    pub idle_backoff: Duration,
}

impl DetectionParams {
    pub fn for_scan(config: &Config) -> Self {
        Self {
            window: config.scan_window(),
            match_threshold: config.match_threshold,
            ear_threshold: config.ear_threshold,
            blink_frames: config.blink_frames,
            idle_backoff: config.idle_backoff(),
        }
    }

    pub fn for_identify(config: &Config) -> Self {
        Self {
            window: config.identify_window(),
            ..Self::for_scan(config)
        }
    }

    fn blink_detector(&self) -> BlinkDetector {
        BlinkDetector::new(self.ear_threshold, self.blink_frames)
    }
}

/// How a detection run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionOutcome {
    /// The scan window ran out.
    WindowElapsed,
    /// The session was ended or discarded while the loop was running.
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct DetectionSummary {
    pub outcome: DetectionOutcome,
    /// Frames delivered by the source.
    pub frames: u64,
    /// Ticks where the source had nothing ready.
    pub missed_frames: u64,
    /// Completed blinks recognised by the liveness gate.
    pub blinks: u64,
    /// Blinks whose embedding matched a roster student and were recorded.
    pub matches: u64,
    #[serde(skip)]
    pub elapsed: Duration,
}

impl DetectionSummary {
    fn new() -> Self {
        Self {
            outcome: DetectionOutcome::WindowElapsed,
            frames: 0,
            missed_frames: 0,
            blinks: 0,
            matches: 0,
            elapsed: Duration::ZERO,
        }
    }
}

/// Run the detection loop until the window elapses or the session closes.
///
/// Never exits early on a match: sustained presence is what gets scored.
/// Per-frame misses (no frame, no single face, no embedding, no match)
/// produce no detection and are not errors.
pub fn run_detection<S, L, E>(
    session: &SessionHandle,
    roster: &Roster,
    source: &mut S,
    landmarker: &mut L,
    extractor: &mut E,
    params: &DetectionParams,
) -> DetectionSummary
where
    S: FrameSource,
    L: FaceLandmarker<S::Frame>,
    E: EmbeddingExtractor<S::Frame>,
{
    let class_id = session.info().class_id;
    let mut blink = params.blink_detector();
    let matcher = EuclideanMatcher;
    let mut summary = DetectionSummary::new();
    let started = Instant::now();

    while started.elapsed() < params.window {
        if session.is_cancelled() {
            summary.outcome = DetectionOutcome::Cancelled;
            break;
        }

        let Some(frame) = source.next_frame() else {
            // Not ready yet. Blink progress carries over to the next frame.
            summary.missed_frames += 1;
            if !params.idle_backoff.is_zero() {
                std::thread::sleep(params.idle_backoff);
            }
            continue;
        };
        summary.frames += 1;

        let faces = landmarker.landmarks(&frame);
        if !blink.observe(Some(faces.as_slice())) {
            continue;
        }
        summary.blinks += 1;

        let Some(embedding) = extractor.extract(&frame) else {
            tracing::debug!(class_id, "blink without usable embedding");
            continue;
        };

        let result = matcher.compare(&embedding, roster, params.match_threshold);
        let Some(student_id) = result.student_id else {
            tracing::debug!(class_id, distance = ?result.distance, "no roster match");
            continue;
        };

        match session.record(student_id, Utc::now()) {
            Ok(count) => {
                summary.matches += 1;
                tracing::debug!(
                    class_id,
                    student_id,
                    distance = ?result.distance,
                    count,
                    "detection recorded"
                );
            }
            Err(e) => {
                tracing::info!(class_id, error = %e, "session closed during detection");
                summary.outcome = DetectionOutcome::Cancelled;
                break;
            }
        }
    }

    summary.elapsed = started.elapsed();
    summary
}

/// Scan until the first live face matches the gallery, or the window ends.
///
/// Unlike [`run_detection`] this returns on the first match.
pub fn identify<S, L, E>(
    gallery: &Roster,
    source: &mut S,
    landmarker: &mut L,
    extractor: &mut E,
    params: &DetectionParams,
) -> Option<(StudentId, f32)>
where
    S: FrameSource,
    L: FaceLandmarker<S::Frame>,
    E: EmbeddingExtractor<S::Frame>,
{
    let mut blink = params.blink_detector();
    let started = Instant::now();

    while started.elapsed() < params.window {
        let Some(frame) = source.next_frame() else {
            if !params.idle_backoff.is_zero() {
                std::thread::sleep(params.idle_backoff);
            }
            continue;
        };

        let faces = landmarker.landmarks(&frame);
        if !blink.observe(Some(faces.as_slice())) {
            continue;
        }
        let Some(embedding) = extractor.extract(&frame) else {
            continue;
        };
        let result = EuclideanMatcher.compare(&embedding, gallery, params.match_threshold);
        if let (Some(id), Some(distance)) = (result.student_id, result.distance) {
            return Some((id, distance));
        }
    }
    None
}

/// Reply channel for a detection run on its worker thread.
pub type DetectionReply = oneshot::Receiver<Result<DetectionSummary, AttendanceError>>;

/// Spawn a detection run on a dedicated OS thread.
///
/// The device is opened on the worker. If opening fails the reply carries
/// `ResourceUnavailable` and the session is left untouched. The capture
/// stream is dropped, releasing the device, before the reply is sent.
pub fn spawn_detection<D, L, E>(
    session: SessionHandle,
    roster: Roster,
    device: D,
    mut landmarker: L,
    mut extractor: E,
    params: DetectionParams,
) -> Result<DetectionReply, AttendanceError>
where
    D: CaptureDevice + Send + 'static,
    L: FaceLandmarker<<D::Source as FrameSource>::Frame> + Send + 'static,
    E: EmbeddingExtractor<<D::Source as FrameSource>::Frame> + Send + 'static,
{
    let (reply_tx, reply_rx) = oneshot::channel();
    let class_id = session.info().class_id;

    std::thread::Builder::new()
        .name(format!("rollcall-detect-{class_id}"))
        .spawn(move || {
            let result = device.open().map(|mut source| {
                tracing::info!(
                    class_id,
                    roster = roster.len(),
                    window_secs = params.window.as_secs_f32(),
                    "detection started"
                );
                let summary = run_detection(
                    &session,
                    &roster,
                    &mut source,
                    &mut landmarker,
                    &mut extractor,
                    &params,
                );
                drop(source);
                tracing::info!(
                    class_id,
                    outcome = ?summary.outcome,
                    frames = summary.frames,
                    blinks = summary.blinks,
                    matches = summary.matches,
                    "detection finished, capture released"
                );
                summary
            });
            if let Err(e) = &result {
                tracing::error!(class_id, error = %e, "detection aborted");
            }
            let _ = reply_tx.send(result);
        })
        .map_err(|e| {
            AttendanceError::ResourceUnavailable(format!("failed to spawn detection thread: {e}"))
        })?;

    Ok(reply_rx)
}

/// Reply channel for an identification scan.
pub type IdentifyReply = oneshot::Receiver<Result<Option<(StudentId, f32)>, AttendanceError>>;

/// Spawn an identification scan on a dedicated OS thread.
pub fn spawn_identify<D, L, E>(
    gallery: Roster,
    device: D,
    mut landmarker: L,
    mut extractor: E,
    params: DetectionParams,
) -> Result<IdentifyReply, AttendanceError>
where
    D: CaptureDevice + Send + 'static,
    L: FaceLandmarker<<D::Source as FrameSource>::Frame> + Send + 'static,
    E: EmbeddingExtractor<<D::Source as FrameSource>::Frame> + Send + 'static,
{
    let (reply_tx, reply_rx) = oneshot::channel();

    std::thread::Builder::new()
        .name("rollcall-identify".into())
        .spawn(move || {
            let result = device.open().map(|mut source| {
                identify(&gallery, &mut source, &mut landmarker, &mut extractor, &params)
            });
            let _ = reply_tx.send(result);
        })
        .map_err(|e| {
            AttendanceError::ResourceUnavailable(format!("failed to spawn identify thread: {e}"))
        })?;

    Ok(reply_rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::{FrameScript, ScriptedCamera, ScriptedExtractor, ScriptedLandmarker};
    use crate::session::SessionStore;
    use rollcall_core::Embedding;

    fn params(window_ms: u64) -> DetectionParams {
        DetectionParams {
            window: Duration::from_millis(window_ms),
            match_threshold: 0.45,
            ear_threshold: 0.20,
            blink_frames: 2,
            idle_backoff: Duration::from_millis(1),
        }
    }

    fn emb(x: f32) -> Embedding {
        Embedding::new(vec![x, 0.0, 0.0])
    }

    fn roster() -> Roster {
        [(1, emb(0.0)), (2, emb(1.0)), (3, emb(2.0))].into_iter().collect()
    }

    fn run(script: FrameScript, window_ms: u64) -> (SessionStore, DetectionSummary) {
        let store = SessionStore::new();
        store.start(5, 50, 500).unwrap();
        let handle = store.handle(5, 50).unwrap();
        let camera = ScriptedCamera::new(script);
        let mut source = camera.open().unwrap();
        let summary = run_detection(
            &handle,
            &roster(),
            &mut source,
            &mut ScriptedLandmarker,
            &mut ScriptedExtractor,
            &params(window_ms),
        );
        (store, summary)
    }

    #[test]
    fn test_records_every_matched_blink() {
        let mut script = FrameScript::default();
        script.push_blink(Some(emb(0.05)));
        script.push_blink(Some(emb(1.1)));
        script.push_blink(Some(emb(0.02)));

        let (store, summary) = run(script, 150);
        assert_eq!(summary.outcome, DetectionOutcome::WindowElapsed);
        assert_eq!(summary.blinks, 3);
        assert_eq!(summary.matches, 3);

        let closed = store.end(5, 50).unwrap();
        assert_eq!(closed.tally[&1].len(), 2);
        assert_eq!(closed.tally[&2].len(), 1);
        assert!(!closed.tally.contains_key(&3));
    }

    #[test]
    fn test_keeps_scanning_until_window_elapses() {
        let mut script = FrameScript::default();
        script.push_blink(Some(emb(0.0)));

        let (_, summary) = run(script, 120);
        assert_eq!(summary.matches, 1);
        assert!(summary.elapsed >= Duration::from_millis(120));
        assert!(summary.missed_frames > 0);
    }

    #[test]
    fn test_misses_are_not_detections() {
        let mut script = FrameScript::default();
        // Blink with no embedding, blink with a stranger, no blink at all.
        script.push_blink(None);
        script.push_blink(Some(emb(9.0)));
        script.push_open(Some(emb(0.0)));
        script.push_dropped();

        let (store, summary) = run(script, 100);
        assert_eq!(summary.blinks, 2);
        assert_eq!(summary.matches, 0);
        assert!(store.end(5, 50).unwrap().tally.is_empty());
    }

    #[test]
    fn test_unready_ticks_between_frames_keep_blink_progress() {
        let mut script = FrameScript::default();
        script.push_closed();
        script.push_dropped();
        script.push_closed();
        script.push_dropped();
        script.push_open(Some(emb(0.0)));

        let (store, summary) = run(script, 60);
        assert_eq!(summary.blinks, 1);
        assert_eq!(summary.matches, 1);
        assert!(summary.missed_frames >= 2);
        assert_eq!(store.end(5, 50).unwrap().tally[&1].len(), 1);
    }

    #[test]
    fn test_identify_survives_unready_ticks() {
        let mut script = FrameScript::default();
        script.push_closed();
        script.push_dropped();
        script.push_closed();
        script.push_dropped();
        script.push_open(Some(emb(1.0)));
        let camera = ScriptedCamera::new(script);
        let mut source = camera.open().unwrap();

        let found = identify(
            &roster(),
            &mut source,
            &mut ScriptedLandmarker,
            &mut ScriptedExtractor,
            &params(60),
        );
        assert_eq!(found.map(|(id, _)| id), Some(2));
    }

    #[test]
    fn test_stops_when_session_ends() {
        let store = SessionStore::new();
        store.start(5, 50, 500).unwrap();
        let handle = store.handle(5, 50).unwrap();

        let mut script = FrameScript::default();
        for _ in 0..2000 {
            script.push_blink(Some(emb(0.0)));
        }
        script.frame_interval_ms = 2;
        let camera = ScriptedCamera::new(script);
        let open_streams = camera.open_streams();

        let mut p = params(30_000);
        p.idle_backoff = Duration::from_millis(1);
        let reply = spawn_detection(
            handle,
            roster(),
            camera,
            ScriptedLandmarker,
            ScriptedExtractor,
            p,
        )
        .unwrap();

        std::thread::sleep(Duration::from_millis(100));
        let closed = store.end(5, 50).unwrap();
        let summary = reply.blocking_recv().unwrap().unwrap();

        assert_eq!(summary.outcome, DetectionOutcome::Cancelled);
        assert!(summary.elapsed < Duration::from_secs(5));
        assert_eq!(
            closed.tally.get(&1).map_or(0, Vec::len) as u64,
            summary.matches
        );
        assert_eq!(open_streams.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[test]
    fn test_open_failure_leaves_session_untouched() {
        let store = SessionStore::new();
        store.start(5, 50, 500).unwrap();
        let handle = store.handle(5, 50).unwrap();

        let mut script = FrameScript::default();
        script.push_blink(Some(emb(0.0)));
        script.fail_open = true;

        let reply = spawn_detection(
            handle,
            roster(),
            ScriptedCamera::new(script),
            ScriptedLandmarker,
            ScriptedExtractor,
            params(100),
        )
        .unwrap();
        let err = reply.blocking_recv().unwrap().unwrap_err();
        assert!(matches!(err, AttendanceError::ResourceUnavailable(_)));

        let info = store.info(5).unwrap();
        assert_eq!(info.teacher_id, 50);
        assert!(store.end(5, 50).unwrap().tally.is_empty());
    }

    #[test]
    fn test_concurrent_loops_are_independent() {
        let store = SessionStore::new();
        store.start(1, 10, 100).unwrap();
        store.start(2, 20, 200).unwrap();

        // Class 1 blinks properly. Class 2 only ever closes its eyes for a
        // single frame, which must never complete a blink on its own.
        let mut script_a = FrameScript::default();
        for _ in 0..20 {
            script_a.push_blink(Some(emb(0.0)));
        }
        script_a.frame_interval_ms = 1;
        let mut script_b = FrameScript::default();
        for _ in 0..30 {
            script_b.push_closed();
            script_b.push_open(Some(emb(1.0)));
        }
        script_b.frame_interval_ms = 1;

        let camera_a = ScriptedCamera::new(script_a);
        let camera_b = ScriptedCamera::new(script_b);
        let streams_a = camera_a.open_streams();
        let streams_b = camera_b.open_streams();

        let reply_a = spawn_detection(
            store.handle(1, 10).unwrap(),
            roster(),
            camera_a,
            ScriptedLandmarker,
            ScriptedExtractor,
            params(400),
        )
        .unwrap();
        let reply_b = spawn_detection(
            store.handle(2, 20).unwrap(),
            roster(),
            camera_b,
            ScriptedLandmarker,
            ScriptedExtractor,
            params(400),
        )
        .unwrap();

        let a = reply_a.blocking_recv().unwrap().unwrap();
        let b = reply_b.blocking_recv().unwrap().unwrap();
        assert_eq!(a.matches, 20);
        assert_eq!(b.blinks, 0);
        assert_eq!(b.matches, 0);

        let tally_a = store.end(1, 10).unwrap().tally;
        let tally_b = store.end(2, 20).unwrap().tally;
        assert_eq!(tally_a.len(), 1);
        assert_eq!(tally_a[&1].len(), 20);
        assert!(tally_b.is_empty());
        assert_eq!(streams_a.load(std::sync::atomic::Ordering::SeqCst), 0);
        assert_eq!(streams_b.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[test]
    fn test_identify_returns_first_match() {
        let mut script = FrameScript::default();
        script.push_blink(Some(emb(9.0)));
        script.push_blink(Some(emb(2.01)));
        script.push_blink(Some(emb(0.0)));
        let camera = ScriptedCamera::new(script);
        let mut source = camera.open().unwrap();

        let found = identify(
            &roster(),
            &mut source,
            &mut ScriptedLandmarker,
            &mut ScriptedExtractor,
            &params(500),
        );
        let (id, distance) = found.unwrap();
        assert_eq!(id, 3);
        assert!(distance < 0.05);
        // The third blink was never consumed.
        assert!(source.remaining() >= 3);
    }

    #[test]
    fn test_identify_times_out() {
        let camera = ScriptedCamera::new(FrameScript::default());
        let reply = spawn_identify(
            roster(),
            camera,
            ScriptedLandmarker,
            ScriptedExtractor,
            params(50),
        )
        .unwrap();
        assert_eq!(reply.blocking_recv().unwrap().unwrap(), None);
    }
}
