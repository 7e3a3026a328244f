//! Active liveness detection via blink recognition.
//!
//! A printed photograph or a phone held up to the camera keeps its eyes
//! open. A live student blinks. This gate tracks the eye aspect ratio (EAR)
//! of the single face in view across consecutive frames and reports `true`
//! on the frame where a completed blink (eyes closed for at least
//! `blink_frames` frames, then open again) is recognised.
//!
//! # Threat Coverage
//!
//! - **Blocks:** Static photographs, frames containing more than one face.
//! - **Does not block:** Video replay of a blinking subject.
//!
//! One [`BlinkDetector`] belongs to exactly one capture stream. Sharing an
//! instance between streams mixes their closed-eye counts.

use serde::{Deserialize, Serialize};

/// EAR below which an eye counts as closed.
pub const DEFAULT_EAR_THRESHOLD: f32 = 0.20;

/// Consecutive closed-eye frames required before an open frame completes a blink.
pub const DEFAULT_BLINK_FRAMES: u32 = 2;

/// Six contour points of one eye, in the 68-point landmark ordering:
/// `p1` and `p4` are the horizontal corners, `p2`/`p3` the upper lid,
/// `p6`/`p5` the lower lid.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EyeLandmarks(pub [(f32, f32); 6]);

/// Eye landmarks of one detected face.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FaceLandmarks {
    pub left_eye: EyeLandmarks,
    pub right_eye: EyeLandmarks,
}

fn distance(a: (f32, f32), b: (f32, f32)) -> f32 {
    let dx = a.0 - b.0;
    let dy = a.1 - b.1;
    (dx * dx + dy * dy).sqrt()
}

impl EyeLandmarks {
    /// Eye aspect ratio `(‖p2−p6‖ + ‖p3−p5‖) / (2·‖p1−p4‖)`.
    ///
    /// Returns 0.0 when the eye corners coincide; callers treat a
    /// non-positive EAR as unusable geometry.
    pub fn aspect_ratio(&self) -> f32 {
        let [p1, p2, p3, p4, p5, p6] = self.0;
        let width = distance(p1, p4);
        if width == 0.0 {
            return 0.0;
        }
        (distance(p2, p6) + distance(p3, p5)) / (2.0 * width)
    }

    /// Unit-width eye whose aspect ratio is exactly `ear`.
    pub fn with_aspect_ratio(ear: f32) -> Self {
        let half = ear / 2.0;
        Self([
            (0.0, 0.0),
            (1.0 / 3.0, half),
            (2.0 / 3.0, half),
            (1.0, 0.0),
            (2.0 / 3.0, -half),
            (1.0 / 3.0, -half),
        ])
    }
}

impl FaceLandmarks {
    /// Face with both eyes at the given aspect ratio.
    pub fn with_aspect_ratio(ear: f32) -> Self {
        let eye = EyeLandmarks::with_aspect_ratio(ear);
        Self {
            left_eye: eye,
            right_eye: eye,
        }
    }
}

/// Per-stream blink state machine.
#[derive(Debug, Clone)]
pub struct BlinkDetector {
    ear_threshold: f32,
    blink_frames: u32,
    closed_frames: u32,
}

impl Default for BlinkDetector {
    fn default() -> Self {
        Self::new(DEFAULT_EAR_THRESHOLD, DEFAULT_BLINK_FRAMES)
    }
}

impl BlinkDetector {
    pub fn new(ear_threshold: f32, blink_frames: u32) -> Self {
        Self {
            ear_threshold,
            blink_frames,
            closed_frames: 0,
        }
    }

    /// Feed the faces detected in one frame. `None` means the frame itself
    /// was unavailable.
    ///
    /// Anything other than exactly one face resets the state: a blink must
    /// be observed on a single, unambiguous subject.
    pub fn observe(&mut self, faces: Option<&[FaceLandmarks]>) -> bool {
        match faces {
            Some([face]) => self.observe_face(face),
            _ => {
                self.reset();
                false
            }
        }
    }

    /// Feed the landmarks of the single face in the current frame.
    pub fn observe_face(&mut self, face: &FaceLandmarks) -> bool {
        self.observe_ear(face.left_eye.aspect_ratio(), face.right_eye.aspect_ratio())
    }

    /// Feed per-eye aspect ratios for the current frame.
    pub fn observe_ear(&mut self, left: f32, right: f32) -> bool {
        if left <= 0.0 || right <= 0.0 || !left.is_finite() || !right.is_finite() {
            self.reset();
            return false;
        }

        let ear = (left + right) / 2.0;
        if ear < self.ear_threshold {
            self.closed_frames = self.closed_frames.saturating_add(1);
            return false;
        }

        let blinked = self.closed_frames >= self.blink_frames;
        self.reset();
        if blinked {
            tracing::debug!(ear, "blink completed");
        }
        blinked
    }

    /// Forget any partially observed blink.
    pub fn reset(&mut self) {
        self.closed_frames = 0;
    }

    /// Number of consecutive closed-eye frames seen so far.
    pub fn closed_frames(&self) -> u32 {
        self.closed_frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(detector: &mut BlinkDetector, ears: &[f32]) -> Vec<bool> {
        ears.iter().map(|&e| detector.observe_ear(e, e)).collect()
    }

    #[test]
    fn test_two_closed_frames_then_open_is_a_blink() {
        let mut d = BlinkDetector::default();
        assert_eq!(
            feed(&mut d, &[0.25, 0.15, 0.15, 0.25]),
            vec![false, false, false, true]
        );
    }

    #[test]
    fn test_single_closed_frame_is_not_a_blink() {
        let mut d = BlinkDetector::default();
        assert_eq!(feed(&mut d, &[0.15, 0.25]), vec![false, false]);
        assert_eq!(d.closed_frames(), 0);
    }

    #[test]
    fn test_long_closure_counts_once() {
        let mut d = BlinkDetector::default();
        assert_eq!(
            feed(&mut d, &[0.1, 0.1, 0.1, 0.1, 0.3, 0.3]),
            vec![false, false, false, false, true, false]
        );
    }

    #[test]
    fn test_threshold_is_strict() {
        // EAR exactly at the threshold counts as open.
        let mut d = BlinkDetector::new(0.20, 2);
        assert!(!d.observe_ear(0.20, 0.20));
        assert_eq!(d.closed_frames(), 0);
    }

    #[test]
    fn test_invalid_ear_resets() {
        let mut d = BlinkDetector::default();
        feed(&mut d, &[0.1, 0.1]);
        assert_eq!(d.closed_frames(), 2);
        assert!(!d.observe_ear(0.0, 0.1));
        assert_eq!(d.closed_frames(), 0);
        // The open frame after the reset no longer completes a blink.
        assert!(!d.observe_ear(0.3, 0.3));
    }

    #[test]
    fn test_missing_frame_resets() {
        let mut d = BlinkDetector::default();
        feed(&mut d, &[0.1, 0.1]);
        assert!(!d.observe(None));
        assert_eq!(d.closed_frames(), 0);
    }

    #[test]
    fn test_zero_or_many_faces_reset() {
        let closed = FaceLandmarks::with_aspect_ratio(0.1);
        let open = FaceLandmarks::with_aspect_ratio(0.3);

        let mut d = BlinkDetector::default();
        d.observe(Some(&[closed][..]));
        d.observe(Some(&[closed][..]));
        assert!(!d.observe(Some(&[] as &[FaceLandmarks])));
        assert!(!d.observe(Some(&[open][..])));

        let mut d = BlinkDetector::default();
        d.observe(Some(&[closed][..]));
        d.observe(Some(&[closed][..]));
        assert!(!d.observe(Some(&[open, open][..])));
        assert_eq!(d.closed_frames(), 0);
    }

    #[test]
    fn test_landmark_blink_sequence() {
        let mut d = BlinkDetector::default();
        let seq = [0.28, 0.12, 0.11, 0.29];
        let out: Vec<bool> = seq
            .iter()
            .map(|&e| d.observe(Some(&[FaceLandmarks::with_aspect_ratio(e)][..])))
            .collect();
        assert_eq!(out, vec![false, false, false, true]);
    }

    #[test]
    fn test_aspect_ratio_geometry() {
        // Corners 4 apart, lids 2 and 1 apart → (2 + 1) / (2 * 4) = 0.375
        let eye = EyeLandmarks([
            (0.0, 0.0),
            (1.0, 1.0),
            (3.0, 0.5),
            (4.0, 0.0),
            (3.0, -0.5),
            (1.0, -1.0),
        ]);
        assert!((eye.aspect_ratio() - 0.375).abs() < 1e-6);
    }

    #[test]
    fn test_aspect_ratio_degenerate_corners() {
        let eye = EyeLandmarks([(2.0, 2.0); 6]);
        assert_eq!(eye.aspect_ratio(), 0.0);
    }

    #[test]
    fn test_with_aspect_ratio_roundtrips() {
        for ear in [0.1f32, 0.2, 0.35] {
            let got = EyeLandmarks::with_aspect_ratio(ear).aspect_ratio();
            assert!((got - ear).abs() < 1e-6, "ear {ear} → {got}");
        }
    }

    #[test]
    fn test_independent_detectors() {
        let mut a = BlinkDetector::default();
        let mut b = BlinkDetector::default();
        a.observe_ear(0.1, 0.1);
        a.observe_ear(0.1, 0.1);
        assert!(!b.observe_ear(0.3, 0.3));
        assert!(a.observe_ear(0.3, 0.3));
    }
}
