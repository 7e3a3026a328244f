//! Deterministic frame scripts standing in for a camera and face models.
//!
//! A script is a JSON document:
//!
//! ```json
//! {
//!   "frame_interval_ms": 33,
//!   "frames": [
//!     { "faces": [{ "ear": 0.31 }] },
//!     { "faces": [{ "ear": 0.12 }] },
//!     null,
//!     { "faces": [{ "left_eye": [[0,0],[1,1],[3,1],[4,0],[3,-1],[1,-1]],
//!                   "right_eye": [[0,0],[1,1],[3,1],[4,0],[3,-1],[1,-1]] }],
//!       "embedding": [0.12, -0.4, 0.9] }
//!   ]
//! }
//! ```
//!
//! `null` is a tick where the camera had no frame ready. A face is either full
//! eye landmarks or an `ear` shorthand for both eyes.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rollcall_core::{
    AttendanceError, CaptureDevice, Embedding, EmbeddingExtractor, FaceLandmarker, FaceLandmarks,
    FrameSource,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScriptError {
    #[error("failed to read frame script {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid frame script: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScriptedFace {
    Ear { ear: f32 },
    Landmarks(FaceLandmarks),
}

impl ScriptedFace {
    fn landmarks(&self) -> FaceLandmarks {
        match self {
            Self::Ear { ear } => FaceLandmarks::with_aspect_ratio(*ear),
            Self::Landmarks(lm) => *lm,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScriptedFrame {
    #[serde(default)]
    pub faces: Vec<ScriptedFace>,
    /// What the embedding extractor returns for this frame.
    #[serde(default)]
    pub embedding: Option<Embedding>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FrameScript {
    #[serde(default)]
    pub frames: Vec<Option<ScriptedFrame>>,
    /// Delay before each frame is delivered, simulating the camera rate.
    #[serde(default)]
    pub frame_interval_ms: u64,
    /// Make the camera refuse to open.
    #[serde(default)]
    pub fail_open: bool,
}

impl FrameScript {
    pub fn load(path: &Path) -> Result<Self, ScriptError> {
        let text = std::fs::read_to_string(path).map_err(|source| ScriptError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, ScriptError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

#[cfg(test)]
const OPEN_EAR: f32 = 0.30;
#[cfg(test)]
const CLOSED_EAR: f32 = 0.10;

#[cfg(test)]
impl FrameScript {
    /// One face with open eyes.
    pub fn push_open(&mut self, embedding: Option<Embedding>) {
        self.frames.push(Some(ScriptedFrame {
            faces: vec![ScriptedFace::Ear { ear: OPEN_EAR }],
            embedding,
        }));
    }

    /// One face with closed eyes.
    pub fn push_closed(&mut self) {
        self.frames.push(Some(ScriptedFrame {
            faces: vec![ScriptedFace::Ear { ear: CLOSED_EAR }],
            embedding: None,
        }));
    }

    /// Two closed frames followed by the open frame that completes the blink.
    pub fn push_blink(&mut self, embedding: Option<Embedding>) {
        self.push_closed();
        self.push_closed();
        self.push_open(embedding);
    }

    /// A tick with no frame ready.
    pub fn push_dropped(&mut self) {
        self.frames.push(None);
    }
}

/// Scripted [`CaptureDevice`].
pub struct ScriptedCamera {
    script: FrameScript,
    open_streams: Arc<AtomicUsize>,
}

impl ScriptedCamera {
    pub fn new(script: FrameScript) -> Self {
        Self {
            script,
            open_streams: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Counter of streams opened from this camera and not yet dropped.
    #[cfg(test)]
    pub fn open_streams(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.open_streams)
    }
}

impl CaptureDevice for ScriptedCamera {
    type Source = ScriptedStream;

    fn open(&self) -> Result<ScriptedStream, AttendanceError> {
        if self.script.fail_open {
            return Err(AttendanceError::ResourceUnavailable(
                "scripted camera refused to open".into(),
            ));
        }
        self.open_streams.fetch_add(1, Ordering::SeqCst);
        Ok(ScriptedStream {
            frames: self.script.frames.iter().cloned().collect(),
            interval: Duration::from_millis(self.script.frame_interval_ms),
            open_streams: Arc::clone(&self.open_streams),
        })
    }
}

/// Stream over a script. Once exhausted it keeps reporting no frame.
pub struct ScriptedStream {
    frames: VecDeque<Option<ScriptedFrame>>,
    interval: Duration,
    open_streams: Arc<AtomicUsize>,
}

impl ScriptedStream {
    /// Frames not yet delivered.
    #[cfg(test)]
    pub fn remaining(&self) -> usize {
        self.frames.len()
    }
}

impl FrameSource for ScriptedStream {
    type Frame = ScriptedFrame;

    fn next_frame(&mut self) -> Option<ScriptedFrame> {
        let next = self.frames.pop_front()?;
        if !self.interval.is_zero() {
            std::thread::sleep(self.interval);
        }
        next
    }
}

impl Drop for ScriptedStream {
    fn drop(&mut self) {
        self.open_streams.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Reports the faces written in the script.
pub struct ScriptedLandmarker;

impl FaceLandmarker<ScriptedFrame> for ScriptedLandmarker {
    fn landmarks(&mut self, frame: &ScriptedFrame) -> Vec<FaceLandmarks> {
        frame.faces.iter().map(ScriptedFace::landmarks).collect()
    }
}

/// Reports the embedding written in the script.
pub struct ScriptedExtractor;

impl EmbeddingExtractor<ScriptedFrame> for ScriptedExtractor {
    fn extract(&mut self, frame: &ScriptedFrame) -> Option<Embedding> {
        frame.embedding.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mixed_faces_and_dropped_frames() {
        let script = FrameScript::from_json(
            r#"{
                "frame_interval_ms": 0,
                "frames": [
                    { "faces": [{ "ear": 0.12 }] },
                    null,
                    {
                        "faces": [{
                            "left_eye":  [[0,0],[1,1],[3,1],[4,0],[3,-1],[1,-1]],
                            "right_eye": [[0,0],[1,1],[3,1],[4,0],[3,-1],[1,-1]]
                        }],
                        "embedding": [0.5, 0.25]
                    },
                    {}
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(script.len(), 4);
        assert!(script.frames[1].is_none());
        let frame = script.frames[2].as_ref().unwrap();
        assert!(matches!(frame.faces[0], ScriptedFace::Landmarks(_)));
        assert_eq!(frame.embedding.as_ref().unwrap().values, vec![0.5, 0.25]);

        // (2 + 2) / (2 * 4) = 0.5
        let lm = ScriptedLandmarker.landmarks(frame);
        assert!((lm[0].left_eye.aspect_ratio() - 0.5).abs() < 1e-6);

        let empty = script.frames[3].as_ref().unwrap();
        assert!(empty.faces.is_empty());
        assert!(empty.embedding.is_none());
    }

    #[test]
    fn test_rejects_malformed_script() {
        assert!(matches!(
            FrameScript::from_json(r#"{ "frames": [ { "faces": 3 } ] }"#),
            Err(ScriptError::Parse(_))
        ));
    }

    #[test]
    fn test_stream_delivers_in_order_then_runs_dry() {
        let mut script = FrameScript::default();
        script.push_open(None);
        script.push_dropped();
        script.push_closed();

        let camera = ScriptedCamera::new(script);
        let mut stream = camera.open().unwrap();
        assert_eq!(stream.remaining(), 3);

        let first = stream.next_frame().unwrap();
        assert_eq!(first.faces, vec![ScriptedFace::Ear { ear: OPEN_EAR }]);
        assert!(stream.next_frame().is_none());
        let third = stream.next_frame().unwrap();
        assert_eq!(third.faces, vec![ScriptedFace::Ear { ear: CLOSED_EAR }]);
        assert!(stream.next_frame().is_none());
        assert!(stream.next_frame().is_none());
    }

    #[test]
    fn test_stream_drop_releases_camera() {
        let camera = ScriptedCamera::new(FrameScript::default());
        let counter = camera.open_streams();
        {
            let _a = camera.open().unwrap();
            let _b = camera.open().unwrap();
            assert_eq!(counter.load(Ordering::SeqCst), 2);
        }
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_fail_open() {
        let camera = ScriptedCamera::new(FrameScript {
            fail_open: true,
            ..FrameScript::default()
        });
        assert!(matches!(
            camera.open(),
            Err(AttendanceError::ResourceUnavailable(_))
        ));
        assert_eq!(camera.open_streams().load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_blink_helper_shape() {
        let mut script = FrameScript::default();
        script.push_blink(Some(Embedding::new(vec![1.0])));
        assert_eq!(script.len(), 3);
        assert!(script.frames[0].as_ref().unwrap().embedding.is_none());
        assert!(script.frames[2].as_ref().unwrap().embedding.is_some());
    }
}
