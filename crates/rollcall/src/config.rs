use std::path::PathBuf;
use std::time::Duration;

use rollcall_core::liveness::{DEFAULT_BLINK_FRAMES, DEFAULT_EAR_THRESHOLD};
use rollcall_core::matcher::DEFAULT_MATCH_THRESHOLD;
use rollcall_core::presence::{DEFAULT_LATE_THRESHOLD, DEFAULT_PRESENCE_THRESHOLD};
use rollcall_core::{AttendanceError, PresencePolicy};

/// Runtime configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Eye aspect ratio below which an eye counts as closed.
    pub ear_threshold: f32,
    /// Consecutive closed-eye frames needed before an open frame completes a blink.
    pub blink_frames: u32,
    /// Euclidean distance under which a live embedding matches a student.
    pub match_threshold: f32,
    /// Presence score at or above which a student is marked present.
    pub presence_threshold: f64,
    /// Presence score above which a student is marked late.
    pub late_threshold: f64,
    /// Length of a detection run, also the presence score denominator.
    pub scan_window_secs: u64,
    /// Length of a one-shot teacher identification scan.
    pub identify_window_secs: u64,
    /// Pause after the frame source had nothing ready.
    pub idle_backoff_ms: u64,
    /// Whether roster students with no detections are reported as absent.
    pub backfill_absent: bool,
    /// Secret from which the embedding encryption key is derived.
    /// When unset, a random key is kept next to the database.
    pub embedding_secret: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_data_dir().join("attendance.db"),
            ear_threshold: DEFAULT_EAR_THRESHOLD,
            blink_frames: DEFAULT_BLINK_FRAMES,
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            presence_threshold: DEFAULT_PRESENCE_THRESHOLD,
            late_threshold: DEFAULT_LATE_THRESHOLD,
            scan_window_secs: 30,
            identify_window_secs: 2,
            idle_backoff_ms: 5,
            backfill_absent: true,
            embedding_secret: None,
        }
    }
}

impl Config {
    /// Load configuration from `ROLLCALL_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let db_path = std::env::var("ROLLCALL_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.db_path);

        Self {
            db_path,
            ear_threshold: env_parse("ROLLCALL_EAR_THRESHOLD", defaults.ear_threshold),
            blink_frames: env_parse("ROLLCALL_BLINK_FRAMES", defaults.blink_frames),
            match_threshold: env_parse("ROLLCALL_MATCH_THRESHOLD", defaults.match_threshold),
            presence_threshold: env_parse(
                "ROLLCALL_PRESENCE_THRESHOLD",
                defaults.presence_threshold,
            ),
            late_threshold: env_parse("ROLLCALL_LATE_THRESHOLD", defaults.late_threshold),
            scan_window_secs: env_parse("ROLLCALL_SCAN_WINDOW_SECS", defaults.scan_window_secs),
            identify_window_secs: env_parse(
                "ROLLCALL_IDENTIFY_WINDOW_SECS",
                defaults.identify_window_secs,
            ),
            idle_backoff_ms: env_parse("ROLLCALL_IDLE_BACKOFF_MS", defaults.idle_backoff_ms),
            backfill_absent: std::env::var("ROLLCALL_BACKFILL_ABSENT")
                .map(|v| v != "0")
                .unwrap_or(defaults.backfill_absent),
            embedding_secret: std::env::var("ROLLCALL_EMBEDDING_SECRET")
                .ok()
                .filter(|s| !s.is_empty()),
        }
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<(), AttendanceError> {
        let invalid = |msg: String| Err(AttendanceError::InvalidConfiguration(msg));

        if self.scan_window_secs == 0 {
            return invalid("scan window must be greater than zero seconds".into());
        }
        if self.identify_window_secs == 0 {
            return invalid("identify window must be greater than zero seconds".into());
        }
        if !(self.ear_threshold > 0.0) {
            return invalid(format!("EAR threshold must be positive, got {}", self.ear_threshold));
        }
        if self.blink_frames == 0 {
            return invalid("blink frames must be at least 1".into());
        }
        if !(self.match_threshold > 0.0) {
            return invalid(format!(
                "match threshold must be positive, got {}",
                self.match_threshold
            ));
        }
        if !(self.late_threshold > 0.0 && self.late_threshold < self.presence_threshold) {
            return invalid(format!(
                "thresholds must satisfy 0 < late ({}) < presence ({})",
                self.late_threshold, self.presence_threshold
            ));
        }
        Ok(())
    }

    pub fn scan_window(&self) -> Duration {
        Duration::from_secs(self.scan_window_secs)
    }

    pub fn identify_window(&self) -> Duration {
        Duration::from_secs(self.identify_window_secs)
    }

    pub fn idle_backoff(&self) -> Duration {
        Duration::from_millis(self.idle_backoff_ms)
    }

    pub fn presence_policy(&self) -> PresencePolicy {
        PresencePolicy {
            presence_threshold: self.presence_threshold,
            late_threshold: self.late_threshold,
        }
    }
}

fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall")
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.scan_window_secs, 30);
        assert_eq!(config.blink_frames, 2);
        assert!((config.match_threshold - 0.45).abs() < 1e-6);
    }

    #[test]
    fn test_zero_window_rejected() {
        let config = Config {
            scan_window_secs: 0,
            ..Config::default()
        };
        assert!(matches!(
            config.validate(),
            Err(AttendanceError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_inverted_thresholds_rejected() {
        let config = Config {
            presence_threshold: 0.2,
            late_threshold: 0.3,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_nan_threshold_rejected() {
        let config = Config {
            match_threshold: f32::NAN,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_blink_frames_rejected() {
        let config = Config {
            blink_frames: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_presence_policy_follows_config() {
        let config = Config {
            presence_threshold: 0.8,
            late_threshold: 0.4,
            ..Config::default()
        };
        let policy = config.presence_policy();
        assert_eq!(policy.presence_threshold, 0.8);
        assert_eq!(policy.late_threshold, 0.4);
    }
}
