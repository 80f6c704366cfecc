use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Daemon configuration.
///
/// Resolved from built-in defaults, then an optional TOML file, then
/// `ROLLCALL_*` environment variables (highest precedence).
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the SQLite roster database.
    pub db_path: PathBuf,
    /// Directory holding one CSV sheet per attendance target.
    pub workbook_dir: PathBuf,
    /// Sheet selected at startup if it exists.
    pub default_target: Option<String>,
    /// Minimum cosine similarity for a match; a score equal to it is accepted.
    pub similarity_threshold: f32,
    pub detection_confidence: f32,
    /// Seconds before the same person can be marked again.
    pub cooldown_secs: u64,
    /// Samples captured per enrollment.
    pub enroll_samples: usize,
    /// Pause between enrollment samples, in milliseconds.
    pub enroll_interval_ms: u64,
    /// Memory layout the FaceNet export expects (`nhwc` or `nchw`).
    pub embedder_layout: rollcall_core::TensorLayout,
    /// Whether to fire the motor when a session starts.
    pub trigger_enabled: bool,
    /// Serial port of the motor board; `None` auto-detects.
    pub trigger_port: Option<PathBuf>,
    pub trigger_baud: u32,
}

/// On-disk shape of the config file. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub camera_device: Option<String>,
    pub model_dir: Option<PathBuf>,
    pub db_path: Option<PathBuf>,
    pub workbook_dir: Option<PathBuf>,
    pub default_target: Option<String>,
    pub similarity_threshold: Option<f32>,
    pub detection_confidence: Option<f32>,
    pub cooldown_secs: Option<u64>,
    pub enroll_samples: Option<usize>,
    pub enroll_interval_ms: Option<u64>,
    pub embedder_layout: Option<rollcall_core::TensorLayout>,
    pub trigger_enabled: Option<bool>,
    pub trigger_port: Option<PathBuf>,
    pub trigger_baud: Option<u32>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    Read(PathBuf, std::io::Error),
    #[error("invalid config file {0}: {1}")]
    Parse(PathBuf, toml::de::Error),
}

impl Config {
    /// Load from the config file (if any) and the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        let lookup = |key: &str| std::env::var(key).ok();
        let path = config_path(&lookup);
        let file = FileConfig::read(&path)?;
        Ok(Self::resolve(file, &lookup))
    }

    /// Merge a parsed file with environment overrides onto the defaults.
    pub fn resolve(file: FileConfig, env: &dyn Fn(&str) -> Option<String>) -> Self {
        let data_dir = data_dir(env);

        let layout = env("ROLLCALL_EMBEDDER_LAYOUT")
            .and_then(|v| match v.to_ascii_lowercase().as_str() {
                "nhwc" => Some(rollcall_core::TensorLayout::Nhwc),
                "nchw" => Some(rollcall_core::TensorLayout::Nchw),
                other => {
                    tracing::warn!(value = other, "ignoring unknown ROLLCALL_EMBEDDER_LAYOUT");
                    None
                }
            })
            .or(file.embedder_layout)
            .unwrap_or_default();

        // An empty string disables the default target.
        let default_target = env("ROLLCALL_DEFAULT_TARGET")
            .or(file.default_target)
            .unwrap_or_else(|| "Sheet1".to_string());

        Self {
            camera_device: env("ROLLCALL_CAMERA_DEVICE")
                .or(file.camera_device)
                .unwrap_or_else(|| "/dev/video0".to_string()),
            model_dir: env("ROLLCALL_MODEL_DIR")
                .map(PathBuf::from)
                .or(file.model_dir)
                .unwrap_or_else(|| data_dir.join("models")),
            db_path: env("ROLLCALL_DB_PATH")
                .map(PathBuf::from)
                .or(file.db_path)
                .unwrap_or_else(|| data_dir.join("roster.db")),
            workbook_dir: env("ROLLCALL_WORKBOOK_DIR")
                .map(PathBuf::from)
                .or(file.workbook_dir)
                .unwrap_or_else(|| data_dir.join("attendance")),
            default_target: Some(default_target).filter(|t| !t.trim().is_empty()),
            similarity_threshold: env_parse(env, "ROLLCALL_SIMILARITY_THRESHOLD")
                .or(file.similarity_threshold)
                .unwrap_or(rollcall_core::recognizer::DEFAULT_SIMILARITY_THRESHOLD),
            detection_confidence: env_parse(env, "ROLLCALL_DETECTION_CONFIDENCE")
                .or(file.detection_confidence)
                .unwrap_or(rollcall_core::detector::DEFAULT_CONFIDENCE_THRESHOLD),
            cooldown_secs: env_parse(env, "ROLLCALL_COOLDOWN_SECS")
                .or(file.cooldown_secs)
                .unwrap_or(60),
            enroll_samples: env_parse(env, "ROLLCALL_ENROLL_SAMPLES")
                .or(file.enroll_samples)
                .unwrap_or(rollcall_core::enrollment::DEFAULT_MAX_SAMPLES),
            enroll_interval_ms: env_parse(env, "ROLLCALL_ENROLL_INTERVAL_MS")
                .or(file.enroll_interval_ms)
                .unwrap_or(150),
            embedder_layout: layout,
            trigger_enabled: env("ROLLCALL_TRIGGER_ENABLED")
                .map(|v| v != "0" && !v.eq_ignore_ascii_case("false"))
                .or(file.trigger_enabled)
                .unwrap_or(true),
            trigger_port: env("ROLLCALL_TRIGGER_PORT")
                .map(PathBuf::from)
                .or(file.trigger_port),
            trigger_baud: env_parse(env, "ROLLCALL_TRIGGER_BAUD")
                .or(file.trigger_baud)
                .unwrap_or(rollcall_hw::trigger::DEFAULT_BAUD),
        }
    }

    /// Path to the SSD face detection model.
    pub fn detector_model_path(&self) -> String {
        self.model_dir
            .join("face_detector.onnx")
            .to_string_lossy()
            .into_owned()
    }

    /// Path to the FaceNet embedding model.
    pub fn embedder_model_path(&self) -> String {
        self.model_dir
            .join("facenet.onnx")
            .to_string_lossy()
            .into_owned()
    }
}

impl FileConfig {
    /// Parse `path`; a missing file yields all-defaults.
    pub fn read(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(text) => {
                tracing::info!(path = %path.display(), "loading config file");
                toml::from_str(&text).map_err(|e| ConfigError::Parse(path.to_path_buf(), e))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(ConfigError::Read(path.to_path_buf(), e)),
        }
    }
}

fn config_path(env: &dyn Fn(&str) -> Option<String>) -> PathBuf {
    if let Some(p) = env("ROLLCALL_CONFIG") {
        return PathBuf::from(p);
    }
    env("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| home(env).join(".config"))
        .join("rollcall/config.toml")
}

fn data_dir(env: &dyn Fn(&str) -> Option<String>) -> PathBuf {
    env("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| home(env).join(".local/share"))
        .join("rollcall")
}

fn home(env: &dyn Fn(&str) -> Option<String>) -> PathBuf {
    PathBuf::from(env("HOME").unwrap_or_else(|| "/tmp".to_string()))
}

fn env_parse<T: FromStr>(env: &dyn Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = env(key)?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparsable environment override");
            None
        }
    }
}
