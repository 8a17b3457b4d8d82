use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Where the records live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    /// One JSON file per collection under `data_dir`.
    Json,
    /// A single `rollcall.db` under `data_dir`.
    Sqlite,
}

impl FromStr for StorageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(StorageKind::Json),
            "sqlite" => Ok(StorageKind::Sqlite),
            other => Err(format!("unknown storage backend {other:?}")),
        }
    }
}

/// Daemon configuration: defaults, then the TOML file, then `ROLLCALL_*`
/// environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    pub camera_width: u32,
    pub camera_height: u32,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Directory holding the persisted collections.
    pub data_dir: PathBuf,
    pub storage: StorageKind,
    /// Confidence a match must exceed to be reported.
    pub match_threshold: f32,
    /// IoU above which two detections count as the same face.
    pub region_iou_threshold: f32,
    /// Tick period of a continuous session.
    pub session_interval_ms: u64,
    /// Frames discarded after opening the camera (AGC/AE stabilization).
    pub warmup_frames: usize,
    /// Frames captured per camera enrollment; the best face wins.
    pub frames_per_capture: usize,
    /// Faces encoded per probe.
    pub max_faces: usize,
    /// Password for the `admin` account created when no users exist.
    pub bootstrap_admin_password: Option<String>,
    /// Serve on the system bus instead of the session bus.
    pub system_bus: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            camera_device: "/dev/video0".to_string(),
            camera_width: 640,
            camera_height: 480,
            model_dir: rollcall_core::default_model_dir(),
            data_dir: PathBuf::from("/var/lib/rollcall"),
            storage: StorageKind::Json,
            match_threshold: rollcall_core::matcher::DEFAULT_MATCH_THRESHOLD,
            region_iou_threshold: rollcall_core::matcher::DEFAULT_REGION_IOU_THRESHOLD,
            session_interval_ms: 2000,
            warmup_frames: 4,
            frames_per_capture: 3,
            max_faces: 16,
            bootstrap_admin_password: None,
            system_bus: false,
        }
    }
}

impl Config {
    /// Load from the process environment and the config file it points at.
    pub fn load() -> Self {
        Self::from_sources(|key| std::env::var(key).ok())
    }

    /// Resolve configuration through `env`, a lookup standing in for the
    /// process environment.
    pub fn from_sources(env: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = match config_path(&env) {
            Some(path) => Self::from_file(&path),
            None => Self::default(),
        };
        config.sanitize();
        if env("ROLLCALL_DATA_DIR").is_none() && config.data_dir == Self::default().data_dir {
            if let Some(dir) = user_data_dir(&env) {
                config.data_dir = dir;
            }
        }
        config.apply_env(&env);
        config
    }

    fn from_file(path: &Path) -> Self {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Self::default(),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "cannot read config file; using defaults");
                return Self::default();
            }
        };
        match toml::from_str(&text) {
            Ok(config) => {
                tracing::debug!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "malformed config file; using defaults");
                Self::default()
            }
        }
    }

    fn apply_env(&mut self, env: &impl Fn(&str) -> Option<String>) {
        if let Some(v) = env("ROLLCALL_CAMERA_DEVICE") {
            self.camera_device = v;
        }
        if let Some(v) = env("ROLLCALL_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Some(v) = env("ROLLCALL_DATA_DIR") {
            self.data_dir = PathBuf::from(v);
        }
        if let Some(v) = env("ROLLCALL_BOOTSTRAP_ADMIN_PASSWORD") {
            self.bootstrap_admin_password = Some(v);
        }
        override_parsed(env, "ROLLCALL_CAMERA_WIDTH", &mut self.camera_width);
        override_parsed(env, "ROLLCALL_CAMERA_HEIGHT", &mut self.camera_height);
        override_parsed(env, "ROLLCALL_STORAGE", &mut self.storage);
        override_checked(env, "ROLLCALL_MATCH_THRESHOLD", &mut self.match_threshold, is_unit);
        override_checked(env, "ROLLCALL_REGION_IOU_THRESHOLD", &mut self.region_iou_threshold, is_unit);
        override_parsed(env, "ROLLCALL_SESSION_INTERVAL_MS", &mut self.session_interval_ms);
        override_parsed(env, "ROLLCALL_WARMUP_FRAMES", &mut self.warmup_frames);
        override_checked(env, "ROLLCALL_FRAMES_PER_CAPTURE", &mut self.frames_per_capture, is_positive);
        override_checked(env, "ROLLCALL_MAX_FACES", &mut self.max_faces, is_positive);
        if let Some(v) = env("ROLLCALL_SYSTEM_BUS") {
            self.system_bus = v != "0";
        }
    }

    /// Replace out-of-range values read from the config file with defaults.
    fn sanitize(&mut self) {
        let defaults = Self::default();
        if !is_unit(&self.match_threshold) {
            tracing::warn!(value = %self.match_threshold, "match_threshold must be within [0, 1]; using default");
            self.match_threshold = defaults.match_threshold;
        }
        if !is_unit(&self.region_iou_threshold) {
            tracing::warn!(value = %self.region_iou_threshold, "region_iou_threshold must be within [0, 1]; using default");
            self.region_iou_threshold = defaults.region_iou_threshold;
        }
        if !is_positive(&self.frames_per_capture) {
            tracing::warn!("frames_per_capture must be positive; using default");
            self.frames_per_capture = defaults.frames_per_capture;
        }
        if !is_positive(&self.max_faces) {
            tracing::warn!("max_faces must be positive; using default");
            self.max_faces = defaults.max_faces;
        }
    }

    /// Path of the SQLite database when `storage = "sqlite"`.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("rollcall.db")
    }

    pub fn session_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.session_interval_ms.max(1))
    }
}

fn override_parsed<T: FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    override_checked(env, key, slot, |_| true);
}

fn override_checked<T: FromStr>(
    env: &impl Fn(&str) -> Option<String>,
    key: &str,
    slot: &mut T,
    valid: impl Fn(&T) -> bool,
) {
    let Some(raw) = env(key) else {
        return;
    };
    match raw.trim().parse() {
        Ok(value) if valid(&value) => *slot = value,
        Ok(_) => tracing::warn!(key, value = %raw, "out-of-range value; keeping previous setting"),
        Err(_) => tracing::warn!(key, value = %raw, "unparseable value; keeping previous setting"),
    }
}

/// Finite and within [0, 1]; rejects NaN.
fn is_unit(value: &f32) -> bool {
    (0.0..=1.0).contains(value)
}

fn is_positive(value: &usize) -> bool {
    *value > 0
}

fn config_path(env: &impl Fn(&str) -> Option<String>) -> Option<PathBuf> {
    if let Some(path) = env("ROLLCALL_CONFIG") {
        return Some(PathBuf::from(path));
    }
    let base = env("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| env("HOME").map(|home| PathBuf::from(home).join(".config")))?;
    Some(base.join("rollcall/config.toml"))
}

/// Per-user data directory, used when the daemon runs outside a system unit.
fn user_data_dir(env: &impl Fn(&str) -> Option<String>) -> Option<PathBuf> {
    if env("ROLLCALL_SYSTEM_BUS").is_some_and(|v| v != "0") {
        return None;
    }
    env("XDG_DATA_HOME")
        .map(PathBuf::from)
        .or_else(|| env("HOME").map(|home| PathBuf::from(home).join(".local/share")))
        .map(|dir| dir.join("rollcall"))
}
