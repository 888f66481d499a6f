use crate::common::error::{RecognitionError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub video: VideoConfig,
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub face: FaceConfig,
    #[serde(default)]
    pub tracker: TrackerConfig,
    #[serde(default)]
    pub attendance: AttendanceConfig,
    #[serde(default)]
    pub service: ServiceConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct VideoConfig {
    /// Source opened when none has been persisted yet.
    #[serde(default = "default_source")]
    pub default_source: String,
    #[serde(default = "default_max_width")]
    pub max_width: u32,
    #[serde(default = "default_max_height")]
    pub max_height: u32,
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: f64,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: u32,
    /// Hard bound on how long opening any source may take, independent of
    /// socket-level timeouts.
    #[serde(default = "default_open_timeout")]
    pub open_timeout_secs: f64,
}

fn default_source() -> String {
    "0".to_string()
}
fn default_max_width() -> u32 {
    1280
}
fn default_max_height() -> u32 {
    720
}
fn default_reconnect_delay() -> f64 {
    5.0
}
fn default_buffer_size() -> u32 {
    1
}
fn default_open_timeout() -> f64 {
    10.0
}

impl Default for VideoConfig {
    fn default() -> Self {
        toml::from_str("").expect("defaults are complete")
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DetectorConfig {
    #[serde(default = "default_detector_model")]
    pub model_path: PathBuf,
    #[serde(default = "default_detector_input")]
    pub input_size: u32,
    #[serde(default = "default_confidence")]
    pub confidence: f32,
    #[serde(default = "default_min_person_area")]
    pub min_person_area: f32,
    #[serde(default = "default_max_aspect_ratio")]
    pub max_aspect_ratio: f32,
    /// cpu | cuda | auto
    #[serde(default = "default_device")]
    pub device: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_opt_level")]
    pub optimization_level: u32,
}

fn default_detector_model() -> PathBuf {
    PathBuf::from("models/person-det.onnx")
}
fn default_detector_input() -> u32 {
    640
}
fn default_confidence() -> f32 {
    0.65
}
fn default_min_person_area() -> f32 {
    3000.0
}
fn default_max_aspect_ratio() -> f32 {
    4.0
}
fn default_device() -> String {
    "auto".to_string()
}
fn default_batch_size() -> usize {
    8
}
fn default_opt_level() -> u32 {
    3
}

impl Default for DetectorConfig {
    fn default() -> Self {
        toml::from_str("").expect("defaults are complete")
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct FaceConfig {
    #[serde(default = "default_face_detector_model")]
    pub detector_model_path: PathBuf,
    #[serde(default = "default_face_encoder_model")]
    pub encoder_model_path: PathBuf,
    #[serde(default = "default_face_input")]
    pub detector_input_size: u32,
    #[serde(default = "default_encoder_input")]
    pub encoder_input_size: u32,
    #[serde(default = "default_base_tolerance")]
    pub base_tolerance: f32,
    #[serde(default = "default_max_upsample")]
    pub max_upsample: u32,
    #[serde(default = "default_quality_threshold")]
    pub quality_threshold: f32,
    /// A Known track seen this recently is not re-examined.
    #[serde(default = "default_tracking_ttl")]
    pub tracking_ttl_secs: f64,
}

fn default_face_detector_model() -> PathBuf {
    PathBuf::from("models/face-det.onnx")
}
fn default_face_encoder_model() -> PathBuf {
    PathBuf::from("models/face-enc.onnx")
}
fn default_face_input() -> u32 {
    320
}
fn default_encoder_input() -> u32 {
    112
}
fn default_base_tolerance() -> f32 {
    0.65
}
fn default_max_upsample() -> u32 {
    2
}
fn default_quality_threshold() -> f32 {
    0.25
}
fn default_tracking_ttl() -> f64 {
    2.0
}

impl Default for FaceConfig {
    fn default() -> Self {
        toml::from_str("").expect("defaults are complete")
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TrackerConfig {
    #[serde(default = "default_iou_threshold")]
    pub iou_threshold: f32,
    /// Frames a track may stay undetected before removal. 3 keeps boxes
    /// roughly one second behind a person leaving at the 2 Hz cadence.
    #[serde(default = "default_max_age")]
    pub max_age: u32,
    #[serde(default = "default_face_memory")]
    pub face_memory_secs: f64,
}

fn default_iou_threshold() -> f32 {
    0.3
}
fn default_max_age() -> u32 {
    3
}
fn default_face_memory() -> f64 {
    3.0
}

impl Default for TrackerConfig {
    fn default() -> Self {
        toml::from_str("").expect("defaults are complete")
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AttendanceConfig {
    #[serde(default = "default_duplicate_window")]
    pub duplicate_window_minutes: i64,
    #[serde(default = "default_true")]
    pub auto_mark_enabled: bool,
}

fn default_duplicate_window() -> i64 {
    5
}
fn default_true() -> bool {
    true
}

impl Default for AttendanceConfig {
    fn default() -> Self {
        toml::from_str("").expect("defaults are complete")
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServiceConfig {
    #[serde(default = "default_background_interval")]
    pub background_interval_ms: u64,
    #[serde(default = "default_jpeg_quality")]
    pub stream_jpeg_quality: u8,
    #[serde(default = "default_stream_interval")]
    pub stream_interval_ms: u64,
    #[serde(default)]
    pub debug: bool,
}

fn default_background_interval() -> u64 {
    500
}
fn default_jpeg_quality() -> u8 {
    80
}
fn default_stream_interval() -> u64 {
    33
}

impl Default for ServiceConfig {
    fn default() -> Self {
        toml::from_str("").expect("defaults are complete")
    }
}

impl Config {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(RecognitionError::Other(anyhow::anyhow!(
                "Config file not found: {}",
                path.display()
            )));
        }

        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)
            .map_err(|e| RecognitionError::Other(anyhow::anyhow!("Config parse error: {}", e)))?;

        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Built-in defaults, still subject to environment overrides.
    pub fn load_default() -> Result<Self> {
        let mut config = Config::default();
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Environment inputs recognized by the service.
    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("FACE_TOLERANCE") {
            if let Ok(t) = v.parse() {
                self.face.base_tolerance = t;
            }
        }
        if let Ok(v) = std::env::var("DETECTOR_DEVICE") {
            self.detector.device = v;
        }
        if let Ok(v) = std::env::var("CAMERA_SOURCE") {
            self.video.default_source = v;
        }
        if let Ok(v) = std::env::var("FRAME_BUFFER") {
            if let Ok(n) = v.parse() {
                self.video.buffer_size = n;
            }
        }
        if let Ok(v) = std::env::var("SIGHTLINE_DEBUG") {
            self.service.debug = v == "1" || v.eq_ignore_ascii_case("true");
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.video.max_width == 0 || self.video.max_width > 4096 {
            return Err(RecognitionError::Other(anyhow::anyhow!(
                "Max frame width must be between 1 and 4096, got {}",
                self.video.max_width
            )));
        }
        if self.video.max_height == 0 || self.video.max_height > 4096 {
            return Err(RecognitionError::Other(anyhow::anyhow!(
                "Max frame height must be between 1 and 4096, got {}",
                self.video.max_height
            )));
        }
        if !(0.0..=1.0).contains(&self.detector.confidence) {
            return Err(RecognitionError::Other(anyhow::anyhow!(
                "Detection confidence must be between 0.0 and 1.0, got {}",
                self.detector.confidence
            )));
        }
        if self.detector.max_aspect_ratio <= 0.3 {
            return Err(RecognitionError::Other(anyhow::anyhow!(
                "Max aspect ratio must exceed the 0.3 lower bound, got {}",
                self.detector.max_aspect_ratio
            )));
        }
        if !(0.0..=1.0).contains(&self.face.base_tolerance) {
            return Err(RecognitionError::Other(anyhow::anyhow!(
                "Face tolerance must be between 0.0 and 1.0, got {}",
                self.face.base_tolerance
            )));
        }
        if !(0.0..=1.0).contains(&self.face.quality_threshold) {
            return Err(RecognitionError::Other(anyhow::anyhow!(
                "Quality threshold must be between 0.0 and 1.0, got {}",
                self.face.quality_threshold
            )));
        }
        if self.face.max_upsample > 4 {
            return Err(RecognitionError::Other(anyhow::anyhow!(
                "Max upsample must be at most 4, got {}",
                self.face.max_upsample
            )));
        }
        if self.tracker.max_age == 0 {
            return Err(RecognitionError::Other(anyhow::anyhow!(
                "Tracker max_age must be at least 1"
            )));
        }
        if self.attendance.duplicate_window_minutes < 0 {
            return Err(RecognitionError::Other(anyhow::anyhow!(
                "Duplicate window must not be negative, got {}",
                self.attendance.duplicate_window_minutes
            )));
        }
        if self.service.background_interval_ms == 0 {
            return Err(RecognitionError::Other(anyhow::anyhow!(
                "Background interval must be at least 1 ms"
            )));
        }
        Ok(())
    }
}
