pub mod common;
pub mod core;
pub mod service;
pub mod storage;
pub mod video;

// Re-export commonly used types
pub use crate::common::{Config, DataDirs, RecognitionError, Result};
pub use crate::core::{
    BBox, Detection, Encoding, FaceBackend, FaceRecognizer, OnnxFaceEngine, PersonBackend,
    PersonDetector, Track, TrackStatus, Tracker, YoloPersonDetector, ENCODING_LEN,
};
pub use crate::service::{Orchestrator, RecognitionService, ServiceClient};
pub use crate::storage::{AttendanceStore, FaceEntry, FaceStore, RunState, RunStateStore};
pub use crate::video::{
    CaptureOpener, FeedOpener, FeedStatus, Frame, FrameFeed, SourceKind, SourceSpec, VideoIngestor,
};
