use serde::{Deserialize, Serialize};
use std::fmt;

const FILE_EXTENSIONS: &[&str] = &[".mp4", ".avi", ".mkv", ".mov", ".flv"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Webcam,
    Rtsp,
    Http,
    Rtmp,
    File,
    Unknown,
}

impl SourceKind {
    /// Live sources reconnect on read failure; files seek back to the start.
    pub fn is_live(self) -> bool {
        !matches!(self, SourceKind::File)
    }

    pub fn reconnects(self) -> bool {
        matches!(self, SourceKind::Rtsp | SourceKind::Http | SourceKind::Rtmp | SourceKind::Unknown)
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SourceKind::Webcam => "webcam",
            SourceKind::Rtsp => "rtsp",
            SourceKind::Http => "http",
            SourceKind::Rtmp => "rtmp",
            SourceKind::File => "file",
            SourceKind::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// A classified video source: either a local capture device index or a
/// URI/path string.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceSpec {
    pub kind: SourceKind,
    pub uri: String,
    pub device_index: Option<i32>,
}

impl SourceSpec {
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if let Ok(index) = trimmed.parse::<i32>() {
            return Self {
                kind: SourceKind::Webcam,
                uri: trimmed.to_string(),
                device_index: Some(index),
            };
        }

        let lower = trimmed.to_ascii_lowercase();
        let kind = if lower.starts_with("rtsp://") {
            SourceKind::Rtsp
        } else if lower.starts_with("http://") || lower.starts_with("https://") {
            SourceKind::Http
        } else if lower.starts_with("rtmp://") {
            SourceKind::Rtmp
        } else if FILE_EXTENSIONS.iter().any(|ext| lower.ends_with(ext)) {
            SourceKind::File
        } else {
            SourceKind::Unknown
        };

        Self {
            kind,
            uri: trimmed.to_string(),
            device_index: None,
        }
    }

    pub fn describe(&self) -> String {
        match self.kind {
            SourceKind::Webcam => format!("Webcam {}", self.uri),
            SourceKind::Rtsp => "RTSP stream".to_string(),
            SourceKind::Http => "HTTP stream".to_string(),
            SourceKind::Rtmp => "RTMP stream".to_string(),
            SourceKind::File => "Video file".to_string(),
            SourceKind::Unknown => "Unknown source".to_string(),
        }
    }
}
