use thiserror::Error;

#[derive(Error, Debug)]
pub enum RecognitionError {
    #[error("Failed to open source: {0}")]
    SourceOpenFailed(String),

    #[error("No frame available from stream")]
    FrameUnavailable,

    #[error("No face detected")]
    NoFace,

    #[error("Invalid image payload")]
    InvalidImage,

    #[error("Person not found: {0}")]
    PersonNotFound(String),

    #[error("Person already exists: {0}")]
    PersonAlreadyExists(String),

    #[error("Attendance record not found: {0}")]
    AttendanceNotFound(i64),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Missing or invalid API key")]
    Unauthenticated,

    #[error("Model error: {0}")]
    Model(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("ORT error: {0}")]
    Ort(#[from] ort::OrtError),

    #[error("OpenCV error: {0}")]
    OpenCv(#[from] opencv::Error),

    #[error("Database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, RecognitionError>;
