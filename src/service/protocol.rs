use crate::common::error::{RecognitionError, Result};
use crate::core::tracker::Track;
use crate::storage::attendance::{
    AttendanceFilters, AttendanceRecord, DailySummary, LogRow, NewPerson, Person, PersonPatch,
    ReportRow,
};
use crate::storage::face_store::FaceEntry;
use crate::video::ingest::FeedStatus;
use crate::video::source::SourceKind;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::{Read, Write};

/// Frame type prefixes on the wire: a single final response, or a sequence
/// of stream updates terminated by a response.
pub const MSG_TYPE_RESPONSE: u8 = 0;
pub const MSG_TYPE_STREAM: u8 = 1;

/// Registration images arrive inline; anything bigger than this is abuse.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// One request plus the caller's credential.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Envelope {
    pub api_key: Option<String>,
    pub request: Request,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum Request {
    // Core recognition & sources.
    Register {
        name: String,
        person_id: String,
        image: Vec<u8>,
    },
    RegisterFace {
        person_id: String,
        image: Vec<u8>,
    },
    Recognize {
        image: Option<Vec<u8>>,
    },
    ListFaces,
    ClearFaces,
    ChangeSource {
        source: String,
        reset: bool,
    },
    ValidateSource {
        source: String,
    },
    CurrentSource,
    BackgroundStatus,
    /// Continuous JPEG push of the latest frame until the client hangs up.
    Stream,

    // People.
    PersonCreate(NewPerson),
    PersonGet {
        person_id: String,
    },
    PersonUpdate {
        person_id: String,
        patch: PersonPatch,
    },
    PersonDelete {
        person_id: String,
    },
    PersonList {
        status: Option<String>,
        limit: Option<u32>,
        offset: Option<u32>,
    },

    // Attendance.
    AttendanceMark {
        person_id: String,
        confidence: Option<f64>,
        notes: Option<String>,
        metadata: Option<Value>,
    },
    AttendanceCheckout {
        attendance_id: i64,
    },
    AttendanceGet {
        attendance_id: i64,
    },
    AttendanceList(AttendanceFilters),
    AttendanceToday,
    AttendanceForPerson {
        person_id: String,
        start_date: Option<String>,
        end_date: Option<String>,
    },

    // Reports.
    Report {
        start_date: String,
        end_date: String,
        person_id: Option<String>,
    },
    DailySummary {
        date: String,
    },
    Export {
        start_date: String,
        end_date: String,
        format: String,
    },

    // Config, logs, health, auth.
    ConfigGet {
        key: Option<String>,
    },
    ConfigSet {
        key: String,
        value: Value,
        description: Option<String>,
    },
    LogsList {
        level: Option<String>,
        category: Option<String>,
        limit: Option<u32>,
    },
    Health,
    CreateApiKey {
        name: String,
        permissions: Vec<String>,
        expires_days: Option<i64>,
    },
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OpStatus {
    Ok,
    BadRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    Conflict,
    Unprocessable,
    Internal,
    NotImplemented,
}

impl OpStatus {
    pub fn for_error(err: &RecognitionError) -> OpStatus {
        match err {
            RecognitionError::BadRequest(_) | RecognitionError::InvalidImage => OpStatus::BadRequest,
            RecognitionError::Unauthenticated => OpStatus::Unauthorized,
            RecognitionError::PermissionDenied(_) => OpStatus::Forbidden,
            RecognitionError::PersonNotFound(_) | RecognitionError::AttendanceNotFound(_) => {
                OpStatus::NotFound
            }
            RecognitionError::PersonAlreadyExists(_) => OpStatus::Conflict,
            RecognitionError::NoFace => OpStatus::Unprocessable,
            RecognitionError::SourceOpenFailed(_) | RecognitionError::FrameUnavailable => {
                OpStatus::Unprocessable
            }
            _ => OpStatus::Internal,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct BackgroundStatus {
    pub active: bool,
    pub source: Option<String>,
    pub source_type: SourceKind,
    pub background_running: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct HealthInfo {
    pub status: String,
    pub time: String,
    pub faces: usize,
    pub current_source: Option<String>,
    pub stream: Option<FeedStatus>,
    pub background_running: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum Response {
    Registered {
        face: FaceEntry,
        count: usize,
    },
    Tracks {
        tracks: Vec<Track>,
        active_tracks: usize,
    },
    Faces(Vec<FaceEntry>),
    SourceChanged {
        source: String,
        reset: bool,
    },
    SourceValid {
        source: String,
    },
    CurrentSource {
        source: Option<String>,
        status: Option<FeedStatus>,
    },
    Background(BackgroundStatus),
    /// Acknowledged; JPEG stream messages follow.
    StreamStarting,
    Person(Person),
    Persons(Vec<Person>),
    Marked {
        attendance_id: i64,
    },
    Attendance(AttendanceRecord),
    AttendanceListing(Vec<AttendanceRecord>),
    Report {
        start_date: String,
        end_date: String,
        rows: Vec<ReportRow>,
    },
    DailySummary(DailySummary),
    Export {
        format: String,
        data: String,
    },
    Config(Value),
    Logs(Vec<LogRow>),
    Health(HealthInfo),
    ApiKeyCreated {
        api_key: String,
    },
    Ok,
    Error {
        status: OpStatus,
        message: String,
    },
}

impl Response {
    pub fn error(err: &RecognitionError) -> Response {
        Response::Error {
            status: OpStatus::for_error(err),
            message: err.to_string(),
        }
    }
}

/// Pushed between the `StreamStarting` ack and the connection close.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum StreamMessage {
    Jpeg { data: Vec<u8>, captured_at: String },
}

/// Which permission an operation needs; `None` means unauthenticated access
/// is allowed.
pub fn required_permission(request: &Request) -> Option<&'static str> {
    match request {
        Request::Health => None,

        Request::Register { .. } | Request::RegisterFace { .. } => Some("person:write"),
        Request::ListFaces => Some("person:read"),
        Request::ClearFaces => Some("admin"),

        Request::Recognize { .. }
        | Request::CurrentSource
        | Request::BackgroundStatus
        | Request::Stream => Some("system:read"),
        Request::ChangeSource { .. } | Request::ValidateSource { .. } => Some("system:write"),

        Request::PersonCreate(_) | Request::PersonUpdate { .. } | Request::PersonDelete { .. } => {
            Some("person:write")
        }
        Request::PersonGet { .. } | Request::PersonList { .. } => Some("person:read"),

        Request::AttendanceMark { .. } | Request::AttendanceCheckout { .. } => {
            Some("attendance:write")
        }
        Request::AttendanceGet { .. }
        | Request::AttendanceList(_)
        | Request::AttendanceToday
        | Request::AttendanceForPerson { .. } => Some("attendance:read"),

        Request::Report { .. } | Request::DailySummary { .. } | Request::Export { .. } => {
            Some("reports:read")
        }

        Request::ConfigGet { .. } => Some("config:read"),
        Request::ConfigSet { .. } => Some("config:write"),
        Request::LogsList { .. } => Some("logs:read"),
        Request::CreateApiKey { .. } => Some("admin"),
    }
}

/// Length-prefixed bincode framing shared by the daemon and the client.
pub fn write_frame<W: Write, T: Serialize>(writer: &mut W, msg_type: u8, value: &T) -> Result<()> {
    let data = bincode::serialize(value)
        .map_err(|e| RecognitionError::Storage(format!("Failed to serialize frame: {}", e)))?;
    writer.write_all(&[msg_type])?;
    writer.write_all(&(data.len() as u32).to_le_bytes())?;
    writer.write_all(&data)?;
    writer.flush()?;
    Ok(())
}

/// The frame type tag plus the undecoded payload; bincode is not
/// self-describing, so the tag decides which type to decode into.
pub fn read_raw_frame<R: Read>(reader: &mut R) -> Result<(u8, Vec<u8>)> {
    let mut msg_type = [0u8; 1];
    reader.read_exact(&mut msg_type)?;

    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf)?;
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(RecognitionError::BadRequest(format!(
            "Frame too large: {} bytes",
            len
        )));
    }

    let mut data = vec![0u8; len];
    reader.read_exact(&mut data)?;
    Ok((msg_type[0], data))
}

pub fn read_frame<R: Read, T: for<'de> Deserialize<'de>>(reader: &mut R) -> Result<(u8, T)> {
    let (msg_type, data) = read_raw_frame(reader)?;
    let value = bincode::deserialize(&data)
        .map_err(|e| RecognitionError::Storage(format!("Failed to deserialize frame: {}", e)))?;
    Ok((msg_type, value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_round_trip() {
        let mut buf = Vec::new();
        let envelope = Envelope {
            api_key: Some("key".into()),
            request: Request::Recognize { image: None },
        };
        write_frame(&mut buf, MSG_TYPE_RESPONSE, &envelope).unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let (msg_type, decoded): (u8, Envelope) = read_frame(&mut cursor).unwrap();
        assert_eq!(msg_type, MSG_TYPE_RESPONSE);
        assert_eq!(decoded.api_key.as_deref(), Some("key"));
        assert!(matches!(decoded.request, Request::Recognize { image: None }));
    }

    #[test]
    fn oversized_frames_are_rejected() {
        let mut buf = vec![MSG_TYPE_RESPONSE];
        buf.extend_from_slice(&(u32::MAX).to_le_bytes());
        let mut cursor = std::io::Cursor::new(buf);
        let result: Result<(u8, Envelope)> = read_frame(&mut cursor);
        assert!(result.is_err());
    }

    #[test]
    fn health_is_open_everything_else_is_gated() {
        assert_eq!(required_permission(&Request::Health), None);
        assert_eq!(
            required_permission(&Request::AttendanceToday),
            Some("attendance:read")
        );
        assert_eq!(
            required_permission(&Request::ClearFaces),
            Some("admin")
        );
        assert_eq!(
            required_permission(&Request::ChangeSource {
                source: "0".into(),
                reset: true
            }),
            Some("system:write")
        );
    }

    #[test]
    fn error_statuses_map_by_kind() {
        assert_eq!(
            OpStatus::for_error(&RecognitionError::NoFace),
            OpStatus::Unprocessable
        );
        assert_eq!(
            OpStatus::for_error(&RecognitionError::PersonNotFound("x".into())),
            OpStatus::NotFound
        );
        assert_eq!(
            OpStatus::for_error(&RecognitionError::PersonAlreadyExists("x".into())),
            OpStatus::Conflict
        );
        assert_eq!(
            OpStatus::for_error(&RecognitionError::Unauthenticated),
            OpStatus::Unauthorized
        );
    }
}
