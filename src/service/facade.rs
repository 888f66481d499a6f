use crate::common::error::{RecognitionError, Result};
use crate::core::recognizer::{crop_region, FaceRecognizer};
use crate::core::Track;
use crate::service::orchestrator::Orchestrator;
use crate::service::protocol::{
    required_permission, Envelope, HealthInfo, Request, Response,
};
use crate::storage::attendance::{
    AttendanceStore, ExportFormat, MarkOutcome, MarkRequest, MarkedBy,
};
use crate::storage::face_store::{FaceEntry, FaceStore};
use chrono::Utc;
use image::RgbImage;
use std::sync::{Arc, Mutex};

/// The recognition service surface: every named operation of the control
/// protocol, with API-key authorization in front.
pub struct RecognitionService {
    orchestrator: Arc<Orchestrator>,
    face_store: FaceStore,
    recognizer: Arc<FaceRecognizer>,
    attendance: Arc<AttendanceStore>,
    /// One critical section covers "append to store" + "append to mirror"
    /// (and clear), so recognition always sees a consistent pair.
    registry_lock: Mutex<()>,
}

impl RecognitionService {
    /// Wire the facade up and prime the recognizer mirror straight from the
    /// stored encodings; face images are never re-decoded at load.
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        face_store: FaceStore,
        recognizer: Arc<FaceRecognizer>,
        attendance: Arc<AttendanceStore>,
    ) -> Result<Self> {
        let entries = face_store.list();
        recognizer.install(
            entries
                .iter()
                .map(|e| (e.name.clone(), e.person_id.clone(), e.encoding.clone())),
        )?;
        if !entries.is_empty() {
            tracing::info!(count = entries.len(), "Loaded known faces into recognizer");
        }

        Ok(Self {
            orchestrator,
            face_store,
            recognizer,
            attendance,
            registry_lock: Mutex::new(()),
        })
    }

    // ------------------------------------------------------------------ //
    // Core operations
    // ------------------------------------------------------------------ //

    pub fn register(&self, name: &str, person_id: &str, image: &[u8]) -> Result<(FaceEntry, usize)> {
        if name.trim().is_empty() {
            return Err(RecognitionError::BadRequest("Name is required".into()));
        }
        if person_id.trim().is_empty() {
            return Err(RecognitionError::BadRequest("Person ID is required".into()));
        }

        let entry = self.register_face(name.trim(), person_id.trim(), image)?;
        self.attendance.upsert_person(person_id.trim(), name.trim())?;
        tracing::info!(name = %entry.name, person_id = %entry.person_id, "Registered new face");
        Ok((entry, self.face_store.count()))
    }

    /// Add another exemplar for a person that already exists in the
    /// attendance store.
    pub fn register_face_for_existing(
        &self,
        person_id: &str,
        image: &[u8],
    ) -> Result<(FaceEntry, usize)> {
        let person = self.attendance.get_person(person_id)?;
        let entry = self.register_face(&person.name, person_id, image)?;
        tracing::info!(name = %entry.name, person_id = %person_id, "Added face exemplar");
        Ok((entry, self.face_store.count()))
    }

    fn register_face(&self, name: &str, person_id: &str, image: &[u8]) -> Result<FaceEntry> {
        let image = decode_image(image)?;
        let (face, encoding) = self.recognizer.register_encoding(&image)?;
        let face_crop = crop_region(&image, &face.bbox);

        let _guard = self.registry_lock.lock().unwrap();
        let entry = self
            .face_store
            .add(name, person_id, encoding.clone(), Some(&face_crop))?;
        self.recognizer.push(name, person_id, encoding)?;
        Ok(entry)
    }

    pub fn recognize(&self, image: Option<&[u8]>) -> Result<(Vec<Track>, usize)> {
        let decoded = match image {
            Some(bytes) if !bytes.is_empty() => Some(decode_image(bytes)?),
            _ => None,
        };
        self.orchestrator.recognize_now(decoded)
    }

    pub fn list_faces(&self) -> Vec<FaceEntry> {
        self.face_store.list()
    }

    pub fn clear_faces(&self) -> Result<()> {
        let _guard = self.registry_lock.lock().unwrap();
        self.face_store.clear()?;
        self.recognizer.clear();
        Ok(())
    }

    pub fn health(&self) -> HealthInfo {
        let (source, stream) = self.orchestrator.current_source();
        HealthInfo {
            status: "ok".to_string(),
            time: Utc::now().to_rfc3339(),
            faces: self.face_store.count(),
            current_source: source,
            stream,
            background_running: self.orchestrator.background_running(),
        }
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    // ------------------------------------------------------------------ //
    // Authorization
    // ------------------------------------------------------------------ //

    fn authorize(&self, api_key: Option<&str>, request: &Request) -> Result<()> {
        let Some(required) = required_permission(request) else {
            return Ok(());
        };
        let Some(key) = api_key else {
            return Err(RecognitionError::Unauthenticated);
        };

        if self.attendance.validate_api_key(key, Some(required))? {
            return Ok(());
        }
        // Valid key without the permission is forbidden, not unauthorized.
        if self.attendance.validate_api_key(key, None)? {
            Err(RecognitionError::PermissionDenied(required.to_string()))
        } else {
            Err(RecognitionError::Unauthenticated)
        }
    }

    // ------------------------------------------------------------------ //
    // Dispatch
    // ------------------------------------------------------------------ //

    /// Authorize and execute one request, folding every error into its
    /// status-coded response.
    pub fn handle(&self, envelope: &Envelope) -> Response {
        if let Err(e) = self.authorize(envelope.api_key.as_deref(), &envelope.request) {
            return Response::error(&e);
        }
        match self.dispatch(&envelope.request) {
            Ok(response) => response,
            Err(e) => {
                tracing::debug!("Request failed: {}", e);
                Response::error(&e)
            }
        }
    }

    fn dispatch(&self, request: &Request) -> Result<Response> {
        match request {
            Request::Register {
                name,
                person_id,
                image,
            } => {
                let (face, count) = self.register(name, person_id, image)?;
                Ok(Response::Registered { face, count })
            }
            Request::RegisterFace { person_id, image } => {
                let (face, count) = self.register_face_for_existing(person_id, image)?;
                Ok(Response::Registered { face, count })
            }
            Request::Recognize { image } => {
                let (tracks, active_tracks) = self.recognize(image.as_deref())?;
                Ok(Response::Tracks {
                    tracks,
                    active_tracks,
                })
            }
            Request::ListFaces => Ok(Response::Faces(self.list_faces())),
            Request::ClearFaces => {
                self.clear_faces()?;
                Ok(Response::Ok)
            }
            Request::ChangeSource { source, reset } => {
                self.orchestrator.change_source(source, *reset)?;
                Ok(Response::SourceChanged {
                    source: source.clone(),
                    reset: *reset,
                })
            }
            Request::ValidateSource { source } => {
                self.orchestrator.validate_source(source)?;
                Ok(Response::SourceValid {
                    source: source.clone(),
                })
            }
            Request::CurrentSource => {
                let (source, status) = self.orchestrator.current_source();
                Ok(Response::CurrentSource { source, status })
            }
            Request::BackgroundStatus => {
                Ok(Response::Background(self.orchestrator.background_status()))
            }
            Request::Stream => Ok(Response::StreamStarting),

            Request::PersonCreate(person) => {
                self.attendance.add_person(person)?;
                Ok(Response::Person(self.attendance.get_person(&person.person_id)?))
            }
            Request::PersonGet { person_id } => {
                Ok(Response::Person(self.attendance.get_person(person_id)?))
            }
            Request::PersonUpdate { person_id, patch } => {
                self.attendance.update_person(person_id, patch)?;
                Ok(Response::Person(self.attendance.get_person(person_id)?))
            }
            Request::PersonDelete { person_id } => {
                self.attendance.delete_person(person_id)?;
                Ok(Response::Ok)
            }
            Request::PersonList {
                status,
                limit,
                offset,
            } => Ok(Response::Persons(self.attendance.list_persons(
                status.as_deref(),
                limit.unwrap_or(100),
                offset.unwrap_or(0),
            )?)),

            Request::AttendanceMark {
                person_id,
                confidence,
                notes,
                metadata,
            } => {
                let request = MarkRequest {
                    person_id: person_id.clone(),
                    person_name: None,
                    confidence: confidence.unwrap_or(1.0),
                    source: Some("manual".to_string()),
                    marked_by: MarkedBy::Manual,
                    notes: notes.clone(),
                    metadata: metadata.clone(),
                };
                match self.attendance.mark(&request)? {
                    MarkOutcome::Marked(attendance_id) => Ok(Response::Marked { attendance_id }),
                    // Manual marks bypass suppression; this is unreachable
                    // but kept total.
                    MarkOutcome::Suppressed => Err(RecognitionError::BadRequest(
                        "Duplicate entry prevented".into(),
                    )),
                }
            }
            Request::AttendanceCheckout { attendance_id } => {
                Ok(Response::Attendance(self.attendance.checkout(*attendance_id)?))
            }
            Request::AttendanceGet { attendance_id } => {
                Ok(Response::Attendance(self.attendance.get(*attendance_id)?))
            }
            Request::AttendanceList(filters) => {
                Ok(Response::AttendanceListing(self.attendance.list(filters)?))
            }
            Request::AttendanceToday => {
                Ok(Response::AttendanceListing(self.attendance.today()?))
            }
            Request::AttendanceForPerson {
                person_id,
                start_date,
                end_date,
            } => Ok(Response::AttendanceListing(self.attendance.for_person(
                person_id,
                start_date.clone(),
                end_date.clone(),
            )?)),

            Request::Report {
                start_date,
                end_date,
                person_id,
            } => Ok(Response::Report {
                start_date: start_date.clone(),
                end_date: end_date.clone(),
                rows: self
                    .attendance
                    .report(start_date, end_date, person_id.as_deref())?,
            }),
            Request::DailySummary { date } => {
                Ok(Response::DailySummary(self.attendance.daily_summary(date)?))
            }
            Request::Export {
                start_date,
                end_date,
                format,
            } => {
                let parsed: ExportFormat = format.parse()?;
                Ok(Response::Export {
                    format: format.clone(),
                    data: self.attendance.export(start_date, end_date, parsed)?,
                })
            }

            Request::ConfigGet { key } => match key {
                Some(key) => {
                    let value = self
                        .attendance
                        .get_config(key)?
                        .ok_or_else(|| RecognitionError::BadRequest(format!("Unknown config key: {}", key)))?;
                    Ok(Response::Config(value))
                }
                None => Ok(Response::Config(self.attendance.list_config()?)),
            },
            Request::ConfigSet {
                key,
                value,
                description,
            } => {
                self.attendance.set_config(key, value, description.as_deref())?;
                Ok(Response::Ok)
            }
            Request::LogsList {
                level,
                category,
                limit,
            } => Ok(Response::Logs(self.attendance.get_logs(
                level.as_deref(),
                category.as_deref(),
                limit.unwrap_or(100),
            )?)),
            Request::Health => Ok(Response::Health(self.health())),
            Request::CreateApiKey {
                name,
                permissions,
                expires_days,
            } => {
                let api_key = self
                    .attendance
                    .create_api_key(name, permissions, *expires_days)?;
                Ok(Response::ApiKeyCreated { api_key })
            }
        }
    }
}

fn decode_image(bytes: &[u8]) -> Result<RgbImage> {
    let image = image::load_from_memory(bytes).map_err(|_| RecognitionError::InvalidImage)?;
    Ok(image.to_rgb8())
}
