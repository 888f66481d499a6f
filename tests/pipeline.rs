//! End-to-end pipeline scenarios against stub model engines and a stub
//! video feed: registration and recognition, attendance commits with
//! duplicate suppression, source switching, and restart recovery.

use image::{Rgb, RgbImage};
use sightline::common::config::Config;
use sightline::core::recognizer::{Encoding, FaceBackend, FaceBox, FaceRecognizer, ENCODING_LEN};
use sightline::core::{BBox, Detection, PersonBackend, PersonDetector, TrackStatus};
use sightline::service::{Orchestrator, RecognitionService};
use sightline::storage::attendance::{AttendanceStore, MarkOutcome, MarkRequest, MarkedBy};
use sightline::storage::{FaceStore, RunStateStore};
use sightline::video::ingest::{FeedOpener, FeedStatus, Frame, FrameFeed};
use sightline::video::source::{SourceKind, SourceSpec};
use sightline::{RecognitionError, Result};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

// ---------------------------------------------------------------------- //
// Stub engines
// ---------------------------------------------------------------------- //

/// Sees one person filling most of any non-black image.
struct StubPersonBackend;

impl PersonBackend for StubPersonBackend {
    fn infer(&self, image: &RgbImage) -> Result<Vec<Detection>> {
        let lit = image.pixels().any(|p| p[0] > 0 || p[1] > 0 || p[2] > 0);
        if !lit {
            return Ok(vec![]);
        }
        Ok(vec![Detection {
            bbox: BBox::new(100.0, 50.0, 250.0, 420.0),
            confidence: 0.9,
        }])
    }
}

/// Finds one face in any non-black crop and encodes the crop's mean color,
/// so identical colors match at distance zero and different colors miss.
struct StubFaceBackend;

impl StubFaceBackend {
    fn mean_color(image: &RgbImage) -> [f32; 3] {
        let mut acc = [0f64; 3];
        let count = (image.width() * image.height()).max(1) as f64;
        for pixel in image.pixels() {
            for c in 0..3 {
                acc[c] += pixel[c] as f64;
            }
        }
        [
            (acc[0] / count / 255.0) as f32,
            (acc[1] / count / 255.0) as f32,
            (acc[2] / count / 255.0) as f32,
        ]
    }
}

impl FaceBackend for StubFaceBackend {
    fn detect(&self, image: &RgbImage, _upsample: u32) -> Result<Vec<FaceBox>> {
        let lit = image.pixels().any(|p| p[0] > 0 || p[1] > 0 || p[2] > 0);
        if !lit || image.width() < 100 || image.height() < 100 {
            return Ok(vec![]);
        }
        Ok(vec![FaceBox {
            bbox: BBox::new(10.0, 10.0, 90.0, 90.0),
            confidence: 0.85,
        }])
    }

    fn encode(&self, image: &RgbImage, _face: &FaceBox) -> Result<Encoding> {
        let mean = Self::mean_color(image);
        let mut encoding = vec![0.0; ENCODING_LEN];
        encoding[..3].copy_from_slice(&mean);
        Ok(encoding)
    }
}

// ---------------------------------------------------------------------- //
// Stub video feed
// ---------------------------------------------------------------------- //

struct StubFeed {
    uri: String,
    kind: SourceKind,
    frame: Arc<Mutex<Option<RgbImage>>>,
}

impl FrameFeed for StubFeed {
    fn latest_frame(&self) -> Option<Arc<Frame>> {
        self.frame.lock().unwrap().clone().map(|image| {
            Arc::new(Frame {
                image,
                captured_at: SystemTime::now(),
                source: self.uri.clone(),
            })
        })
    }

    fn status(&self) -> FeedStatus {
        FeedStatus {
            connected: true,
            alive: true,
            source_type: self.kind,
            width: 640,
            height: 480,
            fps: 30.0,
            reconnect_count: 0,
        }
    }

    fn uri(&self) -> &str {
        &self.uri
    }

    fn kind(&self) -> SourceKind {
        self.kind
    }

    fn close(&mut self) {}
}

/// Opens a green-frame feed for any URI except those starting with "bad".
struct StubOpener {
    frame: Arc<Mutex<Option<RgbImage>>>,
}

impl FeedOpener for StubOpener {
    fn open(&self, source: &str) -> Result<Box<dyn FrameFeed>> {
        if source.starts_with("bad") {
            return Err(RecognitionError::SourceOpenFailed(format!(
                "Cannot open source: {}",
                source
            )));
        }
        let spec = SourceSpec::parse(source);
        Ok(Box::new(StubFeed {
            uri: source.to_string(),
            kind: spec.kind,
            frame: Arc::clone(&self.frame),
        }))
    }

    fn validate(&self, source: &str) -> Result<()> {
        if source.starts_with("bad") {
            return Err(RecognitionError::SourceOpenFailed(format!(
                "Cannot open source: {}",
                source
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------- //
// Harness
// ---------------------------------------------------------------------- //

struct Harness {
    _tmp: tempfile::TempDir,
    service: RecognitionService,
    orchestrator: Arc<Orchestrator>,
    attendance: Arc<AttendanceStore>,
    live_frame: Arc<Mutex<Option<RgbImage>>>,
}

fn green_image() -> RgbImage {
    RgbImage::from_pixel(640, 480, Rgb([0, 200, 0]))
}

fn red_image() -> RgbImage {
    RgbImage::from_pixel(640, 480, Rgb([200, 0, 0]))
}

fn png_bytes(image: &RgbImage) -> Vec<u8> {
    let mut buffer = Vec::new();
    image::DynamicImage::ImageRgb8(image.clone())
        .write_to(
            &mut std::io::Cursor::new(&mut buffer),
            image::ImageOutputFormat::Png,
        )
        .unwrap();
    buffer
}

fn build_harness(configure: impl FnOnce(&mut Config)) -> Harness {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.service.background_interval_ms = 50;
    configure(&mut config);

    let detector = PersonDetector::new(Arc::new(StubPersonBackend), config.detector.clone());
    let recognizer = Arc::new(FaceRecognizer::new(
        Arc::new(StubFaceBackend),
        config.face.clone(),
    ));

    let face_store = FaceStore::open(
        tmp.path().join("faces.bin"),
        tmp.path().join("faces"),
    )
    .unwrap();
    let attendance = Arc::new(
        AttendanceStore::open(&tmp.path().join("attendance.db"), &config.attendance).unwrap(),
    );
    let run_state = RunStateStore::open(tmp.path().join("stream_state.json")).unwrap();

    let live_frame = Arc::new(Mutex::new(None));
    let opener = Box::new(StubOpener {
        frame: Arc::clone(&live_frame),
    });

    let orchestrator = Orchestrator::new(
        config,
        opener,
        detector,
        Arc::clone(&recognizer),
        Arc::clone(&attendance),
        run_state,
    );
    orchestrator.resume_from_run_state().unwrap();

    let service = RecognitionService::new(
        Arc::clone(&orchestrator),
        face_store,
        recognizer,
        Arc::clone(&attendance),
    )
    .unwrap();

    Harness {
        _tmp: tmp,
        service,
        orchestrator,
        attendance,
        live_frame,
    }
}

fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    check()
}

// ---------------------------------------------------------------------- //
// Scenarios
// ---------------------------------------------------------------------- //

#[test]
fn register_then_recognize_returns_one_known_track() {
    let h = build_harness(|_| {});
    let image = png_bytes(&green_image());

    let (entry, count) = h.service.register("Alice", "A1", &image).unwrap();
    assert_eq!(count, 1);
    assert_eq!(entry.name, "Alice");
    assert_eq!(entry.person_id, "A1");

    let (tracks, active) = h.service.recognize(Some(&image)).unwrap();
    assert_eq!(active, 1);
    assert_eq!(tracks.len(), 1);
    let track = &tracks[0];
    assert_eq!(track.track_id, 1);
    assert_eq!(track.status, TrackStatus::Known);
    assert_eq!(track.name.as_deref(), Some("Alice"));
    assert_eq!(track.person_id.as_deref(), Some("A1"));
    assert!(track.face_confidence >= 0.5, "got {}", track.face_confidence);
}

#[test]
fn registration_upserts_the_person_row() {
    let h = build_harness(|_| {});
    h.service
        .register("Alice", "A1", &png_bytes(&green_image()))
        .unwrap();
    let person = h.attendance.get_person("A1").unwrap();
    assert_eq!(person.name, "Alice");
}

#[test]
fn register_rejects_garbage_and_faceless_images() {
    let h = build_harness(|_| {});

    match h.service.register("Alice", "A1", b"not an image") {
        Err(RecognitionError::InvalidImage) => {}
        other => panic!("expected InvalidImage, got {:?}", other.map(|_| ())),
    }

    // A black frame has no detectable face.
    let black = png_bytes(&RgbImage::new(640, 480));
    match h.service.register("Alice", "A1", &black) {
        Err(RecognitionError::NoFace) => {}
        other => panic!("expected NoFace, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn unknown_face_stays_unknown_and_clear_faces_forgets() {
    let h = build_harness(|_| {});
    let green = png_bytes(&green_image());
    let red = png_bytes(&red_image());

    h.service.register("Alice", "A1", &green).unwrap();

    // A different face misses the store.
    let (tracks, _) = h.service.recognize(Some(&red)).unwrap();
    assert_eq!(tracks[0].status, TrackStatus::Unknown);

    h.service.clear_faces().unwrap();
    assert_eq!(h.service.list_faces().len(), 0);

    // With an empty store even the registered image cannot be Known. The
    // track is already live, so a fresh pass reports Unknown at best.
    let (tracks, _) = h.service.recognize(Some(&green)).unwrap();
    assert!(
        tracks
            .iter()
            .all(|t| matches!(t.status, TrackStatus::Tracking | TrackStatus::Unknown)),
        "got {:?}",
        tracks.iter().map(|t| t.status).collect::<Vec<_>>()
    );
}

#[test]
fn interactive_recognition_never_commits_attendance() {
    let h = build_harness(|_| {});
    let green = png_bytes(&green_image());
    h.service.register("Alice", "A1", &green).unwrap();

    h.service.recognize(Some(&green)).unwrap();
    h.service.recognize(Some(&green)).unwrap();

    assert!(h.attendance.today().unwrap().is_empty());
    assert_eq!(h.attendance.detection_count().unwrap(), 0);
}

#[test]
fn recognize_without_image_or_stream_reports_frame_unavailable() {
    let h = build_harness(|_| {});
    match h.service.recognize(None) {
        Err(RecognitionError::FrameUnavailable) => {}
        other => panic!("expected FrameUnavailable, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn background_loop_commits_once_within_duplicate_window() {
    let h = build_harness(|_| {});
    let green = green_image();
    h.service
        .register("Alice", "A1", &png_bytes(&green))
        .unwrap();

    *h.live_frame.lock().unwrap() = Some(green);
    h.orchestrator.change_source("rtsp://cam/live", true).unwrap();

    // Several iterations at the 50ms test cadence: one attendance row, many
    // detection events.
    assert!(wait_until(Duration::from_secs(3), || {
        h.attendance.detection_count().unwrap() >= 3
    }));

    let rows = h.attendance.today().unwrap();
    assert_eq!(rows.len(), 1, "duplicate suppression must hold");
    assert_eq!(rows[0].person_id, "A1");
    assert_eq!(rows[0].marked_by, "auto");
    assert_eq!(rows[0].source.as_deref(), Some("rtsp://cam/live"));

    h.orchestrator.stop_background();
}

#[test]
fn manual_marks_bypass_the_window_that_blocks_auto() {
    let h = build_harness(|_| {});
    h.attendance
        .upsert_person("A1", "Alice")
        .unwrap();

    let auto = MarkRequest {
        person_id: "A1".into(),
        person_name: None,
        confidence: 0.9,
        source: Some("test".into()),
        marked_by: MarkedBy::Auto,
        notes: None,
        metadata: None,
    };
    assert!(matches!(h.attendance.mark(&auto).unwrap(), MarkOutcome::Marked(_)));
    assert_eq!(h.attendance.mark(&auto).unwrap(), MarkOutcome::Suppressed);

    let manual = MarkRequest {
        marked_by: MarkedBy::Manual,
        ..auto
    };
    assert!(matches!(h.attendance.mark(&manual).unwrap(), MarkOutcome::Marked(_)));
}

#[test]
fn change_source_failure_leaves_the_active_source_intact() {
    let h = build_harness(|_| {});
    *h.live_frame.lock().unwrap() = Some(green_image());

    h.orchestrator.change_source("rtsp://cam/one", true).unwrap();
    let (source, _) = h.orchestrator.current_source();
    assert_eq!(source.as_deref(), Some("rtsp://cam/one"));

    match h.orchestrator.change_source("bad://nowhere", true) {
        Err(RecognitionError::SourceOpenFailed(_)) => {}
        other => panic!("expected SourceOpenFailed, got {:?}", other),
    }

    let (source, status) = h.orchestrator.current_source();
    assert_eq!(source.as_deref(), Some("rtsp://cam/one"));
    assert!(status.unwrap().connected);

    h.orchestrator.stop_background();
}

#[test]
fn validate_source_does_not_touch_the_active_feed() {
    let h = build_harness(|_| {});
    h.orchestrator.change_source("rtsp://cam/one", true).unwrap();

    for _ in 0..3 {
        h.orchestrator.validate_source("rtsp://cam/other").unwrap();
    }
    assert!(h.orchestrator.validate_source("bad://x").is_err());

    let (source, _) = h.orchestrator.current_source();
    assert_eq!(source.as_deref(), Some("rtsp://cam/one"));

    h.orchestrator.stop_background();
}

#[test]
fn restart_with_active_run_state_resumes_the_stream() {
    let tmp = tempfile::tempdir().unwrap();
    let state_path = tmp.path().join("stream_state.json");

    // A previous process activated an RTSP source.
    {
        let run_state = RunStateStore::open(state_path.clone()).unwrap();
        run_state
            .set_active("rtsp://example", SourceKind::Rtsp)
            .unwrap();
    }

    // "Restart": a fresh orchestrator over the same state file.
    let mut config = Config::default();
    config.service.background_interval_ms = 50;
    let detector = PersonDetector::new(Arc::new(StubPersonBackend), config.detector.clone());
    let recognizer = Arc::new(FaceRecognizer::new(
        Arc::new(StubFaceBackend),
        config.face.clone(),
    ));
    let attendance = Arc::new(
        AttendanceStore::open(&tmp.path().join("attendance.db"), &config.attendance).unwrap(),
    );
    let frame = Arc::new(Mutex::new(Some(green_image())));
    let orchestrator = Orchestrator::new(
        config,
        Box::new(StubOpener {
            frame: Arc::clone(&frame),
        }),
        detector,
        recognizer,
        attendance,
        RunStateStore::open(state_path).unwrap(),
    );

    orchestrator.resume_from_run_state().unwrap();

    assert!(wait_until(Duration::from_secs(5), || {
        orchestrator.background_status().background_running
    }));
    let status = orchestrator.background_status();
    assert!(status.active);
    assert_eq!(status.source.as_deref(), Some("rtsp://example"));
    assert_eq!(status.source_type, SourceKind::Rtsp);

    let (source, _) = orchestrator.current_source();
    assert_eq!(source.as_deref(), Some("rtsp://example"));

    orchestrator.stop_background();
}

#[test]
fn stopping_the_background_loop_is_prompt() {
    let h = build_harness(|_| {});
    *h.live_frame.lock().unwrap() = Some(green_image());
    h.orchestrator.change_source("0", true).unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        h.orchestrator.background_running()
    }));

    let started = Instant::now();
    h.orchestrator.stop_background();
    assert!(!h.orchestrator.background_running());
    assert!(started.elapsed() < Duration::from_millis(700));
}

#[test]
fn second_registration_is_an_extra_exemplar() {
    let h = build_harness(|_| {});
    let green = png_bytes(&green_image());
    h.service.register("Alice", "A1", &green).unwrap();
    let (_, count) = h
        .service
        .register_face_for_existing("A1", &green)
        .unwrap();
    assert_eq!(count, 2);

    match h.service.register_face_for_existing("nobody", &green) {
        Err(RecognitionError::PersonNotFound(_)) => {}
        other => panic!("expected PersonNotFound, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn face_store_survives_a_service_restart() {
    let tmp = tempfile::tempdir().unwrap();
    let green = png_bytes(&green_image());
    let mut config = Config::default();
    config.service.background_interval_ms = 50;

    let build = |config: &Config| -> RecognitionService {
        let detector = PersonDetector::new(Arc::new(StubPersonBackend), config.detector.clone());
        let recognizer = Arc::new(FaceRecognizer::new(
            Arc::new(StubFaceBackend),
            config.face.clone(),
        ));
        let face_store =
            FaceStore::open(tmp.path().join("faces.bin"), tmp.path().join("faces")).unwrap();
        let attendance = Arc::new(
            AttendanceStore::open(&tmp.path().join("attendance.db"), &config.attendance).unwrap(),
        );
        let orchestrator = Orchestrator::new(
            config.clone(),
            Box::new(StubOpener {
                frame: Arc::new(Mutex::new(None)),
            }),
            detector,
            Arc::clone(&recognizer),
            Arc::clone(&attendance),
            RunStateStore::open(tmp.path().join("stream_state.json")).unwrap(),
        );
        RecognitionService::new(orchestrator, face_store, recognizer, attendance).unwrap()
    };

    {
        let service = build(&config);
        service.register("Alice", "A1", &green).unwrap();
    }

    // Mirror is primed from stored encodings at startup; recognition works
    // without any re-registration.
    let service = build(&config);
    assert_eq!(service.list_faces().len(), 1);
    let (tracks, _) = service.recognize(Some(&green)).unwrap();
    assert_eq!(tracks[0].status, TrackStatus::Known);
    assert_eq!(tracks[0].name.as_deref(), Some("Alice"));
}
