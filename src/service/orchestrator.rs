use crate::common::config::Config;
use crate::common::error::{RecognitionError, Result};
use crate::core::detector::PersonDetector;
use crate::core::recognizer::{crop_region, FaceRecognizer, MatchOutcome};
use crate::core::tracker::{FaceUpdate, Track, Tracker};
use crate::core::TrackStatus;
use crate::service::protocol::BackgroundStatus;
use crate::storage::attendance::{
    AttendanceStore, MarkOutcome, MarkRequest, MarkedBy, NewDetectionEvent,
};
use crate::storage::run_state::RunStateStore;
use crate::video::ingest::{FeedOpener, FeedStatus, Frame, FrameFeed};
use image::RgbImage;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

const BACKGROUND_JOIN_TIMEOUT: Duration = Duration::from_secs(1);
const STOP_POLL: Duration = Duration::from_millis(50);

/// Sequences frames through detector, tracker, and recognizer, and owns the
/// two loops that share them: the interactive path (never commits) and the
/// continuous background worker (commits attendance).
pub struct Orchestrator {
    cfg: Config,
    opener: Box<dyn FeedOpener>,
    feed: Mutex<Option<Box<dyn FrameFeed>>>,
    detector: PersonDetector,
    recognizer: Arc<FaceRecognizer>,
    tracker: Mutex<Tracker>,
    attendance: Arc<AttendanceStore>,
    run_state: RunStateStore,
    /// Serializes source switches; the loser of a race still applies
    /// atomically to the winner's state.
    source_lock: Mutex<()>,
    background: Mutex<Option<thread::JoinHandle<()>>>,
    stop_flag: Arc<AtomicBool>,
    /// Handle back to the owning Arc, for spawning the background worker.
    weak_self: Weak<Orchestrator>,
}

impl Orchestrator {
    pub fn new(
        cfg: Config,
        opener: Box<dyn FeedOpener>,
        detector: PersonDetector,
        recognizer: Arc<FaceRecognizer>,
        attendance: Arc<AttendanceStore>,
        run_state: RunStateStore,
    ) -> Arc<Self> {
        let tracker = Tracker::new(&cfg.tracker);
        Arc::new_cyclic(|weak| Self {
            cfg,
            opener,
            feed: Mutex::new(None),
            detector,
            recognizer,
            tracker: Mutex::new(tracker),
            attendance,
            run_state,
            source_lock: Mutex::new(()),
            background: Mutex::new(None),
            stop_flag: Arc::new(AtomicBool::new(false)),
            weak_self: weak.clone(),
        })
    }

    /// Consult the durable run state once and, if a source was active,
    /// reopen it and start the background worker before any request is
    /// served.
    pub fn resume_from_run_state(&self) -> Result<()> {
        let state = self.run_state.get();
        if !state.active {
            return Ok(());
        }
        let Some(source) = state.source else {
            return Ok(());
        };

        tracing::info!(source = %source, "Resuming stream from run state");
        match self.opener.open(&source) {
            Ok(feed) => {
                *self.feed.lock().unwrap() = Some(feed);
                self.ensure_background();
            }
            Err(e) => {
                // The source may come back; keep the run state so the next
                // restart tries again.
                tracing::warn!(source = %source, "Could not resume stream: {}", e);
            }
        }
        Ok(())
    }

    /// Switch the active source. The replacement is opened first so an
    /// OpenFailed leaves the current source running untouched.
    pub fn change_source(&self, source: &str, reset: bool) -> Result<()> {
        let _guard = self.source_lock.lock().unwrap();

        let new_feed = self.opener.open(source)?;
        let kind = new_feed.kind();

        {
            let mut feed = self.feed.lock().unwrap();
            if let Some(mut old) = feed.take() {
                tracing::info!(old = %old.uri(), new = %source, "Switching video source");
                old.close();
            }
            self.run_state.set_active(source, kind)?;
            *feed = Some(new_feed);
        }

        if reset {
            self.tracker.lock().unwrap().clear();
        }
        self.ensure_background();
        Ok(())
    }

    /// Open-close probe of a candidate source; the active feed is untouched.
    pub fn validate_source(&self, source: &str) -> Result<()> {
        self.opener.validate(source)
    }

    pub fn current_source(&self) -> (Option<String>, Option<FeedStatus>) {
        let feed = self.feed.lock().unwrap();
        match feed.as_ref() {
            Some(feed) => (Some(feed.uri().to_string()), Some(feed.status())),
            None => (self.run_state.get().source, None),
        }
    }

    pub fn background_status(&self) -> BackgroundStatus {
        let state = self.run_state.get();
        BackgroundStatus {
            active: state.active,
            source: state.source,
            source_type: state.source_type,
            background_running: self.background_running(),
        }
    }

    pub fn background_running(&self) -> bool {
        self.background
            .lock()
            .unwrap()
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    pub fn latest_frame(&self) -> Option<Arc<Frame>> {
        self.feed.lock().unwrap().as_ref().and_then(|f| f.latest_frame())
    }

    /// Interactive pass: run the pipeline on the given image, or on the
    /// latest frame when none is supplied. Attendance is never committed
    /// here.
    pub fn recognize_now(&self, image: Option<RgbImage>) -> Result<(Vec<Track>, usize)> {
        let image = match image {
            Some(image) => image,
            None => {
                let frame = self.latest_frame().ok_or(RecognitionError::FrameUnavailable)?;
                frame.image.clone()
            }
        };

        let tracks = self.process_frame(&image)?;
        let active = tracks.len();
        Ok((tracks, active))
    }

    /// One detector → tracker → recognizer pass. The tracker lock is held
    /// only for `update`/`apply_face`, never across model calls.
    fn process_frame(&self, image: &RgbImage) -> Result<Vec<Track>> {
        let detections = self.detector.detect(image)?;
        let live = { self.tracker.lock().unwrap().update(&detections) };

        for track in &live {
            if self.recognizer.may_skip(track) {
                continue;
            }

            let region = track.bbox.clamp_to(image.width(), image.height());
            if region.area() < 1.0 {
                continue;
            }
            let crop = crop_region(image, &region);

            match self.recognizer.analyze(&crop) {
                Ok(Some(observation)) => {
                    let face_bbox = observation
                        .face_bbox
                        .offset(region.x1, region.y1)
                        .clamp_to(image.width(), image.height());
                    let (matched, confidence) = match observation.outcome {
                        MatchOutcome::Known {
                            name,
                            person_id,
                            confidence,
                        } => (Some((name, person_id)), confidence),
                        MatchOutcome::Unknown { .. } => (None, 0.0),
                    };
                    self.tracker.lock().unwrap().apply_face(
                        track.track_id,
                        FaceUpdate {
                            face_bbox,
                            matched,
                            confidence,
                        },
                    );
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::debug!(track_id = track.track_id, "Face analysis failed: {}", e);
                }
            }
        }

        Ok(self.tracker.lock().unwrap().live())
    }

    /// Commit the frame's outcome: one attendance attempt per Known track
    /// (duplicates suppressed by the store) and a detection event for every
    /// live track.
    fn commit_tracks(&self, tracks: &[Track], source: &str) {
        for track in tracks {
            let mut attendance_id = None;

            if track.status == TrackStatus::Known {
                let (Some(name), Some(person_id)) = (&track.name, &track.person_id) else {
                    continue;
                };
                let request = MarkRequest {
                    person_id: person_id.clone(),
                    person_name: Some(name.clone()),
                    confidence: track.face_confidence as f64,
                    source: Some(source.to_string()),
                    marked_by: MarkedBy::Auto,
                    notes: None,
                    metadata: Some(serde_json::json!({
                        "track_id": track.track_id,
                        "frames_tracked": track.frames_tracked,
                    })),
                };
                match self.attendance.mark(&request) {
                    Ok(MarkOutcome::Marked(id)) => {
                        tracing::info!(person = %name, id, "Attendance marked");
                        attendance_id = Some(id);
                    }
                    Ok(MarkOutcome::Suppressed) => {
                        tracing::debug!(person = %name, "Attendance suppressed (duplicate window)");
                    }
                    Err(e) => {
                        tracing::error!(person = %name, "Attendance insert failed: {}", e);
                    }
                }
            }

            let event = NewDetectionEvent {
                person_id: track.person_id.clone(),
                person_name: track.name.clone().unwrap_or_else(|| "Unknown".to_string()),
                confidence: track.face_confidence as f64,
                source: Some(source.to_string()),
                attendance_id,
                metadata: Some(serde_json::json!({
                    "track_id": track.track_id,
                    "status": track.status,
                })),
            };
            if let Err(e) = self.attendance.log_detection(&event) {
                tracing::error!("Detection event insert failed: {}", e);
            }
        }
    }

    /// Start the background worker if it is not already running.
    pub fn ensure_background(&self) {
        let mut guard = self.background.lock().unwrap();
        if guard.as_ref().map(|h| !h.is_finished()).unwrap_or(false) {
            return;
        }

        let Some(orchestrator) = self.weak_self.upgrade() else {
            return;
        };
        self.stop_flag.store(false, Ordering::Release);
        match thread::Builder::new()
            .name("background-recognizer".into())
            .spawn(move || orchestrator.background_loop())
        {
            Ok(handle) => *guard = Some(handle),
            Err(e) => tracing::error!("Failed to start background worker: {}", e),
        }
    }

    fn background_loop(&self) {
        tracing::info!("Background recognition loop started");
        let interval = Duration::from_millis(self.cfg.service.background_interval_ms);

        while !self.stop_flag.load(Ordering::Acquire) {
            let started = Instant::now();

            if let Err(e) = self.background_iteration() {
                tracing::error!("Background iteration failed: {}", e);
            }

            // Cooperative cadence; the stop flag is observed within one
            // iteration.
            while started.elapsed() < interval {
                if self.stop_flag.load(Ordering::Acquire) {
                    tracing::info!("Background recognition loop stopped");
                    return;
                }
                thread::sleep(STOP_POLL.min(interval));
            }
        }
        tracing::info!("Background recognition loop stopped");
    }

    fn background_iteration(&self) -> Result<()> {
        let Some(frame) = self.latest_frame() else {
            return Ok(());
        };
        let tracks = self.process_frame(&frame.image)?;
        self.commit_tracks(&tracks, &frame.source);
        Ok(())
    }

    pub fn stop_background(&self) {
        self.stop_flag.store(true, Ordering::Release);
        if let Some(handle) = self.background.lock().unwrap().take() {
            let deadline = Instant::now() + BACKGROUND_JOIN_TIMEOUT;
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(10));
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                tracing::warn!("Background worker did not stop in time, abandoning");
            }
        }
    }

    /// Stop the loops and release the capture. The run state is left as-is
    /// so a restart resumes the stream.
    pub fn shutdown(&self) {
        self.stop_background();
        if let Some(mut feed) = self.feed.lock().unwrap().take() {
            feed.close();
        }
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.stop_background();
    }
}
