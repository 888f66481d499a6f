use crate::common::config::VideoConfig;
use crate::common::error::{RecognitionError, Result};
use crate::video::source::{SourceKind, SourceSpec};
use image::RgbImage;
use opencv::core::{Mat, Size};
use opencv::prelude::*;
use opencv::{imgproc, videoio};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

/// A stream is considered alive if it produced a frame this recently.
const ALIVE_WINDOW: Duration = Duration::from_secs(5);
/// Buffered RTSP frames grabbed without decode before each retrieve, so the
/// decoded frame is the most recent available.
const RTSP_GRAB_SKIP: u32 = 3;
const RTSP_READ_SLEEP: Duration = Duration::from_millis(1);
const DEFAULT_READ_SLEEP: Duration = Duration::from_millis(10);
const FAILURE_SLEEP: Duration = Duration::from_millis(200);
/// Consecutive read failures tolerated before a live source reconnects.
const MAX_CONSECUTIVE_FAILURES: u32 = 30;
const CLOSE_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

const RTSP_CAPTURE_OPTIONS: &str = "rtsp_transport;tcp|rtsp_flags;prefer_tcp|\
buffer_size;1024000|max_delay;500000|stimeout;5000000";

/// One decoded frame. Immutable once produced.
#[derive(Debug, Clone)]
pub struct Frame {
    pub image: RgbImage,
    pub captured_at: SystemTime,
    pub source: String,
}

impl Frame {
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedStatus {
    pub connected: bool,
    pub alive: bool,
    pub source_type: SourceKind,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub reconnect_count: u32,
}

/// The orchestrator's view of a live video source: non-blocking access to
/// the latest decoded frame plus health reporting.
pub trait FrameFeed: Send {
    fn latest_frame(&self) -> Option<Arc<Frame>>;
    fn status(&self) -> FeedStatus;
    fn uri(&self) -> &str;
    fn kind(&self) -> SourceKind;
    fn close(&mut self);
}

/// Factory for feeds, so source switching and validation go through one seam.
pub trait FeedOpener: Send + Sync {
    fn open(&self, source: &str) -> Result<Box<dyn FrameFeed>>;
    fn validate(&self, source: &str) -> Result<()>;
}

#[derive(Debug, Default)]
struct StreamInfo {
    width: u32,
    height: u32,
    fps: f64,
}

struct Shared {
    latest: Mutex<Option<Arc<Frame>>>,
    last_frame_at: Mutex<Option<Instant>>,
    info: Mutex<StreamInfo>,
    running: AtomicBool,
    connected: AtomicBool,
    reconnects: AtomicU32,
    downscale_logged: AtomicBool,
}

impl Shared {
    fn new() -> Self {
        Self {
            latest: Mutex::new(None),
            last_frame_at: Mutex::new(None),
            info: Mutex::new(StreamInfo::default()),
            running: AtomicBool::new(true),
            connected: AtomicBool::new(false),
            reconnects: AtomicU32::new(0),
            downscale_logged: AtomicBool::new(false),
        }
    }
}

/// Video ingestor backed by an OpenCV capture and a dedicated reader thread.
pub struct VideoIngestor {
    spec: SourceSpec,
    shared: Arc<Shared>,
    handle: Option<thread::JoinHandle<()>>,
}

impl VideoIngestor {
    /// Open the source and start the reader. Opening is bounded by the
    /// configured open timeout; network sources are never read synchronously
    /// here, the reader thread produces the first frame.
    pub fn open(source: &str, cfg: &VideoConfig) -> Result<Self> {
        let spec = SourceSpec::parse(source);
        let timeout = Duration::from_secs_f64(cfg.open_timeout_secs);

        let capture = {
            let spec = spec.clone();
            let cfg = cfg.clone();
            run_bounded(timeout, move || open_capture(&spec, &cfg))?
        };

        let shared = Arc::new(Shared::new());
        {
            let mut info = shared.info.lock().unwrap();
            info.width = capture.get(videoio::CAP_PROP_FRAME_WIDTH).unwrap_or(0.0) as u32;
            info.height = capture.get(videoio::CAP_PROP_FRAME_HEIGHT).unwrap_or(0.0) as u32;
            let fps = capture.get(videoio::CAP_PROP_FPS).unwrap_or(0.0);
            info.fps = if fps > 0.0 { fps } else { 30.0 };
        }
        shared.connected.store(true, Ordering::Release);

        tracing::info!(
            source = %spec.uri,
            kind = %spec.kind,
            "Opened video source ({})",
            spec.describe()
        );

        let handle = {
            let spec = spec.clone();
            let cfg = cfg.clone();
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("video-reader".into())
                .spawn(move || reader_loop(capture, spec, cfg, shared))?
        };

        Ok(Self {
            spec,
            shared,
            handle: Some(handle),
        })
    }
}

impl FrameFeed for VideoIngestor {
    fn latest_frame(&self) -> Option<Arc<Frame>> {
        self.shared.latest.lock().unwrap().clone()
    }

    fn status(&self) -> FeedStatus {
        let connected = self.shared.connected.load(Ordering::Acquire);
        let alive = connected
            && match *self.shared.last_frame_at.lock().unwrap() {
                Some(at) => at.elapsed() < ALIVE_WINDOW,
                None => true,
            };
        let info = self.shared.info.lock().unwrap();
        FeedStatus {
            connected,
            alive,
            source_type: self.spec.kind,
            width: info.width,
            height: info.height,
            fps: info.fps,
            reconnect_count: self.shared.reconnects.load(Ordering::Acquire),
        }
    }

    fn uri(&self) -> &str {
        &self.spec.uri
    }

    fn kind(&self) -> SourceKind {
        self.spec.kind
    }

    fn close(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        self.shared.connected.store(false, Ordering::Release);

        if let Some(handle) = self.handle.take() {
            let deadline = Instant::now() + CLOSE_JOIN_TIMEOUT;
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(10));
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                // Reader is stuck in a blocking decode; abandon it. It will
                // exit on its next loop check and a fresh reader is spawned
                // by the next open.
                tracing::warn!(source = %self.spec.uri, "Reader thread did not stop in time, abandoning");
            }
        }
    }
}

impl Drop for VideoIngestor {
    fn drop(&mut self) {
        self.close();
    }
}

/// Opens the given feed just long enough to prove it produces, then closes
/// it. Never touches an active ingestor.
pub fn validate_source(source: &str, cfg: &VideoConfig) -> Result<()> {
    let spec = SourceSpec::parse(source);
    let timeout = Duration::from_secs_f64(cfg.open_timeout_secs);
    let cfg = cfg.clone();
    run_bounded(timeout, move || {
        let mut capture = open_capture(&spec, &cfg)?;
        // RTSP first-frame decodes can stall far past the socket timeout, so
        // validation of network streams stops at a successful open.
        if !matches!(spec.kind, SourceKind::Rtsp | SourceKind::Rtmp) {
            let grabbed = capture.grab()?;
            if !grabbed {
                return Err(RecognitionError::SourceOpenFailed(format!(
                    "Cannot read from source: {}",
                    spec.uri
                )));
            }
        }
        capture.release()?;
        Ok(())
    })
}

/// Default production opener wrapping [`VideoIngestor`].
pub struct CaptureOpener {
    cfg: VideoConfig,
}

impl CaptureOpener {
    pub fn new(cfg: VideoConfig) -> Self {
        Self { cfg }
    }
}

impl FeedOpener for CaptureOpener {
    fn open(&self, source: &str) -> Result<Box<dyn FrameFeed>> {
        Ok(Box::new(VideoIngestor::open(source, &self.cfg)?))
    }

    fn validate(&self, source: &str) -> Result<()> {
        validate_source(source, &self.cfg)
    }
}

/// Run `f` on a helper thread, giving up after `timeout`. An expired helper
/// is left to finish and drop its capture on its own.
fn run_bounded<T, F>(timeout: Duration, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    thread::Builder::new()
        .name("video-open".into())
        .spawn(move || {
            let _ = tx.send(f());
        })?;

    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(_) => Err(RecognitionError::SourceOpenFailed(format!(
            "Open timed out after {:.1}s",
            timeout.as_secs_f64()
        ))),
    }
}

fn open_capture(spec: &SourceSpec, cfg: &VideoConfig) -> Result<videoio::VideoCapture> {
    let mut capture = match spec.kind {
        SourceKind::Rtsp => {
            std::env::set_var("OPENCV_FFMPEG_CAPTURE_OPTIONS", RTSP_CAPTURE_OPTIONS);
            videoio::VideoCapture::from_file(&spec.uri, videoio::CAP_FFMPEG)?
        }
        SourceKind::Webcam => {
            videoio::VideoCapture::new(spec.device_index.unwrap_or(0), videoio::CAP_ANY)?
        }
        _ => videoio::VideoCapture::from_file(&spec.uri, videoio::CAP_ANY)?,
    };

    if !capture.is_opened()? {
        return Err(RecognitionError::SourceOpenFailed(format!(
            "Cannot open source: {}",
            spec.uri
        )));
    }

    match spec.kind {
        SourceKind::Rtsp => {
            let _ = capture.set(videoio::CAP_PROP_BUFFERSIZE, 1.0)?;
            let _ = capture.set(videoio::CAP_PROP_OPEN_TIMEOUT_MSEC, 3000.0)?;
            let _ = capture.set(videoio::CAP_PROP_READ_TIMEOUT_MSEC, 3000.0)?;
        }
        SourceKind::Webcam => {
            let _ = capture.set(videoio::CAP_PROP_BUFFERSIZE, cfg.buffer_size as f64)?;
        }
        _ => {}
    }

    Ok(capture)
}

fn reader_loop(
    mut capture: videoio::VideoCapture,
    spec: SourceSpec,
    cfg: VideoConfig,
    shared: Arc<Shared>,
) {
    let mut consecutive_failures = 0u32;
    let read_sleep = if spec.kind == SourceKind::Rtsp {
        RTSP_READ_SLEEP
    } else {
        DEFAULT_READ_SLEEP
    };

    while shared.running.load(Ordering::Acquire) {
        match read_frame(&mut capture, spec.kind) {
            Ok(Some(mat)) => {
                consecutive_failures = 0;
                if let Err(e) = publish_frame(mat, &spec, &cfg, &shared) {
                    tracing::error!(source = %spec.uri, "Failed to publish frame: {}", e);
                }
                thread::sleep(read_sleep);
            }
            Ok(None) => {
                if spec.kind == SourceKind::File {
                    // Looped playback: rewind instead of reconnecting.
                    let _ = capture.set(videoio::CAP_PROP_POS_FRAMES, 0.0);
                    continue;
                }
                consecutive_failures += 1;
                if !handle_read_failure(&mut capture, &spec, &cfg, &shared, &mut consecutive_failures) {
                    break;
                }
            }
            Err(e) => {
                tracing::debug!(source = %spec.uri, "Frame read error: {}", e);
                consecutive_failures += 1;
                if !handle_read_failure(&mut capture, &spec, &cfg, &shared, &mut consecutive_failures) {
                    break;
                }
            }
        }
    }

    let _ = capture.release();
    shared.connected.store(false, Ordering::Release);
    tracing::debug!(source = %spec.uri, "Reader thread stopped");
}

/// Returns false when the source is dead and the reader should exit.
fn handle_read_failure(
    capture: &mut videoio::VideoCapture,
    spec: &SourceSpec,
    cfg: &VideoConfig,
    shared: &Arc<Shared>,
    consecutive_failures: &mut u32,
) -> bool {
    if !spec.kind.reconnects() {
        if *consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
            tracing::warn!(source = %spec.uri, "Local source stopped producing, reporting dead");
            shared.connected.store(false, Ordering::Release);
            return false;
        }
        thread::sleep(FAILURE_SLEEP);
        return true;
    }

    if *consecutive_failures < MAX_CONSECUTIVE_FAILURES {
        thread::sleep(FAILURE_SLEEP);
        return true;
    }

    *consecutive_failures = 0;
    shared.connected.store(false, Ordering::Release);
    let attempt = shared.reconnects.fetch_add(1, Ordering::AcqRel) + 1;
    tracing::warn!(source = %spec.uri, attempt, "Stream read failing, reconnecting");

    let _ = capture.release();
    if !sleep_while_running(shared, Duration::from_secs_f64(cfg.reconnect_delay_secs)) {
        return false;
    }

    match open_capture(spec, cfg) {
        Ok(new_capture) => {
            *capture = new_capture;
            shared.connected.store(true, Ordering::Release);
            tracing::info!(source = %spec.uri, "Reconnected");
        }
        Err(e) => {
            tracing::warn!(source = %spec.uri, "Reconnect failed: {}", e);
        }
    }
    true
}

fn sleep_while_running(shared: &Arc<Shared>, total: Duration) -> bool {
    let deadline = Instant::now() + total;
    while Instant::now() < deadline {
        if !shared.running.load(Ordering::Acquire) {
            return false;
        }
        thread::sleep(Duration::from_millis(50));
    }
    shared.running.load(Ordering::Acquire)
}

fn read_frame(capture: &mut videoio::VideoCapture, kind: SourceKind) -> Result<Option<Mat>> {
    let mut mat = Mat::default();
    if kind == SourceKind::Rtsp {
        for _ in 0..RTSP_GRAB_SKIP {
            if !capture.grab()? {
                return Ok(None);
            }
        }
        if !capture.retrieve(&mut mat, 0)? {
            return Ok(None);
        }
    } else if !capture.read(&mut mat)? {
        return Ok(None);
    }

    if mat.empty() {
        return Ok(None);
    }
    Ok(Some(mat))
}

fn publish_frame(mat: Mat, spec: &SourceSpec, cfg: &VideoConfig, shared: &Arc<Shared>) -> Result<()> {
    let w = mat.cols() as u32;
    let h = mat.rows() as u32;

    let mat = match downscale_dims(w, h, cfg.max_width, cfg.max_height) {
        Some((new_w, new_h)) => {
            let mut scaled = Mat::default();
            imgproc::resize(
                &mat,
                &mut scaled,
                Size::new(new_w as i32, new_h as i32),
                0.0,
                0.0,
                imgproc::INTER_AREA,
            )?;
            if !shared.downscale_logged.swap(true, Ordering::AcqRel) {
                tracing::info!(
                    source = %spec.uri,
                    "Auto-downscaling {}x{} -> {}x{} (max {}x{})",
                    w, h, new_w, new_h, cfg.max_width, cfg.max_height
                );
            }
            scaled
        }
        None => mat,
    };

    let image = mat_to_rgb(&mat)?;
    {
        let mut info = shared.info.lock().unwrap();
        info.width = image.width();
        info.height = image.height();
    }

    let frame = Arc::new(Frame {
        image,
        captured_at: SystemTime::now(),
        source: spec.uri.clone(),
    });
    *shared.latest.lock().unwrap() = Some(frame);
    *shared.last_frame_at.lock().unwrap() = Some(Instant::now());
    Ok(())
}

fn mat_to_rgb(mat: &Mat) -> Result<RgbImage> {
    let mut rgb = Mat::default();
    imgproc::cvt_color(mat, &mut rgb, imgproc::COLOR_BGR2RGB, 0)?;
    let width = rgb.cols() as u32;
    let height = rgb.rows() as u32;
    let bytes = rgb.data_bytes()?.to_vec();
    RgbImage::from_raw(width, height, bytes).ok_or_else(|| {
        RecognitionError::Storage(format!("Frame buffer mismatch for {}x{} image", width, height))
    })
}

/// Scale factor preserving aspect ratio; `None` when the frame already fits.
pub fn downscale_dims(w: u32, h: u32, max_w: u32, max_h: u32) -> Option<(u32, u32)> {
    if w <= max_w && h <= max_h {
        return None;
    }
    let scale = (max_w as f64 / w as f64).min(max_h as f64 / h as f64);
    let new_w = ((w as f64 * scale) as u32).max(1);
    let new_h = ((h as f64 * scale) as u32).max(1);
    Some((new_w, new_h))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn downscale_skips_frames_within_bounds() {
        assert_eq!(downscale_dims(640, 480, 1280, 720), None);
        assert_eq!(downscale_dims(1280, 720, 1280, 720), None);
    }

    #[test]
    fn downscale_preserves_aspect_ratio() {
        let (w, h) = downscale_dims(2304, 1296, 1280, 720).unwrap();
        assert!(w <= 1280 && h <= 720);
        let src_ratio = 2304.0 / 1296.0;
        let dst_ratio = w as f64 / h as f64;
        assert!((src_ratio - dst_ratio).abs() < 0.01);
    }

    #[test]
    fn downscale_bounds_the_limiting_dimension() {
        // Width-limited.
        let (w, h) = downscale_dims(4000, 1000, 1280, 720).unwrap();
        assert_eq!(w, 1280);
        assert!(h <= 720);
        // Height-limited.
        let (w, h) = downscale_dims(1000, 4000, 1280, 720).unwrap();
        assert_eq!(h, 720);
        assert!(w <= 1280);
    }
}
