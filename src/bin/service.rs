use clap::Parser;
use sightline::common::paths::{system_config_file, DEV_SOCKET_PATH, SYSTEM_SOCKET_PATH};
use sightline::service::protocol::{
    read_frame, write_frame, Envelope, Request, Response, StreamMessage, MSG_TYPE_RESPONSE,
    MSG_TYPE_STREAM,
};
use sightline::{
    CaptureOpener, Config, DataDirs, FaceRecognizer, FaceStore, OnnxFaceEngine, Orchestrator,
    PersonDetector, RecognitionService, Result, RunStateStore, YoloPersonDetector,
};
use sightline::storage::AttendanceStore;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use std::{fs, thread};

#[derive(Parser, Debug)]
#[command(name = "sightline-service")]
#[command(about = "Sightline recognition and attendance service")]
struct Args {
    /// Run in development mode
    #[arg(long)]
    dev: bool,

    /// Socket path in dev mode
    #[arg(long, default_value = DEV_SOCKET_PATH)]
    dev_socket: String,

    /// Data directory in dev mode
    #[arg(long, default_value = "./dev_data")]
    dev_data_dir: String,

    /// Config file path
    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(args.dev);

    tracing::info!("Starting Sightline service (dev_mode: {})", args.dev);

    let (socket_path, dirs) = if args.dev {
        (
            args.dev_socket.clone(),
            DataDirs::at(PathBuf::from(&args.dev_data_dir))?,
        )
    } else {
        (SYSTEM_SOCKET_PATH.to_string(), DataDirs::system()?)
    };

    let config_path = args.config.unwrap_or_else(system_config_file);
    let mut config = if config_path.exists() {
        Config::load_from_path(&config_path)?
    } else {
        Config::load_default()?
    };
    if args.dev {
        config.service.debug = true;
    }

    // Relative model paths live under the data directory.
    config.detector.model_path = resolve_model(&config.detector.model_path, &dirs);
    config.face.detector_model_path = resolve_model(&config.face.detector_model_path, &dirs);
    config.face.encoder_model_path = resolve_model(&config.face.encoder_model_path, &dirs);

    // Model engines are built once and shared by both loops.
    let person_backend = Arc::new(YoloPersonDetector::new(&config.detector)?);
    let detector = PersonDetector::new(person_backend, config.detector.clone());
    let face_backend = Arc::new(OnnxFaceEngine::new(&config.face)?);
    let recognizer = Arc::new(FaceRecognizer::new(face_backend, config.face.clone()));

    let face_store = FaceStore::open(dirs.face_store_file(), dirs.faces_dir())?;
    let attendance = Arc::new(AttendanceStore::open(
        &dirs.attendance_db_file(),
        &config.attendance,
    )?);
    let run_state = RunStateStore::open(dirs.run_state_file())?;

    let opener = Box::new(CaptureOpener::new(config.video.clone()));
    let orchestrator = Orchestrator::new(
        config.clone(),
        opener,
        detector,
        Arc::clone(&recognizer),
        Arc::clone(&attendance),
        run_state,
    );

    let service = Arc::new(RecognitionService::new(
        Arc::clone(&orchestrator),
        face_store,
        recognizer,
        attendance,
    )?);

    // Resume the last active stream before accepting any request.
    orchestrator.resume_from_run_state()?;

    if Path::new(&socket_path).exists() {
        fs::remove_file(&socket_path)?;
    }
    if let Some(parent) = Path::new(&socket_path).parent() {
        fs::create_dir_all(parent)?;
    }
    let listener = UnixListener::bind(&socket_path)?;
    // All users may connect; authorization is per-request via API keys.
    fs::set_permissions(&socket_path, fs::Permissions::from_mode(0o666))?;

    tracing::info!("Listening on {}", socket_path);

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let service = Arc::clone(&service);
                let config = config.clone();
                if let Err(e) = thread::Builder::new()
                    .name("request-handler".into())
                    .spawn(move || {
                        if let Err(e) = handle_client(stream, &service, &config) {
                            tracing::debug!("Client error: {}", e);
                        }
                    })
                {
                    tracing::error!("Failed to spawn handler: {}", e);
                }
            }
            Err(e) => tracing::error!("Connection error: {}", e),
        }
    }

    Ok(())
}

fn handle_client(
    mut stream: UnixStream,
    service: &RecognitionService,
    config: &Config,
) -> Result<()> {
    stream.set_read_timeout(Some(Duration::from_secs(30)))?;
    stream.set_write_timeout(Some(Duration::from_secs(10)))?;

    let (_, envelope): (u8, Envelope) = read_frame(&mut stream)?;
    let is_stream = matches!(envelope.request, Request::Stream);

    let response = service.handle(&envelope);
    write_frame(&mut stream, MSG_TYPE_RESPONSE, &response)?;

    if is_stream && matches!(response, Response::StreamStarting) {
        push_stream(&mut stream, service, config);
    }
    Ok(())
}

/// Push the latest frame as JPEG until the client hangs up.
fn push_stream(stream: &mut UnixStream, service: &RecognitionService, config: &Config) {
    let interval = Duration::from_millis(config.service.stream_interval_ms);
    tracing::debug!("Stream client attached");

    loop {
        if let Some(frame) = service.orchestrator().latest_frame() {
            let jpeg = match encode_jpeg(&frame.image, config.service.stream_jpeg_quality) {
                Ok(jpeg) => jpeg,
                Err(e) => {
                    tracing::error!("JPEG encode failed: {}", e);
                    continue;
                }
            };
            let message = StreamMessage::Jpeg {
                data: jpeg,
                captured_at: chrono::DateTime::<chrono::Utc>::from(frame.captured_at).to_rfc3339(),
            };
            if write_frame(stream, MSG_TYPE_STREAM, &message).is_err() {
                tracing::debug!("Stream client detached");
                return;
            }
        }
        thread::sleep(interval);
    }
}

fn encode_jpeg(image: &image::RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut buffer, quality);
    encoder
        .encode(
            image.as_raw(),
            image.width(),
            image.height(),
            image::ColorType::Rgb8,
        )
        .map_err(sightline::RecognitionError::Image)?;
    Ok(buffer)
}

fn resolve_model(path: &Path, dirs: &DataDirs) -> PathBuf {
    if path.is_relative() {
        dirs.root().join(path)
    } else {
        path.to_path_buf()
    }
}

fn setup_logging(dev_mode: bool) {
    if dev_mode {
        tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_max_level(tracing::Level::DEBUG)
            .with_file(true)
            .with_line_number(true)
            .with_thread_ids(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .init();
    }
}
