use clap::{Parser, Subcommand};
use sightline::common::config::AttendanceConfig;
use sightline::service::protocol::{Request, Response};
use sightline::service::ServiceClient;
use sightline::storage::AttendanceStore;
use sightline::{DataDirs, Result};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "sightline")]
#[command(about = "Sightline recognition and attendance system")]
struct Cli {
    /// Talk to a development-mode service
    #[arg(long, global = true)]
    dev: bool,

    /// Override the service socket path
    #[arg(long, global = true)]
    socket: Option<String>,

    /// API key (falls back to SIGHTLINE_API_KEY)
    #[arg(long, global = true)]
    api_key: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Service health and stream status
    Status,
    /// Probe a source without touching the active stream
    ValidateSource { source: String },
    /// Switch the active video source
    ChangeSource {
        source: String,
        /// Keep the current track set across the switch
        #[arg(long)]
        no_reset: bool,
    },
    /// Register a face from an image file
    Register {
        #[arg(short, long)]
        name: String,
        #[arg(short, long)]
        person_id: String,
        #[arg(short, long)]
        image: PathBuf,
    },
    /// Run one recognition pass (from a file, or the live stream)
    Recognize {
        #[arg(short, long)]
        image: Option<PathBuf>,
    },
    /// List registered faces
    Faces,
    /// Remove every registered face
    ClearFaces,
    /// Today's attendance
    Today,
    /// Export attendance for a date range
    Export {
        #[arg(long)]
        start: String,
        #[arg(long)]
        end: String,
        #[arg(long, default_value = "csv")]
        format: String,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Create an API key directly against the database (bootstrap)
    CreateApiKey {
        #[arg(long)]
        name: String,
        /// Comma-separated permission list, e.g. "attendance:*,person:read"
        #[arg(long)]
        permissions: String,
        #[arg(long)]
        expires_days: Option<i64>,
        /// Data directory holding attendance.db (dev mode)
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .init();

    let api_key = cli
        .api_key
        .clone()
        .or_else(|| std::env::var("SIGHTLINE_API_KEY").ok());
    let client = match &cli.socket {
        Some(socket) => ServiceClient::with_socket(socket.clone(), api_key.clone()),
        None => ServiceClient::new(cli.dev, api_key),
    };

    match cli.command {
        Commands::Status => {
            let response = client.call(Request::Health)?;
            match expect_ok(response)? {
                Response::Health(health) => {
                    println!("Status:     {}", health.status);
                    println!("Time:       {}", health.time);
                    println!("Faces:      {}", health.faces);
                    println!(
                        "Source:     {}",
                        health.current_source.as_deref().unwrap_or("none")
                    );
                    println!("Background: {}", health.background_running);
                    if let Some(stream) = health.stream {
                        println!(
                            "Stream:     {}x{} @ {:.1}fps (connected: {}, alive: {}, reconnects: {})",
                            stream.width,
                            stream.height,
                            stream.fps,
                            stream.connected,
                            stream.alive,
                            stream.reconnect_count
                        );
                    }
                }
                other => print_unexpected(&other),
            }
        }
        Commands::ValidateSource { source } => {
            let response = client.call(Request::ValidateSource { source })?;
            match expect_ok(response)? {
                Response::SourceValid { source } => println!("Source is valid: {}", source),
                other => print_unexpected(&other),
            }
        }
        Commands::ChangeSource { source, no_reset } => {
            let response = client.call(Request::ChangeSource {
                source,
                reset: !no_reset,
            })?;
            match expect_ok(response)? {
                Response::SourceChanged { source, .. } => println!("Switched to source: {}", source),
                other => print_unexpected(&other),
            }
        }
        Commands::Register {
            name,
            person_id,
            image,
        } => {
            let bytes = std::fs::read(&image)?;
            let response = client.call(Request::Register {
                name,
                person_id,
                image: bytes,
            })?;
            match expect_ok(response)? {
                Response::Registered { face, count } => {
                    println!("Registered {} ({}), {} faces total", face.name, face.person_id, count);
                }
                other => print_unexpected(&other),
            }
        }
        Commands::Recognize { image } => {
            let bytes = match image {
                Some(path) => Some(std::fs::read(&path)?),
                None => None,
            };
            let response = client.call(Request::Recognize { image: bytes })?;
            match expect_ok(response)? {
                Response::Tracks {
                    tracks,
                    active_tracks,
                } => {
                    println!("{} active track(s)", active_tracks);
                    for track in tracks {
                        println!(
                            "  #{} {:?} {} (conf {:.2}) bbox [{:.0},{:.0},{:.0},{:.0}]",
                            track.track_id,
                            track.status,
                            track.name.as_deref().unwrap_or("-"),
                            track.face_confidence,
                            track.bbox.x1,
                            track.bbox.y1,
                            track.bbox.x2,
                            track.bbox.y2,
                        );
                    }
                }
                other => print_unexpected(&other),
            }
        }
        Commands::Faces => {
            let response = client.call(Request::ListFaces)?;
            match expect_ok(response)? {
                Response::Faces(faces) => {
                    println!("{} registered face(s)", faces.len());
                    for face in faces {
                        println!("  {} ({}) registered {}", face.name, face.person_id, face.created_at);
                    }
                }
                other => print_unexpected(&other),
            }
        }
        Commands::ClearFaces => {
            expect_ok(client.call(Request::ClearFaces)?)?;
            println!("All faces cleared");
        }
        Commands::Today => {
            let response = client.call(Request::AttendanceToday)?;
            match expect_ok(response)? {
                Response::AttendanceListing(rows) => {
                    println!("{} attendance record(s) today", rows.len());
                    for row in rows {
                        println!(
                            "  #{} {} in {} out {} ({})",
                            row.id,
                            row.person_name,
                            row.check_in,
                            row.check_out.as_deref().unwrap_or("-"),
                            row.marked_by,
                        );
                    }
                }
                other => print_unexpected(&other),
            }
        }
        Commands::Export {
            start,
            end,
            format,
            output,
        } => {
            let response = client.call(Request::Export {
                start_date: start,
                end_date: end,
                format,
            })?;
            match expect_ok(response)? {
                Response::Export { data, .. } => match output {
                    Some(path) => {
                        std::fs::write(&path, data)?;
                        println!("Exported to {}", path.display());
                    }
                    None => print!("{}", data),
                },
                other => print_unexpected(&other),
            }
        }
        Commands::CreateApiKey {
            name,
            permissions,
            expires_days,
            data_dir,
        } => {
            let dirs = match data_dir {
                Some(dir) => DataDirs::at(dir)?,
                None if cli.dev => DataDirs::at(PathBuf::from("./dev_data"))?,
                None => DataDirs::system()?,
            };
            let store = AttendanceStore::open(&dirs.attendance_db_file(), &AttendanceConfig::default())?;
            let permissions: Vec<String> = permissions
                .split(',')
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect();
            let key = store.create_api_key(&name, &permissions, expires_days)?;
            println!("API key created: {}", key);
            println!("Store it securely - it will not be shown again.");
        }
    }

    Ok(())
}

/// Unwrap an error response into a process error; pass the rest through.
fn expect_ok(response: Response) -> Result<Response> {
    match response {
        Response::Error { status, message } => Err(sightline::RecognitionError::Other(
            anyhow::anyhow!("{:?}: {}", status, message),
        )),
        other => Ok(other),
    }
}

fn print_unexpected(response: &Response) {
    eprintln!("Unexpected response: {:?}", response);
}
