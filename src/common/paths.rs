use crate::common::error::{RecognitionError, Result};
use directories::ProjectDirs;
use std::fs;
use std::path::PathBuf;

pub const SYSTEM_SOCKET_PATH: &str = "/run/sightline/service.sock";
pub const DEV_SOCKET_PATH: &str = "/tmp/sightline.sock";

/// Resolved on-disk layout for everything the service persists.
#[derive(Debug, Clone)]
pub struct DataDirs {
    root: PathBuf,
}

impl DataDirs {
    /// Resolve from an explicit base directory (development / tests).
    pub fn at(root: impl Into<PathBuf>) -> Result<Self> {
        let dirs = Self { root: root.into() };
        dirs.ensure()?;
        Ok(dirs)
    }

    /// Resolve from the platform data directory.
    pub fn system() -> Result<Self> {
        let dirs = ProjectDirs::from("com", "sightline", "Sightline")
            .ok_or_else(|| RecognitionError::Storage("Failed to resolve project dirs".into()))?;
        Self::at(dirs.data_dir())
    }

    fn ensure(&self) -> Result<()> {
        fs::create_dir_all(&self.root)?;
        fs::create_dir_all(self.faces_dir())?;
        fs::create_dir_all(self.models_dir())?;
        Ok(())
    }

    pub fn root(&self) -> &PathBuf {
        &self.root
    }

    /// Saved face crops (one JPEG per registration).
    pub fn faces_dir(&self) -> PathBuf {
        self.root.join("faces")
    }

    /// The face-encoding blob.
    pub fn face_store_file(&self) -> PathBuf {
        self.root.join("faces.bin")
    }

    pub fn attendance_db_file(&self) -> PathBuf {
        self.root.join("attendance.db")
    }

    pub fn run_state_file(&self) -> PathBuf {
        self.root.join("stream_state.json")
    }

    pub fn models_dir(&self) -> PathBuf {
        self.root.join("models")
    }
}

pub fn system_config_file() -> PathBuf {
    PathBuf::from("/etc/sightline/sightline.toml")
}
