use crate::common::error::Result;
use crate::video::source::SourceKind;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

/// Durable "which source is active" record, consulted once at startup so a
/// restarted process resumes its stream without any external call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunState {
    pub active: bool,
    pub source: Option<String>,
    pub source_type: SourceKind,
}

impl Default for RunState {
    fn default() -> Self {
        Self {
            active: false,
            source: None,
            source_type: SourceKind::Unknown,
        }
    }
}

pub struct RunStateStore {
    path: PathBuf,
    cached: Mutex<RunState>,
}

impl RunStateStore {
    /// Missing or corrupt state reads as "no active stream".
    pub fn open(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let state = match fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!(file = ?path, "Corrupt run state, treating as inactive: {}", e);
                RunState::default()
            }),
            Err(_) => RunState::default(),
        };

        if state.active {
            tracing::info!(source = ?state.source, "Found active stream in run state");
        }

        Ok(Self {
            path,
            cached: Mutex::new(state),
        })
    }

    pub fn get(&self) -> RunState {
        self.cached.lock().unwrap().clone()
    }

    pub fn set_active(&self, source: &str, source_type: SourceKind) -> Result<()> {
        self.replace(RunState {
            active: true,
            source: Some(source.to_string()),
            source_type,
        })
    }

    /// Deactivate while remembering the last source.
    pub fn set_inactive(&self) -> Result<()> {
        let mut state = self.get();
        state.active = false;
        self.replace(state)
    }

    fn replace(&self, state: RunState) -> Result<()> {
        let mut cached = self.cached.lock().unwrap();
        let contents = serde_json::to_string_pretty(&state)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, contents)?;
        fs::rename(&tmp, &self.path)?;
        *cached = state;
        Ok(())
    }
}
