use std::{
    fmt,
    fs::File,
    io::{self, Write},
    path::PathBuf,
};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
    logging::Category,
    uploads::{StoreError, UploadStore, sanitize_name},
};

pub const DEFAULT_EXTENSION: &str = ".gcode";

#[derive(Debug)]
pub enum RecordingError {
    AlreadyActive(String),
    NotActive,
    EmptyName,
    Create { name: String, source: StoreError },
    Write { name: String, source: io::Error },
}

impl fmt::Display for RecordingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordingError::AlreadyActive(name) => {
                write!(f, "recording already in progress: {name}")
            }
            RecordingError::NotActive => write!(f, "no recording active"),
            RecordingError::EmptyName => write!(f, "recording name cannot be empty"),
            RecordingError::Create { name, source } => {
                write!(f, "failed to create recording {name}: {source}")
            }
            RecordingError::Write { name, source } => {
                write!(f, "failed to append to recording {name}: {source}")
            }
        }
    }
}

impl std::error::Error for RecordingError {}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecordingStatus {
    pub active: bool,
    pub name: Option<String>,
}

enum RecordingState {
    Idle,
    Recording {
        name: String,
        path: PathBuf,
        file: File,
    },
}

/// Trajectory recorder. At most one destination is open per process; while
/// it is open, translated lines go to the file instead of the device.
pub struct Recorder {
    state: RecordingState,
}

impl Default for Recorder {
    fn default() -> Self {
        Self::new()
    }
}

impl Recorder {
    pub fn new() -> Self {
        Self {
            state: RecordingState::Idle,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, RecordingState::Recording { .. })
    }

    pub fn name(&self) -> Option<&str> {
        match &self.state {
            RecordingState::Idle => None,
            RecordingState::Recording { name, .. } => Some(name),
        }
    }

    pub fn status(&self) -> RecordingStatus {
        RecordingStatus {
            active: self.is_active(),
            name: self.name().map(ToOwned::to_owned),
        }
    }

    /// Opens `raw` (reduced to a bare file name, `.gcode` appended when it
    /// has no extension) for writing, truncating earlier content.
    pub fn start(&mut self, store: &UploadStore, raw: &str) -> Result<String, RecordingError> {
        if let Some(name) = self.name() {
            warn!(
                "{} start rejected, {name} is still recording",
                Category::Recording
            );
            return Err(RecordingError::AlreadyActive(name.to_string()));
        }

        let mut name = sanitize_name(raw).map_err(|_| RecordingError::EmptyName)?;
        if !name.contains('.') {
            name.push_str(DEFAULT_EXTENSION);
        }

        let (path, file) =
            store
                .create_for_write(&name)
                .map_err(|source| RecordingError::Create {
                    name: name.clone(),
                    source,
                })?;
        info!(
            "{} started {name} at {}",
            Category::Recording,
            path.display()
        );
        self.state = RecordingState::Recording {
            name: name.clone(),
            path,
            file,
        };
        Ok(name)
    }

    /// Appends one translated line to the open destination.
    pub fn capture(&mut self, line: &str) -> Result<String, RecordingError> {
        let RecordingState::Recording { name, file, .. } = &mut self.state else {
            return Err(RecordingError::NotActive);
        };
        writeln!(file, "{line}")
            .and_then(|_| file.flush())
            .map_err(|source| RecordingError::Write {
                name: name.clone(),
                source,
            })?;
        Ok(name.clone())
    }

    /// Closes the destination and returns its name for later replay.
    pub fn finish(&mut self) -> Result<String, RecordingError> {
        match std::mem::replace(&mut self.state, RecordingState::Idle) {
            RecordingState::Idle => Err(RecordingError::NotActive),
            RecordingState::Recording {
                name,
                path,
                mut file,
            } => {
                if let Err(err) = file.flush() {
                    warn!(
                        "{} flush of {} failed on finish: {err}",
                        Category::Recording,
                        path.display()
                    );
                }
                info!("{} finished {name}", Category::Recording);
                Ok(name)
            }
        }
    }
}
