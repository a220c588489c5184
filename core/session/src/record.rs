//! Session identity and the record persisted alongside the artifact.
//!
//! The record is a small fixed-schema JSON document:
//!
//! ```json
//! { "project": "demo", "database": "main", "tick": 42 }
//! ```
//!
//! Any field may be missing. A missing, empty or corrupt record loads as
//! "never joined" rather than failing, so opening an artifact never depends on
//! the record being intact.

use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tandem_protocol::Tick;
use tempfile::NamedTempFile;
use tracing::warn;

use crate::error::{Result, SessionError};

const SIDECAR_SUFFIX: &str = ".tandem.json";

/// Which project and branch an artifact is bound to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionIdentity {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
}

impl SessionIdentity {
    pub fn new(project: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            project: Some(project.into()),
            database: Some(database.into()),
        }
    }

    /// Both halves set and non-empty.
    pub fn is_bound(&self) -> bool {
        self.bound().is_some()
    }

    /// `(project, database)` when bound.
    pub fn bound(&self) -> Option<(&str, &str)> {
        match (self.project.as_deref(), self.database.as_deref()) {
            (Some(project), Some(database)) if !project.is_empty() && !database.is_empty() => {
                Some((project, database))
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    #[serde(flatten)]
    pub identity: SessionIdentity,
    #[serde(default)]
    pub tick: Tick,
}

/// Where the session record lives. Hosts that can embed data in the artifact
/// itself implement this; [`SidecarStore`] is the file-based default.
pub trait RecordStore {
    /// Never fails: anything unreadable loads as an empty record.
    fn load(&self) -> SessionRecord;

    /// Must not leave a torn record behind if interrupted.
    fn save(&self, record: &SessionRecord) -> Result<()>;
}

/// Stores the record as `<artifact>.tandem.json` next to the artifact.
#[derive(Debug, Clone)]
pub struct SidecarStore {
    path: PathBuf,
}

impl SidecarStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn for_artifact(artifact: &Path) -> Self {
        let mut file_name = artifact
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_default();
        file_name.push(SIDECAR_SUFFIX);
        Self::new(artifact.with_file_name(file_name))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RecordStore for SidecarStore {
    fn load(&self) -> SessionRecord {
        if !self.path.exists() {
            return SessionRecord::default();
        }

        let content = match fs_err::read_to_string(&self.path) {
            Ok(content) => content,
            Err(err) => {
                warn!(error = %err, "Failed to read session record; treating as never joined");
                return SessionRecord::default();
            }
        };
        if content.trim().is_empty() {
            return SessionRecord::default();
        }

        match serde_json::from_str::<SessionRecord>(&content) {
            Ok(mut record) => {
                if record.tick < 0 {
                    warn!(tick = record.tick, "Negative tick in session record; resetting to 0");
                    record.tick = 0;
                }
                record
            }
            Err(err) => {
                warn!(
                    path = %self.path.display(),
                    error = %err,
                    "Corrupt session record; treating as never joined"
                );
                SessionRecord::default()
            }
        }
    }

    fn save(&self, record: &SessionRecord) -> Result<()> {
        let content = serde_json::to_string_pretty(record).map_err(|source| SessionError::Json {
            context: "serialize session record".to_string(),
            source,
        })?;

        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let io_err = |context: &str, source: std::io::Error| SessionError::Io {
            context: format!("{} {}", context, self.path.display()),
            source,
        };

        let mut temp_file =
            NamedTempFile::new_in(parent).map_err(|e| io_err("create temp file for", e))?;
        temp_file
            .write_all(content.as_bytes())
            .map_err(|e| io_err("write", e))?;
        temp_file.flush().map_err(|e| io_err("flush", e))?;
        temp_file
            .persist(&self.path)
            .map_err(|e| io_err("replace", e.error))?;
        Ok(())
    }
}
