//! Wire protocol types and validation for tandem.
//!
//! This crate is shared by the coordinator and its clients to prevent schema
//! drift. The coordinator remains the authority on validation, but clients can
//! reuse the same types to construct valid requests.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod frame;

pub use frame::{encode_frame, read_frame, write_encoded, write_frame, FrameError, MAX_FRAME_BYTES};

pub const PROTOCOL_VERSION: u32 = 1;

/// Branch tick of a branch that has no base snapshot yet.
pub const NO_HISTORY: Tick = -1;

/// `InviteTo` target that addresses every member of the branch.
pub const EVERYONE: &str = "everyone";

const MAX_NAME_LEN: usize = 128;

/// Logical clock counting accepted events on a branch.
pub type Tick = i64;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Malformed frame or unknown command. Fatal to the connection.
    ProtocolError,
    /// Claimed tick is ahead of the branch. Fatal to the join only.
    VersionConflict,
    NameConflict,
    NotFound,
    NotJoined,
    InvalidParams,
    Internal,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    pub code: ErrorCode,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

impl std::error::Error for ErrorInfo {}

// ─────────────────────────────────────────────────────────────────────────────
// Records
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Repository {
    pub name: String,
    /// Lowercase hex MD5 of the source artifact.
    pub hash: String,
    pub file: String,
    pub file_type: String,
    pub date: DateTime<Utc>,
}

impl Repository {
    pub fn new(
        name: impl Into<String>,
        hash: impl Into<String>,
        file: impl Into<String>,
        file_type: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            hash: hash.into(),
            file: file.into(),
            file_type: file_type.into(),
            date: Utc::now(),
        }
    }

    /// Describes a repository for an artifact, keyed by the MD5 of its
    /// contents.
    pub fn for_artifact(
        name: impl Into<String>,
        file: impl Into<String>,
        file_type: impl Into<String>,
        content: &[u8],
    ) -> Self {
        let hash = format!("{:x}", md5::compute(content));
        Self::new(name, hash, file, file_type)
    }

    pub fn validate(&self) -> Result<(), ErrorInfo> {
        require_name(&self.name, "repository name")?;
        require_non_empty(&self.hash, "hash")?;
        require_non_empty(&self.file, "file")?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Branch {
    pub repo: String,
    pub name: String,
    pub date: DateTime<Utc>,
    pub tick: Tick,
}

impl Branch {
    /// A branch with no recorded history yet.
    pub fn new(repo: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            repo: repo.into(),
            name: name.into(),
            date: Utc::now(),
            tick: NO_HISTORY,
        }
    }

    /// Branches without a base snapshot cannot be joined.
    pub fn is_joinable(&self) -> bool {
        self.tick != NO_HISTORY
    }

    pub fn validate(&self) -> Result<(), ErrorInfo> {
        require_name(&self.repo, "repository name")?;
        require_name(&self.name, "branch name")?;
        if self.tick < NO_HISTORY {
            return Err(ErrorInfo::new(
                ErrorCode::InvalidParams,
                "branch tick must be -1 or greater",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub name: String,
    /// 0xBBGGRR
    pub color: u32,
}

/// A single artifact mutation. The payload is produced and consumed by the
/// host's translation layer; the protocol treats it as opaque.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArtifactEvent {
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}

impl ArtifactEvent {
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StampedEvent {
    pub tick: Tick,
    pub author: String,
    pub event: ArtifactEvent,
}

// ─────────────────────────────────────────────────────────────────────────────
// Commands (client → coordinator)
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    JoinSession {
        project: String,
        database: String,
        tick: Tick,
        name: String,
        color: u32,
        ea: u64,
    },
    LeaveSession {
        name: String,
    },
    GetRepositories,
    GetBranches {
        repo: String,
    },
    NewRepository {
        repo: Repository,
    },
    NewBranch {
        branch: Branch,
    },
    UploadDatabase {
        repo: String,
        branch: String,
        #[serde(with = "snapshot_bytes")]
        content: Vec<u8>,
    },
    DownloadDatabase {
        repo: String,
        branch: String,
    },
    SubmitEvent {
        event: ArtifactEvent,
    },
    UserRenamed {
        old_name: String,
        new_name: String,
    },
    UserColorChanged {
        name: String,
        old_color: u32,
        new_color: u32,
    },
    InviteTo {
        name: String,
        ea: u64,
    },
}

impl Command {
    /// Notification commands are relayed without a reply.
    pub fn expects_reply(&self) -> bool {
        !matches!(
            self,
            Command::LeaveSession { .. }
                | Command::UserRenamed { .. }
                | Command::UserColorChanged { .. }
                | Command::InviteTo { .. }
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::JoinSession { .. } => "join_session",
            Command::LeaveSession { .. } => "leave_session",
            Command::GetRepositories => "get_repositories",
            Command::GetBranches { .. } => "get_branches",
            Command::NewRepository { .. } => "new_repository",
            Command::NewBranch { .. } => "new_branch",
            Command::UploadDatabase { .. } => "upload_database",
            Command::DownloadDatabase { .. } => "download_database",
            Command::SubmitEvent { .. } => "submit_event",
            Command::UserRenamed { .. } => "user_renamed",
            Command::UserColorChanged { .. } => "user_color_changed",
            Command::InviteTo { .. } => "invite_to",
        }
    }

    pub fn validate(&self) -> Result<(), ErrorInfo> {
        match self {
            Command::JoinSession {
                project,
                database,
                tick,
                name,
                ..
            } => {
                require_name(project, "project")?;
                require_name(database, "database")?;
                require_name(name, "name")?;
                if *tick < 0 {
                    return Err(ErrorInfo::new(
                        ErrorCode::InvalidParams,
                        "tick must not be negative",
                    ));
                }
            }
            Command::LeaveSession { name } => require_name(name, "name")?,
            Command::GetRepositories => {}
            Command::GetBranches { repo } => require_name(repo, "repository name")?,
            Command::NewRepository { repo } => repo.validate()?,
            Command::NewBranch { branch } => branch.validate()?,
            Command::UploadDatabase { repo, branch, .. }
            | Command::DownloadDatabase { repo, branch } => {
                require_name(repo, "repository name")?;
                require_name(branch, "branch name")?;
            }
            Command::SubmitEvent { event } => require_non_empty(&event.kind, "event kind")?,
            Command::UserRenamed { old_name, new_name } => {
                require_name(old_name, "old_name")?;
                require_name(new_name, "new_name")?;
            }
            Command::UserColorChanged { name, .. } => require_name(name, "name")?,
            Command::InviteTo { name, .. } => require_name(name, "name")?,
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Broadcasts (coordinator → members)
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Broadcast {
    Event {
        event: StampedEvent,
    },
    UserJoined {
        name: String,
        color: u32,
        ea: u64,
    },
    UserLeft {
        name: String,
    },
    UserRenamed {
        old_name: String,
        new_name: String,
    },
    UserColorChanged {
        name: String,
        old_color: u32,
        new_color: u32,
    },
    InviteTo {
        from: String,
        ea: u64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BroadcastKind {
    Event,
    UserJoined,
    UserLeft,
    UserRenamed,
    UserColorChanged,
    InviteTo,
}

impl Broadcast {
    pub fn kind(&self) -> BroadcastKind {
        match self {
            Broadcast::Event { .. } => BroadcastKind::Event,
            Broadcast::UserJoined { .. } => BroadcastKind::UserJoined,
            Broadcast::UserLeft { .. } => BroadcastKind::UserLeft,
            Broadcast::UserRenamed { .. } => BroadcastKind::UserRenamed,
            Broadcast::UserColorChanged { .. } => BroadcastKind::UserColorChanged,
            Broadcast::InviteTo { .. } => BroadcastKind::InviteTo,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Requests, replies, frames
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Request {
    pub protocol_version: u32,
    pub id: u64,
    pub command: Command,
}

impl Request {
    pub fn new(id: u64, command: Command) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            id,
            command,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Notification {
    pub protocol_version: u32,
    pub command: Command,
}

impl Notification {
    pub fn new(command: Command) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            command,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Response {
    pub id: u64,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

impl Response {
    pub fn ok(id: u64, data: Value) -> Self {
        Self {
            id,
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(id: u64, code: ErrorCode, message: impl Into<String>) -> Self {
        Self::error_with_info(id, ErrorInfo::new(code, message))
    }

    pub fn error_with_info(id: u64, error: ErrorInfo) -> Self {
        Self {
            id,
            ok: false,
            data: None,
            error: Some(error),
        }
    }

    /// Serializes `data` into an ok response, or an `Internal` error response
    /// if serialization fails.
    pub fn from_serialize<T: Serialize>(id: u64, data: &T) -> Self {
        match serde_json::to_value(data) {
            Ok(value) => Response::ok(id, value),
            Err(err) => Response::error(
                id,
                ErrorCode::Internal,
                format!("Failed to serialize reply: {}", err),
            ),
        }
    }

    pub fn into_result(self) -> Result<Value, ErrorInfo> {
        if self.ok {
            return Ok(self.data.unwrap_or(Value::Null));
        }
        Err(self.error.unwrap_or_else(|| {
            ErrorInfo::new(ErrorCode::Internal, "error response without details")
        }))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum Frame {
    Request(Request),
    Notify(Notification),
    Response(Response),
    Broadcast(Broadcast),
}

/// Reply payload for `JoinSession`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JoinAccepted {
    /// Authoritative branch tick at acceptance time.
    pub tick: Tick,
    /// History after the claimed tick, in tick order.
    pub events: Vec<StampedEvent>,
    /// Members already present on the branch.
    #[serde(default)]
    pub users: Vec<User>,
}

/// Reply payload for `SubmitEvent`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventAccepted {
    pub tick: Tick,
}

/// Reply payload for `DownloadDatabase`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DatabaseSnapshot {
    pub repo: String,
    pub branch: String,
    #[serde(with = "snapshot_bytes")]
    pub content: Vec<u8>,
}

/// Snapshot bytes travel as one base64 string rather than a JSON number
/// array.
mod snapshot_bytes {
    use base64::{engine::general_purpose, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

fn require_non_empty(value: &str, field: &str) -> Result<(), ErrorInfo> {
    if value.trim().is_empty() {
        return Err(ErrorInfo::new(
            ErrorCode::InvalidParams,
            format!("{} is required", field),
        ));
    }
    Ok(())
}

fn require_name(value: &str, field: &str) -> Result<(), ErrorInfo> {
    require_non_empty(value, field)?;
    if value.len() > MAX_NAME_LEN {
        return Err(ErrorInfo::new(
            ErrorCode::InvalidParams,
            format!("{} must be {} characters or fewer", field, MAX_NAME_LEN),
        ));
    }
    Ok(())
}
