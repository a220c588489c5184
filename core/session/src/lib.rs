//! Client side of a tandem collaborative analysis session.
//!
//! - [`capture`]: gates the host's event sources behind one switch
//! - [`channel`]: framed request/response and broadcast connection to the coordinator
//! - [`controller`]: joins, leaves, forwards local edits, replays remote ones
//! - [`record`]: the per-artifact identity and tick, persisted next to the artifact
//! - [`config`]: local user and known coordinators
//!
//! Everything here is driven from a single loop thread; only the channel's
//! socket I/O runs on helper threads.

pub mod capture;
pub mod channel;
pub mod config;
pub mod controller;
pub mod error;
pub mod record;

pub use capture::{CaptureMultiplexer, EventSource, SourceKind, SourceTap};
pub use channel::{ChannelState, CommandChannel, Deferred};
pub use config::{load_config, ClientConfig};
pub use controller::{decode_reply, Host, Phase, SessionController};
pub use error::{ChannelError, Result, SessionError};
pub use record::{RecordStore, SessionIdentity, SessionRecord, SidecarStore};
