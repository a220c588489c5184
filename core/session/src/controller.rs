//! Session controller: binds an artifact to a project/branch, joins and
//! leaves sessions, forwards local edits and replays remote ones.
//!
//! Everything runs on the host's loop thread. The controller owns the
//! session state behind `Rc<RefCell<..>>`; channel callbacks hold only a
//! `Weak` plus the generation they were issued for, so a callback that
//! outlives its session (artifact closed, session left, join superseded)
//! finds nothing to touch.

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::rc::{Rc, Weak};
use std::time::Duration;

use serde_json::Value;
use tandem_protocol::{
    ArtifactEvent, Broadcast, BroadcastKind, Command, EventAccepted, JoinAccepted, StampedEvent,
    Tick, User,
};
use tracing::{debug, error, info, warn};

use crate::capture::CaptureMultiplexer;
use crate::channel::{CommandChannel, Deferred};
use crate::error::{ChannelError, Result};
use crate::record::{RecordStore, SessionIdentity, SessionRecord};

/// The analysis application the controller is embedded in.
pub trait Host {
    /// Address advertised to other members on join.
    fn cursor_ea(&self) -> u64 {
        0
    }

    /// Applies one remote event to the local artifact. Capture is suspended
    /// for the duration of the call.
    fn apply_event(&mut self, event: &StampedEvent) -> std::result::Result<(), String>;

    /// Another member asked this user to jump to `ea`.
    fn invited(&mut self, from: &str, ea: u64) {
        let _ = (from, ea);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Not in a session.
    Idle,
    /// Join sent; local edits are captured and held until it is accepted.
    Joining,
    Joined,
    /// Connection lost mid-session. State is kept for [`SessionController::reconnect`].
    Disconnected,
    /// The coordinator refused the join; capture is off.
    Rejected,
}

/// A submitted event, with the author name the coordinator stamps it with.
struct Unacked {
    author: String,
    event: ArtifactEvent,
}

impl Unacked {
    fn stamped_as(&self, stamped: &StampedEvent) -> bool {
        self.author == stamped.author && self.event == stamped.event
    }
}

struct SessionCore {
    record: SessionRecord,
    store: Box<dyn RecordStore>,
    capture: CaptureMultiplexer,
    host: Box<dyn Host>,
    user: User,
    users: BTreeMap<String, User>,
    phase: Phase,
    pending: VecDeque<ArtifactEvent>,
    /// Submitted events not yet acknowledged, in submission order.
    unacked: VecDeque<Unacked>,
    /// Bumped when the artifact closes.
    generation: u64,
    /// Bumped on every join and leave.
    attempt: u64,
}

impl SessionCore {
    fn persist(&self) {
        if let Err(err) = self.store.save(&self.record) {
            error!(error = %err, "Failed to persist session record");
        }
    }

    /// Applies a stamped event unless it is already reflected in the local
    /// tick. Returns whether the tick moved.
    fn apply_remote(&mut self, stamped: &StampedEvent) -> bool {
        let local = self.record.tick;
        if stamped.tick <= local {
            debug!(tick = stamped.tick, local_tick = local, "Skipping already applied event");
            return false;
        }
        if stamped.tick != local + 1 {
            warn!(tick = stamped.tick, local_tick = local, "Gap in event history");
        }

        {
            let _guard = self.capture.suspend();
            if let Err(err) = self.host.apply_event(stamped) {
                error!(
                    tick = stamped.tick,
                    kind = %stamped.event.kind,
                    author = %stamped.author,
                    error = %err,
                    "Failed to apply remote event"
                );
            }
        }
        self.record.tick = stamped.tick;
        true
    }

    fn joined(&mut self, accepted: JoinAccepted) {
        let claimed = self.record.tick;
        let mut replayed = 0;
        let mut unacked = std::mem::take(&mut self.unacked);
        let mut confirmed = 0;
        for stamped in &accepted.events {
            // Our own submission whose reply was lost with the connection.
            if stamped.tick > self.record.tick
                && unacked.front().is_some_and(|own| own.stamped_as(stamped))
            {
                unacked.pop_front();
                self.record.tick = stamped.tick;
                confirmed += 1;
                continue;
            }
            if self.apply_remote(stamped) {
                replayed += 1;
            }
        }
        let resubmit = unacked.len();
        for own in unacked.into_iter().rev() {
            self.pending.push_front(own.event);
        }
        if self.record.tick < accepted.tick {
            warn!(
                tick = self.record.tick,
                authoritative = accepted.tick,
                "Replay ended short of branch tick"
            );
            self.record.tick = accepted.tick;
        }
        self.persist();

        self.users = accepted
            .users
            .into_iter()
            .map(|user| (user.name.clone(), user))
            .collect();
        self.phase = Phase::Joined;
        info!(
            claimed_tick = claimed,
            tick = self.record.tick,
            replayed,
            confirmed,
            resubmit,
            members = self.users.len(),
            pending = self.pending.len(),
            "Joined session"
        );
    }

    fn join_failed(&mut self, err: ChannelError) {
        match err {
            ChannelError::ConnectionLost => {
                self.phase = Phase::Disconnected;
                warn!(pending = self.pending.len(), "Connection lost before join was accepted");
            }
            ChannelError::Cancelled => {
                debug!("Join cancelled");
            }
            other => {
                self.capture.disable_all();
                let discarded =
                    self.pending.len() + self.unacked.len() + self.capture.drain().len();
                self.pending.clear();
                self.unacked.clear();
                self.phase = Phase::Rejected;
                error!(
                    error = %other,
                    tick = self.record.tick,
                    discarded,
                    "Coordinator refused join; capture disabled"
                );
            }
        }
    }

    fn submit_failed(&mut self, kind: &str, err: ChannelError) {
        match err {
            ChannelError::ConnectionLost | ChannelError::Cancelled => {
                debug!(
                    kind = %kind,
                    unacked = self.unacked.len(),
                    "Local event unacknowledged; kept for the next join"
                );
            }
            other => {
                self.unacked.pop_front();
                warn!(kind = %kind, error = %other, "Local event was not accepted");
            }
        }
    }

    fn event_accepted(&mut self, accepted: EventAccepted) {
        if accepted.tick > self.record.tick {
            self.record.tick = accepted.tick;
            self.persist();
        }
    }
}

pub struct SessionController {
    core: Rc<RefCell<SessionCore>>,
    channel: Option<CommandChannel>,
}

impl SessionController {
    pub fn new(
        store: impl RecordStore + 'static,
        capture: CaptureMultiplexer,
        host: impl Host + 'static,
        user: User,
    ) -> Self {
        Self {
            core: Rc::new(RefCell::new(SessionCore {
                record: SessionRecord::default(),
                store: Box::new(store),
                capture,
                host: Box::new(host),
                user,
                users: BTreeMap::new(),
                phase: Phase::Idle,
                pending: VecDeque::new(),
                unacked: VecDeque::new(),
                generation: 0,
                attempt: 0,
            })),
            channel: None,
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Identity
    // ─────────────────────────────────────────────────────────────────────

    /// Binds the artifact to a project and branch and persists it. Does not
    /// start capturing.
    pub fn bind_identity(
        &mut self,
        project: impl Into<String>,
        database: impl Into<String>,
    ) -> Result<()> {
        let mut core = self.core.borrow_mut();
        core.record.identity = SessionIdentity::new(project, database);
        core.store.save(&core.record)?;
        info!(
            project = core.record.identity.project.as_deref().unwrap_or_default(),
            database = core.record.identity.database.as_deref().unwrap_or_default(),
            "Session identity bound"
        );
        Ok(())
    }

    /// Restores identity and tick from the persisted record. Never fails.
    pub fn load_identity(&mut self) -> SessionIdentity {
        let mut core = self.core.borrow_mut();
        core.record = core.store.load();
        debug!(
            bound = core.record.identity.is_bound(),
            tick = core.record.tick,
            "Session identity loaded"
        );
        core.record.identity.clone()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Session lifecycle
    // ─────────────────────────────────────────────────────────────────────

    /// Sends `JoinSession` and enables capture right away. Returns `None`
    /// when the identity is unbound or no channel is attached.
    pub fn join(&mut self) -> Result<Option<Deferred>> {
        let Some(channel) = self.channel.as_mut() else {
            warn!("Cannot join without a coordinator connection");
            return Ok(None);
        };

        let (command, attempt) = {
            let mut core = self.core.borrow_mut();
            let Some((project, database)) = core
                .record
                .identity
                .bound()
                .map(|(project, database)| (project.to_string(), database.to_string()))
            else {
                debug!("Session identity unbound; not joining");
                return Ok(None);
            };

            core.capture.enable_all()?;
            core.attempt += 1;
            core.phase = Phase::Joining;
            core.users.clear();
            info!(
                project = %project,
                database = %database,
                tick = core.record.tick,
                "Joining session"
            );
            let command = Command::JoinSession {
                project,
                database,
                tick: core.record.tick,
                name: core.user.name.clone(),
                color: core.user.color,
                ea: core.host.cursor_ea(),
            };
            (command, core.attempt)
        };

        let on_accept = Rc::downgrade(&self.core);
        let on_refuse = on_accept.clone();
        let deferred = channel
            .send_command(command)
            .on_success(move |value| {
                with_core(&on_accept, |core| core.attempt == attempt, |core| {
                    match serde_json::from_value::<JoinAccepted>(value) {
                        Ok(accepted) => core.joined(accepted),
                        Err(err) => core.join_failed(ChannelError::Decode(err.to_string())),
                    }
                })
            })
            .on_failure(move |err| {
                with_core(&on_refuse, |core| core.attempt == attempt, |core| {
                    core.join_failed(err)
                })
            });
        Ok(Some(deferred))
    }

    /// Sends `LeaveSession`. Capture stays as it is.
    pub fn leave(&mut self) -> Option<Deferred> {
        let name = {
            let mut core = self.core.borrow_mut();
            if !core.record.identity.is_bound() {
                return None;
            }
            core.attempt += 1;
            core.phase = Phase::Idle;
            core.users.clear();
            core.pending.clear();
            core.unacked.clear();
            core.user.name.clone()
        };
        info!(user = %name, "Leaving session");
        let channel = self.channel.as_mut()?;
        Some(channel.send_command(Command::LeaveSession { name }))
    }

    /// Artifact is about to close: stop capturing, leave, and clear the
    /// persisted identity. Safe to call repeatedly.
    pub fn on_artifact_closing(&mut self) {
        self.core.borrow_mut().capture.disable_all();
        let bound = self.core.borrow().record.identity.is_bound();
        if bound {
            self.leave();
        }

        let mut core = self.core.borrow_mut();
        core.generation += 1;
        core.attempt += 1;
        core.phase = Phase::Idle;
        core.pending.clear();
        core.unacked.clear();
        core.capture.drain();
        core.users.clear();
        if core.record != SessionRecord::default() {
            core.record = SessionRecord::default();
            core.persist();
            info!("Session state cleared");
        }
    }

    /// First safe point after the host finished loading the artifact.
    pub fn on_artifact_ready(&mut self) -> Result<Option<Deferred>> {
        self.load_identity();
        self.join()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Connection
    // ─────────────────────────────────────────────────────────────────────

    /// Attaches a channel and registers the broadcast handlers. A previously
    /// attached channel is closed.
    pub fn attach(&mut self, mut channel: CommandChannel) {
        register_handlers(&mut channel, Rc::downgrade(&self.core));
        if let Some(mut previous) = self.channel.replace(channel) {
            previous.close();
        }
    }

    /// Attaches a freshly dialled channel after a connection loss and, if a
    /// session was in progress, re-joins from the persisted tick.
    pub fn reconnect(&mut self, channel: CommandChannel) -> Result<Option<Deferred>> {
        self.attach(channel);
        let phase = self.core.borrow().phase;
        match phase {
            Phase::Joining | Phase::Joined | Phase::Disconnected => {
                info!(tick = self.tick(), "Resuming session after reconnect");
                self.join()
            }
            Phase::Idle | Phase::Rejected => Ok(None),
        }
    }

    /// Closes the channel. Outstanding requests fail with `Cancelled`.
    pub fn disconnect(&mut self) {
        if let Some(channel) = self.channel.as_mut() {
            channel.close();
        }
        self.note_connection_state();
    }

    pub fn channel(&self) -> Option<&CommandChannel> {
        self.channel.as_ref()
    }

    pub fn channel_mut(&mut self) -> Option<&mut CommandChannel> {
        self.channel.as_mut()
    }

    /// One turn of the client loop: deliver replies and broadcasts, then
    /// forward what capture observed since the last turn.
    pub fn pump(&mut self) -> usize {
        let handled = self.channel.as_mut().map_or(0, CommandChannel::poll);
        self.note_connection_state();
        self.forward_captured();
        handled
    }

    /// Like [`pump`](Self::pump), waiting up to `timeout` for inbound frames.
    pub fn pump_timeout(&mut self, timeout: Duration) -> usize {
        self.forward_captured();
        let handled = match self.channel.as_mut() {
            Some(channel) => channel.poll_timeout(timeout),
            None => 0,
        };
        self.note_connection_state();
        self.forward_captured();
        handled
    }

    // ─────────────────────────────────────────────────────────────────────
    // Presence
    // ─────────────────────────────────────────────────────────────────────

    pub fn rename_user(&mut self, new_name: impl Into<String>) -> Option<Deferred> {
        let new_name = new_name.into();
        let (old_name, joined) = {
            let mut core = self.core.borrow_mut();
            let old_name = std::mem::replace(&mut core.user.name, new_name.clone());
            (old_name, core.phase == Phase::Joined)
        };
        if !joined || old_name == new_name {
            return None;
        }
        let channel = self.channel.as_mut()?;
        Some(channel.send_command(Command::UserRenamed { old_name, new_name }))
    }

    pub fn change_color(&mut self, new_color: u32) -> Option<Deferred> {
        let (name, old_color, joined) = {
            let mut core = self.core.borrow_mut();
            let old_color = std::mem::replace(&mut core.user.color, new_color);
            (core.user.name.clone(), old_color, core.phase == Phase::Joined)
        };
        if !joined || old_color == new_color {
            return None;
        }
        let channel = self.channel.as_mut()?;
        Some(channel.send_command(Command::UserColorChanged {
            name,
            old_color,
            new_color,
        }))
    }

    /// Asks `target` (a member name or `"everyone"`) to jump to `ea`.
    pub fn invite_to(&mut self, target: impl Into<String>, ea: u64) -> Option<Deferred> {
        if self.phase() != Phase::Joined {
            return None;
        }
        let channel = self.channel.as_mut()?;
        Some(channel.send_command(Command::InviteTo {
            name: target.into(),
            ea,
        }))
    }

    /// Other members of the current branch.
    pub fn users(&self) -> Vec<User> {
        self.core.borrow().users.values().cloned().collect()
    }

    // ─────────────────────────────────────────────────────────────────────
    // State
    // ─────────────────────────────────────────────────────────────────────

    pub fn tick(&self) -> Tick {
        self.core.borrow().record.tick
    }

    pub fn identity(&self) -> SessionIdentity {
        self.core.borrow().record.identity.clone()
    }

    pub fn phase(&self) -> Phase {
        self.core.borrow().phase
    }

    pub fn is_capturing(&self) -> bool {
        self.core.borrow().capture.is_enabled()
    }

    pub fn user(&self) -> User {
        self.core.borrow().user.clone()
    }

    /// Local events waiting for the join to be accepted.
    pub fn pending_events(&self) -> usize {
        self.core.borrow().pending.len()
    }

    /// Local events submitted but not yet acknowledged by the coordinator.
    pub fn unacknowledged_events(&self) -> usize {
        self.core.borrow().unacked.len()
    }

    fn note_connection_state(&mut self) {
        let connected = self
            .channel
            .as_ref()
            .is_some_and(CommandChannel::is_connected);
        if connected {
            return;
        }
        let mut core = self.core.borrow_mut();
        if matches!(core.phase, Phase::Joining | Phase::Joined) {
            core.phase = Phase::Disconnected;
            core.users.clear();
            warn!(tick = core.record.tick, "Session interrupted; waiting for reconnect");
        }
    }

    fn forward_captured(&mut self) {
        let (events, author, attempt) = {
            let mut core = self.core.borrow_mut();
            let captured = core.capture.drain();
            match core.phase {
                Phase::Joined => {
                    let mut events: Vec<ArtifactEvent> = core.pending.drain(..).collect();
                    events.extend(captured);
                    (events, core.user.name.clone(), core.attempt)
                }
                Phase::Joining | Phase::Disconnected => {
                    core.pending.extend(captured);
                    return;
                }
                Phase::Idle | Phase::Rejected => {
                    if !captured.is_empty() {
                        debug!(
                            dropped = captured.len(),
                            "Discarding edits captured outside a session"
                        );
                    }
                    return;
                }
            }
        };
        if events.is_empty() {
            return;
        }
        let Some(channel) = self.channel.as_mut() else {
            self.core.borrow_mut().pending.extend(events);
            return;
        };

        for event in events {
            let kind = event.kind.clone();
            self.core.borrow_mut().unacked.push_back(Unacked {
                author: author.clone(),
                event: event.clone(),
            });
            let on_accept = Rc::downgrade(&self.core);
            let on_refuse = on_accept.clone();
            channel
                .send_command(Command::SubmitEvent { event })
                .on_success(move |value| {
                    with_core(&on_accept, |core| core.attempt == attempt, |core| {
                        core.unacked.pop_front();
                        match serde_json::from_value::<EventAccepted>(value) {
                            Ok(accepted) => core.event_accepted(accepted),
                            Err(err) => warn!(error = %err, "Malformed event reply"),
                        }
                    })
                })
                .on_failure(move |err| {
                    with_core(&on_refuse, |core| core.attempt == attempt, |core| {
                        core.submit_failed(&kind, err)
                    })
                });
        }
    }
}

fn register_handlers(channel: &mut CommandChannel, core: Weak<RefCell<SessionCore>>) {
    let weak = core.clone();
    channel.on_broadcast(BroadcastKind::Event, move |broadcast| {
        if let Broadcast::Event { event } = broadcast {
            with_core(&weak, joined, |core| {
                if core.apply_remote(event) {
                    core.persist();
                }
            });
        }
    });

    let weak = core.clone();
    channel.on_broadcast(BroadcastKind::UserJoined, move |broadcast| {
        if let Broadcast::UserJoined { name, color, ea } = broadcast {
            with_core(&weak, joined, |core| {
                info!(user = %name, ea, "User joined session");
                core.users.insert(
                    name.clone(),
                    User {
                        name: name.clone(),
                        color: *color,
                    },
                );
            });
        }
    });

    let weak = core.clone();
    channel.on_broadcast(BroadcastKind::UserLeft, move |broadcast| {
        if let Broadcast::UserLeft { name } = broadcast {
            with_core(&weak, joined, |core| {
                info!(user = %name, "User left session");
                core.users.remove(name);
            });
        }
    });

    let weak = core.clone();
    channel.on_broadcast(BroadcastKind::UserRenamed, move |broadcast| {
        if let Broadcast::UserRenamed { old_name, new_name } = broadcast {
            with_core(&weak, joined, |core| {
                if let Some(mut user) = core.users.remove(old_name) {
                    user.name = new_name.clone();
                    core.users.insert(new_name.clone(), user);
                }
            });
        }
    });

    let weak = core.clone();
    channel.on_broadcast(BroadcastKind::UserColorChanged, move |broadcast| {
        if let Broadcast::UserColorChanged {
            name, new_color, ..
        } = broadcast
        {
            with_core(&weak, joined, |core| {
                if let Some(user) = core.users.get_mut(name) {
                    user.color = *new_color;
                }
            });
        }
    });

    channel.on_broadcast(BroadcastKind::InviteTo, move |broadcast| {
        if let Broadcast::InviteTo { from, ea } = broadcast {
            with_core(&core, joined, |core| core.host.invited(from, *ea));
        }
    });
}

fn joined(core: &SessionCore) -> bool {
    core.phase == Phase::Joined
}

/// Runs `apply` against the session if it still exists and `current` says
/// the callback still belongs to it.
fn with_core(
    core: &Weak<RefCell<SessionCore>>,
    current: impl FnOnce(&SessionCore) -> bool,
    apply: impl FnOnce(&mut SessionCore),
) {
    let Some(cell) = core.upgrade() else {
        return;
    };
    let Ok(mut core) = cell.try_borrow_mut() else {
        error!("Session callback re-entered while session state was borrowed");
        return;
    };
    if !current(&*core) {
        debug!("Ignoring callback for a finished session");
        return;
    }
    apply(&mut *core);
}

/// Decodes a reply payload for callers driving the channel directly.
pub fn decode_reply<T: serde::de::DeserializeOwned>(
    value: Value,
) -> std::result::Result<T, ChannelError> {
    serde_json::from_value(value).map_err(|err| ChannelError::Decode(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::SourceTap;
    use crate::record::SidecarStore;
    use serde_json::json;
    use std::cell::Cell;
    use std::net::{TcpListener, TcpStream};
    use std::sync::mpsc;
    use std::thread;
    use tandem_protocol::frame::{read_frame, write_frame};
    use tandem_protocol::{ErrorCode, Frame, Response};

    #[derive(Clone, Default)]
    struct RecordingHost {
        applied: Rc<RefCell<Vec<Tick>>>,
        echo: Rc<RefCell<Option<SourceTap>>>,
        fail: Rc<Cell<bool>>,
    }

    impl Host for RecordingHost {
        fn apply_event(&mut self, event: &StampedEvent) -> std::result::Result<(), String> {
            self.applied.borrow_mut().push(event.tick);
            // The host's own hooks observe the mutation it just made.
            if let Some(tap) = self.echo.borrow().as_ref() {
                tap.record(event.event.clone());
            }
            if self.fail.get() {
                return Err("apply failed".to_string());
            }
            Ok(())
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        artifact: std::path::PathBuf,
        controller: SessionController,
        host: RecordingHost,
        taps: Vec<SourceTap>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("sample.i64");
        let (capture, taps) = CaptureMultiplexer::with_taps();
        let host = RecordingHost::default();
        *host.echo.borrow_mut() = Some(taps[0].clone());
        let controller = SessionController::new(
            SidecarStore::for_artifact(&artifact),
            capture,
            host.clone(),
            User {
                name: "alice".to_string(),
                color: 0xff,
            },
        );
        Fixture {
            _dir: dir,
            artifact,
            controller,
            host,
            taps,
        }
    }

    /// Fake coordinator that answers the join with `reply` and then runs
    /// `rest` against the stream.
    fn scripted_channel(
        reply: impl FnOnce(u64) -> Response + Send + 'static,
        rest: impl FnOnce(TcpStream) + Send + 'static,
    ) -> CommandChannel {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let id = match read_frame(&mut stream).unwrap().unwrap() {
                Frame::Request(request) => request.id,
                other => panic!("expected join request, got {:?}", other),
            };
            write_frame(&mut stream, &Frame::Response(reply(id))).unwrap();
            rest(stream);
        });
        CommandChannel::connect(addr).unwrap()
    }

    fn stamped(tick: Tick) -> StampedEvent {
        StampedEvent {
            tick,
            author: "bob".to_string(),
            event: ArtifactEvent::new("renamed", json!({ "tick": tick })),
        }
    }

    fn pump_until(controller: &mut SessionController, done: impl Fn(&SessionController) -> bool) {
        for _ in 0..200 {
            controller.pump_timeout(Duration::from_millis(25));
            if done(controller) {
                return;
            }
        }
        panic!("condition not reached");
    }

    #[test]
    fn identity_survives_reopen() {
        let mut fx = fixture();
        fx.controller.bind_identity("demo", "main").unwrap();

        let (capture, _taps) = CaptureMultiplexer::with_taps();
        let mut reopened = SessionController::new(
            SidecarStore::for_artifact(&fx.artifact),
            capture,
            RecordingHost::default(),
            fx.controller.user(),
        );
        let identity = reopened.load_identity();
        assert_eq!(identity, SessionIdentity::new("demo", "main"));
        assert!(!reopened.is_capturing());
    }

    #[test]
    fn join_is_noop_when_unbound() {
        let mut fx = fixture();
        let channel = scripted_channel(|id| Response::ok(id, Value::Null), |_| {});
        fx.controller.attach(channel);
        assert!(fx.controller.join().unwrap().is_none());
        assert!(!fx.controller.is_capturing());
        assert_eq!(fx.controller.phase(), Phase::Idle);
    }

    #[test]
    fn join_replays_history_and_adopts_branch_tick() {
        let mut fx = fixture();
        fx.controller.bind_identity("demo", "main").unwrap();
        let channel = scripted_channel(
            |id| {
                Response::from_serialize(
                    id,
                    &JoinAccepted {
                        tick: 3,
                        events: vec![stamped(1), stamped(2), stamped(3)],
                        users: vec![User {
                            name: "bob".to_string(),
                            color: 1,
                        }],
                    },
                )
            },
            |mut stream| {
                let _ = read_frame(&mut stream);
            },
        );
        fx.controller.attach(channel);
        fx.controller.join().unwrap().unwrap();
        assert!(fx.controller.is_capturing());
        assert_eq!(fx.controller.phase(), Phase::Joining);

        pump_until(&mut fx.controller, |c| c.phase() == Phase::Joined);
        assert_eq!(fx.controller.tick(), 3);
        assert_eq!(*fx.host.applied.borrow(), vec![1, 2, 3]);
        assert_eq!(fx.controller.users().len(), 1);
        assert!(fx.controller.is_capturing());
        // Replayed edits were not re-captured.
        assert_eq!(fx.controller.pending_events(), 0);
        assert_eq!(
            SidecarStore::for_artifact(&fx.artifact).load().tick,
            3
        );
    }

    #[test]
    fn version_conflict_disables_capture_and_discards_buffered_edits() {
        let mut fx = fixture();
        fx.controller.bind_identity("demo", "main").unwrap();
        let channel = scripted_channel(
            |id| Response::error(id, ErrorCode::VersionConflict, "ahead of branch"),
            |mut stream| {
                let _ = read_frame(&mut stream);
            },
        );
        fx.controller.attach(channel);

        let refused = Rc::new(Cell::new(false));
        let flag = Rc::clone(&refused);
        fx.controller
            .join()
            .unwrap()
            .unwrap()
            .on_failure(move |err| flag.set(err.is_version_conflict()));
        fx.taps[2].record(ArtifactEvent::new("commented", json!({})));

        pump_until(&mut fx.controller, |c| c.phase() == Phase::Rejected);
        assert!(refused.get());
        assert!(!fx.controller.is_capturing());
        assert_eq!(fx.controller.pending_events(), 0);
        assert_eq!(fx.controller.identity(), SessionIdentity::new("demo", "main"));
    }

    #[test]
    fn closing_twice_matches_closing_once() {
        let mut fx = fixture();
        fx.controller.bind_identity("demo", "main").unwrap();
        let channel = scripted_channel(
            |id| {
                Response::from_serialize(
                    id,
                    &JoinAccepted {
                        tick: 0,
                        events: Vec::new(),
                        users: Vec::new(),
                    },
                )
            },
            |mut stream| {
                let _ = read_frame(&mut stream);
                let _ = read_frame(&mut stream);
            },
        );
        fx.controller.attach(channel);
        fx.controller.join().unwrap();
        pump_until(&mut fx.controller, |c| c.phase() == Phase::Joined);

        fx.controller.on_artifact_closing();
        let after_once = (
            fx.controller.identity(),
            fx.controller.tick(),
            fx.controller.is_capturing(),
            fx.controller.phase(),
        );
        fx.controller.on_artifact_closing();
        let after_twice = (
            fx.controller.identity(),
            fx.controller.tick(),
            fx.controller.is_capturing(),
            fx.controller.phase(),
        );

        assert_eq!(after_once, after_twice);
        assert!(!after_once.0.is_bound());
        assert!(!after_once.2);
        assert_eq!(
            SidecarStore::for_artifact(&fx.artifact).load(),
            SessionRecord::default()
        );
    }

    #[test]
    fn closing_without_session_only_disables_capture() {
        let mut fx = fixture();
        fx.controller.on_artifact_closing();
        assert!(!fx.controller.is_capturing());
        assert!(!SidecarStore::for_artifact(&fx.artifact).path().exists());
    }

    #[test]
    fn failed_apply_still_restores_capture_and_advances() {
        let mut fx = fixture();
        fx.controller.bind_identity("demo", "main").unwrap();
        fx.host.fail.set(true);
        let channel = scripted_channel(
            |id| {
                Response::from_serialize(
                    id,
                    &JoinAccepted {
                        tick: 1,
                        events: vec![stamped(1)],
                        users: Vec::new(),
                    },
                )
            },
            |mut stream| {
                let _ = read_frame(&mut stream);
            },
        );
        fx.controller.attach(channel);
        fx.controller.join().unwrap();
        pump_until(&mut fx.controller, |c| c.phase() == Phase::Joined);

        assert!(fx.controller.is_capturing());
        assert_eq!(fx.controller.tick(), 1);
    }

    #[test]
    fn connection_loss_keeps_session_state() {
        let mut fx = fixture();
        fx.controller.bind_identity("demo", "main").unwrap();
        let channel = scripted_channel(
            |id| {
                Response::from_serialize(
                    id,
                    &JoinAccepted {
                        tick: 5,
                        events: Vec::new(),
                        users: Vec::new(),
                    },
                )
            },
            drop,
        );
        fx.controller.attach(channel);
        fx.controller.join().unwrap();

        pump_until(&mut fx.controller, |c| c.phase() == Phase::Disconnected);
        assert_eq!(fx.controller.tick(), 5);
        assert_eq!(fx.controller.identity(), SessionIdentity::new("demo", "main"));
        assert!(fx.controller.is_capturing());

        fx.taps[1].record(ArtifactEvent::new("retyped", json!({})));
        fx.controller.pump();
        assert_eq!(fx.controller.pending_events(), 1);
    }

    fn accept_join(id: u64, tick: Tick, events: Vec<StampedEvent>) -> Response {
        Response::from_serialize(
            id,
            &JoinAccepted {
                tick,
                events,
                users: Vec::new(),
            },
        )
    }

    fn read_command(stream: &mut TcpStream) -> Option<(u64, Command)> {
        match read_frame(stream) {
            Ok(Some(Frame::Request(request))) => Some((request.id, request.command)),
            _ => None,
        }
    }

    /// Joins at tick 0, submits one local edit and loses the connection
    /// before the coordinator answers it.
    fn lose_connection_with_edit_in_flight(fx: &mut Fixture, edit: &ArtifactEvent) {
        fx.controller.bind_identity("demo", "main").unwrap();
        let (seen_tx, seen_rx) = mpsc::channel();
        let channel = scripted_channel(
            |id| accept_join(id, 0, Vec::new()),
            move |mut stream| {
                let _ = seen_tx.send(read_command(&mut stream).map(|(_, command)| command));
            },
        );
        fx.controller.attach(channel);
        fx.controller.join().unwrap();
        pump_until(&mut fx.controller, |c| c.phase() == Phase::Joined);

        fx.taps[1].record(edit.clone());
        pump_until(&mut fx.controller, |c| c.phase() == Phase::Disconnected);
        let submitted = seen_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(
            submitted,
            Some(Command::SubmitEvent {
                event: edit.clone()
            })
        );
        assert_eq!(fx.controller.unacknowledged_events(), 1);
    }

    #[test]
    fn edit_lost_in_flight_is_resubmitted_after_reconnect() {
        let mut fx = fixture();
        let edit = ArtifactEvent::new("renamed", json!({ "name": "X" }));
        lose_connection_with_edit_in_flight(&mut fx, &edit);

        let (resent_tx, resent_rx) = mpsc::channel();
        let channel = scripted_channel(
            |id| accept_join(id, 0, Vec::new()),
            move |mut stream| {
                if let Some((id, command)) = read_command(&mut stream) {
                    let accepted = Response::from_serialize(id, &EventAccepted { tick: 1 });
                    write_frame(&mut stream, &Frame::Response(accepted)).unwrap();
                    let _ = resent_tx.send(command);
                }
                let _ = read_frame(&mut stream);
            },
        );
        fx.controller.reconnect(channel).unwrap().unwrap();
        pump_until(&mut fx.controller, |c| c.phase() == Phase::Joined && c.tick() == 1);

        let resent = resent_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(resent, Command::SubmitEvent { event: edit });
        assert_eq!(fx.controller.unacknowledged_events(), 0);
        assert_eq!(fx.controller.pending_events(), 0);
        assert!(fx.host.applied.borrow().is_empty());
    }

    #[test]
    fn edit_stamped_before_connection_loss_is_neither_replayed_nor_resent() {
        let mut fx = fixture();
        let edit = ArtifactEvent::new("renamed", json!({ "name": "X" }));
        lose_connection_with_edit_in_flight(&mut fx, &edit);

        let history = vec![
            StampedEvent {
                tick: 1,
                author: "alice".to_string(),
                event: edit,
            },
            stamped(2),
        ];
        let (next_tx, next_rx) = mpsc::channel();
        let channel = scripted_channel(
            move |id| accept_join(id, 2, history),
            move |mut stream| {
                stream
                    .set_read_timeout(Some(Duration::from_millis(500)))
                    .unwrap();
                let _ = next_tx.send(read_command(&mut stream));
            },
        );
        fx.controller.reconnect(channel).unwrap().unwrap();
        pump_until(&mut fx.controller, |c| c.phase() == Phase::Joined);

        assert_eq!(fx.controller.tick(), 2);
        // Only the other member's edit reached the host.
        assert_eq!(*fx.host.applied.borrow(), vec![2]);
        assert_eq!(fx.controller.unacknowledged_events(), 0);
        assert_eq!(next_rx.recv_timeout(Duration::from_secs(5)).unwrap(), None);
    }
}
