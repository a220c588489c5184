//! Coordinator registry: repositories, branches, membership and tick
//! assignment.
//!
//! Every branch has its own lock. Assigning a tick, persisting the event and
//! queueing the resulting frames to members all happen while that branch is
//! locked, so every member observes the same order for a branch. Frames are
//! queued to per-connection outboxes drained by writer threads; a slow reader
//! never holds up the lock holder. Different branches never contend.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{mpsc, Arc, Mutex, MutexGuard};

use tandem_protocol::{
    ArtifactEvent, Branch, Broadcast, DatabaseSnapshot, ErrorCode, ErrorInfo, EventAccepted,
    Frame, JoinAccepted, Repository, Response, StampedEvent, Tick, User, EVERYONE, NO_HISTORY,
};
use tracing::{debug, info, warn};

use crate::db::Db;

pub type ConnectionId = u64;

/// Write side of one client connection.
#[derive(Debug, Clone)]
pub struct Peer {
    id: ConnectionId,
    outbox: mpsc::Sender<Frame>,
}

impl Peer {
    pub fn new(id: ConnectionId, outbox: mpsc::Sender<Frame>) -> Self {
        Self { id, outbox }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queues a frame for the connection's writer. Returns `false` once the
    /// writer has gone away.
    pub fn send(&self, frame: Frame) -> bool {
        self.outbox.send(frame).is_ok()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BranchKey {
    pub repo: String,
    pub branch: String,
}

impl BranchKey {
    pub fn new(repo: impl Into<String>, branch: impl Into<String>) -> Self {
        Self {
            repo: repo.into(),
            branch: branch.into(),
        }
    }
}

impl fmt::Display for BranchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.repo, self.branch)
    }
}

/// What a connection holds while it is joined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Membership {
    pub key: BranchKey,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct JoinRequest {
    pub key: BranchKey,
    pub tick: Tick,
    pub user: User,
    pub ea: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("claimed tick {claimed} is ahead of branch {key} at tick {authoritative}")]
    VersionConflict {
        key: BranchKey,
        claimed: Tick,
        authoritative: Tick,
    },

    #[error("branch {0} has no recorded history")]
    NoHistory(BranchKey),

    #[error("repository already exists: {0}")]
    RepositoryExists(String),

    #[error("branch already exists: {0}")]
    BranchExists(BranchKey),

    #[error("repository not found: {0}")]
    RepositoryNotFound(String),

    #[error("branch not found: {0}")]
    BranchNotFound(BranchKey),

    #[error("not joined to a session")]
    NotJoined,

    #[error("branch {0} has active members")]
    BranchInUse(BranchKey),

    #[error("storage error: {0}")]
    Storage(String),
}

impl RegistryError {
    pub fn code(&self) -> ErrorCode {
        match self {
            RegistryError::VersionConflict { .. } | RegistryError::NoHistory(_) => {
                ErrorCode::VersionConflict
            }
            RegistryError::RepositoryExists(_) | RegistryError::BranchExists(_) => {
                ErrorCode::NameConflict
            }
            RegistryError::RepositoryNotFound(_) | RegistryError::BranchNotFound(_) => {
                ErrorCode::NotFound
            }
            RegistryError::NotJoined => ErrorCode::NotJoined,
            RegistryError::BranchInUse(_) => ErrorCode::InvalidParams,
            RegistryError::Storage(_) => ErrorCode::Internal,
        }
    }
}

impl From<RegistryError> for ErrorInfo {
    fn from(err: RegistryError) -> Self {
        ErrorInfo::new(err.code(), err.to_string())
    }
}

struct Member {
    user: User,
    peer: Peer,
}

struct BranchState {
    tick: Tick,
    members: BTreeMap<ConnectionId, Member>,
}

impl BranchState {
    fn broadcast_except(&self, key: &BranchKey, sender: ConnectionId, broadcast: &Broadcast) {
        for (id, member) in &self.members {
            if *id == sender {
                continue;
            }
            if !member.peer.send(Frame::Broadcast(broadcast.clone())) {
                debug!(connection = id, branch = %key, "Dropping broadcast to closed connection");
            }
        }
    }

    fn sender_name(&self, sender: ConnectionId) -> Option<&str> {
        self.members
            .get(&sender)
            .map(|member| member.user.name.as_str())
    }
}

pub struct Registry {
    db: Db,
    branches: Mutex<HashMap<BranchKey, Arc<Mutex<BranchState>>>>,
}

impl Registry {
    pub fn new(db: Db) -> Self {
        Self {
            db,
            branches: Mutex::new(HashMap::new()),
        }
    }

    pub fn repositories(&self) -> Result<Vec<Repository>, RegistryError> {
        self.db.list_repositories().map_err(RegistryError::Storage)
    }

    pub fn branches(&self, repo: &str) -> Result<Vec<Branch>, RegistryError> {
        self.require_repository(repo)?;
        self.db.list_branches(repo).map_err(RegistryError::Storage)
    }

    pub fn new_repository(&self, repo: Repository) -> Result<Repository, RegistryError> {
        if !self
            .db
            .insert_repository(&repo)
            .map_err(RegistryError::Storage)?
        {
            return Err(RegistryError::RepositoryExists(repo.name));
        }
        info!(repo = %repo.name, hash = %repo.hash, "Repository created");
        Ok(repo)
    }

    /// New branches always start without history, whatever tick the client
    /// proposed.
    pub fn new_branch(&self, mut branch: Branch) -> Result<Branch, RegistryError> {
        self.require_repository(&branch.repo)?;
        branch.tick = NO_HISTORY;
        if !self.db.insert_branch(&branch).map_err(RegistryError::Storage)? {
            return Err(RegistryError::BranchExists(BranchKey::new(
                branch.repo,
                branch.name,
            )));
        }
        info!(repo = %branch.repo, branch = %branch.name, "Branch created");
        Ok(branch)
    }

    /// Stores the base snapshot of a branch and makes it joinable at tick 0.
    pub fn upload_database(
        &self,
        key: &BranchKey,
        content: &[u8],
    ) -> Result<Branch, RegistryError> {
        let state = self.branch_state(key)?;
        let mut state = lock(&state);
        if !state.members.is_empty() {
            return Err(RegistryError::BranchInUse(key.clone()));
        }

        self.db
            .store_snapshot(&key.repo, &key.branch, content)
            .map_err(RegistryError::Storage)?;
        state.tick = 0;
        info!(branch = %key, bytes = content.len(), "Branch snapshot uploaded");

        self.db
            .get_branch(&key.repo, &key.branch)
            .map_err(RegistryError::Storage)?
            .ok_or_else(|| RegistryError::BranchNotFound(key.clone()))
    }

    pub fn download_database(&self, key: &BranchKey) -> Result<DatabaseSnapshot, RegistryError> {
        match self
            .db
            .load_snapshot(&key.repo, &key.branch)
            .map_err(RegistryError::Storage)?
        {
            Some(content) => Ok(DatabaseSnapshot {
                repo: key.repo.clone(),
                branch: key.branch.clone(),
                content,
            }),
            None => match self
                .db
                .get_branch(&key.repo, &key.branch)
                .map_err(RegistryError::Storage)?
            {
                Some(_) => Err(RegistryError::NoHistory(key.clone())),
                None => Err(RegistryError::BranchNotFound(key.clone())),
            },
        }
    }

    /// Admits `peer` to a branch.
    ///
    /// On success the join reply (authoritative tick plus the history after the
    /// claimed tick) has already been queued to the peer, ahead of any live
    /// broadcast it will receive. On error nothing was queued and no
    /// membership exists.
    pub fn join(
        &self,
        peer: &Peer,
        request_id: u64,
        request: JoinRequest,
    ) -> Result<Membership, RegistryError> {
        self.require_repository(&request.key.repo)?;
        let state = self.branch_state(&request.key)?;
        let mut state = lock(&state);

        if state.tick == NO_HISTORY {
            return Err(RegistryError::NoHistory(request.key));
        }
        if request.tick > state.tick {
            return Err(RegistryError::VersionConflict {
                key: request.key,
                claimed: request.tick,
                authoritative: state.tick,
            });
        }

        let events = self
            .db
            .events_after(&request.key.repo, &request.key.branch, request.tick)
            .map_err(RegistryError::Storage)?;
        let users = state
            .members
            .values()
            .map(|member| member.user.clone())
            .collect();
        let accepted = JoinAccepted {
            tick: state.tick,
            events,
            users,
        };
        peer.send(Frame::Response(Response::from_serialize(
            request_id, &accepted,
        )));

        state.broadcast_except(
            &request.key,
            peer.id,
            &Broadcast::UserJoined {
                name: request.user.name.clone(),
                color: request.user.color,
                ea: request.ea,
            },
        );
        info!(
            connection = peer.id,
            branch = %request.key,
            user = %request.user.name,
            claimed_tick = request.tick,
            tick = state.tick,
            replayed = accepted.events.len(),
            "User joined"
        );

        let membership = Membership {
            key: request.key,
            name: request.user.name.clone(),
        };
        state.members.insert(
            peer.id,
            Member {
                user: request.user,
                peer: peer.clone(),
            },
        );
        Ok(membership)
    }

    pub fn leave(&self, peer_id: ConnectionId, membership: &Membership) {
        let Some(state) = self.cached_branch(&membership.key) else {
            return;
        };
        let mut state = lock(&state);
        let Some(member) = state.members.remove(&peer_id) else {
            return;
        };
        state.broadcast_except(
            &membership.key,
            peer_id,
            &Broadcast::UserLeft {
                name: member.user.name.clone(),
            },
        );
        info!(
            connection = peer_id,
            branch = %membership.key,
            user = %member.user.name,
            remaining = state.members.len(),
            "User left"
        );
    }

    /// Implicit leave for whatever membership the connection held.
    pub fn disconnect(&self, peer_id: ConnectionId, membership: Option<&Membership>) {
        if let Some(membership) = membership {
            self.leave(peer_id, membership);
        }
        debug!(connection = peer_id, "Connection released");
    }

    /// Stamps `event` with the next branch tick, persists it, replies to the
    /// sender and broadcasts it to every other member.
    pub fn submit_event(
        &self,
        peer: &Peer,
        request_id: u64,
        membership: &Membership,
        event: ArtifactEvent,
    ) -> Result<Tick, RegistryError> {
        let state = self
            .cached_branch(&membership.key)
            .ok_or(RegistryError::NotJoined)?;
        let mut state = lock(&state);
        let author = state
            .sender_name(peer.id)
            .ok_or(RegistryError::NotJoined)?
            .to_string();

        let tick = state.tick + 1;
        let stamped = StampedEvent {
            tick,
            author,
            event,
        };
        self.db
            .append_event(&membership.key.repo, &membership.key.branch, &stamped)
            .map_err(RegistryError::Storage)?;
        state.tick = tick;

        peer.send(Frame::Response(Response::from_serialize(
            request_id,
            &EventAccepted { tick },
        )));
        debug!(
            branch = %membership.key,
            tick,
            kind = %stamped.event.kind,
            author = %stamped.author,
            "Event accepted"
        );
        state.broadcast_except(
            &membership.key,
            peer.id,
            &Broadcast::Event { event: stamped },
        );
        Ok(tick)
    }

    pub fn rename_user(&self, peer_id: ConnectionId, membership: &mut Membership, new_name: &str) {
        let Some(state) = self.cached_branch(&membership.key) else {
            return;
        };
        let mut state = lock(&state);
        let Some(member) = state.members.get_mut(&peer_id) else {
            return;
        };
        let old_name = std::mem::replace(&mut member.user.name, new_name.to_string());
        membership.name = new_name.to_string();
        state.broadcast_except(
            &membership.key,
            peer_id,
            &Broadcast::UserRenamed {
                old_name,
                new_name: new_name.to_string(),
            },
        );
    }

    pub fn change_color(&self, peer_id: ConnectionId, membership: &Membership, new_color: u32) {
        let Some(state) = self.cached_branch(&membership.key) else {
            return;
        };
        let mut state = lock(&state);
        let Some(member) = state.members.get_mut(&peer_id) else {
            return;
        };
        let old_color = std::mem::replace(&mut member.user.color, new_color);
        let name = member.user.name.clone();
        state.broadcast_except(
            &membership.key,
            peer_id,
            &Broadcast::UserColorChanged {
                name,
                old_color,
                new_color,
            },
        );
    }

    /// Relays an invitation to one named member, or to every other member
    /// when `target` is [`EVERYONE`].
    pub fn invite(&self, peer_id: ConnectionId, membership: &Membership, target: &str, ea: u64) {
        let Some(state) = self.cached_branch(&membership.key) else {
            return;
        };
        let state = lock(&state);
        let Some(from) = state.sender_name(peer_id).map(str::to_string) else {
            return;
        };
        let invite = Broadcast::InviteTo { from, ea };

        if target == EVERYONE {
            state.broadcast_except(&membership.key, peer_id, &invite);
            return;
        }

        let recipient = state
            .members
            .iter()
            .find(|(id, member)| **id != peer_id && member.user.name == target);
        match recipient {
            Some((_, member)) => {
                member.peer.send(Frame::Broadcast(invite));
            }
            None => {
                warn!(branch = %membership.key, target = %target, "Invite target not in session");
            }
        }
    }

    /// Members currently joined to a branch.
    pub fn members(&self, key: &BranchKey) -> Vec<User> {
        match self.cached_branch(key) {
            Some(state) => lock(&state)
                .members
                .values()
                .map(|member| member.user.clone())
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn branch_tick(&self, key: &BranchKey) -> Result<Tick, RegistryError> {
        let state = self.branch_state(key)?;
        let tick = lock(&state).tick;
        Ok(tick)
    }

    fn require_repository(&self, repo: &str) -> Result<(), RegistryError> {
        match self.db.get_repository(repo).map_err(RegistryError::Storage)? {
            Some(_) => Ok(()),
            None => Err(RegistryError::RepositoryNotFound(repo.to_string())),
        }
    }

    fn cached_branch(&self, key: &BranchKey) -> Option<Arc<Mutex<BranchState>>> {
        lock(&self.branches).get(key).map(Arc::clone)
    }

    fn branch_state(&self, key: &BranchKey) -> Result<Arc<Mutex<BranchState>>, RegistryError> {
        let mut branches = lock(&self.branches);
        if let Some(state) = branches.get(key) {
            return Ok(Arc::clone(state));
        }

        let branch = self
            .db
            .get_branch(&key.repo, &key.branch)
            .map_err(RegistryError::Storage)?
            .ok_or_else(|| RegistryError::BranchNotFound(key.clone()))?;
        let state = Arc::new(Mutex::new(BranchState {
            tick: branch.tick,
            members: BTreeMap::new(),
        }));
        branches.insert(key.clone(), Arc::clone(&state));
        Ok(state)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tandem_protocol::BroadcastKind;

    fn registry() -> (tempfile::TempDir, Registry) {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let db = Db::new(temp_dir.path().join("coordinator.db")).expect("db init");
        let registry = Registry::new(db);
        registry
            .new_repository(Repository::new("demo", "abc123", "demo.exe", "PE"))
            .expect("repo");
        registry
            .new_branch(Branch::new("demo", "main"))
            .expect("branch");
        registry
            .upload_database(&key(), b"base")
            .expect("upload");
        (temp_dir, registry)
    }

    fn key() -> BranchKey {
        BranchKey::new("demo", "main")
    }

    fn peer(id: ConnectionId) -> (Peer, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel();
        (Peer::new(id, tx), rx)
    }

    fn join_request(name: &str, tick: Tick) -> JoinRequest {
        JoinRequest {
            key: key(),
            tick,
            user: User {
                name: name.to_string(),
                color: 0xff0000,
            },
            ea: 0x1000,
        }
    }

    fn drain(rx: &mpsc::Receiver<Frame>) -> Vec<Frame> {
        rx.try_iter().collect()
    }

    fn event(kind: &str) -> ArtifactEvent {
        ArtifactEvent::new(kind, json!({ "ea": 4096 }))
    }

    fn join_reply(frame: &Frame) -> JoinAccepted {
        match frame {
            Frame::Response(response) => {
                serde_json::from_value(response.clone().into_result().expect("ok reply"))
                    .expect("join payload")
            }
            other => panic!("expected response, got {:?}", other),
        }
    }

    fn broadcast_ticks(frames: &[Frame]) -> Vec<Tick> {
        frames
            .iter()
            .filter_map(|frame| match frame {
                Frame::Broadcast(Broadcast::Event { event }) => Some(event.tick),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn duplicate_repository_is_name_conflict() {
        let (_dir, registry) = registry();
        let err = registry
            .new_repository(Repository::new("demo", "other", "demo.exe", "PE"))
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::NameConflict);
        assert_eq!(registry.repositories().unwrap().len(), 1);
    }

    #[test]
    fn duplicate_branch_is_name_conflict() {
        let (_dir, registry) = registry();
        let err = registry.new_branch(Branch::new("demo", "main")).unwrap_err();
        assert_eq!(err.code(), ErrorCode::NameConflict);
        assert_eq!(registry.branches("demo").unwrap().len(), 1);
    }

    #[test]
    fn new_branch_ignores_proposed_tick() {
        let (_dir, registry) = registry();
        let mut branch = Branch::new("demo", "feature");
        branch.tick = 42;
        let created = registry.new_branch(branch).expect("branch");
        assert_eq!(created.tick, NO_HISTORY);
    }

    #[test]
    fn branch_in_unknown_repository_is_not_found() {
        let (_dir, registry) = registry();
        let err = registry.new_branch(Branch::new("nope", "main")).unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);
    }

    #[test]
    fn join_ahead_of_branch_is_version_conflict() {
        let (_dir, registry) = registry();
        let (writer, _writer_rx) = peer(1);
        let membership = registry
            .join(&writer, 1, join_request("alice", 0))
            .expect("join");
        for n in 0..7 {
            registry
                .submit_event(&writer, 10 + n, &membership, event("renamed"))
                .expect("submit");
        }
        assert_eq!(registry.branch_tick(&key()).unwrap(), 7);

        let (late, late_rx) = peer(2);
        let err = registry
            .join(&late, 1, join_request("bob", 10))
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::VersionConflict);
        assert!(drain(&late_rx).is_empty());
        assert_eq!(registry.members(&key()).len(), 1);
    }

    #[test]
    fn join_on_branch_without_history_is_rejected() {
        let (_dir, registry) = registry();
        registry
            .new_branch(Branch::new("demo", "empty"))
            .expect("branch");
        let (client, _rx) = peer(1);
        let mut request = join_request("alice", 0);
        request.key = BranchKey::new("demo", "empty");
        let err = registry.join(&client, 1, request).unwrap_err();
        assert!(matches!(err, RegistryError::NoHistory(_)));
    }

    #[test]
    fn join_replays_remainder_after_claimed_tick() {
        let (_dir, registry) = registry();
        let (writer, _writer_rx) = peer(1);
        let membership = registry
            .join(&writer, 1, join_request("alice", 0))
            .expect("join");
        for n in 0..5 {
            registry
                .submit_event(&writer, 10 + n, &membership, event("commented"))
                .expect("submit");
        }

        let (reader, reader_rx) = peer(2);
        registry
            .join(&reader, 99, join_request("bob", 2))
            .expect("join");
        let frames = drain(&reader_rx);
        assert_eq!(frames.len(), 1);
        let accepted = join_reply(&frames[0]);
        assert_eq!(accepted.tick, 5);
        let ticks: Vec<Tick> = accepted.events.iter().map(|e| e.tick).collect();
        assert_eq!(ticks, vec![3, 4, 5]);
        assert_eq!(accepted.users.len(), 1);
        assert_eq!(accepted.users[0].name, "alice");
    }

    #[test]
    fn events_are_broadcast_to_others_but_not_sender() {
        let (_dir, registry) = registry();
        let (alice, alice_rx) = peer(1);
        let (bob, bob_rx) = peer(2);
        let alice_membership = registry.join(&alice, 1, join_request("alice", 0)).unwrap();
        registry.join(&bob, 1, join_request("bob", 0)).unwrap();
        drain(&alice_rx);
        drain(&bob_rx);

        let tick = registry
            .submit_event(&alice, 2, &alice_membership, event("renamed"))
            .expect("submit");
        assert_eq!(tick, 1);

        let alice_frames = drain(&alice_rx);
        assert_eq!(alice_frames.len(), 1);
        assert!(matches!(&alice_frames[0], Frame::Response(r) if r.id == 2 && r.ok));
        assert!(broadcast_ticks(&alice_frames).is_empty());

        let bob_frames = drain(&bob_rx);
        assert_eq!(broadcast_ticks(&bob_frames), vec![1]);
        match &bob_frames[0] {
            Frame::Broadcast(Broadcast::Event { event }) => assert_eq!(event.author, "alice"),
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn back_to_back_events_keep_one_order() {
        let (_dir, registry) = registry();
        let (alice, alice_rx) = peer(1);
        let (bob, bob_rx) = peer(2);
        let alice_membership = registry.join(&alice, 1, join_request("alice", 0)).unwrap();
        let bob_membership = registry.join(&bob, 1, join_request("bob", 0)).unwrap();
        drain(&alice_rx);
        drain(&bob_rx);

        registry
            .submit_event(&alice, 2, &alice_membership, event("rename X"))
            .unwrap();
        registry
            .submit_event(&bob, 2, &bob_membership, event("rename Y"))
            .unwrap();

        assert_eq!(broadcast_ticks(&drain(&alice_rx)), vec![2]);
        assert_eq!(broadcast_ticks(&drain(&bob_rx)), vec![1]);
        assert_eq!(registry.branch_tick(&key()).unwrap(), 2);
    }

    #[test]
    fn join_announces_presence_to_existing_members() {
        let (_dir, registry) = registry();
        let (alice, alice_rx) = peer(1);
        let (bob, _bob_rx) = peer(2);
        registry.join(&alice, 1, join_request("alice", 0)).unwrap();
        drain(&alice_rx);
        registry.join(&bob, 1, join_request("bob", 0)).unwrap();

        let frames = drain(&alice_rx);
        assert_eq!(frames.len(), 1);
        match &frames[0] {
            Frame::Broadcast(broadcast) => {
                assert_eq!(broadcast.kind(), BroadcastKind::UserJoined)
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn disconnect_is_implicit_leave() {
        let (_dir, registry) = registry();
        let (alice, alice_rx) = peer(1);
        let (bob, _bob_rx) = peer(2);
        registry.join(&alice, 1, join_request("alice", 0)).unwrap();
        let bob_membership = registry.join(&bob, 1, join_request("bob", 0)).unwrap();
        drain(&alice_rx);

        registry.disconnect(bob.id(), Some(&bob_membership));

        assert_eq!(registry.members(&key()).len(), 1);
        let frames = drain(&alice_rx);
        assert_eq!(
            frames,
            vec![Frame::Broadcast(Broadcast::UserLeft {
                name: "bob".to_string()
            })]
        );
    }

    #[test]
    fn submit_after_leave_is_not_joined() {
        let (_dir, registry) = registry();
        let (alice, _rx) = peer(1);
        let membership = registry.join(&alice, 1, join_request("alice", 0)).unwrap();
        registry.leave(alice.id(), &membership);
        let err = registry
            .submit_event(&alice, 2, &membership, event("renamed"))
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotJoined);
        assert_eq!(registry.branch_tick(&key()).unwrap(), 0);
    }

    #[test]
    fn upload_is_refused_while_members_are_joined() {
        let (_dir, registry) = registry();
        let (alice, _rx) = peer(1);
        registry.join(&alice, 1, join_request("alice", 0)).unwrap();
        let err = registry.upload_database(&key(), b"new").unwrap_err();
        assert!(matches!(err, RegistryError::BranchInUse(_)));
    }

    #[test]
    fn download_returns_uploaded_snapshot() {
        let (_dir, registry) = registry();
        let snapshot = registry.download_database(&key()).expect("download");
        assert_eq!(snapshot.content, b"base".to_vec());

        registry
            .new_branch(Branch::new("demo", "empty"))
            .expect("branch");
        let err = registry
            .download_database(&BranchKey::new("demo", "empty"))
            .unwrap_err();
        assert!(matches!(err, RegistryError::NoHistory(_)));
    }

    #[test]
    fn invite_reaches_only_the_named_member() {
        let (_dir, registry) = registry();
        let (alice, _alice_rx) = peer(1);
        let (bob, bob_rx) = peer(2);
        let (carol, carol_rx) = peer(3);
        let alice_membership = registry.join(&alice, 1, join_request("alice", 0)).unwrap();
        registry.join(&bob, 1, join_request("bob", 0)).unwrap();
        registry.join(&carol, 1, join_request("carol", 0)).unwrap();
        drain(&bob_rx);
        drain(&carol_rx);

        registry.invite(alice.id(), &alice_membership, "carol", 0x401000);

        assert!(drain(&bob_rx).is_empty());
        assert_eq!(
            drain(&carol_rx),
            vec![Frame::Broadcast(Broadcast::InviteTo {
                from: "alice".to_string(),
                ea: 0x401000
            })]
        );
    }

    #[test]
    fn rename_updates_author_of_later_events() {
        let (_dir, registry) = registry();
        let (alice, _alice_rx) = peer(1);
        let (bob, bob_rx) = peer(2);
        let mut membership = registry.join(&alice, 1, join_request("alice", 0)).unwrap();
        registry.join(&bob, 1, join_request("bob", 0)).unwrap();
        drain(&bob_rx);

        registry.rename_user(alice.id(), &mut membership, "alicia");
        registry
            .submit_event(&alice, 2, &membership, event("renamed"))
            .unwrap();

        let frames = drain(&bob_rx);
        assert_eq!(frames.len(), 2);
        assert_eq!(
            frames[0],
            Frame::Broadcast(Broadcast::UserRenamed {
                old_name: "alice".to_string(),
                new_name: "alicia".to_string()
            })
        );
        match &frames[1] {
            Frame::Broadcast(Broadcast::Event { event }) => assert_eq!(event.author, "alicia"),
            other => panic!("unexpected frame {:?}", other),
        }
        assert_eq!(membership.name, "alicia");
    }
}
