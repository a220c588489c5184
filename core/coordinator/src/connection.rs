//! One client connection.
//!
//! The accepting thread runs the read loop and dispatches commands into the
//! registry. A dedicated writer thread drains the connection's outbox, so
//! replies and broadcasts queued by any thread reach the socket in the order
//! they were queued.

use std::io::{BufReader, BufWriter};
use std::net::{Shutdown, TcpStream};
use std::sync::{mpsc, Arc};
use std::thread;

use serde::Serialize;
use serde_json::Value;
use tandem_protocol::frame::{read_frame, write_frame, FrameError};
use tandem_protocol::{
    Command, ErrorCode, ErrorInfo, Frame, Notification, Request, Response, User,
    PROTOCOL_VERSION,
};
use tracing::{debug, info, warn};

use crate::registry::{BranchKey, ConnectionId, JoinRequest, Membership, Peer, Registry, RegistryError};

enum Flow {
    Continue,
    Close,
}

pub fn handle_connection(stream: TcpStream, id: ConnectionId, registry: Arc<Registry>) {
    let peer_addr = stream
        .peer_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    let _ = stream.set_nodelay(true);

    let write_stream = match stream.try_clone() {
        Ok(stream) => stream,
        Err(err) => {
            warn!(connection = id, error = %err, "Failed to clone client stream");
            return;
        }
    };
    let (outbox, frames) = mpsc::channel::<Frame>();
    let writer = match thread::Builder::new()
        .name(format!("conn-{}-writer", id))
        .spawn(move || write_loop(write_stream, frames, id))
    {
        Ok(handle) => handle,
        Err(err) => {
            warn!(connection = id, error = %err, "Failed to spawn connection writer");
            return;
        }
    };

    info!(connection = id, peer = %peer_addr, "Client connected");
    let mut connection = Connection {
        peer: Peer::new(id, outbox),
        registry,
        membership: None,
    };

    let mut reader = BufReader::new(stream);
    loop {
        match read_frame(&mut reader) {
            Ok(Some(frame)) => {
                if let Flow::Close = connection.handle_frame(frame) {
                    break;
                }
            }
            Ok(None) => break,
            Err(err) if err.is_protocol_violation() => {
                warn!(connection = id, error = %err, "Dropping client after malformed frame");
                break;
            }
            Err(err) => {
                debug!(connection = id, error = %err, "Client read failed");
                break;
            }
        }
    }

    connection
        .registry
        .disconnect(id, connection.membership.as_ref());
    drop(connection);
    if writer.join().is_err() {
        warn!(connection = id, "Connection writer panicked");
    }
    info!(connection = id, peer = %peer_addr, "Client disconnected");
}

/// Runs until every sender for this outbox is gone, then closes the socket
/// so a reader blocked on the other side observes end of stream.
fn write_loop(stream: TcpStream, frames: mpsc::Receiver<Frame>, id: ConnectionId) {
    let mut writer = BufWriter::new(stream);
    for frame in frames {
        let written = match write_frame(&mut writer, &frame) {
            Err(FrameError::TooLarge(size)) => match &frame {
                Frame::Response(response) => {
                    warn!(connection = id, request = response.id, size, "Reply exceeds frame limit");
                    write_frame(
                        &mut writer,
                        &Frame::Response(Response::error(
                            response.id,
                            ErrorCode::Internal,
                            format!("reply of {} bytes exceeds frame limit", size),
                        )),
                    )
                }
                _ => {
                    warn!(connection = id, size, "Dropping oversized broadcast");
                    Ok(())
                }
            },
            other => other,
        };
        if let Err(err) = written {
            debug!(connection = id, error = %err, "Client write failed");
            break;
        }
    }
    if let Ok(stream) = writer.into_inner() {
        let _ = stream.shutdown(Shutdown::Both);
    }
}

struct Connection {
    peer: Peer,
    registry: Arc<Registry>,
    membership: Option<Membership>,
}

impl Connection {
    fn handle_frame(&mut self, frame: Frame) -> Flow {
        match frame {
            Frame::Request(request) => self.handle_request(request),
            Frame::Notify(notification) => self.handle_notification(notification),
            Frame::Response(_) | Frame::Broadcast(_) => {
                warn!(connection = self.peer.id(), "Client sent a coordinator-only frame");
                Flow::Close
            }
        }
    }

    fn handle_request(&mut self, request: Request) -> Flow {
        let Request {
            protocol_version,
            id,
            command,
        } = request;
        if protocol_version != PROTOCOL_VERSION {
            warn!(
                connection = self.peer.id(),
                protocol_version, "Unsupported protocol version"
            );
            self.reply(Response::error(
                id,
                ErrorCode::ProtocolError,
                "unsupported protocol version",
            ));
            return Flow::Close;
        }

        debug!(connection = self.peer.id(), id, command = command.name(), "Request received");
        if let Err(info) = command.validate() {
            self.reply(Response::error_with_info(id, info));
            return Flow::Continue;
        }

        if !command.expects_reply() {
            self.apply_notification(command);
            self.reply(Response::ok(id, Value::Null));
            return Flow::Continue;
        }

        if let Some(response) = self.dispatch(id, command) {
            self.reply(response);
        }
        Flow::Continue
    }

    fn handle_notification(&mut self, notification: Notification) -> Flow {
        if notification.protocol_version != PROTOCOL_VERSION {
            warn!(
                connection = self.peer.id(),
                protocol_version = notification.protocol_version,
                "Unsupported protocol version"
            );
            return Flow::Close;
        }
        let command = notification.command;
        if command.expects_reply() {
            warn!(
                connection = self.peer.id(),
                command = command.name(),
                "Reply-expecting command sent as notification"
            );
            return Flow::Close;
        }
        if let Err(info) = command.validate() {
            warn!(
                connection = self.peer.id(),
                command = command.name(),
                error = %info,
                "Ignoring invalid notification"
            );
            return Flow::Continue;
        }
        self.apply_notification(command);
        Flow::Continue
    }

    /// Handles a reply-expecting command. Returns `None` when the registry
    /// already queued the reply itself.
    fn dispatch(&mut self, id: u64, command: Command) -> Option<Response> {
        match command {
            Command::JoinSession {
                project,
                database,
                tick,
                name,
                color,
                ea,
            } => {
                if let Some(previous) = self.membership.take() {
                    self.registry.leave(self.peer.id(), &previous);
                }
                let request = JoinRequest {
                    key: BranchKey::new(project, database),
                    tick,
                    user: User { name, color },
                    ea,
                };
                match self.registry.join(&self.peer, id, request) {
                    Ok(membership) => {
                        self.membership = Some(membership);
                        None
                    }
                    Err(err) => Some(error_response(id, err)),
                }
            }
            Command::SubmitEvent { event } => {
                let Some(membership) = self.membership.as_ref() else {
                    return Some(error_response(id, RegistryError::NotJoined));
                };
                match self.registry.submit_event(&self.peer, id, membership, event) {
                    Ok(_) => None,
                    Err(err) => Some(error_response(id, err)),
                }
            }
            Command::GetRepositories => Some(respond(id, self.registry.repositories())),
            Command::GetBranches { repo } => Some(respond(id, self.registry.branches(&repo))),
            Command::NewRepository { repo } => Some(respond(id, self.registry.new_repository(repo))),
            Command::NewBranch { branch } => Some(respond(id, self.registry.new_branch(branch))),
            Command::UploadDatabase {
                repo,
                branch,
                content,
            } => Some(respond(
                id,
                self.registry
                    .upload_database(&BranchKey::new(repo, branch), &content),
            )),
            Command::DownloadDatabase { repo, branch } => Some(respond(
                id,
                self.registry
                    .download_database(&BranchKey::new(repo, branch)),
            )),
            Command::LeaveSession { .. }
            | Command::UserRenamed { .. }
            | Command::UserColorChanged { .. }
            | Command::InviteTo { .. } => Some(Response::error(
                id,
                ErrorCode::InvalidParams,
                "command does not expect a reply",
            )),
        }
    }

    fn apply_notification(&mut self, command: Command) {
        let peer_id = self.peer.id();
        match command {
            Command::LeaveSession { .. } => {
                if let Some(membership) = self.membership.take() {
                    self.registry.leave(peer_id, &membership);
                }
            }
            Command::UserRenamed { new_name, .. } => {
                if let Some(membership) = self.membership.as_mut() {
                    self.registry.rename_user(peer_id, membership, &new_name);
                }
            }
            Command::UserColorChanged { new_color, .. } => {
                if let Some(membership) = self.membership.as_ref() {
                    self.registry.change_color(peer_id, membership, new_color);
                }
            }
            Command::InviteTo { name, ea } => {
                if let Some(membership) = self.membership.as_ref() {
                    self.registry.invite(peer_id, membership, &name, ea);
                }
            }
            other => {
                debug!(connection = peer_id, command = other.name(), "Ignoring command");
            }
        }
    }

    fn reply(&self, response: Response) {
        if !self.peer.send(Frame::Response(response)) {
            debug!(connection = self.peer.id(), "Dropping reply to closed connection");
        }
    }
}

fn respond<T: Serialize>(id: u64, result: Result<T, RegistryError>) -> Response {
    match result {
        Ok(data) => Response::from_serialize(id, &data),
        Err(err) => error_response(id, err),
    }
}

fn error_response(id: u64, err: RegistryError) -> Response {
    debug!(id, error = %err, "Request failed");
    Response::error_with_info(id, ErrorInfo::from(err))
}
