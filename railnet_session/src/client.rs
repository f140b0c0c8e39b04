// TCP front-end for the client role.
//
// `connect()` opens the socket on the calling thread, registers it as the
// server link (admitted from the start), spawns its reader thread, and sends
// the local player's join. The session stays `Joining` until the server
// echoes the join back with an authoritative train number; an `Error` notice
// instead drops the session to single-player at the next tick.
//
// Like the server, the client never blocks the game thread on reads. Sends
// happen on whichever thread produced them.

use std::net::TcpStream;
use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::info;

use crate::config::SessionConfig;
use crate::connection::{InboundHandler, PeerLinks, spawn_reader};
use crate::error::SessionError;
use crate::session::Session;
use crate::track::Collaborators;
use crate::world::Role;

pub struct ClientHandle {
    session: Arc<Session>,
    reader: Option<JoinHandle<()>>,
}

impl ClientHandle {
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Announce our departure and close the link.
    pub fn disconnect(mut self) {
        self.session.shutdown();
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
    }
}

/// Connect to the server at `config.host:config.port` and send our join.
pub fn connect(
    config: &SessionConfig,
    collaborators: Collaborators,
) -> Result<ClientHandle, SessionError> {
    let links = Arc::new(PeerLinks::new());
    let session = Arc::new(Session::new(
        Role::Client,
        config,
        collaborators,
        links.clone(),
    )?);

    let stream = TcpStream::connect((config.host.as_str(), config.port))?;
    let (id, reader) = links.register_server(stream)?;
    let handler: Arc<dyn InboundHandler> = session.clone();
    let reader = spawn_reader(id, reader, handler)?;
    info!(
        host = %config.host,
        port = config.port,
        user = session.name(),
        "connected to server"
    );
    session.announce();

    Ok(ClientHandle {
        session,
        reader: Some(reader),
    })
}
