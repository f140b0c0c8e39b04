// TCP front-end for the server role.
//
// Architecture: one accept thread plus one reader thread per peer.
//
// - **Accept thread**: polls a non-blocking `TcpListener`, sleeping 50 ms
//   when nothing is pending so it can notice `keep_running` going false.
//   Each accepted socket is registered with `PeerLinks` (not yet admitted
//   to broadcasts) and gets a reader thread.
// - **Reader threads**: see `connection.rs`. They feed the shared `Session`
//   directly; the session decides whether the first message is an
//   acceptable join.
//
// The game thread keeps calling `Session::tick` (or runs a `Ticker`).
// `ServerHandle::stop` announces the server's departure, closes every link,
// and joins the accept thread.

use std::io;
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::connection::{InboundHandler, PeerLinks, spawn_reader};
use crate::error::SessionError;
use crate::session::Session;
use crate::track::Collaborators;
use crate::world::Role;

const ACCEPT_POLL: Duration = Duration::from_millis(50);

/// A running server. Dropping it without `stop` leaves the threads running
/// until the process exits.
pub struct ServerHandle {
    session: Arc<Session>,
    links: Arc<PeerLinks>,
    addr: SocketAddr,
    keep_running: Arc<AtomicBool>,
    accept_thread: Option<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Number of open peer connections, joined or not.
    pub fn connection_count(&self) -> usize {
        self.links.len()
    }

    /// Tell every client the server is leaving, close all links, and stop
    /// accepting.
    pub fn stop(mut self) {
        self.keep_running.store(false, Ordering::SeqCst);
        self.session.shutdown();
        if let Some(handle) = self.accept_thread.take() {
            let _ = handle.join();
        }
    }
}

/// Bind `config.host:config.port` and start accepting peers. Port 0 picks a
/// free port; the bound address is returned.
pub fn start_server(
    config: &SessionConfig,
    collaborators: Collaborators,
) -> Result<(ServerHandle, SocketAddr), SessionError> {
    let listener = TcpListener::bind((config.host.as_str(), config.port))?;
    let addr = listener.local_addr()?;
    listener.set_nonblocking(true)?;

    let links = Arc::new(PeerLinks::new());
    let session = Arc::new(Session::new(
        Role::Server,
        config,
        collaborators,
        links.clone(),
    )?);
    let keep_running = Arc::new(AtomicBool::new(true));

    let accept_thread = {
        let links = links.clone();
        let handler: Arc<dyn InboundHandler> = session.clone();
        let keep_running = keep_running.clone();
        thread::Builder::new()
            .name("railnet-accept".into())
            .spawn(move || accept_loop(listener, &links, handler, &keep_running))?
    };
    info!(%addr, user = session.name(), "server listening");

    Ok((
        ServerHandle {
            session,
            links,
            addr,
            keep_running,
            accept_thread: Some(accept_thread),
        },
        addr,
    ))
}

fn accept_loop(
    listener: TcpListener,
    links: &PeerLinks,
    handler: Arc<dyn InboundHandler>,
    keep_running: &AtomicBool,
) {
    while keep_running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                if let Err(e) = admit_socket(links, stream, handler.clone()) {
                    warn!(%peer, "could not set up connection: {e}");
                } else {
                    debug!(%peer, "accepted connection");
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                warn!("accept failed, no longer listening: {e}");
                break;
            }
        }
    }
}

fn admit_socket(
    links: &PeerLinks,
    stream: std::net::TcpStream,
    handler: Arc<dyn InboundHandler>,
) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    let (id, reader) = links.register(stream)?;
    spawn_reader(id, reader, handler)?;
    Ok(())
}
