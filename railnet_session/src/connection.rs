// One TCP link to a peer, and the reader thread that serves it.
//
// Architecture: thread-per-reader, with handlers called synchronously.
//
// - **Reader thread** (one per connection): blocking `read` into an 8 KiB
//   chunk, `FrameDecoder::push`, then `pop` until the decoder runs dry.
//   Every complete frame is decoded and handed to the `InboundHandler` on
//   this thread. A frame that decodes badly is logged and dropped. A framing
//   error, EOF or read error ends the thread after one `on_disconnect` call.
// - **Writers**: any thread may call `Connection::send_frame`. Writes go
//   through a per-connection mutex so frames from different threads never
//   interleave. There is no send timeout; a stalled peer stalls the sender.
//
// `PeerLinks` is the set of live connections and the network implementation
// of `Outbox`. Only admitted connections (peers whose join was accepted, or
// the server link on a client) receive broadcasts.

use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, BufWriter, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use railnet_protocol::{FrameDecoder, Message};

use crate::error::ConnectionError;

/// Bytes requested from the socket per read.
pub const READ_CHUNK: usize = 8 * 1024;

/// Process-local id of one connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Receives what reader threads decode.
pub trait InboundHandler: Send + Sync {
    fn on_message(&self, from: ConnectionId, message: Message);
    /// Called once when the connection's reader stops for any reason.
    fn on_disconnect(&self, from: ConnectionId, reason: &str);
}

/// Where an outbound message goes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Recipient {
    /// Every admitted peer.
    Everyone,
    EveryoneExcept(ConnectionId),
    Peer(ConnectionId),
    /// The server link (clients only).
    Server,
}

/// Sending side of the session.
pub trait Outbox: Send + Sync {
    fn deliver(&self, to: Recipient, message: &Message);
    /// Include `peer` in broadcasts from now on.
    fn admit(&self, peer: ConnectionId);
    fn disconnect(&self, peer: ConnectionId);
    fn disconnect_all(&self);
}

/// The write half of one peer socket.
pub struct Connection {
    id: ConnectionId,
    writer: Mutex<BufWriter<TcpStream>>,
    control: TcpStream,
    closed: AtomicBool,
}

impl Connection {
    /// Wrap `stream`. Returns the connection and a clone of the stream for
    /// the reader thread.
    pub fn new(id: ConnectionId, stream: TcpStream) -> io::Result<(Arc<Self>, TcpStream)> {
        stream.set_nodelay(true)?;
        let reader = stream.try_clone()?;
        let control = stream.try_clone()?;
        let connection = Arc::new(Self {
            id,
            writer: Mutex::new(BufWriter::new(stream)),
            control,
            closed: AtomicBool::new(false),
        });
        Ok((connection, reader))
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn send(&self, message: &Message) -> Result<(), ConnectionError> {
        self.send_frame(&message.to_frame())
    }

    /// Write one already framed message.
    pub fn send_frame(&self, frame: &[u8]) -> Result<(), ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }
        let mut writer = self.writer.lock();
        writer.write_all(frame)?;
        writer.flush()?;
        Ok(())
    }

    /// Shut the socket down in both directions, which also wakes the reader
    /// thread. Does not wait for a writer blocked on a stalled peer.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.control.shutdown(Shutdown::Both);
        }
    }
}

/// Start the reader thread for one connection.
pub fn spawn_reader(
    id: ConnectionId,
    stream: TcpStream,
    handler: Arc<dyn InboundHandler>,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("railnet-reader-{}", id.0))
        .spawn(move || reader_loop(id, stream, handler.as_ref()))
}

fn reader_loop(id: ConnectionId, mut stream: TcpStream, handler: &dyn InboundHandler) {
    let mut decoder = FrameDecoder::new();
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        let read = match stream.read(&mut chunk) {
            Ok(0) => {
                handler.on_disconnect(id, "connection closed by peer");
                return;
            }
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                handler.on_disconnect(id, &e.to_string());
                return;
            }
        };
        decoder.push(&chunk[..read]);
        loop {
            match decoder.pop() {
                Ok(Some(payload)) => match Message::decode(&payload) {
                    Ok(message) => handler.on_message(id, message),
                    Err(e) => warn!(%id, "dropping undecodable message: {e}"),
                },
                Ok(None) => break,
                Err(e) => {
                    warn!(%id, "protocol error: {e}");
                    handler.on_disconnect(id, &format!("protocol error: {e}"));
                    return;
                }
            }
        }
    }
}

struct Link {
    connection: Arc<Connection>,
    admitted: bool,
}

/// Live connections of one process.
#[derive(Default)]
pub struct PeerLinks {
    links: RwLock<BTreeMap<ConnectionId, Link>>,
    server: RwLock<Option<ConnectionId>>,
    next_id: AtomicU64,
}

impl PeerLinks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a newly accepted socket. Returns its id and the reader half.
    pub fn register(&self, stream: TcpStream) -> io::Result<(ConnectionId, TcpStream)> {
        self.insert(stream, false)
    }

    /// Track the client's link to its server. It is admitted immediately.
    pub fn register_server(&self, stream: TcpStream) -> io::Result<(ConnectionId, TcpStream)> {
        let (id, reader) = self.insert(stream, true)?;
        *self.server.write() = Some(id);
        Ok((id, reader))
    }

    fn insert(&self, stream: TcpStream, admitted: bool) -> io::Result<(ConnectionId, TcpStream)> {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (connection, reader) = Connection::new(id, stream)?;
        self.links.write().insert(
            id,
            Link {
                connection,
                admitted,
            },
        );
        debug!(%id, "connection registered");
        Ok((id, reader))
    }

    pub fn len(&self) -> usize {
        self.links.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.read().is_empty()
    }

    pub fn connection(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.links.read().get(&id).map(|link| link.connection.clone())
    }

    fn targets(&self, to: Recipient) -> Vec<Arc<Connection>> {
        let links = self.links.read();
        match to {
            Recipient::Everyone => links
                .values()
                .filter(|link| link.admitted)
                .map(|link| link.connection.clone())
                .collect(),
            Recipient::EveryoneExcept(excluded) => links
                .iter()
                .filter(|(id, link)| link.admitted && **id != excluded)
                .map(|(_, link)| link.connection.clone())
                .collect(),
            Recipient::Peer(id) => links
                .get(&id)
                .map(|link| link.connection.clone())
                .into_iter()
                .collect(),
            Recipient::Server => match *self.server.read() {
                Some(id) => links
                    .get(&id)
                    .map(|link| link.connection.clone())
                    .into_iter()
                    .collect(),
                None => Vec::new(),
            },
        }
    }
}

impl Outbox for PeerLinks {
    fn deliver(&self, to: Recipient, message: &Message) {
        let targets = self.targets(to);
        if targets.is_empty() {
            return;
        }
        let frame = message.to_frame();
        for connection in targets {
            // The reader thread notices a dead socket and reports it.
            if let Err(e) = connection.send_frame(&frame) {
                debug!(id = %connection.id(), kind = ?message.kind(), "send failed: {e}");
            }
        }
    }

    fn admit(&self, peer: ConnectionId) {
        if let Some(link) = self.links.write().get_mut(&peer) {
            link.admitted = true;
        }
    }

    fn disconnect(&self, peer: ConnectionId) {
        let removed = self.links.write().remove(&peer);
        if let Some(link) = removed {
            link.connection.close();
            info!(id = %peer, "connection closed");
        }
    }

    fn disconnect_all(&self) {
        let links = std::mem::take(&mut *self.links.write());
        for link in links.into_values() {
            link.connection.close();
        }
        *self.server.write() = None;
    }
}
