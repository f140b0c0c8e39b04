// railnet_session: multiplayer session coordinator for train simulation.
//
// One process runs as the server, the others as clients. Every participant
// keeps replicas of all trains in the session; each train is driven by at
// most one participant, whose position reports the others apply. The server
// is authoritative for joins, train numbers, control transfers and switch
// state, and relays everything else. The crate never simulates: physics and
// track geometry sit behind the traits in `track.rs`.
//
// Module overview:
// - `session.rs`:      `Session`, the coordinator. Inbound handlers for both
//                      roles, the per-tick send cadence, and the local
//                      operations (throw switch, couple, uncouple, request
//                      control, chat, shutdown).
// - `world.rs`:        `World`, the state the session guards with one lock:
//                      replicas, participants, numbering, status. Holds the
//                      ownership rules linking trains and controllers.
// - `replica.rs`:      `TrainReplica`, its cars, cab control state, and the
//                      car pool used to carry live state across couples.
// - `registry.rs`:     The local player and the remote participant roster.
// - `housekeeping.rs`: Structural changes queued by reader threads and
//                      applied at the start of the next tick.
// - `missing.rs`:      Per-train counters that trigger a `GetTrain` request.
// - `input.rs`:        Edge sampling of cab controls into events.
// - `track.rs`:        Collaborator traits and in-memory implementations.
// - `connection.rs`:   Per-socket writer and reader thread; `PeerLinks`.
// - `server.rs`:       Accept loop for the server role.
// - `client.rs`:       Connect and announce for the client role.
// - `ticker.rs`:       Background tick thread for headless use.
// - `config.rs`:       `SessionConfig`, loaded from JSON.
// - `error.rs`:        `SessionError`, `ConnectionError`, `ConfigError`.
//
// Dependencies: `railnet_protocol` for messages and framing, `parking_lot`
// for the locks, `tracing` for logs.
//
// The crate runs as a standalone binary (`main.rs`) or embedded in a game
// through `start_server` / `connect`.

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod housekeeping;
pub mod input;
pub mod missing;
pub mod registry;
pub mod replica;
pub mod server;
pub mod session;
pub mod ticker;
pub mod track;
pub mod world;

pub use client::{ClientHandle, connect};
pub use config::SessionConfig;
pub use error::SessionError;
pub use server::{ServerHandle, start_server};
pub use session::Session;
pub use ticker::Ticker;
pub use world::{Role, SessionStatus};
