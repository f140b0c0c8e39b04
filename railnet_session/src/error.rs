// Error types for the session crate.
//
// `SessionError` is returned by the local operations on `Session` and by the
// server/client front-ends. `ConnectionError` stays inside the transport:
// send failures are logged and the reader thread turns them into a
// disconnect. `ConfigError` covers loading `SessionConfig` from disk.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use railnet_protocol::{NameError, TrainNumber};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid player name: {0}")]
    InvalidName(#[from] NameError),
    #[error("unknown train {0}")]
    UnknownTrain(TrainNumber),
    #[error("train {0} is not controlled by this participant")]
    NotController(TrainNumber),
    #[error("cannot split train {number} after car {at} of {len}")]
    InvalidSplit {
        number: TrainNumber,
        at: usize,
        len: usize,
    },
    #[error("cannot couple train {0} to itself")]
    SelfCouple(TrainNumber),
    #[error("switch {0} does not exist")]
    UnknownSwitch(usize),
    #[error("switch {index} cannot take state {state}")]
    InvalidSwitchState { index: usize, state: u8 },
    #[error("switch {0} is occupied and cannot be thrown")]
    SwitchLocked(usize),
    #[error("control of train {0} was denied")]
    ControlDenied(TrainNumber),
    #[error("consist {0:?} is not in the library")]
    UnknownConsist(String),
    #[error("consist {0:?} has no cars")]
    EmptyConsist(String),
    #[error("clients must be configured with a consist to drive")]
    NoConsist,
    #[error("the multiplayer session is no longer active")]
    Inactive,
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("connection is closed")]
    Closed,
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {}: {source}", .path.display())]
    Read { path: PathBuf, source: io::Error },
    #[error("invalid configuration: {0}")]
    Parse(#[from] serde_json::Error),
}
