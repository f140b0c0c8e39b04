// Session configuration.
//
// `SessionConfig` holds everything needed to start a server or a client:
// where to listen or connect, the local player's setup, tick cadence, the
// size of the in-memory track used by the standalone binary, and the consist
// library. Every field has a default, so a config file only needs the
// fields it changes:
//
// ```json
// {
//   "port": 30000,
//   "player": { "name": "Alice", "consist": "freight.con" },
//   "consists": {
//     "freight.con": [
//       { "file": "dash9.eng", "id": "" },
//       { "file": "boxcar.wag", "id": "", "flipped": true }
//     ]
//   }
// }
// ```

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use railnet_protocol::{CarDescriptor, Direction, Environment, WorldPosition};

use crate::error::ConfigError;
use crate::missing::DEFAULT_MISSING_THRESHOLD;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Address to listen on (server) or connect to (client).
    pub host: String,
    pub port: u16,
    pub player: PlayerConfig,
    pub timing: TimingConfig,
    pub track: TrackConfig,
    /// Consist file name to its cars. Car ids are reassigned per owner.
    pub consists: BTreeMap<String, Vec<CarDescriptor>>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 30000,
            player: PlayerConfig::default(),
            timing: TimingConfig::default(),
            track: TrackConfig::default(),
            consists: BTreeMap::new(),
        }
    }
}

impl SessionConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }
}

/// The local player's setup.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    pub name: String,
    pub route: String,
    pub path: String,
    /// Consist to drive. `None` runs a server without a train of its own.
    pub consist: Option<String>,
    pub position: WorldPosition,
    pub direction: Direction,
    pub environment: Environment,
    pub pantographs: [bool; 4],
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            name: "Host".into(),
            route: String::new(),
            path: String::new(),
            consist: None,
            position: WorldPosition::default(),
            direction: Direction::Forward,
            environment: Environment::default(),
            pantographs: [false; 4],
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub move_interval_ms: u64,
    pub resync_interval_ms: u64,
    pub alive_interval_ms: u64,
    pub missing_threshold: u32,
    pub shutdown_grace_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            move_interval_ms: 1000,
            resync_interval_ms: 10_000,
            alive_interval_ms: 30_000,
            missing_threshold: DEFAULT_MISSING_THRESHOLD,
            shutdown_grace_ms: 200,
        }
    }
}

impl TimingConfig {
    pub fn move_interval(&self) -> Duration {
        Duration::from_millis(self.move_interval_ms)
    }

    pub fn resync_interval(&self) -> Duration {
        Duration::from_millis(self.resync_interval_ms)
    }

    pub fn alive_interval(&self) -> Duration {
        Duration::from_millis(self.alive_interval_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Size of the in-memory track built for the standalone binary.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackConfig {
    pub switches: usize,
    pub signals: usize,
}

impl Default for TrackConfig {
    fn default() -> Self {
        Self {
            switches: 16,
            signals: 8,
        }
    }
}
