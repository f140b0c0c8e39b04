// Core value types for the multiplayer protocol.
//
// Lightweight newtypes and plain structs shared by `message.rs` (protocol
// messages), `codec.rs` (text encoding) and the session crate's replica
// bookkeeping (`railnet_session::registry`, `railnet_session::session`).
//
// Train numbers are session-scoped: unique among the trains alive at one
// instant, recycled afterwards. Player names double as wire tokens, which is
// why `validate_player_name` forbids whitespace as well as the quote and
// leading-digit rules, since a name starting with a digit could be confused with
// the `0xAI<number>` originator token used for server-simulated trains.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::NameError;

/// Minimum display-name length, in characters.
pub const MIN_NAME_LEN: usize = 4;

/// Maximum display-name length, in characters.
pub const MAX_NAME_LEN: usize = 10;

/// Prefix of the originator token for trains no participant controls.
pub const AI_PREFIX: &str = "0xAI";

/// Session-scoped train number.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TrainNumber(pub u32);

impl fmt::Display for TrainNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Check a participant display name against the identity rules.
pub fn validate_player_name(name: &str) -> Result<(), NameError> {
    let len = name.chars().count();
    if !(MIN_NAME_LEN..=MAX_NAME_LEN).contains(&len) {
        return Err(NameError::Length(len));
    }
    if name.starts_with(|c: char| c.is_ascii_digit()) {
        return Err(NameError::LeadingDigit);
    }
    if let Some(c) = name
        .chars()
        .find(|c| *c == '"' || *c == '\'' || c.is_whitespace() || c.is_control())
    {
        return Err(NameError::ForbiddenChar(c));
    }
    Ok(())
}

/// Travel direction of a train relative to its track path.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    #[default]
    Forward,
    Reverse,
}

impl Direction {
    pub fn wire_value(self) -> u8 {
        match self {
            Direction::Forward => 0,
            Direction::Reverse => 1,
        }
    }

    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(Direction::Forward),
            1 => Some(Direction::Reverse),
            _ => None,
        }
    }

    pub fn reversed(self) -> Self {
        match self {
            Direction::Forward => Direction::Reverse,
            Direction::Reverse => Direction::Forward,
        }
    }
}

/// A position on the tiled world map: tile coordinates plus an offset
/// within the tile, in metres.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WorldPosition {
    pub tile_x: i32,
    pub tile_z: i32,
    pub x: f32,
    pub z: f32,
}

impl WorldPosition {
    pub const fn new(tile_x: i32, tile_z: i32, x: f32, z: f32) -> Self {
        Self {
            tile_x,
            tile_z,
            x,
            z,
        }
    }
}

/// Where a train is and how it is moving.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainPose {
    pub position: WorldPosition,
    pub direction: Direction,
    /// Accumulated distance travelled, metres.
    pub travelled: f32,
    /// Current speed, metres per second.
    pub speed: f32,
}

/// One rail car as it travels on the wire: the vehicle definition file it
/// was built from, its session-unique id, and whether it runs reversed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CarDescriptor {
    pub file: String,
    pub id: String,
    #[serde(default)]
    pub flipped: bool,
}

impl CarDescriptor {
    pub fn new(file: impl Into<String>, id: impl Into<String>, flipped: bool) -> Self {
        Self {
            file: file.into(),
            id: id.into(),
            flipped,
        }
    }
}

/// Simulated environment announced by a joining player.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Environment {
    /// Game clock, seconds since midnight.
    pub clock_seconds: f64,
    pub season: u8,
    pub weather: u8,
}

/// Aspect and draw state of one signal head. Both values are single decimal
/// digits on the wire.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalHeadState {
    pub aspect: u8,
    pub draw_state: u8,
}

impl SignalHeadState {
    pub const fn new(aspect: u8, draw_state: u8) -> Self {
        Self { aspect, draw_state }
    }
}

/// Who originates the authoritative state of a train: a named participant,
/// or nobody (the server simulates it).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Originator {
    Player(String),
    Ai(TrainNumber),
}

impl Originator {
    /// Build from an optional controller name.
    pub fn from_controller(controller: Option<&str>, number: TrainNumber) -> Self {
        match controller {
            Some(name) => Originator::Player(name.to_owned()),
            None => Originator::Ai(number),
        }
    }

    pub fn player(&self) -> Option<&str> {
        match self {
            Originator::Player(name) => Some(name),
            Originator::Ai(_) => None,
        }
    }

    /// Parse a wire token. Anything that is not a well-formed AI token is a
    /// player name.
    pub fn parse(token: &str) -> Self {
        match token.strip_prefix(AI_PREFIX).map(str::parse::<u32>) {
            Some(Ok(number)) => Originator::Ai(TrainNumber(number)),
            _ => Originator::Player(token.to_owned()),
        }
    }
}

impl fmt::Display for Originator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Originator::Player(name) => f.write_str(name),
            Originator::Ai(number) => write!(f, "{AI_PREFIX}{}", number.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_rules() {
        assert!(validate_player_name("Alice").is_ok());
        assert!(validate_player_name("Bob_Smith1").is_ok());
        assert_eq!(validate_player_name("Bob"), Err(NameError::Length(3)));
        assert_eq!(
            validate_player_name("Maximilian1"),
            Err(NameError::Length(11))
        );
        assert_eq!(validate_player_name("9lives"), Err(NameError::LeadingDigit));
        assert_eq!(
            validate_player_name("O'Neil"),
            Err(NameError::ForbiddenChar('\''))
        );
        assert_eq!(
            validate_player_name("Ann Lee"),
            Err(NameError::ForbiddenChar(' '))
        );
    }

    #[test]
    fn originator_tokens() {
        let ai = Originator::Ai(TrainNumber(17));
        assert_eq!(ai.to_string(), "0xAI17");
        assert_eq!(Originator::parse("0xAI17"), ai);
        assert_eq!(
            Originator::parse("Alice"),
            Originator::Player("Alice".into())
        );
        // Not a number after the prefix: treated as a name.
        assert_eq!(
            Originator::parse("0xAIx"),
            Originator::Player("0xAIx".into())
        );
    }

    #[test]
    fn direction_wire_values() {
        assert_eq!(Direction::from_wire(0), Some(Direction::Forward));
        assert_eq!(Direction::from_wire(1), Some(Direction::Reverse));
        assert_eq!(Direction::from_wire(2), None);
        assert_eq!(Direction::Forward.reversed(), Direction::Reverse);
    }

    #[test]
    fn car_descriptor_from_json_defaults_flip() {
        let car: CarDescriptor =
            serde_json::from_str(r#"{"file":"dash9.eng","id":"Alice - 0"}"#).unwrap();
        assert!(!car.flipped);
    }
}
