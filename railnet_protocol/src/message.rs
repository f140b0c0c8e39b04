// Protocol messages exchanged between the session server and its clients.
//
// `Message` is the closed set of everything that can travel inside a frame.
// Each variant carries a plain struct (or a short field list) and knows its
// `MessageKind`, whose tag string leads the encoded payload. Encoding and
// decoding live in `codec.rs`; this file only defines the vocabulary.
//
// Direction conventions (server = authoritative participant):
// - Move, Switch, Couple, Uncouple, Control, Event, Quit, Text: both ways.
// - PlayerJoin: client → server, then server → everyone.
// - Train, UpdateTrain, RemoveTrain, SwitchStatus, SignalStatus, Notice:
//   server → clients.
// - Alive, GetTrain: client → server.

use crate::types::{
    CarDescriptor, Direction, Environment, Originator, SignalHeadState, TrainNumber, TrainPose,
    WorldPosition,
};

/// Marker carried by the server's own `Quit`: the whole session is over.
pub const SERVER_DEPARTURE_MARKER: &str = "ServerHasToQuit";

/// Highest switch state; snapshots carry one decimal digit per switch.
pub const MAX_SWITCH_STATE: u8 = 9;

/// Tag of each message kind, in wire spelling.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Move,
    PlayerJoin,
    Train,
    UpdateTrain,
    RemoveTrain,
    Switch,
    SwitchStatus,
    SignalStatus,
    Couple,
    Uncouple,
    Control,
    Event,
    Alive,
    Quit,
    GetTrain,
    Notice,
    Text,
}

impl MessageKind {
    pub const ALL: [MessageKind; 17] = [
        MessageKind::Move,
        MessageKind::PlayerJoin,
        MessageKind::Train,
        MessageKind::UpdateTrain,
        MessageKind::RemoveTrain,
        MessageKind::Switch,
        MessageKind::SwitchStatus,
        MessageKind::SignalStatus,
        MessageKind::Couple,
        MessageKind::Uncouple,
        MessageKind::Control,
        MessageKind::Event,
        MessageKind::Alive,
        MessageKind::Quit,
        MessageKind::GetTrain,
        MessageKind::Notice,
        MessageKind::Text,
    ];

    pub fn tag(self) -> &'static str {
        match self {
            MessageKind::Move => "MOVE",
            MessageKind::PlayerJoin => "PLAYER",
            MessageKind::Train => "TRAIN",
            MessageKind::UpdateTrain => "UPDATETRAIN",
            MessageKind::RemoveTrain => "REMOVETRAIN",
            MessageKind::Switch => "SWITCH",
            MessageKind::SwitchStatus => "SWITCHSTATES",
            MessageKind::SignalStatus => "SIGNALSTATES",
            MessageKind::Couple => "COUPLE",
            MessageKind::Uncouple => "UNCOUPLE",
            MessageKind::Control => "CONTROL",
            MessageKind::Event => "EVENT",
            MessageKind::Alive => "ALIVE",
            MessageKind::Quit => "QUIT",
            MessageKind::GetTrain => "GETTRAIN",
            MessageKind::Notice => "MESSAGE",
            MessageKind::Text => "TEXT",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.tag() == tag)
    }
}

/// Every message that can travel inside a frame.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    /// Position batch for trains that moved since the sender's last batch.
    Move(Vec<MoveEntry>),
    /// Full join announcement.
    PlayerJoin(PlayerJoin),
    /// First sight of a train the recipient does not control.
    Train(TrainSnapshot),
    /// Resync of one train, answering `GetTrain`.
    UpdateTrain(TrainSnapshot),
    /// Trains that no longer exist.
    RemoveTrain(Vec<TrainNumber>),
    /// A single switch throw.
    Switch(SwitchChange),
    /// Every switch's state, in track enumeration order.
    SwitchStatus(Vec<u8>),
    /// Every signal head's state, in track enumeration order.
    SignalStatus(Vec<SignalHeadState>),
    /// Two trains merged into one.
    Couple(Couple),
    /// One train split into two.
    Uncouple(Uncouple),
    /// Ownership transfer handshake.
    Control(ControlMessage),
    /// A discrete cab control action, rebroadcast by the server.
    Event(ControlEvent),
    /// Liveness heartbeat.
    Alive { user: String },
    /// Graceful departure. `server_departing` ends the whole session.
    Quit {
        user: String,
        server_departing: bool,
    },
    /// Request for a full snapshot of one train.
    GetTrain { user: String, number: TrainNumber },
    /// Severity-tagged notice for one participant.
    Notice(Notice),
    /// Player chat.
    Text(Chat),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Move(_) => MessageKind::Move,
            Message::PlayerJoin(_) => MessageKind::PlayerJoin,
            Message::Train(_) => MessageKind::Train,
            Message::UpdateTrain(_) => MessageKind::UpdateTrain,
            Message::RemoveTrain(_) => MessageKind::RemoveTrain,
            Message::Switch(_) => MessageKind::Switch,
            Message::SwitchStatus(_) => MessageKind::SwitchStatus,
            Message::SignalStatus(_) => MessageKind::SignalStatus,
            Message::Couple(_) => MessageKind::Couple,
            Message::Uncouple(_) => MessageKind::Uncouple,
            Message::Control(_) => MessageKind::Control,
            Message::Event(_) => MessageKind::Event,
            Message::Alive { .. } => MessageKind::Alive,
            Message::Quit { .. } => MessageKind::Quit,
            Message::GetTrain { .. } => MessageKind::GetTrain,
            Message::Notice(_) => MessageKind::Notice,
            Message::Text(_) => MessageKind::Text,
        }
    }
}

/// One train's entry in a `Move` batch.
#[derive(Clone, Debug, PartialEq)]
pub struct MoveEntry {
    pub originator: Originator,
    pub number: TrainNumber,
    pub car_count: u32,
    pub travelled: f32,
    pub speed: f32,
    pub track_node: u32,
    pub direction: Direction,
    pub position: WorldPosition,
}

/// Everything a peer needs to build a replica of a joining player's train.
#[derive(Clone, Debug, PartialEq)]
pub struct PlayerJoin {
    pub user: String,
    pub route: String,
    pub path: String,
    pub consist: String,
    /// Id of the car the player drives.
    pub lead_unit: String,
    pub number: TrainNumber,
    pub pose: TrainPose,
    pub environment: Environment,
    pub pantographs: [bool; 4],
    /// May be empty, in which case receivers load `consist` themselves.
    pub cars: Vec<CarDescriptor>,
}

/// Full state of one train.
#[derive(Clone, Debug, PartialEq)]
pub struct TrainSnapshot {
    pub originator: Originator,
    pub number: TrainNumber,
    pub pose: TrainPose,
    pub cars: Vec<CarDescriptor>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SwitchChange {
    pub user: String,
    pub index: u32,
    pub state: u8,
}

/// Merge of `removed` into `survivor`.
#[derive(Clone, Debug, PartialEq)]
pub struct Couple {
    pub user: String,
    pub survivor: TrainNumber,
    pub removed: TrainNumber,
    /// Controller of the merged train, or AI.
    pub controller: Originator,
    pub lead_unit: String,
    pub pose: TrainPose,
    pub cars: Vec<CarDescriptor>,
}

/// Which piece of an uncouple holds the initiator's own car.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlayerPiece {
    Retained,
    New,
    Neither,
}

impl PlayerPiece {
    pub fn wire_value(self) -> u8 {
        match self {
            PlayerPiece::Retained => 0,
            PlayerPiece::New => 1,
            PlayerPiece::Neither => 2,
        }
    }

    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(PlayerPiece::Retained),
            1 => Some(PlayerPiece::New),
            2 => Some(PlayerPiece::Neither),
            _ => None,
        }
    }
}

/// Split of `retained` into itself and a new train.
///
/// The initiator fills `provisional` with a locally generated number; until
/// the server confirms, `assigned == provisional` and `confirmed` is false.
/// The server's rebroadcast carries the authoritative `assigned` number.
#[derive(Clone, Debug, PartialEq)]
pub struct Uncouple {
    pub user: String,
    pub retained: TrainNumber,
    pub provisional: TrainNumber,
    pub assigned: TrainNumber,
    pub confirmed: bool,
    pub player_piece: PlayerPiece,
    pub retained_pose: TrainPose,
    pub retained_cars: Vec<CarDescriptor>,
    pub new_pose: TrainPose,
    pub new_cars: Vec<CarDescriptor>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlAction {
    Request,
    Grant,
    Deny,
}

impl ControlAction {
    pub fn tag(self) -> &'static str {
        match self {
            ControlAction::Request => "REQUEST",
            ControlAction::Grant => "GRANT",
            ControlAction::Deny => "DENY",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "REQUEST" => Some(ControlAction::Request),
            "GRANT" => Some(ControlAction::Grant),
            "DENY" => Some(ControlAction::Deny),
            _ => None,
        }
    }
}

/// Ownership transfer for `number`, on behalf of `user`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControlMessage {
    pub user: String,
    pub action: ControlAction,
    pub number: TrainNumber,
    /// The car `user` will drive once granted.
    pub lead_unit: String,
}

/// Discrete cab controls mirrored to other participants.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    Horn,
    Bell,
    Wiper,
    Pantograph,
    Headlight,
}

impl EventKind {
    pub fn tag(self) -> &'static str {
        match self {
            EventKind::Horn => "HORN",
            EventKind::Bell => "BELL",
            EventKind::Wiper => "WIPER",
            EventKind::Pantograph => "PANTOGRAPH",
            EventKind::Headlight => "HEADLIGHT",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "HORN" => Some(EventKind::Horn),
            "BELL" => Some(EventKind::Bell),
            "WIPER" => Some(EventKind::Wiper),
            "PANTOGRAPH" => Some(EventKind::Pantograph),
            "HEADLIGHT" => Some(EventKind::Headlight),
            _ => None,
        }
    }

    /// Number of distinct states. Toggles cycle modulo this value.
    pub fn state_count(self) -> u8 {
        match self {
            EventKind::Headlight => 3,
            EventKind::Horn | EventKind::Bell | EventKind::Wiper | EventKind::Pantograph => 2,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControlEvent {
    pub user: String,
    pub kind: EventKind,
    pub state: u8,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl Severity {
    pub fn tag(self) -> &'static str {
        match self {
            Severity::Info => "Info",
            Severity::Warning => "Warning",
            Severity::Error => "Error",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "Info" => Some(Severity::Info),
            "Warning" => Some(Severity::Warning),
            "Error" => Some(Severity::Error),
            _ => None,
        }
    }
}

/// Notice from the server to one participant. An `Error` notice means the
/// recipient has been refused and must fall back to single-player.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Notice {
    pub target: String,
    pub severity: Severity,
    pub text: String,
}

/// Player chat. Empty `recipients` means everyone.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Chat {
    pub sender: String,
    pub recipients: Vec<String>,
    pub text: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_are_unique_and_resolve() {
        for kind in MessageKind::ALL {
            assert_eq!(MessageKind::from_tag(kind.tag()), Some(kind));
        }
        let mut tags: Vec<&str> = MessageKind::ALL.iter().map(|k| k.tag()).collect();
        tags.sort_unstable();
        tags.dedup();
        assert_eq!(tags.len(), MessageKind::ALL.len());
        assert_eq!(MessageKind::from_tag("move"), None);
    }

    #[test]
    fn event_state_counts() {
        assert_eq!(EventKind::Headlight.state_count(), 3);
        assert_eq!(EventKind::Pantograph.state_count(), 2);
    }
}
