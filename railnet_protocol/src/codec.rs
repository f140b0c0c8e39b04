// Text encoding of protocol messages.
//
// A payload is the kind tag, then (if the body is non-empty) one space and
// the body. Body layout per kind:
//
// - Scalar lists are space separated.
// - Multi-part payloads (player join, train snapshots, couple, uncouple,
//   chat) put each part on its own CR-terminated line.
// - Car lists are a single line of tab-separated `file id flipped` triples,
//   so car files and ids may contain spaces.
// - Free text (notices, chat) always comes last and is taken verbatim.
//
// Decoding dispatches once on the tag through `MessageKind`; everything
// after that is a straight field-by-field parse. Floats use Rust's shortest
// round-trip formatting, so encode → decode reproduces the exact values.

use std::str::FromStr;

use crate::error::DecodeError;
use crate::framing::encode_frame;
use crate::message::{
    Chat, ControlAction, ControlEvent, ControlMessage, Couple, EventKind, Message, MessageKind,
    MoveEntry, Notice, PlayerJoin, PlayerPiece, SERVER_DEPARTURE_MARKER, Severity, SwitchChange,
    TrainSnapshot, Uncouple,
};
use crate::types::{
    CarDescriptor, Direction, Environment, Originator, SignalHeadState, TrainNumber, TrainPose,
    WorldPosition,
};

const LINE: char = '\r';
const GROUP: char = '\t';

impl Message {
    /// Encode into a frame payload (`"KIND body"`).
    pub fn encode(&self) -> String {
        let body = self.encode_body();
        let tag = self.kind().tag();
        if body.is_empty() {
            tag.to_owned()
        } else {
            format!("{tag} {body}")
        }
    }

    /// Encode and wrap into a length-prefixed frame, ready for the socket.
    pub fn to_frame(&self) -> Vec<u8> {
        encode_frame(self.encode().as_bytes())
    }

    /// Decode a frame payload.
    pub fn decode(payload: &[u8]) -> Result<Message, DecodeError> {
        let text = std::str::from_utf8(payload).map_err(|_| DecodeError::NotUtf8)?;
        if text.is_empty() {
            return Err(DecodeError::Empty);
        }
        let (tag, body) = text.split_once(' ').unwrap_or((text, ""));
        let kind =
            MessageKind::from_tag(tag).ok_or_else(|| DecodeError::UnknownKind(tag.to_owned()))?;
        decode_body(kind, body)
    }

    fn encode_body(&self) -> String {
        match self {
            Message::Move(entries) => entries
                .iter()
                .map(encode_move_entry)
                .collect::<Vec<_>>()
                .join(" "),
            Message::PlayerJoin(join) => encode_player_join(join),
            Message::Train(snapshot) | Message::UpdateTrain(snapshot) => {
                encode_snapshot(snapshot)
            }
            Message::RemoveTrain(numbers) => numbers
                .iter()
                .map(|n| n.0.to_string())
                .collect::<Vec<_>>()
                .join(" "),
            Message::Switch(change) => {
                format!("{} {} {}", change.user, change.index, change.state)
            }
            Message::SwitchStatus(states) => states.iter().map(|s| digit(*s)).collect(),
            Message::SignalStatus(heads) => heads
                .iter()
                .flat_map(|h| [digit(h.aspect), digit(h.draw_state)])
                .collect(),
            Message::Couple(couple) => encode_couple(couple),
            Message::Uncouple(uncouple) => encode_uncouple(uncouple),
            Message::Control(control) => format!(
                "{} {} {} {}",
                control.user,
                control.action.tag(),
                control.number.0,
                control.lead_unit
            ),
            Message::Event(event) => {
                format!("{} {} {}", event.user, event.kind.tag(), event.state)
            }
            Message::Alive { user } => user.clone(),
            Message::Quit {
                user,
                server_departing,
            } => {
                if *server_departing {
                    format!("{user} {SERVER_DEPARTURE_MARKER}")
                } else {
                    user.clone()
                }
            }
            Message::GetTrain { user, number } => format!("{user} {}", number.0),
            Message::Notice(notice) => format!(
                "{} {} {}",
                notice.target,
                notice.severity.tag(),
                notice.text
            ),
            Message::Text(chat) => format!(
                "{}{LINE}{}{LINE}{}",
                chat.sender,
                chat.recipients.join(&GROUP.to_string()),
                chat.text
            ),
        }
    }
}

// ---------------------------------------------------------------------------
// Encoding helpers
// ---------------------------------------------------------------------------

/// Single decimal digit; out-of-range values saturate at 9.
fn digit(value: u8) -> char {
    char::from_digit(u32::from(value.min(9)), 10).unwrap_or('9')
}

fn flag(value: bool) -> &'static str {
    if value { "1" } else { "0" }
}

fn encode_pose(pose: &TrainPose) -> String {
    format!(
        "{} {} {} {} {} {} {}",
        pose.position.tile_x,
        pose.position.tile_z,
        pose.position.x,
        pose.position.z,
        pose.direction.wire_value(),
        pose.travelled,
        pose.speed
    )
}

fn encode_cars(cars: &[CarDescriptor]) -> String {
    cars.iter()
        .map(|car| format!("{}{GROUP}{}{GROUP}{}", car.file, car.id, flag(car.flipped)))
        .collect::<Vec<_>>()
        .join(&GROUP.to_string())
}

fn encode_move_entry(entry: &MoveEntry) -> String {
    format!(
        "{} {} {} {} {} {} {} {} {} {} {}",
        entry.originator,
        entry.number.0,
        entry.car_count,
        entry.travelled,
        entry.speed,
        entry.track_node,
        entry.direction.wire_value(),
        entry.position.tile_x,
        entry.position.tile_z,
        entry.position.x,
        entry.position.z
    )
}

fn encode_player_join(join: &PlayerJoin) -> String {
    let env = &join.environment;
    let lines = [
        join.user.clone(),
        join.route.clone(),
        join.path.clone(),
        join.consist.clone(),
        join.lead_unit.clone(),
        format!("{} {}", join.number.0, encode_pose(&join.pose)),
        format!("{} {} {}", env.clock_seconds, env.season, env.weather),
        join.pantographs
            .iter()
            .map(|p| flag(*p))
            .collect::<Vec<_>>()
            .join(" "),
        encode_cars(&join.cars),
    ];
    lines.join(&LINE.to_string())
}

fn encode_snapshot(snapshot: &TrainSnapshot) -> String {
    format!(
        "{} {} {}{LINE}{}",
        snapshot.originator,
        snapshot.number.0,
        encode_pose(&snapshot.pose),
        encode_cars(&snapshot.cars)
    )
}

fn encode_couple(couple: &Couple) -> String {
    format!(
        "{} {} {} {}{LINE}{}{LINE}{}{LINE}{}",
        couple.user,
        couple.survivor.0,
        couple.removed.0,
        couple.controller,
        couple.lead_unit,
        encode_pose(&couple.pose),
        encode_cars(&couple.cars)
    )
}

fn encode_uncouple(uncouple: &Uncouple) -> String {
    format!(
        "{} {} {} {} {} {}{LINE}{}{LINE}{}{LINE}{}{LINE}{}",
        uncouple.user,
        uncouple.retained.0,
        uncouple.provisional.0,
        uncouple.assigned.0,
        flag(uncouple.confirmed),
        uncouple.player_piece.wire_value(),
        encode_pose(&uncouple.retained_pose),
        encode_cars(&uncouple.retained_cars),
        encode_pose(&uncouple.new_pose),
        encode_cars(&uncouple.new_cars)
    )
}

// ---------------------------------------------------------------------------
// Decoding helpers
// ---------------------------------------------------------------------------

/// Whitespace-separated field reader that reports errors against the
/// message kind being decoded.
struct Tokens<'a> {
    kind: &'static str,
    iter: std::str::SplitWhitespace<'a>,
}

impl<'a> Tokens<'a> {
    fn new(kind: MessageKind, text: &'a str) -> Self {
        Self {
            kind: kind.tag(),
            iter: text.split_whitespace(),
        }
    }

    fn next(&mut self, field: &'static str) -> Result<&'a str, DecodeError> {
        self.iter.next().ok_or(DecodeError::MissingField {
            kind: self.kind,
            field,
        })
    }

    fn has_more(&self) -> bool {
        self.iter.clone().next().is_some()
    }

    fn parse<T: FromStr>(&mut self, field: &'static str) -> Result<T, DecodeError> {
        let token = self.next(field)?;
        token.parse().map_err(|_| DecodeError::InvalidField {
            kind: self.kind,
            field,
            value: token.to_owned(),
        })
    }

    fn number(&mut self, field: &'static str) -> Result<TrainNumber, DecodeError> {
        self.parse(field).map(TrainNumber)
    }

    fn flag(&mut self, field: &'static str) -> Result<bool, DecodeError> {
        let value: u8 = self.parse(field)?;
        match value {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(invalid(self.kind, field, value)),
        }
    }

    fn direction(&mut self) -> Result<Direction, DecodeError> {
        let value: u8 = self.parse("direction")?;
        Direction::from_wire(value).ok_or_else(|| invalid(self.kind, "direction", value))
    }

    fn pose(&mut self) -> Result<TrainPose, DecodeError> {
        let position = WorldPosition {
            tile_x: self.parse("tile_x")?,
            tile_z: self.parse("tile_z")?,
            x: self.parse("x")?,
            z: self.parse("z")?,
        };
        Ok(TrainPose {
            position,
            direction: self.direction()?,
            travelled: self.parse("travelled")?,
            speed: self.parse("speed")?,
        })
    }

    fn finish(self) -> Result<(), DecodeError> {
        let extra = self.iter.count();
        if extra == 0 {
            Ok(())
        } else {
            Err(DecodeError::TrailingFields {
                kind: self.kind,
                extra,
            })
        }
    }
}

/// CR-separated line reader.
struct Lines<'a> {
    kind: MessageKind,
    iter: std::str::Split<'a, char>,
}

impl<'a> Lines<'a> {
    fn new(kind: MessageKind, text: &'a str) -> Self {
        Self {
            kind,
            iter: text.split(LINE),
        }
    }

    fn next(&mut self, field: &'static str) -> Result<&'a str, DecodeError> {
        self.iter.next().ok_or(DecodeError::MissingField {
            kind: self.kind.tag(),
            field,
        })
    }

    fn tokens(&mut self, field: &'static str) -> Result<Tokens<'a>, DecodeError> {
        let line = self.next(field)?;
        Ok(Tokens::new(self.kind, line))
    }

    fn pose(&mut self, field: &'static str) -> Result<TrainPose, DecodeError> {
        let mut tokens = self.tokens(field)?;
        let pose = tokens.pose()?;
        tokens.finish()?;
        Ok(pose)
    }

    fn cars(&mut self, field: &'static str) -> Result<Vec<CarDescriptor>, DecodeError> {
        let line = self.next(field)?;
        decode_cars(self.kind, line)
    }

    fn finish(self) -> Result<(), DecodeError> {
        let extra = self.iter.count();
        if extra == 0 {
            Ok(())
        } else {
            Err(DecodeError::TrailingFields {
                kind: self.kind.tag(),
                extra,
            })
        }
    }
}

fn invalid(kind: &'static str, field: &'static str, value: impl ToString) -> DecodeError {
    DecodeError::InvalidField {
        kind,
        field,
        value: value.to_string(),
    }
}

fn decode_cars(kind: MessageKind, line: &str) -> Result<Vec<CarDescriptor>, DecodeError> {
    if line.is_empty() {
        return Ok(Vec::new());
    }
    let fields: Vec<&str> = line.split(GROUP).collect();
    if fields.len() % 3 != 0 {
        return Err(invalid(kind.tag(), "cars", line));
    }
    fields
        .chunks(3)
        .map(|group| {
            let flipped = match group[2] {
                "0" => false,
                "1" => true,
                other => return Err(invalid(kind.tag(), "flipped", other)),
            };
            Ok(CarDescriptor::new(group[0], group[1], flipped))
        })
        .collect()
}

fn decode_digits(kind: MessageKind, body: &str) -> Result<Vec<u8>, DecodeError> {
    body.chars()
        .map(|c| {
            c.to_digit(10)
                .map(|d| d as u8)
                .ok_or_else(|| invalid(kind.tag(), "state", c))
        })
        .collect()
}

fn decode_body(kind: MessageKind, body: &str) -> Result<Message, DecodeError> {
    match kind {
        MessageKind::Move => {
            let mut tokens = Tokens::new(kind, body);
            let mut entries = Vec::new();
            while tokens.has_more() {
                entries.push(MoveEntry {
                    originator: Originator::parse(tokens.next("originator")?),
                    number: tokens.number("number")?,
                    car_count: tokens.parse("car_count")?,
                    travelled: tokens.parse("travelled")?,
                    speed: tokens.parse("speed")?,
                    track_node: tokens.parse("track_node")?,
                    direction: tokens.direction()?,
                    position: WorldPosition {
                        tile_x: tokens.parse("tile_x")?,
                        tile_z: tokens.parse("tile_z")?,
                        x: tokens.parse("x")?,
                        z: tokens.parse("z")?,
                    },
                });
            }
            Ok(Message::Move(entries))
        }
        MessageKind::PlayerJoin => {
            let mut lines = Lines::new(kind, body);
            let user = lines.next("user")?.to_owned();
            let route = lines.next("route")?.to_owned();
            let path = lines.next("path")?.to_owned();
            let consist = lines.next("consist")?.to_owned();
            let lead_unit = lines.next("lead_unit")?.to_owned();

            let mut placement = lines.tokens("placement")?;
            let number = placement.number("number")?;
            let pose = placement.pose()?;
            placement.finish()?;

            let mut env = lines.tokens("environment")?;
            let environment = Environment {
                clock_seconds: env.parse("clock")?,
                season: env.parse("season")?,
                weather: env.parse("weather")?,
            };
            env.finish()?;

            let mut pantos = lines.tokens("pantographs")?;
            let mut pantographs = [false; 4];
            for slot in &mut pantographs {
                *slot = pantos.flag("pantograph")?;
            }
            pantos.finish()?;

            let cars = lines.cars("cars")?;
            lines.finish()?;
            Ok(Message::PlayerJoin(PlayerJoin {
                user,
                route,
                path,
                consist,
                lead_unit,
                number,
                pose,
                environment,
                pantographs,
                cars,
            }))
        }
        MessageKind::Train | MessageKind::UpdateTrain => {
            let mut lines = Lines::new(kind, body);
            let mut head = lines.tokens("header")?;
            let originator = Originator::parse(head.next("originator")?);
            let number = head.number("number")?;
            let pose = head.pose()?;
            head.finish()?;
            let cars = lines.cars("cars")?;
            lines.finish()?;
            let snapshot = TrainSnapshot {
                originator,
                number,
                pose,
                cars,
            };
            Ok(if kind == MessageKind::Train {
                Message::Train(snapshot)
            } else {
                Message::UpdateTrain(snapshot)
            })
        }
        MessageKind::RemoveTrain => {
            let mut tokens = Tokens::new(kind, body);
            let mut numbers = Vec::new();
            while tokens.has_more() {
                numbers.push(tokens.number("number")?);
            }
            Ok(Message::RemoveTrain(numbers))
        }
        MessageKind::Switch => {
            let mut tokens = Tokens::new(kind, body);
            let change = SwitchChange {
                user: tokens.next("user")?.to_owned(),
                index: tokens.parse("index")?,
                state: tokens.parse("state")?,
            };
            tokens.finish()?;
            Ok(Message::Switch(change))
        }
        MessageKind::SwitchStatus => Ok(Message::SwitchStatus(decode_digits(kind, body)?)),
        MessageKind::SignalStatus => {
            let digits = decode_digits(kind, body)?;
            if digits.len() % 2 != 0 {
                return Err(invalid(kind.tag(), "signal pairs", body));
            }
            Ok(Message::SignalStatus(
                digits
                    .chunks(2)
                    .map(|pair| SignalHeadState::new(pair[0], pair[1]))
                    .collect(),
            ))
        }
        MessageKind::Couple => {
            let mut lines = Lines::new(kind, body);
            let mut head = lines.tokens("header")?;
            let user = head.next("user")?.to_owned();
            let survivor = head.number("survivor")?;
            let removed = head.number("removed")?;
            let controller = Originator::parse(head.next("controller")?);
            head.finish()?;
            let lead_unit = lines.next("lead_unit")?.to_owned();
            let pose = lines.pose("pose")?;
            let cars = lines.cars("cars")?;
            lines.finish()?;
            Ok(Message::Couple(Couple {
                user,
                survivor,
                removed,
                controller,
                lead_unit,
                pose,
                cars,
            }))
        }
        MessageKind::Uncouple => {
            let mut lines = Lines::new(kind, body);
            let mut head = lines.tokens("header")?;
            let user = head.next("user")?.to_owned();
            let retained = head.number("retained")?;
            let provisional = head.number("provisional")?;
            let assigned = head.number("assigned")?;
            let confirmed = head.flag("confirmed")?;
            let piece: u8 = head.parse("player_piece")?;
            let player_piece = PlayerPiece::from_wire(piece)
                .ok_or_else(|| invalid(kind.tag(), "player_piece", piece))?;
            head.finish()?;
            let retained_pose = lines.pose("retained_pose")?;
            let retained_cars = lines.cars("retained_cars")?;
            let new_pose = lines.pose("new_pose")?;
            let new_cars = lines.cars("new_cars")?;
            lines.finish()?;
            Ok(Message::Uncouple(Uncouple {
                user,
                retained,
                provisional,
                assigned,
                confirmed,
                player_piece,
                retained_pose,
                retained_cars,
                new_pose,
                new_cars,
            }))
        }
        MessageKind::Control => {
            let mut parts = body.splitn(4, ' ');
            let missing = |field| DecodeError::MissingField {
                kind: kind.tag(),
                field,
            };
            let user = parts.next().filter(|s| !s.is_empty()).ok_or(missing("user"))?;
            let action_tag = parts.next().ok_or(missing("action"))?;
            let action = ControlAction::from_tag(action_tag)
                .ok_or_else(|| invalid(kind.tag(), "action", action_tag))?;
            let number_text = parts.next().ok_or(missing("number"))?;
            let number = number_text
                .parse()
                .map(TrainNumber)
                .map_err(|_| invalid(kind.tag(), "number", number_text))?;
            let lead_unit = parts.next().unwrap_or_default();
            Ok(Message::Control(ControlMessage {
                user: user.to_owned(),
                action,
                number,
                lead_unit: lead_unit.to_owned(),
            }))
        }
        MessageKind::Event => {
            let mut tokens = Tokens::new(kind, body);
            let user = tokens.next("user")?.to_owned();
            let kind_tag = tokens.next("event")?;
            let event_kind = EventKind::from_tag(kind_tag)
                .ok_or_else(|| invalid(kind.tag(), "event", kind_tag))?;
            let state = tokens.parse("state")?;
            tokens.finish()?;
            Ok(Message::Event(ControlEvent {
                user,
                kind: event_kind,
                state,
            }))
        }
        MessageKind::Alive => {
            let mut tokens = Tokens::new(kind, body);
            let user = tokens.next("user")?.to_owned();
            tokens.finish()?;
            Ok(Message::Alive { user })
        }
        MessageKind::Quit => {
            let mut tokens = Tokens::new(kind, body);
            let user = tokens.next("user")?.to_owned();
            let server_departing = match tokens.iter.next() {
                None => false,
                Some(SERVER_DEPARTURE_MARKER) => true,
                Some(other) => return Err(invalid(kind.tag(), "marker", other)),
            };
            tokens.finish()?;
            Ok(Message::Quit {
                user,
                server_departing,
            })
        }
        MessageKind::GetTrain => {
            let mut tokens = Tokens::new(kind, body);
            let user = tokens.next("user")?.to_owned();
            let number = tokens.number("number")?;
            tokens.finish()?;
            Ok(Message::GetTrain { user, number })
        }
        MessageKind::Notice => {
            let mut parts = body.splitn(3, ' ');
            let target = parts
                .next()
                .filter(|s| !s.is_empty())
                .ok_or(DecodeError::MissingField {
                    kind: kind.tag(),
                    field: "target",
                })?;
            let severity_tag = parts.next().ok_or(DecodeError::MissingField {
                kind: kind.tag(),
                field: "severity",
            })?;
            let severity = Severity::from_tag(severity_tag)
                .ok_or_else(|| invalid(kind.tag(), "severity", severity_tag))?;
            Ok(Message::Notice(Notice {
                target: target.to_owned(),
                severity,
                text: parts.next().unwrap_or_default().to_owned(),
            }))
        }
        MessageKind::Text => {
            let mut parts = body.splitn(3, LINE);
            let sender = parts
                .next()
                .filter(|s| !s.is_empty())
                .ok_or(DecodeError::MissingField {
                    kind: kind.tag(),
                    field: "sender",
                })?;
            let recipients = parts.next().ok_or(DecodeError::MissingField {
                kind: kind.tag(),
                field: "recipients",
            })?;
            Ok(Message::Text(Chat {
                sender: sender.to_owned(),
                recipients: recipients
                    .split(GROUP)
                    .filter(|r| !r.is_empty())
                    .map(str::to_owned)
                    .collect(),
                text: parts.next().unwrap_or_default().to_owned(),
            }))
        }
    }
}
