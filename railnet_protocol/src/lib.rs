// railnet_protocol: wire protocol for multiplayer train synchronization.
//
// This crate defines the message vocabulary, the text codec and the framing
// used between the session server (`railnet_session::server`) and its
// clients (`railnet_session::client`). It is shared by both sides and has no
// dependency on the session crate, the physics or the track model.
//
// Module overview:
// - `types.rs`:    Value types: `TrainNumber`, `WorldPosition`, `TrainPose`,
//                  `CarDescriptor`, `Originator`, name validation.
// - `message.rs`:  The closed `Message` enum and its per-kind payload structs.
// - `codec.rs`:    `Message::encode` / `Message::decode`, the delimited text
//                  representation (space / CR / tab separated fields).
// - `framing.rs`:  `"<length>: <payload>"` framing and the incremental
//                  `FrameDecoder` used by connection reader threads.
// - `error.rs`:    `FrameError` (fatal to a connection) and `DecodeError`
//                  (drop one message).
//
// Design decisions:
// - **Text, not binary.** Every field is human readable in a packet capture;
//   floats round-trip exactly through Rust's shortest formatting.
// - **Index-keyed track snapshots.** Switch and signal snapshots are plain
//   digit strings in track enumeration order. Both peers must load the same
//   route data for the indices to line up.
// - **No I/O.** Framing works on byte slices; the session crate owns sockets.

pub mod codec;
pub mod error;
pub mod framing;
pub mod message;
pub mod types;

pub use error::{DecodeError, FrameError, NameError};
pub use framing::{FrameDecoder, MAX_MESSAGE_SIZE, encode_frame};
pub use message::{
    Chat, ControlAction, ControlEvent, ControlMessage, Couple, EventKind, Message, MessageKind,
    MAX_SWITCH_STATE, MoveEntry, Notice, PlayerJoin, PlayerPiece, SERVER_DEPARTURE_MARKER, Severity,
    SwitchChange, TrainSnapshot, Uncouple,
};
pub use types::{
    CarDescriptor, Direction, Environment, Originator, SignalHeadState, TrainNumber, TrainPose,
    WorldPosition, validate_player_name,
};

#[cfg(test)]
mod tests {
    use super::*;

    /// Encode a message, frame it, feed it through a decoder one byte at a
    /// time, and decode it again.
    fn wire_roundtrip(msg: &Message) {
        let frame = msg.to_frame();
        let mut decoder = FrameDecoder::new();
        let mut payloads = Vec::new();
        for byte in &frame {
            decoder.push(std::slice::from_ref(byte));
            while let Some(payload) = decoder.pop().unwrap() {
                payloads.push(payload);
            }
        }
        assert_eq!(payloads.len(), 1);
        assert_eq!(&Message::decode(&payloads[0]).unwrap(), msg);
    }

    #[test]
    fn join_over_the_wire() {
        wire_roundtrip(&Message::PlayerJoin(PlayerJoin {
            user: "Alice".into(),
            route: "Marias Pass".into(),
            path: "east.pat".into(),
            consist: "freight.con".into(),
            lead_unit: "Alice - 0".into(),
            number: TrainNumber(1_000_000),
            pose: TrainPose::default(),
            environment: Environment::default(),
            pantographs: [true, false, false, false],
            cars: vec![
                CarDescriptor::new("dash9.eng", "Alice - 0", false),
                CarDescriptor::new("boxcar.wag", "Alice - 1", false),
                CarDescriptor::new("boxcar.wag", "Alice - 2", true),
            ],
        }));
    }

    #[test]
    fn session_end_over_the_wire() {
        wire_roundtrip(&Message::Quit {
            user: "Host".into(),
            server_departing: true,
        });
    }

    #[test]
    fn batch_of_frames_in_one_read() {
        let messages = vec![
            Message::SwitchStatus(vec![1, 0, 1]),
            Message::SignalStatus(vec![SignalHeadState::new(3, 1)]),
            Message::RemoveTrain(vec![TrainNumber(8)]),
        ];
        let wire: Vec<u8> = messages.iter().flat_map(Message::to_frame).collect();

        let mut decoder = FrameDecoder::new();
        decoder.push(&wire);
        let mut decoded = Vec::new();
        while let Some(payload) = decoder.pop().unwrap() {
            decoded.push(Message::decode(&payload).unwrap());
        }
        assert_eq!(decoded, messages);
    }
}
