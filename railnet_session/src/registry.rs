// Participant registry ("OnlineTrains").
//
// Maps remote participant names to their records: the connection they arrived
// on (server side only), the train they control, the car they drive and the
// join details needed to announce them to later joiners. The local
// participant is not in the registry; it lives in `LocalPlayer`.
//
// The registry answers "does this train belong to a known peer" for the
// reconciliation and ownership code in `world.rs`. It never touches train
// replicas itself, so keeping `Participant::train` consistent with
// `TrainReplica::controller` is the caller's job.

use std::collections::BTreeMap;

use railnet_protocol::{CarDescriptor, Environment, PlayerJoin, TrainNumber};

use crate::connection::ConnectionId;
use crate::replica::TrainReplica;

/// The parts of a join announcement that describe the player rather than
/// the train.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct JoinDetails {
    pub route: String,
    pub path: String,
    pub consist: String,
    pub environment: Environment,
    pub pantographs: [bool; 4],
}

impl JoinDetails {
    pub fn from_join(join: &PlayerJoin) -> Self {
        Self {
            route: join.route.clone(),
            path: join.path.clone(),
            consist: join.consist.clone(),
            environment: join.environment,
            pantographs: join.pantographs,
        }
    }

    /// Build the join announcement for `user` driving `train`.
    pub fn announce(&self, user: &str, lead_unit: &str, train: &TrainReplica) -> PlayerJoin {
        PlayerJoin {
            user: user.to_owned(),
            route: self.route.clone(),
            path: self.path.clone(),
            consist: self.consist.clone(),
            lead_unit: lead_unit.to_owned(),
            number: train.number,
            pose: train.pose,
            environment: self.environment,
            pantographs: self.pantographs,
            cars: train.descriptors(),
        }
    }
}

/// The participant running this process.
#[derive(Clone, Debug)]
pub struct LocalPlayer {
    pub name: String,
    pub train: Option<TrainNumber>,
    pub lead_unit: String,
    pub details: JoinDetails,
}

/// A remote participant.
#[derive(Clone, Debug)]
pub struct Participant {
    pub name: String,
    /// The connection the participant joined on. Server side only.
    pub connection: Option<ConnectionId>,
    pub train: Option<TrainNumber>,
    pub lead_unit: String,
    pub details: JoinDetails,
}

impl Participant {
    pub fn new(name: impl Into<String>, train: TrainNumber, lead_unit: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            connection: None,
            train: Some(train),
            lead_unit: lead_unit.into(),
            details: JoinDetails::default(),
        }
    }
}

/// Remote participants keyed by display name.
#[derive(Debug, Default)]
pub struct OnlineTrains {
    players: BTreeMap<String, Participant>,
}

impl OnlineTrains {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.players.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&Participant> {
        self.players.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Participant> {
        self.players.get_mut(name)
    }

    /// Insert a participant, returning any record it replaced.
    pub fn insert(&mut self, participant: Participant) -> Option<Participant> {
        self.players.insert(participant.name.clone(), participant)
    }

    pub fn remove(&mut self, name: &str) -> Option<Participant> {
        self.players.remove(name)
    }

    pub fn clear(&mut self) {
        self.players.clear();
    }

    pub fn names(&self) -> Vec<String> {
        self.players.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Participant> {
        self.players.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Participant> {
        self.players.values_mut()
    }

    /// The participant that joined on `connection`.
    pub fn by_connection(&self, connection: ConnectionId) -> Option<&Participant> {
        self.players
            .values()
            .find(|p| p.connection == Some(connection))
    }

    /// The participant controlling `number`, if it is a peer's train.
    pub fn owner_of(&self, number: TrainNumber) -> Option<&Participant> {
        self.players.values().find(|p| p.train == Some(number))
    }

    pub fn is_peer_train(&self, number: TrainNumber) -> bool {
        self.owner_of(number).is_some()
    }

    /// The first participant whose lead unit is among `cars`.
    pub fn driving_any_of(&self, cars: &[CarDescriptor]) -> Option<&Participant> {
        self.players
            .values()
            .find(|p| cars.iter().any(|car| car.id == p.lead_unit))
    }

    /// Drop every reference to `number`.
    pub fn release_train(&mut self, number: TrainNumber) {
        for participant in self.players.values_mut() {
            if participant.train == Some(number) {
                participant.train = None;
            }
        }
    }

    /// Point references to `from` at `to`.
    pub fn retarget(&mut self, from: TrainNumber, to: TrainNumber) {
        for participant in self.players.values_mut() {
            if participant.train == Some(from) {
                participant.train = Some(to);
            }
        }
    }
}
