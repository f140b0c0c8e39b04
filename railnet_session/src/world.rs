// Replicated world state and its ownership rules.
//
// `World` is everything one participant knows about the shared session: the
// train replicas, the remote participants, the local player, missing-train
// counters, the set of uncoupled orphan pieces, the train-number allocator
// and the session status. `Session` keeps it behind a single mutex.
//
// Ownership invariant: every replica is either some participant's controlled
// train (its `controller` names that participant, and that participant's
// `train` points back at it) or an orphan (`controller` is `None` and no
// participant points at it). `set_controller` is the only place that changes
// a replica's controller and it maintains both directions, including
// releasing whatever other train the new controller held before.
// `ownership_violations` checks the invariant and is used by the tests.
//
// The couple/uncouple/snapshot operations return `Structural`: replicas to
// add and numbers to remove. Message handlers on reader threads defer those
// through `Housekeeping`; local operations on the game thread apply them at
// once with `apply_structural`.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info, warn};

use railnet_protocol::{
    CarDescriptor, Chat, Couple, EventKind, MoveEntry, Notice, PlayerJoin, TrainNumber,
    TrainSnapshot, Uncouple,
};

use crate::missing::MissingCounters;
use crate::registry::{LocalPlayer, OnlineTrains};
use crate::replica::{CarPool, RemoteUpdate, TrainMode, TrainReplica};
use crate::track::TrainPhysics;

/// First number of the provisional range clients allocate from.
pub const PROVISIONAL_BASE: u32 = 1_000_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionStatus {
    /// Client connected, join not yet confirmed.
    Joining,
    Active,
    /// Multiplayer was abandoned; the local train is still driven.
    SinglePlayer { reason: String },
    /// Shut down locally.
    Ended,
}

impl SessionStatus {
    pub fn is_live(&self) -> bool {
        matches!(self, SessionStatus::Joining | SessionStatus::Active)
    }
}

/// Train number allocator.
#[derive(Debug)]
pub struct TrainNumbers {
    next_assigned: u32,
    next_provisional: u32,
}

impl TrainNumbers {
    pub fn new() -> Self {
        Self {
            next_assigned: 1,
            next_provisional: PROVISIONAL_BASE,
        }
    }

    /// Next authoritative number for which `in_use` is false.
    pub fn assign(&mut self, in_use: impl Fn(TrainNumber) -> bool) -> TrainNumber {
        loop {
            let candidate = TrainNumber(self.next_assigned);
            self.next_assigned = if self.next_assigned + 1 >= PROVISIONAL_BASE {
                1
            } else {
                self.next_assigned + 1
            };
            if !in_use(candidate) {
                return candidate;
            }
        }
    }

    pub fn provisional(&mut self) -> TrainNumber {
        let number = TrainNumber(self.next_provisional);
        self.next_provisional = self
            .next_provisional
            .checked_add(1)
            .unwrap_or(PROVISIONAL_BASE);
        number
    }
}

impl Default for TrainNumbers {
    fn default() -> Self {
        Self::new()
    }
}

pub fn is_provisional(number: TrainNumber) -> bool {
    number.0 >= PROVISIONAL_BASE
}

/// Replica insertions and removals produced by one operation.
#[derive(Debug, Default)]
pub struct Structural {
    pub added: Vec<TrainReplica>,
    pub removed: Vec<TrainNumber>,
}

pub struct World {
    role: Role,
    pub trains: BTreeMap<TrainNumber, TrainReplica>,
    pub players: OnlineTrains,
    pub local: LocalPlayer,
    pub missing: MissingCounters,
    pub uncoupled: BTreeSet<TrainNumber>,
    pub numbers: TrainNumbers,
    pub status: SessionStatus,
    pub notices: Vec<Notice>,
    pub chat: Vec<Chat>,
}

impl World {
    pub fn new(role: Role, local: LocalPlayer, missing_threshold: u32) -> Self {
        Self {
            role,
            trains: BTreeMap::new(),
            players: OnlineTrains::new(),
            local,
            missing: MissingCounters::new(missing_threshold),
            uncoupled: BTreeSet::new(),
            numbers: TrainNumbers::new(),
            status: match role {
                Role::Server => SessionStatus::Active,
                Role::Client => SessionStatus::Joining,
            },
            notices: Vec::new(),
            chat: Vec::new(),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Whether `name` is the local player or a registered peer.
    pub fn is_live(&self, name: &str) -> bool {
        name == self.local.name || self.players.contains(name)
    }

    pub fn lead_unit_of(&self, name: &str) -> Option<&str> {
        let lead = if name == self.local.name {
            Some(self.local.lead_unit.as_str())
        } else {
            self.players.get(name).map(|p| p.lead_unit.as_str())
        };
        lead.filter(|lead| !lead.is_empty())
    }

    fn set_lead_unit(&mut self, name: &str, lead_unit: &str) {
        if lead_unit.is_empty() {
            return;
        }
        if name == self.local.name {
            self.local.lead_unit = lead_unit.to_owned();
        } else if let Some(participant) = self.players.get_mut(name) {
            participant.lead_unit = lead_unit.to_owned();
        }
    }

    fn train_of(&self, name: &str) -> Option<TrainNumber> {
        if name == self.local.name {
            self.local.train
        } else {
            self.players.get(name).and_then(|p| p.train)
        }
    }

    pub fn mode_for(&self, controller: Option<&str>) -> TrainMode {
        match controller {
            Some(name) if name == self.local.name => TrainMode::PlayerControlled,
            Some(_) => TrainMode::Remote,
            None => match self.role {
                Role::Server => TrainMode::Ai,
                Role::Client => TrainMode::Remote,
            },
        }
    }

    /// Next free authoritative train number.
    pub fn assign_number(&mut self) -> TrainNumber {
        let trains = &self.trains;
        self.numbers.assign(|n| trains.contains_key(&n))
    }

    /// The local player's join announcement, if it drives a train.
    pub fn local_join(&self) -> Option<PlayerJoin> {
        let train = self.local.train.and_then(|n| self.trains.get(&n))?;
        Some(
            self.local
                .details
                .announce(&self.local.name, &self.local.lead_unit, train),
        )
    }

    /// Make `controller` the controller of `number`, keeping participant
    /// references consistent. Controllers that are not live are treated as
    /// nobody.
    pub fn set_controller(&mut self, number: TrainNumber, controller: Option<String>) {
        if !self.trains.contains_key(&number) {
            return;
        }
        let controller = controller.filter(|name| self.is_live(name));

        if let Some(name) = controller.as_deref() {
            if let Some(previous) = self.train_of(name).filter(|p| *p != number) {
                debug!(user = name, train = %previous, "controller moved on, orphaning");
                self.orphan(previous);
            }
        }

        let controller_name = controller.as_deref();
        if self.local.train == Some(number) && controller_name != Some(self.local.name.as_str()) {
            self.local.train = None;
        }
        for participant in self.players.iter_mut() {
            if participant.train == Some(number) && controller_name != Some(participant.name.as_str())
            {
                participant.train = None;
            }
        }
        match controller_name {
            Some(name) if name == self.local.name => self.local.train = Some(number),
            Some(name) => {
                if let Some(participant) = self.players.get_mut(name) {
                    participant.train = Some(number);
                }
            }
            None => {}
        }

        let mode = self.mode_for(controller_name);
        if controller.is_some() {
            self.uncoupled.remove(&number);
        }
        if let Some(train) = self.trains.get_mut(&number) {
            train.mode = mode;
            train.controller = controller;
        }
    }

    /// Detach `number` from its controller and mark it an uncoupled orphan.
    fn orphan(&mut self, number: TrainNumber) {
        let mode = self.mode_for(None);
        if let Some(train) = self.trains.get_mut(&number) {
            train.controller = None;
            train.mode = mode;
            self.uncoupled.insert(number);
        }
        if self.local.train == Some(number) {
            self.local.train = None;
        }
        self.players.release_train(number);
    }

    /// Insert (or replace) a replica and bind its controller.
    pub fn install(&mut self, train: TrainReplica) {
        let number = train.number;
        let controller = train.controller.clone();
        if self.trains.insert(number, train).is_some() {
            debug!(train = %number, "replica replaced");
        }
        self.missing.reset(number);
        self.set_controller(number, controller);
    }

    pub fn remove_train(&mut self, number: TrainNumber) -> bool {
        if self.trains.remove(&number).is_none() {
            return false;
        }
        if self.local.train == Some(number) {
            self.local.train = None;
        }
        self.players.release_train(number);
        self.uncoupled.remove(&number);
        self.missing.reset(number);
        true
    }

    /// Renumber a replica, typically provisional to authoritative.
    pub fn rename_train(&mut self, from: TrainNumber, to: TrainNumber) {
        if from == to {
            return;
        }
        let Some(mut train) = self.trains.remove(&from) else {
            warn!(%from, %to, "rename of unknown train");
            return;
        };
        train.number = to;
        if self.trains.insert(to, train).is_some() {
            warn!(%from, %to, "rename replaced an existing train");
        }
        if self.local.train == Some(from) {
            self.local.train = Some(to);
        }
        self.players.retarget(from, to);
        if self.uncoupled.remove(&from) {
            self.uncoupled.insert(to);
        }
        self.missing.reset(from);
        self.missing.reset(to);
        debug!(%from, %to, "train renumbered");
    }

    pub fn apply_structural(&mut self, structural: Structural) {
        for train in structural.added {
            self.install(train);
        }
        for number in structural.removed {
            self.remove_train(number);
        }
    }

    /// Who should control a piece made of `cars`: the initiator if the piece
    /// holds the initiator's car, else the first live participant whose lead
    /// unit is aboard, else nobody.
    pub fn piece_controller(
        &self,
        cars: &[CarDescriptor],
        initiator: &str,
        holds_initiator: bool,
    ) -> Option<String> {
        if holds_initiator && self.is_live(initiator) {
            return Some(initiator.to_owned());
        }
        let local_lead = self.local.lead_unit.as_str();
        if !local_lead.is_empty() && cars.iter().any(|car| car.id == local_lead) {
            return Some(self.local.name.clone());
        }
        self.players
            .driving_any_of(cars)
            .map(|participant| participant.name.clone())
    }

    /// Apply a position update from the participant `sender`. Only entries
    /// for trains `sender` controls are taken.
    pub fn apply_peer_move(&mut self, sender: &str, entry: &MoveEntry) -> bool {
        if entry.originator.player() != Some(sender) {
            return false;
        }
        match self.trains.get_mut(&entry.number) {
            Some(train) if train.controller.as_deref() == Some(sender) => {
                train.to_do_update(RemoteUpdate::from(entry))
            }
            _ => false,
        }
    }

    /// Apply a position update relayed by the server. Returns true when the
    /// train has now been missing (or mismatched) often enough to ask the
    /// server for it.
    pub fn apply_remote_move(&mut self, entry: &MoveEntry) -> bool {
        match self.trains.get_mut(&entry.number) {
            None => self.missing.record(entry.number),
            Some(train) if train.mode == TrainMode::PlayerControlled => false,
            Some(train) => {
                let mismatch = train.cars.len() as u32 != entry.car_count;
                train.to_do_update(RemoteUpdate::from(entry));
                if mismatch {
                    self.missing.record(entry.number)
                } else {
                    self.missing.reset(entry.number);
                    false
                }
            }
        }
    }

    /// The trains for this tick's `Move` batch. Marks them reported.
    pub fn move_batch(&mut self) -> Vec<MoveEntry> {
        let role = self.role;
        self.trains
            .values_mut()
            .filter(|t| role == Role::Server || t.mode == TrainMode::PlayerControlled)
            .filter(|t| t.is_moving_or_just_stopped())
            .map(|t| {
                t.last_reported_speed = t.pose.speed;
                t.move_entry()
            })
            .collect()
    }

    /// Snapshots of trains nobody controls, for late joiners.
    pub fn orphan_snapshots(&self) -> Vec<TrainSnapshot> {
        self.trains
            .values()
            .filter(|t| t.controller.is_none())
            .map(TrainReplica::snapshot)
            .collect()
    }

    /// Update a replica in place from a full snapshot, or build a new one,
    /// which is returned for the caller to install.
    pub fn apply_snapshot(
        &mut self,
        snapshot: &TrainSnapshot,
        physics: &dyn TrainPhysics,
    ) -> Option<TrainReplica> {
        let number = snapshot.number;
        let controller = snapshot.originator.player().map(str::to_owned);
        self.missing.reset(number);
        match self.trains.get_mut(&number) {
            Some(train) if train.mode == TrainMode::PlayerControlled => {
                debug!(train = %number, "snapshot of our own train ignored");
                None
            }
            Some(train) => {
                let mut pool = CarPool::new();
                pool.absorb(train);
                train.rebuild_cars(&snapshot.cars, &mut pool);
                train.pose = snapshot.pose;
                train.after_consist_change(physics);
                self.set_controller(number, controller);
                None
            }
            None => {
                let mut train = TrainReplica::new(number, &snapshot.cars, snapshot.pose);
                train.controller = controller;
                train.after_consist_change(physics);
                Some(train)
            }
        }
    }

    /// Merge `couple.removed` into `couple.survivor`.
    pub fn apply_couple(&mut self, couple: &Couple, physics: &dyn TrainPhysics) -> Structural {
        let mut structural = Structural::default();
        let mut pool = CarPool::new();
        self.uncoupled.remove(&couple.removed);
        if couple.removed != couple.survivor {
            if let Some(removed) = self.trains.get_mut(&couple.removed) {
                pool.absorb(removed);
                structural.removed.push(couple.removed);
            }
            // Whoever drove the absorbed train now rides along.
            if self.local.train == Some(couple.removed) {
                self.local.train = None;
            }
            self.players.release_train(couple.removed);
        }

        let controller = couple.controller.player().map(str::to_owned);
        if let Some(name) = controller.as_deref() {
            self.set_lead_unit(name, &couple.lead_unit);
        }
        match self.trains.get_mut(&couple.survivor) {
            Some(survivor) => {
                pool.absorb(survivor);
                survivor.rebuild_cars(&couple.cars, &mut pool);
                survivor.pose = couple.pose;
                survivor.after_consist_change(physics);
                self.set_controller(couple.survivor, controller);
            }
            None => {
                let mut survivor = TrainReplica::new(couple.survivor, &[], couple.pose);
                survivor.rebuild_cars(&couple.cars, &mut pool);
                survivor.controller = controller;
                survivor.after_consist_change(physics);
                structural.added.push(survivor);
            }
        }
        info!(
            survivor = %couple.survivor,
            removed = %couple.removed,
            cars = couple.cars.len(),
            "trains coupled"
        );
        structural
    }

    /// Split `uncouple.retained`; the new piece gets `new_number`.
    pub fn apply_uncouple(
        &mut self,
        uncouple: &Uncouple,
        new_number: TrainNumber,
        physics: &dyn TrainPhysics,
    ) -> Structural {
        use railnet_protocol::PlayerPiece;

        let mut structural = Structural::default();
        let mut pool = CarPool::new();
        let mut path = String::new();
        if let Some(retained) = self.trains.get_mut(&uncouple.retained) {
            pool.absorb(retained);
            path = retained.path.clone();
        }

        let retained_controller = self.piece_controller(
            &uncouple.retained_cars,
            &uncouple.user,
            uncouple.player_piece == PlayerPiece::Retained,
        );
        let new_controller = self.piece_controller(
            &uncouple.new_cars,
            &uncouple.user,
            uncouple.player_piece == PlayerPiece::New,
        );

        let mut piece = TrainReplica::new(new_number, &[], uncouple.new_pose);
        piece.rebuild_cars(&uncouple.new_cars, &mut pool);
        piece.path = path;
        piece.controller = new_controller.clone();
        piece.after_consist_change(physics);

        match self.trains.get_mut(&uncouple.retained) {
            Some(retained) => {
                retained.rebuild_cars(&uncouple.retained_cars, &mut pool);
                retained.pose = uncouple.retained_pose;
                retained.after_consist_change(physics);
                let orphaned = retained_controller.is_none();
                self.set_controller(uncouple.retained, retained_controller);
                if orphaned {
                    self.uncoupled.insert(uncouple.retained);
                }
            }
            None => {
                let mut retained =
                    TrainReplica::new(uncouple.retained, &[], uncouple.retained_pose);
                retained.rebuild_cars(&uncouple.retained_cars, &mut pool);
                retained.controller = retained_controller.clone();
                retained.after_consist_change(physics);
                if retained_controller.is_none() {
                    self.uncoupled.insert(uncouple.retained);
                }
                structural.added.push(retained);
            }
        }
        if new_controller.is_none() {
            self.uncoupled.insert(new_number);
        }
        structural.added.push(piece);
        info!(
            retained = %uncouple.retained,
            new = %new_number,
            user = %uncouple.user,
            "train uncoupled"
        );
        structural
    }

    /// Whether `requester` may take control of `number`.
    pub fn control_allowed(&self, requester: &str, number: TrainNumber) -> bool {
        let Some(train) = self.trains.get(&number) else {
            return false;
        };
        match train.controller.as_deref() {
            None => true,
            Some(current) if current == requester => true,
            Some(current) if !self.is_live(current) => true,
            Some(current) => {
                let on_train = |name: &str| {
                    self.lead_unit_of(name)
                        .is_some_and(|lead| train.contains_car(lead))
                };
                on_train(requester) && !on_train(current)
            }
        }
    }

    pub fn grant_control(&mut self, requester: &str, number: TrainNumber, lead_unit: &str) {
        self.set_lead_unit(requester, lead_unit);
        self.set_controller(number, Some(requester.to_owned()));
    }

    /// Record a cab control event on the train `user` controls.
    pub fn apply_event(&mut self, user: &str, kind: EventKind, state: u8) -> bool {
        match self.train_of(user).and_then(|n| self.trains.get_mut(&n)) {
            Some(train) => {
                train.controls.apply(kind, state);
                true
            }
            None => false,
        }
    }

    /// Drop a departed participant. Each train it controlled passes to
    /// whoever's locomotive is aboard, or disappears.
    pub fn remove_participant(&mut self, name: &str) {
        if self.players.remove(name).is_none() {
            return;
        }
        let controlled: Vec<TrainNumber> = self
            .trains
            .values()
            .filter(|t| t.controller.as_deref() == Some(name))
            .map(|t| t.number)
            .collect();
        for number in controlled {
            let cars = self.trains[&number].descriptors();
            match self.piece_controller(&cars, name, false) {
                Some(heir) => {
                    info!(user = name, train = %number, heir = %heir, "train handed over");
                    self.set_controller(number, Some(heir));
                }
                None => {
                    self.remove_train(number);
                }
            }
        }
        info!(user = name, "participant removed");
    }

    /// Leave multiplayer: keep only the train carrying the local locomotive,
    /// under local control, and forget every peer.
    pub fn abandon(&mut self, reason: String) {
        if !self.status.is_live() {
            return;
        }
        let lead = self.local.lead_unit.clone();
        let keep = self
            .trains
            .values()
            .find(|t| !lead.is_empty() && t.contains_car(&lead))
            .map(|t| t.number)
            .or(self.local.train);

        self.players.clear();
        self.trains.retain(|number, _| Some(*number) == keep);
        self.uncoupled.clear();
        self.missing.clear();
        self.local.train = None;
        if let Some(number) = keep {
            let name = self.local.name.clone();
            self.set_controller(number, Some(name));
        }
        warn!(reason = %reason, "leaving multiplayer");
        self.status = SessionStatus::SinglePlayer { reason };
    }

    /// Every breach of the ownership invariant, described.
    pub fn ownership_violations(&self) -> Vec<String> {
        let mut problems = Vec::new();
        for train in self.trains.values() {
            let number = train.number;
            let expected = self.mode_for(train.controller.as_deref());
            if train.mode != expected {
                problems.push(format!(
                    "train {number} is {:?}, expected {expected:?}",
                    train.mode
                ));
            }
            match train.controller.as_deref() {
                Some(name) if name == self.local.name => {
                    if self.local.train != Some(number) {
                        problems.push(format!("local player does not point at train {number}"));
                    }
                }
                Some(name) => match self.players.get(name) {
                    Some(p) if p.train == Some(number) => {}
                    Some(_) => problems.push(format!("{name} does not point at train {number}")),
                    None => problems.push(format!("train {number} controlled by unknown {name}")),
                },
                None => {
                    if self.local.train == Some(number) || self.players.is_peer_train(number) {
                        problems.push(format!("orphan train {number} is referenced"));
                    }
                }
            }
        }
        if let Some(number) = self.local.train {
            match self.trains.get(&number) {
                Some(t) if t.controller.as_deref() == Some(self.local.name.as_str()) => {}
                _ => problems.push(format!("local player points at train {number} it does not control")),
            }
        }
        for participant in self.players.iter() {
            if let Some(number) = participant.train {
                match self.trains.get(&number) {
                    Some(t) if t.controller.as_deref() == Some(participant.name.as_str()) => {}
                    _ => problems.push(format!(
                        "{} points at train {number} it does not control",
                        participant.name
                    )),
                }
            }
        }
        problems
    }
}
