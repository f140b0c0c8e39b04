// Session coordinator.
//
// `Session` is shared as `Arc<Session>` between the game thread, which calls
// `tick` and the local operations (`throw_switch`, `uncouple`, `couple`,
// `request_control`, `send_chat`, `shutdown`), and one reader thread per
// connection, which calls the `InboundHandler` methods. Both sides work
// through the same few locks:
//
// - `world`: replicas, participants, counters and status (see `world.rs`).
// - `housekeeping`: structural changes queued by reader threads, drained at
//   the start of every tick.
// - `track`: the track collaborator. Lock order is world before track.
// - `timers`, `input`: touched by the tick only.
//
// Handlers compute a list of `Outbound` actions while holding the world lock
// and deliver them after releasing it, so a slow peer socket never blocks
// other handlers on the world.
//
// Roles differ in who is authoritative. The server validates joins, assigns
// train numbers, decides control requests, owns switch state and relays
// moves, events and chat. Clients apply what the server sends and report
// only their own train's motion.
//
// Tick cadence (from `TimingConfig`): `Move` batch every second, switch and
// signal snapshots every ten seconds (server), `Alive` after thirty idle
// seconds (client). Cab control edges are sampled every tick.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use railnet_protocol::{
    Chat, ControlAction, ControlEvent, ControlMessage, Couple, MAX_SWITCH_STATE, Message,
    MoveEntry, Notice, Originator, PlayerJoin, PlayerPiece, Severity, SwitchChange, TrainNumber,
    TrainPose, TrainSnapshot, Uncouple, validate_player_name,
};

use crate::config::{SessionConfig, TimingConfig};
use crate::connection::{ConnectionId, InboundHandler, Outbox, Recipient};
use crate::error::SessionError;
use crate::housekeeping::Housekeeping;
use crate::input::{EdgeSampler, InputState};
use crate::registry::{JoinDetails, LocalPlayer, Participant};
use crate::replica::{TrainMode, TrainReplica, assign_car_ids};
use crate::track::{
    Collaborators, ConsistLoader, TrackModel, TrainPhysics, apply_signal_snapshot,
    apply_switch_snapshot, signal_snapshot, switch_snapshot,
};
use crate::world::{Role, SessionStatus, Structural, World};

/// Something a handler wants done once the world lock is released.
#[derive(Clone, Debug, PartialEq)]
pub enum Outbound {
    Send { to: Recipient, message: Message },
    Admit(ConnectionId),
    Disconnect(ConnectionId),
}

fn send(to: Recipient, message: Message) -> Outbound {
    Outbound::Send { to, message }
}

#[derive(Debug, Default)]
struct TickTimers {
    last_move: Option<Instant>,
    last_resync: Option<Instant>,
    last_sent: Option<Instant>,
}

/// Whether `interval` has passed since `last`. The first call only starts
/// the clock.
fn interval_elapsed(last: &mut Option<Instant>, now: Instant, interval: Duration) -> bool {
    match *last {
        None => {
            *last = Some(now);
            false
        }
        Some(previous) if now.saturating_duration_since(previous) >= interval => {
            *last = Some(now);
            true
        }
        Some(_) => false,
    }
}

pub struct Session {
    role: Role,
    name: String,
    timing: TimingConfig,
    world: Mutex<World>,
    housekeeping: Housekeeping,
    timers: Mutex<TickTimers>,
    input: Mutex<EdgeSampler>,
    track: Mutex<Box<dyn TrackModel>>,
    consists: Box<dyn ConsistLoader>,
    physics: Box<dyn TrainPhysics>,
    outbox: Arc<dyn Outbox>,
}

impl Session {
    /// Build a session and the local player's train, if it drives one.
    /// Clients must drive one.
    pub fn new(
        role: Role,
        config: &SessionConfig,
        collaborators: Collaborators,
        outbox: Arc<dyn Outbox>,
    ) -> Result<Self, SessionError> {
        let player = &config.player;
        validate_player_name(&player.name)?;

        let local = LocalPlayer {
            name: player.name.clone(),
            train: None,
            lead_unit: String::new(),
            details: JoinDetails {
                route: player.route.clone(),
                path: player.path.clone(),
                consist: player.consist.clone().unwrap_or_default(),
                environment: player.environment,
                pantographs: player.pantographs,
            },
        };
        let mut world = World::new(role, local, config.timing.missing_threshold);

        match &player.consist {
            Some(consist) => {
                let cars =
                    assign_car_ids(&player.name, &collaborators.consists.load_consist(consist)?);
                let number = match role {
                    Role::Server => world.assign_number(),
                    Role::Client => world.numbers.provisional(),
                };
                let pose = TrainPose {
                    position: player.position,
                    direction: player.direction,
                    ..TrainPose::default()
                };
                let mut train = TrainReplica::new(number, &cars, pose);
                train.path = player.path.clone();
                train.controller = Some(player.name.clone());
                train.after_consist_change(collaborators.physics.as_ref());
                world.local.lead_unit = cars.first().map(|c| c.id.clone()).unwrap_or_default();
                world.install(train);
                info!(user = %player.name, train = %number, cars = cars.len(), "local train ready");
            }
            None if role == Role::Client => return Err(SessionError::NoConsist),
            None => {}
        }

        Ok(Self {
            role,
            name: player.name.clone(),
            timing: config.timing.clone(),
            world: Mutex::new(world),
            housekeeping: Housekeeping::new(),
            timers: Mutex::new(TickTimers::default()),
            input: Mutex::new(EdgeSampler::new()),
            track: Mutex::new(collaborators.track),
            consists: collaborators.consists,
            physics: collaborators.physics,
            outbox,
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> SessionStatus {
        self.world.lock().status.clone()
    }

    pub fn local_train(&self) -> Option<TrainNumber> {
        self.world.lock().local.train
    }

    pub fn train(&self, number: TrainNumber) -> Option<TrainReplica> {
        self.world.lock().trains.get(&number).cloned()
    }

    pub fn train_numbers(&self) -> Vec<TrainNumber> {
        self.world.lock().trains.keys().copied().collect()
    }

    /// Names of the remote participants.
    pub fn participants(&self) -> Vec<String> {
        self.world.lock().players.names()
    }

    pub fn participant(&self, name: &str) -> Option<Participant> {
        self.world.lock().players.get(name).cloned()
    }

    pub fn missing_count(&self, number: TrainNumber) -> u32 {
        self.world.lock().missing.count(number)
    }

    pub fn ownership_violations(&self) -> Vec<String> {
        self.world.lock().ownership_violations()
    }

    pub fn switch_states(&self) -> Vec<u8> {
        switch_snapshot(&**self.track.lock())
    }

    pub fn signal_states(&self) -> Vec<railnet_protocol::SignalHeadState> {
        signal_snapshot(&**self.track.lock())
    }

    /// Notices received since the last call.
    pub fn take_notices(&self) -> Vec<Notice> {
        std::mem::take(&mut self.world.lock().notices)
    }

    /// Chat received since the last call.
    pub fn take_chat(&self) -> Vec<Chat> {
        std::mem::take(&mut self.world.lock().chat)
    }

    /// Let the game or physics edit a replica in place. Returns false if the
    /// train does not exist.
    pub fn update_train(&self, number: TrainNumber, edit: impl FnOnce(&mut TrainReplica)) -> bool {
        match self.world.lock().trains.get_mut(&number) {
            Some(train) => {
                edit(train);
                true
            }
            None => false,
        }
    }

    /// Send the local player's join to the server.
    pub fn announce(&self) {
        let join = self.world.lock().local_join();
        match join {
            Some(join) => self.deliver(vec![send(Recipient::Server, Message::PlayerJoin(join))]),
            None => warn!("nothing to announce: no local train"),
        }
    }

    /// One game update: apply queued structural changes, then send whatever
    /// is due.
    pub fn tick(&self, now: Instant, input: InputState) {
        self.apply_housekeeping();
        if self.world.lock().status != SessionStatus::Active {
            return;
        }

        let mut out = self.sample_input(input);
        let (moves_due, resync_due) = {
            let mut timers = self.timers.lock();
            (
                interval_elapsed(&mut timers.last_move, now, self.timing.move_interval()),
                self.role == Role::Server
                    && interval_elapsed(&mut timers.last_resync, now, self.timing.resync_interval()),
            )
        };
        if moves_due {
            let entries = self.world.lock().move_batch();
            if !entries.is_empty() {
                out.push(self.to_peers(Message::Move(entries)));
            }
        }
        if resync_due {
            let track = self.track.lock();
            out.push(send(
                Recipient::Everyone,
                Message::SwitchStatus(switch_snapshot(&**track)),
            ));
            out.push(send(
                Recipient::Everyone,
                Message::SignalStatus(signal_snapshot(&**track)),
            ));
        }
        if self.role == Role::Client {
            let mut timers = self.timers.lock();
            if !out.is_empty() {
                timers.last_sent = Some(now);
            } else if interval_elapsed(&mut timers.last_sent, now, self.timing.alive_interval()) {
                out.push(send(
                    Recipient::Server,
                    Message::Alive {
                        user: self.name.clone(),
                    },
                ));
            }
        }
        self.dispatch(out);
    }

    fn apply_housekeeping(&self) {
        let pending = self.housekeeping.drain();
        if pending.is_empty() {
            return;
        }
        let abandoned = {
            let mut world = self.world.lock();
            for (from, to) in pending.renames {
                world.rename_train(from, to);
            }
            for train in pending.trains_added {
                world.install(train);
            }
            for number in pending.trains_removed {
                world.remove_train(number);
            }
            for name in &pending.players_removed {
                world.remove_participant(name);
            }
            match pending.abandon {
                Some(reason) if world.status.is_live() => {
                    world.abandon(reason);
                    true
                }
                _ => false,
            }
        };
        if abandoned {
            self.outbox.disconnect_all();
        }
    }

    fn sample_input(&self, input: InputState) -> Vec<Outbound> {
        let events = self.input.lock().sample(input);
        if events.is_empty() {
            return Vec::new();
        }
        let mut world = self.world.lock();
        if world.local.train.is_none() {
            return Vec::new();
        }
        events
            .into_iter()
            .map(|(kind, state)| {
                world.apply_event(&self.name, kind, state);
                self.to_peers(Message::Event(ControlEvent {
                    user: self.name.clone(),
                    kind,
                    state,
                }))
            })
            .collect()
    }

    /// Broadcast from the server, or send to the server from a client.
    fn to_peers(&self, message: Message) -> Outbound {
        match self.role {
            Role::Server => send(Recipient::Everyone, message),
            Role::Client => send(Recipient::Server, message),
        }
    }

    /// Hand `out` to the outbox. Any client send restarts the Alive
    /// interval.
    fn deliver(&self, out: Vec<Outbound>) {
        if self.role == Role::Client && out.iter().any(|o| matches!(o, Outbound::Send { .. })) {
            self.timers.lock().last_sent = Some(Instant::now());
        }
        self.dispatch(out);
    }

    fn dispatch(&self, out: Vec<Outbound>) {
        for action in out {
            match action {
                Outbound::Send { to, message } => self.outbox.deliver(to, &message),
                Outbound::Admit(peer) => self.outbox.admit(peer),
                Outbound::Disconnect(peer) => self.outbox.disconnect(peer),
            }
        }
    }

    /// Queue structural changes for the next tick.
    fn defer(&self, structural: Structural) {
        for train in structural.added {
            self.housekeeping.add_train(train);
        }
        for number in structural.removed {
            self.housekeeping.remove_train(number);
        }
    }

    fn ensure_active(&self) -> Result<(), SessionError> {
        match self.world.lock().status {
            SessionStatus::Active => Ok(()),
            _ => Err(SessionError::Inactive),
        }
    }

    // --- Inbound ---

    /// Process one decoded message from `from`.
    pub fn handle(&self, from: ConnectionId, message: Message) -> Vec<Outbound> {
        if !self.world.lock().status.is_live() {
            debug!(%from, kind = ?message.kind(), "session not live, message dropped");
            return Vec::new();
        }
        match self.role {
            Role::Server => self.handle_on_server(from, message),
            Role::Client => self.handle_on_client(message),
        }
    }

    /// Process the loss of the connection `from`.
    pub fn handle_disconnect(&self, from: ConnectionId, reason: &str) -> Vec<Outbound> {
        match self.role {
            Role::Server => {
                let name = self
                    .world
                    .lock()
                    .players
                    .by_connection(from)
                    .map(|p| p.name.clone());
                match name {
                    Some(name) => {
                        info!(%from, user = %name, reason, "connection lost");
                        self.depart(from, &name)
                    }
                    None => {
                        debug!(%from, reason, "connection closed");
                        vec![Outbound::Disconnect(from)]
                    }
                }
            }
            Role::Client => {
                if self.world.lock().status.is_live() {
                    warn!(reason, "lost connection to server");
                    self.housekeeping
                        .abandon(format!("connection to server lost: {reason}"));
                }
                Vec::new()
            }
        }
    }

    fn handle_on_server(&self, from: ConnectionId, message: Message) -> Vec<Outbound> {
        let kind = message.kind();
        let sender = self
            .world
            .lock()
            .players
            .by_connection(from)
            .map(|p| p.name.clone());
        let Some(sender) = sender else {
            return match message {
                Message::PlayerJoin(join) => self.accept_join(from, join),
                _ => {
                    warn!(%from, ?kind, "message before join, dropped");
                    Vec::new()
                }
            };
        };

        match message {
            Message::PlayerJoin(join) => {
                warn!(%from, user = %join.user, "second join on one connection ignored");
                Vec::new()
            }
            Message::Move(entries) => {
                self.peer_moves(&sender, &entries);
                Vec::new()
            }
            Message::Switch(change) => self.peer_switch(from, &sender, change),
            Message::Couple(couple) => self.peer_couple(from, &sender, couple),
            Message::Uncouple(uncouple) => self.peer_uncouple(&sender, uncouple),
            Message::Control(control) => self.peer_control(from, &sender, control),
            Message::Event(event) => {
                self.world
                    .lock()
                    .apply_event(&sender, event.kind, event.state);
                vec![send(
                    Recipient::EveryoneExcept(from),
                    Message::Event(ControlEvent {
                        user: sender,
                        ..event
                    }),
                )]
            }
            Message::Alive { .. } => {
                debug!(user = %sender, "alive");
                Vec::new()
            }
            Message::Quit { .. } => self.depart(from, &sender),
            Message::GetTrain { number, .. } => self.answer_get_train(from, number),
            Message::Text(chat) => self.relay_chat(from, &sender, chat),
            Message::Train(_)
            | Message::UpdateTrain(_)
            | Message::RemoveTrain(_)
            | Message::SwitchStatus(_)
            | Message::SignalStatus(_)
            | Message::Notice(_) => {
                warn!(%from, user = %sender, ?kind, "server-bound message of the wrong kind, dropped");
                Vec::new()
            }
        }
    }

    fn accept_join(&self, from: ConnectionId, join: PlayerJoin) -> Vec<Outbound> {
        if let Err(e) = validate_player_name(&join.user) {
            return reject(from, &join.user, format!("Invalid name {:?}: {e}", join.user));
        }
        let mut world = self.world.lock();
        if world.is_live(&join.user) {
            return reject(from, &join.user, format!("Name {} is already in use", join.user));
        }
        let cars = if join.cars.is_empty() {
            match self.consists.load_consist(&join.consist) {
                Ok(cars) => assign_car_ids(&join.user, &cars),
                Err(e) => return reject(from, &join.user, format!("Cannot load consist: {e}")),
            }
        } else {
            join.cars.clone()
        };

        let number = world.assign_number();
        let lead_unit = if join.lead_unit.is_empty() {
            cars.first().map(|c| c.id.clone()).unwrap_or_default()
        } else {
            join.lead_unit.clone()
        };
        let mut train = TrainReplica::new(number, &cars, join.pose);
        train.path = join.path.clone();
        train.controller = Some(join.user.clone());
        train.mode = TrainMode::Remote;
        train.after_consist_change(self.physics.as_ref());

        let mut participant = Participant::new(join.user.clone(), number, lead_unit.clone());
        participant.connection = Some(from);
        participant.details = JoinDetails::from_join(&join);
        world.players.insert(participant);

        let echo = PlayerJoin {
            number,
            cars,
            lead_unit,
            ..join
        };

        // Everything the joiner needs to build the current picture.
        let mut welcome: Vec<Message> = Vec::new();
        if let Some(local) = world.local_join() {
            welcome.push(Message::PlayerJoin(local));
        }
        // Peers that already quit are gone by the next tick; the joiner would
        // never hear their Quit.
        for peer in world
            .players
            .iter()
            .filter(|p| p.name != echo.user && p.connection.is_some())
        {
            let Some(peer_train) = peer.train else {
                continue;
            };
            let replica = world
                .trains
                .get(&peer_train)
                .cloned()
                .or_else(|| self.housekeeping.pending_train(peer_train));
            if let Some(replica) = replica {
                welcome.push(Message::PlayerJoin(peer.details.announce(
                    &peer.name,
                    &peer.lead_unit,
                    &replica,
                )));
            }
        }
        welcome.extend(world.orphan_snapshots().into_iter().map(Message::Train));
        {
            let mut track = self.track.lock();
            track.reserve_route(number, &echo.path);
            welcome.push(Message::SwitchStatus(switch_snapshot(&**track)));
            welcome.push(Message::SignalStatus(signal_snapshot(&**track)));
        }
        self.housekeeping.add_train(train);
        drop(world);

        info!(%from, user = %echo.user, train = %number, "player joined");
        let mut out = vec![
            Outbound::Admit(from),
            send(Recipient::Everyone, Message::PlayerJoin(echo)),
        ];
        out.extend(
            welcome
                .into_iter()
                .map(|message| send(Recipient::Peer(from), message)),
        );
        out
    }

    fn peer_moves(&self, sender: &str, entries: &[MoveEntry]) {
        let mut world = self.world.lock();
        let applied = entries
            .iter()
            .filter(|entry| world.apply_peer_move(sender, entry))
            .count();
        if applied < entries.len() {
            debug!(
                user = sender,
                skipped = entries.len() - applied,
                "move entries for trains the sender does not control"
            );
        }
    }

    fn peer_switch(&self, from: ConnectionId, sender: &str, change: SwitchChange) -> Vec<Outbound> {
        let index = change.index as usize;
        let mut track = self.track.lock();
        if index >= track.switch_count() {
            warn!(user = sender, index, "throw of unknown switch");
            return Vec::new();
        }
        let refusal = if change.state > MAX_SWITCH_STATE {
            Some(format!("Switch {index} cannot take state {}", change.state))
        } else if track.switch_locked(index) {
            Some(format!("Switch {index} is occupied"))
        } else {
            None
        };
        if let Some(text) = refusal {
            return vec![send(
                Recipient::Peer(from),
                Message::Notice(Notice {
                    target: sender.to_owned(),
                    severity: Severity::Warning,
                    text,
                }),
            )];
        }
        track.set_switch_state(index, change.state);
        drop(track);
        vec![send(
            Recipient::Everyone,
            Message::Switch(SwitchChange {
                user: sender.to_owned(),
                ..change
            }),
        )]
    }

    fn peer_couple(&self, from: ConnectionId, sender: &str, couple: Couple) -> Vec<Outbound> {
        if couple.user != sender {
            warn!(user = sender, claimed = %couple.user, "couple on behalf of someone else, dropped");
            return Vec::new();
        }
        let structural = self
            .world
            .lock()
            .apply_couple(&couple, self.physics.as_ref());
        self.defer(structural);
        vec![send(Recipient::EveryoneExcept(from), Message::Couple(couple))]
    }

    fn peer_uncouple(&self, sender: &str, uncouple: Uncouple) -> Vec<Outbound> {
        if uncouple.user != sender || uncouple.confirmed {
            warn!(user = sender, claimed = %uncouple.user, "invalid uncouple request, dropped");
            return Vec::new();
        }
        let (assigned, structural) = {
            let mut world = self.world.lock();
            let assigned = world.assign_number();
            let structural = world.apply_uncouple(&uncouple, assigned, self.physics.as_ref());
            (assigned, structural)
        };
        self.defer(structural);
        vec![send(
            Recipient::Everyone,
            Message::Uncouple(Uncouple {
                assigned,
                confirmed: true,
                ..uncouple
            }),
        )]
    }

    fn peer_control(
        &self,
        from: ConnectionId,
        sender: &str,
        control: ControlMessage,
    ) -> Vec<Outbound> {
        if control.action != ControlAction::Request || control.user != sender {
            warn!(user = sender, action = ?control.action, "invalid control message, dropped");
            return Vec::new();
        }
        let mut world = self.world.lock();
        if world.control_allowed(sender, control.number) {
            world.grant_control(sender, control.number, &control.lead_unit);
            info!(user = sender, train = %control.number, "control granted");
            vec![send(
                Recipient::Everyone,
                Message::Control(ControlMessage {
                    action: ControlAction::Grant,
                    ..control
                }),
            )]
        } else {
            info!(user = sender, train = %control.number, "control denied");
            vec![send(
                Recipient::Peer(from),
                Message::Control(ControlMessage {
                    action: ControlAction::Deny,
                    ..control
                }),
            )]
        }
    }

    /// A participant leaves: tell the others, close its link, and drop it at
    /// the next tick.
    fn depart(&self, from: ConnectionId, name: &str) -> Vec<Outbound> {
        if let Some(participant) = self.world.lock().players.get_mut(name) {
            participant.connection = None;
        }
        self.housekeeping.remove_player(name);
        info!(user = name, "player left");
        vec![
            send(
                Recipient::EveryoneExcept(from),
                Message::Quit {
                    user: name.to_owned(),
                    server_departing: false,
                },
            ),
            Outbound::Disconnect(from),
        ]
    }

    fn answer_get_train(&self, from: ConnectionId, number: TrainNumber) -> Vec<Outbound> {
        let replica = self
            .world
            .lock()
            .trains
            .get(&number)
            .cloned()
            .or_else(|| self.housekeeping.pending_train(number));
        let reply = match replica {
            Some(train) => Message::UpdateTrain(train.snapshot()),
            None => {
                debug!(train = %number, "asked for unknown train");
                Message::RemoveTrain(vec![number])
            }
        };
        vec![send(Recipient::Peer(from), reply)]
    }

    fn relay_chat(&self, from: ConnectionId, sender: &str, chat: Chat) -> Vec<Outbound> {
        let chat = Chat {
            sender: sender.to_owned(),
            ..chat
        };
        let mut world = self.world.lock();
        if chat.recipients.is_empty() {
            world.chat.push(chat.clone());
            return vec![send(Recipient::EveryoneExcept(from), Message::Text(chat))];
        }
        route_chat(&mut world, chat)
    }

    fn handle_on_client(&self, message: Message) -> Vec<Outbound> {
        match message {
            Message::PlayerJoin(join) => {
                self.remote_join(join);
                Vec::new()
            }
            Message::Move(entries) => self.remote_moves(&entries),
            Message::Train(snapshot) | Message::UpdateTrain(snapshot) => {
                self.remote_snapshot(&snapshot);
                Vec::new()
            }
            Message::RemoveTrain(numbers) => {
                let world = self.world.lock();
                for number in numbers {
                    if world.local.train == Some(number) {
                        warn!(train = %number, "server removed our own train, ignored");
                    } else {
                        self.housekeeping.remove_train(number);
                    }
                }
                Vec::new()
            }
            Message::Switch(change) if change.state > MAX_SWITCH_STATE => {
                warn!(index = change.index, state = change.state, "switch state out of range");
                Vec::new()
            }
            Message::Switch(change) => {
                if !self
                    .track
                    .lock()
                    .set_switch_state(change.index as usize, change.state)
                {
                    warn!(index = change.index, "switch change for unknown switch");
                }
                Vec::new()
            }
            Message::SwitchStatus(states) => {
                apply_switch_snapshot(&mut **self.track.lock(), &states);
                Vec::new()
            }
            Message::SignalStatus(states) => {
                apply_signal_snapshot(&mut **self.track.lock(), &states);
                Vec::new()
            }
            Message::Couple(couple) => {
                let structural = self
                    .world
                    .lock()
                    .apply_couple(&couple, self.physics.as_ref());
                self.defer(structural);
                Vec::new()
            }
            Message::Uncouple(uncouple) => {
                self.remote_uncouple(uncouple);
                Vec::new()
            }
            Message::Control(control) => {
                self.remote_control(control);
                Vec::new()
            }
            Message::Event(event) => {
                self.world
                    .lock()
                    .apply_event(&event.user, event.kind, event.state);
                Vec::new()
            }
            Message::Quit {
                user,
                server_departing,
            } => {
                if server_departing {
                    info!(server = %user, "server is shutting down");
                    self.housekeeping.abandon("the server has quit");
                } else {
                    self.housekeeping.remove_player(&user);
                }
                Vec::new()
            }
            Message::Notice(notice) => {
                if notice.severity == Severity::Error {
                    warn!(text = %notice.text, "server refused us");
                    self.housekeeping.abandon(notice.text.clone());
                }
                self.world.lock().notices.push(notice);
                Vec::new()
            }
            Message::Text(chat) => {
                self.world.lock().chat.push(chat);
                Vec::new()
            }
            Message::Alive { .. } | Message::GetTrain { .. } => {
                debug!("client-only message from the server, dropped");
                Vec::new()
            }
        }
    }

    fn remote_join(&self, join: PlayerJoin) {
        let mut world = self.world.lock();
        if join.user == world.local.name {
            if let Some(provisional) = world.local.train.filter(|p| *p != join.number) {
                self.housekeeping.rename_train(provisional, join.number);
            }
            if world.status == SessionStatus::Joining {
                world.status = SessionStatus::Active;
                info!(train = %join.number, "join confirmed");
            }
            return;
        }
        if world.players.contains(&join.user) {
            debug!(user = %join.user, "repeated join announcement ignored");
            return;
        }
        let cars = if join.cars.is_empty() {
            match self.consists.load_consist(&join.consist) {
                Ok(cars) => assign_car_ids(&join.user, &cars),
                Err(e) => {
                    warn!(user = %join.user, "cannot build joining train: {e}");
                    return;
                }
            }
        } else {
            join.cars.clone()
        };
        let lead_unit = if join.lead_unit.is_empty() {
            cars.first().map(|c| c.id.clone()).unwrap_or_default()
        } else {
            join.lead_unit.clone()
        };

        let mut train = TrainReplica::new(join.number, &cars, join.pose);
        train.path = join.path.clone();
        train.controller = Some(join.user.clone());
        train.after_consist_change(self.physics.as_ref());

        let mut participant = Participant::new(join.user.clone(), join.number, lead_unit);
        participant.details = JoinDetails::from_join(&join);
        world.players.insert(participant);
        self.housekeeping.add_train(train);
        info!(user = %join.user, train = %join.number, "player joined");
    }

    fn remote_moves(&self, entries: &[MoveEntry]) -> Vec<Outbound> {
        let mut world = self.world.lock();
        let mut out = Vec::new();
        for entry in entries {
            if entry.originator.player() == Some(self.name.as_str()) {
                continue;
            }
            if world.apply_remote_move(entry) {
                debug!(train = %entry.number, "train missing, requesting it");
                out.push(send(
                    Recipient::Server,
                    Message::GetTrain {
                        user: self.name.clone(),
                        number: entry.number,
                    },
                ));
            }
        }
        out
    }

    fn remote_snapshot(&self, snapshot: &TrainSnapshot) {
        let added = self
            .world
            .lock()
            .apply_snapshot(snapshot, self.physics.as_ref());
        if let Some(train) = added {
            self.housekeeping.add_train(train);
        }
    }

    fn remote_uncouple(&self, uncouple: Uncouple) {
        if !uncouple.confirmed {
            warn!(user = %uncouple.user, "unconfirmed uncouple from the server, dropped");
            return;
        }
        let mut world = self.world.lock();
        if uncouple.user == world.local.name {
            // Already applied locally under the provisional number.
            if uncouple.provisional != uncouple.assigned {
                self.housekeeping
                    .rename_train(uncouple.provisional, uncouple.assigned);
            }
            return;
        }
        let structural = world.apply_uncouple(&uncouple, uncouple.assigned, self.physics.as_ref());
        drop(world);
        self.defer(structural);
    }

    fn remote_control(&self, control: ControlMessage) {
        let mut world = self.world.lock();
        match control.action {
            ControlAction::Grant => {
                world.grant_control(&control.user, control.number, &control.lead_unit);
                info!(user = %control.user, train = %control.number, "control granted");
            }
            ControlAction::Deny if control.user == world.local.name => {
                let target = world.local.name.clone();
                world.notices.push(Notice {
                    target,
                    severity: Severity::Warning,
                    text: format!("Control of train {} was denied", control.number),
                });
            }
            ControlAction::Deny | ControlAction::Request => {
                debug!(action = ?control.action, "control message not for us, dropped");
            }
        }
    }

    // --- Local operations ---

    /// Throw a switch. The server applies it and broadcasts; a client asks
    /// the server, and applies the change when the broadcast comes back.
    pub fn throw_switch(&self, index: usize, state: u8) -> Result<(), SessionError> {
        self.ensure_active()?;
        {
            let mut track = self.track.lock();
            if index >= track.switch_count() {
                return Err(SessionError::UnknownSwitch(index));
            }
            if state > MAX_SWITCH_STATE {
                return Err(SessionError::InvalidSwitchState { index, state });
            }
            if self.role == Role::Server {
                if track.switch_locked(index) {
                    return Err(SessionError::SwitchLocked(index));
                }
                track.set_switch_state(index, state);
            }
        }
        let change = SwitchChange {
            user: self.name.clone(),
            index: index as u32,
            state,
        };
        self.deliver(vec![self.to_peers(Message::Switch(change))]);
        Ok(())
    }

    /// Split `number` after its first `split_at` cars. Returns the number of
    /// the new piece, provisional on clients until the server confirms.
    pub fn uncouple(&self, number: TrainNumber, split_at: usize) -> Result<TrainNumber, SessionError> {
        self.ensure_active()?;
        let mut world = self.world.lock();
        let (cars, pose, mode) = {
            let train = world
                .trains
                .get(&number)
                .ok_or(SessionError::UnknownTrain(number))?;
            (train.descriptors(), train.pose, train.mode)
        };
        if self.role == Role::Client && mode != TrainMode::PlayerControlled {
            return Err(SessionError::NotController(number));
        }
        if split_at == 0 || split_at >= cars.len() {
            return Err(SessionError::InvalidSplit {
                number,
                at: split_at,
                len: cars.len(),
            });
        }
        let (retained_cars, new_cars) = cars.split_at(split_at);
        let lead = world.local.lead_unit.clone();
        let player_piece = if retained_cars.iter().any(|c| c.id == lead) {
            PlayerPiece::Retained
        } else if new_cars.iter().any(|c| c.id == lead) {
            PlayerPiece::New
        } else {
            PlayerPiece::Neither
        };
        let new_number = match self.role {
            Role::Server => world.assign_number(),
            Role::Client => world.numbers.provisional(),
        };
        let uncouple = Uncouple {
            user: self.name.clone(),
            retained: number,
            provisional: new_number,
            assigned: new_number,
            confirmed: self.role == Role::Server,
            player_piece,
            retained_pose: pose,
            retained_cars: retained_cars.to_vec(),
            new_pose: pose,
            new_cars: new_cars.to_vec(),
        };
        let structural = world.apply_uncouple(&uncouple, new_number, self.physics.as_ref());
        world.apply_structural(structural);
        drop(world);

        self.deliver(vec![self.to_peers(Message::Uncouple(uncouple))]);
        Ok(new_number)
    }

    /// Couple `rear` behind `front`. The survivor is whichever holds the
    /// local locomotive, else `front`. Returns the survivor's number.
    pub fn couple(&self, front: TrainNumber, rear: TrainNumber) -> Result<TrainNumber, SessionError> {
        self.ensure_active()?;
        if front == rear {
            return Err(SessionError::SelfCouple(front));
        }
        let mut world = self.world.lock();
        let front_train = world
            .trains
            .get(&front)
            .ok_or(SessionError::UnknownTrain(front))?;
        let rear_train = world
            .trains
            .get(&rear)
            .ok_or(SessionError::UnknownTrain(rear))?;
        if self.role == Role::Client
            && front_train.mode != TrainMode::PlayerControlled
            && rear_train.mode != TrainMode::PlayerControlled
        {
            return Err(SessionError::NotController(front));
        }

        let lead = world.local.lead_unit.clone();
        let (survivor, removed) = if rear_train.contains_car(&lead) && !front_train.contains_car(&lead)
        {
            (rear, front)
        } else {
            (front, rear)
        };
        let pose = if survivor == front {
            front_train.pose
        } else {
            rear_train.pose
        };
        let mut cars = front_train.descriptors();
        cars.extend(rear_train.descriptors());

        let holds_local = !lead.is_empty() && cars.iter().any(|c| c.id == lead);
        let controller = world.piece_controller(&cars, &self.name, holds_local);
        let lead_unit = controller
            .as_deref()
            .and_then(|name| world.lead_unit_of(name))
            .map(str::to_owned)
            .or_else(|| cars.first().map(|c| c.id.clone()))
            .unwrap_or_default();
        let couple = Couple {
            user: self.name.clone(),
            survivor,
            removed,
            controller: Originator::from_controller(controller.as_deref(), survivor),
            lead_unit,
            pose,
            cars,
        };
        let structural = world.apply_couple(&couple, self.physics.as_ref());
        world.apply_structural(structural);
        drop(world);

        self.deliver(vec![self.to_peers(Message::Couple(couple))]);
        Ok(survivor)
    }

    /// Ask for control of `number`. The server decides at once; a client
    /// learns the outcome from a later `Grant` or `Deny`.
    pub fn request_control(&self, number: TrainNumber) -> Result<(), SessionError> {
        self.ensure_active()?;
        let mut world = self.world.lock();
        if !world.trains.contains_key(&number) {
            return Err(SessionError::UnknownTrain(number));
        }
        let lead_unit = world.local.lead_unit.clone();
        let control = ControlMessage {
            user: self.name.clone(),
            action: ControlAction::Request,
            number,
            lead_unit,
        };
        let message = match self.role {
            Role::Server => {
                if !world.control_allowed(&self.name, number) {
                    return Err(SessionError::ControlDenied(number));
                }
                world.grant_control(&self.name, number, &control.lead_unit);
                Message::Control(ControlMessage {
                    action: ControlAction::Grant,
                    ..control
                })
            }
            Role::Client => Message::Control(control),
        };
        drop(world);
        self.deliver(vec![self.to_peers(message)]);
        Ok(())
    }

    /// Send chat to `recipients`, or to everyone if empty.
    pub fn send_chat(&self, recipients: Vec<String>, text: &str) -> Result<(), SessionError> {
        self.ensure_active()?;
        let chat = Chat {
            sender: self.name.clone(),
            recipients,
            text: text.to_owned(),
        };
        let out = match self.role {
            Role::Client => vec![send(Recipient::Server, Message::Text(chat))],
            Role::Server if chat.recipients.is_empty() => {
                vec![send(Recipient::Everyone, Message::Text(chat))]
            }
            Role::Server => route_chat(&mut self.world.lock(), chat),
        };
        self.deliver(out);
        Ok(())
    }

    /// Leave the session: announce the departure, give the peers a moment
    /// to read it, then close every link.
    pub fn shutdown(&self) {
        let was_live = {
            let mut world = self.world.lock();
            let was_live = world.status.is_live();
            world.status = SessionStatus::Ended;
            was_live
        };
        if was_live {
            let quit = Message::Quit {
                user: self.name.clone(),
                server_departing: self.role == Role::Server,
            };
            self.deliver(vec![self.to_peers(quit)]);
            std::thread::sleep(self.timing.shutdown_grace());
        }
        self.outbox.disconnect_all();
        info!(user = %self.name, "session ended");
    }
}

impl InboundHandler for Session {
    fn on_message(&self, from: ConnectionId, message: Message) {
        let out = self.handle(from, message);
        self.deliver(out);
    }

    fn on_disconnect(&self, from: ConnectionId, reason: &str) {
        let out = self.handle_disconnect(from, reason);
        self.deliver(out);
    }
}

/// Turn a join into an error notice followed by closing the connection.
fn reject(from: ConnectionId, user: &str, text: String) -> Vec<Outbound> {
    warn!(%from, user, "join rejected: {text}");
    let target = if validate_player_name(user).is_ok() {
        user.to_owned()
    } else {
        "unnamed".to_owned()
    };
    vec![
        send(
            Recipient::Peer(from),
            Message::Notice(Notice {
                target,
                severity: Severity::Error,
                text,
            }),
        ),
        Outbound::Disconnect(from),
    ]
}

/// Deliver addressed chat on the server: keep what is for us, forward the
/// rest to each recipient's connection.
fn route_chat(world: &mut World, chat: Chat) -> Vec<Outbound> {
    let mut out = Vec::new();
    for recipient in &chat.recipients {
        if *recipient == world.local.name {
            if recipient != &chat.sender {
                world.chat.push(chat.clone());
            }
        } else if let Some(connection) = world.players.get(recipient).and_then(|p| p.connection) {
            out.push(send(Recipient::Peer(connection), Message::Text(chat.clone())));
        } else {
            debug!(recipient = %recipient, "chat for unknown participant dropped");
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use railnet_protocol::{CarDescriptor, Direction, EventKind, WorldPosition};

    use super::*;
    use crate::track::{ConsistLibrary, NullPhysics, StaticTrack};
    use crate::world::PROVISIONAL_BASE;

    #[derive(Default)]
    struct RecordingOutbox {
        sent: Mutex<Vec<(Recipient, Message)>>,
        admitted: Mutex<Vec<ConnectionId>>,
        disconnected: Mutex<Vec<ConnectionId>>,
        closed_all: Mutex<bool>,
    }

    impl RecordingOutbox {
        fn take(&self) -> Vec<(Recipient, Message)> {
            std::mem::take(&mut *self.sent.lock())
        }
    }

    impl Outbox for RecordingOutbox {
        fn deliver(&self, to: Recipient, message: &Message) {
            self.sent.lock().push((to, message.clone()));
        }

        fn admit(&self, peer: ConnectionId) {
            self.admitted.lock().push(peer);
        }

        fn disconnect(&self, peer: ConnectionId) {
            self.disconnected.lock().push(peer);
        }

        fn disconnect_all(&self) {
            *self.closed_all.lock() = true;
        }
    }

    const SERVER_LINK: ConnectionId = ConnectionId(0);

    fn config(name: &str, consist: Option<&str>) -> SessionConfig {
        let mut config = SessionConfig::default();
        config.player.name = name.to_owned();
        config.player.consist = consist.map(str::to_owned);
        config.player.path = "north".to_owned();
        config.timing.shutdown_grace_ms = 0;
        config.track.switches = 4;
        config.track.signals = 2;
        config.consists = BTreeMap::from([(
            "freight.con".to_owned(),
            vec![
                CarDescriptor::new("dash9.eng", "", false),
                CarDescriptor::new("boxcar.wag", "", false),
                CarDescriptor::new("boxcar.wag", "", true),
            ],
        )]);
        config
    }

    fn start(role: Role, name: &str) -> (Session, Arc<RecordingOutbox>) {
        let config = config(name, Some("freight.con"));
        let outbox = Arc::new(RecordingOutbox::default());
        let session = Session::new(
            role,
            &config,
            Collaborators::from_config(&config),
            outbox.clone(),
        )
        .unwrap();
        (session, outbox)
    }

    fn join(user: &str) -> PlayerJoin {
        PlayerJoin {
            user: user.to_owned(),
            route: "valley".to_owned(),
            path: "north".to_owned(),
            consist: "freight.con".to_owned(),
            lead_unit: String::new(),
            number: TrainNumber(0),
            pose: TrainPose::default(),
            environment: Default::default(),
            pantographs: [false; 4],
            cars: Vec::new(),
        }
    }

    fn move_for(number: u32, controller: &str, car_count: u32) -> MoveEntry {
        MoveEntry {
            originator: Originator::from_controller(Some(controller), TrainNumber(number)),
            number: TrainNumber(number),
            car_count,
            travelled: 12.0,
            speed: 4.0,
            track_node: 3,
            direction: Direction::Forward,
            position: WorldPosition::new(1, 2, 3.0, 4.0),
        }
    }

    /// A client whose join the server has confirmed with train 7.
    fn confirmed_client(name: &str) -> (Session, Arc<RecordingOutbox>) {
        let (client, outbox) = start(Role::Client, name);
        let confirmation = PlayerJoin {
            number: TrainNumber(7),
            ..join(name)
        };
        client.handle(SERVER_LINK, Message::PlayerJoin(confirmation));
        client.tick(Instant::now(), InputState::default());
        (client, outbox)
    }

    fn sent_to(out: &[Outbound], recipient: Recipient) -> Vec<&Message> {
        out.iter()
            .filter_map(|o| match o {
                Outbound::Send { to, message } if *to == recipient => Some(message),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn local_train_is_built_from_the_consist() {
        let (server, _) = start(Role::Server, "Host");
        assert_eq!(server.status(), SessionStatus::Active);
        let train = server.train(TrainNumber(1)).unwrap();
        assert_eq!(train.car_ids(), vec!["Host - 0", "Host - 1", "Host - 2"]);
        assert_eq!(train.mode, TrainMode::PlayerControlled);
        assert_eq!(server.local_train(), Some(TrainNumber(1)));

        let (client, _) = start(Role::Client, "Alice");
        assert_eq!(client.status(), SessionStatus::Joining);
        assert_eq!(client.local_train(), Some(TrainNumber(PROVISIONAL_BASE)));
    }

    #[test]
    fn client_needs_a_consist() {
        let config = config("Alice", None);
        let result = Session::new(
            Role::Client,
            &config,
            Collaborators::from_config(&config),
            Arc::new(RecordingOutbox::default()),
        );
        assert!(matches!(result, Err(SessionError::NoConsist)));

        let result = Session::new(
            Role::Server,
            &config,
            Collaborators::from_config(&config),
            Arc::new(RecordingOutbox::default()),
        );
        assert!(result.is_ok());
    }

    #[test]
    fn join_is_echoed_and_welcomed() {
        let (server, _) = start(Role::Server, "Host");
        let out = server.handle(ConnectionId(1), Message::PlayerJoin(join("Alice")));

        assert_eq!(out[0], Outbound::Admit(ConnectionId(1)));
        let Some(Message::PlayerJoin(echo)) = sent_to(&out, Recipient::Everyone).first().copied()
        else {
            panic!("no join echo in {out:?}");
        };
        assert_eq!(echo.number, TrainNumber(2));
        assert_eq!(echo.lead_unit, "Alice - 0");
        assert_eq!(echo.cars.len(), 3);

        let welcome = sent_to(&out, Recipient::Peer(ConnectionId(1)));
        assert!(matches!(welcome[0], Message::PlayerJoin(j) if j.user == "Host"));
        assert!(matches!(welcome[1], Message::SwitchStatus(s) if s.len() == 4));
        assert!(matches!(welcome[2], Message::SignalStatus(s) if s.len() == 2));
        assert_eq!(welcome.len(), 3);

        // Visible after the next tick.
        assert!(server.train(TrainNumber(2)).is_none());
        server.tick(Instant::now(), InputState::default());
        let train = server.train(TrainNumber(2)).unwrap();
        assert_eq!(train.controller.as_deref(), Some("Alice"));
        assert_eq!(train.mode, TrainMode::Remote);
        assert!(server.ownership_violations().is_empty());
    }

    #[test]
    fn second_joiner_learns_about_pending_first() {
        let (server, _) = start(Role::Server, "Host");
        server.handle(ConnectionId(1), Message::PlayerJoin(join("Alice")));
        let out = server.handle(ConnectionId(2), Message::PlayerJoin(join("Bobby")));

        let users: Vec<&str> = sent_to(&out, Recipient::Peer(ConnectionId(2)))
            .into_iter()
            .filter_map(|m| match m {
                Message::PlayerJoin(j) => Some(j.user.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(users, vec!["Host", "Alice"]);
    }

    #[test]
    fn joiner_is_not_told_about_a_player_who_just_quit() {
        let (server, _) = start(Role::Server, "Host");
        server.handle(ConnectionId(1), Message::PlayerJoin(join("Alice")));
        server.tick(Instant::now(), InputState::default());
        server.handle(
            ConnectionId(1),
            Message::Quit {
                user: "Alice".to_owned(),
                server_departing: false,
            },
        );

        // Bobby arrives before the tick that drops Alice.
        let out = server.handle(ConnectionId(2), Message::PlayerJoin(join("Bobby")));
        let welcome = sent_to(&out, Recipient::Peer(ConnectionId(2)));
        let users: Vec<&str> = welcome
            .iter()
            .filter_map(|m| match m {
                Message::PlayerJoin(j) => Some(j.user.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(users, vec!["Host"]);
        assert!(!welcome.iter().any(|m| matches!(m, Message::Train(_))));

        server.tick(Instant::now(), InputState::default());
        assert_eq!(server.participants(), vec!["Bobby"]);
        assert!(server.train(TrainNumber(2)).is_none());
    }

    #[test]
    fn bad_joins_are_refused() {
        let (server, _) = start(Role::Server, "Host");

        let out = server.handle(ConnectionId(2), Message::PlayerJoin(join("Host")));
        assert!(matches!(
            sent_to(&out, Recipient::Peer(ConnectionId(2)))[0],
            Message::Notice(Notice { target, severity: Severity::Error, .. }) if target == "Host"
        ));
        assert_eq!(out.last(), Some(&Outbound::Disconnect(ConnectionId(2))));

        let out = server.handle(ConnectionId(3), Message::PlayerJoin(join("Al")));
        assert!(matches!(
            sent_to(&out, Recipient::Peer(ConnectionId(3)))[0],
            Message::Notice(Notice { target, .. }) if target == "unnamed"
        ));

        let unknown = PlayerJoin {
            consist: "nowhere.con".to_owned(),
            ..join("Carol")
        };
        let out = server.handle(ConnectionId(4), Message::PlayerJoin(unknown));
        assert_eq!(out.last(), Some(&Outbound::Disconnect(ConnectionId(4))));
        assert!(server.participants().is_empty());
    }

    #[test]
    fn messages_before_join_are_dropped() {
        let (server, _) = start(Role::Server, "Host");
        let out = server.handle(
            ConnectionId(5),
            Message::Move(vec![move_for(1, "Host", 3)]),
        );
        assert!(out.is_empty());
    }

    #[test]
    fn missing_train_is_requested_once_per_threshold() {
        let (client, _) = start(Role::Client, "Alice");
        let mut requests = Vec::new();
        for _ in 0..10 {
            let out = client.handle(
                SERVER_LINK,
                Message::Move(vec![move_for(42, "Bobby", 3)]),
            );
            requests.push(sent_to(&out, Recipient::Server).len());
        }
        assert_eq!(requests, vec![0, 0, 0, 0, 0, 0, 0, 0, 0, 1]);
        assert_eq!(client.missing_count(TrainNumber(42)), 0);
    }

    #[test]
    fn update_train_clears_the_count_and_keeps_live_cars() {
        let (client, _) = confirmed_client("Alice");
        let number = TrainNumber(42);
        for _ in 0..5 {
            client.handle(SERVER_LINK, Message::Move(vec![move_for(42, "Bobby", 2)]));
        }
        assert_eq!(client.missing_count(number), 5);

        let snapshot = |cars: Vec<CarDescriptor>| {
            Message::UpdateTrain(TrainSnapshot {
                originator: Originator::Player("Bobby".to_owned()),
                number,
                pose: TrainPose::default(),
                cars,
            })
        };
        let first = CarDescriptor::new("dash9.eng", "Bobby - 0", false);
        let second = CarDescriptor::new("boxcar.wag", "Bobby - 1", false);
        client.handle(SERVER_LINK, snapshot(vec![first.clone(), second.clone()]));
        assert_eq!(client.missing_count(number), 0);

        // A new replica appears with the next tick.
        assert!(client.train(number).is_none());
        client.tick(Instant::now(), InputState::default());
        let train = client.train(number).unwrap();
        assert_eq!(train.car_ids(), vec!["Bobby - 0", "Bobby - 1"]);
        assert_eq!(train.mode, TrainMode::Remote);

        // The server's copy has a third car; ours falls behind again.
        client.update_train(number, |t| t.cars[0].live.wheel_rpm = 120.0);
        for _ in 0..3 {
            client.handle(SERVER_LINK, Message::Move(vec![move_for(42, "Bobby", 3)]));
        }
        assert_eq!(client.missing_count(number), 3);

        let third = CarDescriptor::new("boxcar.wag", "Bobby - 2", true);
        client.handle(SERVER_LINK, snapshot(vec![second, first, third]));
        assert_eq!(client.missing_count(number), 0);
        let train = client.train(number).unwrap();
        assert_eq!(train.car_ids(), vec!["Bobby - 1", "Bobby - 0", "Bobby - 2"]);
        assert_eq!(train.cars[1].live.wheel_rpm, 120.0);
        assert_eq!(train.cars[2].live.wheel_rpm, 0.0);
    }

    #[test]
    fn own_moves_are_not_applied_back() {
        let (client, _) = confirmed_client("Alice");
        let out = client.handle(SERVER_LINK, Message::Move(vec![move_for(7, "Alice", 3)]));
        assert!(out.is_empty());
        assert_eq!(client.train(TrainNumber(7)).unwrap().pose.speed, 0.0);
    }

    #[test]
    fn get_train_answers_with_snapshot_or_removal() {
        let (server, _) = start(Role::Server, "Host");
        server.handle(ConnectionId(1), Message::PlayerJoin(join("Alice")));

        let get = |number| Message::GetTrain {
            user: "Alice".to_owned(),
            number: TrainNumber(number),
        };
        let out = server.handle(ConnectionId(1), get(42));
        assert_eq!(
            sent_to(&out, Recipient::Peer(ConnectionId(1))),
            vec![&Message::RemoveTrain(vec![TrainNumber(42)])]
        );

        let out = server.handle(ConnectionId(1), get(1));
        assert!(matches!(
            sent_to(&out, Recipient::Peer(ConnectionId(1)))[0],
            Message::UpdateTrain(s) if s.number == TrainNumber(1) && s.cars.len() == 3
        ));

        // Still pending, but known.
        let out = server.handle(ConnectionId(1), get(2));
        assert!(matches!(
            sent_to(&out, Recipient::Peer(ConnectionId(1)))[0],
            Message::UpdateTrain(s) if s.number == TrainNumber(2)
        ));
    }

    #[test]
    fn control_of_a_driven_train_is_denied_but_orphans_are_granted() {
        let (server, _) = start(Role::Server, "Host");
        server.handle(ConnectionId(1), Message::PlayerJoin(join("Alice")));
        server.tick(Instant::now(), InputState::default());

        let request = |number| {
            Message::Control(ControlMessage {
                user: "Alice".to_owned(),
                action: ControlAction::Request,
                number: TrainNumber(number),
                lead_unit: "Alice - 0".to_owned(),
            })
        };
        let out = server.handle(ConnectionId(1), request(1));
        assert!(matches!(
            sent_to(&out, Recipient::Peer(ConnectionId(1)))[0],
            Message::Control(c) if c.action == ControlAction::Deny
        ));

        // Cut the wagons off the host's train; nobody drives them.
        let wagons = server.uncouple(TrainNumber(1), 1).unwrap();
        assert_eq!(server.train(wagons).unwrap().mode, TrainMode::Ai);

        let out = server.handle(ConnectionId(1), request(wagons.0));
        assert!(matches!(
            sent_to(&out, Recipient::Everyone)[0],
            Message::Control(c) if c.action == ControlAction::Grant
        ));
        assert_eq!(
            server.train(wagons).unwrap().controller.as_deref(),
            Some("Alice")
        );
        // Alice's first train is left behind.
        assert_eq!(server.train(TrainNumber(2)).unwrap().controller, None);
        assert!(server.ownership_violations().is_empty());
    }

    #[test]
    fn quit_removes_the_player_at_the_next_tick() {
        let (server, _) = start(Role::Server, "Host");
        server.handle(ConnectionId(1), Message::PlayerJoin(join("Alice")));
        server.tick(Instant::now(), InputState::default());

        let out = server.handle(
            ConnectionId(1),
            Message::Quit {
                user: "Alice".to_owned(),
                server_departing: false,
            },
        );
        assert_eq!(
            out,
            vec![
                send(
                    Recipient::EveryoneExcept(ConnectionId(1)),
                    Message::Quit {
                        user: "Alice".to_owned(),
                        server_departing: false
                    }
                ),
                Outbound::Disconnect(ConnectionId(1)),
            ]
        );
        server.tick(Instant::now(), InputState::default());
        assert!(server.participants().is_empty());
        assert!(server.train(TrainNumber(2)).is_none());

        // The socket closing afterwards is just cleanup.
        let out = server.handle_disconnect(ConnectionId(1), "end of stream");
        assert_eq!(out, vec![Outbound::Disconnect(ConnectionId(1))]);
    }

    #[test]
    fn lost_connection_counts_as_quit() {
        let (server, _) = start(Role::Server, "Host");
        server.handle(ConnectionId(1), Message::PlayerJoin(join("Alice")));
        let out = server.handle_disconnect(ConnectionId(1), "connection reset");
        assert!(matches!(
            sent_to(&out, Recipient::EveryoneExcept(ConnectionId(1)))[0],
            Message::Quit { user, .. } if user == "Alice"
        ));
    }

    #[test]
    fn join_confirmation_renumbers_the_local_train() {
        let (client, _) = confirmed_client("Alice");
        assert_eq!(client.status(), SessionStatus::Active);
        assert_eq!(client.local_train(), Some(TrainNumber(7)));
        assert_eq!(client.train_numbers(), vec![TrainNumber(7)]);
    }

    #[test]
    fn server_departure_leaves_client_single_player() {
        let (client, outbox) = confirmed_client("Alice");
        let bobby = PlayerJoin {
            number: TrainNumber(8),
            ..join("Bobby")
        };
        client.handle(SERVER_LINK, Message::PlayerJoin(bobby));
        client.tick(Instant::now(), InputState::default());
        assert_eq!(client.train_numbers(), vec![TrainNumber(7), TrainNumber(8)]);
        assert_eq!(
            client.train(TrainNumber(8)).unwrap().car_ids()[0],
            "Bobby - 0"
        );

        client.handle(
            SERVER_LINK,
            Message::Quit {
                user: "Host".to_owned(),
                server_departing: true,
            },
        );
        client.tick(Instant::now(), InputState::default());

        assert!(matches!(client.status(), SessionStatus::SinglePlayer { .. }));
        assert_eq!(client.train_numbers(), vec![TrainNumber(7)]);
        assert_eq!(
            client.train(TrainNumber(7)).unwrap().mode,
            TrainMode::PlayerControlled
        );
        assert!(*outbox.closed_all.lock());
        assert!(matches!(
            client.throw_switch(0, 1),
            Err(SessionError::Inactive)
        ));
    }

    #[test]
    fn error_notice_abandons_the_join() {
        let (client, _) = start(Role::Client, "Alice");
        client.handle(
            SERVER_LINK,
            Message::Notice(Notice {
                target: "Alice".to_owned(),
                severity: Severity::Error,
                text: "Name Alice is already in use".to_owned(),
            }),
        );
        client.tick(Instant::now(), InputState::default());
        assert_eq!(
            client.status(),
            SessionStatus::SinglePlayer {
                reason: "Name Alice is already in use".to_owned()
            }
        );
        assert_eq!(client.take_notices().len(), 1);
    }

    #[test]
    fn server_tick_cadence() {
        let (server, outbox) = start(Role::Server, "Host");
        server.update_train(TrainNumber(1), |t| t.pose.speed = 3.0);
        let t0 = Instant::now();

        server.tick(t0, InputState::default());
        assert!(outbox.take().is_empty());

        server.tick(t0 + Duration::from_millis(500), InputState::default());
        assert!(outbox.take().is_empty());

        server.tick(t0 + Duration::from_secs(1), InputState::default());
        let sent = outbox.take();
        assert_eq!(sent.len(), 1);
        assert!(matches!(&sent[0], (Recipient::Everyone, Message::Move(e)) if e.len() == 1));

        server.tick(t0 + Duration::from_secs(10), InputState::default());
        let kinds: Vec<_> = outbox.take().into_iter().map(|(_, m)| m.kind()).collect();
        assert_eq!(kinds.len(), 3);
        assert_eq!(kinds[0], Message::Move(Vec::new()).kind());
    }

    #[test]
    fn stopping_is_reported_once() {
        let (server, outbox) = start(Role::Server, "Host");
        let t0 = Instant::now();
        server.update_train(TrainNumber(1), |t| t.pose.speed = 3.0);
        server.tick(t0, InputState::default());
        server.tick(t0 + Duration::from_secs(1), InputState::default());
        server.update_train(TrainNumber(1), |t| t.pose.speed = 0.0);
        server.tick(t0 + Duration::from_secs(2), InputState::default());
        server.tick(t0 + Duration::from_secs(3), InputState::default());

        let moves: Vec<_> = outbox
            .take()
            .into_iter()
            .filter_map(|(_, m)| match m {
                Message::Move(entries) => Some(entries[0].speed),
                _ => None,
            })
            .collect();
        assert_eq!(moves, vec![3.0, 0.0]);
    }

    #[test]
    fn idle_client_sends_alive() {
        let (client, outbox) = confirmed_client("Alice");
        outbox.take();
        let t0 = Instant::now();
        client.tick(t0, InputState::default());
        client.tick(t0 + Duration::from_secs(29), InputState::default());
        assert!(outbox.take().is_empty());

        client.tick(t0 + Duration::from_secs(30), InputState::default());
        let sent = outbox.take();
        assert!(matches!(
            sent.as_slice(),
            [(Recipient::Server, Message::Alive { user })] if user == "Alice"
        ));
        client.tick(t0 + Duration::from_secs(31), InputState::default());
        assert!(outbox.take().is_empty());
    }

    #[test]
    fn any_client_send_postpones_alive() {
        let (client, outbox) = confirmed_client("Alice");
        let t0 = Instant::now();
        client.tick(t0, InputState::default());
        client.throw_switch(1, 1).unwrap();
        outbox.take();

        client.tick(t0 + Duration::from_secs(30), InputState::default());
        assert!(outbox.take().is_empty());
        client.tick(t0 + Duration::from_secs(31), InputState::default());
        assert!(matches!(
            outbox.take().as_slice(),
            [(Recipient::Server, Message::Alive { .. })]
        ));
    }

    #[test]
    fn cab_input_becomes_events() {
        let (server, outbox) = start(Role::Server, "Host");
        let horn = InputState {
            horn: true,
            ..InputState::default()
        };
        server.tick(Instant::now(), horn);
        assert_eq!(
            outbox.take(),
            vec![(
                Recipient::Everyone,
                Message::Event(ControlEvent {
                    user: "Host".to_owned(),
                    kind: EventKind::Horn,
                    state: 1,
                })
            )]
        );
        assert!(server.train(TrainNumber(1)).unwrap().controls.horn);
    }

    #[test]
    fn peer_events_are_relayed_under_the_sender_name() {
        let (server, _) = start(Role::Server, "Host");
        server.handle(ConnectionId(1), Message::PlayerJoin(join("Alice")));
        server.tick(Instant::now(), InputState::default());

        let out = server.handle(
            ConnectionId(1),
            Message::Event(ControlEvent {
                user: "Mallory".to_owned(),
                kind: EventKind::Bell,
                state: 1,
            }),
        );
        assert!(matches!(
            sent_to(&out, Recipient::EveryoneExcept(ConnectionId(1)))[0],
            Message::Event(e) if e.user == "Alice"
        ));
        assert!(server.train(TrainNumber(2)).unwrap().controls.bell);
    }

    #[test]
    fn client_uncouple_is_renumbered_on_confirmation() {
        let (client, outbox) = confirmed_client("Alice");
        outbox.take();

        let provisional = client.uncouple(TrainNumber(7), 1).unwrap();
        assert!(provisional.0 > PROVISIONAL_BASE);
        assert_eq!(client.train(provisional).unwrap().car_ids().len(), 2);

        let sent = outbox.take();
        let Some((Recipient::Server, Message::Uncouple(request))) = sent.first() else {
            panic!("no uncouple request in {sent:?}");
        };
        assert!(!request.confirmed);
        assert_eq!(request.player_piece, PlayerPiece::Retained);

        let confirmation = Uncouple {
            assigned: TrainNumber(9),
            confirmed: true,
            ..request.clone()
        };
        client.handle(SERVER_LINK, Message::Uncouple(confirmation));
        client.tick(Instant::now(), InputState::default());

        assert!(client.train(provisional).is_none());
        assert_eq!(client.train(TrainNumber(9)).unwrap().controller, None);
        assert_eq!(
            client.train(TrainNumber(7)).unwrap().controller.as_deref(),
            Some("Alice")
        );
    }

    #[test]
    fn uncouple_checks_the_split_point() {
        let (client, _) = confirmed_client("Alice");
        assert!(matches!(
            client.uncouple(TrainNumber(7), 0),
            Err(SessionError::InvalidSplit { .. })
        ));
        assert!(matches!(
            client.uncouple(TrainNumber(7), 3),
            Err(SessionError::InvalidSplit { len: 3, .. })
        ));
        assert!(matches!(
            client.uncouple(TrainNumber(70), 1),
            Err(SessionError::UnknownTrain(_))
        ));
    }

    #[test]
    fn server_uncouple_request_gets_a_real_number() {
        let (server, _) = start(Role::Server, "Host");
        server.handle(ConnectionId(1), Message::PlayerJoin(join("Alice")));
        server.tick(Instant::now(), InputState::default());

        let train = server.train(TrainNumber(2)).unwrap();
        let cars = train.descriptors();
        let request = Uncouple {
            user: "Alice".to_owned(),
            retained: TrainNumber(2),
            provisional: TrainNumber(PROVISIONAL_BASE),
            assigned: TrainNumber(PROVISIONAL_BASE),
            confirmed: false,
            player_piece: PlayerPiece::Retained,
            retained_pose: train.pose,
            retained_cars: cars[..2].to_vec(),
            new_pose: train.pose,
            new_cars: cars[2..].to_vec(),
        };
        let out = server.handle(ConnectionId(1), Message::Uncouple(request));
        let Some(Message::Uncouple(confirmed)) = sent_to(&out, Recipient::Everyone).first().copied()
        else {
            panic!("no confirmation in {out:?}");
        };
        assert!(confirmed.confirmed);
        assert_eq!(confirmed.assigned, TrainNumber(3));
        assert_eq!(confirmed.provisional, TrainNumber(PROVISIONAL_BASE));

        server.tick(Instant::now(), InputState::default());
        assert_eq!(server.train(TrainNumber(2)).unwrap().cars.len(), 2);
        assert_eq!(server.train(TrainNumber(3)).unwrap().mode, TrainMode::Ai);
    }

    #[test]
    fn couple_keeps_the_train_with_our_locomotive() {
        let (server, outbox) = start(Role::Server, "Host");
        let wagons = server.uncouple(TrainNumber(1), 1).unwrap();
        outbox.take();

        let survivor = server.couple(wagons, TrainNumber(1)).unwrap();
        assert_eq!(survivor, TrainNumber(1));
        assert!(server.train(wagons).is_none());
        assert_eq!(server.train(TrainNumber(1)).unwrap().cars.len(), 3);
        assert!(matches!(
            outbox.take().as_slice(),
            [(Recipient::Everyone, Message::Couple(c))] if c.removed == wagons
        ));
        assert!(matches!(
            server.couple(TrainNumber(1), TrainNumber(1)),
            Err(SessionError::SelfCouple(_))
        ));
    }

    #[test]
    fn chat_is_routed_by_recipient() {
        let (server, _) = start(Role::Server, "Host");
        server.handle(ConnectionId(1), Message::PlayerJoin(join("Alice")));
        server.handle(ConnectionId(2), Message::PlayerJoin(join("Bobby")));

        let chat = |recipients: &[&str]| {
            Message::Text(Chat {
                sender: "forged".to_owned(),
                recipients: recipients.iter().map(|r| r.to_string()).collect(),
                text: "green signal".to_owned(),
            })
        };

        let out = server.handle(ConnectionId(1), chat(&["Bobby", "Host"]));
        assert!(matches!(
            sent_to(&out, Recipient::Peer(ConnectionId(2)))[0],
            Message::Text(c) if c.sender == "Alice"
        ));
        assert_eq!(out.len(), 1);
        assert_eq!(server.take_chat().len(), 1);

        let out = server.handle(ConnectionId(1), chat(&[]));
        assert_eq!(sent_to(&out, Recipient::EveryoneExcept(ConnectionId(1))).len(), 1);
        assert_eq!(server.take_chat()[0].sender, "Alice");
    }

    #[test]
    fn locked_switch_is_refused() {
        let config = config("Host", Some("freight.con"));
        let mut track = StaticTrack::new(4, 0);
        track.lock_switch(2);
        let collaborators = Collaborators {
            track: Box::new(track),
            consists: Box::new(ConsistLibrary::new(config.consists.clone())),
            physics: Box::new(NullPhysics),
        };
        let server = Session::new(
            Role::Server,
            &config,
            collaborators,
            Arc::new(RecordingOutbox::default()),
        )
        .unwrap();
        server.handle(ConnectionId(1), Message::PlayerJoin(join("Alice")));

        let throw = |index| {
            Message::Switch(SwitchChange {
                user: "Alice".to_owned(),
                index,
                state: 1,
            })
        };
        let out = server.handle(ConnectionId(1), throw(2));
        assert!(matches!(
            sent_to(&out, Recipient::Peer(ConnectionId(1)))[0],
            Message::Notice(n) if n.severity == Severity::Warning
        ));
        let out = server.handle(ConnectionId(1), throw(1));
        assert_eq!(sent_to(&out, Recipient::Everyone).len(), 1);
        assert_eq!(server.switch_states(), vec![0, 1, 0, 0]);

        assert!(matches!(
            server.throw_switch(2, 1),
            Err(SessionError::SwitchLocked(2))
        ));
        assert!(matches!(
            server.throw_switch(9, 1),
            Err(SessionError::UnknownSwitch(9))
        ));
    }

    #[test]
    fn switch_states_are_single_digits() {
        let (server, outbox) = start(Role::Server, "Host");
        server.handle(ConnectionId(1), Message::PlayerJoin(join("Alice")));
        outbox.take();

        assert!(matches!(
            server.throw_switch(0, 12),
            Err(SessionError::InvalidSwitchState { index: 0, state: 12 })
        ));
        assert!(outbox.take().is_empty());
        server.throw_switch(0, 9).unwrap();

        let out = server.handle(
            ConnectionId(1),
            Message::Switch(SwitchChange {
                user: "Alice".to_owned(),
                index: 1,
                state: 10,
            }),
        );
        assert!(matches!(
            sent_to(&out, Recipient::Peer(ConnectionId(1))).as_slice(),
            [Message::Notice(n)] if n.severity == Severity::Warning
        ));
        assert!(sent_to(&out, Recipient::Everyone).is_empty());
        assert_eq!(server.switch_states(), vec![9, 0, 0, 0]);

        let (client, _) = confirmed_client("Bobby");
        client.handle(
            SERVER_LINK,
            Message::Switch(SwitchChange {
                user: "Host".to_owned(),
                index: 2,
                state: 15,
            }),
        );
        assert_eq!(client.switch_states(), vec![0, 0, 0, 0]);
    }

    #[test]
    fn client_applies_resync_snapshots() {
        let (client, _) = confirmed_client("Alice");
        client.handle(SERVER_LINK, Message::SwitchStatus(vec![1, 0, 1, 1, 1, 1]));
        assert_eq!(client.switch_states(), vec![1, 0, 1, 1]);
    }

    #[test]
    fn shutdown_announces_departure() {
        let (server, outbox) = start(Role::Server, "Host");
        server.shutdown();
        assert_eq!(
            outbox.take(),
            vec![(
                Recipient::Everyone,
                Message::Quit {
                    user: "Host".to_owned(),
                    server_departing: true,
                }
            )]
        );
        assert!(*outbox.closed_all.lock());
        assert_eq!(server.status(), SessionStatus::Ended);
    }
}
