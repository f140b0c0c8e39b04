// Locally held copies of shared trains.
//
// A `TrainReplica` is this participant's view of one train: its cars, pose,
// cab control states and ownership. Ownership is two fields kept in step by
// `world::World::set_controller`: `controller` names the participant that
// originates authoritative updates, and `mode` is what that means locally
// (`PlayerControlled` if the controller is us, `Remote` if it is someone
// else, `Ai` if nobody controls it and this process is the server).
//
// Cars carry live per-car state next to their wire descriptor. When a car
// list is rebuilt from the wire (resync, couple, uncouple), `CarPool` hands
// back the existing `Car` for every id it already knows, so that state
// survives the rebuild.
//
// See also: `track.rs` for the `TrainPhysics` hooks invoked after a
// rebuild, `world.rs` for ownership bookkeeping.

use rustc_hash::FxHashMap;

use railnet_protocol::{
    CarDescriptor, Direction, MoveEntry, Originator, TrainNumber, TrainPose, TrainSnapshot,
    WorldPosition,
};

use crate::track::TrainPhysics;

/// How this participant treats a train.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrainMode {
    /// Driven here; never overwritten by remote updates.
    PlayerControlled,
    /// Mirrored from another participant or from the server.
    Remote,
    /// Simulated here by the server with no controlling participant.
    Ai,
}

/// Live per-car state owned by the physics collaborator.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CarLiveState {
    pub brake_cylinder_pressure: f32,
    pub wheel_rpm: f32,
}

/// One car of a replica.
#[derive(Clone, Debug, PartialEq)]
pub struct Car {
    pub descriptor: CarDescriptor,
    pub live: CarLiveState,
}

impl Car {
    pub fn new(descriptor: CarDescriptor) -> Self {
        Self {
            descriptor,
            live: CarLiveState::default(),
        }
    }

    pub fn id(&self) -> &str {
        &self.descriptor.id
    }
}

/// Latest discrete cab control states, as mirrored by `Event` messages.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ControlState {
    pub horn: bool,
    pub bell: bool,
    pub wiper: u8,
    pub pantograph: u8,
    pub headlight: u8,
}

impl ControlState {
    /// Record an event state. Counter states are reduced modulo the kind's
    /// state count, so out-of-range values still land on a valid state.
    pub fn apply(&mut self, kind: railnet_protocol::EventKind, state: u8) {
        use railnet_protocol::EventKind;
        let state = state % kind.state_count();
        match kind {
            EventKind::Horn => self.horn = state == 1,
            EventKind::Bell => self.bell = state == 1,
            EventKind::Wiper => self.wiper = state,
            EventKind::Pantograph => self.pantograph = state,
            EventKind::Headlight => self.headlight = state,
        }
    }
}

/// A remote position update waiting for the physics collaborator.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RemoteUpdate {
    pub track_node: u32,
    pub position: WorldPosition,
    pub travelled: f32,
    pub speed: f32,
    pub direction: Direction,
}

impl From<&MoveEntry> for RemoteUpdate {
    fn from(entry: &MoveEntry) -> Self {
        Self {
            track_node: entry.track_node,
            position: entry.position,
            travelled: entry.travelled,
            speed: entry.speed,
            direction: entry.direction,
        }
    }
}

/// This participant's copy of one shared train.
#[derive(Clone, Debug)]
pub struct TrainReplica {
    pub number: TrainNumber,
    pub cars: Vec<Car>,
    pub pose: TrainPose,
    pub track_node: u32,
    /// Speed included in the last `Move` batch this participant sent.
    pub last_reported_speed: f32,
    pub mode: TrainMode,
    pub controller: Option<String>,
    pub path: String,
    pub controls: ControlState,
    pending_update: Option<RemoteUpdate>,
}

impl TrainReplica {
    /// Build an uncontrolled replica. Callers assign ownership afterwards.
    pub fn new(number: TrainNumber, cars: &[CarDescriptor], pose: TrainPose) -> Self {
        Self {
            number,
            cars: cars.iter().cloned().map(Car::new).collect(),
            pose,
            track_node: 0,
            last_reported_speed: 0.0,
            mode: TrainMode::Remote,
            controller: None,
            path: String::new(),
            controls: ControlState::default(),
            pending_update: None,
        }
    }

    pub fn contains_car(&self, id: &str) -> bool {
        self.cars.iter().any(|car| car.id() == id)
    }

    pub fn car_ids(&self) -> Vec<String> {
        self.cars.iter().map(|car| car.id().to_owned()).collect()
    }

    pub fn descriptors(&self) -> Vec<CarDescriptor> {
        self.cars.iter().map(|car| car.descriptor.clone()).collect()
    }

    /// Queue a remote position update. Only `Remote` replicas accept one;
    /// returns whether it was taken.
    pub fn to_do_update(&mut self, update: RemoteUpdate) -> bool {
        if self.mode != TrainMode::Remote {
            return false;
        }
        self.track_node = update.track_node;
        self.pose = TrainPose {
            position: update.position,
            direction: update.direction,
            travelled: update.travelled,
            speed: update.speed,
        };
        self.pending_update = Some(update);
        true
    }

    /// Hand the latest queued remote update to the physics collaborator.
    pub fn take_pending_update(&mut self) -> Option<RemoteUpdate> {
        self.pending_update.take()
    }

    /// Replace the car list, reusing cars from `pool` by id.
    pub fn rebuild_cars(&mut self, descriptors: &[CarDescriptor], pool: &mut CarPool) {
        self.cars = descriptors.iter().map(|d| pool.take(d)).collect();
    }

    /// Run the physics hooks that must follow any car-list reconstruction.
    pub fn after_consist_change(&mut self, physics: &dyn TrainPhysics) {
        physics.calculate_position_of_cars(self);
        physics.initialize_brakes(self);
        physics.initialize_signals(self);
    }

    pub fn originator(&self) -> Originator {
        Originator::from_controller(self.controller.as_deref(), self.number)
    }

    pub fn snapshot(&self) -> TrainSnapshot {
        TrainSnapshot {
            originator: self.originator(),
            number: self.number,
            pose: self.pose,
            cars: self.descriptors(),
        }
    }

    pub fn move_entry(&self) -> MoveEntry {
        MoveEntry {
            originator: self.originator(),
            number: self.number,
            car_count: self.cars.len() as u32,
            travelled: self.pose.travelled,
            speed: self.pose.speed,
            track_node: self.track_node,
            direction: self.pose.direction,
            position: self.pose.position,
        }
    }

    /// Whether this train belongs in the next `Move` batch.
    pub fn is_moving_or_just_stopped(&self) -> bool {
        self.pose.speed != 0.0 || self.last_reported_speed != 0.0
    }
}

/// Cars taken out of replicas, keyed by id, waiting to be reused.
#[derive(Debug, Default)]
pub struct CarPool {
    cars: FxHashMap<String, Car>,
}

impl CarPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move every car of `train` into the pool, leaving it empty.
    pub fn absorb(&mut self, train: &mut TrainReplica) {
        for car in train.cars.drain(..) {
            self.cars.insert(car.descriptor.id.clone(), car);
        }
    }

    /// The existing car with this id (descriptor refreshed), or a new one.
    pub fn take(&mut self, descriptor: &CarDescriptor) -> Car {
        match self.cars.remove(&descriptor.id) {
            Some(mut car) => {
                car.descriptor = descriptor.clone();
                car
            }
            None => Car::new(descriptor.clone()),
        }
    }

    pub fn len(&self) -> usize {
        self.cars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cars.is_empty()
    }
}

/// Give cars loaded from a consist file session-unique ids.
pub fn assign_car_ids(owner: &str, cars: &[CarDescriptor]) -> Vec<CarDescriptor> {
    cars.iter()
        .enumerate()
        .map(|(i, car)| CarDescriptor::new(car.file.clone(), format!("{owner} - {i}"), car.flipped))
        .collect()
}

#[cfg(test)]
mod tests {
    use railnet_protocol::EventKind;

    use super::*;

    fn cars(ids: &[&str]) -> Vec<CarDescriptor> {
        ids.iter()
            .map(|id| CarDescriptor::new("boxcar.wag", *id, false))
            .collect()
    }

    #[test]
    fn to_do_update_only_for_remote() {
        let mut train = TrainReplica::new(TrainNumber(3), &cars(&["a"]), TrainPose::default());
        let update = RemoteUpdate {
            track_node: 9,
            position: WorldPosition::new(1, 2, 3.0, 4.0),
            travelled: 50.0,
            speed: 12.0,
            direction: Direction::Reverse,
        };

        train.mode = TrainMode::PlayerControlled;
        assert!(!train.to_do_update(update));
        assert_eq!(train.pose.speed, 0.0);

        train.mode = TrainMode::Remote;
        assert!(train.to_do_update(update));
        assert_eq!(train.pose.speed, 12.0);
        assert_eq!(train.track_node, 9);
        assert_eq!(train.take_pending_update(), Some(update));
        assert_eq!(train.take_pending_update(), None);
    }

    #[test]
    fn rebuild_reuses_cars_by_id() {
        let mut train = TrainReplica::new(TrainNumber(3), &cars(&["a", "b"]), TrainPose::default());
        train.cars[1].live.brake_cylinder_pressure = 42.0;

        let mut pool = CarPool::new();
        pool.absorb(&mut train);
        assert!(train.cars.is_empty());

        let mut flipped_b = cars(&["b", "c"]);
        flipped_b[0].flipped = true;
        train.rebuild_cars(&flipped_b, &mut pool);

        assert_eq!(train.car_ids(), vec!["b", "c"]);
        assert_eq!(train.cars[0].live.brake_cylinder_pressure, 42.0);
        assert!(train.cars[0].descriptor.flipped);
        assert_eq!(train.cars[1].live, CarLiveState::default());
        // "a" was not asked for and stays in the pool.
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn moving_or_just_stopped() {
        let mut train = TrainReplica::new(TrainNumber(1), &cars(&["a"]), TrainPose::default());
        assert!(!train.is_moving_or_just_stopped());
        train.pose.speed = 3.0;
        assert!(train.is_moving_or_just_stopped());
        train.last_reported_speed = 3.0;
        train.pose.speed = 0.0;
        assert!(train.is_moving_or_just_stopped());
        train.last_reported_speed = 0.0;
        assert!(!train.is_moving_or_just_stopped());
    }

    #[test]
    fn control_state_counters_wrap() {
        let mut controls = ControlState::default();
        controls.apply(EventKind::Headlight, 2);
        assert_eq!(controls.headlight, 2);
        controls.apply(EventKind::Headlight, 4);
        assert_eq!(controls.headlight, 1);
        controls.apply(EventKind::Horn, 1);
        assert!(controls.horn);
        controls.apply(EventKind::Horn, 0);
        assert!(!controls.horn);
    }

    #[test]
    fn ai_originator_for_uncontrolled_train() {
        let train = TrainReplica::new(TrainNumber(7), &cars(&["a", "b"]), TrainPose::default());
        let entry = train.move_entry();
        assert_eq!(entry.originator, Originator::Ai(TrainNumber(7)));
        assert_eq!(entry.car_count, 2);
    }

    #[test]
    fn assigned_ids_follow_owner() {
        let ids: Vec<String> = assign_car_ids("Alice", &cars(&["", ""]))
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(ids, vec!["Alice - 0", "Alice - 1"]);
    }
}
