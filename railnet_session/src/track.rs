// External collaborators: track model, consist loading, train physics.
//
// The session never simulates anything itself. It reads and writes switch and
// signal states through `TrackModel`, resolves consist file names to car
// lists through `ConsistLoader`, and tells `TrainPhysics` to recompute a
// train after its car list was rebuilt. `Collaborators` bundles one of each
// for `Session::new`.
//
// Full-resync snapshots are index keyed: switch `i` in a `SwitchStatus`
// message is whatever switch the receiver's track enumerates at position `i`.
// Both peers must load the same route for this to line up. On a length
// mismatch the common prefix is applied and the rest is ignored with a
// warning.
//
// `StaticTrack`, `ConsistLibrary` and `NullPhysics` are the in-memory
// implementations used by the standalone binary and the tests.

use std::collections::{BTreeMap, BTreeSet};

use tracing::warn;

use railnet_protocol::{CarDescriptor, SignalHeadState, TrainNumber};

use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::replica::TrainReplica;

/// Mutable track elements shared by all participants.
pub trait TrackModel: Send {
    fn switch_count(&self) -> usize;
    fn switch_state(&self, index: usize) -> Option<u8>;
    /// Returns false if `index` does not exist.
    fn set_switch_state(&mut self, index: usize, state: u8) -> bool;

    /// Whether a train currently occupies the switch, so it must not be
    /// thrown.
    fn switch_locked(&self, _index: usize) -> bool {
        false
    }

    fn signal_count(&self) -> usize;
    fn signal_state(&self, index: usize) -> Option<SignalHeadState>;
    fn set_signal_state(&mut self, index: usize, state: SignalHeadState) -> bool;

    /// Called when a joining train appears, before other trains are told
    /// about it.
    fn reserve_route(&mut self, _train: TrainNumber, _path: &str) {}
}

/// Resolves a consist file reference to its cars.
pub trait ConsistLoader: Send + Sync {
    fn load_consist(&self, path: &str) -> Result<Vec<CarDescriptor>, SessionError>;
}

/// Hooks run after a replica's car list is reconstructed.
pub trait TrainPhysics: Send + Sync {
    fn calculate_position_of_cars(&self, train: &mut TrainReplica);
    fn initialize_brakes(&self, train: &mut TrainReplica);
    fn initialize_signals(&self, train: &mut TrainReplica);
}

/// One of each collaborator, handed to `Session::new`.
pub struct Collaborators {
    pub track: Box<dyn TrackModel>,
    pub consists: Box<dyn ConsistLoader>,
    pub physics: Box<dyn TrainPhysics>,
}

impl Collaborators {
    /// In-memory collaborators sized and stocked from the config.
    pub fn from_config(config: &SessionConfig) -> Self {
        Self {
            track: Box::new(StaticTrack::new(config.track.switches, config.track.signals)),
            consists: Box::new(ConsistLibrary::new(config.consists.clone())),
            physics: Box::new(NullPhysics),
        }
    }
}

pub fn switch_snapshot(track: &dyn TrackModel) -> Vec<u8> {
    (0..track.switch_count())
        .map(|i| track.switch_state(i).unwrap_or(0))
        .collect()
}

pub fn signal_snapshot(track: &dyn TrackModel) -> Vec<SignalHeadState> {
    (0..track.signal_count())
        .map(|i| track.signal_state(i).unwrap_or_default())
        .collect()
}

/// Apply a switch snapshot index for index. Returns how many switches
/// changed state.
pub fn apply_switch_snapshot(track: &mut dyn TrackModel, states: &[u8]) -> usize {
    if states.len() != track.switch_count() {
        warn!(
            received = states.len(),
            local = track.switch_count(),
            "switch snapshot length differs from local track"
        );
    }
    let mut changed = 0;
    for (index, &state) in states.iter().enumerate().take(track.switch_count()) {
        if track.switch_state(index) != Some(state) && track.set_switch_state(index, state) {
            changed += 1;
        }
    }
    changed
}

/// Apply a signal snapshot index for index. Returns how many heads changed.
pub fn apply_signal_snapshot(track: &mut dyn TrackModel, states: &[SignalHeadState]) -> usize {
    if states.len() != track.signal_count() {
        warn!(
            received = states.len(),
            local = track.signal_count(),
            "signal snapshot length differs from local track"
        );
    }
    let mut changed = 0;
    for (index, &state) in states.iter().enumerate().take(track.signal_count()) {
        if track.signal_state(index) != Some(state) && track.set_signal_state(index, state) {
            changed += 1;
        }
    }
    changed
}

/// Fixed-size in-memory track.
#[derive(Clone, Debug, Default)]
pub struct StaticTrack {
    switches: Vec<u8>,
    signals: Vec<SignalHeadState>,
    locked: BTreeSet<usize>,
    reservations: Vec<(TrainNumber, String)>,
}

impl StaticTrack {
    pub fn new(switches: usize, signals: usize) -> Self {
        Self {
            switches: vec![0; switches],
            signals: vec![SignalHeadState::default(); signals],
            locked: BTreeSet::new(),
            reservations: Vec::new(),
        }
    }

    pub fn lock_switch(&mut self, index: usize) {
        self.locked.insert(index);
    }

    pub fn reservations(&self) -> &[(TrainNumber, String)] {
        &self.reservations
    }
}

impl TrackModel for StaticTrack {
    fn switch_count(&self) -> usize {
        self.switches.len()
    }

    fn switch_state(&self, index: usize) -> Option<u8> {
        self.switches.get(index).copied()
    }

    fn set_switch_state(&mut self, index: usize, state: u8) -> bool {
        match self.switches.get_mut(index) {
            Some(slot) => {
                *slot = state;
                true
            }
            None => false,
        }
    }

    fn switch_locked(&self, index: usize) -> bool {
        self.locked.contains(&index)
    }

    fn signal_count(&self) -> usize {
        self.signals.len()
    }

    fn signal_state(&self, index: usize) -> Option<SignalHeadState> {
        self.signals.get(index).copied()
    }

    fn set_signal_state(&mut self, index: usize, state: SignalHeadState) -> bool {
        match self.signals.get_mut(index) {
            Some(slot) => {
                *slot = state;
                true
            }
            None => false,
        }
    }

    fn reserve_route(&mut self, train: TrainNumber, path: &str) {
        self.reservations.push((train, path.to_owned()));
    }
}

/// Consists held in memory, keyed by file name.
#[derive(Clone, Debug, Default)]
pub struct ConsistLibrary {
    consists: BTreeMap<String, Vec<CarDescriptor>>,
}

impl ConsistLibrary {
    pub fn new(consists: BTreeMap<String, Vec<CarDescriptor>>) -> Self {
        Self { consists }
    }

    pub fn insert(&mut self, path: impl Into<String>, cars: Vec<CarDescriptor>) {
        self.consists.insert(path.into(), cars);
    }
}

impl ConsistLoader for ConsistLibrary {
    fn load_consist(&self, path: &str) -> Result<Vec<CarDescriptor>, SessionError> {
        let cars = self
            .consists
            .get(path)
            .ok_or_else(|| SessionError::UnknownConsist(path.to_owned()))?;
        if cars.is_empty() {
            return Err(SessionError::EmptyConsist(path.to_owned()));
        }
        Ok(cars.clone())
    }
}

/// Physics that leaves trains exactly as the wire described them.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullPhysics;

impl TrainPhysics for NullPhysics {
    fn calculate_position_of_cars(&self, _train: &mut TrainReplica) {}

    fn initialize_brakes(&self, train: &mut TrainReplica) {
        for car in &mut train.cars {
            car.live.brake_cylinder_pressure = 0.0;
        }
    }

    fn initialize_signals(&self, _train: &mut TrainReplica) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshots_follow_enumeration_order() {
        let mut track = StaticTrack::new(3, 2);
        track.set_switch_state(1, 1);
        track.set_signal_state(0, SignalHeadState::new(4, 2));
        assert_eq!(switch_snapshot(&track), vec![0, 1, 0]);
        assert_eq!(
            signal_snapshot(&track),
            vec![SignalHeadState::new(4, 2), SignalHeadState::default()]
        );
    }

    #[test]
    fn apply_counts_changes() {
        let mut track = StaticTrack::new(3, 1);
        assert_eq!(apply_switch_snapshot(&mut track, &[1, 0, 1]), 2);
        assert_eq!(apply_switch_snapshot(&mut track, &[1, 0, 1]), 0);
        assert_eq!(
            apply_signal_snapshot(&mut track, &[SignalHeadState::new(2, 0)]),
            1
        );
    }

    #[test]
    fn mismatched_snapshot_applies_common_prefix() {
        let mut track = StaticTrack::new(2, 0);
        assert_eq!(apply_switch_snapshot(&mut track, &[1, 1, 1, 1]), 2);
        assert_eq!(switch_snapshot(&track), vec![1, 1]);

        let mut track = StaticTrack::new(4, 0);
        apply_switch_snapshot(&mut track, &[1]);
        assert_eq!(switch_snapshot(&track), vec![1, 0, 0, 0]);
    }

    #[test]
    fn out_of_range_switch_is_refused() {
        let mut track = StaticTrack::new(2, 0);
        assert!(!track.set_switch_state(2, 1));
        assert_eq!(track.switch_state(2), None);
    }

    #[test]
    fn library_lookup() {
        let mut library = ConsistLibrary::default();
        library.insert("freight.con", vec![CarDescriptor::new("dash9.eng", "", false)]);
        library.insert("empty.con", Vec::new());

        assert_eq!(library.load_consist("freight.con").unwrap().len(), 1);
        assert!(matches!(
            library.load_consist("missing.con"),
            Err(SessionError::UnknownConsist(path)) if path == "missing.con"
        ));
        assert!(matches!(
            library.load_consist("empty.con"),
            Err(SessionError::EmptyConsist(_))
        ));
    }
}
