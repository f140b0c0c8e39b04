// Deferred structural changes.
//
// Connection reader threads must not insert, remove or renumber train
// replicas, nor drop participants, while the tick may be iterating over them.
// Handlers append such changes here instead, and `Session::tick` drains the
// whole set once per tick and applies it against the world.
//
// Application order at drain time: renames, additions, removals, departed
// participants, and finally abandonment (which supersedes everything else).

use parking_lot::Mutex;

use railnet_protocol::TrainNumber;

use crate::replica::TrainReplica;

/// Changes queued since the last drain.
#[derive(Debug, Default)]
pub struct PendingChanges {
    pub players_removed: Vec<String>,
    pub trains_added: Vec<TrainReplica>,
    pub trains_removed: Vec<TrainNumber>,
    /// Provisional number to authoritative number.
    pub renames: Vec<(TrainNumber, TrainNumber)>,
    /// Reason for leaving multiplayer, if the session must be abandoned.
    pub abandon: Option<String>,
}

impl PendingChanges {
    pub fn is_empty(&self) -> bool {
        self.players_removed.is_empty()
            && self.trains_added.is_empty()
            && self.trains_removed.is_empty()
            && self.renames.is_empty()
            && self.abandon.is_none()
    }
}

#[derive(Debug, Default)]
pub struct Housekeeping {
    pending: Mutex<PendingChanges>,
}

impl Housekeeping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn remove_player(&self, name: &str) {
        let mut pending = self.pending.lock();
        if !pending.players_removed.iter().any(|n| n == name) {
            pending.players_removed.push(name.to_owned());
        }
    }

    pub fn add_train(&self, train: TrainReplica) {
        let mut pending = self.pending.lock();
        // A later addition of the same number supersedes an earlier one.
        pending.trains_added.retain(|t| t.number != train.number);
        pending.trains_added.push(train);
    }

    pub fn remove_train(&self, number: TrainNumber) {
        let mut pending = self.pending.lock();
        if !pending.trains_removed.contains(&number) {
            pending.trains_removed.push(number);
        }
    }

    pub fn rename_train(&self, from: TrainNumber, to: TrainNumber) {
        self.pending.lock().renames.push((from, to));
    }

    /// Keep the first reason given.
    pub fn abandon(&self, reason: impl Into<String>) {
        let mut pending = self.pending.lock();
        if pending.abandon.is_none() {
            pending.abandon = Some(reason.into());
        }
    }

    /// A copy of a queued addition, for announcing trains not yet installed.
    pub fn pending_train(&self, number: TrainNumber) -> Option<TrainReplica> {
        self.pending
            .lock()
            .trains_added
            .iter()
            .find(|t| t.number == number)
            .cloned()
    }

    /// Take everything queued so far.
    pub fn drain(&self) -> PendingChanges {
        std::mem::take(&mut *self.pending.lock())
    }
}
