//! Lazily synchronized cross-process name registry.
//!
//! Processes register named entities locally; changes are only exchanged
//! when [`Registry::sync`] runs and some process actually has pending
//! changes.
//!
//! [`Registry::sync`]: struct.Registry.html#method.sync

use std::mem;

use fnv::FnvHashMap;

use crate::comm::{all_gather_value, Communicator};
use crate::error::Result;
use crate::Pid;

/// Single local modification waiting to be exchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Change {
    Insert(String, Pid),
    Remove(String),
}

#[derive(Debug, Clone, PartialEq)]
enum State {
    /// Identical on every process.
    Clean(FnvHashMap<String, Pid>),
    /// Last synced snapshot plus local changes made since.
    Dirty {
        snapshot: FnvHashMap<String, Pid>,
        pending: Vec<Change>,
    },
}

/// Map of entity names to owning processes.
#[derive(Debug, Clone, PartialEq)]
pub struct Registry {
    state: State,
}

impl Default for Registry {
    fn default() -> Self {
        Registry {
            state: State::Clean(FnvHashMap::default()),
        }
    }
}

fn apply(map: &mut FnvHashMap<String, Pid>, change: Change) {
    match change {
        Change::Insert(name, pid) => {
            map.insert(name, pid);
        }
        Change::Remove(name) => {
            map.remove(&name);
        }
    }
}

impl Registry {
    pub fn new() -> Self {
        Registry::default()
    }

    pub fn is_dirty(&self) -> bool {
        match self.state {
            State::Dirty { .. } => true,
            State::Clean(_) => false,
        }
    }

    fn push(&mut self, change: Change) {
        let state = mem::replace(&mut self.state, State::Clean(FnvHashMap::default()));
        self.state = match state {
            State::Clean(snapshot) => State::Dirty {
                snapshot,
                pending: vec![change],
            },
            State::Dirty {
                snapshot,
                mut pending,
            } => {
                pending.push(change);
                State::Dirty { snapshot, pending }
            }
        };
    }

    pub fn insert(&mut self, name: &str, owner: Pid) {
        self.push(Change::Insert(name.to_string(), owner));
    }

    pub fn remove(&mut self, name: &str) {
        self.push(Change::Remove(name.to_string()));
    }

    /// Owner of the named entity as seen locally, including unsynced
    /// local changes.
    pub fn get(&self, name: &str) -> Option<Pid> {
        match &self.state {
            State::Clean(snapshot) => snapshot.get(name).cloned(),
            State::Dirty { snapshot, pending } => {
                for change in pending.iter().rev() {
                    match change {
                        Change::Insert(n, pid) if n == name => return Some(*pid),
                        Change::Remove(n) if n == name => return None,
                        _ => (),
                    }
                }
                snapshot.get(name).cloned()
            }
        }
    }

    /// Names in the last synced snapshot, sorted.
    pub fn names(&self) -> Vec<String> {
        let snapshot = match &self.state {
            State::Clean(s) => s,
            State::Dirty { snapshot, .. } => snapshot,
        };
        let mut names: Vec<String> = snapshot.keys().cloned().collect();
        names.sort();
        names
    }

    /// Collective. Merges every process's pending changes, applied in pid
    /// order, leaving every registry clean and identical.
    pub fn sync(&mut self, comm: &mut dyn Communicator) -> Result<()> {
        let flags = all_gather_value(comm, &self.is_dirty())?;
        if !flags.iter().any(|f| *f) {
            return Ok(());
        }
        let state = mem::replace(&mut self.state, State::Clean(FnvHashMap::default()));
        let (mut snapshot, pending) = match state {
            State::Clean(snapshot) => (snapshot, Vec::new()),
            State::Dirty { snapshot, pending } => (snapshot, pending),
        };
        let all: Vec<Vec<Change>> = all_gather_value(comm, &pending)?;
        let count: usize = all.iter().map(|c| c.len()).sum();
        for changes in all {
            for change in changes {
                apply(&mut snapshot, change);
            }
        }
        trace!("registry synced {} changes", count);
        self.state = State::Clean(snapshot);
        Ok(())
    }
}
