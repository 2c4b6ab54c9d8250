//! Process-wide unit registry
//!
//! Assigns client unit and filesystem ids. Ids are handed out from 1 upward
//! and are never reused while the registry lives, even after a unit is
//! closed or expunged.

use modelrepo_common::{FilesystemId, FsId, UnitDescriptor, UnitId};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;

/// Lifecycle state of a unit
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum UnitState {
    Open,
    Closed,
}

#[derive(Debug)]
struct UnitEntry {
    descriptor: UnitDescriptor,
    state: UnitState,
    /// Corrupt records seen since the unit was registered
    errors: u64,
}

struct RegistryState {
    next_unit: u32,
    next_fs: u32,
    units: HashMap<UnitId, UnitEntry>,
    by_descriptor: HashMap<UnitDescriptor, UnitId>,
    filesystems: HashMap<FsId, FilesystemId>,
    fs_by_name: HashMap<FilesystemId, FsId>,
}

impl Default for RegistryState {
    fn default() -> Self {
        Self {
            next_unit: 1,
            next_fs: 1,
            units: HashMap::new(),
            by_descriptor: HashMap::new(),
            filesystems: HashMap::new(),
            fs_by_name: HashMap::new(),
        }
    }
}

impl RegistryState {
    fn fs_id(&mut self, fs: &FilesystemId) -> FsId {
        if let Some(id) = self.fs_by_name.get(fs) {
            return *id;
        }
        let id = FsId::new(self.next_fs);
        self.next_fs += 1;
        self.filesystems.insert(id, fs.clone());
        self.fs_by_name.insert(fs.clone(), id);
        id
    }
}

/// Client numbering of units and filesystems
#[derive(Default)]
pub struct UnitRegistry {
    state: RwLock<RegistryState>,
}

impl UnitRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn find(&self, desc: &UnitDescriptor) -> Option<UnitId> {
        self.state.read().by_descriptor.get(desc).copied()
    }

    /// Id of `desc`, allocating one if needed; new units start out closed
    ///
    /// Returns the id and whether it was allocated by this call.
    pub fn get_or_allocate(&self, desc: &UnitDescriptor) -> (UnitId, bool) {
        if let Some(id) = self.find(desc) {
            return (id, false);
        }

        let mut state = self.state.write();
        if let Some(id) = state.by_descriptor.get(desc) {
            return (*id, false);
        }
        state.fs_id(&desc.filesystem);
        let id = UnitId::new(state.next_unit);
        state.next_unit += 1;
        state.units.insert(
            id,
            UnitEntry {
                descriptor: desc.clone(),
                state: UnitState::Closed,
                errors: 0,
            },
        );
        state.by_descriptor.insert(desc.clone(), id);
        (id, true)
    }

    #[must_use]
    pub fn descriptor(&self, id: UnitId) -> Option<UnitDescriptor> {
        self.state
            .read()
            .units
            .get(&id)
            .map(|unit| unit.descriptor.clone())
    }

    #[must_use]
    pub fn state(&self, id: UnitId) -> Option<UnitState> {
        self.state.read().units.get(&id).map(|unit| unit.state)
    }

    /// Change the state of a unit, returning the previous one
    pub fn set_state(&self, id: UnitId, new_state: UnitState) -> Option<UnitState> {
        let mut state = self.state.write();
        let unit = state.units.get_mut(&id)?;
        Some(std::mem::replace(&mut unit.state, new_state))
    }

    /// Mark every unit closed
    pub fn close_all(&self) {
        for unit in self.state.write().units.values_mut() {
            unit.state = UnitState::Closed;
        }
    }

    /// Client id of a filesystem, allocating one if needed
    pub fn fs_id(&self, fs: &FilesystemId) -> FsId {
        if let Some(id) = self.find_fs(fs) {
            return id;
        }
        self.state.write().fs_id(fs)
    }

    #[must_use]
    pub fn find_fs(&self, fs: &FilesystemId) -> Option<FsId> {
        self.state.read().fs_by_name.get(fs).copied()
    }

    #[must_use]
    pub fn filesystem(&self, id: FsId) -> Option<FilesystemId> {
        self.state.read().filesystems.get(&id).cloned()
    }

    /// Count a corrupt record of `id`; returns the new total
    pub fn record_error(&self, id: UnitId) -> u64 {
        let mut state = self.state.write();
        state.units.get_mut(&id).map_or(0, |unit| {
            unit.errors += 1;
            unit.errors
        })
    }

    #[must_use]
    pub fn error_count(&self, id: UnitId) -> u64 {
        self.state.read().units.get(&id).map_or(0, |unit| unit.errors)
    }

    /// All registered units, in id order
    #[must_use]
    pub fn units(&self) -> Vec<(UnitId, UnitDescriptor, UnitState)> {
        let state = self.state.read();
        let mut units: Vec<_> = state
            .units
            .iter()
            .map(|(id, unit)| (*id, unit.descriptor.clone(), unit.state))
            .collect();
        units.sort_by_key(|(id, _, _)| *id);
        units
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state.read().units.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
