//! Machine registry: occupancy bookkeeping for one pool.
//!
//! The registry is plain data. It performs no locking of its own; the
//! owning pool keeps it behind the pool-wide guard, so every transition
//! below happens under that guard.
//!
//! Machines being destroyed are marked retiring. Retiring machines stay
//! counted against capacity but are invisible to lookups and idle selection
//! until the provisioner confirms deallocation.

use std::collections::{BTreeMap, HashMap};

use chrono::Utc;
use cloudpool_id::{MachineId, PoolId, WorkloadId};
use tracing::debug;

use crate::error::{PoolError, PoolResult};
use crate::handle::{MachineHandle, Occupancy};
use crate::provisioner::RawMachine;

#[derive(Debug)]
struct Entry {
    handle: MachineHandle,
    retiring: bool,
}

/// Maps machine identity to its current occupant.
#[derive(Debug, Default)]
pub struct MachineRegistry {
    /// Entries keyed by provisioning sequence, giving insertion order.
    entries: BTreeMap<u64, Entry>,
    index: HashMap<MachineId, u64>,
    next_sequence: u64,
}

impl MachineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a freshly provisioned machine as idle.
    pub fn register(&mut self, pool_id: PoolId, machine_id: MachineId, machine: RawMachine) -> MachineHandle {
        let sequence = self.next_sequence;
        self.next_sequence += 1;

        let handle = MachineHandle {
            id: machine_id.clone(),
            pool_id,
            machine,
            occupancy: Occupancy::Idle,
            usage: 0.0,
            provisioned_at: Utc::now(),
            sequence,
        };

        if let Some(previous) = self.index.insert(machine_id, sequence) {
            self.entries.remove(&previous);
        }
        self.entries.insert(
            sequence,
            Entry {
                handle: handle.clone(),
                retiring: false,
            },
        );
        handle
    }

    /// Look up a live (non-retiring) machine.
    pub fn get(&self, machine_id: &MachineId) -> Option<&MachineHandle> {
        self.entry(machine_id)
            .filter(|entry| !entry.retiring)
            .map(|entry| &entry.handle)
    }

    /// Transition `Idle -> Leased(workload_id)`.
    ///
    /// Re-leasing to the same workload is a no-op.
    pub fn mark_leased(&mut self, machine_id: &MachineId, workload_id: &WorkloadId) -> PoolResult<MachineHandle> {
        let entry = self.live_entry_mut(machine_id)?;

        match &entry.handle.occupancy {
            Occupancy::Leased { workload_id: current, .. } if current == workload_id => {
                debug!(machine_id = %machine_id, workload_id = %workload_id, "Machine already leased to workload");
            }
            Occupancy::Leased { workload_id: current, .. } => {
                return Err(PoolError::AlreadyLeased {
                    machine_id: machine_id.clone(),
                    workload_id: current.clone(),
                });
            }
            Occupancy::Idle => {
                entry.handle.occupancy = Occupancy::Leased {
                    workload_id: workload_id.clone(),
                    since: Utc::now(),
                };
            }
        }

        Ok(entry.handle.clone())
    }

    /// Transition `Leased(*) -> Idle`. No-op if already idle.
    pub fn mark_idle(&mut self, machine_id: &MachineId) -> PoolResult<MachineHandle> {
        let entry = self.live_entry_mut(machine_id)?;
        entry.handle.occupancy = Occupancy::Idle;
        Ok(entry.handle.clone())
    }

    /// The least-loaded idle machine accepted by `predicate`.
    ///
    /// Ties on usage resolve to the earliest provisioned machine.
    pub fn find_idle_candidate<P>(&self, predicate: P) -> Option<&MachineHandle>
    where
        P: Fn(&MachineHandle) -> bool,
    {
        self.live()
            .filter(|handle| handle.is_idle() && predicate(handle))
            .min_by(|a, b| a.usage.total_cmp(&b.usage))
    }

    /// Whether the machine is currently leased. Unknown machines are not.
    pub fn is_occupied(&self, machine_id: &MachineId) -> bool {
        self.get(machine_id).is_some_and(|handle| !handle.is_idle())
    }

    /// Record a usage sample. Returns false for unknown machines.
    pub fn record_usage(&mut self, machine_id: &MachineId, usage: f64) -> bool {
        match self.index.get(machine_id).and_then(|seq| self.entries.get_mut(seq)) {
            Some(entry) => {
                entry.handle.usage = usage;
                true
            }
            None => false,
        }
    }

    /// All live machines in provisioning order.
    pub fn members(&self) -> Vec<MachineHandle> {
        self.live().cloned().collect()
    }

    /// Idle live machines in provisioning order.
    pub fn idle(&self) -> Vec<MachineHandle> {
        self.live().filter(|handle| handle.is_idle()).cloned().collect()
    }

    /// Number of live machines.
    pub fn len(&self) -> usize {
        self.live().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of tracked machines including those being destroyed.
    pub fn tracked(&self) -> usize {
        self.entries.len()
    }

    pub fn idle_count(&self) -> usize {
        self.live().filter(|handle| handle.is_idle()).count()
    }

    pub fn leased_count(&self) -> usize {
        self.live().filter(|handle| !handle.is_idle()).count()
    }

    /// Hide an idle machine from selection while it is being destroyed.
    pub(crate) fn begin_retire(&mut self, machine_id: &MachineId) -> PoolResult<MachineHandle> {
        let entry = self.live_entry_mut(machine_id)?;

        if let Occupancy::Leased { workload_id, .. } = &entry.handle.occupancy {
            return Err(PoolError::AlreadyLeased {
                machine_id: machine_id.clone(),
                workload_id: workload_id.clone(),
            });
        }

        entry.retiring = true;
        Ok(entry.handle.clone())
    }

    /// Return a retiring machine to the idle set after a failed destroy.
    pub(crate) fn abort_retire(&mut self, machine_id: &MachineId) {
        if let Some(entry) = self.index.get(machine_id).and_then(|seq| self.entries.get_mut(seq)) {
            entry.retiring = false;
        }
    }

    /// Stop tracking a machine.
    pub(crate) fn remove(&mut self, machine_id: &MachineId) -> Option<MachineHandle> {
        let sequence = self.index.remove(machine_id)?;
        self.entries.remove(&sequence).map(|entry| entry.handle)
    }

    /// Stop tracking every live machine, returning them in provisioning order.
    pub(crate) fn drain_live(&mut self) -> Vec<MachineHandle> {
        let live: Vec<MachineId> = self.live().map(|handle| handle.id.clone()).collect();
        live.iter().filter_map(|id| self.remove(id)).collect()
    }

    fn live(&self) -> impl Iterator<Item = &MachineHandle> {
        self.entries
            .values()
            .filter(|entry| !entry.retiring)
            .map(|entry| &entry.handle)
    }

    fn entry(&self, machine_id: &MachineId) -> Option<&Entry> {
        self.index.get(machine_id).and_then(|seq| self.entries.get(seq))
    }

    fn live_entry_mut(&mut self, machine_id: &MachineId) -> PoolResult<&mut Entry> {
        self.index
            .get(machine_id)
            .and_then(|seq| self.entries.get_mut(seq))
            .filter(|entry| !entry.retiring)
            .ok_or_else(|| PoolError::UnknownHandle(machine_id.clone()))
    }
}
