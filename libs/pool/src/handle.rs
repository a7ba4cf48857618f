//! Machine handles and their occupancy state.

use chrono::{DateTime, Utc};
use cloudpool_id::{MachineId, PoolId, WorkloadId};
use serde::Serialize;

use crate::provisioner::RawMachine;

/// Occupancy state of a pooled machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Occupancy {
    /// Available for lease.
    Idle,
    /// Bound to a running workload.
    Leased {
        workload_id: WorkloadId,
        since: DateTime<Utc>,
    },
}

impl Occupancy {
    /// Returns true if the machine is idle.
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    /// The occupying workload, if any.
    pub fn workload(&self) -> Option<&WorkloadId> {
        match self {
            Self::Idle => None,
            Self::Leased { workload_id, .. } => Some(workload_id),
        }
    }
}

/// A pool's view of one provisioned machine.
///
/// Handles returned from the pool are snapshots; the authoritative state
/// lives in the pool's registry.
#[derive(Debug, Clone, Serialize)]
pub struct MachineHandle {
    pub id: MachineId,
    pub pool_id: PoolId,
    pub machine: RawMachine,
    pub occupancy: Occupancy,
    /// Last sampled usage (e.g. CPU load); lower is preferred for placement.
    pub usage: f64,
    pub provisioned_at: DateTime<Utc>,
    /// Provisioning order within the pool.
    pub sequence: u64,
}

impl MachineHandle {
    pub fn is_idle(&self) -> bool {
        self.occupancy.is_idle()
    }

    pub fn workload(&self) -> Option<&WorkloadId> {
        self.occupancy.workload()
    }
}
