//! Error types for pool and lease operations.

use std::time::Duration;

use cloudpool_id::{MachineId, PoolId, WorkloadId};
use thiserror::Error;

use crate::provisioner::ProvisionerError;

/// Result type for pool operations.
pub type PoolResult<T> = Result<T, PoolError>;

/// Errors that can occur while managing a pool or its leases.
#[derive(Debug, Error)]
pub enum PoolError {
    /// No idle machine and a new one could not be provisioned.
    #[error("no machines available in pool {pool_id}: {source}")]
    NoMachinesAvailable {
        pool_id: PoolId,
        #[source]
        source: Box<PoolError>,
    },

    /// The machine is occupied by another workload.
    #[error("machine {machine_id} is already leased to {workload_id}")]
    AlreadyLeased {
        machine_id: MachineId,
        workload_id: WorkloadId,
    },

    /// Release was called on a machine that is not leased.
    #[error("machine {0} is not leased")]
    NotLeased(MachineId),

    /// The handle is not tracked by this pool.
    #[error("machine {0} is not tracked by this pool")]
    UnknownHandle(MachineId),

    /// An explicitly requested machine does not exist in the pool.
    #[error("machine {0} not found")]
    MachineNotFound(MachineId),

    /// The pool has no provisioner, or has been shut down.
    #[error("provisioning unavailable for pool {0}")]
    ProvisioningUnavailable(PoolId),

    /// The upstream provisioner reported an error.
    #[error("provisioning failed: {0}")]
    ProvisioningFailure(#[from] ProvisionerError),

    /// The upstream provisioner did not answer in time.
    #[error("provisioner call for pool {pool_id} timed out after {elapsed:?}")]
    Timeout { pool_id: PoolId, elapsed: Duration },
}

impl PoolError {
    /// Returns true if the provisioner reported it is out of capacity.
    pub fn is_no_capacity(&self) -> bool {
        match self {
            PoolError::ProvisioningFailure(ProvisionerError::NoCapacity) => true,
            PoolError::NoMachinesAvailable { source, .. } => source.is_no_capacity(),
            _ => false,
        }
    }

    /// Returns true for errors raised by a caller misusing a handle, as
    /// opposed to failures of the environment.
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            PoolError::AlreadyLeased { .. }
                | PoolError::NotLeased(_)
                | PoolError::UnknownHandle(_)
                | PoolError::MachineNotFound(_)
        )
    }
}
