//! Lease coordinator: the obtain/release protocol for one pool.
//!
//! Every decision (idle check, assignment, admission of a new provision)
//! happens under the pool-wide guard, so two callers can never be handed
//! the same idle machine, and a "none idle, provision one" decision is
//! serialized against concurrent obtains. The provisioner call itself runs
//! outside the guard; its result is registered and leased in a single
//! critical section, so a freshly provisioned machine is never visible as
//! idle to anyone else.

use std::sync::Arc;

use cloudpool_id::{MachineId, WorkloadId};
use tracing::{debug, info, instrument};

use crate::error::{PoolError, PoolResult};
use crate::handle::{MachineHandle, Occupancy};
use crate::pool::{MachinePool, ReleasePolicy};
use crate::provisioner::ProvisioningFlags;

/// A request to bind a workload to a machine.
#[derive(Debug, Clone)]
pub struct LeaseRequest {
    pub workload_id: WorkloadId,

    /// Lease this exact machine instead of choosing one.
    pub target_machine: Option<MachineId>,

    /// Location name override for the leased machine.
    pub name: Option<String>,

    /// Display name override for the leased machine.
    pub display_name: Option<String>,

    /// Only reuse idle machines whose usage is at most this value.
    pub max_usage: Option<f64>,

    /// Extra flags for the provisioner if a new machine is needed.
    pub flags: ProvisioningFlags,
}

impl LeaseRequest {
    pub fn new(workload_id: WorkloadId) -> Self {
        Self {
            workload_id,
            target_machine: None,
            name: None,
            display_name: None,
            max_usage: None,
            flags: ProvisioningFlags::new(),
        }
    }

    #[must_use]
    pub fn with_target(mut self, machine_id: MachineId) -> Self {
        self.target_machine = Some(machine_id);
        self
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    #[must_use]
    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = Some(display_name.into());
        self
    }

    #[must_use]
    pub fn with_max_usage(mut self, max_usage: f64) -> Self {
        self.max_usage = Some(max_usage);
        self
    }

    #[must_use]
    pub fn with_flag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.flags.insert(key.into(), value.into());
        self
    }

    /// Whether an idle machine is acceptable for this request.
    pub fn accepts(&self, handle: &MachineHandle) -> bool {
        self.max_usage.is_none_or(|max| handle.usage <= max)
    }
}

/// What became of a machine after its lease was released.
#[derive(Debug, Clone)]
pub enum ReleaseOutcome {
    /// The machine is idle again and may be leased by another workload.
    Returned(MachineHandle),
    /// The machine was destroyed under the destroy-on-release policy.
    Destroyed(MachineHandle),
}

impl ReleaseOutcome {
    pub fn handle(&self) -> &MachineHandle {
        match self {
            Self::Returned(handle) | Self::Destroyed(handle) => handle,
        }
    }

    pub fn is_destroyed(&self) -> bool {
        matches!(self, Self::Destroyed(_))
    }
}

enum Decision {
    Leased(MachineHandle),
    Provision,
}

/// Serializes obtain/release for a single pool.
#[derive(Debug, Clone)]
pub struct LeaseCoordinator {
    pool: Arc<MachinePool>,
}

impl LeaseCoordinator {
    pub fn new(pool: Arc<MachinePool>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Arc<MachinePool> {
        &self.pool
    }

    /// Lease a machine to the requesting workload.
    ///
    /// An explicit target is leased only if idle. Otherwise the least-loaded
    /// idle machine is chosen, and a new machine is provisioned if none
    /// qualifies. Provisioning failures surface as `NoMachinesAvailable`,
    /// except timeouts, which surface as `Timeout`.
    #[instrument(skip(self, request), fields(pool_id = %self.pool.id(), workload_id = %request.workload_id))]
    pub async fn obtain(&self, request: &LeaseRequest) -> PoolResult<MachineHandle> {
        let decision = {
            let mut state = self.pool.state().lock().await;

            if let Some(target) = &request.target_machine {
                let Some(handle) = state.registry.get(target) else {
                    return Err(PoolError::MachineNotFound(target.clone()));
                };
                if let Occupancy::Leased { workload_id, .. } = &handle.occupancy {
                    return Err(PoolError::AlreadyLeased {
                        machine_id: target.clone(),
                        workload_id: workload_id.clone(),
                    });
                }
                Decision::Leased(state.registry.mark_leased(target, &request.workload_id)?)
            } else {
                let candidate = state
                    .registry
                    .find_idle_candidate(|handle| request.accepts(handle))
                    .map(|handle| handle.id.clone());

                match candidate {
                    Some(machine_id) => {
                        Decision::Leased(state.registry.mark_leased(&machine_id, &request.workload_id)?)
                    }
                    None => {
                        debug!("No idle machine, provisioning");
                        self.pool
                            .reserve(&mut state)
                            .map_err(|e| self.no_machines(e))?;
                        Decision::Provision
                    }
                }
            }
        };

        let handle = match decision {
            Decision::Leased(handle) => handle,
            Decision::Provision => self
                .pool
                .provision_reserved(&request.flags, Some(&request.workload_id))
                .await
                .map_err(|e| match e {
                    PoolError::Timeout { .. } => e,
                    other => self.no_machines(other),
                })?,
        };

        info!(machine_id = %handle.id, usage = handle.usage, "Leased machine");
        Ok(handle)
    }

    /// End the lease on a machine.
    ///
    /// Fails with `NotLeased` if the machine is idle or leased to a workload
    /// other than the one named in `handle`. Under the
    /// destroy-on-release policy the machine is destroyed; if that fails it
    /// stays in the pool as idle and the provisioner error is returned.
    #[instrument(skip(self, handle), fields(pool_id = %self.pool.id(), machine_id = %handle.id))]
    pub async fn release(&self, handle: &MachineHandle) -> PoolResult<ReleaseOutcome> {
        if handle.pool_id != *self.pool.id() {
            return Err(PoolError::UnknownHandle(handle.id.clone()));
        }
        let destroy = self.pool.config().release_policy == ReleasePolicy::DestroyOnRelease;

        let released = {
            let mut state = self.pool.state().lock().await;
            let Some(current) = state.registry.get(&handle.id) else {
                return Err(PoolError::UnknownHandle(handle.id.clone()));
            };
            let Some(workload_id) = current.workload().cloned() else {
                return Err(PoolError::NotLeased(handle.id.clone()));
            };
            // A handle from an earlier lease must not end the current one.
            if handle.workload() != Some(&workload_id) {
                debug!(
                    occupant = %workload_id,
                    "Release with a handle from another lease, ignoring"
                );
                return Err(PoolError::NotLeased(handle.id.clone()));
            }

            let released = state.registry.mark_idle(&handle.id)?;
            info!(workload_id = %workload_id, "Released lease");

            if destroy {
                state.registry.begin_retire(&handle.id)?;
            }
            released
        };

        if destroy {
            self.pool.retire(released.clone()).await?;
            Ok(ReleaseOutcome::Destroyed(released))
        } else {
            Ok(ReleaseOutcome::Returned(released))
        }
    }

    /// Force a machine out of the pool, ending its lease first if needed.
    #[instrument(skip(self, handle), fields(pool_id = %self.pool.id(), machine_id = %handle.id))]
    pub async fn evict(&self, handle: &MachineHandle) -> PoolResult<()> {
        if handle.pool_id != *self.pool.id() {
            return Err(PoolError::UnknownHandle(handle.id.clone()));
        }

        let target = {
            let mut state = self.pool.state().lock().await;
            if state.registry.is_occupied(&handle.id) {
                state.registry.mark_idle(&handle.id)?;
                info!("Evicting leased machine");
            }
            state.registry.begin_retire(&handle.id)?
        };
        self.pool.retire(target).await
    }

    fn no_machines(&self, source: PoolError) -> PoolError {
        PoolError::NoMachinesAvailable {
            pool_id: self.pool.id().clone(),
            source: Box::new(source),
        }
    }
}
