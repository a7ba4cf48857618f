//! Machine pool: owns provisioned machines and their lifecycle.
//!
//! Locking discipline:
//! - All registry state sits behind one pool-wide `tokio::sync::Mutex`.
//! - Provisioner calls are never made while holding it. A provision first
//!   reserves a slot under the guard (so concurrent callers cannot overrun
//!   capacity), calls the provisioner, then re-takes the guard to register
//!   the machine.
//! - Destroy hides the machine from selection under the guard, calls the
//!   provisioner, and only then removes it (or restores it on failure).

use std::sync::Arc;
use std::time::Duration;

use cloudpool_id::{MachineId, PoolId, WorkloadId};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::error::{PoolError, PoolResult};
use crate::handle::MachineHandle;
use crate::provisioner::{Provisioner, ProvisionerError, ProvisioningFlags, RawMachine};
use crate::registry::MachineRegistry;

/// Default bound on a single provisioner call.
pub const DEFAULT_PROVISION_TIMEOUT: Duration = Duration::from_secs(600);

/// What happens to a machine when its lease is released.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleasePolicy {
    /// Return the machine to the idle set for the next workload.
    #[default]
    Reuse,
    /// Destroy the machine; every lease gets a fresh one.
    DestroyOnRelease,
}

impl std::str::FromStr for ReleasePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "reuse" => Ok(Self::Reuse),
            "destroy" | "destroy_on_release" => Ok(Self::DestroyOnRelease),
            other => Err(format!("unknown release policy: {other}")),
        }
    }
}

/// Pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Machines provisioned when the owning environment starts.
    pub initial_size: usize,

    /// Upper bound on members plus in-flight provisions.
    pub max_size: Option<usize>,

    pub release_policy: ReleasePolicy,

    /// Whether machine-level locations are registered centrally.
    pub register_machine_locations: bool,

    /// Bound on each provisioner call.
    pub provision_timeout: Duration,

    /// Flags forwarded on every provision; request flags override them.
    pub provisioning_flags: ProvisioningFlags,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            initial_size: 1,
            max_size: None,
            release_policy: ReleasePolicy::Reuse,
            register_machine_locations: false,
            provision_timeout: DEFAULT_PROVISION_TIMEOUT,
            provisioning_flags: ProvisioningFlags::new(),
        }
    }
}

/// Point-in-time counters for a pool.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PoolStats {
    pub machine_count: usize,
    pub idle_count: usize,
    pub leased_count: usize,
    pub average_usage: Option<f64>,
}

/// Outcome of a pool shutdown.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// Machines deallocated by the provisioner.
    pub released: usize,
    /// Machines the provisioner no longer knew about.
    pub already_gone: usize,
    /// Machines whose deallocation failed.
    pub failed: usize,
    /// Leased machines torn down from under their workload.
    pub evicted: usize,
}

/// State guarded by the pool-wide lock.
#[derive(Debug, Default)]
pub(crate) struct PoolState {
    pub(crate) registry: MachineRegistry,
    /// Provisions admitted but not yet registered.
    pub(crate) in_flight: usize,
    pub(crate) closed: bool,
}

/// A pool of provisioned machines.
pub struct MachinePool {
    id: PoolId,
    config: PoolConfig,
    provisioner: Option<Arc<dyn Provisioner>>,
    state: Mutex<PoolState>,
}

impl MachinePool {
    /// Create an empty pool.
    pub fn new(id: PoolId, config: PoolConfig, provisioner: Option<Arc<dyn Provisioner>>) -> Self {
        Self {
            id,
            config,
            provisioner,
            state: Mutex::new(PoolState::default()),
        }
    }

    pub fn id(&self) -> &PoolId {
        &self.id
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn provisioner(&self) -> Option<&Arc<dyn Provisioner>> {
        self.provisioner.as_ref()
    }

    /// Provision a new idle machine.
    #[instrument(skip(self, hints), fields(pool_id = %self.id))]
    pub async fn provision(&self, hints: &ProvisioningFlags) -> PoolResult<MachineHandle> {
        {
            let mut state = self.state.lock().await;
            self.reserve(&mut state)?;
        }
        self.provision_reserved(hints, None).await
    }

    /// Destroy an idle machine and stop tracking it.
    ///
    /// Fails with `UnknownHandle` if the machine is not tracked by this pool
    /// and `AlreadyLeased` if it is still leased.
    #[instrument(skip(self, handle), fields(pool_id = %self.id, machine_id = %handle.id))]
    pub async fn destroy(&self, handle: &MachineHandle) -> PoolResult<()> {
        if handle.pool_id != self.id {
            return Err(PoolError::UnknownHandle(handle.id.clone()));
        }
        let target = {
            let mut state = self.state.lock().await;
            state.registry.begin_retire(&handle.id)?
        };
        self.retire(target).await
    }

    /// Snapshot of all members in provisioning order.
    pub async fn list_members(&self) -> Vec<MachineHandle> {
        self.state.lock().await.registry.members()
    }

    /// Snapshot of idle members in provisioning order.
    pub async fn list_idle(&self) -> Vec<MachineHandle> {
        self.state.lock().await.registry.idle()
    }

    pub async fn get(&self, machine_id: &MachineId) -> Option<MachineHandle> {
        self.state.lock().await.registry.get(machine_id).cloned()
    }

    /// The workload currently running on a machine.
    pub async fn occupant(&self, machine_id: &MachineId) -> Option<WorkloadId> {
        let state = self.state.lock().await;
        state
            .registry
            .get(machine_id)
            .and_then(|handle| handle.workload().cloned())
    }

    pub async fn is_occupied(&self, machine_id: &MachineId) -> bool {
        self.state.lock().await.registry.is_occupied(machine_id)
    }

    /// Record a usage sample for a member.
    pub async fn record_usage(&self, machine_id: &MachineId, usage: f64) -> bool {
        self.state.lock().await.registry.record_usage(machine_id, usage)
    }

    pub async fn stats(&self) -> PoolStats {
        let state = self.state.lock().await;
        let members = state.registry.members();
        let average_usage = if members.is_empty() {
            None
        } else {
            Some(members.iter().map(|h| h.usage).sum::<f64>() / members.len() as f64)
        };

        PoolStats {
            machine_count: members.len(),
            idle_count: state.registry.idle_count(),
            leased_count: state.registry.leased_count(),
            average_usage,
        }
    }

    /// Grow or shrink the pool towards `desired` members.
    ///
    /// Growth provisions idle machines. Shrinking destroys idle machines,
    /// newest first, and never touches leased ones. Returns the resulting size.
    #[instrument(skip(self), fields(pool_id = %self.id))]
    pub async fn resize(&self, desired: usize) -> PoolResult<usize> {
        let current = self.state.lock().await.registry.len();

        if current < desired {
            for _ in current..desired {
                self.provision(&ProvisioningFlags::new()).await?;
            }
        } else if current > desired {
            let mut idle = self.list_idle().await;
            idle.sort_by(|a, b| b.sequence.cmp(&a.sequence));

            for handle in idle.iter().take(current - desired) {
                match self.destroy(handle).await {
                    Ok(()) => {}
                    Err(PoolError::AlreadyLeased { .. }) | Err(PoolError::UnknownHandle(_)) => {
                        debug!(machine_id = %handle.id, "Machine no longer idle, skipping");
                    }
                    Err(e) => {
                        warn!(machine_id = %handle.id, error = %e, "Failed to destroy machine during resize");
                    }
                }
            }
        }

        let size = self.state.lock().await.registry.len();
        info!(desired, size, "Pool resized");
        Ok(size)
    }

    /// Release every member back to the provisioner.
    ///
    /// Best effort: failures are logged and counted, never abort the sequence.
    /// The pool refuses new provisions afterwards.
    #[instrument(skip(self), fields(pool_id = %self.id))]
    pub async fn shutdown(&self) -> ShutdownReport {
        let members = {
            let mut state = self.state.lock().await;
            state.closed = true;
            state.registry.drain_live()
        };

        let mut report = ShutdownReport::default();
        for handle in members {
            if let Some(workload_id) = handle.workload() {
                warn!(machine_id = %handle.id, workload_id = %workload_id, "Evicting leased machine");
                report.evicted += 1;
            }

            let Some(provisioner) = &self.provisioner else {
                warn!(machine_id = %handle.id, "No provisioner to release machine");
                report.failed += 1;
                continue;
            };

            match self.call_release(provisioner, &handle.machine).await {
                Ok(()) => report.released += 1,
                Err(PoolError::ProvisioningFailure(ProvisionerError::AlreadyReleased(_))) => {
                    warn!(machine_id = %handle.id, "Machine already released");
                    report.already_gone += 1;
                }
                Err(e) => {
                    warn!(machine_id = %handle.id, error = %e, "Failed to release machine");
                    report.failed += 1;
                }
            }
        }

        info!(
            released = report.released,
            already_gone = report.already_gone,
            failed = report.failed,
            evicted = report.evicted,
            "Pool shut down"
        );
        report
    }

    pub(crate) fn state(&self) -> &Mutex<PoolState> {
        &self.state
    }

    /// Admit one provision against capacity. Caller holds the guard.
    pub(crate) fn reserve(&self, state: &mut PoolState) -> PoolResult<()> {
        if self.provisioner.is_none() || state.closed {
            return Err(PoolError::ProvisioningUnavailable(self.id.clone()));
        }

        if let Some(cap) = self.effective_capacity() {
            let committed = state.registry.tracked() + state.in_flight;
            if committed >= cap {
                debug!(committed, cap, "Pool at capacity");
                return Err(ProvisionerError::NoCapacity.into());
            }
        }

        state.in_flight += 1;
        Ok(())
    }

    /// Complete an admitted provision, optionally leasing the new machine
    /// in the same critical section that registers it.
    pub(crate) async fn provision_reserved(
        &self,
        hints: &ProvisioningFlags,
        lease_to: Option<&WorkloadId>,
    ) -> PoolResult<MachineHandle> {
        let result = match &self.provisioner {
            Some(provisioner) => self.call_provision(provisioner, hints).await,
            None => Err(PoolError::ProvisioningUnavailable(self.id.clone())),
        };

        let mut state = self.state.lock().await;
        state.in_flight = state.in_flight.saturating_sub(1);
        let raw = result?;

        if state.closed {
            drop(state);
            warn!(machine_id = %raw.id, "Pool closed during provisioning, releasing machine");
            if let Some(provisioner) = &self.provisioner {
                if let Err(e) = self.call_release(provisioner, &raw).await {
                    warn!(machine_id = %raw.id, error = %e, "Failed to release orphaned machine");
                }
            }
            return Err(PoolError::ProvisioningUnavailable(self.id.clone()));
        }

        let handle = state
            .registry
            .register(self.id.clone(), MachineId::new(), raw);
        info!(
            machine_id = %handle.id,
            raw_id = %handle.machine.id,
            address = %handle.machine.address,
            "Provisioned machine"
        );

        match lease_to {
            Some(workload_id) => state.registry.mark_leased(&handle.id, workload_id),
            None => Ok(handle),
        }
    }

    /// Deallocate a machine already marked retiring.
    pub(crate) async fn retire(&self, target: MachineHandle) -> PoolResult<()> {
        let result = match &self.provisioner {
            Some(provisioner) => self.call_release(provisioner, &target.machine).await,
            None => Err(PoolError::ProvisioningUnavailable(self.id.clone())),
        };

        let mut state = self.state.lock().await;
        match result {
            Ok(()) => {
                state.registry.remove(&target.id);
                info!(machine_id = %target.id, "Destroyed machine");
                Ok(())
            }
            Err(PoolError::ProvisioningFailure(ProvisionerError::AlreadyReleased(raw_id))) => {
                state.registry.remove(&target.id);
                warn!(machine_id = %target.id, raw_id = %raw_id, "Machine already released upstream");
                Ok(())
            }
            Err(e) => {
                state.registry.abort_retire(&target.id);
                Err(e)
            }
        }
    }

    fn effective_capacity(&self) -> Option<usize> {
        let upstream = self.provisioner.as_ref().and_then(|p| p.capacity());
        match (self.config.max_size, upstream) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn merged_flags(&self, hints: &ProvisioningFlags) -> ProvisioningFlags {
        let mut flags = self.config.provisioning_flags.clone();
        flags.extend(hints.iter().map(|(k, v)| (k.clone(), v.clone())));
        flags
    }

    async fn call_provision(
        &self,
        provisioner: &Arc<dyn Provisioner>,
        hints: &ProvisioningFlags,
    ) -> PoolResult<RawMachine> {
        let flags = self.merged_flags(hints);
        let timeout = self.config.provision_timeout;

        match tokio::time::timeout(timeout, provisioner.provision(&flags)).await {
            Ok(result) => result.map_err(PoolError::from),
            Err(_) => Err(PoolError::Timeout {
                pool_id: self.id.clone(),
                elapsed: timeout,
            }),
        }
    }

    async fn call_release(&self, provisioner: &Arc<dyn Provisioner>, machine: &RawMachine) -> PoolResult<()> {
        let timeout = self.config.provision_timeout;

        match tokio::time::timeout(timeout, provisioner.release(machine)).await {
            Ok(result) => result.map_err(PoolError::from),
            Err(_) => Err(PoolError::Timeout {
                pool_id: self.id.clone(),
                elapsed: timeout,
            }),
        }
    }
}

impl std::fmt::Debug for MachinePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MachinePool")
            .field("id", &self.id)
            .field("config", &self.config)
            .field("has_provisioner", &self.provisioner.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provisioner::SimulatedProvisioner;

    fn pool_with(provisioner: Arc<SimulatedProvisioner>, config: PoolConfig) -> MachinePool {
        MachinePool::new("env1".parse().unwrap(), config, Some(provisioner))
    }

    #[tokio::test]
    async fn test_provision_registers_idle() {
        let provisioner = Arc::new(SimulatedProvisioner::new());
        let pool = pool_with(provisioner.clone(), PoolConfig::default());

        let handle = pool.provision(&ProvisioningFlags::new()).await.unwrap();
        assert!(handle.is_idle());
        assert_eq!(handle.pool_id.as_str(), "env1");
        assert_eq!(pool.list_members().await.len(), 1);
        assert_eq!(pool.list_idle().await.len(), 1);
        assert_eq!(provisioner.allocated().await, 1);
    }

    #[tokio::test]
    async fn test_provision_without_provisioner() {
        let pool = MachinePool::new("env1".parse().unwrap(), PoolConfig::default(), None);
        let err = pool.provision(&ProvisioningFlags::new()).await.unwrap_err();
        assert!(matches!(err, PoolError::ProvisioningUnavailable(_)));
    }

    #[tokio::test]
    async fn test_provision_failure_leaves_no_phantom() {
        let provisioner = Arc::new(SimulatedProvisioner::failing());
        let pool = pool_with(provisioner, PoolConfig::default());

        let err = pool.provision(&ProvisioningFlags::new()).await.unwrap_err();
        assert!(matches!(err, PoolError::ProvisioningFailure(ProvisionerError::Backend(_))));
        assert!(pool.list_members().await.is_empty());
        assert_eq!(pool.state().lock().await.in_flight, 0);
    }

    #[tokio::test]
    async fn test_provision_respects_max_size() {
        let provisioner = Arc::new(SimulatedProvisioner::new());
        let config = PoolConfig {
            max_size: Some(1),
            ..PoolConfig::default()
        };
        let pool = pool_with(provisioner.clone(), config);

        pool.provision(&ProvisioningFlags::new()).await.unwrap();
        let err = pool.provision(&ProvisioningFlags::new()).await.unwrap_err();
        assert!(err.is_no_capacity());
        // Rejected before reaching the provisioner.
        assert_eq!(provisioner.provision_calls(), 1);
    }

    #[tokio::test]
    async fn test_provision_merges_flags() {
        let provisioner = Arc::new(SimulatedProvisioner::new());
        let mut config = PoolConfig::default();
        config.provisioning_flags.insert("region".to_string(), "eu-west-1".to_string());
        config.provisioning_flags.insert("hardware".to_string(), "m1.small".to_string());
        let pool = pool_with(provisioner, config);

        let mut hints = ProvisioningFlags::new();
        hints.insert("hardware".to_string(), "m1.medium".to_string());
        let handle = pool.provision(&hints).await.unwrap();

        assert_eq!(handle.machine.attributes["region"], "eu-west-1");
        assert_eq!(handle.machine.attributes["hardware"], "m1.medium");
    }

    #[tokio::test(start_paused = true)]
    async fn test_provision_timeout() {
        let provisioner = Arc::new(SimulatedProvisioner::new().with_latency(Duration::from_secs(60)));
        let config = PoolConfig {
            provision_timeout: Duration::from_secs(5),
            ..PoolConfig::default()
        };
        let pool = pool_with(provisioner, config);

        let err = pool.provision(&ProvisioningFlags::new()).await.unwrap_err();
        assert!(matches!(err, PoolError::Timeout { .. }));
        assert!(pool.list_members().await.is_empty());
    }

    #[tokio::test]
    async fn test_destroy_removes_member() {
        let provisioner = Arc::new(SimulatedProvisioner::new());
        let pool = pool_with(provisioner.clone(), PoolConfig::default());

        let handle = pool.provision(&ProvisioningFlags::new()).await.unwrap();
        pool.destroy(&handle).await.unwrap();

        assert!(pool.list_members().await.is_empty());
        assert_eq!(provisioner.allocated().await, 0);
    }

    #[tokio::test]
    async fn test_destroy_unknown_handle() {
        let provisioner = Arc::new(SimulatedProvisioner::new());
        let pool = pool_with(provisioner, PoolConfig::default());

        let handle = pool.provision(&ProvisioningFlags::new()).await.unwrap();
        pool.destroy(&handle).await.unwrap();

        let err = pool.destroy(&handle).await.unwrap_err();
        assert!(matches!(err, PoolError::UnknownHandle(_)));
    }

    #[tokio::test]
    async fn test_destroy_handle_from_other_pool() {
        let provisioner = Arc::new(SimulatedProvisioner::new());
        let pool = pool_with(provisioner.clone(), PoolConfig::default());
        let other = MachinePool::new("env2".parse().unwrap(), PoolConfig::default(), Some(provisioner));

        let handle = other.provision(&ProvisioningFlags::new()).await.unwrap();
        let err = pool.destroy(&handle).await.unwrap_err();
        assert!(matches!(err, PoolError::UnknownHandle(_)));
        assert_eq!(other.list_members().await.len(), 1);
    }

    #[tokio::test]
    async fn test_destroy_failure_restores_member() {
        let provisioner = Arc::new(SimulatedProvisioner::new());
        let pool = pool_with(provisioner.clone(), PoolConfig::default());

        let handle = pool.provision(&ProvisioningFlags::new()).await.unwrap();
        provisioner.set_failing_releases(true);

        let err = pool.destroy(&handle).await.unwrap_err();
        assert!(matches!(err, PoolError::ProvisioningFailure(_)));
        let idle = pool.list_idle().await;
        assert_eq!(idle.len(), 1);
        assert_eq!(idle[0].id, handle.id);
    }

    #[tokio::test]
    async fn test_destroy_already_released_upstream() {
        let provisioner = Arc::new(SimulatedProvisioner::new());
        let pool = pool_with(provisioner.clone(), PoolConfig::default());

        let handle = pool.provision(&ProvisioningFlags::new()).await.unwrap();
        provisioner.release(&handle.machine).await.unwrap();

        pool.destroy(&handle).await.unwrap();
        assert!(pool.list_members().await.is_empty());
    }

    #[tokio::test]
    async fn test_resize_grow_and_shrink() {
        let provisioner = Arc::new(SimulatedProvisioner::new());
        let pool = pool_with(provisioner.clone(), PoolConfig::default());

        assert_eq!(pool.resize(3).await.unwrap(), 3);
        let members = pool.list_members().await;

        assert_eq!(pool.resize(1).await.unwrap(), 1);
        let remaining = pool.list_members().await;
        assert_eq!(remaining.len(), 1);
        // Newest machines go first.
        assert_eq!(remaining[0].id, members[0].id);
        assert_eq!(provisioner.allocated().await, 1);
    }

    #[tokio::test]
    async fn test_resize_keeps_leased() {
        let provisioner = Arc::new(SimulatedProvisioner::new());
        let pool = pool_with(provisioner, PoolConfig::default());
        pool.resize(2).await.unwrap();

        let members = pool.list_members().await;
        {
            let mut state = pool.state().lock().await;
            state.registry.mark_leased(&members[0].id, &WorkloadId::new()).unwrap();
            state.registry.mark_leased(&members[1].id, &WorkloadId::new()).unwrap();
        }

        assert_eq!(pool.resize(0).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_stats() {
        let provisioner = Arc::new(SimulatedProvisioner::new());
        let pool = pool_with(provisioner, PoolConfig::default());
        assert_eq!(pool.stats().await, PoolStats::default());

        pool.resize(2).await.unwrap();
        let members = pool.list_members().await;
        pool.record_usage(&members[0].id, 0.2).await;
        pool.record_usage(&members[1].id, 0.6).await;
        {
            let mut state = pool.state().lock().await;
            state.registry.mark_leased(&members[0].id, &WorkloadId::new()).unwrap();
        }

        let stats = pool.stats().await;
        assert_eq!(stats.machine_count, 2);
        assert_eq!(stats.idle_count, 1);
        assert_eq!(stats.leased_count, 1);
        let average = stats.average_usage.unwrap();
        assert!((average - 0.4).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_shutdown_best_effort() {
        let provisioner = Arc::new(SimulatedProvisioner::new());
        let pool = pool_with(provisioner.clone(), PoolConfig::default());
        pool.resize(3).await.unwrap();

        let members = pool.list_members().await;
        {
            let mut state = pool.state().lock().await;
            state.registry.mark_leased(&members[1].id, &WorkloadId::new()).unwrap();
        }
        // Gone upstream already; must not abort the sequence.
        provisioner.release(&members[0].machine).await.unwrap();

        let report = pool.shutdown().await;
        assert_eq!(
            report,
            ShutdownReport {
                released: 2,
                already_gone: 1,
                failed: 0,
                evicted: 1,
            }
        );
        assert!(pool.list_members().await.is_empty());
        assert_eq!(provisioner.allocated().await, 0);

        let err = pool.provision(&ProvisioningFlags::new()).await.unwrap_err();
        assert!(matches!(err, PoolError::ProvisioningUnavailable(_)));
    }

    #[test]
    fn test_release_policy_from_str() {
        assert_eq!("reuse".parse::<ReleasePolicy>().unwrap(), ReleasePolicy::Reuse);
        assert_eq!(
            "DESTROY".parse::<ReleasePolicy>().unwrap(),
            ReleasePolicy::DestroyOnRelease
        );
        assert!("keep".parse::<ReleasePolicy>().is_err());
    }
}
