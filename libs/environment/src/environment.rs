//! The environment that owns a machine pool and its locations.
//!
//! An environment publishes one pool-level location while it runs and keeps
//! one machine-level location per member machine, parented under it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use cloudpool_id::{MachineId, PoolId};
use cloudpool_location::{
    Location, LocationRegistry, LocationSpec, MachineLocation, OwnedLocation, PoolLocation,
};
use cloudpool_pool::{
    LeaseCoordinator, LeaseRequest, MachineHandle, MachinePool, PoolConfig, PoolStats, Provisioner,
    ProvisioningFlags, ReleaseOutcome, ShutdownReport,
};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::error::{EnvironmentError, EnvironmentResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Created,
    Running,
    Stopped,
}

/// A pool of machines together with the locations that expose it.
pub struct CloudEnvironment {
    coordinator: LeaseCoordinator,
    locations: Arc<LocationRegistry>,
    location: PoolLocation,
    lifecycle: Mutex<Lifecycle>,
    /// Name of each member's machine location.
    machine_locations: Mutex<HashMap<MachineId, String>>,
}

impl CloudEnvironment {
    pub fn new(
        pool_id: PoolId,
        config: PoolConfig,
        provisioner: Option<Arc<dyn Provisioner>>,
        locations: Arc<LocationRegistry>,
    ) -> Self {
        let location = PoolLocation::from_spec(&LocationSpec::pool(pool_id.clone()));
        let pool = MachinePool::new(pool_id, config, provisioner);

        Self {
            coordinator: LeaseCoordinator::new(Arc::new(pool)),
            locations,
            location,
            lifecycle: Mutex::new(Lifecycle::Created),
            machine_locations: Mutex::new(HashMap::new()),
        }
    }

    /// Override the pool location's name (default `cloud-<poolId>`).
    #[must_use]
    pub fn with_location_name(mut self, name: impl Into<String>) -> Self {
        self.location.name = name.into();
        self
    }

    #[must_use]
    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.location.display_name = display_name.into();
        self
    }

    pub fn id(&self) -> &PoolId {
        self.coordinator.pool().id()
    }

    pub fn pool(&self) -> &Arc<MachinePool> {
        self.coordinator.pool()
    }

    pub fn coordinator(&self) -> &LeaseCoordinator {
        &self.coordinator
    }

    /// The pool-level location, published while running.
    pub fn location(&self) -> &PoolLocation {
        &self.location
    }

    /// Spec under which the pool location is defined centrally.
    pub fn spec(&self) -> LocationSpec {
        LocationSpec::pool(self.id().clone()).with_name(&self.location.name)
    }

    pub async fn is_running(&self) -> bool {
        *self.lifecycle.lock().await == Lifecycle::Running
    }

    /// Publish the pool location and provision the initial machines.
    ///
    /// On failure everything published so far is withdrawn and the
    /// environment is left stopped.
    #[instrument(skip(self), fields(pool_id = %self.id()))]
    pub async fn start(&self) -> EnvironmentResult<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        if *lifecycle != Lifecycle::Created {
            return Err(EnvironmentError::AlreadyStarted(self.id().clone()));
        }

        info!(location = %self.location.name, "Starting cloud environment");

        if let Err(e) = self.start_inner().await {
            warn!(error = %e, "Cloud environment failed to start");
            self.teardown().await;
            *lifecycle = Lifecycle::Stopped;
            return Err(e);
        }

        *lifecycle = Lifecycle::Running;
        info!(
            location = %self.location.name,
            machines = self.pool().list_members().await.len(),
            "Cloud environment started"
        );
        Ok(())
    }

    async fn start_inner(&self) -> EnvironmentResult<()> {
        self.locations
            .manage(Location::Pool(self.location.clone()))
            .await?;
        self.locations.define(&self.location.name, self.spec()).await;

        let initial_size = self.pool().config().initial_size;
        for _ in 0..initial_size {
            let handle = self.pool().provision(&ProvisioningFlags::new()).await?;
            self.attach(&handle, None, None).await?;
        }
        Ok(())
    }

    /// Lease a machine and publish its location.
    ///
    /// Name overrides on the request rename the machine's location for the
    /// duration of the lease.
    #[instrument(skip(self, request), fields(pool_id = %self.id(), workload_id = %request.workload_id))]
    pub async fn lease(&self, request: &LeaseRequest) -> EnvironmentResult<MachineHandle> {
        self.ensure_running().await?;

        let handle = self.coordinator.obtain(request).await?;
        if let Err(e) = self
            .attach(&handle, request.name.as_deref(), request.display_name.as_deref())
            .await
        {
            warn!(machine_id = %handle.id, error = %e, "Failed to publish machine location, returning lease");
            if let Err(release_err) = self.release_inner(&handle).await {
                warn!(machine_id = %handle.id, error = %release_err, "Failed to return lease");
            }
            return Err(e);
        }
        Ok(handle)
    }

    /// Release a lease. Destroyed machines lose their location; returned
    /// machines get their default location back.
    #[instrument(skip(self, handle), fields(pool_id = %self.id(), machine_id = %handle.id))]
    pub async fn release(&self, handle: &MachineHandle) -> EnvironmentResult<ReleaseOutcome> {
        self.release_inner(handle).await
    }

    async fn release_inner(&self, handle: &MachineHandle) -> EnvironmentResult<ReleaseOutcome> {
        let outcome = self.coordinator.release(handle).await?;
        match &outcome {
            ReleaseOutcome::Destroyed(handle) => self.detach(&handle.id).await,
            ReleaseOutcome::Returned(handle) => self.restore(handle).await?,
        }
        Ok(outcome)
    }

    /// Resize the pool and bring machine locations in line with its members.
    #[instrument(skip(self), fields(pool_id = %self.id()))]
    pub async fn resize(&self, desired: usize) -> EnvironmentResult<usize> {
        self.ensure_running().await?;

        let result = self.pool().resize(desired).await;
        self.sync_machine_locations().await?;
        Ok(result?)
    }

    pub async fn stats(&self) -> PoolStats {
        self.pool().stats().await
    }

    pub async fn machines(&self) -> Vec<MachineHandle> {
        self.pool().list_members().await
    }

    pub async fn available_machines(&self) -> Vec<MachineHandle> {
        self.pool().list_idle().await
    }

    /// Location currently published for a member machine.
    pub async fn machine_location(&self, machine_id: &MachineId) -> Option<MachineLocation> {
        let name = self.machine_locations.lock().await.get(machine_id).cloned()?;
        self.locations
            .get(&name)
            .await
            .and_then(|location| location.as_machine().cloned())
    }

    /// Tear down the pool and withdraw every published location.
    ///
    /// Stopping an environment that is not running returns an empty report.
    #[instrument(skip(self), fields(pool_id = %self.id()))]
    pub async fn stop(&self) -> ShutdownReport {
        let mut lifecycle = self.lifecycle.lock().await;
        if *lifecycle == Lifecycle::Stopped {
            debug!("Cloud environment already stopped");
            return ShutdownReport::default();
        }

        info!("Stopping cloud environment");
        let report = self.teardown().await;
        *lifecycle = Lifecycle::Stopped;
        info!("Cloud environment stopped");
        report
    }

    async fn teardown(&self) -> ShutdownReport {
        let machine_ids: Vec<MachineId> = self.machine_locations.lock().await.keys().cloned().collect();
        for machine_id in &machine_ids {
            self.detach(machine_id).await;
        }

        let report = self.pool().shutdown().await;

        self.locations.unmanage(&self.location.name).await;
        self.locations.remove_definition(&self.location.name).await;
        report
    }

    async fn ensure_running(&self) -> EnvironmentResult<()> {
        if self.is_running().await {
            Ok(())
        } else {
            Err(EnvironmentError::NotRunning(self.id().clone()))
        }
    }

    fn default_machine_name(&self, machine_id: &MachineId) -> String {
        format!("{}-{}", self.location.name, machine_id)
    }

    /// Publish the location for a member machine, replacing the current one
    /// if its names differ from the requested ones.
    async fn attach(
        &self,
        handle: &MachineHandle,
        name: Option<&str>,
        display_name: Option<&str>,
    ) -> EnvironmentResult<MachineLocation> {
        let mut machine_locations = self.machine_locations.lock().await;
        self.attach_locked(&mut machine_locations, handle, name, display_name)
            .await
    }

    /// Give a returned machine its default location back, unless it has
    /// already been leased again. The occupancy check and the republish
    /// happen under one guard, so a new lease's overrides always land last.
    async fn restore(&self, handle: &MachineHandle) -> EnvironmentResult<()> {
        let mut machine_locations = self.machine_locations.lock().await;
        if self.pool().is_occupied(&handle.id).await {
            debug!(machine_id = %handle.id, "Machine leased again, keeping its location");
            return Ok(());
        }
        self.attach_locked(&mut machine_locations, handle, None, None)
            .await?;
        Ok(())
    }

    async fn attach_locked(
        &self,
        machine_locations: &mut HashMap<MachineId, String>,
        handle: &MachineHandle,
        name: Option<&str>,
        display_name: Option<&str>,
    ) -> EnvironmentResult<MachineLocation> {
        let name = name.map_or_else(|| self.default_machine_name(&handle.id), str::to_string);
        let display_name = display_name.map_or_else(
            || LocationSpec::machine(self.id().clone(), handle.id.clone()).default_display_name(),
            str::to_string,
        );

        let current = machine_locations.get(&handle.id).cloned();

        if let Some(current) = &current {
            if let Some(Location::Machine(existing)) = self.locations.get(current).await {
                if existing.name == name && existing.display_name == display_name {
                    return Ok(existing);
                }
            }
        }

        let location = MachineLocation::new(
            self.id().clone(),
            handle.id.clone(),
            &name,
            &display_name,
            &self.location.name,
        )
        .with_address(&handle.machine.address);

        if current.as_deref() == Some(name.as_str()) {
            self.locations.unmanage(&name).await;
        }
        self.locations
            .manage(Location::Machine(location.clone()))
            .await?;
        if self.pool().config().register_machine_locations {
            self.locations.define(&name, location.spec()).await;
        }

        if let Some(previous) = machine_locations.insert(handle.id.clone(), name.clone()) {
            if previous != name {
                self.withdraw(&previous).await;
            }
        }

        debug!(machine_id = %handle.id, location = %name, "Machine location published");
        Ok(location)
    }

    async fn detach(&self, machine_id: &MachineId) {
        let removed = self.machine_locations.lock().await.remove(machine_id);
        if let Some(name) = removed {
            self.withdraw(&name).await;
            debug!(machine_id = %machine_id, location = %name, "Machine location withdrawn");
        }
    }

    async fn withdraw(&self, name: &str) {
        self.locations.unmanage(name).await;
        if self.pool().config().register_machine_locations {
            self.locations.remove_definition(name).await;
        }
    }

    /// Publish locations for new members and withdraw those of departed ones.
    async fn sync_machine_locations(&self) -> EnvironmentResult<()> {
        let members = self.pool().list_members().await;
        let member_ids: HashSet<&MachineId> = members.iter().map(|handle| &handle.id).collect();

        let departed: Vec<MachineId> = self
            .machine_locations
            .lock()
            .await
            .keys()
            .filter(|id| !member_ids.contains(id))
            .cloned()
            .collect();
        for machine_id in &departed {
            self.detach(machine_id).await;
        }

        for handle in &members {
            let known = self.machine_locations.lock().await.contains_key(&handle.id);
            if !known {
                self.attach(handle, None, None).await?;
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for CloudEnvironment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudEnvironment")
            .field("pool_id", self.id())
            .field("location", &self.location.name)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloudpool_id::WorkloadId;
    use cloudpool_pool::SimulatedProvisioner;

    fn environment(config: PoolConfig) -> (CloudEnvironment, Arc<LocationRegistry>) {
        let locations = Arc::new(LocationRegistry::new());
        let environment = CloudEnvironment::new(
            "env1".parse().unwrap(),
            config,
            Some(Arc::new(SimulatedProvisioner::new())),
            locations.clone(),
        );
        (environment, locations)
    }

    #[tokio::test]
    async fn test_default_location_names() {
        let (environment, _) = environment(PoolConfig::default());
        assert_eq!(environment.location().name, "cloud-env1");
        assert_eq!(environment.location().display_name, "Cloud Environment env1");
        assert_eq!(environment.spec().to_string(), "cloud:env1:(name=\"cloud-env1\")");
    }

    #[tokio::test]
    async fn test_lease_before_start_fails() {
        let (environment, _) = environment(PoolConfig::default());
        let err = environment
            .lease(&LeaseRequest::new(WorkloadId::new()))
            .await
            .unwrap_err();
        assert!(err.is_not_running());
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let (environment, _) = environment(PoolConfig::default());
        environment.start().await.unwrap();
        assert!(matches!(
            environment.start().await.unwrap_err(),
            EnvironmentError::AlreadyStarted(_)
        ));
    }

    #[tokio::test]
    async fn test_lease_override_renames_until_release() {
        let (environment, locations) = environment(PoolConfig::default());
        environment.start().await.unwrap();
        let machine_id = environment.machines().await[0].id.clone();
        let default_name = format!("cloud-env1-{machine_id}");

        let handle = environment
            .lease(&LeaseRequest::new(WorkloadId::new()).with_name("web").with_display_name("Web"))
            .await
            .unwrap();
        assert_eq!(handle.id, machine_id);
        assert!(locations.is_managed("web").await);
        assert!(!locations.is_managed(&default_name).await);
        assert_eq!(environment.machine_location(&machine_id).await.unwrap().display_name, "Web");

        environment.release(&handle).await.unwrap();
        assert!(!locations.is_managed("web").await);
        assert!(locations.is_managed(&default_name).await);
    }

    #[tokio::test]
    async fn test_restore_skips_machine_leased_again() {
        let (environment, locations) = environment(PoolConfig::default());
        environment.start().await.unwrap();

        let first = environment
            .lease(&LeaseRequest::new(WorkloadId::new()))
            .await
            .unwrap();
        let returned = environment.coordinator().release(&first).await.unwrap();
        let second = environment
            .lease(&LeaseRequest::new(WorkloadId::new()).with_name("web"))
            .await
            .unwrap();
        assert_eq!(second.id, first.id);

        // The first lease's location restore arrives after the second lease.
        environment.restore(returned.handle()).await.unwrap();
        assert!(locations.is_managed("web").await);
        assert!(!locations.is_managed(&format!("cloud-env1-{}", first.id)).await);
        assert_eq!(environment.machine_location(&first.id).await.unwrap().name, "web");

        environment.release(&second).await.unwrap();
        assert!(!locations.is_managed("web").await);
        assert!(locations.is_managed(&format!("cloud-env1-{}", first.id)).await);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let (environment, locations) = environment(PoolConfig::default());
        environment.start().await.unwrap();

        let report = environment.stop().await;
        assert_eq!(report.released, 1);
        assert!(locations.locations().await.is_empty());
        assert!(!environment.is_running().await);

        assert_eq!(environment.stop().await, ShutdownReport::default());
    }
}
