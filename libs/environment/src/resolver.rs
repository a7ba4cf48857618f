//! Resolution of textual location specs against running environments.

use std::sync::Arc;

use cloudpool_location::{
    Location, LocationRegistry, LocationSpec, MachineLocation, OwnedLocation, PoolLocation,
    SpecError,
};
use tracing::{debug, instrument};

use crate::directory::Directory;

/// Turns `cloud:` specs into managed locations.
#[derive(Debug, Clone)]
pub struct SpecResolver {
    directory: Arc<Directory>,
    locations: Arc<LocationRegistry>,
}

impl SpecResolver {
    pub fn new(directory: Arc<Directory>, locations: Arc<LocationRegistry>) -> Self {
        Self {
            directory,
            locations,
        }
    }

    /// Parse and resolve a spec string.
    pub async fn resolve_str(&self, text: &str) -> Result<Location, SpecError> {
        let spec = LocationSpec::parse(text)?;
        self.resolve(&spec).await
    }

    /// Resolve a parsed spec.
    ///
    /// Returns the location already managed under the spec's effective name,
    /// or creates and manages one. Machine specs need the pool's own location
    /// to be published. A name already used by a location with a different
    /// owner is a `NameConflict`.
    #[instrument(skip(self, spec), fields(spec = %spec))]
    pub async fn resolve(&self, spec: &LocationSpec) -> Result<Location, SpecError> {
        let environment = self
            .directory
            .get(&spec.pool_id)
            .await
            .ok_or_else(|| SpecError::UnknownPool(spec.pool_id.clone()))?;

        let location = match &spec.machine_id {
            None => Location::Pool(PoolLocation::from_spec(spec)),
            Some(machine_id) => {
                let parent = &environment.location().name;
                if !self.locations.is_managed(parent).await {
                    debug!(location = %parent, "Pool location not published");
                    return Err(SpecError::UnknownPool(spec.pool_id.clone()));
                }

                let handle = environment.pool().get(machine_id).await.ok_or_else(|| {
                    SpecError::UnknownMachine {
                        pool_id: spec.pool_id.clone(),
                        machine_id: machine_id.clone(),
                    }
                })?;

                Location::Machine(
                    MachineLocation::new(
                        spec.pool_id.clone(),
                        machine_id.clone(),
                        spec.location_name(),
                        spec.display_name(),
                        parent,
                    )
                    .with_address(&handle.machine.address),
                )
            }
        };

        let owner = location.owner();
        let resolved = self.locations.get_or_manage(location).await;
        if resolved.owner() != owner {
            debug!(location = %resolved.name(), "Location name taken by another owner");
            return Err(SpecError::NameConflict {
                spec: spec.to_string(),
                name: resolved.name().to_string(),
                owner: resolved.owner(),
            });
        }
        Ok(resolved)
    }
}
