//! Shared registry of managed locations and named definitions.
//!
//! Managed locations are live handles keyed by name. Definitions are the
//! centrally published `name -> spec` entries other components use to look
//! a location up by name before it is resolved.

use std::collections::BTreeMap;

use tokio::sync::RwLock;
use tracing::debug;

use crate::error::LocationError;
use crate::location::{Location, OwnedLocation};
use crate::spec::LocationSpec;

/// Thread-safe registry of locations.
#[derive(Debug, Default)]
pub struct LocationRegistry {
    managed: RwLock<BTreeMap<String, Location>>,
    definitions: RwLock<BTreeMap<String, LocationSpec>>,
}

impl LocationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start managing a location. Fails if the name is already taken.
    pub async fn manage(&self, location: Location) -> Result<(), LocationError> {
        let mut managed = self.managed.write().await;
        let name = location.name().to_string();
        if managed.contains_key(&name) {
            return Err(LocationError::AlreadyManaged(name));
        }
        debug!(location = %name, "Managing location");
        managed.insert(name, location);
        Ok(())
    }

    /// Return the location managed under `location.name()`, managing it
    /// first if absent. Check and insert happen under one write guard.
    pub async fn get_or_manage(&self, location: Location) -> Location {
        // Fast path: read lock
        {
            let managed = self.managed.read().await;
            if let Some(existing) = managed.get(location.name()) {
                return existing.clone();
            }
        }

        let mut managed = self.managed.write().await;
        managed
            .entry(location.name().to_string())
            .or_insert_with(|| {
                debug!(location = %location.name(), "Managing location");
                location
            })
            .clone()
    }

    pub async fn get(&self, name: &str) -> Option<Location> {
        self.managed.read().await.get(name).cloned()
    }

    /// Stop managing a location, returning it if it was managed.
    pub async fn unmanage(&self, name: &str) -> Option<Location> {
        let removed = self.managed.write().await.remove(name);
        if removed.is_some() {
            debug!(location = %name, "Unmanaged location");
        }
        removed
    }

    pub async fn is_managed(&self, name: &str) -> bool {
        self.managed.read().await.contains_key(name)
    }

    /// Snapshot of all managed locations, ordered by name.
    pub async fn locations(&self) -> Vec<Location> {
        self.managed.read().await.values().cloned().collect()
    }

    /// Publish (or replace) a named definition.
    pub async fn define(&self, name: impl Into<String>, spec: LocationSpec) -> Option<LocationSpec> {
        let name = name.into();
        debug!(location = %name, spec = %spec, "Defining location");
        self.definitions.write().await.insert(name, spec)
    }

    pub async fn remove_definition(&self, name: &str) -> Option<LocationSpec> {
        self.definitions.write().await.remove(name)
    }

    pub async fn definition(&self, name: &str) -> Option<LocationSpec> {
        self.definitions.read().await.get(name).cloned()
    }

    /// Snapshot of all definitions, ordered by name.
    pub async fn definitions(&self) -> Vec<(String, LocationSpec)> {
        self.definitions
            .read()
            .await
            .iter()
            .map(|(name, spec)| (name.clone(), spec.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::location::{MachineLocation, PoolLocation};

    fn pool_location(name: &str) -> Location {
        PoolLocation::new("env1".parse().unwrap(), name, "Env").into()
    }

    #[tokio::test]
    async fn test_manage_and_get() {
        let registry = LocationRegistry::new();
        registry.manage(pool_location("cloud-env1")).await.unwrap();

        assert!(registry.is_managed("cloud-env1").await);
        let location = registry.get("cloud-env1").await.unwrap();
        assert_eq!(location.name(), "cloud-env1");
        assert!(registry.get("cloud-env2").await.is_none());
    }

    #[tokio::test]
    async fn test_manage_duplicate_rejected() {
        let registry = LocationRegistry::new();
        registry.manage(pool_location("cloud-env1")).await.unwrap();

        let err = registry.manage(pool_location("cloud-env1")).await.unwrap_err();
        assert_eq!(err, LocationError::AlreadyManaged("cloud-env1".to_string()));
        assert_eq!(registry.locations().await.len(), 1);
    }

    #[tokio::test]
    async fn test_get_or_manage_returns_existing() {
        let registry = LocationRegistry::new();
        let first = registry.get_or_manage(pool_location("cloud-env1")).await;

        let replacement = PoolLocation::new("env1".parse().unwrap(), "cloud-env1", "Other").into();
        let second = registry.get_or_manage(replacement).await;
        assert_eq!(first, second);
        assert_eq!(second.display_name(), "Env");
    }

    #[tokio::test]
    async fn test_unmanage() {
        let registry = LocationRegistry::new();
        let machine = MachineLocation::new(
            "env1".parse().unwrap(),
            "m7".parse().unwrap(),
            "cloud-env1-m7",
            "Cloud Machine m7",
            "cloud-env1",
        );
        registry.manage(machine.into()).await.unwrap();

        let removed = registry.unmanage("cloud-env1-m7").await.unwrap();
        assert!(removed.is_machine());
        assert!(!registry.is_managed("cloud-env1-m7").await);
        assert!(registry.unmanage("cloud-env1-m7").await.is_none());
    }

    #[tokio::test]
    async fn test_definitions() {
        let registry = LocationRegistry::new();
        let spec = LocationSpec::parse("cloud:env1:(name=\"cloud-env1\")").unwrap();

        assert!(registry.define("cloud-env1", spec.clone()).await.is_none());
        assert_eq!(registry.definition("cloud-env1").await, Some(spec.clone()));
        assert_eq!(registry.definitions().await.len(), 1);

        assert_eq!(registry.remove_definition("cloud-env1").await, Some(spec));
        assert!(registry.definition("cloud-env1").await.is_none());
    }
}
