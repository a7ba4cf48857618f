//! Pool-level and machine-level location handles.

use cloudpool_id::{MachineId, PoolId};
use serde::Serialize;

use crate::spec::LocationSpec;

/// The pool (and optionally the machine) a location belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LocationOwner {
    Pool { pool_id: PoolId },
    Machine { pool_id: PoolId, machine_id: MachineId },
}

impl LocationOwner {
    pub fn pool_id(&self) -> &PoolId {
        match self {
            Self::Pool { pool_id } | Self::Machine { pool_id, .. } => pool_id,
        }
    }

    pub fn machine_id(&self) -> Option<&MachineId> {
        match self {
            Self::Pool { .. } => None,
            Self::Machine { machine_id, .. } => Some(machine_id),
        }
    }
}

/// Ownership lookup shared by every location kind.
pub trait OwnedLocation {
    fn owner(&self) -> LocationOwner;
    fn name(&self) -> &str;
    fn display_name(&self) -> &str;
    fn spec(&self) -> LocationSpec;
}

/// Location standing for a whole pool.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolLocation {
    pub pool_id: PoolId,
    pub name: String,
    pub display_name: String,
}

impl PoolLocation {
    pub fn new(pool_id: PoolId, name: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            pool_id,
            name: name.into(),
            display_name: display_name.into(),
        }
    }

    /// Build from a pool spec, applying the default naming rules.
    pub fn from_spec(spec: &LocationSpec) -> Self {
        Self::new(spec.pool_id.clone(), spec.location_name(), spec.display_name())
    }
}

impl OwnedLocation for PoolLocation {
    fn owner(&self) -> LocationOwner {
        LocationOwner::Pool {
            pool_id: self.pool_id.clone(),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn display_name(&self) -> &str {
        &self.display_name
    }

    fn spec(&self) -> LocationSpec {
        LocationSpec::pool(self.pool_id.clone())
            .with_name(&self.name)
            .with_display_name(&self.display_name)
    }
}

/// Location standing for one machine of a pool.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MachineLocation {
    pub pool_id: PoolId,
    pub machine_id: MachineId,
    pub name: String,
    pub display_name: String,

    /// Name of the owning pool location.
    pub parent: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

impl MachineLocation {
    pub fn new(
        pool_id: PoolId,
        machine_id: MachineId,
        name: impl Into<String>,
        display_name: impl Into<String>,
        parent: impl Into<String>,
    ) -> Self {
        Self {
            pool_id,
            machine_id,
            name: name.into(),
            display_name: display_name.into(),
            parent: parent.into(),
            address: None,
        }
    }

    #[must_use]
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }
}

impl OwnedLocation for MachineLocation {
    fn owner(&self) -> LocationOwner {
        LocationOwner::Machine {
            pool_id: self.pool_id.clone(),
            machine_id: self.machine_id.clone(),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn display_name(&self) -> &str {
        &self.display_name
    }

    fn spec(&self) -> LocationSpec {
        LocationSpec::machine(self.pool_id.clone(), self.machine_id.clone())
            .with_name(&self.name)
            .with_display_name(&self.display_name)
    }
}

/// A managed location of either kind.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Location {
    Pool(PoolLocation),
    Machine(MachineLocation),
}

impl Location {
    pub fn is_machine(&self) -> bool {
        matches!(self, Self::Machine(_))
    }

    pub fn as_pool(&self) -> Option<&PoolLocation> {
        match self {
            Self::Pool(location) => Some(location),
            Self::Machine(_) => None,
        }
    }

    pub fn as_machine(&self) -> Option<&MachineLocation> {
        match self {
            Self::Pool(_) => None,
            Self::Machine(location) => Some(location),
        }
    }

    fn inner(&self) -> &dyn OwnedLocation {
        match self {
            Self::Pool(location) => location,
            Self::Machine(location) => location,
        }
    }
}

impl OwnedLocation for Location {
    fn owner(&self) -> LocationOwner {
        self.inner().owner()
    }

    fn name(&self) -> &str {
        self.inner().name()
    }

    fn display_name(&self) -> &str {
        self.inner().display_name()
    }

    fn spec(&self) -> LocationSpec {
        self.inner().spec()
    }
}

impl From<PoolLocation> for Location {
    fn from(location: PoolLocation) -> Self {
        Self::Pool(location)
    }
}

impl From<MachineLocation> for Location {
    fn from(location: MachineLocation) -> Self {
        Self::Machine(location)
    }
}
