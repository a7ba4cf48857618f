//! Location errors.

use cloudpool_id::{MachineId, PoolId};
use thiserror::Error;

use crate::location::LocationOwner;

/// Errors from parsing or resolving a location spec.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SpecError {
    /// The text does not follow the `cloud:<pool>[:<machine>][:(args)]` grammar.
    #[error("invalid location spec '{spec}': {reason}")]
    Malformed { spec: String, reason: String },

    /// The argument block names an unknown key or carries an empty value.
    #[error("invalid location spec '{spec}': {reason}")]
    InvalidArgument { spec: String, reason: String },

    /// No pool with this id is registered.
    #[error("unknown cloud pool: {0}")]
    UnknownPool(PoolId),

    /// The effective name is already taken by a location of another owner.
    #[error("invalid location spec '{spec}': name '{name}' belongs to {owner:?}")]
    NameConflict {
        spec: String,
        name: String,
        owner: LocationOwner,
    },

    /// The pool exists but holds no such machine.
    #[error("unknown machine {machine_id} in pool {pool_id}")]
    UnknownMachine { pool_id: PoolId, machine_id: MachineId },
}

impl SpecError {
    /// True for errors raised before any lookup happened.
    pub fn is_syntax(&self) -> bool {
        matches!(self, Self::Malformed { .. } | Self::InvalidArgument { .. })
    }
}

/// Errors from the location registry.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LocationError {
    #[error("location already managed: {0}")]
    AlreadyManaged(String),
}
