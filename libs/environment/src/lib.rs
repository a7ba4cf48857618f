//! # cloudpool-environment
//!
//! Ties a machine pool to the locations that expose it:
//!
//! - [`CloudEnvironment`]: pool lifecycle plus pool/machine locations
//! - [`Directory`]: running environments by pool id
//! - [`SpecResolver`]: `cloud:` specs to managed locations

pub mod directory;
pub mod environment;
pub mod error;
pub mod resolver;

pub use directory::Directory;
pub use environment::CloudEnvironment;
pub use error::{EnvironmentError, EnvironmentResult};
pub use resolver::SpecResolver;
