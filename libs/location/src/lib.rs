//! # cloudpool-location
//!
//! Textual location specs and the named locations they resolve to.
//!
//! A spec addresses either a whole pool (`cloud:env1`) or one machine of it
//! (`cloud:env1:m7`), optionally overriding the location's names:
//!
//! ```
//! use cloudpool_location::LocationSpec;
//!
//! let spec: LocationSpec = "cloud:env1:m7:(name=\"web\")".parse().unwrap();
//! assert_eq!(spec.location_name(), "web");
//! assert_eq!(spec.display_name(), "Cloud Machine m7");
//! ```

mod error;
pub mod location;
pub mod registry;
pub mod spec;

pub use error::{LocationError, SpecError};
pub use location::{Location, LocationOwner, MachineLocation, OwnedLocation, PoolLocation};
pub use registry::LocationRegistry;
pub use spec::{LocationSpec, SpecArgs};
