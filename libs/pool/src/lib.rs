//! # cloudpool-pool
//!
//! A pool of provisioned machines and the protocol that leases them to
//! running workloads.
//!
//! ## Components
//!
//! - `provisioner`: the upstream capability that allocates raw machines
//! - `registry`: occupancy bookkeeping (`Idle` / `Leased(workload)`)
//! - `pool`: provisioning, destruction, resizing and shutdown
//! - `coordinator`: serialized obtain/release
//! - `sampler`: background usage sampling for placement
//!
//! ## Lease lifecycle
//!
//! ```text
//! Idle ──obtain──> Leased ──release──> Idle
//!   │                 │
//!   └──destroy──> Destroyed <──evict──┘
//! ```

pub mod coordinator;
pub mod error;
pub mod handle;
pub mod pool;
pub mod provisioner;
pub mod registry;
pub mod sampler;

pub use coordinator::{LeaseCoordinator, LeaseRequest, ReleaseOutcome};
pub use error::{PoolError, PoolResult};
pub use handle::{MachineHandle, Occupancy};
pub use pool::{MachinePool, PoolConfig, PoolStats, ReleasePolicy, ShutdownReport};
pub use provisioner::{Provisioner, ProvisionerError, ProvisioningFlags, RawMachine, SimulatedProvisioner};
pub use registry::MachineRegistry;
pub use sampler::{SampleStats, UsageSampler};
