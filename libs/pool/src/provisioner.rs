//! Upstream provisioner interface and a simulated implementation.
//!
//! The provisioner abstracts the environment that actually creates and
//! destroys raw machines (a cloud API, a bare-metal inventory, a local
//! simulator). Calls are assumed slow and fallible.
//!
//! A simulated implementation is provided for development and testing.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Ordered key/value flags forwarded to the provisioner.
pub type ProvisioningFlags = BTreeMap<String, String>;

/// Errors reported by an upstream provisioner.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProvisionerError {
    /// The provisioner cannot allocate another machine.
    #[error("no capacity to provision another machine")]
    NoCapacity,

    /// The raw machine is no longer allocated upstream.
    #[error("machine {0} was already released")]
    AlreadyReleased(String),

    /// Any other backend failure.
    #[error("provisioner backend error: {0}")]
    Backend(String),
}

/// Connection details of a machine allocated by the provisioner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawMachine {
    /// Provisioner-assigned identifier.
    pub id: String,

    /// Address used to reach the machine.
    pub address: String,

    /// Free-form attributes reported by the provisioner.
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

/// Upstream machine provisioner.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Allocate a new raw machine.
    async fn provision(&self, flags: &ProvisioningFlags) -> Result<RawMachine, ProvisionerError>;

    /// Deallocate a raw machine.
    async fn release(&self, machine: &RawMachine) -> Result<(), ProvisionerError>;

    /// Current usage metric of a machine (e.g. CPU load), if known.
    async fn usage(&self, _machine: &RawMachine) -> Result<Option<f64>, ProvisionerError> {
        Ok(None)
    }

    /// Maximum number of machines this provisioner can hold at once.
    fn capacity(&self) -> Option<usize> {
        None
    }
}

#[derive(Debug, Clone)]
struct SimulatedMachine {
    raw: RawMachine,
    usage: f64,
}

/// In-process provisioner for testing and development.
pub struct SimulatedProvisioner {
    /// Counter for generating machine IDs.
    counter: AtomicU64,

    /// Maximum concurrently allocated machines.
    capacity: Option<usize>,

    /// Artificial delay applied to every provision call.
    latency: Duration,

    /// Whether provision calls should fail.
    fail_provisioning: AtomicBool,

    /// Whether release calls should fail.
    fail_releases: AtomicBool,

    machines: Mutex<BTreeMap<String, SimulatedMachine>>,

    provision_calls: AtomicUsize,
    release_calls: AtomicUsize,
}

impl SimulatedProvisioner {
    /// Create an unlimited simulated provisioner.
    pub fn new() -> Self {
        Self {
            counter: AtomicU64::new(0),
            capacity: None,
            latency: Duration::ZERO,
            fail_provisioning: AtomicBool::new(false),
            fail_releases: AtomicBool::new(false),
            machines: Mutex::new(BTreeMap::new()),
            provision_calls: AtomicUsize::new(0),
            release_calls: AtomicUsize::new(0),
        }
    }

    /// Limit the number of concurrently allocated machines.
    #[must_use]
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    /// Delay every provision call by `latency`.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Create a simulated provisioner that fails all provision calls.
    pub fn failing() -> Self {
        let provisioner = Self::new();
        provisioner.set_failing(true);
        provisioner
    }

    /// Toggle failure of provision calls.
    pub fn set_failing(&self, failing: bool) {
        self.fail_provisioning.store(failing, Ordering::SeqCst);
    }

    /// Toggle failure of release calls.
    pub fn set_failing_releases(&self, failing: bool) {
        self.fail_releases.store(failing, Ordering::SeqCst);
    }

    /// Set the usage reported for an allocated machine.
    pub async fn set_usage(&self, machine_id: &str, usage: f64) -> bool {
        let mut machines = self.machines.lock().await;
        match machines.get_mut(machine_id) {
            Some(machine) => {
                machine.usage = usage;
                true
            }
            None => false,
        }
    }

    /// Number of machines currently allocated.
    pub async fn allocated(&self) -> usize {
        self.machines.lock().await.len()
    }

    /// Snapshot of allocated machines, ordered by raw id.
    pub async fn machines(&self) -> Vec<RawMachine> {
        self.machines
            .lock()
            .await
            .values()
            .map(|m| m.raw.clone())
            .collect()
    }

    /// Number of provision calls received, successful or not.
    pub fn provision_calls(&self) -> usize {
        self.provision_calls.load(Ordering::SeqCst)
    }

    /// Number of release calls received, successful or not.
    pub fn release_calls(&self) -> usize {
        self.release_calls.load(Ordering::SeqCst)
    }

    fn next_machine_id(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::SeqCst)
    }
}

impl Default for SimulatedProvisioner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provisioner for SimulatedProvisioner {
    async fn provision(&self, flags: &ProvisioningFlags) -> Result<RawMachine, ProvisionerError> {
        self.provision_calls.fetch_add(1, Ordering::SeqCst);

        if self.fail_provisioning.load(Ordering::SeqCst) {
            return Err(ProvisionerError::Backend(
                "simulated provisioner configured to fail".to_string(),
            ));
        }

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let mut machines = self.machines.lock().await;
        if let Some(capacity) = self.capacity {
            if machines.len() >= capacity {
                debug!(capacity, "[SIM] Provisioner at capacity");
                return Err(ProvisionerError::NoCapacity);
            }
        }

        let n = self.next_machine_id();
        let raw = RawMachine {
            id: format!("sim{n:06}"),
            address: format!("10.{}.{}.{}", (n >> 16) & 0xff, (n >> 8) & 0xff, n & 0xff),
            attributes: flags.clone(),
        };

        info!(machine_id = %raw.id, address = %raw.address, "[SIM] Provisioned machine");

        machines.insert(
            raw.id.clone(),
            SimulatedMachine {
                raw: raw.clone(),
                usage: 0.0,
            },
        );
        Ok(raw)
    }

    async fn release(&self, machine: &RawMachine) -> Result<(), ProvisionerError> {
        self.release_calls.fetch_add(1, Ordering::SeqCst);

        if self.fail_releases.load(Ordering::SeqCst) {
            return Err(ProvisionerError::Backend(
                "simulated release configured to fail".to_string(),
            ));
        }

        let mut machines = self.machines.lock().await;
        match machines.remove(&machine.id) {
            Some(_) => {
                info!(machine_id = %machine.id, "[SIM] Released machine");
                Ok(())
            }
            None => Err(ProvisionerError::AlreadyReleased(machine.id.clone())),
        }
    }

    async fn usage(&self, machine: &RawMachine) -> Result<Option<f64>, ProvisionerError> {
        let machines = self.machines.lock().await;
        machines
            .get(&machine.id)
            .map(|m| Some(m.usage))
            .ok_or_else(|| ProvisionerError::AlreadyReleased(machine.id.clone()))
    }

    fn capacity(&self) -> Option<usize> {
        self.capacity
    }
}
