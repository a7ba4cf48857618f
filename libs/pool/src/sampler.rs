//! Usage sampler background worker.
//!
//! Periodically asks the provisioner for each member's usage and records it
//! so idle selection can prefer the least-loaded machine.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::pool::MachinePool;

/// Statistics from one sampling pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SampleStats {
    pub sampled: usize,
    pub unknown: usize,
    pub failed: usize,
}

/// Worker that keeps usage metrics of a pool's members fresh.
pub struct UsageSampler {
    pool: Arc<MachinePool>,
    interval: Duration,
}

impl UsageSampler {
    pub fn new(pool: Arc<MachinePool>, interval: Duration) -> Self {
        Self { pool, interval }
    }

    /// Run the sampler until shutdown is signaled.
    #[instrument(skip(self, shutdown), fields(pool_id = %self.pool.id()))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            "Starting usage sampler"
        );

        let mut interval = tokio::time::interval(self.interval);
        // Don't immediately tick on startup - wait for first interval
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let stats = self.sample_once().await;
                    if stats.failed > 0 {
                        warn!(failed = stats.failed, sampled = stats.sampled, "Usage sampling incomplete");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Usage sampler shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Sample every current member once.
    ///
    /// Members are snapshotted outside the pool guard; provisioner calls
    /// never hold it. Each call is bounded by the sampling interval and a
    /// machine that does not answer in time counts as failed.
    pub async fn sample_once(&self) -> SampleStats {
        let mut stats = SampleStats::default();
        let Some(provisioner) = self.pool.provisioner() else {
            return stats;
        };

        for handle in self.pool.list_members().await {
            match tokio::time::timeout(self.interval, provisioner.usage(&handle.machine)).await {
                Ok(Ok(Some(usage))) => {
                    if self.pool.record_usage(&handle.id, usage).await {
                        stats.sampled += 1;
                    }
                }
                Ok(Ok(None)) => stats.unknown += 1,
                Ok(Err(e)) => {
                    debug!(machine_id = %handle.id, error = %e, "Usage sample failed");
                    stats.failed += 1;
                }
                Err(_) => {
                    warn!(
                        machine_id = %handle.id,
                        timeout_secs = self.interval.as_secs(),
                        "Usage sample timed out"
                    );
                    stats.failed += 1;
                }
            }
        }

        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolConfig;
    use crate::provisioner::{
        Provisioner, ProvisionerError, ProvisioningFlags, RawMachine, SimulatedProvisioner,
    };

    #[tokio::test]
    async fn test_sample_once_records_usage() {
        let provisioner = Arc::new(SimulatedProvisioner::new());
        let pool = Arc::new(MachinePool::new(
            "env1".parse().unwrap(),
            PoolConfig::default(),
            Some(provisioner.clone()),
        ));
        pool.resize(2).await.unwrap();
        let members = pool.list_members().await;
        provisioner.set_usage(&members[0].machine.id, 0.8).await;
        provisioner.set_usage(&members[1].machine.id, 0.3).await;

        let sampler = UsageSampler::new(pool.clone(), Duration::from_secs(1));
        let stats = sampler.sample_once().await;
        assert_eq!(stats.sampled, 2);
        assert_eq!(stats.failed, 0);

        let members = pool.list_members().await;
        assert_eq!(members[0].usage, 0.8);
        assert_eq!(members[1].usage, 0.3);
    }

    #[tokio::test]
    async fn test_sample_once_counts_failures() {
        let provisioner = Arc::new(SimulatedProvisioner::new());
        let pool = Arc::new(MachinePool::new(
            "env1".parse().unwrap(),
            PoolConfig::default(),
            Some(provisioner.clone()),
        ));
        pool.resize(1).await.unwrap();
        let member = pool.list_members().await.remove(0);
        provisioner.release(&member.machine).await.unwrap();

        let stats = UsageSampler::new(pool, Duration::from_secs(1)).sample_once().await;
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.sampled, 0);
    }

    /// Provisioner whose usage call never answers for one machine.
    struct StuckUsageProvisioner {
        inner: SimulatedProvisioner,
        stuck: tokio::sync::Mutex<Option<String>>,
    }

    #[async_trait::async_trait]
    impl Provisioner for StuckUsageProvisioner {
        async fn provision(&self, flags: &ProvisioningFlags) -> Result<RawMachine, ProvisionerError> {
            self.inner.provision(flags).await
        }

        async fn release(&self, machine: &RawMachine) -> Result<(), ProvisionerError> {
            self.inner.release(machine).await
        }

        async fn usage(&self, machine: &RawMachine) -> Result<Option<f64>, ProvisionerError> {
            if self.stuck.lock().await.as_deref() == Some(machine.id.as_str()) {
                std::future::pending::<()>().await;
            }
            self.inner.usage(machine).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sample_once_bounds_stuck_usage_call() {
        let provisioner = Arc::new(StuckUsageProvisioner {
            inner: SimulatedProvisioner::new(),
            stuck: tokio::sync::Mutex::new(None),
        });
        let pool = Arc::new(MachinePool::new(
            "env1".parse().unwrap(),
            PoolConfig::default(),
            Some(provisioner.clone()),
        ));
        pool.resize(2).await.unwrap();
        let members = pool.list_members().await;
        *provisioner.stuck.lock().await = Some(members[0].machine.id.clone());
        provisioner.inner.set_usage(&members[1].machine.id, 0.6).await;

        let sampler = UsageSampler::new(pool.clone(), Duration::from_secs(5));
        let stats = tokio::time::timeout(Duration::from_secs(60), sampler.sample_once())
            .await
            .unwrap();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.sampled, 1);
        assert_eq!(pool.get(&members[1].id).await.unwrap().usage, 0.6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_shutdown() {
        let pool = Arc::new(MachinePool::new(
            "env1".parse().unwrap(),
            PoolConfig::default(),
            Some(Arc::new(SimulatedProvisioner::new())),
        ));
        let sampler = UsageSampler::new(pool, Duration::from_secs(5));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(async move { sampler.run(shutdown_rx).await });
        tokio::time::sleep(Duration::from_secs(12)).await;
        shutdown_tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
