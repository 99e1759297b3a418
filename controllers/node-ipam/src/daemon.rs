//! Node daemon loop.
//!
//! Owns the node's `PodIpAllocator`. On startup it drops allocations of
//! workloads that disappeared while the daemon was down, then runs the
//! allocation synchronizer on a fixed period.

use crate::backoff::FibonacciBackoff;
use crate::config::DaemonConfig;
use crate::error::DaemonError;
use ipam_core::{PodIpAllocator, PoolStore, WorkloadOracle};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Startup reap attempts before giving up
pub const DEFAULT_STARTUP_ATTEMPTS: u32 = 10;

/// Node IPAM daemon over a pool store and a workload oracle
pub struct Daemon<S, O> {
    allocator: PodIpAllocator<S>,
    oracle: O,
    node_name: String,
    sync_interval: Duration,
    startup_attempts: u32,
    backoff: FibonacciBackoff,
}

impl<S, O> Daemon<S, O>
where
    S: PoolStore,
    O: WorkloadOracle,
{
    /// Create a daemon for `config.node_name` with a fresh allocator over `store`
    pub fn new(store: S, oracle: O, config: &DaemonConfig) -> Self {
        Self {
            allocator: PodIpAllocator::new(store, config.history_timeout),
            oracle,
            node_name: config.node_name.clone(),
            sync_interval: config.sync_interval,
            startup_attempts: DEFAULT_STARTUP_ATTEMPTS,
            backoff: FibonacciBackoff::default(),
        }
    }

    /// Override the number of startup attempts (at least one)
    #[must_use]
    pub fn with_startup_attempts(mut self, attempts: u32) -> Self {
        self.startup_attempts = attempts.max(1);
        self
    }

    /// The node's allocator
    #[cfg(test)]
    pub fn allocator(&self) -> &PodIpAllocator<S> {
        &self.allocator
    }

    /// Reap allocations of vanished workloads, retrying while the store is unreachable.
    ///
    /// Returns the number of removed allocations.
    pub async fn startup(&mut self) -> Result<usize, DaemonError> {
        let mut attempt = 1;
        loop {
            match self.allocator.reap_stale(&self.node_name, &self.oracle).await {
                Ok(removed) => {
                    self.backoff.reset();
                    info!("Startup reap on {} removed {} allocations", self.node_name, removed);
                    return Ok(removed);
                }
                Err(e) if attempt < self.startup_attempts => {
                    let delay = self.backoff.next_backoff();
                    warn!(
                        "Startup reap attempt {}/{} failed, retrying in {}s: {}",
                        attempt,
                        self.startup_attempts,
                        delay.as_secs(),
                        e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// One synchronizer pass; returns the number of rewritten pools
    pub async fn sync_once(&self) -> Result<usize, DaemonError> {
        let rewritten = self.allocator.synchronize(&self.node_name, &self.oracle).await?;
        debug!("Synchronizer pass on {} rewrote {} pools", self.node_name, rewritten);
        Ok(rewritten)
    }

    /// Run startup, then synchronize forever
    pub async fn run(mut self) -> Result<(), DaemonError> {
        self.startup().await?;

        let mut ticker = tokio::time::interval(self.sync_interval);
        // the first tick completes immediately; startup just reconciled
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(e) = self.sync_once().await {
                warn!("Allocation synchronization on {} failed: {}", self.node_name, e);
            }
        }
    }
}
