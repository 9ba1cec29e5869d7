// One read-reconcile-evict cycle

//! The enforcement pipeline
//!
//! [`Enforcer`] runs one cycle: snapshot the connection table, load the
//! active quotas, reconcile and evict. Each full cycle holds the enforcer's
//! guard, so a manually triggered cycle never interleaves with a scheduled
//! one.

use crate::conntrack::{ConnectionReader, FlowTable};
use crate::executor::Executor;
use crate::reconciler::{reconcile, validate_quotas};
use crate::registry::Registry;
use crate::types::EnforcerConfig;
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Summary of one completed cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Service flows in the snapshot
    pub flows: usize,
    /// Active users checked
    pub users: usize,
    /// Active users skipped because of malformed quota fields
    pub skipped_users: usize,
    /// Users found over quota
    pub breaches: usize,
    /// Flows torn down
    pub evicted: usize,
    /// Teardowns that failed
    pub eviction_failures: usize,
}

/// Connection limit enforcer
pub struct Enforcer {
    config: EnforcerConfig,
    reader: ConnectionReader,
    registry: Arc<dyn Registry>,
    executor: Executor,
    cycle_guard: Mutex<()>,
}

impl Enforcer {
    /// Create an enforcer over a flow table and a user registry
    pub fn new(
        config: EnforcerConfig,
        table: Arc<dyn FlowTable>,
        registry: Arc<dyn Registry>,
    ) -> Self {
        Self {
            reader: ConnectionReader::new(table.clone(), config.port_space),
            executor: Executor::new(table),
            registry,
            config,
            cycle_guard: Mutex::new(()),
        }
    }

    /// Enforcer settings
    pub fn config(&self) -> &EnforcerConfig {
        &self.config
    }

    /// Run one full cycle.
    ///
    /// Waits for any cycle already in flight. Registry failures abort the
    /// cycle with an error; connection-table and teardown failures do not.
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let _guard = self.cycle_guard.lock().await;

        // One snapshot per cycle, never re-read mid-reconciliation
        let snapshot = self.reader.snapshot(self.config.scan_timeout).await;

        let rows = self
            .registry
            .list_active_quotas()
            .await
            .context("Failed to load active user quotas")?;
        let (quotas, skipped) = validate_quotas(&rows);

        let fallback_port = self.config.port_space.fallback;
        let reconciliation = reconcile(&snapshot, &quotas, fallback_port);
        let eviction = self.executor.evict(&reconciliation.evictions).await;

        let report = CycleReport {
            flows: snapshot.len(),
            users: quotas.len(),
            skipped_users: skipped.len(),
            breaches: reconciliation.breaches.len(),
            evicted: eviction.succeeded,
            eviction_failures: eviction.failed.len(),
        };

        if report.breaches > 0 {
            log::info!(
                "Cycle: {} flows, {} users, {} over quota, {} dropped, {} failed",
                report.flows,
                report.users,
                report.breaches,
                report.evicted,
                report.eviction_failures
            );
        } else {
            log::debug!(
                "Cycle: {} flows, {} users, all within quota",
                report.flows,
                report.users
            );
        }

        Ok(report)
    }
}
