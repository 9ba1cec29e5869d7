// Eviction executor

//! Tears down the flows chosen by the reconciler, one record at a time.
//!
//! A failed teardown is recorded and the remaining records are still
//! processed; nothing here is fatal to the daemon.

use crate::conntrack::{ConntrackError, FlowTable};
use crate::reconciler::EvictionSet;
use crate::types::ConnectionRecord;
use std::sync::Arc;

/// Outcome of one eviction pass
#[derive(Debug, Default)]
pub struct EvictionReport {
    /// Records torn down
    pub succeeded: usize,
    /// Records whose teardown failed, with the reason
    pub failed: Vec<(ConnectionRecord, ConntrackError)>,
}

impl EvictionReport {
    /// Records attempted
    pub fn attempted(&self) -> usize {
        self.succeeded + self.failed.len()
    }
}

/// Issues teardown commands against the flow table
pub struct Executor {
    table: Arc<dyn FlowTable>,
}

impl Executor {
    /// Create an executor over `table`
    pub fn new(table: Arc<dyn FlowTable>) -> Self {
        Self { table }
    }

    /// Tear down every record in `evictions`
    pub async fn evict(&self, evictions: &EvictionSet) -> EvictionReport {
        let mut report = EvictionReport::default();

        for record in evictions {
            match self.table.delete_udp_flow(record).await {
                Ok(()) => {
                    log::info!("Dropped connection {}", record);
                    report.succeeded += 1;
                }
                Err(e) => {
                    log::warn!("Failed to drop connection {}: {}", record, e);
                    report.failed.push((*record, e));
                }
            }
        }

        report
    }
}
