// Poll scheduler for the enforcement cycle

//! Poll scheduling
//!
//! [`Scheduler`] is the `Idle → Running → Idle` state machine that picks the
//! delay before the next cycle: the nominal poll interval after a successful
//! cycle, the longer backoff interval after a failed one. [`run`] drives an
//! [`Enforcer`] with it until the shutdown signal fires.

use crate::enforcer::{CycleReport, Enforcer};
use crate::state_file::{self, DaemonStatus};
use crate::types::SchedulerState;
use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinError;
use tokio::time::Instant;

/// Scheduler state machine
pub struct Scheduler {
    state: SchedulerState,
    poll_interval: Duration,
    backoff_interval: Duration,
    consecutive_failures: u32,
}

impl Scheduler {
    /// Create a new scheduler
    pub fn new(poll_interval: Duration, backoff_interval: Duration) -> Self {
        Self {
            state: SchedulerState::Idle,
            poll_interval,
            backoff_interval,
            consecutive_failures: 0,
        }
    }

    /// Enter `Running`. Returns false if a cycle is already in flight.
    pub fn begin_cycle(&mut self) -> bool {
        match self.state {
            SchedulerState::Idle => {
                self.state = SchedulerState::Running;
                true
            }
            SchedulerState::Running => {
                log::debug!("Cycle already running, not starting another");
                false
            }
        }
    }

    /// Return to `Idle` and get the delay between this cycle's start and the next
    pub fn finish_cycle(&mut self, succeeded: bool) -> Duration {
        if self.state != SchedulerState::Running {
            log::debug!("finish_cycle called while {:?}", self.state);
        }
        self.state = SchedulerState::Idle;

        if succeeded {
            if self.consecutive_failures > 0 {
                log::info!(
                    "Cycle succeeded after {} failure(s), back to {}s interval",
                    self.consecutive_failures,
                    self.poll_interval.as_secs()
                );
            }
            self.consecutive_failures = 0;
            self.poll_interval
        } else {
            self.consecutive_failures += 1;
            self.backoff_interval
        }
    }

    /// Get current state
    pub fn state(&self) -> SchedulerState {
        self.state
    }

    /// Failed cycles since the last success
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}

/// Settings for the background loop
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    /// Delay between cycle starts
    pub poll_interval: Duration,
    /// Delay after a failed cycle
    pub backoff_interval: Duration,
    /// How long an in-flight cycle may run on after shutdown is requested
    pub shutdown_grace: Duration,
    /// Status file rewritten after every cycle
    pub state_file: Option<PathBuf>,
}

/// Resolve once the shutdown flag is set or its sender is gone
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Log a finished cycle task and return its report if it succeeded
fn cycle_outcome(joined: Result<Result<CycleReport>, JoinError>) -> Option<CycleReport> {
    match joined {
        Ok(Ok(report)) => Some(report),
        Ok(Err(e)) => {
            log::error!("Enforcement cycle failed: {:#}", e);
            None
        }
        Err(e) => {
            log::error!("Enforcement cycle panicked: {}", e);
            None
        }
    }
}

fn write_status(
    settings: &SchedulerSettings,
    scheduler: &Scheduler,
    last_success: Option<&(u64, CycleReport)>,
) {
    let Some(path) = &settings.state_file else {
        return;
    };

    let status = DaemonStatus {
        state: scheduler.state(),
        consecutive_failures: scheduler.consecutive_failures(),
        last_success,
    };
    if let Err(e) = state_file::write_state(path, &status) {
        log::warn!("Failed to write state file: {:#}", e);
    }
}

/// Run enforcement cycles until `shutdown` fires.
///
/// Each cycle runs in its own task so a panic is contained to that cycle.
/// Cycles never overlap: the next start is `delay` after the previous start,
/// or immediately if the previous cycle overran.
pub async fn run(
    enforcer: Arc<Enforcer>,
    settings: SchedulerSettings,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut scheduler = Scheduler::new(settings.poll_interval, settings.backoff_interval);
    let mut last_success: Option<(u64, CycleReport)> = None;

    log::info!(
        "Enforcement loop started (interval {}s, backoff {}s)",
        settings.poll_interval.as_secs(),
        settings.backoff_interval.as_secs()
    );
    write_status(&settings, &scheduler, None);

    loop {
        if *shutdown.borrow() {
            break;
        }

        let started = Instant::now();
        if !scheduler.begin_cycle() {
            log::error!("Scheduler refused to start a cycle, stopping the enforcement loop");
            break;
        }
        write_status(&settings, &scheduler, last_success.as_ref());

        let mut cycle = tokio::spawn({
            let enforcer = enforcer.clone();
            async move { enforcer.run_cycle().await }
        });

        let joined = tokio::select! {
            joined = &mut cycle => joined,
            _ = wait_for_shutdown(&mut shutdown) => {
                log::info!(
                    "Shutdown requested, letting the running cycle finish (up to {}s)",
                    settings.shutdown_grace.as_secs()
                );
                let outcome = match tokio::time::timeout(settings.shutdown_grace, &mut cycle).await {
                    Ok(joined) => cycle_outcome(joined),
                    Err(_) => {
                        log::warn!("Cycle did not finish within the grace period, abandoning it");
                        cycle.abort();
                        None
                    }
                };
                scheduler.finish_cycle(outcome.is_some());
                break;
            }
        };

        let report = cycle_outcome(joined);
        let succeeded = report.is_some();
        if let Some(report) = report {
            last_success = Some((state_file::unix_now(), report));
        }

        let delay = scheduler.finish_cycle(succeeded);
        write_status(&settings, &scheduler, last_success.as_ref());

        if !succeeded {
            log::warn!(
                "Backing off for {}s ({} consecutive failure(s))",
                delay.as_secs(),
                scheduler.consecutive_failures()
            );
        }

        tokio::select! {
            _ = tokio::time::sleep_until(started + delay) => {}
            _ = wait_for_shutdown(&mut shutdown) => break,
        }
    }

    log::info!("Enforcement loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conntrack::{ConntrackError, FlowTable, MockFlowTable};
    use crate::registry::MockRegistry;
    use crate::types::{ConnectionRecord, EnforcerConfig, PortSpace};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    const POLL: Duration = Duration::from_secs(10);
    const BACKOFF: Duration = Duration::from_secs(30);

    /// Flow table whose listing takes `delay`
    struct SlowTable {
        delay: Duration,
    }

    #[async_trait::async_trait]
    impl FlowTable for SlowTable {
        async fn list_udp_flows(
            &self,
            _timeout: Duration,
        ) -> Result<Vec<ConnectionRecord>, ConntrackError> {
            tokio::time::sleep(self.delay).await;
            Ok(vec![])
        }

        async fn delete_udp_flow(&self, _record: &ConnectionRecord) -> Result<(), ConntrackError> {
            Ok(())
        }
    }

    /// Flow table that panics on its first listing
    #[derive(Default)]
    struct PanicOnceTable {
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl FlowTable for PanicOnceTable {
        async fn list_udp_flows(
            &self,
            _timeout: Duration,
        ) -> Result<Vec<ConnectionRecord>, ConntrackError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("unexpected conntrack output");
            }
            Ok(vec![])
        }

        async fn delete_udp_flow(&self, _record: &ConnectionRecord) -> Result<(), ConntrackError> {
            Ok(())
        }
    }

    fn counting_registry(calls: &Arc<AtomicUsize>) -> MockRegistry {
        let mut registry = MockRegistry::new();
        registry.expect_list_active_quotas().returning({
            let calls = calls.clone();
            move || {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(vec![])
            }
        });
        registry
    }

    fn enforcer(registry: MockRegistry) -> Arc<Enforcer> {
        let mut table = MockFlowTable::new();
        table.expect_list_udp_flows().returning(|_| Ok(vec![]));
        enforcer_with(Arc::new(table), registry)
    }

    fn enforcer_with(table: Arc<dyn FlowTable>, registry: MockRegistry) -> Arc<Enforcer> {
        let config = EnforcerConfig {
            port_space: PortSpace {
                fallback: 5667,
                dynamic_start: 6000,
                dynamic_end: 65535,
            },
            scan_timeout: Duration::from_secs(30),
            status_timeout: Duration::from_secs(3),
        };
        Arc::new(Enforcer::new(config, table, Arc::new(registry)))
    }

    fn settings() -> SchedulerSettings {
        SchedulerSettings {
            poll_interval: POLL,
            backoff_interval: BACKOFF,
            shutdown_grace: Duration::from_secs(15),
            state_file: None,
        }
    }

    #[test]
    fn test_initial_state() {
        let scheduler = Scheduler::new(POLL, BACKOFF);
        assert_eq!(scheduler.state(), SchedulerState::Idle);
        assert_eq!(scheduler.consecutive_failures(), 0);
    }

    #[test]
    fn test_begin_cycle_only_once() {
        let mut scheduler = Scheduler::new(POLL, BACKOFF);

        assert!(scheduler.begin_cycle());
        assert_eq!(scheduler.state(), SchedulerState::Running);

        // Second start while running is refused
        assert!(!scheduler.begin_cycle());
        assert_eq!(scheduler.state(), SchedulerState::Running);
    }

    #[test]
    fn test_success_uses_poll_interval() {
        let mut scheduler = Scheduler::new(POLL, BACKOFF);
        scheduler.begin_cycle();

        assert_eq!(scheduler.finish_cycle(true), POLL);
        assert_eq!(scheduler.state(), SchedulerState::Idle);
    }

    #[test]
    fn test_failure_backs_off_then_recovers() {
        let mut scheduler = Scheduler::new(POLL, BACKOFF);

        scheduler.begin_cycle();
        assert_eq!(scheduler.finish_cycle(false), BACKOFF);
        assert_eq!(scheduler.consecutive_failures(), 1);

        scheduler.begin_cycle();
        assert_eq!(scheduler.finish_cycle(false), BACKOFF);
        assert_eq!(scheduler.consecutive_failures(), 2);

        scheduler.begin_cycle();
        assert_eq!(scheduler.finish_cycle(true), POLL);
        assert_eq!(scheduler.consecutive_failures(), 0);
    }

    #[test]
    fn test_cycle_outcome() {
        assert!(cycle_outcome(Ok(Ok(CycleReport::default()))).is_some());
        assert!(cycle_outcome(Ok(Err(anyhow::anyhow!("registry down")))).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_polls_on_interval() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = MockRegistry::new();
        registry.expect_list_active_quotas().returning({
            let calls = calls.clone();
            move || {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(vec![])
            }
        });

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(run(enforcer(registry), settings(), rx));

        // Cycles at t=0, 10, 20
        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_backs_off_after_failure() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = MockRegistry::new();
        registry.expect_list_active_quotas().returning({
            let calls = calls.clone();
            move || {
                // First cycle fails, later ones succeed
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(anyhow::anyhow!("unable to open database file"))
                } else {
                    Ok(vec![])
                }
            }
        });

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(run(enforcer(registry), settings(), rx));

        // Failure at t=0, nothing until t=30
        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Retry at t=30, then back to the 10s cadence (t=40)
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_backs_off_after_panic() {
        let table = Arc::new(PanicOnceTable::default());
        let mut registry = MockRegistry::new();
        registry.expect_list_active_quotas().returning(|| Ok(vec![]));

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(run(enforcer_with(table.clone(), registry), settings(), rx));

        // Panic at t=0, nothing until t=30
        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(table.calls.load(Ordering::SeqCst), 1);

        // Retry at t=30, then t=40
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(table.calls.load(Ordering::SeqCst), 3);

        tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_lets_running_cycle_finish() {
        let completed = Arc::new(AtomicUsize::new(0));
        let table = Arc::new(SlowTable {
            delay: Duration::from_secs(5),
        });

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(run(
            enforcer_with(table, counting_registry(&completed)),
            settings(),
            rx,
        ));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(completed.load(Ordering::SeqCst), 0);
        let requested = Instant::now();
        tx.send(true).unwrap();

        handle.await.unwrap();
        assert_eq!(completed.load(Ordering::SeqCst), 1);
        // Stopped when the cycle ended (t=5), not at the end of the grace period
        assert!(requested.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_abandons_cycle_after_grace() {
        let completed = Arc::new(AtomicUsize::new(0));
        let table = Arc::new(SlowTable {
            delay: Duration::from_secs(100),
        });

        let start = Instant::now();
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(run(
            enforcer_with(table, counting_registry(&completed)),
            settings(),
            rx,
        ));

        tokio::time::sleep(Duration::from_secs(1)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        // Shutdown at t=1 plus the 15s grace period
        let stopped = start.elapsed();
        assert!(stopped >= Duration::from_secs(16));
        assert!(stopped < Duration::from_secs(17));
        assert_eq!(completed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_file_follows_cycle() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state");
        let completed = Arc::new(AtomicUsize::new(0));
        let table = Arc::new(SlowTable {
            delay: Duration::from_secs(5),
        });
        let settings = SchedulerSettings {
            state_file: Some(path.clone()),
            ..settings()
        };

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(run(
            enforcer_with(table, counting_registry(&completed)),
            settings,
            rx,
        ));

        tokio::time::sleep(Duration::from_secs(1)).await;
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("STATE=running\n"));
        assert!(content.contains("LAST_SUCCESS=\n"));

        // Cycle ends at t=5
        tokio::time::sleep(Duration::from_secs(5)).await;
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("STATE=idle\n"));
        assert!(!content.contains("LAST_SUCCESS=\n"));

        tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_shutdown_while_idle() {
        let mut registry = MockRegistry::new();
        registry.expect_list_active_quotas().returning(|| Ok(vec![]));

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(run(enforcer(registry), settings(), rx));

        tokio::time::sleep(Duration::from_secs(1)).await;
        tx.send(true).unwrap();

        // Returns well before the next 10s tick
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("loop should stop promptly")
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_when_sender_dropped() {
        let mut registry = MockRegistry::new();
        registry.expect_list_active_quotas().returning(|| Ok(vec![]));

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(run(enforcer(registry), settings(), rx));
        drop(tx);

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("loop should stop when the signal source is gone")
            .unwrap();
    }
}
