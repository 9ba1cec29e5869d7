// State file writer for external monitoring
//!
//! Writes the enforcement loop's status to a file for consumption by the web
//! panel, the bot and shell scripts.

use crate::enforcer::CycleReport;
use crate::types::SchedulerState;
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use std::time::SystemTime;

/// Loop status at the end of a cycle
#[derive(Debug, Clone)]
pub struct DaemonStatus<'a> {
    /// Scheduler state when the file is written
    pub state: SchedulerState,
    /// Failed cycles since the last success
    pub consecutive_failures: u32,
    /// Unix timestamp and report of the last successful cycle
    pub last_success: Option<&'a (u64, CycleReport)>,
}

/// Current Unix time in seconds
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Render the status as `KEY=VALUE` lines
pub fn render_state(status: &DaemonStatus<'_>, timestamp: u64) -> String {
    let state_str = match (status.state, status.consecutive_failures) {
        (SchedulerState::Running, _) => "running",
        (SchedulerState::Idle, 0) => "idle",
        (SchedulerState::Idle, _) => "backoff",
    };

    let (last_success, report) = match status.last_success {
        Some((at, report)) => (at.to_string(), report.clone()),
        None => (String::new(), CycleReport::default()),
    };

    format!(
        "STATE={}\nTIMESTAMP={}\nLAST_SUCCESS={}\nFLOWS={}\nUSERS={}\nOVER_QUOTA={}\nEVICTED={}\nFAILURES={}\nCONSECUTIVE_FAILURES={}\n",
        state_str,
        timestamp,
        last_success,
        report.flows,
        report.users,
        report.breaches,
        report.evicted,
        report.eviction_failures,
        status.consecutive_failures
    )
}

/// Write current status to the state file
pub fn write_state(path: &Path, status: &DaemonStatus<'_>) -> Result<()> {
    // Create directory if it doesn't exist
    if let Some(state_dir) = path.parent() {
        if !state_dir.as_os_str().is_empty() && !state_dir.exists() {
            fs::create_dir_all(state_dir).context("Failed to create state directory")?;
        }
    }

    // Replace atomically
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, render_state(status, unix_now())).context("Failed to write state file")?;
    fs::rename(&tmp, path).context("Failed to replace state file")?;

    Ok(())
}

/// Remove state file on shutdown
pub fn cleanup(path: &Path) {
    let _ = fs::remove_file(path);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn report() -> CycleReport {
        CycleReport {
            flows: 12,
            users: 5,
            skipped_users: 0,
            breaches: 1,
            evicted: 2,
            eviction_failures: 1,
        }
    }

    #[test]
    fn test_render_idle_with_report() {
        let last = (1_700_000_000, report());
        let status = DaemonStatus {
            state: SchedulerState::Idle,
            consecutive_failures: 0,
            last_success: Some(&last),
        };

        let content = render_state(&status, 1_700_000_010);
        assert_eq!(
            content,
            "STATE=idle\nTIMESTAMP=1700000010\nLAST_SUCCESS=1700000000\nFLOWS=12\nUSERS=5\nOVER_QUOTA=1\nEVICTED=2\nFAILURES=1\nCONSECUTIVE_FAILURES=0\n"
        );
    }

    #[test]
    fn test_render_backoff_without_success() {
        let status = DaemonStatus {
            state: SchedulerState::Idle,
            consecutive_failures: 3,
            last_success: None,
        };

        let content = render_state(&status, 42);
        assert!(content.starts_with("STATE=backoff\n"));
        assert!(content.contains("LAST_SUCCESS=\n"));
        assert!(content.contains("FLOWS=0\n"));
        assert!(content.ends_with("CONSECUTIVE_FAILURES=3\n"));
    }

    #[test]
    fn test_write_and_cleanup() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run").join("state");
        let status = DaemonStatus {
            state: SchedulerState::Idle,
            consecutive_failures: 0,
            last_success: None,
        };

        write_state(&path, &status).unwrap();
        let content = fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("STATE=idle\n"));
        assert!(!path.with_extension("tmp").exists());

        cleanup(&path);
        assert!(!path.exists());

        // Cleanup of a missing file is a no-op
        cleanup(&path);
    }
}
