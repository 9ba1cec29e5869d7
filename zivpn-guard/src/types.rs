// Shared types between the reader, reconciler and scheduler

//! Shared data structures
//!
//! This module defines the records that flow through one enforcement cycle
//! (connection records, user quotas), the scheduler state and the
//! configuration structures deserialized from the TOML config file.

use serde::Deserialize;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// One live UDP flow observed in the connection-tracking table.
///
/// Ordering is by source address first, then destination port, which is what
/// gives snapshots and device groups their deterministic iteration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionRecord {
    /// Client address (the device)
    pub source: IpAddr,
    /// Service port the client is talking to
    pub dport: u16,
}

impl ConnectionRecord {
    /// Create a record from its key parts
    pub fn new(source: IpAddr, dport: u16) -> Self {
        Self { source, dport }
    }
}

impl fmt::Display for ConnectionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", SocketAddr::new(self.source, self.dport))
    }
}

/// Device quota for one active user, as read from the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserQuota {
    /// Login name
    pub username: String,
    /// Per-user service port; `None` means the user shares the fallback port
    pub assigned_port: Option<u16>,
    /// Maximum number of distinct source addresses allowed at once
    pub max_devices: u32,
}

impl UserQuota {
    /// Port this user's clients connect to
    pub fn effective_port(&self, fallback_port: u16) -> u16 {
        self.assigned_port.unwrap_or(fallback_port)
    }
}

/// Destination ports owned by the VPN service.
///
/// The fallback (listen) port plus the dynamic range that per-user ports are
/// allocated from. Anything else in the connection table is not ours.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortSpace {
    /// Shared listen port
    pub fallback: u16,
    /// First port of the per-user range (inclusive)
    pub dynamic_start: u16,
    /// Last port of the per-user range (inclusive)
    pub dynamic_end: u16,
}

impl PortSpace {
    /// Whether `port` belongs to the service
    pub fn contains(&self, port: u16) -> bool {
        port == self.fallback || (self.dynamic_start..=self.dynamic_end).contains(&port)
    }
}

/// Immutable settings for one `Enforcer` instance
#[derive(Debug, Clone)]
pub struct EnforcerConfig {
    /// Ports the snapshot is restricted to
    pub port_space: PortSpace,
    /// Timeout for the periodic full table scan
    pub scan_timeout: Duration,
    /// Timeout for on-demand status queries
    pub status_timeout: Duration,
}

/// Poll scheduler states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// Waiting for the next cycle start
    Idle,
    /// A cycle is in flight
    Running,
}

/// Main configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// `[general]` section
    #[serde(default)]
    pub general: GeneralConfig,
    /// `[ports]` section
    #[serde(default)]
    pub ports: PortsConfig,
    /// `[schedule]` section
    #[serde(default)]
    pub schedule: ScheduleConfig,
    /// `[conntrack]` section
    #[serde(default)]
    pub conntrack: ConntrackConfig,
}

/// General configuration options
#[derive(Debug, Deserialize, Clone)]
pub struct GeneralConfig {
    /// SQLite user registry shared with the web panel and bot
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    /// Default `env_logger` filter, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Status file written after every cycle
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
}

/// Service port space
#[derive(Debug, Deserialize, Clone)]
pub struct PortsConfig {
    /// Port used by users without an assigned port
    #[serde(default = "default_fallback_port")]
    pub fallback: u16,
    /// First per-user port
    #[serde(default = "default_dynamic_start")]
    pub dynamic_start: u16,
    /// Last per-user port
    #[serde(default = "default_dynamic_end")]
    pub dynamic_end: u16,
    /// ZIVPN server config; its `listen` port overrides `fallback` when present
    #[serde(default)]
    pub zivpn_config: Option<PathBuf>,
}

/// Poll cadence (all values in seconds)
#[derive(Debug, Deserialize, Clone)]
pub struct ScheduleConfig {
    /// Delay between cycle starts
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,
    /// Delay after a failed cycle
    #[serde(default = "default_backoff_interval")]
    pub backoff_interval: u64,
    /// Time an in-flight cycle gets to finish on shutdown
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace: u64,
}

/// conntrack adapter settings (timeouts in seconds)
#[derive(Debug, Deserialize, Clone)]
pub struct ConntrackConfig {
    /// Path or name of the conntrack tool
    #[serde(default = "default_conntrack_binary")]
    pub binary: String,
    /// Full table listing during a cycle
    #[serde(default = "default_scan_timeout")]
    pub scan_timeout: u64,
    /// Table listing for status queries
    #[serde(default = "default_status_timeout")]
    pub status_timeout: u64,
    /// One flow deletion
    #[serde(default = "default_teardown_timeout")]
    pub teardown_timeout: u64,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            log_level: default_log_level(),
            state_file: default_state_file(),
        }
    }
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            fallback: default_fallback_port(),
            dynamic_start: default_dynamic_start(),
            dynamic_end: default_dynamic_end(),
            zivpn_config: None,
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            backoff_interval: default_backoff_interval(),
            shutdown_grace: default_shutdown_grace(),
        }
    }
}

impl Default for ConntrackConfig {
    fn default() -> Self {
        Self {
            binary: default_conntrack_binary(),
            scan_timeout: default_scan_timeout(),
            status_timeout: default_status_timeout(),
            teardown_timeout: default_teardown_timeout(),
        }
    }
}

// Default values for configuration
fn default_database_path() -> PathBuf {
    PathBuf::from("/etc/zivpn/zivpn.db")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_state_file() -> PathBuf {
    PathBuf::from("/run/zivpn-guard/state")
}

fn default_fallback_port() -> u16 {
    5667
}

fn default_dynamic_start() -> u16 {
    6000
}

fn default_dynamic_end() -> u16 {
    65535
}

fn default_poll_interval() -> u64 {
    10
}

fn default_backoff_interval() -> u64 {
    30
}

fn default_shutdown_grace() -> u64 {
    15
}

fn default_conntrack_binary() -> String {
    "conntrack".to_string()
}

fn default_scan_timeout() -> u64 {
    30
}

fn default_status_timeout() -> u64 {
    3
}

fn default_teardown_timeout() -> u64 {
    5
}
