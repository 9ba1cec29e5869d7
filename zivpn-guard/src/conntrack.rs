// Connection-tracking table reader and conntrack(8) adapter

//! Connection-tracking table access
//!
//! This module reads live UDP flows from the kernel's connection-tracking
//! table and tears individual flows down again. Kernel access goes through
//! the [`FlowTable`] trait; [`ConntrackCli`] implements it by running the
//! `conntrack` tool. [`ConnectionReader`] turns the raw flow list into a
//! filtered, deduplicated [`Snapshot`] of the service's port space.

use crate::types::{ConnectionRecord, PortSpace};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::net::IpAddr;
use std::process::Output;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;

/// Errors from a single conntrack invocation
#[derive(Debug, Error)]
pub enum ConntrackError {
    /// The command could not be started (missing binary, permissions)
    #[error("failed to execute `{command}`: {source}")]
    Spawn {
        /// Command line as run
        command: String,
        /// Underlying spawn error
        #[source]
        source: std::io::Error,
    },
    /// The command did not finish in time and was killed
    #[error("`{command}` timed out after {timeout:?}")]
    Timeout {
        /// Command line as run
        command: String,
        /// Limit that was exceeded
        timeout: Duration,
    },
    /// The command ran but reported failure
    #[error("`{command}` failed with {status}: {stderr}")]
    CommandFailed {
        /// Command line as run
        command: String,
        /// Exit status as reported by the OS
        status: String,
        /// Trimmed standard error output
        stderr: String,
    },
}

/// Kernel flow table operations used by the enforcer
///
/// Implementations return every UDP flow they can see; port filtering and
/// deduplication happen in [`ConnectionReader`].
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FlowTable: Send + Sync {
    /// List UDP flows of both address families as `(source, destination port)` records
    async fn list_udp_flows(&self, timeout: Duration)
        -> Result<Vec<ConnectionRecord>, ConntrackError>;

    /// Delete every UDP flow matching exactly `record`'s source and port
    async fn delete_udp_flow(&self, record: &ConnectionRecord) -> Result<(), ConntrackError>;
}

/// Parse one line of `conntrack -L` output.
///
/// A line carries the original-direction tuple first and the reply tuple
/// second, so the first `src=` and the first `dport=` are the client address
/// and the service port. Returns `None` when either is missing or malformed.
pub fn parse_flow_line(line: &str) -> Option<ConnectionRecord> {
    let mut source: Option<&str> = None;
    let mut dport: Option<&str> = None;

    for token in line.split_whitespace() {
        if source.is_none() {
            if let Some(value) = token.strip_prefix("src=") {
                source = Some(value);
            }
        }
        if dport.is_none() {
            if let Some(value) = token.strip_prefix("dport=") {
                dport = Some(value);
            }
        }
        if source.is_some() && dport.is_some() {
            break;
        }
    }

    let source: IpAddr = source?.parse().ok()?;
    let dport: u16 = dport?.parse().ok()?;
    Some(ConnectionRecord::new(source, dport))
}

/// Parse full `conntrack -L` output, skipping lines that don't describe a flow
pub fn parse_flow_table(output: &str) -> Vec<ConnectionRecord> {
    output.lines().filter_map(parse_flow_line).collect()
}

/// [`FlowTable`] backed by the `conntrack` command line tool
pub struct ConntrackCli {
    binary: String,
    teardown_timeout: Duration,
}

impl ConntrackCli {
    /// Create an adapter running `binary` (usually `conntrack`)
    pub fn new(binary: impl Into<String>, teardown_timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            teardown_timeout,
        }
    }

    /// Run conntrack with `args`, killing it if it outlives `timeout`
    async fn run(&self, args: &[&str], timeout: Duration) -> Result<Output, ConntrackError> {
        let command = format!("{} {}", self.binary, args.join(" "));

        let child = Command::new(&self.binary)
            .args(args)
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(timeout, child).await {
            Ok(result) => result.map_err(|source| ConntrackError::Spawn {
                command: command.clone(),
                source,
            })?,
            Err(_) => return Err(ConntrackError::Timeout { command, timeout }),
        };

        if !output.status.success() {
            return Err(ConntrackError::CommandFailed {
                command,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(output)
    }
}

#[async_trait]
impl FlowTable for ConntrackCli {
    async fn list_udp_flows(
        &self,
        timeout: Duration,
    ) -> Result<Vec<ConnectionRecord>, ConntrackError> {
        let (ipv4, ipv6) = tokio::join!(
            self.run(&["-L", "-p", "udp"], timeout),
            self.run(&["-L", "-f", "ipv6", "-p", "udp"], timeout),
        );

        let mut flows = parse_flow_table(&String::from_utf8_lossy(&ipv4?.stdout));

        // Hosts without IPv6 conntrack support still get IPv4 enforcement
        match ipv6 {
            Ok(output) => flows.extend(parse_flow_table(&String::from_utf8_lossy(&output.stdout))),
            Err(e) => log::debug!("Skipping IPv6 flows: {}", e),
        }

        Ok(flows)
    }

    async fn delete_udp_flow(&self, record: &ConnectionRecord) -> Result<(), ConntrackError> {
        let dport = record.dport.to_string();
        let source = record.source.to_string();

        let mut args = Vec::with_capacity(8);
        if record.source.is_ipv6() {
            args.extend(["-f", "ipv6"]);
        }
        args.extend(["-D", "-p", "udp", "--dport", dport.as_str(), "--src", source.as_str()]);

        self.run(&args, self.teardown_timeout).await?;
        Ok(())
    }
}

/// Deduplicated set of service flows seen at one point in time
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    records: BTreeSet<ConnectionRecord>,
}

impl Snapshot {
    /// Build a snapshot from raw flows, keeping only ports in `port_space`
    pub fn filtered<I>(records: I, port_space: &PortSpace) -> Self
    where
        I: IntoIterator<Item = ConnectionRecord>,
    {
        records
            .into_iter()
            .filter(|record| port_space.contains(record.dport))
            .collect()
    }

    /// Number of distinct `(source, port)` records
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether no flows were seen (or the table could not be read)
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// All records in `(source, port)` order
    pub fn iter(&self) -> impl Iterator<Item = &ConnectionRecord> {
        self.records.iter()
    }

    /// Records whose destination is `port`
    pub fn on_port(&self, port: u16) -> impl Iterator<Item = &ConnectionRecord> {
        self.records.iter().filter(move |record| record.dport == port)
    }

    /// Whether any flow targets `port`
    pub fn has_port(&self, port: u16) -> bool {
        self.on_port(port).next().is_some()
    }

    /// Whether `record` is part of the snapshot
    pub fn contains(&self, record: &ConnectionRecord) -> bool {
        self.records.contains(record)
    }

    /// Snapshot with `removed` records taken out
    pub fn without<'a, I>(&self, removed: I) -> Snapshot
    where
        I: IntoIterator<Item = &'a ConnectionRecord>,
    {
        let mut records = self.records.clone();
        for record in removed {
            records.remove(record);
        }
        Snapshot { records }
    }
}

impl FromIterator<ConnectionRecord> for Snapshot {
    fn from_iter<T: IntoIterator<Item = ConnectionRecord>>(iter: T) -> Self {
        Self {
            records: iter.into_iter().collect(),
        }
    }
}

/// Reads snapshots of the service's port space from a [`FlowTable`]
pub struct ConnectionReader {
    table: Arc<dyn FlowTable>,
    port_space: PortSpace,
}

impl ConnectionReader {
    /// Create a reader over `table` restricted to `port_space`
    pub fn new(table: Arc<dyn FlowTable>, port_space: PortSpace) -> Self {
        Self { table, port_space }
    }

    /// Port space this reader filters to
    pub fn port_space(&self) -> &PortSpace {
        &self.port_space
    }

    /// Take a snapshot, reporting query failures
    pub async fn try_snapshot(&self, timeout: Duration) -> Result<Snapshot, ConntrackError> {
        let flows = self.table.list_udp_flows(timeout).await?;
        let raw = flows.len();
        let snapshot = Snapshot::filtered(flows, &self.port_space);

        log::debug!(
            "Connection table: {} UDP flows, {} service records",
            raw,
            snapshot.len()
        );
        Ok(snapshot)
    }

    /// Take a snapshot, degrading to an empty one when the table can't be read.
    ///
    /// An empty result means "no visibility", never "no connections".
    pub async fn snapshot(&self, timeout: Duration) -> Snapshot {
        match self.try_snapshot(timeout).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                log::warn!("Failed to read connection table: {}", e);
                Snapshot::default()
            }
        }
    }
}
