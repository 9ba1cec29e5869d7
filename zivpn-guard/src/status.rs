// On-demand status queries for the panel and bot

//! Status surface
//!
//! Answers "is anyone connected on this port" and derives the per-user
//! Online/Offline/Expired/Suspended label the admin panel shows. Uses the
//! same reader (and so the same filtering and deduplication) as the
//! enforcement cycle, but with the shorter status timeout. Any query failure
//! reads as Offline.

use crate::conntrack::{ConnectionReader, FlowTable, Snapshot};
use crate::registry::{Registry, UserRecord};
use crate::types::EnforcerConfig;
use anyhow::{Context, Result};
use chrono::NaiveDate;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Label shown for a user on the status surfaces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserStatus {
    /// At least one flow on the user's port
    Online,
    /// No flows on the user's port
    Offline,
    /// Past the expiry date
    Expired,
    /// Suspended by an admin
    Suspended,
}

impl fmt::Display for UserStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            UserStatus::Online => "Online",
            UserStatus::Offline => "Offline",
            UserStatus::Expired => "Expired",
            UserStatus::Suspended => "Suspended",
        };
        f.write_str(label)
    }
}

/// Parse a registry expiry date (`YYYY-MM-DD`)
pub fn parse_expiry(expires: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(expires.trim(), "%Y-%m-%d").ok()
}

/// Derive a user's status label from their record and a connection snapshot.
///
/// Suspension wins over expiry, expiry over connectivity. An unparseable
/// expiry date counts as no expiry.
pub fn user_status(
    record: &UserRecord,
    fallback_port: u16,
    today: NaiveDate,
    snapshot: &Snapshot,
) -> UserStatus {
    if record.status.eq_ignore_ascii_case("suspended") {
        return UserStatus::Suspended;
    }

    let expired = record
        .expires
        .as_deref()
        .and_then(parse_expiry)
        .is_some_and(|date| date < today);
    if expired {
        return UserStatus::Expired;
    }

    let port = record.assigned_port().unwrap_or(fallback_port);
    if snapshot.has_port(port) {
        UserStatus::Online
    } else {
        UserStatus::Offline
    }
}

/// Read-only status queries
pub struct StatusSurface {
    reader: ConnectionReader,
    registry: Arc<dyn Registry>,
    timeout: Duration,
}

impl StatusSurface {
    /// Create a status surface sharing the enforcer's port space and timeouts
    pub fn new(
        config: &EnforcerConfig,
        table: Arc<dyn FlowTable>,
        registry: Arc<dyn Registry>,
    ) -> Self {
        Self {
            reader: ConnectionReader::new(table, config.port_space),
            registry,
            timeout: config.status_timeout,
        }
    }

    /// Whether any flow currently targets `port`.
    ///
    /// Returns false for unparseable ports and when the table can't be read.
    pub async fn is_port_active(&self, port: &str) -> bool {
        let Ok(port) = port.trim().parse::<u16>() else {
            log::debug!("Port {:?} is not a valid port number", port);
            return false;
        };

        self.reader.snapshot(self.timeout).await.has_port(port)
    }

    /// Status of every registry user, from a single snapshot
    pub async fn user_statuses(&self, today: NaiveDate) -> Result<Vec<(UserRecord, UserStatus)>> {
        let users = self
            .registry
            .list_users()
            .await
            .context("Failed to load users")?;
        let snapshot = self.reader.snapshot(self.timeout).await;
        let fallback_port = self.reader.port_space().fallback;

        Ok(users
            .into_iter()
            .map(|user| {
                let status = user_status(&user, fallback_port, today, &snapshot);
                (user, status)
            })
            .collect())
    }
}
