// Read-only gateway into the user registry

//! User registry access
//!
//! The web panel and the bot own the SQLite user database; the daemon only
//! reads it. [`Registry`] is the seam the enforcer depends on and
//! [`SqliteRegistry`] is the production implementation.
//!
//! SQLite columns are dynamically typed and the panel writes ports and limits
//! as whatever the form submitted, so rows come back loosely typed
//! ([`QuotaRow`]) and are validated per user with [`QuotaRow::to_quota`].

use crate::types::UserQuota;
use anyhow::{Context, Result};
use async_trait::async_trait;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags, Row};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// How long to wait on a database locked by a panel write
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Active, unexpired users. An empty `expires` means no expiry.
///
/// Expiry dates are compared with the local date, the same clock the status
/// surface uses.
const ACTIVE_QUOTAS_SQL: &str = "
    SELECT username, port, concurrent_conn
    FROM users
    WHERE status = 'active'
      AND (expires IS NULL OR expires = '' OR expires >= date('now', 'localtime'))
    ORDER BY username";

const ALL_USERS_SQL: &str = "
    SELECT username, status, expires, port
    FROM users
    ORDER BY username";

/// Why one user's quota row could not be used
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QuotaError {
    /// Row has no username
    #[error("username is empty")]
    MissingUsername,
    /// Port column is not a usable port number
    #[error("invalid port {0:?}")]
    InvalidPort(String),
    /// `concurrent_conn` is NULL or empty
    #[error("device limit is not set")]
    MissingDeviceLimit,
    /// `concurrent_conn` is not a non-negative integer
    #[error("invalid device limit {0:?}")]
    InvalidDeviceLimit(String),
}

/// Raw quota columns of one active user
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QuotaRow {
    /// Login name
    pub username: String,
    /// Assigned port as stored
    pub port: Option<String>,
    /// Device limit as stored
    pub concurrent_conn: Option<String>,
}

impl QuotaRow {
    /// Validate the row into a [`UserQuota`]
    pub fn to_quota(&self) -> Result<UserQuota, QuotaError> {
        if self.username.is_empty() {
            return Err(QuotaError::MissingUsername);
        }

        Ok(UserQuota {
            username: self.username.clone(),
            assigned_port: parse_port(self.port.as_deref())?,
            max_devices: parse_device_limit(self.concurrent_conn.as_deref())?,
        })
    }
}

/// Registry row as shown on the status surfaces
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserRecord {
    /// Login name
    pub username: String,
    /// `active`, `suspended`, ...
    pub status: String,
    /// Expiry date as `YYYY-MM-DD`
    pub expires: Option<String>,
    /// Assigned port as stored
    pub port: Option<String>,
}

impl UserRecord {
    /// Assigned port, if set and valid
    pub fn assigned_port(&self) -> Option<u16> {
        parse_port(self.port.as_deref()).ok().flatten()
    }
}

/// Empty or missing means "use the fallback port"
fn parse_port(value: Option<&str>) -> Result<Option<u16>, QuotaError> {
    match value.map(str::trim) {
        None | Some("") => Ok(None),
        Some(raw) => match raw.parse::<u16>() {
            Ok(0) | Err(_) => Err(QuotaError::InvalidPort(raw.to_string())),
            Ok(port) => Ok(Some(port)),
        },
    }
}

fn parse_device_limit(value: Option<&str>) -> Result<u32, QuotaError> {
    match value.map(str::trim) {
        None | Some("") => Err(QuotaError::MissingDeviceLimit),
        Some(raw) => raw
            .parse::<u32>()
            .map_err(|_| QuotaError::InvalidDeviceLimit(raw.to_string())),
    }
}

/// Read access to the user registry
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Registry: Send + Sync {
    /// Active, unexpired users with their port and device limit
    async fn list_active_quotas(&self) -> Result<Vec<QuotaRow>>;

    /// Every user, regardless of status
    async fn list_users(&self) -> Result<Vec<UserRecord>>;
}

/// [`Registry`] backed by the panel's SQLite database
pub struct SqliteRegistry {
    path: PathBuf,
}

impl SqliteRegistry {
    /// Create a registry reading the database at `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn open(path: &Path) -> Result<Connection> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("Failed to open user database {:?}", path))?;
        conn.busy_timeout(BUSY_TIMEOUT)
            .context("Failed to set database busy timeout")?;
        Ok(conn)
    }

    /// Run `sql` on a blocking thread, mapping each row with `map`
    async fn query<T, F>(&self, sql: &'static str, map: F) -> Result<Vec<T>>
    where
        T: Send + 'static,
        F: Fn(&Row<'_>) -> rusqlite::Result<T> + Send + 'static,
    {
        let path = self.path.clone();

        tokio::task::spawn_blocking(move || {
            let conn = Self::open(&path)?;
            let mut stmt = conn.prepare(sql).context("Failed to prepare user query")?;
            let rows = stmt
                .query_map([], |row| map(row))
                .context("Failed to query users")?
                .collect::<rusqlite::Result<Vec<T>>>()
                .context("Failed to read user rows")?;
            Ok::<Vec<T>, anyhow::Error>(rows)
        })
        .await
        .context("Registry query task panicked")?
    }
}

#[async_trait]
impl Registry for SqliteRegistry {
    async fn list_active_quotas(&self) -> Result<Vec<QuotaRow>> {
        self.query(ACTIVE_QUOTAS_SQL, |row| {
            Ok(QuotaRow {
                username: column_text(row, 0)?.unwrap_or_default(),
                port: column_text(row, 1)?,
                concurrent_conn: column_text(row, 2)?,
            })
        })
        .await
    }

    async fn list_users(&self) -> Result<Vec<UserRecord>> {
        self.query(ALL_USERS_SQL, |row| {
            Ok(UserRecord {
                username: column_text(row, 0)?.unwrap_or_default(),
                status: column_text(row, 1)?.unwrap_or_default(),
                expires: column_text(row, 2)?.filter(|s| !s.is_empty()),
                port: column_text(row, 3)?,
            })
        })
        .await
    }
}

/// Read any column type as trimmed text; NULL becomes `None`
fn column_text(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<String>> {
    let text = match row.get_ref(idx)? {
        ValueRef::Null => None,
        ValueRef::Integer(i) => Some(i.to_string()),
        ValueRef::Real(f) if f.fract() == 0.0 => Some(format!("{}", f as i64)),
        ValueRef::Real(f) => Some(f.to_string()),
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
            Some(String::from_utf8_lossy(bytes).trim().to_string())
        }
    };
    Ok(text)
}
