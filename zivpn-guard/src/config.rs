// Configuration file parser

//! Configuration file parsing and validation
//!
//! This module handles loading the TOML configuration file, validating its
//! values and resolving the service's fallback port, which may come from the
//! ZIVPN server's own JSON config.

use crate::types::{Config, EnforcerConfig, PortSpace};
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Load configuration from TOML file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let contents = fs::read_to_string(path.as_ref()).context("Failed to read config file")?;

    let config: Config = toml::from_str(&contents).context("Failed to parse config file")?;

    validate_config(&config)?;
    Ok(config)
}

/// Validate configuration values
fn validate_config(config: &Config) -> Result<()> {
    if config.general.database_path.as_os_str().is_empty() {
        anyhow::bail!("database_path cannot be empty");
    }

    if config.conntrack.binary.trim().is_empty() {
        anyhow::bail!("conntrack.binary cannot be empty");
    }

    let ports = &config.ports;
    if ports.fallback == 0 {
        anyhow::bail!("ports.fallback must be > 0");
    }
    if ports.dynamic_start > ports.dynamic_end {
        anyhow::bail!(
            "ports.dynamic_start ({}) must be <= ports.dynamic_end ({})",
            ports.dynamic_start,
            ports.dynamic_end
        );
    }
    // Per-user ports are allocated above the shared listen port
    if ports.dynamic_start <= ports.fallback {
        anyhow::bail!(
            "ports.dynamic_start ({}) must be above ports.fallback ({})",
            ports.dynamic_start,
            ports.fallback
        );
    }

    let schedule = &config.schedule;
    if schedule.poll_interval == 0 {
        anyhow::bail!("schedule.poll_interval must be > 0");
    }
    if schedule.backoff_interval < schedule.poll_interval {
        anyhow::bail!(
            "schedule.backoff_interval ({}s) must be >= schedule.poll_interval ({}s)",
            schedule.backoff_interval,
            schedule.poll_interval
        );
    }

    let conntrack = &config.conntrack;
    for (name, value) in [
        ("scan_timeout", conntrack.scan_timeout),
        ("status_timeout", conntrack.status_timeout),
        ("teardown_timeout", conntrack.teardown_timeout),
    ] {
        if value == 0 {
            anyhow::bail!("conntrack.{} must be > 0", name);
        }
    }

    Ok(())
}

/// Extract the port from a ZIVPN `listen` value such as `":5667"` or
/// `"0.0.0.0:5667"`
pub fn parse_listen_port(listen: &str) -> Option<u16> {
    let (_, port) = listen.trim().rsplit_once(':')?;
    match port.parse::<u16>() {
        Ok(0) | Err(_) => None,
        Ok(port) => Some(port),
    }
}

/// Read the listen port from the ZIVPN server config (JSON)
pub fn read_zivpn_listen_port<P: AsRef<Path>>(path: P) -> Result<u16> {
    let contents =
        fs::read_to_string(path.as_ref()).context("Failed to read ZIVPN config file")?;
    let value: serde_json::Value =
        serde_json::from_str(&contents).context("Failed to parse ZIVPN config file")?;

    let listen = value
        .get("listen")
        .and_then(|v| v.as_str())
        .context("ZIVPN config has no \"listen\" string")?;

    parse_listen_port(listen).with_context(|| format!("Invalid listen address: {:?}", listen))
}

/// Resolve the fallback port: the ZIVPN listen port when available,
/// otherwise the configured value
pub fn resolve_fallback_port(config: &Config) -> u16 {
    let Some(path) = &config.ports.zivpn_config else {
        return config.ports.fallback;
    };

    match read_zivpn_listen_port(path) {
        Ok(port) => {
            log::info!("Fallback port {} read from {:?}", port, path);
            port
        }
        Err(e) => {
            log::warn!(
                "Using configured fallback port {}: {:#}",
                config.ports.fallback,
                e
            );
            config.ports.fallback
        }
    }
}

/// Build the immutable enforcer settings from a validated config
pub fn enforcer_config(config: &Config, fallback_port: u16) -> EnforcerConfig {
    EnforcerConfig {
        port_space: PortSpace {
            fallback: fallback_port,
            dynamic_start: config.ports.dynamic_start,
            dynamic_end: config.ports.dynamic_end,
        },
        scan_timeout: Duration::from_secs(config.conntrack.scan_timeout),
        status_timeout: Duration::from_secs(config.conntrack.status_timeout),
    }
}
