// ZIVPN Connection Guard Library
// Shared modules for daemon and tests

#![warn(missing_docs)]

//! ZIVPN Connection Guard Library
//!
//! This library enforces per-user concurrent device limits on a ZIVPN UDP
//! server. It periodically reads the kernel connection-tracking table,
//! compares each user's distinct source addresses against the device limit
//! stored in the panel's user registry, and tears down the flows of devices
//! over the limit.
//!
//! # Main Components
//!
//! - [`config`]: Configuration file parsing and validation
//! - [`conntrack`]: Connection-table access and per-cycle snapshots
//! - [`registry`]: Read-only access to the user registry database
//! - [`reconciler`]: Pure quota reconciliation (who gets evicted)
//! - [`executor`]: Flow teardown
//! - [`enforcer`]: One read-reconcile-evict cycle
//! - [`scheduler`]: Poll loop with failure backoff
//! - [`status`]: Port and user status queries
//! - [`state_file`]: Status file for external monitoring
//! - [`types`]: Shared data structures

pub mod config;
pub mod conntrack;
pub mod enforcer;
pub mod executor;
pub mod reconciler;
pub mod registry;
pub mod scheduler;
pub mod state_file;
pub mod status;
pub mod types;
