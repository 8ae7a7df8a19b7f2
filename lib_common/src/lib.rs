//! # lib_common
//!
//! The connectivity core shared by the API server and the event workers.
//! Every folder is a cargo feature so that binaries only compile the
//! drivers they actually use:
//!
//! - `configs`: environment-sourced configuration readers.
//! - `connections`: retrying connection manager, PostgreSQL pool, Redis handle.
//! - `messaging`: topic/subscription provisioning, publishers and subscribers.
//! - `loggers`: `tracing` subscriber setup with optional rolling files.

#[cfg(feature = "configs")]
pub mod configs;

#[cfg(feature = "connections")]
pub mod connections;

#[cfg(feature = "messaging")]
pub mod messaging;

#[cfg(feature = "loggers")]
pub mod loggers;
