//! # Configuration Modules
//!
//! Configuration for the connectivity core is sourced from the process
//! environment once, at start-up. The typed configs themselves live next to
//! the components they configure (`DbConfig`, `PubSubConfig`); this module
//! only provides the readers they are built with.

/// Typed, defaulting readers over environment variables.
pub mod env;

pub use env::EnvReader;
