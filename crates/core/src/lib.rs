//! Core types shared by the fleet controllers.
//!
//! Provides the common error type and the configuration loading helpers that
//! every controller binary uses to read its settings.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod config;
pub mod error;

pub use config::{env_override, load_toml, parse_toml};
pub use error::{Error, Result};
