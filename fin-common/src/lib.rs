//! Shared foundation for the Fin alerts stack.
//!
//! Provides configuration loading, the common error type, and logging
//! initialization used by the service crates.

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod config;
pub mod error;
pub mod logging;

pub use config::Config;
pub use error::{Error, Result};
