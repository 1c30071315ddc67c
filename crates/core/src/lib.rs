//! Shared building blocks for the teardown workspace.
//!
//! Typed file and parse errors, small async file helpers used by the config
//! loader and the file-backed record store, and logging combinators for
//! `Result`.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![forbid(clippy::panic)]

pub mod error;
pub mod fs;
pub mod result;

pub use error::Error;
pub use result::{Result, ResultExt};
