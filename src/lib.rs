#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

//! # teardown
//!
//! Deferred deletion daemon for virtual desktops.
//!
//! The reconciliation engine lives in `teardown-reconciler`; this crate wires
//! it to a TOML configuration, a JSON queue file and command-line provider
//! tools.

pub use teardown_core;
pub use teardown_reconciler;

pub mod cli;
pub mod commands;
pub mod script;
pub mod settings;
