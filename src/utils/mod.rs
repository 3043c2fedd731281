//! Shared utilities for the bridge: the error types every layer returns and
//! the `tracing` subscriber setup used by the binary and the tests.

pub mod error;
pub mod logging;
