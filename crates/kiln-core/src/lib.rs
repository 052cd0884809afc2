//! Kiln Core
//!
//! Shared utilities for the Kiln runtime crates: fast hash collections,
//! deterministic content hashing, logging setup and profiling scopes.

pub mod alloc;
pub mod hash;
pub mod logging;
pub mod profiling;
