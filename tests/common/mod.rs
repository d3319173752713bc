//! Shared test utilities for integration and property tests.
//!
//! This module provides:
//! - Redis testcontainer setup
//! - Fake replication / source-database collaborators
//! - A recording dirtier and polling helpers

pub mod containers;
pub mod mocks;

#[allow(unused_imports)]
pub use containers::*;
#[allow(unused_imports)]
pub use mocks::*;
