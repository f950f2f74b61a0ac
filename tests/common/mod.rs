//! Shared test utilities for integration and Redis tests.
//!
//! This module provides:
//! - Redis testcontainer setup
//! - A recording CommandHost standing in for a game server
//! - Log capture for asserting on warnings

#![allow(dead_code)]

pub mod containers;
pub mod mock_host;

pub use containers::*;
pub use mock_host::*;
